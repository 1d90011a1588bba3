mod common;

use common::{admin, allocated, attrs, engine, engine_with};
use prefixd::config::EngineConfig;
use prefixd::db::{PoolAttrs, PoolRef, PrefixAttrs, PrefixRef, PrefixType, VrfAttrs, VrfRef};
use prefixd::ipam::{FindFree, ListSpec, RemoveOptions};
use prefixd::{ErrorKind, Family, HostBits, IpamError};
use tempfile::TempDir;

fn cidrs(prefixes: &[prefixd::db::Prefix]) -> Vec<String> {
    prefixes.iter().map(|p| p.prefix.to_string()).collect()
}

#[tokio::test]
async fn test_indent_scenario() {
    let dir = TempDir::new().unwrap();
    let ipam = engine(&dir).await;
    let p = admin();

    let inserts = [
        ("192.168.0.0/16", 0),
        ("192.168.0.0/20", 1),
        ("192.168.0.0/24", 2),
        ("192.168.1.0/24", 2),
        ("192.168.2.0/24", 2),
        ("192.168.32.0/20", 1),
        ("192.168.32.0/24", 2),
    ];
    for (cidr, indent) in inserts {
        let added = ipam
            .add_prefix(&p, None, attrs(cidr, PrefixType::Reservation), None)
            .await
            .unwrap();
        assert_eq!(added.indent, indent, "{cidr}");
    }

    let listed = ipam.list_prefix(&p, &ListSpec::new()).await.unwrap();
    let indents: Vec<(String, u32)> = listed.iter().map(|p| (p.prefix.to_string(), p.indent)).collect();
    assert_eq!(
        indents,
        vec![
            ("192.168.0.0/16".to_string(), 0),
            ("192.168.0.0/20".to_string(), 1),
            ("192.168.0.0/24".to_string(), 2),
            ("192.168.1.0/24".to_string(), 2),
            ("192.168.2.0/24".to_string(), 2),
            ("192.168.32.0/20".to_string(), 1),
            ("192.168.32.0/24".to_string(), 2),
        ]
    );
    assert_eq!(listed[0].children, 2);
}

#[tokio::test]
async fn test_insert_between_shifts_subtree() {
    let dir = TempDir::new().unwrap();
    let ipam = engine(&dir).await;
    let p = admin();

    for cidr in ["10.0.0.0/8", "10.1.1.0/24", "10.1.1.0/28"] {
        ipam.add_prefix(&p, None, attrs(cidr, PrefixType::Reservation), None)
            .await
            .unwrap();
    }
    let middle = ipam
        .add_prefix(&p, None, attrs("10.1.0.0/16", PrefixType::Reservation), None)
        .await
        .unwrap();
    assert_eq!(middle.indent, 1);

    let listed = ipam.list_prefix(&p, &ListSpec::new()).await.unwrap();
    let indents: Vec<u32> = listed.iter().map(|p| p.indent).collect();
    assert_eq!(indents, vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn test_host_allocation_lowest_first() {
    let dir = TempDir::new().unwrap();
    let ipam = engine(&dir).await;
    let p = admin();

    let mut got = Vec::new();
    for _ in 0..4 {
        let added = ipam
            .add_prefix(
                &p,
                None,
                allocated(PrefixType::Host, "lease"),
                Some(FindFree::from_prefixes(["1.3.3.0/24"], 32)),
            )
            .await
            .unwrap();
        got.push(added.prefix.to_string());
    }
    assert_eq!(got, vec!["1.3.3.0/32", "1.3.3.1/32", "1.3.3.2/32", "1.3.3.3/32"]);
}

#[tokio::test]
async fn test_find_free_results_are_free_and_distinct() {
    let dir = TempDir::new().unwrap();
    let ipam = engine(&dir).await;
    let p = admin();

    ipam.add_prefix(&p, None, attrs("10.0.0.0/16", PrefixType::Reservation), None)
        .await
        .unwrap();
    for cidr in ["10.0.0.0/24", "10.0.2.0/23", "10.0.5.0/24"] {
        ipam.add_prefix(&p, None, attrs(cidr, PrefixType::Assignment), None)
            .await
            .unwrap();
    }

    let spec = FindFree::from_prefixes(["10.0.0.0/16"], 24).with_count(4);
    let free = ipam.find_free_prefix(&p, None, &spec).await.unwrap();
    let free: Vec<String> = free.iter().map(|c| c.to_string()).collect();
    assert_eq!(free, vec!["10.0.1.0/24", "10.0.4.0/24", "10.0.6.0/24", "10.0.7.0/24"]);
}

#[tokio::test]
async fn test_hosts_skip_network_and_broadcast() {
    let dir = TempDir::new().unwrap();
    let ipam = engine(&dir).await;
    let p = admin();

    ipam.add_prefix(&p, None, attrs("192.0.2.0/29", PrefixType::Assignment), None)
        .await
        .unwrap();
    let spec = FindFree::from_prefixes(["192.0.2.0/29"], 32).with_count(10);
    let free = ipam.find_free_prefix(&p, None, &spec).await.unwrap();
    assert_eq!(free.len(), 6);
    assert_eq!(free[0].to_string(), "192.0.2.1/32");
    assert_eq!(free[5].to_string(), "192.0.2.6/32");

    let host = ipam
        .add_prefix(&p, None, allocated(PrefixType::Host, "server"), Some(FindFree::from_prefixes(["192.0.2.0/29"], 32)))
        .await
        .unwrap();
    assert_eq!(host.prefix.to_string(), "192.0.2.1/32");
    assert_eq!(host.display_prefix, "192.0.2.1/29");
    assert_eq!(host.indent, 1);
}

#[tokio::test]
async fn test_exhausted_source() {
    let dir = TempDir::new().unwrap();
    let ipam = engine(&dir).await;
    let p = admin();

    ipam.add_prefix(&p, None, attrs("10.9.0.0/24", PrefixType::Reservation), None)
        .await
        .unwrap();
    let spec = FindFree::from_prefixes(["10.9.0.0/24"], 24);
    assert!(ipam.find_free_prefix(&p, None, &spec).await.unwrap().is_empty());

    let err = ipam
        .add_prefix(&p, None, allocated(PrefixType::Reservation, "x"), Some(spec))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
}

#[tokio::test]
async fn test_add_validation() {
    let dir = TempDir::new().unwrap();
    let ipam = engine(&dir).await;
    let p = admin();

    ipam.add_prefix(&p, None, attrs("10.0.0.0/24", PrefixType::Assignment), None)
        .await
        .unwrap();

    let dup = ipam
        .add_prefix(&p, None, attrs("10.0.0.0/24", PrefixType::Assignment), None)
        .await
        .unwrap_err();
    assert!(matches!(dup, IpamError::Duplicate { .. }));

    // only hosts inside an assignment
    let nested = ipam
        .add_prefix(&p, None, attrs("10.0.0.0/25", PrefixType::Reservation), None)
        .await
        .unwrap_err();
    assert_eq!(nested.kind(), ErrorKind::Constraint);

    let bare = PrefixAttrs {
        prefix: Some("10.5.0.0/16".into()),
        prefix_type: Some(PrefixType::Reservation),
        ..Default::default()
    };
    let missing = ipam.add_prefix(&p, None, bare, None).await.unwrap_err();
    assert!(matches!(missing, IpamError::MissingInput(_)));

    let both = ipam
        .add_prefix(
            &p,
            None,
            attrs("10.6.0.0/16", PrefixType::Reservation),
            Some(FindFree::from_prefixes(["10.0.0.0/8"], 16)),
        )
        .await
        .unwrap_err();
    assert!(matches!(both, IpamError::ExtraneousInput(_)));

    let readonly = admin().with_readonly(true);
    let denied = ipam
        .add_prefix(&readonly, None, attrs("10.7.0.0/16", PrefixType::Reservation), None)
        .await
        .unwrap_err();
    assert_eq!(denied.kind(), ErrorKind::Authorization);
}

#[tokio::test]
async fn test_removal_guard() {
    let dir = TempDir::new().unwrap();
    let ipam = engine(&dir).await;
    let p = admin();

    for (cidr, kind) in [
        ("10.0.0.0/8", PrefixType::Reservation),
        ("10.1.0.0/16", PrefixType::Reservation),
        ("10.1.1.0/24", PrefixType::Assignment),
        ("10.1.1.7/32", PrefixType::Host),
        ("10.2.0.0/16", PrefixType::Reservation),
    ] {
        ipam.add_prefix(&p, None, attrs(cidr, kind), None).await.unwrap();
    }
    let before = cidrs(&ipam.list_prefix(&p, &ListSpec::new()).await.unwrap());

    let target = || PrefixRef::Prefix("10.1.0.0/16".into());

    let err = ipam
        .remove_prefix(&p, None, target(), RemoveOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Constraint);

    // hosts below need an explicit override
    let err = ipam
        .remove_prefix(&p, None, target(), RemoveOptions::recursive())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Constraint);
    assert_eq!(cidrs(&ipam.list_prefix(&p, &ListSpec::new()).await.unwrap()), before);

    let removed = ipam
        .remove_prefix(&p, None, target(), RemoveOptions::recursive().with_hosts())
        .await
        .unwrap();
    assert_eq!(cidrs(&removed), vec!["10.1.1.7/32", "10.1.1.0/24", "10.1.0.0/16"]);
    assert_eq!(
        cidrs(&ipam.list_prefix(&p, &ListSpec::new()).await.unwrap()),
        vec!["10.0.0.0/8", "10.2.0.0/16"]
    );

    // a leaf needs no flags
    ipam.remove_prefix(&p, None, PrefixRef::Prefix("10.2.0.0/16".into()), RemoveOptions::default())
        .await
        .unwrap();
    let missing = ipam
        .remove_prefix(&p, None, PrefixRef::Prefix("10.2.0.0/16".into()), RemoveOptions::default())
        .await
        .unwrap_err();
    assert_eq!(missing.kind(), ErrorKind::NonExistent);
}

#[tokio::test]
async fn test_edit_rechecks_type() {
    let dir = TempDir::new().unwrap();
    let ipam = engine(&dir).await;
    let p = admin();

    ipam.add_prefix(&p, None, attrs("10.0.0.0/24", PrefixType::Assignment), None)
        .await
        .unwrap();
    ipam.add_prefix(&p, None, attrs("10.0.0.9/32", PrefixType::Host), None)
        .await
        .unwrap();

    let to_reservation = PrefixAttrs {
        prefix_type: Some(PrefixType::Reservation),
        ..Default::default()
    };
    let err = ipam
        .edit_prefix(&p, None, PrefixRef::Prefix("10.0.0.0/24".into()), to_reservation)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Constraint);

    let moved = PrefixAttrs {
        prefix: Some("10.0.1.0/24".into()),
        ..Default::default()
    };
    let err = ipam
        .edit_prefix(&p, None, PrefixRef::Prefix("10.0.0.0/24".into()), moved)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Input);

    let described = PrefixAttrs {
        description: Some(Some("core link".into())),
        vlan: Some(Some(120)),
        ..Default::default()
    };
    let edited = ipam
        .edit_prefix(&p, None, PrefixRef::Prefix("10.0.0.0/24".into()), described)
        .await
        .unwrap();
    assert_eq!(edited.description.as_deref(), Some("core link"));
    assert_eq!(edited.vlan, Some(120));
    assert_eq!(edited.children, 1);
}

#[tokio::test]
async fn test_non_canonical_rejected_by_default() {
    let dir = TempDir::new().unwrap();
    let ipam = engine(&dir).await;
    let p = admin();

    let err = ipam
        .add_prefix(&p, None, attrs("10.1.2.3/16", PrefixType::Reservation), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Input);
    assert!(err.to_string().contains("10.1.0.0/16"), "{err}");

    // shortened forms are canonical once expanded
    let added = ipam
        .add_prefix(&p, None, attrs("10.1/16", PrefixType::Reservation), None)
        .await
        .unwrap();
    assert_eq!(added.prefix.to_string(), "10.1.0.0/16");
}

#[tokio::test]
async fn test_non_canonical_masked_when_configured() {
    let dir = TempDir::new().unwrap();
    let config = EngineConfig {
        non_canonical: HostBits::Mask,
        ..Default::default()
    };
    let ipam = engine_with(&dir, config).await;
    let p = admin();

    let added = ipam
        .add_prefix(&p, None, attrs("10.1.2.3/16", PrefixType::Reservation), None)
        .await
        .unwrap();
    assert_eq!(added.prefix.to_string(), "10.1.0.0/16");

    let dup = ipam
        .add_prefix(&p, None, attrs("10.1.255.255/16", PrefixType::Reservation), None)
        .await
        .unwrap_err();
    assert!(matches!(dup, IpamError::Duplicate { .. }));

    let listed = ipam.list_prefix(&p, &ListSpec::new()).await.unwrap();
    assert_eq!(cidrs(&listed), vec!["10.1.0.0/16"]);
}

#[tokio::test]
async fn test_pool_allocation() {
    let dir = TempDir::new().unwrap();
    let ipam = engine(&dir).await;
    let p = admin();

    let vrf = ipam
        .add_vrf(
            &p,
            VrfAttrs {
                rt: Some(Some("65000:100".into())),
                name: Some("customers".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let pool = ipam
        .add_pool(
            &p,
            PoolAttrs {
                name: Some("links".into()),
                default_type: Some(Some(PrefixType::Assignment)),
                ipv4_default_prefix_length: Some(Some(30)),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let mut member = attrs("172.16.0.0/28", PrefixType::Reservation);
    member.pool_id = Some(Some(pool.id));
    ipam.add_prefix(&p, Some(VrfRef::Id(vrf.id)), member, None)
        .await
        .unwrap();

    // no VRF given: the pool's members decide
    let spec = FindFree::from_pool(PoolRef::Name("links".into()), Family::V4);
    let link_attrs = PrefixAttrs {
        description: Some(Some("uplink".into())),
        ..Default::default()
    };
    let link = ipam
        .add_prefix(&p, None, link_attrs, Some(spec))
        .await
        .unwrap();
    assert_eq!(link.prefix.to_string(), "172.16.0.0/30");
    assert_eq!(link.vrf_id, vrf.id);
    assert_eq!(link.prefix_type, PrefixType::Assignment);
    assert_eq!(link.pool_id, Some(pool.id));
    assert_eq!(link.vrf_rt.as_deref(), Some("65000:100"));

    let view = &ipam.list_pool(&p, &ListSpec::new()).await.unwrap()[0];
    assert_eq!(view.vrf_id, Some(vrf.id));
    assert_eq!(view.prefixes.len(), 1);
    assert_eq!(view.total_addresses_v4, 16);
    assert_eq!(view.used_addresses_v4, 4);

    // removing the pool keeps its prefixes
    ipam.remove_pool(&p, PoolRef::Id(pool.id)).await.unwrap();
    let left = ipam.list_prefix(&p, &ListSpec::new()).await.unwrap();
    assert_eq!(left.len(), 2);
    assert!(left.iter().all(|p| p.pool_id.is_none()));
}

#[tokio::test]
async fn test_vrf_lifecycle() {
    let dir = TempDir::new().unwrap();
    let ipam = engine(&dir).await;
    let p = admin();

    let blue = VrfAttrs {
        rt: Some(Some("65000:1".into())),
        name: Some("blue".into()),
        ..Default::default()
    };
    let vrf = ipam.add_vrf(&p, blue.clone()).await.unwrap();
    assert!(matches!(
        ipam.add_vrf(&p, blue).await.unwrap_err(),
        IpamError::Duplicate { .. }
    ));
    let bad_rt = VrfAttrs {
        rt: Some(Some("blue".into())),
        name: Some("green".into()),
        ..Default::default()
    };
    assert!(ipam.add_vrf(&p, bad_rt).await.is_err());

    // the same prefix may live in two VRFs
    let in_blue = ipam
        .add_prefix(&p, Some(VrfRef::Rt("65000:1".into())), attrs("10.0.0.0/8", PrefixType::Reservation), None)
        .await
        .unwrap();
    ipam.add_prefix(&p, None, attrs("10.0.0.0/8", PrefixType::Reservation), None)
        .await
        .unwrap();
    assert_eq!(in_blue.vrf_id, vrf.id);

    let busy = ipam.remove_vrf(&p, VrfRef::Id(vrf.id)).await.unwrap_err();
    assert_eq!(busy.kind(), ErrorKind::Constraint);
    assert_eq!(
        ipam.remove_vrf(&p, VrfRef::default()).await.unwrap_err().kind(),
        ErrorKind::Constraint
    );

    let views = ipam.list_vrf(&p, &ListSpec::new()).await.unwrap();
    let blue_view = views.iter().find(|v| v.id == vrf.id).unwrap();
    assert_eq!(blue_view.num_prefixes_v4, 1);
    assert_eq!(blue_view.total_addresses_v4, 1 << 24);

    ipam.remove_prefix(&p, Some(VrfRef::Id(vrf.id)), PrefixRef::Id(in_blue.id), RemoveOptions::default())
        .await
        .unwrap();
    ipam.remove_vrf(&p, VrfRef::Name("blue".into())).await.unwrap();
    assert_eq!(ipam.list_vrf(&p, &ListSpec::new()).await.unwrap().len(), 1);
}
