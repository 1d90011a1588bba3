mod common;

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use common::{admin, allocated, attrs, engine, engine_with};
use prefixd::config::EngineConfig;
use prefixd::db::{AuditFilter, PoolAttrs, PrefixRef, PrefixType};
use prefixd::ipam::{FindFree, ListSpec, RemoveOptions};
use prefixd::{Cidr, ErrorKind, HostBits, IpamError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_timeouts_leave_store_and_memory_in_step() {
    let dir = TempDir::new().unwrap();
    let p = admin();
    let config = EngineConfig {
        operation_timeout_ms: 1,
        conflict_retries: 0,
        retry_backoff_ms: 1,
        ..Default::default()
    };

    engine(&dir)
        .await
        .add_prefix(&p, None, attrs("10.30.0.0/24", PrefixType::Reservation), None)
        .await
        .unwrap();

    let (won, in_memory, last_seq) = {
        let ipam = engine_with(&dir, config).await;

        // all in one VRF, so most callers queue on its lock
        let mut tasks = Vec::new();
        for i in 0..48 {
            let ipam = ipam.clone();
            let p = p.clone();
            tasks.push(tokio::spawn(async move {
                ipam.add_prefix(
                    &p,
                    None,
                    allocated(PrefixType::Reservation, &format!("caller {i}")),
                    Some(FindFree::from_prefixes(["10.30.0.0/24"], 32)),
                )
                .await
            }));
        }

        let mut won = BTreeSet::new();
        for t in tasks {
            match t.await.unwrap() {
                Ok(prefix) => assert!(won.insert(prefix.prefix.to_string())),
                Err(e) => assert!(
                    matches!(e.kind(), ErrorKind::Timeout | ErrorKind::Conflict),
                    "unexpected {e}"
                ),
            }
        }

        let listed = ipam.list_prefix(&p, &ListSpec::new()).await.unwrap();
        let in_memory: BTreeSet<String> = listed.iter().map(|p| p.prefix.to_string()).collect();

        // every caller that got an answer is in memory, and nothing else is
        let mut expected = won.clone();
        expected.insert("10.30.0.0/24".to_string());
        assert_eq!(in_memory, expected);

        let changes = ipam.poll_changes("check", 1000).await.unwrap();
        assert_eq!(changes.len(), in_memory.len());
        let last_seq = ipam.store().last_change_seq().await.unwrap();
        assert_eq!(*ipam.subscribe().borrow(), last_seq);
        (won, in_memory, last_seq)
    };

    let ipam = engine(&dir).await;
    let listed = ipam.list_prefix(&p, &ListSpec::new()).await.unwrap();
    let on_disk: BTreeSet<String> = listed.iter().map(|p| p.prefix.to_string()).collect();
    assert_eq!(on_disk, in_memory);
    assert_eq!(on_disk.len(), won.len() + 1);
    assert_eq!(*ipam.subscribe().borrow(), last_seq);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_duplicate_pool_names_commit_once() {
    let dir = TempDir::new().unwrap();
    let ipam = engine(&dir).await;
    let p = admin();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let ipam = ipam.clone();
        let p = p.clone();
        tasks.push(tokio::spawn(async move {
            ipam.add_pool(
                &p,
                PoolAttrs {
                    name: Some("shared".to_string()),
                    ..Default::default()
                },
            )
            .await
        }));
    }

    let mut added = 0;
    for t in tasks {
        match t.await.unwrap() {
            Ok(_) => added += 1,
            Err(e) => assert!(matches!(e, IpamError::Duplicate { .. }), "unexpected {e}"),
        }
    }
    assert_eq!(added, 1);

    // the losers rolled back without a trace
    assert_eq!(ipam.list_pool(&p, &ListSpec::new()).await.unwrap().len(), 1);
    let audit = ipam.list_audit(&p, &AuditFilter::default()).await.unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(ipam.poll_changes("check", 100).await.unwrap().len(), 1);
}

fn random_block(rng: &mut StdRng) -> Cidr {
    let addr = Ipv4Addr::from(0x0a00_0000 | rng.gen_range(0..=0xffffu32));
    let len = rng.gen_range(16..=24u8);
    Cidr::parse(&format!("{addr}/{len}"), HostBits::Mask).unwrap()
}

#[tokio::test]
async fn test_random_adds_and_removes_keep_the_hierarchy() {
    let dir = TempDir::new().unwrap();
    let ipam = engine(&dir).await;
    let p = admin();
    let mut rng = StdRng::seed_from_u64(0x1f_2e_3d);
    let mut model: BTreeSet<Cidr> = BTreeSet::new();

    for step in 0..200 {
        if !model.is_empty() && rng.gen_bool(0.3) {
            let pick = rng.gen_range(0..model.len());
            let target = *model.iter().nth(pick).unwrap();
            let removed = ipam
                .remove_prefix(
                    &p,
                    None,
                    PrefixRef::Prefix(target.to_string()),
                    RemoveOptions::recursive(),
                )
                .await
                .unwrap();
            let before = model.len();
            model.retain(|c| !target.contains(c));
            assert_eq!(removed.len(), before - model.len(), "step {step}");
        } else {
            let block = random_block(&mut rng);
            let result = ipam
                .add_prefix(&p, None, attrs(&block.to_string(), PrefixType::Reservation), None)
                .await;
            if model.insert(block) {
                result.unwrap();
            } else {
                assert!(matches!(result, Err(IpamError::Duplicate { .. })), "step {step}");
            }
        }

        let listed = ipam.list_prefix(&p, &ListSpec::new()).await.unwrap();
        let got: Vec<Cidr> = listed.iter().map(|p| p.prefix).collect();
        assert_eq!(got, model.iter().copied().collect::<Vec<_>>(), "step {step}");
        for prefix in &listed {
            let depth = model.iter().filter(|c| c.contains_strict(&prefix.prefix)).count();
            assert_eq!(prefix.indent as usize, depth, "step {step}: {}", prefix.prefix);
        }
        for pair in got.windows(2) {
            assert!(
                pair[0].contains(&pair[1]) || !pair[0].overlaps(&pair[1]),
                "step {step}: {} and {} overlap",
                pair[0],
                pair[1]
            );
        }
    }
}
