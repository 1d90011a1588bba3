mod common;

use common::{admin, allocated, attrs, engine};
use prefixd::db::{AuditFilter, ChangeAction, EntityKind, PrefixAttrs, PrefixRef, PrefixType};
use prefixd::ipam::{FindFree, ListSpec, RemoveOptions};
use prefixd::{ErrorKind, IpamError};
use tempfile::TempDir;

#[tokio::test]
async fn test_state_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let p = admin();

    let first_id = {
        let ipam = engine(&dir).await;
        for cidr in ["10.0.0.0/8", "10.1.0.0/16", "10.1.2.0/24"] {
            ipam.add_prefix(&p, None, attrs(cidr, PrefixType::Reservation), None)
                .await
                .unwrap();
        }
        let mut tagged = attrs("10.2.0.0/16", PrefixType::Reservation);
        tagged.tags = Some(["lab".to_string()].into());
        ipam.add_prefix(&p, None, tagged, None).await.unwrap().id
    };

    let ipam = engine(&dir).await;
    let listed = ipam.list_prefix(&p, &ListSpec::new()).await.unwrap();
    let tree: Vec<(String, u32)> = listed.iter().map(|p| (p.prefix.to_string(), p.indent)).collect();
    assert_eq!(
        tree,
        vec![
            ("10.0.0.0/8".to_string(), 0),
            ("10.1.0.0/16".to_string(), 1),
            ("10.1.2.0/24".to_string(), 2),
            ("10.2.0.0/16".to_string(), 1),
        ]
    );
    assert!(listed[3].tags.contains("lab"));
    assert_eq!(listed[0].children, 2);

    // ids keep counting from where they were
    let next = ipam
        .add_prefix(&p, None, allocated(PrefixType::Reservation, "next"), Some(FindFree::from_prefixes(["10.0.0.0/8"], 16)))
        .await
        .unwrap();
    assert!(next.id > first_id);
    assert_eq!(next.prefix.to_string(), "10.0.0.0/16");
}

#[tokio::test]
async fn test_audit_records_every_mutation() {
    let dir = TempDir::new().unwrap();
    let ipam = engine(&dir).await;
    let p = admin();

    let added = ipam
        .add_prefix(&p, None, attrs("192.0.2.0/24", PrefixType::Assignment), None)
        .await
        .unwrap();
    let edit = PrefixAttrs {
        node: Some(Some("rtr1".into())),
        ..Default::default()
    };
    ipam.edit_prefix(&p, None, PrefixRef::Id(added.id), edit)
        .await
        .unwrap();
    ipam.remove_prefix(&p, None, PrefixRef::Id(added.id), RemoveOptions::default())
        .await
        .unwrap();

    let filter = AuditFilter {
        prefix_id: Some(added.id),
        ..Default::default()
    };
    let entries = ipam.list_audit(&p, &filter).await.unwrap();
    assert_eq!(entries.len(), 3);
    assert!(entries.iter().all(|e| e.username == "admin"));
    assert!(entries.iter().all(|e| e.prefix_prefix.as_deref() == Some("192.0.2.0/24")));
    let descriptions: Vec<&str> = entries.iter().map(|e| e.description.as_str()).collect();
    assert!(descriptions.iter().any(|d| d.starts_with("Added prefix 192.0.2.0/24")));
    assert!(descriptions.iter().any(|d| d.starts_with("Edited prefix 192.0.2.0/24")));
    assert!(descriptions.iter().any(|d| *d == "Removed prefix 192.0.2.0/24"));
}

#[tokio::test]
async fn test_failed_mutation_leaves_no_trace() {
    let dir = TempDir::new().unwrap();
    let ipam = engine(&dir).await;
    let p = admin();

    ipam.add_prefix(&p, None, attrs("10.0.0.0/24", PrefixType::Assignment), None)
        .await
        .unwrap();
    let before = ipam.poll_changes("watcher", 100).await.unwrap().len();

    let err = ipam
        .add_prefix(&p, None, attrs("10.0.0.0/25", PrefixType::Assignment), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Constraint);
    assert_eq!(ipam.poll_changes("watcher", 100).await.unwrap().len(), before);

    let audit = ipam.list_audit(&p, &AuditFilter::default()).await.unwrap();
    assert_eq!(audit.len(), 1);
}

#[tokio::test]
async fn test_change_feed_poll_and_ack() {
    let dir = TempDir::new().unwrap();
    let ipam = engine(&dir).await;
    let p = admin();
    let mut updates = ipam.subscribe();
    let start = *updates.borrow_and_update();

    let added = ipam
        .add_prefix(&p, None, attrs("10.0.0.0/16", PrefixType::Reservation), None)
        .await
        .unwrap();
    updates.changed().await.unwrap();
    assert!(*updates.borrow_and_update() > start);

    let edit = PrefixAttrs {
        description: Some(Some("renamed".into())),
        ..Default::default()
    };
    ipam.edit_prefix(&p, None, PrefixRef::Id(added.id), edit)
        .await
        .unwrap();

    let changes = ipam.poll_changes("sync", 100).await.unwrap();
    assert_eq!(changes.len(), 2);
    assert!(changes.windows(2).all(|w| w[0].seq < w[1].seq));
    assert_eq!(changes[0].entity, EntityKind::Prefix);
    assert_eq!(changes[0].entity_id, added.id);
    assert_eq!(changes[0].action, ChangeAction::Add);
    assert!(changes[0].before.is_none());
    assert_eq!(changes[1].action, ChangeAction::Edit);
    assert_eq!(changes[1].after.as_ref().unwrap()["description"], "renamed");

    // polling alone does not move the cursor
    assert_eq!(ipam.poll_changes("sync", 100).await.unwrap().len(), 2);

    ipam.ack_changes("sync", changes[0].seq).await.unwrap();
    let rest = ipam.poll_changes("sync", 100).await.unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].seq, changes[1].seq);

    // going back is a no-op, going past the end is refused
    ipam.ack_changes("sync", start).await.unwrap();
    assert_eq!(ipam.poll_changes("sync", 100).await.unwrap().len(), 1);
    let err = ipam.ack_changes("sync", changes[1].seq + 10).await.unwrap_err();
    assert!(matches!(err, IpamError::InvalidValue { .. }));

    // other consumers have their own cursor
    assert_eq!(ipam.poll_changes("other", 1).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_cursor_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let p = admin();

    let acked = {
        let ipam = engine(&dir).await;
        for cidr in ["10.0.0.0/8", "11.0.0.0/8"] {
            ipam.add_prefix(&p, None, attrs(cidr, PrefixType::Reservation), None)
                .await
                .unwrap();
        }
        let changes = ipam.poll_changes("sync", 100).await.unwrap();
        ipam.ack_changes("sync", changes[0].seq).await.unwrap();
        changes[0].seq
    };

    let ipam = engine(&dir).await;
    let rest = ipam.poll_changes("sync", 100).await.unwrap();
    assert_eq!(rest.len(), 1);
    assert!(rest[0].seq > acked);
    assert!(*ipam.subscribe().borrow() >= rest[0].seq);
}
