//! Segment rotation: with a tiny segment limit, repeated puts overflow the
//! current segment, which is flushed to its backup group and replaced by a
//! successor with an extended digest and a freshly enlisted group.

mod common;

use std::collections::BTreeSet;

use ember_store::key2shard;

#[tokio::test(flavor = "multi_thread")]
async fn overflow_rotates_and_reenlists() {
    // Op overhead is 25 bytes; each put below is ~44 bytes, so a 256-byte
    // segment holds five of them.
    let cluster = common::spawn_cluster("rotation", 5, 256).await;
    common::wait_for_view_number(&cluster.view_addr, 1).await;
    let mut clerk = cluster.clerk();

    let key = "rotate-me";
    for i in 0..12 {
        clerk.put(key, &format!("value-{i:04}")).await;
    }

    let view = clerk.view().await.expect("view");
    let primary = view
        .primary_for(key2shard(key))
        .expect("key has a primary")
        .clone();
    let idx = cluster.server_index(&primary).expect("primary is a member");
    let snap = cluster.servers[idx].server.snapshot().await;

    // Twelve ~44-byte puts into 256-byte segments: at least one rotation.
    assert!(
        snap.segment_ids.len() >= 2,
        "expected rotation, log has segments {:?}",
        snap.segment_ids
    );
    assert_eq!(snap.segment_ids, (1..=snap.current_segment).collect::<Vec<i64>>());

    // The current digest lists every ancestor in order.
    let expected_digest: Vec<i64> = (1..snap.current_segment).collect();
    assert_eq!(snap.current_digest, expected_digest);

    // Only the current segment keeps a backup group, and it is full.
    assert_eq!(
        snap.backup_groups.keys().copied().collect::<Vec<i64>>(),
        vec![snap.current_segment]
    );
    assert_eq!(snap.backup_groups[&snap.current_segment].len(), 3);

    // Every segment was enlisted on some backup: the union of the peers'
    // backed-up sets covers the whole log.
    let mut backed: BTreeSet<i64> = BTreeSet::new();
    for handle in &cluster.servers {
        let peer = handle.server.snapshot().await;
        if let Some(ids) = peer.backed_up.get(&primary) {
            backed.extend(ids.iter().copied());
        }
    }
    assert_eq!(
        backed,
        snap.segment_ids.iter().copied().collect::<BTreeSet<i64>>()
    );

    // The store resolves to the last write.
    assert_eq!(
        common::get_with_deadline(&mut clerk, key).await,
        "value-0011"
    );

    cluster.cleanup();
}
