//! Recovery master protocol.
//!
//! Given `shard -> segment -> candidate backups` for a set of lost shards,
//! the elected master builds balanced query plans, pulls segments from
//! surviving backups, and replays puts ordered by `(segment-id, op-index)`
//! through its own write path. Completed shards are reported to the view
//! service, which remaps them to this master.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use futures_util::stream::{FuturesUnordered, StreamExt};

use crate::proto::{
    PullSegmentsByShardsArgs, Reply, Request, SegmentRef, ShardSources,
};
use crate::segment::{OpKind, Segment};
use crate::server::StoreServer;
use crate::{rpc, PING_INTERVAL};

pub(crate) async fn run(server: Arc<StoreServer>, mut data: HashMap<u32, ShardSources>) {
    let mut recovered: HashSet<SegmentRef> = HashSet::new();
    let mut keys_to_puts: HashMap<String, (i64, usize)> = HashMap::new();
    let mut shard_bytes: HashMap<u32, u64> = HashMap::new();

    loop {
        let (plan, lost) = build_query_plan(&mut data);
        for shard in lost {
            // Every copy of some segment of this shard is gone. Whatever
            // was replayed from its other segments is all that survives;
            // report it so the shard gets an owner again.
            tracing::warn!(shard, "shard has unrecoverable segments");
            report_completed(&server, shard, shard_bytes.get(&shard).copied().unwrap_or(0))
                .await;
        }
        if data.is_empty() {
            break;
        }
        if plan.is_empty() {
            // Candidates exist for nothing we still need; cannot make
            // progress.
            tracing::warn!(shards = data.len(), "recovery stalled with shards remaining");
            break;
        }

        let shards: Vec<u32> = data.keys().copied().collect();
        let mut pulls: FuturesUnordered<_> = plan
            .into_iter()
            .map(|(host, segments)| {
                let args = PullSegmentsByShardsArgs {
                    segments: segments.into_iter().collect(),
                    shards: shards.clone(),
                };
                async move {
                    let res = rpc::call(&host, &Request::PullSegmentsByShards(args)).await;
                    (host, res)
                }
            })
            .collect();

        while let Some((host, res)) = pulls.next().await {
            match res {
                Ok(Reply::PullSegments(reply)) => {
                    for pulled in reply.segments {
                        let sref = SegmentRef {
                            origin: pulled.origin,
                            id: pulled.segment.id,
                        };
                        if recovered.insert(sref.clone()) {
                            replay_segment(&server, &pulled.segment, &mut keys_to_puts).await;
                        }
                        let completed = prune_segment(
                            &mut data,
                            &sref,
                            pulled.segment.size_bytes as u64,
                            &mut shard_bytes,
                        );
                        for shard in completed {
                            report_completed(
                                &server,
                                shard,
                                shard_bytes.get(&shard).copied().unwrap_or(0),
                            )
                            .await;
                        }
                    }
                }
                Ok(other) => {
                    tracing::warn!(backup = %host, reply = ?other, "unexpected pull reply");
                    drop_candidate(&mut data, &host);
                }
                Err(err) => {
                    // Treat the queried server as failed for the rest of
                    // this recovery.
                    tracing::warn!(backup = %host, error = ?err, "segment pull failed");
                    drop_candidate(&mut data, &host);
                }
            }
        }
    }

    tracing::info!(
        segments = recovered.len(),
        keys = keys_to_puts.len(),
        "recovery master finished"
    );
}

/// Greedy balanced plan: each needed segment goes to the candidate with the
/// smallest plan so far, and that candidate is removed from the segment's
/// list so a retry tries a different server. Segments with no candidates
/// left are declared lost; shards whose segment set empties that way are
/// returned as lost.
pub(crate) fn build_query_plan(
    data: &mut HashMap<u32, ShardSources>,
) -> (HashMap<String, BTreeSet<SegmentRef>>, Vec<u32>) {
    let mut plan: HashMap<String, BTreeSet<SegmentRef>> = HashMap::new();
    let mut lost_shards = Vec::new();

    let mut shards: Vec<u32> = data.keys().copied().collect();
    shards.sort_unstable();
    for shard in shards {
        let sources = data.get_mut(&shard).expect("shard present in data");
        let mut segment_ids: Vec<i64> = sources.segments.keys().copied().collect();
        segment_ids.sort_unstable();
        for id in segment_ids {
            let sref = SegmentRef {
                origin: sources.origin.clone(),
                id,
            };
            if plan.values().any(|segs| segs.contains(&sref)) {
                // Already planned for another shard this round.
                continue;
            }
            if sources.segments.get(&id).is_some_and(Vec::is_empty) {
                sources.segments.remove(&id);
                continue;
            }
            let candidates = sources.segments.get_mut(&id).expect("segment present");
            let chosen = candidates
                .iter()
                .min_by_key(|host| plan.get(*host).map_or(0, BTreeSet::len))
                .cloned()
                .expect("non-empty candidate list");
            candidates.retain(|host| host != &chosen);
            plan.entry(chosen).or_default().insert(sref);
        }
        if sources.segments.is_empty() {
            lost_shards.push(shard);
        }
    }
    for shard in &lost_shards {
        data.remove(shard);
    }
    (plan, lost_shards)
}

/// Replay a pulled segment: apply each put through the local write path
/// when `(segment-id, op-index)` beats the recorded watermark for its key.
async fn replay_segment(
    server: &Arc<StoreServer>,
    segment: &Segment,
    keys_to_puts: &mut HashMap<String, (i64, usize)>,
) {
    for (index, op) in segment.ops.iter().enumerate() {
        if op.kind != OpKind::Put {
            continue;
        }
        let newer = match keys_to_puts.get(&op.key) {
            None => true,
            Some(&(seg, idx)) => (segment.id, index) > (seg, idx),
        };
        if newer {
            server.apply_recovered_put(op.clone()).await;
            keys_to_puts.insert(op.key.clone(), (segment.id, index));
        }
    }
}

/// Remove a pulled segment from every shard that listed it; shards whose
/// segment set empties are complete and removed from `data`.
fn prune_segment(
    data: &mut HashMap<u32, ShardSources>,
    sref: &SegmentRef,
    bytes: u64,
    shard_bytes: &mut HashMap<u32, u64>,
) -> Vec<u32> {
    let mut completed = Vec::new();
    for (shard, sources) in data.iter_mut() {
        if sources.origin == sref.origin && sources.segments.remove(&sref.id).is_some() {
            *shard_bytes.entry(*shard).or_default() += bytes;
            if sources.segments.is_empty() {
                completed.push(*shard);
            }
        }
    }
    for shard in &completed {
        data.remove(shard);
    }
    completed
}

fn drop_candidate(data: &mut HashMap<u32, ShardSources>, host: &str) {
    for sources in data.values_mut() {
        for candidates in sources.segments.values_mut() {
            candidates.retain(|h| h != host);
        }
    }
}

/// Report a recovered shard until the view service acks.
async fn report_completed(server: &Arc<StoreServer>, shard: u32, bytes: u64) {
    loop {
        match server.view_clerk().recovery_completed(shard, bytes).await {
            Ok(()) => {
                tracing::info!(shard, bytes, "shard recovery reported");
                return;
            }
            Err(err) => {
                tracing::debug!(shard, error = ?err, "recovery report failed; retrying");
                tokio::time::sleep(PING_INTERVAL).await;
            }
        }
    }
}
