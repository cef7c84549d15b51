//! Primary/backup server.
//!
//! One coarse lock guards the whole server state: the log and store it
//! serves as a primary, the buffers and segment sets it holds as a backup
//! for peers, its backup groups, the dedup set, and its cached view. The
//! lock is held for the entirety of every handler, including broadcast
//! fan-outs; parallelism lives in the fan-out workers, not in concurrent
//! requests. Disk persistence on flush runs in a background task after the
//! reply is sent.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use futures_util::future::join_all;
use rand::seq::SliceRandom;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::clerk::ViewClerk;
use crate::proto::{
    BackedSegment, EnlistReplicaArgs, EnlistReplicaReply, ErrCode, FlushSegArgs, FlushSegReply,
    ForwardOpArgs, ForwardOpReply, GetArgs, GetReply, PullSegmentsArgs, PullSegmentsByShardsArgs,
    PullSegmentsReply, PulledSegment, PutArgs, PutReply, QuerySegmentsArgs, QuerySegmentsReply,
    Reply, Request, View,
};
use crate::segment::{Log, Op, OpKind, Segment, SegmentDisk};
use crate::{
    key2shard, recovery, rpc, REP_LEVEL, RETRIES, RETRY_BACKOFF_CAP, RETRY_BACKOFF_START,
    SEG_LIMIT,
};

#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// This server's endpoint string; doubles as its cluster identity.
    pub me: String,
    /// View service endpoint.
    pub view_server: String,
    /// Directory backups persist flushed segments into.
    pub seg_path: PathBuf,
    /// Segment capacity in bytes.
    pub seg_limit: usize,
}

impl ServerConfig {
    pub fn new(me: impl Into<String>, view_server: impl Into<String>) -> Self {
        Self {
            me: me.into(),
            view_server: view_server.into(),
            seg_path: PathBuf::from("/tmp/segment"),
            seg_limit: SEG_LIMIT,
        }
    }
}

/// Pointer from the store into the log.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpRef {
    pub segment: i64,
    pub index: usize,
}

/// The peers holding an in-memory copy of one segment on our behalf.
#[derive(Clone, Debug)]
pub struct BackupGroup {
    pub members: Vec<String>,
}

pub(crate) struct StoreState {
    pub(crate) view: View,
    /// Alive servers from the last ping reply; enlistment candidate pool.
    pub(crate) hosts: Vec<String>,
    pub(crate) log: Log,
    pub(crate) store: HashMap<String, OpRef>,
    /// Per remote primary: the in-RAM segment currently appended to on its
    /// behalf (at most one per primary at a time).
    pub(crate) buffers: HashMap<String, Segment>,
    /// Per remote primary: segment ids this server holds for it.
    pub(crate) backed_up: HashMap<String, BTreeSet<i64>>,
    /// Per own segment id: its backup group, alive until flush.
    pub(crate) backups: HashMap<i64, BackupGroup>,
    /// Accepted puts, for idempotency under client retry.
    pub(crate) requests: HashSet<(i64, i64)>,
}

/// Diagnostic snapshot of a server's guarded state.
#[derive(Clone, Debug, Serialize)]
pub struct StoreSnapshot {
    pub me: String,
    pub view_number: u64,
    pub current_segment: i64,
    pub current_digest: Vec<i64>,
    pub segment_ids: Vec<i64>,
    pub store_len: usize,
    pub backup_groups: HashMap<i64, Vec<String>>,
    pub backed_up: HashMap<String, Vec<i64>>,
}

pub struct StoreServer {
    me: String,
    seg_limit: usize,
    disk: SegmentDisk,
    view_clerk: ViewClerk,
    state: Mutex<StoreState>,
}

impl StoreServer {
    pub fn new(cfg: ServerConfig) -> anyhow::Result<Arc<Self>> {
        std::fs::create_dir_all(&cfg.seg_path)
            .with_context(|| format!("create segment dir {}", cfg.seg_path.display()))?;
        Ok(Arc::new(Self {
            me: cfg.me.clone(),
            seg_limit: cfg.seg_limit,
            disk: SegmentDisk::new(&cfg.seg_path),
            view_clerk: ViewClerk::new(cfg.me, cfg.view_server),
            state: Mutex::new(StoreState {
                view: View::default(),
                hosts: Vec::new(),
                log: Log::new(),
                store: HashMap::new(),
                buffers: HashMap::new(),
                backed_up: HashMap::new(),
                backups: HashMap::new(),
                requests: HashSet::new(),
            }),
        }))
    }

    pub fn me(&self) -> &str {
        &self.me
    }

    pub(crate) fn view_clerk(&self) -> &ViewClerk {
        &self.view_clerk
    }

    /// Ping the view service; adopt the returned view and alive set.
    pub async fn tick(&self) {
        let view_number = self.state.lock().await.view.number;
        match self.view_clerk.ping(view_number).await {
            Ok((view, alive)) => {
                let mut st = self.state.lock().await;
                st.view = view;
                st.hosts = alive;
            }
            Err(err) => {
                tracing::debug!(error = ?err, "view service ping failed");
            }
        }
    }

    pub async fn snapshot(&self) -> StoreSnapshot {
        let st = self.state.lock().await;
        let mut segment_ids: Vec<i64> = st.log.segments.keys().copied().collect();
        segment_ids.sort_unstable();
        StoreSnapshot {
            me: self.me.clone(),
            view_number: st.view.number,
            current_segment: st.log.current_id,
            current_digest: st.log.current().digest.clone(),
            segment_ids,
            store_len: st.store.len(),
            backup_groups: st
                .backups
                .iter()
                .map(|(id, group)| (*id, group.members.clone()))
                .collect(),
            backed_up: st
                .backed_up
                .iter()
                .map(|(origin, ids)| (origin.clone(), ids.iter().copied().collect()))
                .collect(),
        }
    }

    fn owns_shard(&self, st: &StoreState, shard: u32) -> bool {
        st.view.primary_for(shard).map(String::as_str) == Some(self.me.as_str())
    }

    async fn get(&self, args: GetArgs) -> GetReply {
        let st = self.state.lock().await;
        let shard = key2shard(&args.key);
        if !self.owns_shard(&st, shard) {
            return GetReply {
                value: String::new(),
                err: ErrCode::WrongServer,
            };
        }
        match st
            .store
            .get(&args.key)
            .and_then(|r| st.log.op(r.segment, r.index))
        {
            Some(op) => GetReply {
                value: op.value.clone(),
                err: ErrCode::Ok,
            },
            None => GetReply {
                value: String::new(),
                err: ErrCode::NoKey,
            },
        }
    }

    async fn put(&self, args: PutArgs) -> PutReply {
        let mut st = self.state.lock().await;
        let shard = key2shard(&args.key);
        if !self.owns_shard(&st, shard) {
            return PutReply {
                err: ErrCode::WrongServer,
            };
        }
        // A retried request was already applied and replicated; ack it.
        if st.requests.contains(&(args.client, args.request)) {
            return PutReply { err: ErrCode::Ok };
        }
        let op = Op {
            client: args.client,
            request: args.request,
            kind: OpKind::Put,
            key: args.key,
            value: args.value,
        };
        self.apply_put(&mut st, op).await;
        PutReply { err: ErrCode::Ok }
    }

    /// The write path: ensure the current segment has a backup group,
    /// rotate with a flush when the op does not fit, append, forward to the
    /// whole group, then publish to the store.
    pub(crate) async fn apply_put(&self, st: &mut StoreState, op: Op) {
        let mut seg_id = st.log.current_id;
        if !st.backups.contains_key(&seg_id) {
            self.enlist_replicas(st, seg_id).await;
        }

        if !st.log.current().fits(&op, self.seg_limit) {
            // The group stops being "the current" before the flush goes out.
            let group = st
                .backups
                .remove(&seg_id)
                .expect("current segment has a backup group");
            if !self.broadcast_flush(seg_id, &group).await {
                panic!("backup group failed to flush segment {seg_id}");
            }
            seg_id = st.log.rotate();
            self.enlist_replicas(st, seg_id).await;
        }

        let index = st
            .log
            .current_mut()
            .append(op.clone(), self.seg_limit)
            .expect("op fits in a fresh segment");
        let group = st
            .backups
            .get(&seg_id)
            .cloned()
            .expect("current segment has a backup group");
        if !self.broadcast_forward(&op, seg_id, &group).await {
            panic!("backup group failed to ack op for segment {seg_id}");
        }
        st.requests.insert((op.client, op.request));
        st.store.insert(
            op.key.clone(),
            OpRef {
                segment: seg_id,
                index,
            },
        );
    }

    /// Apply a put replayed by recovery. Bypasses the ownership check (the
    /// view maps the shard to this server only after completion is
    /// reported) and the dedup consult.
    pub(crate) async fn apply_recovered_put(&self, op: Op) {
        let mut st = self.state.lock().await;
        self.apply_put(&mut st, op).await;
    }

    /// Enlist a fresh backup group for `seg_id`, shipping the segment's
    /// current contents as the buffer seed. Candidates are drawn at random
    /// from the alive peers; refusals are dropped from the pool, transient
    /// failures retried with doubling backoff until the group is full.
    async fn enlist_replicas(&self, st: &mut StoreState, seg_id: i64) {
        let snapshot = st
            .log
            .segments
            .get(&seg_id)
            .cloned()
            .expect("enlisting a segment the log holds");
        let peers: Vec<String> = st
            .hosts
            .iter()
            .filter(|h| h.as_str() != self.me)
            .cloned()
            .collect();
        if peers.len() < REP_LEVEL {
            panic!(
                "cannot replicate segment {seg_id}: {} live peers, need {REP_LEVEL}",
                peers.len()
            );
        }

        let mut enlisted: Vec<String> = Vec::new();
        let mut avail = peers.clone();
        let mut backoff = RETRY_BACKOFF_START;
        while enlisted.len() < REP_LEVEL {
            let needed = REP_LEVEL - enlisted.len();
            if avail.len() < needed {
                // Every remaining candidate refused; a refused host may
                // accept once its state moves on, so start the pool over.
                avail = peers
                    .iter()
                    .filter(|h| !enlisted.contains(h))
                    .cloned()
                    .collect();
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(RETRY_BACKOFF_CAP);
                continue;
            }

            let picks: Vec<String> = {
                let mut rng = rand::thread_rng();
                avail.choose_multiple(&mut rng, needed).cloned().collect()
            };
            let calls = picks.iter().map(|host| {
                let args = EnlistReplicaArgs {
                    origin: self.me.clone(),
                    segment: snapshot.clone(),
                };
                let host = host.clone();
                async move {
                    let res = rpc::call(&host, &Request::EnlistReplica(args)).await;
                    (host, res)
                }
            });
            for (host, res) in join_all(calls).await {
                match res {
                    Ok(Reply::EnlistReplica(reply)) if reply.err == ErrCode::Ok => {
                        avail.retain(|h| h != &host);
                        enlisted.push(host);
                    }
                    Ok(reply) => {
                        tracing::warn!(backup = %host, reply = ?reply, "enlistment refused");
                        avail.retain(|h| h != &host);
                    }
                    Err(err) => {
                        tracing::debug!(backup = %host, error = ?err, "enlistment not acknowledged");
                    }
                }
            }

            if enlisted.len() < REP_LEVEL {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(RETRY_BACKOFF_CAP);
            }
        }

        tracing::debug!(segment = seg_id, backups = ?enlisted, "backup group enlisted");
        st.backups.insert(seg_id, BackupGroup { members: enlisted });
    }

    async fn broadcast_forward(&self, op: &Op, segment: i64, group: &BackupGroup) -> bool {
        let req = Request::ForwardOp(ForwardOpArgs {
            origin: self.me.clone(),
            segment,
            op: op.clone(),
        });
        self.broadcast(group, req, "forward").await
    }

    async fn broadcast_flush(&self, segment: i64, group: &BackupGroup) -> bool {
        let req = Request::FlushSeg(FlushSegArgs {
            origin: self.me.clone(),
            old_segment: segment,
        });
        self.broadcast(group, req, "flush").await
    }

    /// All-must-ack fan-out: every group member must answer `Ok` within the
    /// retry budget. Any explicit rejection aborts immediately.
    async fn broadcast(&self, group: &BackupGroup, req: Request, what: &str) -> bool {
        let mut acked = vec![false; group.members.len()];
        let mut backoff = RETRY_BACKOFF_START;
        for _ in 0..RETRIES {
            let calls = group
                .members
                .iter()
                .enumerate()
                .filter(|(idx, _)| !acked[*idx])
                .map(|(idx, host)| {
                    let req = req.clone();
                    let host = host.clone();
                    async move {
                        let res = rpc::call(&host, &req).await;
                        (idx, host, res)
                    }
                });
            for (idx, host, res) in join_all(calls).await {
                match res {
                    Ok(reply) => match reply_err(&reply) {
                        Some(ErrCode::Ok) => acked[idx] = true,
                        code => {
                            tracing::warn!(backup = %host, code = ?code, "{} rejected by backup", what);
                            return false;
                        }
                    },
                    Err(err) => {
                        tracing::debug!(backup = %host, error = ?err, "{} not acknowledged", what);
                    }
                }
            }
            if acked.iter().all(|a| *a) {
                return true;
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(RETRY_BACKOFF_CAP);
        }
        false
    }

    // Backup-side handlers.

    async fn enlist_replica(&self, args: EnlistReplicaArgs) -> EnlistReplicaReply {
        let mut st = self.state.lock().await;
        let segs = st.backed_up.entry(args.origin.clone()).or_default();
        if !segs.insert(args.segment.id) {
            panic!(
                "segment {} from {} enlisted twice on {}",
                args.segment.id, args.origin, self.me
            );
        }
        st.buffers.insert(args.origin, args.segment);
        EnlistReplicaReply { err: ErrCode::Ok }
    }

    async fn forward_op(&self, args: ForwardOpArgs) -> ForwardOpReply {
        let mut st = self.state.lock().await;
        let responsible = st
            .backed_up
            .get(&args.origin)
            .is_some_and(|segs| segs.contains(&args.segment));
        if !responsible {
            return ForwardOpReply {
                err: ErrCode::NotResponsible,
            };
        }
        match st.buffers.get_mut(&args.origin) {
            Some(buf) if buf.id == args.segment => {
                if buf.append(args.op, self.seg_limit).is_none() {
                    panic!(
                        "buffer for {} overflowed segment {}: primary and backup diverged",
                        args.origin, args.segment
                    );
                }
                ForwardOpReply { err: ErrCode::Ok }
            }
            _ => ForwardOpReply {
                err: ErrCode::NotResponsible,
            },
        }
    }

    async fn flush_seg(&self, args: FlushSegArgs) -> FlushSegReply {
        let mut st = self.state.lock().await;
        let responsible = st
            .backed_up
            .get(&args.origin)
            .is_some_and(|segs| segs.contains(&args.old_segment));
        if !responsible {
            return FlushSegReply {
                err: ErrCode::NotResponsible,
            };
        }
        match st.buffers.remove(&args.origin) {
            Some(mut seg) if seg.id == args.old_segment => {
                seg.seal();
                // The disk write races the reply; the group's collective
                // survival is what makes the segment recoverable.
                let disk = self.disk.clone();
                let origin = args.origin.clone();
                tokio::task::spawn_blocking(move || {
                    if let Err(err) = disk.write(&origin, &seg) {
                        tracing::error!(origin = %origin, segment = seg.id, error = ?err, "segment flush failed");
                    }
                });
                FlushSegReply { err: ErrCode::Ok }
            }
            Some(other) => {
                // Not the buffered segment; put it back untouched.
                st.buffers.insert(args.origin, other);
                FlushSegReply {
                    err: ErrCode::NotResponsible,
                }
            }
            None => FlushSegReply {
                err: ErrCode::NotResponsible,
            },
        }
    }

    /// Read a backed-up segment: from the live buffer while it is still
    /// buffered, from disk after flush. Unreadable segments are reported as
    /// not held.
    fn load_backed_segment(&self, st: &StoreState, origin: &str, id: i64) -> Option<Segment> {
        if let Some(buf) = st.buffers.get(origin) {
            if buf.id == id {
                return Some(buf.clone());
            }
        }
        match self.disk.read(origin, id) {
            Ok(seg) => Some(seg),
            Err(err) => {
                tracing::warn!(origin = %origin, segment = id, error = ?err, "backed-up segment unreadable");
                None
            }
        }
    }

    async fn query_segments(&self, args: QuerySegmentsArgs) -> QuerySegmentsReply {
        let st = self.state.lock().await;
        let mut segments = Vec::new();
        for origin in &args.dead_primaries {
            let Some(ids) = st.backed_up.get(origin) else {
                continue;
            };
            for &id in ids {
                let Some(seg) = self.load_backed_segment(&st, origin, id) else {
                    continue;
                };
                let shards: Vec<u32> = seg.shards().into_iter().collect();
                if shards.is_empty() {
                    continue;
                }
                segments.push(BackedSegment {
                    origin: origin.clone(),
                    segment: id,
                    shards,
                });
            }
        }
        QuerySegmentsReply {
            server: self.me.clone(),
            segments,
        }
    }

    async fn pull_segments_by_shards(&self, args: PullSegmentsByShardsArgs) -> PullSegmentsReply {
        let st = self.state.lock().await;
        let shard_set: HashSet<u32> = args.shards.into_iter().collect();
        let mut segments = Vec::new();
        for sref in &args.segments {
            let Some(seg) = self.load_backed_segment(&st, &sref.origin, sref.id) else {
                continue;
            };
            segments.push(PulledSegment {
                origin: sref.origin.clone(),
                segment: seg.filtered_to(&shard_set),
            });
        }
        PullSegmentsReply { segments }
    }

    async fn pull_segments(&self, args: PullSegmentsArgs) -> PullSegmentsReply {
        let st = self.state.lock().await;
        let mut segments = Vec::new();
        for sref in &args.segments {
            let Some(seg) = self.load_backed_segment(&st, &sref.origin, sref.id) else {
                continue;
            };
            segments.push(PulledSegment {
                origin: sref.origin.clone(),
                segment: seg,
            });
        }
        PullSegmentsReply { segments }
    }
}

fn reply_err(reply: &Reply) -> Option<ErrCode> {
    match reply {
        Reply::EnlistReplica(r) => Some(r.err),
        Reply::ForwardOp(r) => Some(r.err),
        Reply::FlushSeg(r) => Some(r.err),
        _ => None,
    }
}

#[async_trait]
impl rpc::Service for StoreServer {
    async fn handle(self: Arc<Self>, req: Request) -> Reply {
        match req {
            Request::Get(args) => Reply::Get(self.get(args).await),
            Request::Put(args) => Reply::Put(self.put(args).await),
            Request::EnlistReplica(args) => Reply::EnlistReplica(self.enlist_replica(args).await),
            Request::ForwardOp(args) => Reply::ForwardOp(self.forward_op(args).await),
            Request::FlushSeg(args) => Reply::FlushSeg(self.flush_seg(args).await),
            Request::QuerySegments(args) => {
                Reply::QuerySegments(self.query_segments(args).await)
            }
            Request::PullSegmentsByShards(args) => {
                Reply::PullSegments(self.pull_segments_by_shards(args).await)
            }
            Request::PullSegments(args) => Reply::PullSegments(self.pull_segments(args).await),
            Request::ElectRecoveryMaster(args) => {
                let server = self.me.clone();
                tracing::info!(shards = args.recovery_data.len(), "elected recovery master");
                tokio::spawn(recovery::run(self.clone(), args.recovery_data));
                Reply::ElectRecoveryMaster(crate::proto::ElectRecoveryMasterReply { server })
            }
            other => Reply::Unexpected(format!("store server does not handle {other:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::SegmentRef;

    fn test_server(name: &str) -> Arc<StoreServer> {
        let dir = std::env::temp_dir().join(format!(
            "ember-server-test-{name}-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos()
        ));
        let mut cfg = ServerConfig::new("127.0.0.1:7001", "127.0.0.1:7000");
        cfg.seg_path = dir;
        StoreServer::new(cfg).unwrap()
    }

    fn put_op(request: i64, key: &str, value: &str) -> Op {
        Op {
            client: 1,
            request,
            kind: OpKind::Put,
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    async fn claim_shard(server: &StoreServer, key: &str) {
        let mut st = server.state.lock().await;
        st.view.number = 1;
        st.view
            .shards_to_primaries
            .insert(key2shard(key), server.me().to_string());
    }

    #[tokio::test]
    async fn get_resolves_through_the_log() {
        let server = test_server("get");
        claim_shard(&server, "alpha").await;
        {
            let mut st = server.state.lock().await;
            let op = put_op(1, "alpha", "one");
            let index = st.log.current_mut().append(op, SEG_LIMIT).unwrap();
            let segment = st.log.current_id;
            st.store
                .insert("alpha".to_string(), OpRef { segment, index });
        }

        let reply = server
            .get(GetArgs {
                key: "alpha".to_string(),
            })
            .await;
        assert_eq!(reply.err, ErrCode::Ok);
        assert_eq!(reply.value, "one");

        claim_shard(&server, "missing").await;
        let reply = server
            .get(GetArgs {
                key: "missing".to_string(),
            })
            .await;
        assert_eq!(reply.err, ErrCode::NoKey);
        assert_eq!(reply.value, "");
    }

    #[tokio::test]
    async fn get_rejects_shards_it_does_not_own() {
        let server = test_server("wrong-server");
        // View is valid but maps the shard elsewhere.
        {
            let mut st = server.state.lock().await;
            st.view.number = 1;
            st.view
                .shards_to_primaries
                .insert(key2shard("alpha"), "127.0.0.1:9999".to_string());
        }
        let reply = server
            .get(GetArgs {
                key: "alpha".to_string(),
            })
            .await;
        assert_eq!(reply.err, ErrCode::WrongServer);
    }

    #[tokio::test]
    async fn backup_enlist_forward_flush_cycle() {
        let server = test_server("backup");
        let origin = "127.0.0.1:7100";

        let reply = server
            .enlist_replica(EnlistReplicaArgs {
                origin: origin.to_string(),
                segment: Segment::new(1, Vec::new()),
            })
            .await;
        assert_eq!(reply.err, ErrCode::Ok);

        let reply = server
            .forward_op(ForwardOpArgs {
                origin: origin.to_string(),
                segment: 1,
                op: put_op(1, "alpha", "one"),
            })
            .await;
        assert_eq!(reply.err, ErrCode::Ok);

        // Unknown origin/segment pairs are refused.
        let reply = server
            .forward_op(ForwardOpArgs {
                origin: "127.0.0.1:7999".to_string(),
                segment: 1,
                op: put_op(2, "beta", "two"),
            })
            .await;
        assert_eq!(reply.err, ErrCode::NotResponsible);
        let reply = server
            .forward_op(ForwardOpArgs {
                origin: origin.to_string(),
                segment: 2,
                op: put_op(3, "beta", "two"),
            })
            .await;
        assert_eq!(reply.err, ErrCode::NotResponsible);

        let reply = server
            .flush_seg(FlushSegArgs {
                origin: origin.to_string(),
                old_segment: 1,
            })
            .await;
        assert_eq!(reply.err, ErrCode::Ok);
        {
            let st = server.state.lock().await;
            assert!(!st.buffers.contains_key(origin));
            assert!(st.backed_up[origin].contains(&1));
        }

        // The write races the reply; poll for the file to land.
        let mut flushed = None;
        for _ in 0..100 {
            if let Ok(seg) = server.disk.read(origin, 1) {
                flushed = Some(seg);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        let flushed = flushed.expect("flushed segment reaches disk");
        assert!(!flushed.active);
        assert_eq!(flushed.ops.len(), 1);
        assert_eq!(flushed.ops[0].value, "one");

        // Post-flush, recovery reads come from disk.
        let st = server.state.lock().await;
        let loaded = server.load_backed_segment(&st, origin, 1).unwrap();
        assert_eq!(loaded, flushed);
    }

    #[tokio::test]
    async fn flush_refuses_non_backed_segments() {
        let server = test_server("flush-refuse");
        let reply = server
            .flush_seg(FlushSegArgs {
                origin: "127.0.0.1:7100".to_string(),
                old_segment: 5,
            })
            .await;
        assert_eq!(reply.err, ErrCode::NotResponsible);
    }

    #[tokio::test]
    async fn query_and_pull_serve_the_unflushed_buffer() {
        let server = test_server("query");
        let origin = "127.0.0.1:7100";
        server
            .enlist_replica(EnlistReplicaArgs {
                origin: origin.to_string(),
                segment: Segment::new(1, Vec::new()),
            })
            .await;
        server
            .forward_op(ForwardOpArgs {
                origin: origin.to_string(),
                segment: 1,
                op: put_op(1, "alpha", "one"),
            })
            .await;

        let reply = server
            .query_segments(QuerySegmentsArgs {
                dead_primaries: vec![origin.to_string()],
            })
            .await;
        assert_eq!(reply.segments.len(), 1);
        assert_eq!(reply.segments[0].segment, 1);
        assert_eq!(reply.segments[0].shards, vec![key2shard("alpha")]);

        let reply = server
            .pull_segments_by_shards(PullSegmentsByShardsArgs {
                segments: vec![SegmentRef {
                    origin: origin.to_string(),
                    id: 1,
                }],
                shards: vec![key2shard("alpha")],
            })
            .await;
        assert_eq!(reply.segments.len(), 1);
        assert_eq!(reply.segments[0].segment.ops.len(), 1);

        // Filtering to an unrelated shard empties the copy.
        let unrelated = (key2shard("alpha") + 1) % crate::NUMBER_OF_SHARDS;
        let reply = server
            .pull_segments_by_shards(PullSegmentsByShardsArgs {
                segments: vec![SegmentRef {
                    origin: origin.to_string(),
                    id: 1,
                }],
                shards: vec![unrelated],
            })
            .await;
        assert!(reply.segments[0].segment.ops.is_empty());

        // The unfiltered pull returns everything.
        let reply = server
            .pull_segments(PullSegmentsArgs {
                segments: vec![SegmentRef {
                    origin: origin.to_string(),
                    id: 1,
                }],
            })
            .await;
        assert_eq!(reply.segments[0].segment.ops.len(), 1);
    }

    #[tokio::test]
    #[should_panic(expected = "enlisted twice")]
    async fn duplicate_enlistment_is_fatal() {
        let server = test_server("dup-enlist");
        let args = EnlistReplicaArgs {
            origin: "127.0.0.1:7100".to_string(),
            segment: Segment::new(1, Vec::new()),
        };
        server.enlist_replica(args.clone()).await;
        server.enlist_replica(args).await;
    }
}
