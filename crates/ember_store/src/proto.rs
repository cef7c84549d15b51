//! Wire schema shared by every role in the cluster.
//!
//! One `Request` envelope and one `Reply` envelope cover the whole RPC
//! surface; each role answers its own subset and returns
//! [`Reply::Unexpected`] for the rest.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::segment::{Op, Segment};

/// A dialable address: `host:port` for TCP, an absolute path or a
/// `unix:`-prefixed path for a local socket. A server's identity is the
/// string form of its endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl Endpoint {
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        if let Some(path) = raw.strip_prefix("unix:") {
            return Ok(Self::Unix(PathBuf::from(path)));
        }
        if raw.starts_with('/') {
            return Ok(Self::Unix(PathBuf::from(raw)));
        }
        let addr: SocketAddr = raw
            .parse()
            .with_context(|| format!("invalid endpoint {raw:?}"))?;
        Ok(Self::Tcp(addr))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "{addr}"),
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// Reply status taxonomy for the data plane.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrCode {
    Ok,
    /// Get for a key that was never Put.
    NoKey,
    /// The target no longer owns the key's shard.
    WrongServer,
    /// The recipient is not an enlisted backup for the origin/segment pair.
    NotResponsible,
}

/// A numbered mapping from shard to owning primary. `number == 0` means
/// invalid/uninitialized.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct View {
    pub number: u64,
    pub shards_to_primaries: HashMap<u32, String>,
}

impl View {
    pub fn is_valid(&self) -> bool {
        self.number > 0
    }

    pub fn primary_for(&self, shard: u32) -> Option<&String> {
        self.shards_to_primaries.get(&shard)
    }
}

/// Globally unambiguous segment name. Segment ids are only monotone per
/// origin primary, and backup disk state is keyed by origin.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SegmentRef {
    pub origin: String,
    pub id: i64,
}

// View service RPCs.

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PingArgs {
    pub server: String,
    pub view_number: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PingReply {
    pub view: View,
    /// Servers primaries may draw backup candidates from.
    pub servers_alive: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetViewReply {
    pub view: View,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecoveryCompletedArgs {
    pub server: String,
    pub shard: u32,
    pub bytes_received: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusReply {
    pub view: View,
    pub ping_ages_ms: HashMap<String, u64>,
    pub servers_alive: Vec<String>,
    pub primary_servers: Vec<String>,
    pub recovery_in_process: HashMap<String, Vec<u32>>,
}

// Primary/backup server RPCs.

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetArgs {
    pub key: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetReply {
    pub value: String,
    pub err: ErrCode,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PutArgs {
    pub client: i64,
    pub request: i64,
    pub key: String,
    pub value: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PutReply {
    pub err: ErrCode,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnlistReplicaArgs {
    pub origin: String,
    /// Buffer seed: the segment's contents at enlistment time (empty in
    /// every normal path).
    pub segment: Segment,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnlistReplicaReply {
    pub err: ErrCode,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ForwardOpArgs {
    pub origin: String,
    pub segment: i64,
    pub op: Op,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ForwardOpReply {
    pub err: ErrCode,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlushSegArgs {
    pub origin: String,
    pub old_segment: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlushSegReply {
    pub err: ErrCode,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuerySegmentsArgs {
    pub dead_primaries: Vec<String>,
}

/// One backed-up segment and the shards its keys hash into.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackedSegment {
    pub origin: String,
    pub segment: i64,
    pub shards: Vec<u32>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuerySegmentsReply {
    pub server: String,
    pub segments: Vec<BackedSegment>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PullSegmentsByShardsArgs {
    pub segments: Vec<SegmentRef>,
    /// Shards still being recovered; returned ops are filtered to these.
    pub shards: Vec<u32>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PullSegmentsArgs {
    pub segments: Vec<SegmentRef>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PulledSegment {
    pub origin: String,
    pub segment: Segment,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PullSegmentsReply {
    pub segments: Vec<PulledSegment>,
}

/// Candidate sources for one lost shard: the dead primary that owned it
/// and, per surviving segment, the backups known to hold a copy.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShardSources {
    pub origin: String,
    pub segments: HashMap<i64, Vec<String>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ElectRecoveryMasterArgs {
    pub recovery_data: HashMap<u32, ShardSources>,
    pub dead_primaries: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ElectRecoveryMasterReply {
    pub server: String,
}

/// Request envelope for the whole cluster RPC surface.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Request {
    // View service.
    Ping(PingArgs),
    GetView,
    RecoveryCompleted(RecoveryCompletedArgs),
    Status,
    // Primary/backup server.
    Get(GetArgs),
    Put(PutArgs),
    EnlistReplica(EnlistReplicaArgs),
    ForwardOp(ForwardOpArgs),
    FlushSeg(FlushSegArgs),
    QuerySegments(QuerySegmentsArgs),
    PullSegmentsByShards(PullSegmentsByShardsArgs),
    PullSegments(PullSegmentsArgs),
    ElectRecoveryMaster(ElectRecoveryMasterArgs),
}

/// Reply envelope matching [`Request`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Reply {
    Ping(PingReply),
    GetView(GetViewReply),
    RecoveryCompleted,
    Status(StatusReply),
    Get(GetReply),
    Put(PutReply),
    EnlistReplica(EnlistReplicaReply),
    ForwardOp(ForwardOpReply),
    FlushSeg(FlushSegReply),
    QuerySegments(QuerySegmentsReply),
    PullSegments(PullSegmentsReply),
    ElectRecoveryMaster(ElectRecoveryMasterReply),
    /// The recipient does not serve this request.
    Unexpected(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_parse_round_trips() {
        let tcp = Endpoint::parse("127.0.0.1:9000").unwrap();
        assert_eq!(tcp.to_string(), "127.0.0.1:9000");
        assert_eq!(Endpoint::parse(&tcp.to_string()).unwrap(), tcp);

        let unix = Endpoint::parse("/tmp/ember.sock").unwrap();
        assert_eq!(unix, Endpoint::Unix(PathBuf::from("/tmp/ember.sock")));
        assert_eq!(Endpoint::parse(&unix.to_string()).unwrap(), unix);

        assert!(Endpoint::parse("not-an-endpoint").is_err());
    }

    #[test]
    fn view_zero_is_invalid() {
        let view = View::default();
        assert!(!view.is_valid());
        assert_eq!(view.primary_for(0), None);
    }
}
