//! Log segments: the unit of replication and of recovery transfer.
//!
//! A primary's log is a sequence of fixed-capacity append-only segments.
//! Segments travel over the wire inside RPC envelopes and are persisted by
//! backups as one crc-framed binary record per file under
//! `<seg_path>/<origin>/<segment-id>`.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};

use crate::key2shard;

/// Fixed per-op byte overhead: client id, request id, kind tag, and the two
/// length prefixes of the encoded form. Size accounting and the binary
/// codec must agree on this.
pub const OP_HEADER_BYTES: usize = 8 + 8 + 1 + 4 + 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    Get,
    Put,
}

/// An immutable client operation as it is logged and replicated.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Op {
    pub client: i64,
    pub request: i64,
    pub kind: OpKind,
    pub key: String,
    pub value: String,
}

impl Op {
    /// Serialized byte size used against the segment capacity.
    pub fn wire_size(&self) -> usize {
        OP_HEADER_BYTES + self.key.len() + self.value.len()
    }
}

/// Append-only container of ops, capped at the segment limit.
///
/// `digest` is the strictly increasing list of ancestor segment ids on the
/// same primary, which makes each segment self-identifying within its
/// log lineage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub id: i64,
    pub active: bool,
    pub size_bytes: usize,
    pub digest: Vec<i64>,
    pub ops: Vec<Op>,
}

impl Segment {
    pub fn new(id: i64, digest: Vec<i64>) -> Self {
        Self {
            id,
            active: true,
            size_bytes: 0,
            digest,
            ops: Vec::new(),
        }
    }

    pub fn fits(&self, op: &Op, limit: usize) -> bool {
        self.size_bytes + op.wire_size() <= limit
    }

    /// Append `op` if it fits, returning its index within the segment.
    pub fn append(&mut self, op: Op, limit: usize) -> Option<usize> {
        if !self.active || !self.fits(&op, limit) {
            return None;
        }
        self.size_bytes += op.wire_size();
        self.ops.push(op);
        Some(self.ops.len() - 1)
    }

    /// Close the segment to further appends.
    pub fn seal(&mut self) {
        self.active = false;
    }

    /// The set of shards this segment's keys hash into.
    pub fn shards(&self) -> BTreeSet<u32> {
        self.ops.iter().map(|op| key2shard(&op.key)).collect()
    }

    /// Copy of this segment with ops filtered to the given shards. The
    /// relative order of surviving ops is preserved; the size reflects the
    /// filtered contents.
    pub fn filtered_to(&self, shards: &HashSet<u32>) -> Segment {
        let ops: Vec<Op> = self
            .ops
            .iter()
            .filter(|op| shards.contains(&key2shard(&op.key)))
            .cloned()
            .collect();
        let size_bytes = ops.iter().map(Op::wire_size).sum();
        Segment {
            id: self.id,
            active: self.active,
            size_bytes,
            digest: self.digest.clone(),
            ops,
        }
    }
}

/// A primary's log: every prior segment is sealed, exactly one is active.
#[derive(Debug)]
pub struct Log {
    pub segments: HashMap<i64, Segment>,
    pub current_id: i64,
}

impl Log {
    pub fn new() -> Self {
        let seg = Segment::new(1, Vec::new());
        let mut segments = HashMap::new();
        segments.insert(seg.id, seg);
        Self {
            segments,
            current_id: 1,
        }
    }

    pub fn current(&self) -> &Segment {
        self.segments
            .get(&self.current_id)
            .expect("log always holds its current segment")
    }

    pub fn current_mut(&mut self) -> &mut Segment {
        self.segments
            .get_mut(&self.current_id)
            .expect("log always holds its current segment")
    }

    /// Seal the current segment and open its successor. The new digest is
    /// the old digest extended by the old id.
    pub fn rotate(&mut self) -> i64 {
        let (old_id, mut digest) = {
            let old = self.current_mut();
            old.seal();
            (old.id, old.digest.clone())
        };
        digest.push(old_id);
        let seg = Segment::new(old_id + 1, digest);
        self.current_id = seg.id;
        self.segments.insert(seg.id, seg);
        self.current_id
    }

    /// Resolve a store pointer to the op it names.
    pub fn op(&self, segment: i64, index: usize) -> Option<&Op> {
        self.segments.get(&segment)?.ops.get(index)
    }
}

impl Default for Log {
    fn default() -> Self {
        Self::new()
    }
}

// On-disk codec. Each segment file is one `len || crc32 || payload` record;
// the payload is a self-describing big-endian encoding of the segment.

pub fn encode_segment(seg: &Segment) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + 1 + 8 + 4 + seg.digest.len() * 8 + 4 + seg.size_bytes);
    out.extend_from_slice(&seg.id.to_be_bytes());
    out.push(u8::from(seg.active));
    out.extend_from_slice(&(seg.size_bytes as u64).to_be_bytes());
    out.extend_from_slice(&(seg.digest.len() as u32).to_be_bytes());
    for ancestor in &seg.digest {
        out.extend_from_slice(&ancestor.to_be_bytes());
    }
    out.extend_from_slice(&(seg.ops.len() as u32).to_be_bytes());
    for op in &seg.ops {
        out.extend_from_slice(&op.client.to_be_bytes());
        out.extend_from_slice(&op.request.to_be_bytes());
        out.push(match op.kind {
            OpKind::Get => 0,
            OpKind::Put => 1,
        });
        out.extend_from_slice(&(op.key.len() as u32).to_be_bytes());
        out.extend_from_slice(op.key.as_bytes());
        out.extend_from_slice(&(op.value.len() as u32).to_be_bytes());
        out.extend_from_slice(op.value.as_bytes());
    }
    out
}

pub fn decode_segment(buf: &[u8]) -> anyhow::Result<Segment> {
    let mut offset = 0usize;
    let id = read_i64_at(buf, &mut offset)?;
    let active = read_u8_at(buf, &mut offset)? != 0;
    let size_bytes = read_u64_at(buf, &mut offset)? as usize;
    let digest_len = read_u32_at(buf, &mut offset)? as usize;
    let mut digest = Vec::with_capacity(digest_len);
    for _ in 0..digest_len {
        digest.push(read_i64_at(buf, &mut offset)?);
    }
    let op_count = read_u32_at(buf, &mut offset)? as usize;
    let mut ops = Vec::with_capacity(op_count);
    for _ in 0..op_count {
        let client = read_i64_at(buf, &mut offset)?;
        let request = read_i64_at(buf, &mut offset)?;
        let kind = match read_u8_at(buf, &mut offset)? {
            0 => OpKind::Get,
            1 => OpKind::Put,
            other => anyhow::bail!("segment record has unknown op kind {other}"),
        };
        let key = read_string_at(buf, &mut offset)?;
        let value = read_string_at(buf, &mut offset)?;
        ops.push(Op {
            client,
            request,
            kind,
            key,
            value,
        });
    }
    anyhow::ensure!(offset == buf.len(), "trailing bytes in segment record");
    Ok(Segment {
        id,
        active,
        size_bytes,
        digest,
        ops,
    })
}

/// Filesystem-backed segment store, keyed by origin and segment id.
#[derive(Clone, Debug)]
pub struct SegmentDisk {
    root: PathBuf,
}

impl SegmentDisk {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, origin: &str, id: i64) -> PathBuf {
        self.root.join(sanitize_origin(origin)).join(id.to_string())
    }

    pub fn write(&self, origin: &str, seg: &Segment) -> anyhow::Result<()> {
        let path = self.path(origin, seg.id);
        let dir = path
            .parent()
            .expect("segment path always has a parent directory");
        fs::create_dir_all(dir)
            .with_context(|| format!("create segment dir {}", dir.display()))?;

        let payload = encode_segment(seg);
        let mut hasher = Hasher::new();
        hasher.update(&payload);
        let crc = hasher.finalize();

        let mut file = fs::File::create(&path)
            .with_context(|| format!("create segment file {}", path.display()))?;
        file.write_all(&(payload.len() as u32).to_be_bytes())?;
        file.write_all(&crc.to_be_bytes())?;
        file.write_all(&payload)?;
        file.sync_all()
            .with_context(|| format!("sync segment file {}", path.display()))?;
        Ok(())
    }

    pub fn read(&self, origin: &str, id: i64) -> anyhow::Result<Segment> {
        let path = self.path(origin, id);
        let data =
            fs::read(&path).with_context(|| format!("read segment file {}", path.display()))?;
        anyhow::ensure!(data.len() >= 8, "segment file too short");
        let len = u32::from_be_bytes(data[0..4].try_into().expect("4-byte slice")) as usize;
        let expected_crc = u32::from_be_bytes(data[4..8].try_into().expect("4-byte slice"));
        anyhow::ensure!(data.len() == 8 + len, "segment record length mismatch");
        let payload = &data[8..];
        let mut hasher = Hasher::new();
        hasher.update(payload);
        anyhow::ensure!(hasher.finalize() == expected_crc, "segment checksum mismatch");
        decode_segment(payload)
    }
}

/// Origins are endpoint strings; keep the per-origin directory name flat.
fn sanitize_origin(origin: &str) -> String {
    origin
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

fn read_u8_at(data: &[u8], offset: &mut usize) -> anyhow::Result<u8> {
    anyhow::ensure!(*offset + 1 <= data.len(), "segment record short u8");
    let value = data[*offset];
    *offset += 1;
    Ok(value)
}

fn read_u32_at(data: &[u8], offset: &mut usize) -> anyhow::Result<u32> {
    anyhow::ensure!(*offset + 4 <= data.len(), "segment record short u32");
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[*offset..*offset + 4]);
    *offset += 4;
    Ok(u32::from_be_bytes(buf))
}

fn read_u64_at(data: &[u8], offset: &mut usize) -> anyhow::Result<u64> {
    anyhow::ensure!(*offset + 8 <= data.len(), "segment record short u64");
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[*offset..*offset + 8]);
    *offset += 8;
    Ok(u64::from_be_bytes(buf))
}

fn read_i64_at(data: &[u8], offset: &mut usize) -> anyhow::Result<i64> {
    Ok(read_u64_at(data, offset)? as i64)
}

fn read_string_at(data: &[u8], offset: &mut usize) -> anyhow::Result<String> {
    let len = read_u32_at(data, offset)? as usize;
    anyhow::ensure!(*offset + len <= data.len(), "segment record short string");
    let raw = data[*offset..*offset + len].to_vec();
    *offset += len;
    String::from_utf8(raw).context("segment record string is not utf-8")
}
