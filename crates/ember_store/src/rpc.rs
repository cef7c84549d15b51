//! Framed RPC transport.
//!
//! Frames are length-delimited; each payload is `crc32 (4B BE) || JSON`.
//! Callers dial one connection per call and apply a flat timeout; any
//! transport, timeout, or decode error is surfaced as the call simply not
//! being acknowledged. The server side accepts connections and answers
//! sequential request/reply exchanges per connection.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::proto::{Endpoint, Reply, Request};

/// Segment pulls can slightly exceed the 8 MiB segment cap with envelope
/// overhead; leave generous headroom.
const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Flat per-call timeout; an expired call counts as "no ack".
pub const CALL_TIMEOUT: Duration = Duration::from_secs(10);

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_BYTES)
        .new_codec()
}

fn encode_payload<T: Serialize>(msg: &T) -> anyhow::Result<Bytes> {
    let body = serde_json::to_vec(msg).context("encode rpc payload")?;
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&body);
    let crc = hasher.finalize();

    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&crc.to_be_bytes());
    out.extend_from_slice(&body);
    Ok(Bytes::from(out))
}

fn decode_payload<T: DeserializeOwned>(frame: &[u8]) -> anyhow::Result<T> {
    anyhow::ensure!(frame.len() >= 4, "rpc frame shorter than its checksum");
    let expected = u32::from_be_bytes(frame[0..4].try_into().expect("4-byte slice"));
    let body = &frame[4..];
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(body);
    anyhow::ensure!(hasher.finalize() == expected, "rpc frame checksum mismatch");
    serde_json::from_slice(body).context("decode rpc payload")
}

/// Issue one request to `target` and wait for the reply.
pub async fn call(target: &str, req: &Request) -> anyhow::Result<Reply> {
    let endpoint = Endpoint::parse(target)?;
    tokio::time::timeout(CALL_TIMEOUT, call_endpoint(&endpoint, req))
        .await
        .map_err(|_| anyhow::anyhow!("rpc call to {target} timed out"))?
}

async fn call_endpoint(endpoint: &Endpoint, req: &Request) -> anyhow::Result<Reply> {
    match endpoint {
        Endpoint::Tcp(addr) => {
            let stream = TcpStream::connect(addr)
                .await
                .with_context(|| format!("dial {addr}"))?;
            exchange(stream, req).await
        }
        Endpoint::Unix(path) => {
            let stream = UnixStream::connect(path)
                .await
                .with_context(|| format!("dial {}", path.display()))?;
            exchange(stream, req).await
        }
    }
}

async fn exchange<S>(stream: S, req: &Request) -> anyhow::Result<Reply>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, codec());
    framed.send(encode_payload(req)?).await.context("send rpc request")?;
    let frame = framed
        .next()
        .await
        .ok_or_else(|| anyhow::anyhow!("connection closed before reply"))?
        .context("read rpc reply")?;
    decode_payload(&frame)
}

/// A role that answers the cluster RPC surface.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    async fn handle(self: Arc<Self>, req: Request) -> Reply;
}

/// Bound listener, ready to serve. Binding is separated from serving so
/// startup errors surface before any task is spawned.
pub enum RpcListener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

pub async fn bind(endpoint: &Endpoint) -> anyhow::Result<RpcListener> {
    match endpoint {
        Endpoint::Tcp(addr) => {
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("bind {addr}"))?;
            Ok(RpcListener::Tcp(listener))
        }
        Endpoint::Unix(path) => {
            // A previous instance may have left its socket file behind.
            let _ = std::fs::remove_file(path);
            let listener =
                UnixListener::bind(path).with_context(|| format!("bind {}", path.display()))?;
            Ok(RpcListener::Unix(listener))
        }
    }
}

impl RpcListener {
    /// The bound TCP address, when applicable (port 0 resolution).
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        match self {
            Self::Tcp(listener) => listener.local_addr().ok(),
            Self::Unix(_) => None,
        }
    }

    /// Accept loop: one task per connection.
    pub async fn run<S: Service>(self, svc: Arc<S>) -> anyhow::Result<()> {
        match self {
            Self::Tcp(listener) => loop {
                let (socket, _) = listener.accept().await.context("accept")?;
                let svc = svc.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_conn(socket, svc).await {
                        tracing::debug!(error = ?err, "rpc connection closed");
                    }
                });
            },
            Self::Unix(listener) => loop {
                let (socket, _) = listener.accept().await.context("accept")?;
                let svc = svc.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_conn(socket, svc).await {
                        tracing::debug!(error = ?err, "rpc connection closed");
                    }
                });
            },
        }
    }
}

async fn handle_conn<IO, S>(io: IO, svc: Arc<S>) -> anyhow::Result<()>
where
    IO: AsyncRead + AsyncWrite + Unpin,
    S: Service,
{
    let mut framed = Framed::new(io, codec());
    while let Some(frame) = framed.next().await {
        let frame = frame.context("read rpc request")?;
        let req: Request = decode_payload(&frame)?;
        let reply = svc.clone().handle(req).await;
        framed.send(encode_payload(&reply)?).await.context("send rpc reply")?;
    }
    Ok(())
}
