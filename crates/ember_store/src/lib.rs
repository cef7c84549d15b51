//! Sharded, primary-only, log-structured key/value store with cooperative
//! recovery.
//!
//! Keys hash into a fixed number of shards; each shard is owned by exactly
//! one primary in the current view. Primaries append writes to fixed-size
//! log segments replicated into in-memory buffers on a backup group of
//! peers. The view service detects failed primaries and elects recovery
//! masters that pull surviving segments from backups and replay them.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

pub mod clerk;
pub mod proto;
pub mod rpc;
pub mod segment;
pub mod server;
pub mod view;

mod recovery;

pub use server::{ServerConfig, StoreServer};
pub use view::{ViewConfig, ViewServer};

/// How often servers ping the view service and the view service ticks.
pub const PING_INTERVAL: Duration = Duration::from_millis(100);

/// Missed-ping multiplier before a server is declared dead.
pub const DEAD_PINGS: u32 = 12;

/// Live servers required before the first view is published.
pub const CRITICAL_MASS: usize = 10;

/// Fixed shard count; `key2shard` must agree bit-exactly cluster-wide.
pub const NUMBER_OF_SHARDS: u32 = 100;

/// Backup group size for every segment.
pub const REP_LEVEL: usize = 3;

/// Maximum serialized size of one log segment.
pub const SEG_LIMIT: usize = 8 * 1024 * 1024;

/// Broadcast rounds before a forward/flush is declared failed.
pub const RETRIES: usize = 3;

/// Initial retry backoff; doubles per round up to the cap.
pub const RETRY_BACKOFF_START: Duration = Duration::from_millis(10);
pub const RETRY_BACKOFF_CAP: Duration = Duration::from_secs(10);

/// Map a key to its shard. Cluster-wide contract: adler32 modulo the shard
/// count, computed over the raw key bytes.
pub fn key2shard(key: &str) -> u32 {
    adler32::RollingAdler32::from_buffer(key.as_bytes()).hash() % NUMBER_OF_SHARDS
}

/// Handle for an in-process service: aborts its tasks on drop.
pub struct ServiceTasks {
    tasks: Vec<JoinHandle<()>>,
}

impl ServiceTasks {
    pub fn abort(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for ServiceTasks {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Running view service plus its accept and tick tasks.
pub struct ViewHandle {
    pub server: Arc<ViewServer>,
    pub tasks: ServiceTasks,
}

/// Running primary/backup server plus its accept and tick tasks.
pub struct StoreHandle {
    pub server: Arc<StoreServer>,
    pub tasks: ServiceTasks,
}

/// Bind and start a view service. The returned handle keeps it alive.
pub async fn start_view_service(cfg: ViewConfig) -> anyhow::Result<ViewHandle> {
    let endpoint = proto::Endpoint::parse(&cfg.me)?;
    let listener = rpc::bind(&endpoint).await?;
    let server = Arc::new(ViewServer::new(cfg));

    let svc = server.clone();
    let accept = tokio::spawn(async move {
        if let Err(err) = listener.run(svc).await {
            tracing::error!(error = ?err, "view service listener exited");
        }
    });

    let ticker_ref = server.clone();
    let ticker = tokio::spawn(async move {
        let mut interval = tokio::time::interval(PING_INTERVAL);
        loop {
            interval.tick().await;
            ticker_ref.clone().tick().await;
        }
    });

    Ok(ViewHandle {
        server,
        tasks: ServiceTasks {
            tasks: vec![accept, ticker],
        },
    })
}

/// Bind and start a primary/backup server. The returned handle keeps it
/// alive; aborting the handle stops both serving and pinging, which the
/// view service observes as death.
pub async fn start_store_server(cfg: ServerConfig) -> anyhow::Result<StoreHandle> {
    let endpoint = proto::Endpoint::parse(&cfg.me)?;
    let listener = rpc::bind(&endpoint).await?;
    let server = StoreServer::new(cfg)?;

    let svc = server.clone();
    let accept = tokio::spawn(async move {
        if let Err(err) = listener.run(svc).await {
            tracing::error!(error = ?err, "store server listener exited");
        }
    });

    let ticker_ref = server.clone();
    let ticker = tokio::spawn(async move {
        let mut interval = tokio::time::interval(PING_INTERVAL);
        loop {
            interval.tick().await;
            ticker_ref.tick().await;
        }
    });

    Ok(StoreHandle {
        server,
        tasks: ServiceTasks {
            tasks: vec![accept, ticker],
        },
    })
}
