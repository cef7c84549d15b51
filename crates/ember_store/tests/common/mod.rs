//! Shared helpers for in-process cluster tests.
#![allow(dead_code)]

use std::net::TcpListener;
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use ember_store::clerk::{Clerk, ViewClerk};
use ember_store::proto::View;
use ember_store::{
    start_store_server, start_view_service, ServerConfig, StoreHandle, ViewConfig, ViewHandle,
};

/// Outer deadline for cluster state transitions (bootstrap, recovery).
pub const WAIT_DEADLINE: Duration = Duration::from_secs(30);

/// A whole cluster running in-process: one view service plus N servers.
pub struct Cluster {
    pub view_addr: String,
    pub view: ViewHandle,
    pub servers: Vec<StoreHandle>,
    pub dir: PathBuf,
}

/// Pick an available local port by binding to port 0.
pub fn pick_free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("bind port 0")
        .local_addr()
        .expect("local addr")
        .port()
}

/// Per-test scratch directory.
pub fn test_dir(name: &str) -> PathBuf {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    std::env::temp_dir().join(format!("ember-test-{name}-{}-{ts}", std::process::id()))
}

/// Start a view service (critical mass = `n`) and `n` servers.
pub async fn spawn_cluster(name: &str, n: usize, seg_limit: usize) -> Cluster {
    let dir = test_dir(name);
    let view_addr = format!("127.0.0.1:{}", pick_free_port());
    let mut vcfg = ViewConfig::new(view_addr.clone());
    vcfg.critical_mass = n;
    let view = start_view_service(vcfg).await.expect("start view service");

    let mut servers = Vec::with_capacity(n);
    for i in 0..n {
        let addr = format!("127.0.0.1:{}", pick_free_port());
        let mut cfg = ServerConfig::new(addr, view_addr.clone());
        cfg.seg_path = dir.join(format!("seg-{i}"));
        cfg.seg_limit = seg_limit;
        servers.push(start_store_server(cfg).await.expect("start store server"));
    }

    Cluster {
        view_addr,
        view,
        servers,
        dir,
    }
}

impl Cluster {
    pub fn clerk(&self) -> Clerk {
        Clerk::new(self.view_addr.clone())
    }

    pub fn view_clerk(&self) -> ViewClerk {
        ViewClerk::new("test-harness", self.view_addr.clone())
    }

    pub fn server_index(&self, me: &str) -> Option<usize> {
        self.servers.iter().position(|h| h.server.me() == me)
    }

    /// Stop a server's accept loop and ping loop; the view service observes
    /// this as death.
    pub fn kill(&self, idx: usize) {
        self.servers[idx].tasks.abort();
    }

    pub fn cleanup(&self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

/// Poll the view service until the view number reaches `min`.
pub async fn wait_for_view_number(view_addr: &str, min: u64) -> View {
    let clerk = ViewClerk::new("test-harness", view_addr);
    let start = Instant::now();
    loop {
        if let Ok(view) = clerk.get().await {
            if view.number >= min {
                return view;
            }
        }
        assert!(
            start.elapsed() < WAIT_DEADLINE,
            "view did not reach number {min} within {WAIT_DEADLINE:?}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Poll until `shard` is owned by a primary other than `old`.
pub async fn wait_for_primary_change(view_addr: &str, shard: u32, old: &str) -> String {
    let clerk = ViewClerk::new("test-harness", view_addr);
    let start = Instant::now();
    loop {
        if let Ok(view) = clerk.get().await {
            if let Some(primary) = view.primary_for(shard) {
                if primary != old {
                    return primary.clone();
                }
            }
        }
        assert!(
            start.elapsed() < WAIT_DEADLINE,
            "shard {shard} was not reassigned away from {old} within {WAIT_DEADLINE:?}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Clerk get with an outer deadline so a stuck cluster fails the test
/// instead of hanging it.
pub async fn get_with_deadline(clerk: &mut Clerk, key: &str) -> String {
    tokio::time::timeout(WAIT_DEADLINE, clerk.get(key))
        .await
        .unwrap_or_else(|_| panic!("get({key:?}) did not complete within {WAIT_DEADLINE:?}"))
}
