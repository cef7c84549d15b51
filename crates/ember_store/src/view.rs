//! View service: the single-writer membership authority.
//!
//! Ingests pings, detects deaths, publishes numbered views, and
//! orchestrates recovery: surviving backups are queried for segments of
//! dead primaries, lost shards are assigned round-robin to recovery
//! masters, and completions are folded back into the view.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio::sync::Mutex;

use crate::proto::{
    ElectRecoveryMasterArgs, GetViewReply, PingArgs, PingReply, QuerySegmentsArgs,
    RecoveryCompletedArgs, Reply, Request, ShardSources, StatusReply, View,
};
use crate::{rpc, CRITICAL_MASS, DEAD_PINGS, NUMBER_OF_SHARDS, PING_INTERVAL};

#[derive(Clone, Debug)]
pub struct ViewConfig {
    /// The view service's endpoint string.
    pub me: String,
    /// Live servers required before the first view is published.
    pub critical_mass: usize,
}

impl ViewConfig {
    pub fn new(me: impl Into<String>) -> Self {
        Self {
            me: me.into(),
            critical_mass: CRITICAL_MASS,
        }
    }
}

pub(crate) struct ViewState {
    pub(crate) view: View,
    /// One-way flip once enough servers are alive.
    pub(crate) critical_mass_reached: bool,
    pub(crate) server_pings: HashMap<String, Instant>,
    pub(crate) servers_alive: BTreeSet<String>,
    pub(crate) primary_servers: BTreeSet<String>,
    /// Dead server -> shards currently being recovered on its behalf.
    pub(crate) recovery_in_process: HashMap<String, Vec<u32>>,
}

pub struct ViewServer {
    me: String,
    critical_mass: usize,
    state: Mutex<ViewState>,
}

impl ViewServer {
    pub fn new(cfg: ViewConfig) -> Self {
        Self {
            me: cfg.me,
            critical_mass: cfg.critical_mass,
            state: Mutex::new(ViewState {
                view: View::default(),
                critical_mass_reached: false,
                server_pings: HashMap::new(),
                servers_alive: BTreeSet::new(),
                primary_servers: BTreeSet::new(),
                recovery_in_process: HashMap::new(),
            }),
        }
    }

    pub fn me(&self) -> &str {
        &self.me
    }

    /// One tick: scan for deaths, bootstrap at critical mass, bump the view
    /// when shards were unassigned, then launch recovery outside the lock.
    pub async fn tick(self: Arc<Self>) {
        let new_failures = {
            let mut st = self.state.lock().await;
            let failures = scan_deaths(&mut st, Instant::now(), PING_INTERVAL * DEAD_PINGS);
            if !st.critical_mass_reached {
                if try_critical_mass(&mut st, self.critical_mass) {
                    tracing::info!(
                        primaries = st.primary_servers.len(),
                        "critical mass reached; view 1 published"
                    );
                }
                return;
            }
            if !failures.is_empty() {
                st.view.number += 1;
                tracing::info!(view = st.view.number, dead = ?failures.keys().collect::<Vec<_>>(), "intermediate view published");
            }
            failures
        };
        if !new_failures.is_empty() {
            tokio::spawn(async move {
                self.recover(new_failures).await;
            });
        }
    }

    async fn ping(&self, args: PingArgs) -> PingReply {
        let mut st = self.state.lock().await;
        st.server_pings.insert(args.server.clone(), Instant::now());
        st.servers_alive.insert(args.server);
        PingReply {
            view: st.view.clone(),
            servers_alive: st.servers_alive.iter().cloned().collect(),
        }
    }

    async fn get_view(&self) -> GetViewReply {
        let st = self.state.lock().await;
        GetViewReply {
            view: st.view.clone(),
        }
    }

    async fn status(&self) -> StatusReply {
        let st = self.state.lock().await;
        let now = Instant::now();
        StatusReply {
            view: st.view.clone(),
            ping_ages_ms: st
                .server_pings
                .iter()
                .map(|(server, last)| {
                    (
                        server.clone(),
                        now.saturating_duration_since(*last).as_millis() as u64,
                    )
                })
                .collect(),
            servers_alive: st.servers_alive.iter().cloned().collect(),
            primary_servers: st.primary_servers.iter().cloned().collect(),
            recovery_in_process: st.recovery_in_process.clone(),
        }
    }

    /// A recovery master finished a shard: remap it and bump the view.
    async fn recovery_completed(&self, args: RecoveryCompletedArgs) {
        let mut st = self.state.lock().await;
        st.view
            .shards_to_primaries
            .insert(args.shard, args.server.clone());
        st.view.number += 1;
        st.primary_servers.insert(args.server.clone());
        for shards in st.recovery_in_process.values_mut() {
            shards.retain(|s| *s != args.shard);
        }
        st.recovery_in_process.retain(|_, shards| !shards.is_empty());
        tracing::info!(
            shard = args.shard,
            master = %args.server,
            bytes = args.bytes_received,
            view = st.view.number,
            "shard recovered"
        );
    }

    /// Fan-out recovery for newly dead primaries. Phase A discovers which
    /// surviving backups hold which segments; phase B elects recovery
    /// masters round-robin and hands each its slice of the findings.
    async fn recover(self: Arc<Self>, dead: HashMap<String, Vec<u32>>) {
        tracing::info!(dead = ?dead, "recovery initiated");
        let alive: Vec<String> = {
            let st = self.state.lock().await;
            st.servers_alive.iter().cloned().collect()
        };
        if alive.is_empty() {
            tracing::warn!("no live servers to recover onto");
            return;
        }

        // Phase A: segment discovery.
        let args = QuerySegmentsArgs {
            dead_primaries: dead.keys().cloned().collect(),
        };
        let replies = join_all(alive.iter().map(|host| {
            let args = args.clone();
            let host = host.clone();
            async move {
                let res = rpc::call(&host, &Request::QuerySegments(args)).await;
                (host, res)
            }
        }))
        .await;

        // Seed every lost shard so fully-unreported shards still get a
        // master (and are then reported back as lost).
        let mut sources: HashMap<u32, ShardSources> = HashMap::new();
        for (origin, shards) in &dead {
            for shard in shards {
                sources.insert(
                    *shard,
                    ShardSources {
                        origin: origin.clone(),
                        segments: HashMap::new(),
                    },
                );
            }
        }
        for (host, res) in replies {
            let reply = match res {
                Ok(Reply::QuerySegments(reply)) => reply,
                Ok(other) => {
                    tracing::warn!(server = %host, reply = ?other, "unexpected segment query reply");
                    continue;
                }
                Err(err) => {
                    tracing::debug!(server = %host, error = ?err, "segment query failed");
                    continue;
                }
            };
            for backed in reply.segments {
                for shard in backed.shards {
                    let Some(entry) = sources.get_mut(&shard) else {
                        continue;
                    };
                    if entry.origin != backed.origin {
                        continue;
                    }
                    entry
                        .segments
                        .entry(backed.segment)
                        .or_default()
                        .push(host.clone());
                }
            }
        }

        // Phase B: master election, round-robin over the alive set.
        let mut all_shards: Vec<u32> = sources.keys().copied().collect();
        all_shards.sort_unstable();
        let mut assignments: HashMap<String, HashMap<u32, ShardSources>> = HashMap::new();
        for (i, shard) in all_shards.into_iter().enumerate() {
            let master = alive[i % alive.len()].clone();
            let entry = sources.remove(&shard).expect("shard present in sources");
            assignments.entry(master).or_default().insert(shard, entry);
        }

        let dead_primaries: Vec<String> = dead.keys().cloned().collect();
        for (master, recovery_data) in assignments {
            tracing::info!(master = %master, shards = recovery_data.len(), "electing recovery master");
            let args = ElectRecoveryMasterArgs {
                recovery_data,
                dead_primaries: dead_primaries.clone(),
            };
            tokio::spawn(async move {
                if let Err(err) = rpc::call(&master, &Request::ElectRecoveryMaster(args)).await {
                    tracing::warn!(master = %master, error = ?err, "recovery master election call failed");
                }
            });
        }
    }
}

/// Mark servers dead after `dead_after` without a ping. Shards they owned
/// are unassigned and recorded for recovery; servers already being
/// recovered are skipped.
pub(crate) fn scan_deaths(
    st: &mut ViewState,
    now: Instant,
    dead_after: Duration,
) -> HashMap<String, Vec<u32>> {
    let mut failures = HashMap::new();
    let servers: Vec<String> = st.server_pings.keys().cloned().collect();
    for server in servers {
        let last = st.server_pings[&server];
        if now.saturating_duration_since(last) < dead_after {
            continue;
        }
        if st.recovery_in_process.contains_key(&server) {
            continue;
        }
        let mut owned: Vec<u32> = st
            .view
            .shards_to_primaries
            .iter()
            .filter(|(_, primary)| **primary == server)
            .map(|(shard, _)| *shard)
            .collect();
        owned.sort_unstable();
        for shard in &owned {
            st.view.shards_to_primaries.remove(shard);
        }
        if !owned.is_empty() {
            st.recovery_in_process.insert(server.clone(), owned.clone());
            failures.insert(server.clone(), owned);
        }
        st.servers_alive.remove(&server);
    }
    failures
}

/// Publish view 1 once enough servers are alive: every alive server becomes
/// a primary and shards are dealt round-robin over the sorted set.
pub(crate) fn try_critical_mass(st: &mut ViewState, critical_mass: usize) -> bool {
    if st.servers_alive.len() < critical_mass {
        return false;
    }
    st.primary_servers = st.servers_alive.clone();
    let primaries: Vec<String> = st.primary_servers.iter().cloned().collect();
    let mut shards_to_primaries = HashMap::new();
    for shard in 0..NUMBER_OF_SHARDS {
        shards_to_primaries.insert(shard, primaries[shard as usize % primaries.len()].clone());
    }
    st.view = View {
        number: 1,
        shards_to_primaries,
    };
    st.critical_mass_reached = true;
    true
}

#[async_trait]
impl rpc::Service for ViewServer {
    async fn handle(self: Arc<Self>, req: Request) -> Reply {
        match req {
            Request::Ping(args) => Reply::Ping(self.ping(args).await),
            Request::GetView => Reply::GetView(self.get_view().await),
            Request::Status => Reply::Status(self.status().await),
            Request::RecoveryCompleted(args) => {
                self.recovery_completed(args).await;
                Reply::RecoveryCompleted
            }
            other => Reply::Unexpected(format!("view service does not handle {other:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with_pings(servers: &[&str], base: Instant) -> ViewState {
        ViewState {
            view: View::default(),
            critical_mass_reached: false,
            server_pings: servers
                .iter()
                .map(|s| (s.to_string(), base))
                .collect(),
            servers_alive: servers.iter().map(|s| s.to_string()).collect(),
            primary_servers: BTreeSet::new(),
            recovery_in_process: HashMap::new(),
        }
    }

    #[test]
    fn critical_mass_deals_shards_round_robin() {
        let base = Instant::now();
        let names: Vec<String> = (0..10).map(|i| format!("s{i:02}")).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let mut st = state_with_pings(&refs, base);

        assert!(!try_critical_mass(&mut st, 11));
        assert!(!st.critical_mass_reached);

        assert!(try_critical_mass(&mut st, 10));
        assert!(st.critical_mass_reached);
        assert_eq!(st.view.number, 1);
        assert_eq!(st.view.shards_to_primaries.len(), NUMBER_OF_SHARDS as usize);

        let mut counts: HashMap<&String, usize> = HashMap::new();
        for primary in st.view.shards_to_primaries.values() {
            *counts.entry(primary).or_default() += 1;
        }
        assert_eq!(counts.len(), 10);
        assert!(counts.values().all(|c| *c == 10));
    }

    #[test]
    fn death_scan_unassigns_and_records_once() {
        let base = Instant::now();
        let mut st = state_with_pings(&["s1", "s2"], base);
        try_critical_mass(&mut st, 2);
        let owned_by_s1 = st
            .view
            .shards_to_primaries
            .values()
            .filter(|p| p.as_str() == "s1")
            .count();
        assert!(owned_by_s1 > 0);

        // s2 keeps pinging; s1 goes silent.
        let dead_after = PING_INTERVAL * DEAD_PINGS;
        let later = base + dead_after + Duration::from_millis(1);
        st.server_pings.insert("s2".to_string(), later);

        let failures = scan_deaths(&mut st, later, dead_after);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures["s1"].len(), owned_by_s1);
        assert!(!st.servers_alive.contains("s1"));
        assert!(st.recovery_in_process.contains_key("s1"));
        assert!(st
            .view
            .shards_to_primaries
            .values()
            .all(|p| p.as_str() != "s1"));

        // A second scan must not re-record the same failure.
        let failures = scan_deaths(&mut st, later + Duration::from_secs(1), dead_after);
        assert!(failures.is_empty());
    }

    #[test]
    fn death_scan_spares_live_servers() {
        let base = Instant::now();
        let mut st = state_with_pings(&["s1", "s2"], base);
        try_critical_mass(&mut st, 2);
        let failures = scan_deaths(
            &mut st,
            base + PING_INTERVAL,
            PING_INTERVAL * DEAD_PINGS,
        );
        assert!(failures.is_empty());
        assert_eq!(st.servers_alive.len(), 2);
    }

    #[tokio::test]
    async fn recovery_completed_remaps_and_cleans_up() {
        let server = Arc::new(ViewServer::new(ViewConfig::new("127.0.0.1:7000")));
        {
            let mut st = server.state.lock().await;
            st.view.number = 3;
            st.critical_mass_reached = true;
            st.recovery_in_process
                .insert("dead".to_string(), vec![4, 9]);
        }
        server
            .recovery_completed(RecoveryCompletedArgs {
                server: "master".to_string(),
                shard: 4,
                bytes_received: 123,
            })
            .await;
        let st = server.state.lock().await;
        assert_eq!(st.view.number, 4);
        assert_eq!(
            st.view.primary_for(4),
            Some(&"master".to_string())
        );
        assert_eq!(st.recovery_in_process["dead"], vec![9]);
        assert!(st.primary_servers.contains("master"));
    }
}
