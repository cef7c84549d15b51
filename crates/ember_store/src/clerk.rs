//! Clerks: thin typed clients over the RPC transport.

use anyhow::Context;

use crate::proto::{
    ErrCode, GetArgs, PingArgs, PutArgs, RecoveryCompletedArgs, Reply, Request, StatusReply, View,
};
use crate::{key2shard, rpc, PING_INTERVAL};

/// Client of the view service, used by servers (ping plane), recovery
/// masters (completion reports), and operators (status).
#[derive(Clone, Debug)]
pub struct ViewClerk {
    me: String,
    server: String,
}

impl ViewClerk {
    pub fn new(me: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            me: me.into(),
            server: server.into(),
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    /// Report liveness; returns the current view and the alive set.
    pub async fn ping(&self, view_number: u64) -> anyhow::Result<(View, Vec<String>)> {
        let args = PingArgs {
            server: self.me.clone(),
            view_number,
        };
        match rpc::call(&self.server, &Request::Ping(args)).await? {
            Reply::Ping(reply) => Ok((reply.view, reply.servers_alive)),
            other => anyhow::bail!("unexpected ping reply: {other:?}"),
        }
    }

    pub async fn get(&self) -> anyhow::Result<View> {
        match rpc::call(&self.server, &Request::GetView).await? {
            Reply::GetView(reply) => Ok(reply.view),
            other => anyhow::bail!("unexpected view reply: {other:?}"),
        }
    }

    pub async fn status(&self) -> anyhow::Result<StatusReply> {
        match rpc::call(&self.server, &Request::Status).await? {
            Reply::Status(reply) => Ok(reply),
            other => anyhow::bail!("unexpected status reply: {other:?}"),
        }
    }

    pub async fn recovery_completed(&self, shard: u32, bytes_received: u64) -> anyhow::Result<()> {
        let args = RecoveryCompletedArgs {
            server: self.me.clone(),
            shard,
            bytes_received,
        };
        match rpc::call(&self.server, &Request::RecoveryCompleted(args)).await? {
            Reply::RecoveryCompleted => Ok(()),
            other => anyhow::bail!("unexpected recovery-completed reply: {other:?}"),
        }
    }
}

/// Key/value clerk: caches a view, routes by shard, retries forever.
pub struct Clerk {
    vs: ViewClerk,
    view: View,
    client_id: i64,
    request_id: i64,
}

impl Clerk {
    pub fn new(view_server: impl Into<String>) -> Self {
        Self {
            vs: ViewClerk::new("clerk", view_server),
            view: View::default(),
            client_id: rand::random(),
            request_id: 0,
        }
    }

    /// Fetch the value for `key`, or the empty string for a key that was
    /// never put. Retries until a primary answers.
    pub async fn get(&mut self, key: &str) -> String {
        if !self.view.is_valid() {
            self.refresh_view().await;
        }
        loop {
            let shard = key2shard(key);
            if let Some(primary) = self.view.primary_for(shard).cloned() {
                let args = GetArgs {
                    key: key.to_string(),
                };
                if let Ok(Reply::Get(reply)) = rpc::call(&primary, &Request::Get(args)).await {
                    match reply.err {
                        ErrCode::Ok => return reply.value,
                        ErrCode::NoKey => return String::new(),
                        // WrongServer (or anything else): view is stale.
                        _ => {}
                    }
                }
            }
            self.refresh_view().await;
            tokio::time::sleep(PING_INTERVAL).await;
        }
    }

    /// Store `value` under `key`. Retries until a primary accepts; the
    /// request id keeps retries idempotent on the server.
    pub async fn put(&mut self, key: &str, value: &str) {
        if !self.view.is_valid() {
            self.refresh_view().await;
        }
        self.request_id += 1;
        let args = PutArgs {
            client: self.client_id,
            request: self.request_id,
            key: key.to_string(),
            value: value.to_string(),
        };
        loop {
            let shard = key2shard(key);
            if let Some(primary) = self.view.primary_for(shard).cloned() {
                if let Ok(Reply::Put(reply)) =
                    rpc::call(&primary, &Request::Put(args.clone())).await
                {
                    if reply.err == ErrCode::Ok {
                        return;
                    }
                }
            }
            self.refresh_view().await;
            tokio::time::sleep(PING_INTERVAL).await;
        }
    }

    /// The latest view as the view service reports it.
    pub async fn view(&mut self) -> anyhow::Result<View> {
        self.view = self.vs.get().await.context("fetch view")?;
        Ok(self.view.clone())
    }

    async fn refresh_view(&mut self) {
        if let Ok(view) = self.vs.get().await {
            self.view = view;
        }
    }
}
