//! The dispatcher: the central coordinator. Accepts
//! `status`, `register`, `dispatch` and `results` over the shared wire
//! protocol, and runs two background loops — a health monitor and a
//! redistributor — that keep the registry and commit bookkeeping
//! consistent with the live runner pool.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::assignment::Commits;
use crate::commit::CommitId;
use crate::config::Config;
use crate::proto::{self, Request};
use crate::registry::{RegisterError, Registry, RunnerDescriptor};
use crate::store::Store;

pub struct Dispatcher {
    registry: Registry,
    commits: Commits,
    store: Store,
    config: Config,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub fn new(results_dir: impl Into<PathBuf>, config: Config) -> Arc<Self> {
        Arc::new(Self {
            registry: Registry::new(),
            commits: Commits::new(),
            store: Store::new(results_dir),
            config,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Binds `addr`, starts the background loops, and serves connections
    /// until the shutdown token fires. Returns the bound address (useful
    /// when `addr`'s port is 0).
    pub async fn serve(self: Arc<Self>, addr: SocketAddr) -> anyhow::Result<SocketAddr> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding dispatcher to {addr}"))?;
        let bound = listener.local_addr().context("reading bound address")?;
        info!("dispatcher listening on {bound}");

        let health = tokio::spawn(self.clone().health_monitor());
        let redistribute = tokio::spawn(self.clone().redistributor());

        let accept_loop = {
            let this = self.clone();
            async move {
                loop {
                    let (stream, peer) = match listener.accept().await {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("accept failed: {e}");
                            continue;
                        }
                    };
                    debug!("accepted connection from {peer}");
                    let this = this.clone();
                    tokio::spawn(async move {
                        if let Err(e) = this.handle_connection(stream).await {
                            warn!("connection from {peer} failed: {e}");
                        }
                    });
                }
            }
        };

        tokio::select! {
            _ = accept_loop => {}
            _ = self.shutdown.cancelled() => info!("dispatcher shutting down"),
        }
        health.abort();
        redistribute.abort();
        Ok(bound)
    }

    async fn handle_connection(self: &Arc<Self>, mut stream: TcpStream) -> anyhow::Result<()> {
        let request = proto::read_request(&mut stream).await;
        let reply = match request {
            Ok(Request::Simple { command, tail }) => self.dispatch_simple(&command, tail),
            Ok(Request::Results { commit, payload, .. }) => self.handle_results(commit, payload).await,
            Err(e) => {
                debug!("malformed request: {e}");
                e.to_string()
            }
        };
        proto::write_reply(&mut stream, &reply)
            .await
            .context("writing reply")
    }

    /// Handles everything except `results`, which needs to be async for
    /// the store write. Spawns background assignment work but never
    /// blocks on it.
    fn dispatch_simple(self: &Arc<Self>, command: &str, tail: Option<String>) -> String {
        match command {
            "status" => "OK".to_string(),
            "register" => self.handle_register(tail),
            "dispatch" => self.handle_dispatch(tail),
            _ => "Unknown command".to_string(),
        }
    }

    fn handle_register(&self, tail: Option<String>) -> String {
        let Some(arg) = tail else {
            return "Missing runner info".to_string();
        };
        let Some((host, port_str)) = arg.rsplit_once(':') else {
            return format!("Invalid registration: missing port in {arg:?}");
        };
        let port: u16 = match port_str.parse() {
            Ok(p) => p,
            Err(e) => return format!("Invalid registration: {e}"),
        };
        if host.is_empty() {
            return "Invalid registration: empty host".to_string();
        }
        let descriptor = RunnerDescriptor::new(host, port);
        match self.registry.register(descriptor) {
            Ok(()) => {
                info!("registered runner {host}:{port}");
                "OK".to_string()
            }
            Err(RegisterError::AlreadyRegistered) => RegisterError::AlreadyRegistered.to_string(),
        }
    }

    /// Rejects a missing or malformed commit id instead of dispatching it
    /// verbatim. This is a deliberate extension: commit ids flow back out
    /// onto the wire unescaped, in both `runtest:<commit>` and
    /// `results:<commit>:<length>:<payload>`, so one containing `:` or a
    /// newline would corrupt those messages for every runner it touches.
    fn handle_dispatch(self: &Arc<Self>, tail: Option<String>) -> String {
        let Some(arg) = tail else {
            return "Invalid dispatch: missing commit id".to_string();
        };
        let commit = match CommitId::parse(&arg) {
            Ok(c) => c,
            Err(e) => return format!("Invalid dispatch: {e}"),
        };
        if self.registry.is_empty() {
            return "No runners available".to_string();
        }
        if self.commits.begin_assigning(&commit) {
            let this = self.clone();
            tokio::spawn(async move { this.assign_with_retry(commit).await });
        }
        "OK".to_string()
    }

    async fn handle_results(&self, commit: String, payload: String) -> String {
        match self.store.save(&commit, &payload).await {
            Ok(()) => {
                if let Ok(commit_id) = CommitId::parse(&commit) {
                    self.commits.clear_assignment(&commit_id);
                } else {
                    warn!("results for malformed commit id {commit:?} saved but assignment couldn't be cleared");
                }
                info!("results received for commit {commit}");
                "OK".to_string()
            }
            Err(e) => format!("Error saving results: {e}"),
        }
    }

    /// The assignment procedure: try every registered
    /// runner in order; the first `OK` wins. Retries forever on a
    /// backoff until a runner accepts or the dispatcher shuts down.
    async fn assign_with_retry(self: Arc<Self>, commit: CommitId) {
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }
            let snapshot = self.registry.snapshot();
            for runner in snapshot {
                if self.shutdown.is_cancelled() {
                    return;
                }
                match self.try_assign_to(&commit, &runner).await {
                    Ok(true) => {
                        self.commits.assign(commit.clone(), runner.clone());
                        info!("dispatched commit {commit} to runner {}:{}", runner.host, runner.port);
                        return;
                    }
                    Ok(false) => continue,
                    Err(e) => {
                        debug!("error dispatching {commit} to {}:{}: {e}", runner.host, runner.port);
                        continue;
                    }
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.dispatch_retry_backoff()) => {},
                _ = self.shutdown.cancelled() => return,
            }
        }
    }

    async fn try_assign_to(&self, commit: &CommitId, runner: &RunnerDescriptor) -> std::io::Result<bool> {
        let addr = runner.socket_addr()?;
        let reply = proto::exchange(addr, &format!("runtest:{commit}")).await?;
        Ok(reply == "OK")
    }

    /// Pings every registered runner roughly every `health_check_interval`.
    /// Any non-`pong` reply or transport error evicts the runner.
    async fn health_monitor(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.health_check_interval()) => {},
                _ = self.shutdown.cancelled() => return,
            }
            for runner in self.registry.snapshot() {
                let healthy = match runner.socket_addr() {
                    Ok(addr) => matches!(proto::exchange(addr, "ping").await.as_deref(), Ok("pong")),
                    Err(_) => false,
                };
                if !healthy {
                    self.evict(&runner);
                }
            }
        }
    }

    fn evict(&self, runner: &RunnerDescriptor) {
        if self.registry.evict(runner) {
            let orphaned = self.commits.evict_runner(runner);
            warn!(
                "evicted unresponsive runner {}:{}, requeued {} commit(s)",
                runner.host,
                runner.port,
                orphaned.len()
            );
        }
    }

    /// Drains the pending queue roughly every `redistribute_interval` and
    /// re-kicks off assignment for each drained commit.
    async fn redistributor(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.redistribute_interval()) => {},
                _ = self.shutdown.cancelled() => return,
            }
            for commit in self.commits.drain_pending() {
                if self.commits.begin_assigning(&commit) {
                    info!("redistributing commit {commit}");
                    let this = self.clone();
                    tokio::spawn(async move { this.assign_with_retry(commit).await });
                }
            }
        }
    }

    #[cfg(test)]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    #[cfg(test)]
    pub fn commits(&self) -> &Commits {
        &self.commits
    }

    #[cfg(test)]
    pub fn store(&self) -> &Store {
        &self.store
    }
}
