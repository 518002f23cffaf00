//! The runner: a single-slot TCP server that accepts
//! `ping`/`runtest`, executes the update and test hooks for an assigned
//! commit, and posts results back to the dispatcher.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context};
use log::{info, warn};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::commit::CommitId;
use crate::config::Config;
use crate::hooks::{self, HookOutcome};
use crate::proto::{self, Request};

pub struct Runner {
    repo_path: PathBuf,
    host: String,
    dispatcher_addr: String,
    update_script: PathBuf,
    test_script: PathBuf,
    config: Config,
    busy: Mutex<bool>,
    last_communication: Mutex<Instant>,
    shutdown: CancellationToken,
}

impl Runner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo_path: impl Into<PathBuf>,
        host: impl Into<String>,
        dispatcher_addr: impl Into<String>,
        update_script: impl Into<PathBuf>,
        test_script: impl Into<PathBuf>,
        config: Config,
    ) -> Arc<Self> {
        Arc::new(Self {
            repo_path: repo_path.into(),
            host: host.into(),
            dispatcher_addr: dispatcher_addr.into(),
            update_script: update_script.into(),
            test_script: test_script.into(),
            config,
            busy: Mutex::new(false),
            last_communication: Mutex::new(Instant::now()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Binds, registers with the dispatcher using the *actual* bound
    /// port (the port-zero binding design note), starts the liveness
    /// watcher, and serves connections until shutdown.
    pub async fn serve(self: Arc<Self>, bind_addr: SocketAddr) -> anyhow::Result<SocketAddr> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("binding runner to {bind_addr}"))?;
        let bound = listener.local_addr().context("reading bound address")?;
        self.register_with_dispatcher(bound.port()).await?;
        info!("runner listening on {bound}, registered as {}:{}", self.host, bound.port());

        let watcher = tokio::spawn(self.clone().liveness_watcher());

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
            _ = self.shutdown.cancelled() => info!("runner shutting down"),
        }
        watcher.abort();
        Ok(bound)
    }

    async fn register_with_dispatcher(&self, port: u16) -> anyhow::Result<()> {
        let addr = proto::resolve(&self.dispatcher_addr).context("resolving dispatcher address")?;
        let msg = format!("register:{}:{port}", self.host);
        let reply = proto::exchange(addr, &msg).await.context("registering with dispatcher")?;
        if reply != "OK" {
            bail!("dispatcher rejected registration: {reply}");
        }
        Ok(())
    }

    async fn handle_connection(self: &Arc<Self>, mut stream: TcpStream) -> anyhow::Result<()> {
        let reply = match proto::read_request(&mut stream).await {
            Ok(Request::Simple { command, tail }) => self.handle_command(&command, tail),
            Ok(Request::Results { .. }) => "Unknown command".to_string(),
            Err(e) => e.to_string(),
        };
        proto::write_reply(&mut stream, &reply).await.context("writing reply")
    }

    fn handle_command(self: &Arc<Self>, command: &str, tail: Option<String>) -> String {
        match command {
            "ping" => {
                *self.last_communication.lock() = Instant::now();
                "pong".to_string()
            }
            "runtest" => self.handle_runtest(tail),
            _ => "Unknown command".to_string(),
        }
    }

    fn handle_runtest(self: &Arc<Self>, tail: Option<String>) -> String {
        let Some(arg) = tail else {
            return "Invalid runtest: missing commit id".to_string();
        };
        let commit = match CommitId::parse(&arg) {
            Ok(c) => c,
            Err(e) => return format!("Invalid runtest: {e}"),
        };
        let mut busy = self.busy.lock();
        if *busy {
            return "BUSY".to_string();
        }
        *busy = true;
        drop(busy);

        let this = self.clone();
        tokio::spawn(async move { this.execute(commit).await });
        "OK".to_string()
    }

    /// Runs the update-then-test hook pair for `commit`, posts the
    /// result, and clears `busy`. Never retries a failed post — the
    /// dispatcher's eviction path picks up the slack.
    async fn execute(self: Arc<Self>, commit: CommitId) {
        let payload = self.run_hooks(&commit).await;
        let msg = format!("results:{commit}:{}:{payload}", payload.len());
        let reply = match proto::resolve(&self.dispatcher_addr) {
            Ok(addr) => proto::exchange(addr, &msg).await,
            Err(e) => Err(e),
        };
        match reply {
            Ok(reply) if reply == "OK" => info!("posted results for {commit}"),
            Ok(reply) => warn!("dispatcher rejected results for {commit}: {reply}"),
            Err(e) => warn!("failed to post results for {commit}: {e}"),
        }
        *self.busy.lock() = false;
    }

    async fn run_hooks(&self, commit: &CommitId) -> String {
        let update = match hooks::update_to_commit(&self.update_script, &self.repo_path, commit).await {
            Ok(outcome) => outcome,
            Err(e) => HookOutcome {
                success: false,
                output: format!("failed to invoke update hook: {e}"),
            },
        };
        if !update.success {
            return format!("Error updating repository: {}", update.output);
        }
        match hooks::run_tests(&self.test_script, &self.repo_path).await {
            Ok(outcome) => outcome.output,
            Err(e) => format!("failed to invoke test hook: {e}"),
        }
    }

    /// Optional dispatcher-liveness watcher: if no `ping`
    /// has arrived within the heartbeat timeout, check in with `status`
    /// and shut down if the dispatcher is unreachable.
    async fn liveness_watcher(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.heartbeat_timeout()) => {},
                _ = self.shutdown.cancelled() => return,
            }
            let idle = self.last_communication.lock().elapsed();
            if idle < self.config.heartbeat_timeout() {
                continue;
            }
            let reply = match proto::resolve(&self.dispatcher_addr) {
                Ok(addr) => proto::exchange(addr, "status").await,
                Err(e) => Err(e),
            };
            match reply {
                Ok(reply) if reply == "OK" => {}
                _ => {
                    warn!("dispatcher unreachable after {idle:?} idle, shutting down");
                    self.shutdown.cancel();
                    return;
                }
            }
        }
    }

    #[cfg(test)]
    pub fn is_busy(&self) -> bool {
        *self.busy.lock()
    }
}
