//! The runner manager: keeps a target number of runner
//! processes alive, pruning exited children and spawning replacements,
//! and signals them all to terminate on shutdown.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use log::{info, warn};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::config::Config;

pub struct RunnerManager {
    repo_path: PathBuf,
    dispatcher_addr: String,
    runner_bin: PathBuf,
    desired_count: usize,
    config: Config,
    children: Mutex<Vec<Child>>,
    shutdown: CancellationToken,
}

impl RunnerManager {
    pub fn new(
        repo_path: impl Into<PathBuf>,
        dispatcher_addr: impl Into<String>,
        runner_bin: impl Into<PathBuf>,
        desired_count: usize,
        config: Config,
    ) -> Arc<Self> {
        Arc::new(Self {
            repo_path: repo_path.into(),
            dispatcher_addr: dispatcher_addr.into(),
            runner_bin: runner_bin.into(),
            desired_count,
            config,
            children: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn run(self: Arc<Self>) {
        loop {
            self.maintain();
            tokio::select! {
                _ = tokio::time::sleep(self.config.runner_pool_check_interval()) => {},
                _ = self.shutdown.cancelled() => {
                    self.terminate_all();
                    return;
                }
            }
        }
    }

    /// Prunes exited children, then spawns fresh ones until
    /// `desired_count` is met.
    fn maintain(&self) {
        let mut children = self.children.lock();
        children.retain_mut(|child| match child.try_wait() {
            Ok(Some(status)) => {
                info!("runner process exited: {status}");
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!("failed to poll runner process: {e}");
                true
            }
        });
        while children.len() < self.desired_count {
            match self.spawn_runner() {
                Ok(child) => children.push(child),
                Err(e) => {
                    warn!("failed to spawn runner: {e}");
                    break;
                }
            }
        }
    }

    fn spawn_runner(&self) -> std::io::Result<Child> {
        Command::new(&self.runner_bin)
            .arg(&self.repo_path)
            .arg("--dispatcher-server")
            .arg(&self.dispatcher_addr)
            .arg("--port")
            .arg("0")
            .stdin(Stdio::null())
            .spawn()
    }

    fn terminate_all(&self) {
        let children = self.children.lock();
        for child in children.iter() {
            let Some(pid) = child.id() else { continue };
            if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                warn!("failed to signal runner pid {pid}: {e}");
            }
        }
        info!("signalled {} runner(s) to terminate", children.len());
    }

    #[cfg(test)]
    pub fn live_count(&self) -> usize {
        self.children.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> String {
        "127.0.0.1:8888".to_string()
    }

    #[tokio::test]
    async fn maintain_spawns_up_to_desired_count() {
        let manager = RunnerManager::new("/tmp/repo", addr(), "/bin/sleep", 3, Config::default());
        // `/bin/sleep` with no args exits immediately with a usage error,
        // but it does spawn, which is all `maintain` checks synchronously.
        manager.maintain();
        assert_eq!(manager.live_count(), 3);
    }

    #[tokio::test]
    async fn maintain_prunes_exited_children() {
        let manager = RunnerManager::new("/tmp/repo", addr(), "/bin/true", 2, Config::default());
        manager.maintain();
        assert_eq!(manager.live_count(), 2);
        // Give the (short-lived) children time to exit.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        manager.maintain();
        assert_eq!(manager.live_count(), 2);
    }
}
