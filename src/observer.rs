//! The repository observer: polls a working copy for new
//! commits via an external hook and notifies the dispatcher, using the
//! `.commit_id` sentinel file to guarantee at-least-once dispatch across
//! observer or dispatcher outages.

use std::path::PathBuf;
use std::sync::Arc;

use log::{info, warn};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::hooks;
use crate::proto;

pub struct Observer {
    repo_path: PathBuf,
    dispatcher_addr: String,
    poll_script: PathBuf,
    config: Config,
    shutdown: CancellationToken,
}

impl Observer {
    pub fn new(
        repo_path: impl Into<PathBuf>,
        dispatcher_addr: impl Into<String>,
        poll_script: impl Into<PathBuf>,
        config: Config,
    ) -> Arc<Self> {
        Arc::new(Self {
            repo_path: repo_path.into(),
            dispatcher_addr: dispatcher_addr.into(),
            poll_script: poll_script.into(),
            config,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn run(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval()) => {},
                _ = self.shutdown.cancelled() => return,
            }
            self.poll_once().await;
        }
    }

    async fn poll_once(&self) {
        let outcome = match hooks::poll_for_new_commit(&self.poll_script, &self.repo_path).await {
            Ok(o) => o,
            Err(e) => {
                warn!("failed to invoke poll hook: {e}");
                return;
            }
        };
        if !outcome.success {
            warn!("poll hook exited non-zero: {}", outcome.output);
            return;
        }

        let commit = match hooks::read_sentinel(&self.repo_path).await {
            Ok(Some(commit)) => commit,
            Ok(None) => return,
            Err(e) => {
                warn!("failed to read sentinel: {e}");
                return;
            }
        };

        if let Err(e) = self.notify(&commit).await {
            warn!("aborting dispatch cycle for {commit}: {e}");
        }
    }

    async fn notify(&self, commit: &crate::commit::CommitId) -> anyhow::Result<()> {
        let addr = proto::resolve(&self.dispatcher_addr)?;
        let status = proto::exchange(addr, "status").await?;
        anyhow::ensure!(status == "OK", "dispatcher status check failed: {status}");

        let reply = proto::exchange(addr, &format!("dispatch:{commit}")).await?;
        anyhow::ensure!(reply == "OK", "dispatch rejected: {reply}");

        hooks::remove_sentinel(&self.repo_path).await?;
        info!("dispatched commit {commit}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn write_script(dir: &std::path::Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        tokio::fs::write(&path, body).await.unwrap();
        let mut perms = tokio::fs::metadata(&path).await.unwrap().permissions();
        use std::os::unix::fs::PermissionsExt;
        perms.set_mode(0o755);
        tokio::fs::set_permissions(&path, perms).await.unwrap();
        path
    }

    /// A dispatcher stand-in that replies a fixed canned response to
    /// every request, and records each command it saw.
    async fn scripted_dispatcher(replies: Vec<&'static str>) -> (SocketAddr, Arc<tokio::sync::Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        tokio::spawn(async move {
            let mut replies = replies.into_iter();
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                let reply = replies.next().unwrap_or("OK");
                let seen = seen_clone.clone();
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 4096];
                    loop {
                        let n = stream.read(&mut chunk).await.unwrap_or(0);
                        if n == 0 {
                            break;
                        }
                        buf.extend_from_slice(&chunk[..n]);
                    }
                    seen.lock().await.push(String::from_utf8_lossy(&buf).into_owned());
                    let _ = stream.write_all(reply.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });
        (addr, seen)
    }

    #[test_log::test(tokio::test)]
    async fn dispatches_and_clears_sentinel_on_success() {
        let dir = TempDir::new().unwrap();
        let script = write_script(
            dir.path(),
            "poll.sh",
            "#!/bin/sh\necho newcommit > .commit_id\nexit 0\n",
        )
        .await;
        let (addr, seen) = scripted_dispatcher(vec!["OK", "OK"]).await;
        let observer = Observer::new(dir.path(), addr.to_string(), script, Config::default());
        observer.poll_once().await;

        assert!(hooks::read_sentinel(dir.path()).await.unwrap().is_none());
        let seen = seen.lock().await;
        assert_eq!(seen.as_slice(), ["status", "dispatch:newcommit"]);
    }

    #[test_log::test(tokio::test)]
    async fn no_sentinel_means_no_dispatch() {
        let dir = TempDir::new().unwrap();
        let script = write_script(dir.path(), "poll.sh", "#!/bin/sh\nexit 0\n").await;
        let (addr, seen) = scripted_dispatcher(vec![]).await;
        let observer = Observer::new(dir.path(), addr.to_string(), script, Config::default());
        observer.poll_once().await;
        assert!(seen.lock().await.is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn aborted_cycle_keeps_sentinel_for_retry() {
        let dir = TempDir::new().unwrap();
        let script = write_script(
            dir.path(),
            "poll.sh",
            "#!/bin/sh\necho stillhere > .commit_id\nexit 0\n",
        )
        .await;
        let (addr, _seen) = scripted_dispatcher(vec!["dispatcher busy, no thanks"]).await;
        let observer = Observer::new(dir.path(), addr.to_string(), script, Config::default());
        observer.poll_once().await;
        assert_eq!(
            hooks::read_sentinel(dir.path()).await.unwrap().unwrap().as_str(),
            "stillhere"
        );
    }
}
