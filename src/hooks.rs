//! External collaborators: the git update scripts and the
//! test discovery/execution engine are out of this crate's scope — we
//! only specify their contract and invoke them as subprocesses,
//! capturing combined stdout+stderr as an opaque payload, per the
//! "subprocess isolation" design note. This keeps the core free of any
//! dependency on a particular test framework.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::process::Command;

use crate::commit::CommitId;

/// The outcome of an external hook invocation: whether it exited
/// cleanly, and its combined stdout+stderr.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookOutcome {
    pub success: bool,
    pub output: String,
}

async fn run_script(
    script: &Path,
    args: impl IntoIterator<Item = impl AsRef<OsStr>>,
    cwd: Option<&Path>,
) -> Result<HookOutcome> {
    let mut cmd = Command::new(script);
    cmd.args(args);
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }
    let output = cmd
        .output()
        .await
        .with_context(|| format!("spawning hook {script:?}"))?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok(HookOutcome {
        success: output.status.success(),
        output: combined,
    })
}

/// `update-to-commit(repo_path, commit)`: checks out
/// `commit` in `repo_path`.
pub async fn update_to_commit(script: &Path, repo_path: &Path, commit: &CommitId) -> Result<HookOutcome> {
    run_script(script, [repo_path.as_os_str(), commit.as_str().as_ref()], None).await
}

/// `run-tests(repo_path)`: runs whatever test suite is
/// discovered under `repo_path/tests`. The runner never interprets
/// this output beyond treating it as the result payload.
pub async fn run_tests(script: &Path, repo_path: &Path) -> Result<HookOutcome> {
    run_script(script, [repo_path.as_os_str()], Some(repo_path)).await
}

/// `poll-for-new-commit(repo_path)`: pulls latest and, if a
/// new commit exists, leaves the `.commit_id` sentinel in the hook's
/// working directory. This implementation runs the hook with `cwd` set
/// to `repo_path`, so the sentinel lives at `repo_path/.commit_id`
/// rather than depending on the observer process's own working
/// directory.
pub async fn poll_for_new_commit(script: &Path, repo_path: &Path) -> Result<HookOutcome> {
    run_script(script, [repo_path.as_os_str()], Some(repo_path)).await
}

pub const SENTINEL_FILENAME: &str = ".commit_id";

pub fn sentinel_path(cwd: &Path) -> PathBuf {
    cwd.join(SENTINEL_FILENAME)
}

/// Reads and parses the sentinel, if present. Trailing whitespace is
/// ignored.
pub async fn read_sentinel(cwd: &Path) -> Result<Option<CommitId>> {
    let path = sentinel_path(cwd);
    match tokio::fs::read_to_string(&path).await {
        Ok(content) => {
            let commit = CommitId::parse(content.trim())
                .map_err(|e| anyhow::anyhow!("sentinel file {:?} held an invalid commit id: {e}", path))?;
            Ok(Some(commit))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("reading sentinel {:?}", path)),
    }
}

/// Deletes the sentinel after a successful dispatch.
pub async fn remove_sentinel(cwd: &Path) -> Result<()> {
    let path = sentinel_path(cwd);
    tokio::fs::remove_file(&path)
        .await
        .with_context(|| format!("removing sentinel {:?}", path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    async fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        tokio::fs::write(&path, body).await.unwrap();
        let mut perms = tokio::fs::metadata(&path).await.unwrap().permissions();
        perms.set_mode(0o755);
        tokio::fs::set_permissions(&path, perms).await.unwrap();
        path
    }

    #[tokio::test]
    async fn update_to_commit_captures_combined_output_on_failure() {
        let dir = TempDir::new().unwrap();
        let script = write_script(
            dir.path(),
            "update.sh",
            indoc! {"
                #!/bin/sh
                echo out-line
                echo err-line >&2
                exit 1
            "},
        )
        .await;
        let outcome = update_to_commit(&script, dir.path(), &CommitId::parse("abc").unwrap())
            .await
            .unwrap();
        assert!(!outcome.success);
        assert!(outcome.output.contains("out-line"));
        assert!(outcome.output.contains("err-line"));
    }

    #[tokio::test]
    async fn run_tests_reports_success() {
        let dir = TempDir::new().unwrap();
        let script = write_script(dir.path(), "run_tests.sh", "#!/bin/sh\necho ok\nexit 0\n").await;
        let outcome = run_tests(&script, dir.path()).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.output.trim(), "ok");
    }

    #[tokio::test]
    async fn sentinel_roundtrip() {
        let dir = TempDir::new().unwrap();
        assert!(read_sentinel(dir.path()).await.unwrap().is_none());
        tokio::fs::write(sentinel_path(dir.path()), "  abc123  \n").await.unwrap();
        let commit = read_sentinel(dir.path()).await.unwrap().unwrap();
        assert_eq!(commit.as_str(), "abc123");
        remove_sentinel(dir.path()).await.unwrap();
        assert!(read_sentinel(dir.path()).await.unwrap().is_none());
    }
}
