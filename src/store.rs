//! The result store: a directory of per-commit result
//! files. The dispatcher is the only writer; a reporter would be the
//! reader, but rendering results is out of this crate's scope — only
//! the on-disk contract (filename = commit id, contents = payload)
//! matters here.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub struct Store {
    dir: PathBuf,
}

impl Store {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Persists `payload` under filename `commit`, creating the store
    /// directory if needed. Overwrites are allowed and expected
    /// (last-writer-wins).
    pub async fn save(&self, commit: &str, payload: &str) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating result store dir {:?}", self.dir))?;
        let path = self.path_for(commit);
        tokio::fs::write(&path, payload)
            .await
            .with_context(|| format!("writing result file {:?}", path))
    }

    pub fn path_for(&self, commit: &str) -> PathBuf {
        self.dir.join(commit)
    }

    pub async fn load(&self, commit: &str) -> Result<String> {
        let path = self.path_for(commit);
        tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading result file {:?}", path))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
