use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::models::{Commit, Report};

/// Fetches bug reports referenced by fix identifiers.
#[async_trait]
pub trait ReportLinker: Send + Sync {
    async fn fetch(&self, id: &str) -> Result<Report>;

    fn db_name(&self) -> String;
}

/// Durable sink for mined commits, links and reports.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn sync_commit(&self, commit: &Commit) -> Result<()>;

    async fn is_buggy(&self, commit: &Commit, repository_id: &str) -> Result<()>;

    async fn is_linked(&self, commit: &Commit, repository_id: &str) -> Result<()>;

    async fn sync_reports(&self, reports: &[Report], repository_id: &str, commit_hash: &str) -> Result<()>;
}

#[derive(Serialize)]
struct Marker<'a> {
    repository_id: &'a str,
    hash: &'a str,
    fix_hashes: &'a [String],
}

#[derive(Serialize)]
struct ReportLink<'a> {
    repository_id: &'a str,
    commit_hash: &'a str,
    report: &'a Report,
}

/// Append-only JSON-lines files: `commits.jsonl`, `buggy.jsonl`,
/// `linked.jsonl` and `reports.jsonl`.
pub struct JsonlStore {
    dir: PathBuf,
    commits: Mutex<File>,
    buggy: Mutex<File>,
    linked: Mutex<File>,
    reports: Mutex<File>,
}

async fn open_append(path: &Path) -> Result<Mutex<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path).await?;
    Ok(Mutex::new(file))
}

async fn append<T: Serialize>(file: &Mutex<File>, value: &T) -> Result<()> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    let mut file = file.lock().await;
    file.write_all(&line).await?;
    file.flush().await?;
    Ok(())
}

impl JsonlStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self {
            commits: open_append(&dir.join("commits.jsonl")).await?,
            buggy: open_append(&dir.join("buggy.jsonl")).await?,
            linked: open_append(&dir.join("linked.jsonl")).await?,
            reports: open_append(&dir.join("reports.jsonl")).await?,
            dir,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl Persistence for JsonlStore {
    async fn sync_commit(&self, commit: &Commit) -> Result<()> {
        append(&self.commits, commit).await
    }

    async fn is_buggy(&self, commit: &Commit, repository_id: &str) -> Result<()> {
        let marker = Marker {
            repository_id,
            hash: &commit.hash,
            fix_hashes: &commit.fix_hashes,
        };
        append(&self.buggy, &marker).await
    }

    async fn is_linked(&self, commit: &Commit, repository_id: &str) -> Result<()> {
        let marker = Marker {
            repository_id,
            hash: &commit.hash,
            fix_hashes: &[],
        };
        append(&self.linked, &marker).await
    }

    async fn sync_reports(&self, reports: &[Report], repository_id: &str, commit_hash: &str) -> Result<()> {
        for report in reports {
            let link = ReportLink {
                repository_id,
                commit_hash,
                report,
            };
            append(&self.reports, &link).await?;
        }
        Ok(())
    }
}
