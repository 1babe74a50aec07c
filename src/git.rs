use async_trait::async_trait;
use git2::Repository;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::process::Command;

use crate::error::{MinerError, Result};

/// Marks the start of a commit's metadata block in the log output.
pub const START_PRETTY: &str = "SZZ_START_PRETTY";
/// Marks the end of the metadata block; numstat lines follow.
pub const STOP_PRETTY: &str = "SZZ_STOP_PRETTY";
/// Separates metadata fields.
pub const FIELD_DELIMITER: &str = " SZZ_FIELD ";
/// Opens every wrapped diff line.
pub const LINE_START: &str = ":SZZ_LINE_START:";
/// Closes every wrapped diff line.
pub const LINE_END: &str = ":SZZ_LINE_END:";

/// Parents, hash, author name, author email, author date, unix time, message.
pub fn log_format() -> String {
    format!(
        "--pretty=format:{start}%P{d}%H{d}%an{d}%ae{d}%ad{d}%at{d}%s%n%n%b{stop}",
        start = START_PRETTY,
        d = FIELD_DELIMITER,
        stop = STOP_PRETTY,
    )
}

/// Delimit every line on both ends so tokens can be searched for without
/// colliding with diff content.
pub fn wrap_lines(text: &str) -> String {
    let mut wrapped = String::with_capacity(text.len() + text.lines().count() * 32);
    for line in text.lines() {
        wrapped.push_str(LINE_START);
        wrapped.push_str(line);
        wrapped.push_str(LINE_END);
        wrapped.push('\n');
    }
    wrapped
}

/// Only object names (4 to 64 hex digits) are accepted as a history
/// boundary, anything else could reach git as an option.
pub fn validate_revision(revision: &str) -> Result<()> {
    let valid = (4..=64).contains(&revision.len()) && revision.chars().all(|c| c.is_ascii_hexdigit());
    if valid {
        Ok(())
    } else {
        Err(MinerError::InvalidRevision(revision.to_string()))
    }
}

/// Read the history log, reusing `<log_dir>/log_<name>_<boundary>.log` when a
/// previous run saved one. Failure to produce the log is fatal.
pub async fn read_log(vcs: &dyn Vcs, log_dir: &Path, name: &str, since: Option<&str>) -> Result<String> {
    if let Some(since) = since {
        validate_revision(since)?;
    }
    let path = log_dir.join(format!("log_{}_{}.log", name, since.unwrap_or("all")));

    if tokio::fs::try_exists(&path).await? {
        tracing::info!("Found cached log {:?}", path);
        return Ok(tokio::fs::read_to_string(&path).await?);
    }

    let log = vcs.log(since).await?;
    tokio::fs::create_dir_all(log_dir).await?;
    if let Err(e) = tokio::fs::write(&path, &log).await {
        tracing::warn!("Could not cache log at {:?}: {}", path, e);
    }
    Ok(log)
}

/// A repository replica handed to one linking worker. Dropping it removes
/// any disposable checkout it owns.
pub struct Replica {
    pub vcs: Arc<dyn Vcs>,
    pub dir: Option<TempDir>,
}

/// Version-control operations needed by the miner.
#[async_trait]
pub trait Vcs: Send + Sync {
    fn location(&self) -> &Path;

    /// Full history oldest-first with numstat lines, optionally only the
    /// commits after `since`.
    async fn log(&self, since: Option<&str>) -> Result<String>;

    /// `--unified=0` diff between `parent` and `commit`, every line wrapped
    /// with [`LINE_START`]/[`LINE_END`].
    async fn diff(&self, parent: &str, commit: &str) -> Result<String>;

    /// Paths changed between `parent` and `commit`.
    async fn changed_files(&self, parent: &str, commit: &str) -> Result<Vec<String>>;

    /// Raw `blame -l` output for a single line of `file` at `revision`.
    async fn blame_line(&self, revision: &str, file: &str, line: u32) -> Result<String>;

    /// Provision an isolated replica for worker `index`.
    async fn replicate(&self, index: usize) -> Result<Replica>;
}

/// [`Vcs`] backed by the `git` executable.
pub struct GitCli {
    repo_path: PathBuf,
    work_dir: PathBuf,
}

impl GitCli {
    /// Open a repository, replicas are created under `work_dir`.
    pub fn open(repo_path: impl AsRef<Path>, work_dir: impl AsRef<Path>) -> Result<Self> {
        let repo_path = repo_path.as_ref().to_path_buf();
        Repository::open(&repo_path)
            .map_err(|e| MinerError::NotARepository(format!("{}: {}", repo_path.display(), e.message())))?;

        Ok(Self {
            repo_path,
            work_dir: work_dir.as_ref().to_path_buf(),
        })
    }

    /// Name used for on-disk artifacts derived from this repository.
    pub fn name(&self) -> String {
        self.repo_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "repository".to_string())
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_path)
            .output()
            .await?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            Err(MinerError::Git(format!(
                "git {}: {}",
                args.first().unwrap_or(&""),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

#[async_trait]
impl Vcs for GitCli {
    fn location(&self) -> &Path {
        &self.repo_path
    }

    async fn log(&self, since: Option<&str>) -> Result<String> {
        if let Some(since) = since {
            validate_revision(since)?;
        }
        let format = log_format();
        let range = since.map(|s| format!("{}..HEAD", s));
        let mut args = vec!["log", "--numstat", "--reverse", format.as_str(), "--end-of-options"];
        if let Some(range) = range.as_deref() {
            args.push(range);
        }
        self.run(&args).await
    }

    async fn diff(&self, parent: &str, commit: &str) -> Result<String> {
        let raw = self
            .run(&["diff", "--unified=0", "--no-renames", parent, commit])
            .await?;
        Ok(wrap_lines(&raw))
    }

    async fn changed_files(&self, parent: &str, commit: &str) -> Result<Vec<String>> {
        let out = self
            .run(&["diff", "--name-only", "--no-renames", parent, commit])
            .await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    async fn blame_line(&self, revision: &str, file: &str, line: u32) -> Result<String> {
        let range = format!("-L{},+1", line);
        // --root: root commits print their full hash instead of ^<39 hex>
        self.run(&["blame", "-l", "--root", &range, revision, "--", file]).await
    }

    async fn replicate(&self, index: usize) -> Result<Replica> {
        let source = self.repo_path.clone();
        let work_dir = self.work_dir.clone();

        let dir = tokio::task::spawn_blocking(move || -> Result<TempDir> {
            std::fs::create_dir_all(&work_dir)?;
            let dir = tempfile::Builder::new()
                .prefix(&format!("replica-{}-", index))
                .tempdir_in(&work_dir)?;

            // Local clone: hardlinks objects, no network
            let url = source.to_string_lossy().to_string();
            git2::build::RepoBuilder::new()
                .clone(&url, dir.path())
                .map_err(|e| MinerError::Git(format!("clone {} failed: {}", url, e.message())))?;
            Ok(dir)
        })
        .await
        .map_err(|e| MinerError::Git(format!("replica task failed: {}", e)))??;

        tracing::debug!("Replica {} ready at {:?}", index, dir.path());

        let vcs = GitCli {
            repo_path: dir.path().to_path_buf(),
            work_dir: self.work_dir.clone(),
        };
        Ok(Replica {
            vcs: Arc::new(vcs),
            dir: Some(dir),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStore;
    use crate::classifier::KeywordClassifier;
    use crate::linker::{Coordinator, LinkContext, LinkSettings};
    use crate::models::ScanState;
    use crate::stats::{self, CommitParser, DEFAULT_FIX_PATTERN, DEFAULT_REVIEW_PATTERN};
    use crate::szz::{extract_regions, origin_hash};
    use std::process::Command as StdCommand;
    use std::time::Duration;

    fn git(repo: &Path, args: &[&str]) -> String {
        let output = StdCommand::new("git")
            .args(["-c", "user.name=Dev", "-c", "user.email=dev@x.io", "-c", "commit.gpgsign=false"])
            .args(args)
            .current_dir(repo)
            .output()
            .unwrap();
        assert!(output.status.success(), "git {:?}: {}", args, String::from_utf8_lossy(&output.stderr));
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    /// Root commit importing src/app.go, then a fix rewriting its second line.
    /// Returns the repository path, the root hash and the fix hash.
    fn fixture(dir: &Path) -> (PathBuf, String, String) {
        let repo = dir.join("repo");
        std::fs::create_dir_all(repo.join("src")).unwrap();
        git(&repo, &["init", "-q"]);

        std::fs::write(
            repo.join("src/app.go"),
            "package main\nfunc a() {}\nfunc b() {}\nfunc c() {}\nfunc d() {}\n",
        )
        .unwrap();
        git(&repo, &["add", "."]);
        git(&repo, &["commit", "-q", "-m", "initial import"]);
        let root = git(&repo, &["rev-parse", "HEAD"]);

        std::fs::write(
            repo.join("src/app.go"),
            "package main\nfunc a() { return }\nfunc b() {}\nfunc c() {}\nfunc d() {}\n",
        )
        .unwrap();
        git(&repo, &["commit", "-q", "-am", "@fix(BUG-42) fix crash"]);
        let fix = git(&repo, &["rev-parse", "HEAD"]);

        (repo, root, fix)
    }

    #[tokio::test]
    async fn test_log_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (repo, root, fix) = fixture(dir.path());
        let cli = GitCli::open(&repo, dir.path().join("work")).unwrap();

        let records = stats::split_log(&cli.log(None).await.unwrap());
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].hash, root);
        assert!(records[0].parents.is_empty());
        assert_eq!(records[0].message, "initial import");
        assert_eq!(records[0].stats, vec!["5\t0\tsrc/app.go"]);
        assert_eq!(records[1].hash, fix);
        assert_eq!(records[1].parents, root);
        assert_eq!(records[1].message, "@fix(BUG-42) fix crash");
        assert_eq!(records[1].stats, vec!["1\t1\tsrc/app.go"]);

        let since = stats::split_log(&cli.log(Some(root.as_str())).await.unwrap());
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].hash, fix);
    }

    #[tokio::test]
    async fn test_since_must_be_a_revision() {
        let dir = tempfile::tempdir().unwrap();
        let (repo, _, _) = fixture(dir.path());
        let cli = GitCli::open(&repo, dir.path().join("work")).unwrap();

        let target = dir.path().join("out");
        let option = format!("--output={}", target.display());
        assert!(matches!(cli.log(Some(option.as_str())).await, Err(MinerError::InvalidRevision(_))));
        assert!(!dir.path().join("out..HEAD").exists());
        assert!(!target.exists());

        let logs = dir.path().join("logs");
        assert!(matches!(
            read_log(&cli, &logs, "repo", Some("../../escape")).await,
            Err(MinerError::InvalidRevision(_))
        ));
        assert!(validate_revision("2becfd1f").is_ok());
        assert!(validate_revision("HEAD~1").is_err());
    }

    #[tokio::test]
    async fn test_diff_regions_and_root_origin() {
        let dir = tempfile::tempdir().unwrap();
        let (repo, root, fix) = fixture(dir.path());
        let cli = GitCli::open(&repo, dir.path().join("work")).unwrap();

        let diff = cli.diff(&root, &fix).await.unwrap();
        let files = cli.changed_files(&root, &fix).await.unwrap();
        assert_eq!(files, vec!["src/app.go"]);

        let regions = extract_regions(&diff, &files, &KeywordClassifier::with_defaults());
        assert_eq!(regions.get("src/app.go"), Some(&vec![2]));

        let blame = cli.blame_line(&root, "src/app.go", 2).await.unwrap();
        let origin = origin_hash(&blame).unwrap();
        assert_eq!(origin.len(), 40);
        assert_eq!(origin, root);
    }

    #[tokio::test]
    async fn test_rename_keeps_removed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let (repo, _, fix) = fixture(dir.path());
        git(&repo, &["mv", "src/app.go", "src/main.go"]);
        std::fs::write(
            repo.join("src/main.go"),
            "package main\nfunc a() { return }\nfunc b() {}\nfunc c() { panic() }\nfunc d() {}\n",
        )
        .unwrap();
        git(&repo, &["commit", "-q", "-am", "move app into main"]);
        let moved = git(&repo, &["rev-parse", "HEAD"]);
        let cli = GitCli::open(&repo, dir.path().join("work")).unwrap();

        let files = cli.changed_files(&fix, &moved).await.unwrap();
        assert!(files.contains(&"src/app.go".to_string()));
        assert!(files.contains(&"src/main.go".to_string()));

        let diff = cli.diff(&fix, &moved).await.unwrap();
        let regions = extract_regions(&diff, &files, &KeywordClassifier::with_defaults());
        assert_eq!(regions.get("src/app.go"), Some(&vec![1, 2, 3, 4, 5]));
    }

    #[tokio::test]
    async fn test_link_commits_on_replicas() {
        let dir = tempfile::tempdir().unwrap();
        let (repo, root, fix) = fixture(dir.path());
        let work = dir.path().join("work");
        let cli = GitCli::open(&repo, &work).unwrap();

        let classifier = Arc::new(KeywordClassifier::with_defaults());
        let parser = CommitParser::new(DEFAULT_FIX_PATTERN, DEFAULT_REVIEW_PATTERN).unwrap();
        let records = stats::split_log(&cli.log(None).await.unwrap());
        let mut commits = stats::scan(&records, &mut ScanState::default(), &parser, classifier.as_ref());

        let coordinator = Coordinator::new(
            LinkContext {
                cache: Arc::new(CacheStore::new()),
                classifier,
                reports: None,
                persistence: None,
                repository_id: "repo".to_string(),
            },
            LinkSettings {
                workers: 2,
                timeout: Duration::from_secs(60),
            },
        );
        let links = coordinator.link_commits(Arc::new(cli), &mut commits).await;

        assert_eq!(links.get(&root), Some(&[fix.clone()][..]));
        assert!(commits[0].contains_bug);
        assert_eq!(commits[0].fix_hashes, vec![fix]);
        assert!(commits[1].linked);

        let leftovers = std::fs::read_dir(&work)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("replica-"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_open_invalid_repo() {
        let dir = tempfile::tempdir().unwrap();
        let result = GitCli::open(dir.path().join("missing"), dir.path());
        assert!(matches!(result, Err(MinerError::NotARepository(_))));
    }

    #[test]
    fn test_wrap_lines() {
        let wrapped = wrap_lines("@@ -1 +1 @@\n-old\n+new\n");
        assert_eq!(
            wrapped,
            ":SZZ_LINE_START:@@ -1 +1 @@:SZZ_LINE_END:\n\
             :SZZ_LINE_START:-old:SZZ_LINE_END:\n\
             :SZZ_LINE_START:+new:SZZ_LINE_END:\n"
        );
    }

    #[tokio::test]
    async fn test_read_log_reuses_cached_file() {
        let dir = tempfile::tempdir().unwrap();
        let vcs = crate::szz::tests::FakeVcs {
            log: "fresh".to_string(),
            ..Default::default()
        };

        assert_eq!(read_log(&vcs, dir.path(), "repo", None).await.unwrap(), "fresh");
        assert!(dir.path().join("log_repo_all.log").exists());

        std::fs::write(dir.path().join("log_repo_abc1.log"), "stale").unwrap();
        assert_eq!(read_log(&vcs, dir.path(), "repo", Some("abc1")).await.unwrap(), "stale");
    }

    #[test]
    fn test_log_format_sentinels() {
        let format = log_format();
        assert!(format.starts_with("--pretty=format:SZZ_START_PRETTY%P SZZ_FIELD %H"));
        assert!(format.ends_with("%bSZZ_STOP_PRETTY"));
        assert_eq!(format.matches(FIELD_DELIMITER).count(), 6);
    }
}
