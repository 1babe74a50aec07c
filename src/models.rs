use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

pub const MERGE_LABEL: &str = "Merge";
pub const CORRECTIVE_LABEL: &str = "corrective";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Commit {
    pub repository_id: String,
    pub hash: String,
    pub parent_hashes: Vec<String>,
    pub author_name: String,
    pub author_email: String,
    pub author_date: String,
    pub author_timestamp: i64,
    pub message: String,
    pub fixes: Vec<String>,
    pub reviewers: Vec<String>,
    /// Depot path and changelist of commits imported by git-p4
    pub p4_path: String,
    pub p4_cl: String,
    /// Change-type label -> confidence (0-100)
    pub labels: BTreeMap<String, u8>,
    pub linked: bool,
    pub contains_bug: bool,
    /// Corrective commits that traced a defect back to this one
    pub fix_hashes: Vec<String>,
    pub subsystems: usize,
    pub directories: usize,
    pub files: usize,
    /// Reserved, never computed
    pub entropy: f64,
    pub line_added: i64,
    pub line_deleted: i64,
    pub line_total: f64,
    pub files_changed: Vec<String>,
    pub devs: f64,
    pub age: f64,
    pub unique_change: f64,
    pub exp: f64,
    pub rexp: f64,
    pub sexp: f64,
}

impl Commit {
    pub fn is_merge(&self) -> bool {
        self.parent_hashes.len() == 2
    }

    pub fn is_corrective(&self) -> bool {
        self.labels.contains_key(CORRECTIVE_LABEL)
    }

    pub fn first_parent(&self) -> Option<&str> {
        self.parent_hashes.first().map(String::as_str)
    }

    pub fn subject(&self) -> &str {
        self.message.lines().next().unwrap_or("")
    }

    pub fn authored_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.author_timestamp, 0).single()
    }

    pub fn short_hash(&self) -> &str {
        &self.hash[..self.hash.len().min(8)]
    }
}

/// Per-path state carried through one ordered history scan.
#[derive(Debug, Clone, Default)]
pub struct FileRecord {
    pub loc: i64,
    pub last_changed: i64,
    pub changes: u32,
    pub authors: BTreeSet<String>,
}

/// Per-author subsystem touch counts carried through one ordered history scan.
#[derive(Debug, Clone, Default)]
pub struct DeveloperRecord {
    pub subsystems: HashMap<String, u32>,
}

/// Cross-commit state of a statistics scan. Discarded when the scan ends.
#[derive(Debug, Default)]
pub struct ScanState {
    pub files: HashMap<String, FileRecord>,
    pub developers: HashMap<String, DeveloperRecord>,
}

/// File path -> 1-based pre-image line numbers modified or deleted by a commit.
pub type RegionMap = BTreeMap<String, Vec<u32>>;

/// Origin (bug-introducing) hash -> corrective hashes referencing it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BugLinks {
    links: BTreeMap<String, Vec<String>>,
}

impl BugLinks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, origin: &str, corrective: &str) {
        let fixes = self.links.entry(origin.to_string()).or_default();
        if !fixes.iter().any(|f| f == corrective) {
            fixes.push(corrective.to_string());
        }
    }

    /// Fold one corrective commit's origins into the mapping.
    pub fn merge<'a>(&mut self, corrective: &str, origins: impl IntoIterator<Item = &'a String>) {
        for origin in origins {
            self.record(origin, corrective);
        }
    }

    pub fn get(&self, origin: &str) -> Option<&[String]> {
        self.links.get(origin).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Mark every commit that is an origin as buggy and attach its fixes.
    /// Returns the number of commits marked.
    pub fn annotate(&self, commits: &mut [Commit]) -> usize {
        let mut marked = 0;
        for commit in commits.iter_mut() {
            if let Some(fixes) = self.get(&commit.hash) {
                commit.contains_bug = true;
                commit.fix_hashes = fixes.to_vec();
                marked += 1;
            }
        }
        marked
    }
}

/// A bug report as returned by a report linker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Report {
    pub external_id: String,
    pub title: String,
    pub severity: String,
    pub status: String,
    pub opened_at: Option<String>,
    pub closed_at: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit(hash: &str) -> Commit {
        Commit {
            hash: hash.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_bug_links_dedupes_correctives() {
        let mut links = BugLinks::new();
        let origins = vec!["a1".to_string(), "b2".to_string()];
        links.merge("fix1", &origins);
        links.merge("fix1", &origins);
        links.merge("fix2", &origins[..1]);

        assert_eq!(links.len(), 2);
        assert_eq!(links.get("a1").unwrap(), ["fix1", "fix2"]);
        assert_eq!(links.get("b2").unwrap(), ["fix1"]);
    }

    #[test]
    fn test_annotate_marks_origins() {
        let mut links = BugLinks::new();
        links.record("a1", "fix1");
        let mut commits = vec![commit("a1"), commit("c3")];

        assert_eq!(links.annotate(&mut commits), 1);
        assert!(commits[0].contains_bug);
        assert_eq!(commits[0].fix_hashes, vec!["fix1"]);
        assert!(!commits[1].contains_bug);
    }

    #[test]
    fn test_merge_detection_and_subject() {
        let c = Commit {
            parent_hashes: vec!["p1".into(), "p2".into()],
            message: "Merge branch 'x'\n\nbody".into(),
            author_timestamp: 1_577_872_800,
            ..Default::default()
        };
        assert!(c.is_merge());
        assert_eq!(c.subject(), "Merge branch 'x'");
        assert_eq!(c.authored_at().unwrap().timestamp(), 1_577_872_800);
    }
}
