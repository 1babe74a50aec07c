//! Commit parsing and history-dependent statistics.
//!
//! Records must be fed oldest-first: file age and developer experience only
//! reflect commits seen earlier in the same scan.

use regex::Regex;
use std::collections::BTreeSet;

use crate::classifier::Classifier;
use crate::error::Result;
use crate::git::{FIELD_DELIMITER, START_PRETTY, STOP_PRETTY};
use crate::models::{Commit, DeveloperRecord, FileRecord, ScanState, MERGE_LABEL};

pub const DEFAULT_FIX_PATTERN: &str = r"@fix(?:ed)?\(?\s*([A-Za-z-]+[0-9]+)";
pub const DEFAULT_REVIEW_PATTERN: &str = r"@review\(([a-z,]+)\)";
const P4_PATTERN: &str = r#"\[git-p4: depot-paths = "([^"]+)": change = ([0-9]+)\]"#;

const SECONDS_PER_DAY: f64 = 86400.0;
const ROOT: &str = "root";

/// One commit as emitted by the log reader, before parsing.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub parents: String,
    pub hash: String,
    pub author_name: String,
    pub author_email: String,
    pub author_date: String,
    pub timestamp: String,
    pub message: String,
    pub stats: Vec<String>,
}

/// Split the raw log into per-commit records. Records with missing fields
/// are skipped.
pub fn split_log(raw: &str) -> Vec<RawRecord> {
    let mut records = Vec::new();

    for chunk in raw.split(START_PRETTY).skip(1) {
        let Some((pretty, stats)) = chunk.split_once(STOP_PRETTY) else {
            tracing::warn!("Log record without end marker, skipping");
            continue;
        };

        let fields: Vec<&str> = pretty.splitn(7, FIELD_DELIMITER).collect();
        if fields.len() != 7 {
            tracing::warn!("Log record with {} fields, skipping", fields.len());
            continue;
        }

        records.push(RawRecord {
            parents: fields[0].trim().to_string(),
            hash: fields[1].trim().to_string(),
            author_name: fields[2].trim().to_string(),
            author_email: fields[3].trim().to_string(),
            author_date: fields[4].trim().to_string(),
            timestamp: fields[5].trim().to_string(),
            message: fields[6].trim().to_string(),
            stats: stats
                .lines()
                .filter(|l| !l.trim().is_empty())
                .map(String::from)
                .collect(),
        });
    }

    records
}

/// Extracts fix references and reviewers from commit messages.
pub struct CommitParser {
    fix_pattern: Regex,
    review_pattern: Regex,
    p4_pattern: Regex,
}

impl CommitParser {
    pub fn new(fix_pattern: &str, review_pattern: &str) -> Result<Self> {
        Ok(Self {
            fix_pattern: Regex::new(fix_pattern)?,
            review_pattern: Regex::new(review_pattern)?,
            p4_pattern: Regex::new(P4_PATTERN)?,
        })
    }

    /// Depot path and changelist from a git-p4 trailer. The last trailer wins.
    pub fn p4_origin(&self, message: &str) -> Option<(String, String)> {
        self.p4_pattern
            .captures_iter(message)
            .last()
            .map(|caps| (caps[1].to_string(), caps[2].to_string()))
    }

    /// Identifiers referenced as fixed; the last participating group of each
    /// match is the identifier.
    pub fn fixes(&self, message: &str) -> Vec<String> {
        self.fix_pattern
            .captures_iter(message)
            .filter_map(|caps| {
                caps.iter()
                    .skip(1)
                    .flatten()
                    .last()
                    .map(|m| m.as_str().to_string())
            })
            .collect()
    }

    pub fn reviewers(&self, message: &str) -> Vec<String> {
        self.review_pattern
            .captures_iter(message)
            .filter_map(|caps| caps.get(1))
            .flat_map(|m| m.as_str().split(','))
            .filter(|r| !r.is_empty())
            .map(String::from)
            .collect()
    }

    /// Build a commit from its metadata, without statistics.
    pub fn parse(&self, record: &RawRecord, classifier: &dyn Classifier) -> Commit {
        let author_timestamp = record.timestamp.parse::<i64>().unwrap_or_else(|_| {
            tracing::warn!(
                "Unparsable timestamp '{}' on {}, using 0",
                record.timestamp,
                record.hash
            );
            0
        });

        let mut commit = Commit {
            hash: record.hash.clone(),
            parent_hashes: record.parents.split_whitespace().map(String::from).collect(),
            author_name: record.author_name.clone(),
            author_email: record.author_email.clone(),
            author_date: record.author_date.clone(),
            author_timestamp,
            message: record.message.clone(),
            fixes: self.fixes(&record.message),
            reviewers: self.reviewers(&record.message),
            ..Default::default()
        };
        if let Some((path, change)) = self.p4_origin(&record.message) {
            commit.p4_path = path;
            commit.p4_cl = change;
        }

        if commit.is_merge() {
            commit.labels.insert(MERGE_LABEL.to_string(), 100);
        }
        for (label, confidence) in classifier.categorize(&commit.message) {
            commit.labels.entry(label).or_insert(confidence);
        }

        commit
    }
}

/// One `added removed path` numstat line. Non-numeric counts (binary files)
/// are 0.
fn parse_stat_line(line: &str) -> Option<(i64, i64, &str)> {
    let line = line.trim();
    let (added, rest) = line.split_once(char::is_whitespace)?;
    let (removed, path) = rest.trim_start().split_once(char::is_whitespace)?;
    let path = path.trim();
    if path.is_empty() {
        return None;
    }
    Some((
        added.parse().unwrap_or(0),
        removed.parse().unwrap_or(0),
        path,
    ))
}

/// Subsystem and directory of a path.
fn locate(path: &str) -> (String, String) {
    match path.split_once('/') {
        Some((subsystem, _)) => {
            let directory = path
                .rsplit_once('/')
                .map(|(dir, _)| dir)
                .unwrap_or(ROOT);
            (subsystem.to_string(), directory.to_string())
        }
        None => (ROOT.to_string(), ROOT.to_string()),
    }
}

/// Compute the commit's derived metrics from its numstat lines and fold them
/// into the scan state.
pub fn commit_stats(stats: &[String], state: &mut ScanState, commit: &mut Commit) {
    let author = commit.author_email.clone();
    let timestamp = commit.author_timestamp;

    let mut subsystems = BTreeSet::new();
    let mut directories = BTreeSet::new();
    let mut files = BTreeSet::new();

    let mut la = 0i64;
    let mut ld = 0i64;
    let mut nf = 0.0f64;
    let mut age = 0.0f64;
    let mut exp = 0.0f64;
    let mut rexp = 0.0f64;
    let mut sexp = 0.0f64;
    let mut nuc = 0.0f64;
    let mut lt = 0.0f64;
    let mut devs = 0.0f64;

    for line in stats {
        let Some((added, removed, path)) = parse_stat_line(line) else {
            continue;
        };

        match state.files.get_mut(path) {
            Some(file) => {
                nuc += file.changes as f64;
                lt += file.loc as f64;
                age += (timestamp - file.last_changed) as f64 / SECONDS_PER_DAY;

                file.loc += added - removed;
                file.last_changed = timestamp;
                file.changes += 1;
                file.authors.insert(author.clone());
                devs += file.authors.len() as f64;
            }
            None => {
                let file = FileRecord {
                    loc: added - removed,
                    last_changed: timestamp,
                    changes: 1,
                    authors: BTreeSet::from([author.clone()]),
                };
                devs += file.authors.len() as f64;
                state.files.insert(path.to_string(), file);
            }
        }

        let (subsystem, directory) = locate(path);

        match state.developers.get_mut(&author) {
            // First sight of this author contributes no experience
            None => {
                let mut dev = DeveloperRecord::default();
                dev.subsystems.insert(subsystem.clone(), 1);
                state.developers.insert(author.clone(), dev);
            }
            Some(dev) => {
                exp += dev.subsystems.values().map(|&v| v as f64).sum::<f64>();

                // `age` is the running sum over this commit's files so far
                if age != 0.0 {
                    rexp += 1.0 / age + 1.0;
                }

                match dev.subsystems.get_mut(&subsystem) {
                    Some(count) => {
                        sexp += *count as f64;
                        *count += 1;
                    }
                    None => {
                        dev.subsystems.insert(subsystem.clone(), 1);
                    }
                }
            }
        }

        subsystems.insert(subsystem);
        directories.insert(directory);
        files.insert(path.to_string());

        la += added;
        ld += removed;
        nf += 1.0;
    }

    if nf > 0.0 {
        commit.line_added = la;
        commit.line_deleted = ld;
        commit.files = files.len();
        commit.subsystems = subsystems.len();
        commit.directories = directories.len();
        commit.files_changed = files.into_iter().collect();
        commit.age = age / nf;
        commit.devs = devs / nf;
        commit.exp = exp / nf;
        commit.rexp = rexp / nf;
        commit.sexp = sexp / nf;
        commit.unique_change = nuc / nf;
        commit.line_total = lt / nf;
    }
}

/// Parse and measure every record, oldest first.
pub fn scan(
    records: &[RawRecord],
    state: &mut ScanState,
    parser: &CommitParser,
    classifier: &dyn Classifier,
) -> Vec<Commit> {
    let mut commits = Vec::with_capacity(records.len());
    let mut fix_references = 0;

    for (idx, record) in records.iter().enumerate() {
        let mut commit = parser.parse(record, classifier);
        commit_stats(&record.stats, state, &mut commit);
        tracing::debug!(
            "Scanned commit {} ({}/{}): {}",
            commit.short_hash(),
            idx + 1,
            records.len(),
            commit.subject()
        );
        fix_references += commit.fixes.len();
        commits.push(commit);
    }

    let correctives = commits.iter().filter(|c| c.is_corrective()).count();
    let pure = commits
        .iter()
        .filter(|c| c.is_corrective() && c.labels.len() == 1)
        .count();
    tracing::info!(
        "Scanned {} commits: {} corrective ({} purely corrective), {} fix references",
        commits.len(),
        correctives,
        pure,
        fix_references
    );

    commits
}
