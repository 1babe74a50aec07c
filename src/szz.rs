//! SZZ core: modified regions of a corrective commit and the commits that
//! last touched them before the fix.

use std::collections::BTreeSet;
use std::path::Path;

use crate::cache::{self, CacheStore, BLAME_BUCKET, DIFF_BUCKET, FILE_LIST_BUCKET};
use crate::classifier::Classifier;
use crate::error::{MinerError, Result};
use crate::git::{Vcs, LINE_END, LINE_START};
use crate::models::{Commit, RegionMap};

const FILE_SEPARATOR: &str = "diff --git";
const HUNK_MARKER: &str = "@@";

fn extension(file: &str) -> Option<&str> {
    Path::new(file).extension().and_then(|e| e.to_str())
}

/// Old-side path from a section header such as ` a/src/app.go b/src/app.go`.
fn section_file(header: &str) -> Option<&str> {
    let first_line = header.split(LINE_END).next()?.trim();
    let old = first_line.strip_prefix("a/")?;
    let path = old.split(" b/").next()?;
    (!path.is_empty()).then_some(path)
}

/// Starting pre-image line of a hunk header (` -101,3 +101,1 `); `None`
/// when the range is not a removal range.
fn removal_start(line_info: &str) -> Option<u32> {
    let range = line_info.split_whitespace().next()?;
    let start = range.strip_prefix('-')?;
    let start = start.split(',').next()?;
    start.parse().ok()
}

/// Parse a line-wrapped `--unified=0` diff into modified/deleted pre-image
/// lines for the changed source files.
pub fn extract_regions(diff: &str, files_modified: &[String], classifier: &dyn Classifier) -> RegionMap {
    let mut regions = RegionMap::new();

    for file in files_modified {
        let file = file.trim();
        if file.is_empty() {
            continue;
        }
        if extension(file).is_some_and(|ext| classifier.is_code_extension(ext)) {
            regions.insert(file.to_string(), Vec::new());
        }
    }

    let file_split = format!("{}{}", LINE_START, FILE_SEPARATOR);
    let hunk_split = format!("{}{}", LINE_START, HUNK_MARKER);
    let removed_marker = format!("{}-", LINE_START);

    for section in diff.split(file_split.as_str()).skip(1) {
        let mut chunks = section.split(hunk_split.as_str());
        let header = chunks.next().unwrap_or_default();

        let Some(file) = section_file(header) else {
            continue;
        };
        let Some(lines) = regions.get_mut(file) else {
            continue;
        };

        // Binary sections have no hunks, the loop body never runs
        for chunk in chunks {
            let Some((line_info, body)) = chunk.split_once(HUNK_MARKER) else {
                tracing::debug!("Malformed hunk in {}, skipping", file);
                continue;
            };
            let Some(mut current) = removal_start(line_info) else {
                continue;
            };

            let body_lines: Vec<&str> = body.split(LINE_END).collect();
            if body_lines.len() < 2 {
                continue;
            }

            // First piece closes the hunk header, last is trailing text
            for section in &body_lines[1..body_lines.len() - 1] {
                if section.contains(removed_marker.as_str()) {
                    lines.push(current);
                    current += 1;
                }
            }
        }
    }

    regions
}

/// Fetch a cached payload or produce it with `produce`, caching failures as
/// empty payloads.
async fn cached<F, Fut>(cache: &CacheStore, bucket: &str, key: &str, produce: F) -> String
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<String>>,
{
    if let Some(hit) = cache.fetch(bucket, key) {
        return hit;
    }
    let value = match produce().await {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!("{} failed, caching empty result: {}", key, e);
            String::new()
        }
    };
    cache.put_persisted(bucket, key, value.clone()).await;
    value
}

/// Diff the corrective commit against its first parent and extract its
/// regions. Root commits have no regions.
pub async fn modified_regions(
    vcs: &dyn Vcs,
    cache: &CacheStore,
    classifier: &dyn Classifier,
    commit: &Commit,
) -> RegionMap {
    let Some(parent) = commit.first_parent() else {
        return RegionMap::new();
    };

    let diff = cached(cache, DIFF_BUCKET, &cache::diff_key(parent, &commit.hash), || {
        vcs.diff(parent, &commit.hash)
    })
    .await;

    let files = cached(
        cache,
        FILE_LIST_BUCKET,
        &cache::file_list_key(parent, &commit.hash),
        || async {
            let files = vcs.changed_files(parent, &commit.hash).await?;
            Ok::<_, MinerError>(files.join("\n"))
        },
    )
    .await;

    let files: Vec<String> = files.lines().map(String::from).collect();
    extract_regions(&diff, &files, classifier)
}

/// First token of a `blame -l` line, without the boundary marker.
pub fn origin_hash(blame: &str) -> Option<String> {
    let token = blame.split_whitespace().next()?;
    let token = token.trim_start_matches('^');
    (!token.is_empty()).then(|| token.to_string())
}

/// Commits that last modified each region as of the commit's parent.
pub async fn annotate(
    vcs: &dyn Vcs,
    cache: &CacheStore,
    regions: &RegionMap,
    commit: &Commit,
) -> BTreeSet<String> {
    let mut origins = BTreeSet::new();
    let Some(parent) = commit.first_parent() else {
        return origins;
    };

    for (file, lines) in regions {
        for &line in lines.iter().filter(|&&l| l != 0) {
            let key = cache::blame_key(line, &commit.hash, file);
            let blame = cached(cache, BLAME_BUCKET, &key, || vcs.blame_line(parent, file, line)).await;
            if let Some(origin) = origin_hash(&blame) {
                origins.insert(origin);
            }
        }
    }

    origins
}
