use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

use crate::error::Result;

/// Change-type labelling of commit messages and source-file recognition.
pub trait Classifier: Send + Sync {
    /// Label -> confidence (0-100) for the given message text.
    fn categorize(&self, text: &str) -> BTreeMap<String, u8>;

    /// Whether a file extension (without the dot) denotes source code.
    fn is_code_extension(&self, ext: &str) -> bool;
}

const DEFAULT_CATEGORIES: &[(&str, &[&str])] = &[
    (
        "corrective",
        &["fix", "bug", "defect", "error", "fail", "crash", "wrong", "issue", "problem", "patch"],
    ),
    (
        "feature",
        &["add", "new", "feature", "implement", "support", "introduce", "create"],
    ),
    (
        "perfective",
        &["refactor", "clean", "improve", "simplify", "rename", "reorganize", "optimiz"],
    ),
    (
        "non-functional",
        &["doc", "readme", "license", "comment", "typo", "format", "style"],
    ),
];

const DEFAULT_CODE_EXTENSIONS: &[&str] = &[
    "c", "cc", "cpp", "cxx", "h", "hh", "hpp", "cs", "java", "kt", "scala", "go", "rs", "py",
    "rb", "php", "js", "jsx", "ts", "tsx", "m", "mm", "swift", "sh", "pl", "lua", "r", "sql",
    "clj", "erl", "ex", "exs", "hs", "ml", "fs", "vb", "groovy", "dart",
];

/// Keyword classifier: a message belongs to a category when any of its
/// words contains one of the category keywords (case-insensitive).
pub struct KeywordClassifier {
    categories: BTreeMap<String, Vec<String>>,
    code_extensions: HashSet<String>,
}

impl KeywordClassifier {
    pub fn new(
        categories: BTreeMap<String, Vec<String>>,
        code_extensions: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            categories: categories
                .into_iter()
                .map(|(k, words)| (k, words.into_iter().map(|w| w.to_lowercase()).collect()))
                .collect(),
            code_extensions: code_extensions
                .into_iter()
                .map(|e| e.to_lowercase())
                .collect(),
        }
    }

    pub fn with_defaults() -> Self {
        let categories = DEFAULT_CATEGORIES
            .iter()
            .map(|(name, words)| {
                (
                    name.to_string(),
                    words.iter().map(|w| w.to_string()).collect(),
                )
            })
            .collect();
        Self::new(
            categories,
            DEFAULT_CODE_EXTENSIONS.iter().map(|e| e.to_string()),
        )
    }

    /// Load `<category>.csv` keyword files and an optional `extensions.txt`
    /// (one extension per line) from `dir`. Missing pieces fall back to the
    /// built-in lists.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let defaults = Self::with_defaults();
        let mut categories = BTreeMap::new();
        let mut code_extensions = defaults.code_extensions.clone();

        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().map(|n| n.to_string_lossy().to_string()) else {
                continue;
            };

            if let Some(category) = name.strip_suffix(".csv") {
                let words = fs::read_to_string(&path)?
                    .split([',', '\n'])
                    .map(|w| w.trim().to_string())
                    .filter(|w| !w.is_empty())
                    .collect();
                categories.insert(category.to_string(), words);
            } else if name == "extensions.txt" {
                code_extensions = fs::read_to_string(&path)?
                    .lines()
                    .map(|l| l.trim().trim_start_matches('.').to_lowercase())
                    .filter(|l| !l.is_empty())
                    .collect();
            }
        }

        if categories.is_empty() {
            categories = defaults.categories;
        }

        tracing::info!(
            "Loaded classifier from {:?}: {} categories, {} code extensions",
            dir,
            categories.len(),
            code_extensions.len()
        );

        Ok(Self::new(categories, code_extensions))
    }
}

impl Classifier for KeywordClassifier {
    fn categorize(&self, text: &str) -> BTreeMap<String, u8> {
        let words: Vec<String> = text.split_whitespace().map(str::to_lowercase).collect();

        let matched: Vec<&String> = self
            .categories
            .iter()
            .filter(|(_, keywords)| {
                words
                    .iter()
                    .any(|w| keywords.iter().any(|k| w.contains(k.as_str())))
            })
            .map(|(name, _)| name)
            .collect();

        if matched.is_empty() {
            return BTreeMap::new();
        }

        let confidence = (100 / matched.len()) as u8;
        matched
            .into_iter()
            .map(|name| (name.clone(), confidence))
            .collect()
    }

    fn is_code_extension(&self, ext: &str) -> bool {
        self.code_extensions.contains(&ext.to_lowercase())
    }
}
