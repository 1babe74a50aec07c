use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{MinerError, Result};
use crate::stats::{DEFAULT_FIX_PATTERN, DEFAULT_REVIEW_PATTERN};

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    pub work_dir: PathBuf,
    /// Raw logs and persisted cache payloads
    pub log_dir: PathBuf,
    pub output_dir: PathBuf,
    pub workers: usize,
    pub link_timeout: Duration,
    pub fix_pattern: String,
    pub review_pattern: String,
    pub classifier_dir: Option<PathBuf>,
}

fn parse_var<T: FromStr>(name: &str, value: Option<String>, default: T) -> Result<T> {
    match value {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| MinerError::Config(format!("{} must be a number, got '{}'", name, raw))),
        None => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source; unset variables take their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let work_dir = PathBuf::from(
            lookup("MINER_WORK_DIR").unwrap_or_else(|| "/tmp/commit-miner".into()),
        );
        let log_dir = lookup("MINER_LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| work_dir.join("logs"));
        let output_dir = lookup("MINER_OUTPUT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| work_dir.join("out"));

        let workers: usize = parse_var("MINER_WORKERS", lookup("MINER_WORKERS"), 4)?;
        if workers == 0 {
            return Err(MinerError::Config("MINER_WORKERS must be at least 1".into()));
        }
        let timeout_secs: u64 =
            parse_var("MINER_LINK_TIMEOUT_SECS", lookup("MINER_LINK_TIMEOUT_SECS"), 120)?;

        Ok(Self {
            bind_address: lookup("BIND_ADDRESS").unwrap_or_else(|| "0.0.0.0:8080".into()),
            work_dir,
            log_dir,
            output_dir,
            workers,
            link_timeout: Duration::from_secs(timeout_secs),
            fix_pattern: lookup("MINER_FIX_PATTERN").unwrap_or_else(|| DEFAULT_FIX_PATTERN.into()),
            review_pattern: lookup("MINER_REVIEW_PATTERN")
                .unwrap_or_else(|| DEFAULT_REVIEW_PATTERN.into()),
            classifier_dir: lookup("MINER_CLASSIFIER_DIR").map(PathBuf::from),
        })
    }
}
