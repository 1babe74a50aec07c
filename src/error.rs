use thiserror::Error;

#[derive(Debug, Error)]
pub enum MinerError {
    #[error("Not a git repository: {0}")]
    NotARepository(String),

    #[error("Invalid revision: {0}")]
    InvalidRevision(String),

    #[error("Git command failed: {0}")]
    Git(String),

    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Report fetch failed: {0}")]
    Report(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MinerError>;
