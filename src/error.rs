use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BkLensError {
    #[error("Cache file {path} is corrupt: {reason} (delete or repair it)")]
    CacheCorrupt { path: PathBuf, reason: String },

    #[error("Failed to persist cache to {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Fetching builds failed after {pages} page(s): {reason}")]
    Fetch { pages: usize, reason: String },

    #[error("Analysis produced no result: {0}")]
    Analysis(String),

    #[error("API request failed with status {status}: {message}")]
    ApiError { status: u16, message: String },

    #[error("API request failed with status {status} after {retries} retries")]
    ApiErrorAfterRetries { status: u16, retries: u32 },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BkLensError>;
