use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CarrosselError {
    #[error("Store error at {path}: {source}")]
    Store {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Profile not found: {0}")]
    ProfileNotFound(String),

    #[error("Campaign not found: {0}")]
    CampaignNotFound(String),

    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Another batch is already running")]
    Busy,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}
