use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("release {0} has no gzip archive asset")]
    NoArchiveAsset(String),
    #[error("release {tag} has {count} gzip archive assets, expected exactly one")]
    AmbiguousArchiveAsset { tag: String, count: usize },
    #[error("release {0} is already queued or installing")]
    DuplicatePending(String),
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("failed to build http client: {0}")]
    Build(#[source] reqwest::Error),
    #[error("download failed with status {0}")]
    Status(u16),
    #[error("download timed out")]
    Timeout,
    #[error("download failed: {0}")]
    Network(#[source] reqwest::Error),
    #[error("download cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("invalid archive: {0}")]
    Archive(#[source] std::io::Error),
    #[error("failed to write extracted files: {0}")]
    Io(#[source] std::io::Error),
}

/// Fetch-or-extract failure for a single install request. Marks the owning
/// request failed; never escapes the queue worker.
#[derive(Debug, Error)]
pub enum InstallError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
}

#[derive(Debug, Error)]
#[error("failed to launch backend {path}: {source}")]
pub struct ProcessLaunchError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("failed to read tools directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no installed tool named {0}")]
    UnknownTool(String),
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to access settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("settings file is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
}
