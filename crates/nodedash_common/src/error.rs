//! Error types for nodedash.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NodedashError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Update error: {0}")]
    Update(#[from] UpdateError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Rejections from the update orchestrator's entry points.
///
/// Failures of an update run itself are not errors here: they end up in the
/// status snapshot and on the event hub.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpdateError {
    #[error("An update is already in progress")]
    AlreadyRunning,

    #[error("No restart is pending")]
    RestartNotRequired,

    #[error("No update is available")]
    NoUpdateAvailable,
}

impl UpdateError {
    pub fn code(&self) -> u16 {
        match self {
            UpdateError::AlreadyRunning => 409,
            UpdateError::RestartNotRequired => 409,
            UpdateError::NoUpdateAvailable => 404,
        }
    }
}
