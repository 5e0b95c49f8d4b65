//! Error types shared across Nudge crates.

use thiserror::Error;

/// Result alias with [`NudgeError`] as the error type.
pub type Result<T> = std::result::Result<T, NudgeError>;

#[derive(Debug, Error)]
pub enum NudgeError {
    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("variable resolution failed: {0}")]
    Resolver(String),

    #[error("dispatch failed: {0}")]
    Dispatch(String),

    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("gateway error: {0}")]
    Gateway(String),
}
