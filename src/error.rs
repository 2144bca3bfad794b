//! Error types for Tellwatch

use thiserror::Error;

/// Errors that can occur while configuring the detector or persisting sessions.
///
/// Missing signal (short heart-rate history, no face, zero-area cheek crops)
/// is not an error; those paths return `None` and the frame continues.
#[derive(Debug, Error)]
pub enum TellError {
    #[error("Invalid JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid landmarks: {0}")]
    InvalidLandmarks(String),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Emotion classifier failed: {0}")]
    Classifier(String),

    #[error("No active session")]
    NoActiveSession,
}
