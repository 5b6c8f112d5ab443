// llama-engine/src/error.rs
//
// Error types for the engine, its configuration and model acquisition.

use std::path::PathBuf;

use thiserror::Error;

use crate::native::NativeFault;

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

/// Errors surfaced by [`crate::Engine`] operations.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// The operation is not allowed from the current lifecycle state.
    #[error("cannot {operation} in state {current} (requires {required})")]
    IllegalStateTransition {
        operation: &'static str,
        current: &'static str,
        required: &'static str,
    },

    /// Pre-flight validation of a model path failed; no native call was made.
    #[error("invalid model path {}: {reason}", path.display())]
    InvalidModelPath { path: PathBuf, reason: &'static str },

    /// The native loader rejected the model format.
    #[error("unsupported model architecture: {}", path.display())]
    UnsupportedArchitecture { path: PathBuf },

    #[error("I/O failure: {0}")]
    IoFailure(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Native library bring-up failed. The engine instance was not created.
    #[error("failed to load native library: {0}")]
    NativeLibrary(String),

    #[error("native call failed: {0}")]
    Native(#[from] NativeFault),

    #[error("engine has been destroyed")]
    Destroyed,

    #[error("execution serializer unavailable: {0}")]
    Serializer(String),
}

impl EngineError {
    /// Whether the error left the engine in the `Error` state, requiring `clean_up`.
    pub fn requires_clean_up(&self) -> bool {
        matches!(
            self,
            EngineError::UnsupportedArchitecture { .. } | EngineError::IoFailure(_)
        )
    }
}

/// Errors raised while fetching a model file.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server responded with status {0}")]
    Status(u16),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("download stalled: no data received for {0} seconds")]
    Stalled(u64),

    #[error("downloaded file too small: {actual} bytes (expected at least {expected})")]
    TooSmall { actual: u64, expected: u64 },
}

/// Errors raised while reading an [`crate::EngineConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}
