use thiserror::Error;

use crate::provider::ProviderKind;

/// All errors produced by voxgate-core.
#[derive(Debug, Error)]
pub enum VoxgateError {
    #[error("inference error: {0}")]
    Inference(String),

    #[error("ONNX session error: {0}")]
    OnnxSession(String),

    #[error("model file not found: {path}")]
    ModelNotFound { path: std::path::PathBuf },

    #[error("{kind} provider '{provider}' is unavailable")]
    ProviderUnavailable {
        kind: ProviderKind,
        provider: String,
    },

    #[error("no {1} factory registered for provider '{0}'")]
    UnknownProvider(String, ProviderKind),

    #[error("provider request failed: {0}")]
    Provider(String),

    #[cfg(feature = "cloud")]
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("audio processing error: {0}")]
    Audio(String),

    #[error("session {0} is closed")]
    SessionClosed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, VoxgateError>;
