//! Error type shared by the project model, the storage layer and the rendering engine.
//!
//! Structural errors (`InvalidLayerReference`, `InvalidIndex`, `InvalidOpacity`,
//! `InvalidEnvelope`) point at a caller bug and are returned immediately. `Storage` and
//! `Renderer` errors are transient; the rendering engine logs them and keeps the previous
//! composite instead of propagating them into the paint path.

use r2d2_sqlite::rusqlite;

#[derive(Debug, thiserror::Error)]
pub enum ProjectError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid layer reference: {0}")]
    InvalidLayerReference(String),

    #[error("Invalid index {index} (layer count: {len})")]
    InvalidIndex { index: usize, len: usize },

    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("Invalid opacity {0} (expected 0.0..=1.0)")]
    InvalidOpacity(f32),

    #[error("Renderer error: {0}")]
    Renderer(String),

    #[error("Internal error: lock poisoned")]
    Poisoned,
}

pub type Result<T> = std::result::Result<T, ProjectError>;

impl From<rusqlite::Error> for ProjectError {
    fn from(e: rusqlite::Error) -> Self {
        ProjectError::Storage(e.to_string())
    }
}

impl From<r2d2::Error> for ProjectError {
    fn from(e: r2d2::Error) -> Self {
        ProjectError::Storage(format!("connection pool: {e}"))
    }
}

impl From<serde_json::Error> for ProjectError {
    fn from(e: serde_json::Error) -> Self {
        ProjectError::Storage(format!("serialization: {e}"))
    }
}

impl From<png::EncodingError> for ProjectError {
    fn from(e: png::EncodingError) -> Self {
        ProjectError::Storage(format!("png encoding: {e}"))
    }
}

impl From<png::DecodingError> for ProjectError {
    fn from(e: png::DecodingError) -> Self {
        ProjectError::Storage(format!("png decoding: {e}"))
    }
}

impl<T> From<std::sync::PoisonError<T>> for ProjectError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        ProjectError::Poisoned
    }
}
