//! Error types for the derivative pipeline.
//!
//! Each collaborator boundary has its own error:
//! - `SourceError` - the byte provider could not produce the asset's bytes
//! - `CodecError` - the codec rejected or failed to render the source
//! - `StorageError` - the durable tier failed (always recovered locally)
//!
//! Only `ThumbnailError` ever reaches an observer.

use std::io;
use thiserror::Error;

/// Failure to read an asset's source bytes.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The asset was deleted or moved since it was cataloged
    #[error("source not found: {0}")]
    NotFound(String),

    #[error("failed to read source: {0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Other(String),
}

/// Failure inside the codec.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("no decodable image data in source ({0} bytes)")]
    NoImageData(usize),

    #[error("failed to decode image: {0}")]
    Decode(#[source] image::ImageError),

    #[error("failed to encode derivative: {0}")]
    Encode(#[source] image::ImageError),

    #[error("codec task failed: {0}")]
    Task(String),

    #[error("{0}")]
    Other(String),
}

/// Failure in the durable tier. Never surfaced to observers.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("storage task failed: {0}")]
    Task(String),

    #[error("corrupt derivative record for key {0}")]
    Corrupt(String),
}

/// Error reported through [`PipelineObserver::on_error`](crate::pipeline::PipelineObserver::on_error).
///
/// Cloneable so that the same failure can be fanned out to channel consumers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ThumbnailError {
    /// The byte provider failed (asset deleted, moved or unreadable)
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// The codec failed (malformed input, unsupported format, resource exhaustion)
    #[error("codec failure: {0}")]
    CodecFailure(String),

    /// A worker item panicked; the worker itself keeps running
    #[error("internal pipeline error: {0}")]
    Internal(String),
}

impl From<SourceError> for ThumbnailError {
    fn from(e: SourceError) -> Self {
        ThumbnailError::SourceUnavailable(e.to_string())
    }
}

impl From<CodecError> for ThumbnailError {
    fn from(e: CodecError) -> Self {
        ThumbnailError::CodecFailure(e.to_string())
    }
}

/// Invalid or unreadable configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}
