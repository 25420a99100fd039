//! Error types for the artifact upload pipeline.
//!
//! This module defines a unified error enumeration used across the checksum,
//! prepare, and upload stages, the local cache, and the GraphQL backend
//! client. It integrates with `thiserror` to provide rich `Display`
//! implementations and error source chaining where applicable.
//!
//! Notes:
//! - Each variant carries contextual details via its message payload.
//! - Variants are grouped to match the error taxonomy: transient,
//!   URL-expired, non-retryable, filesystem, protocol, and cancellation.

use thiserror::Error;

#[derive(Error, Debug)]
/// Unified error enumeration for the artifact upload pipeline.
///
/// - Used across checksum/prepare/upload stages, the local cache, and the backend client.
/// - Implements `std::error::Error` via `thiserror`.
pub enum ArtifactError {
    /// Network timeout, 5xx, 429, or an object-store "RequestTimeout" 400.
    /// Retried with backoff by the caller up to its configured budget.
    #[error("transient error talking to {0}: {1}")]
    Transient(&'static str, String),

    /// A presigned URL returned 401/403 and must be refreshed before retrying.
    #[error("presigned URL for `{0}` has expired")]
    UrlExpired(String),

    /// 400/403/404/409 with a non-retryable body; the file fails immediately.
    #[error("non-retryable error uploading `{0}`: {1}")]
    NonRetryable(String, String),

    /// Source file vanished between enqueue and checksum/upload time.
    #[error("source file `{0}` no longer exists")]
    SourceVanished(String),

    /// Local disk write failed (staging copy or cache write).
    #[error("local filesystem error at `{0}`: {1}")]
    Filesystem(String, #[source] std::io::Error),

    /// Unexpected server state or missing response field.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An artifact reached a server state this pipeline does not know how to continue from.
    #[error("unexpected artifact state `{0}` for artifact {1}")]
    UnexpectedArtifactState(String, String),

    /// Two manifests that should hash identically produced different digests.
    #[error("manifest digest mismatch: expected {0}, computed {1}")]
    ManifestDigestMismatch(String, String),

    /// A requested object does not exist in the local cache or backend.
    #[error("object not found: {0}")]
    ObjectNotFound(String),

    /// Cooperative cancellation was observed.
    #[error("operation cancelled")]
    Cancelled,

    /// At least one file in the artifact failed; commit was suppressed.
    #[error("artifact {0} failed: {1} file(s) could not be uploaded ({2})")]
    ArtifactFailed(String, usize, String),

    /// I/O error from an underlying reader or writer.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Error performing or decoding an HTTP request.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Error encoding or decoding JSON (manifest, GraphQL payload).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic custom error for miscellaneous failures.
    #[error("{0}")]
    Custom(String),
}

impl ArtifactError {
    /// True if this error class should be retried by the caller's backoff loop.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ArtifactError::Transient(_, _) | ArtifactError::UrlExpired(_))
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ArtifactError>;
