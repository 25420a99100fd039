//! Tagged-union event types carried on each stage's input channel.
//!
//! Each stage is a single long-lived task driven by one `mpsc` receiver; a
//! sum type here stands in for the dynamic-dispatch "job" objects a
//! thread-pool model would use, matching the scheduler choice recorded for
//! the upload dispatcher.

use crate::errors::ArtifactError;
use crate::manifest::Manifest;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::oneshot;

/// A request to checksum, stage, and (eventually) upload one file.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub local_path: PathBuf,
    pub save_name: String,
    pub artifact_id: Option<String>,
    pub artifact_manifest_id: Option<String>,
    /// Present for the manifest's own L0 upload; signals the prepare-flow path.
    pub md5: Option<String>,
    pub copied: bool,
    pub digest: Option<String>,
}

impl UploadRequest {
    pub fn new(local_path: PathBuf, save_name: impl Into<String>) -> Self {
        Self {
            local_path,
            save_name: save_name.into(),
            artifact_id: None,
            artifact_manifest_id: None,
            md5: None,
            copied: false,
            digest: None,
        }
    }
}

/// Hooks run by the upload dispatcher around a commit mutation. Returns a
/// boxed future rather than being itself `async fn` since trait objects
/// cannot carry async methods directly.
pub type CommitHook = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = Result<(), ArtifactError>> + Send>> + Send>;

/// Input events accepted by the checksum stage.
pub enum ChecksumEvent {
    Upload {
        path: PathBuf,
        save_name: String,
        artifact_id: Option<String>,
        copy: bool,
        use_prepare_flow: bool,
        digest: Option<String>,
    },
    StoreManifestFiles {
        manifest: Arc<Manifest>,
        artifact_id: String,
        artifact_manifest_id: String,
    },
    CommitArtifact(CommitArtifactEvent),
    Finish(Option<oneshot::Sender<()>>),
}

/// A commit request, passed unchanged from the checksum stage through to
/// the upload dispatcher that actually gates and fires it.
pub struct CommitArtifactEvent {
    pub artifact_id: String,
    pub finalize: bool,
    pub before_commit: Option<CommitHook>,
    pub on_commit: Option<CommitHook>,
    pub result: oneshot::Sender<Result<(), ArtifactError>>,
}

/// Input events accepted by the upload dispatcher.
pub enum UploadEvent {
    Upload(UploadRequest),
    CommitArtifact(CommitArtifactEvent),
    Finish(Option<oneshot::Sender<()>>),
    JobDone { save_name: String, artifact_id: Option<String>, success: bool },
}

/// A request accepted by the prepare batcher; resolves via the paired future.
pub struct PrepareRequest {
    pub artifact_id: String,
    pub artifact_manifest_id: String,
    pub save_name: String,
    pub md5: String,
    pub upload_parts_input: Option<u32>,
    pub resolve: oneshot::Sender<Result<PreparedFile, ArtifactError>>,
}

/// The descriptor the prepare batcher hands back for one file.
#[derive(Debug, Clone)]
pub struct PreparedFile {
    pub upload_url: Option<String>,
    pub upload_headers: Vec<(String, String)>,
    pub multipart_urls: Option<Vec<String>>,
    pub upload_id: Option<String>,
    pub storage_path: String,
    pub birth_artifact_id: Option<String>,
}

impl PreparedFile {
    pub fn is_dedup(&self) -> bool {
        self.upload_url.is_none() && self.multipart_urls.is_none()
    }

    pub fn is_multipart(&self) -> bool {
        self.multipart_urls.is_some()
    }
}
