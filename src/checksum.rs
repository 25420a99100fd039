//! Checksum stage: turns raw upload intents into requests carrying stable,
//! uploadable bytes.

use crate::errors::Result;
use crate::events::{ChecksumEvent, CommitArtifactEvent, UploadEvent, UploadRequest};
use crate::hash::digest_reader;
use crate::stats::Stats;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{instrument, warn};
use uuid::Uuid;

/// Single-consumer stage: one task drains `input` and forwards to `downstream`.
pub struct ChecksumStage {
    input: mpsc::Receiver<ChecksumEvent>,
    downstream: mpsc::Sender<UploadEvent>,
    staging_dir: PathBuf,
    stats: Arc<Stats>,
}

impl ChecksumStage {
    pub fn new(
        input: mpsc::Receiver<ChecksumEvent>,
        downstream: mpsc::Sender<UploadEvent>,
        staging_dir: PathBuf,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            input,
            downstream,
            staging_dir,
            stats,
        }
    }

    pub async fn run(mut self) {
        while let Some(event) = self.input.recv().await {
            match event {
                ChecksumEvent::Upload {
                    path,
                    save_name,
                    artifact_id,
                    copy,
                    use_prepare_flow,
                    digest,
                } => {
                    self.handle_upload(path, save_name, artifact_id, copy, use_prepare_flow, digest)
                        .await;
                }
                ChecksumEvent::StoreManifestFiles {
                    manifest,
                    artifact_id,
                    artifact_manifest_id,
                } => {
                    self.handle_store_manifest_files(manifest, artifact_id, artifact_manifest_id)
                        .await;
                }
                ChecksumEvent::CommitArtifact(event) => {
                    self.forward_commit(event).await;
                }
                ChecksumEvent::Finish(callback) => {
                    let _ = self.downstream.send(UploadEvent::Finish(callback)).await;
                    break;
                }
            }
        }
    }

    #[instrument(skip(self, digest), fields(save_name = %save_name))]
    async fn handle_upload(
        &mut self,
        path: PathBuf,
        save_name: String,
        artifact_id: Option<String>,
        copy: bool,
        use_prepare_flow: bool,
        digest: Option<String>,
    ) {
        let size = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(_) => {
                warn!("source file vanished before checksum; dropping request");
                self.stats.update_failed_file(&save_name);
                return;
            }
        };
        self.stats.init_file(&save_name, size);

        let staging_dir = self.staging_dir.clone();
        let save_name_for_copy = save_name.clone();
        let copy_result = if copy {
            tokio::task::spawn_blocking(move || stage_copy(&path, &staging_dir, &save_name_for_copy))
                .await
                .unwrap()
        } else {
            Ok(path)
        };

        let staged_path = match copy_result {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to stage file for upload");
                self.stats.update_failed_file(&save_name);
                return;
            }
        };

        let md5 = if use_prepare_flow {
            let path_for_hash = staged_path.clone();
            match tokio::task::spawn_blocking(move || hash_file(&path_for_hash)).await.unwrap() {
                Ok(digest) => Some(digest.to_string()),
                Err(e) => {
                    warn!(error = %e, "failed to checksum file");
                    self.stats.update_failed_file(&save_name);
                    return;
                }
            }
        } else {
            None
        };

        let request = UploadRequest {
            local_path: staged_path,
            save_name,
            artifact_id,
            artifact_manifest_id: None,
            md5,
            copied: copy,
            digest,
        };
        let _ = self.downstream.send(UploadEvent::Upload(request)).await;
    }

    async fn handle_store_manifest_files(
        &mut self,
        manifest: Arc<crate::manifest::Manifest>,
        artifact_id: String,
        artifact_manifest_id: String,
    ) {
        for entry in manifest.local_entries() {
            let Some(local_path) = &entry.local_path else { continue };
            self.stats.init_file(&entry.path, entry.size);
            self.stats.mark_artifact_file(&entry.path);
            let request = UploadRequest {
                local_path: local_path.clone(),
                save_name: entry.path.clone(),
                artifact_id: Some(artifact_id.clone()),
                artifact_manifest_id: Some(artifact_manifest_id.clone()),
                md5: Some(entry.digest.clone()),
                copied: false,
                digest: Some(entry.digest.clone()),
            };
            let _ = self.downstream.send(UploadEvent::Upload(request)).await;
        }
    }

    async fn forward_commit(&mut self, event: CommitArtifactEvent) {
        let _ = self.downstream.send(UploadEvent::CommitArtifact(event)).await;
    }
}

fn stage_copy(src: &Path, staging_dir: &Path, save_name: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(staging_dir).map_err(|e| crate::errors::ArtifactError::Filesystem(staging_dir.display().to_string(), e))?;
    let dest = staging_dir.join(format!("{}-{}", Uuid::new_v4(), save_name));
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).map_err(|e| crate::errors::ArtifactError::Filesystem(parent.display().to_string(), e))?;
    }
    // Try the fast path first; fall back to a plain byte-wise copy if it fails
    // (e.g. a truncated source tripping up an accelerated copy syscall).
    if std::fs::copy(src, &dest).is_err() {
        let mut source =
            std::fs::File::open(src).map_err(|e| crate::errors::ArtifactError::Filesystem(src.display().to_string(), e))?;
        let mut target =
            std::fs::File::create(&dest).map_err(|e| crate::errors::ArtifactError::Filesystem(dest.display().to_string(), e))?;
        crate::utils::copy_with_fallback(&mut source, &mut target)
            .map_err(|e| crate::errors::ArtifactError::Filesystem(dest.display().to_string(), e))?;
    }
    Ok(dest)
}

fn hash_file(path: &Path) -> Result<crate::hash::ContentDigest> {
    let file = std::fs::File::open(path).map_err(|e| crate::errors::ArtifactError::Filesystem(path.display().to_string(), e))?;
    digest_reader(file).map_err(|e| crate::errors::ArtifactError::Filesystem(path.display().to_string(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChecksumEvent;
    use std::io::Write;

    #[tokio::test]
    async fn upload_event_emits_downstream_request() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = tempfile::NamedTempFile::new_in(dir.path()).unwrap();
        file.write_all(b"hello checksum").unwrap();

        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let stats = Arc::new(Stats::new());
        let stage = ChecksumStage::new(in_rx, out_tx, dir.path().join("staging"), stats.clone());
        let handle = tokio::spawn(stage.run());

        in_tx
            .send(ChecksumEvent::Upload {
                path: file.path().to_path_buf(),
                save_name: "hello.txt".to_string(),
                artifact_id: None,
                copy: false,
                use_prepare_flow: true,
                digest: None,
            })
            .await
            .unwrap();
        in_tx.send(ChecksumEvent::Finish(None)).await.unwrap();

        let event = out_rx.recv().await.unwrap();
        match event {
            UploadEvent::Upload(request) => {
                assert_eq!(request.save_name, "hello.txt");
                assert!(request.md5.is_some());
            }
            _ => panic!("expected Upload event"),
        }
        let finish = out_rx.recv().await.unwrap();
        assert!(matches!(finish, UploadEvent::Finish(_)));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn missing_source_file_is_dropped_not_forwarded() {
        let dir = tempfile::tempdir().unwrap();
        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let stats = Arc::new(Stats::new());
        let stage = ChecksumStage::new(in_rx, out_tx, dir.path().join("staging"), stats.clone());
        let handle = tokio::spawn(stage.run());

        in_tx
            .send(ChecksumEvent::Upload {
                path: dir.path().join("does-not-exist"),
                save_name: "missing.txt".to_string(),
                artifact_id: None,
                copy: false,
                use_prepare_flow: false,
                digest: None,
            })
            .await
            .unwrap();
        in_tx.send(ChecksumEvent::Finish(None)).await.unwrap();

        let event = out_rx.recv().await.unwrap();
        assert!(matches!(event, UploadEvent::Finish(_)));
        handle.await.unwrap();
    }
}
