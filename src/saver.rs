//! Artifact saver: drives the create → upload → commit protocol for one
//! artifact, one call.

use crate::backend::{ArtifactState, Backend, ManifestType};
use crate::cache::Cache;
use crate::config::PipelineConfig;
use crate::errors::{ArtifactError, Result};
use crate::events::{ChecksumEvent, CommitArtifactEvent, UploadEvent};
use crate::manifest::Manifest;
use crate::prepare::PrepareBatcher;
use crate::stats::Stats;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, instrument};

pub struct SaveRequest {
    pub artifact_type: String,
    pub name: String,
    pub client_id: String,
    pub sequence_client_id: String,
    pub manifest: Manifest,
    pub finalize: bool,
    pub use_after_commit: bool,
    pub run_id: Option<String>,
    pub entity: Option<String>,
    pub project: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SavedArtifact {
    pub artifact_id: String,
    pub digest: String,
}

/// Owns the checksum and upload stage tasks for the lifetime of the process
/// (or test), and exposes `save()` as the sole public entry point.
pub struct ArtifactSaver<B: Backend + 'static> {
    backend: Arc<B>,
    config: PipelineConfig,
    cache: Cache,
    stats: Arc<Stats>,
    checksum_tx: mpsc::Sender<ChecksumEvent>,
    upload_tx: mpsc::Sender<UploadEvent>,
    _checksum_handle: tokio::task::JoinHandle<()>,
    _upload_handle: tokio::task::JoinHandle<()>,
}

impl<B: Backend + 'static> ArtifactSaver<B> {
    pub fn new(backend: Arc<B>, config: PipelineConfig) -> Self {
        let cache = Cache::new(config.cache_dir.clone());
        let stats = Arc::new(Stats::new());

        let prepare_config = config.saver_prepare_defaults();
        let (prepare, _prepare_handle) = PrepareBatcher::start(
            backend.clone(),
            prepare_config.batch_time,
            prepare_config.inter_event_time,
            prepare_config.max_batch_size,
        );
        let prepare = Arc::new(prepare);

        let (upload_tx, upload_rx) = mpsc::channel(4096);
        let dispatcher = crate::upload::UploadDispatcher::new(
            upload_rx,
            upload_tx.clone(),
            backend.clone(),
            prepare,
            cache.clone(),
            stats.clone(),
            config.max_jobs,
            config.multipart_threshold_bytes,
            config.multipart_chunk_size_bytes,
            config.url_refresh_ttl,
            config.retry_budget,
        );
        let upload_handle = tokio::spawn(dispatcher.run());

        let (checksum_tx, checksum_rx) = mpsc::channel(4096);
        let checksum_stage = crate::checksum::ChecksumStage::new(
            checksum_rx,
            upload_tx.clone(),
            config.staging_dir.clone(),
            stats.clone(),
        );
        let checksum_handle = tokio::spawn(checksum_stage.run());

        Self {
            backend,
            config,
            cache,
            stats,
            checksum_tx,
            upload_tx,
            _checksum_handle: checksum_handle,
            _upload_handle: upload_handle,
        }
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    #[instrument(skip(self, request), fields(name = %request.name))]
    pub async fn save(&self, mut request: SaveRequest) -> Result<SavedArtifact> {
        let manifest_digest = request.manifest.digest();

        let created = self
            .backend
            .create_artifact(
                &request.artifact_type,
                &request.name,
                &manifest_digest.to_string(),
                &request.client_id,
                &request.sequence_client_id,
            )
            .await?;

        if created.state == ArtifactState::Committed {
            if request.use_after_commit {
                if let (Some(run_id), Some(entity), Some(project)) =
                    (&request.run_id, &request.entity, &request.project)
                {
                    self.backend
                        .use_artifact(&created.artifact_id, run_id, entity, project)
                        .await?;
                }
            }
            return Ok(SavedArtifact {
                artifact_id: created.artifact_id,
                digest: manifest_digest.to_string(),
            });
        }
        if created.state != ArtifactState::Pending && created.state != ArtifactState::Deleted {
            return Err(ArtifactError::UnexpectedArtifactState(
                format!("{:?}", created.state),
                created.artifact_id,
            ));
        }

        let filename = "wandb_manifest.json";
        let manifest_created = self
            .backend
            .create_artifact_manifest(
                filename,
                "",
                &created.artifact_id,
                created.latest_id.as_deref(),
                ManifestType::Full,
                false,
            )
            .await?;

        self.checksum_tx
            .send(ChecksumEvent::StoreManifestFiles {
                manifest: Arc::new(request.manifest.clone()),
                artifact_id: created.artifact_id.clone(),
                artifact_manifest_id: manifest_created.manifest_id.clone(),
            })
            .await
            .map_err(|_| ArtifactError::Cancelled)?;

        let (result_tx, result_rx) = tokio::sync::oneshot::channel();
        let backend = self.backend.clone();
        let artifact_id_for_hook = created.artifact_id.clone();
        let manifest_id_for_hook = manifest_created.manifest_id.clone();
        let manifest_for_hook = std::mem::take(&mut request.manifest);
        let finalize = request.finalize;
        let retry_budget = self.config.retry_budget;

        let before_commit: crate::events::CommitHook = Box::new(move || {
            Box::pin(async move {
                let digest = manifest_for_hook.digest().to_string();
                let json = manifest_for_hook.to_json().map_err(ArtifactError::Json)?;
                let tmp = tempfile::NamedTempFile::new()
                    .map_err(|e| ArtifactError::Filesystem("manifest temp file".to_string(), e))?;
                tokio::fs::write(tmp.path(), &json)
                    .await
                    .map_err(|e| ArtifactError::Filesystem(tmp.path().display().to_string(), e))?;

                let file = backend
                    .update_artifact_manifest(&manifest_id_for_hook, &digest)
                    .await?;
                if let Some(url) = file.upload_url {
                    let body = tokio::fs::read(tmp.path()).await?;
                    let body = Bytes::from(body);
                    let manifest_save_name = format!("{manifest_id_for_hook}/manifest");
                    crate::upload::retry_with_backoff(retry_budget, &manifest_save_name, || {
                        let url = url.clone();
                        let headers = file.upload_headers.clone();
                        let body = body.clone();
                        let backend = backend.clone();
                        async move { backend.put_object(&url, &headers, body).await.map(|_| ()) }
                    })
                    .await?;
                }
                let _ = artifact_id_for_hook;
                Ok::<(), ArtifactError>(())
            })
        });

        self.checksum_tx
            .send(ChecksumEvent::CommitArtifact(CommitArtifactEvent {
                artifact_id: created.artifact_id.clone(),
                finalize,
                before_commit: Some(before_commit),
                on_commit: None,
                result: result_tx,
            }))
            .await
            .map_err(|_| ArtifactError::Cancelled)?;

        result_rx.await.map_err(|_| ArtifactError::Cancelled)??;

        if finalize && request.use_after_commit {
            if let (Some(run_id), Some(entity), Some(project)) = (&request.run_id, &request.entity, &request.project) {
                self.backend
                    .use_artifact(&created.artifact_id, run_id, entity, project)
                    .await?;
            }
        }

        info!(artifact_id = %created.artifact_id, "artifact saved");
        Ok(SavedArtifact {
            artifact_id: created.artifact_id,
            digest: manifest_digest.to_string(),
        })
    }

    pub async fn finish(&self) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let _ = self.upload_tx.send(UploadEvent::Finish(Some(tx))).await;
        let _ = rx.await;
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }
}

impl Default for Manifest {
    fn default() -> Self {
        Manifest::new(crate::manifest::StoragePolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::manifest::ManifestEntry;
    use std::io::Write;
    use tracing_subscriber::util::SubscriberInitExt;

    /// Enables debug output for a single test run; harmless to call more
    /// than once since `try_init` silently no-ops after the first success.
    fn init_test_logging() {
        let _ = tracing_subscriber::fmt::Subscriber::builder()
            .with_target(false)
            .without_time()
            .with_max_level(tracing::Level::DEBUG)
            .finish()
            .try_init();
    }

    #[tokio::test]
    async fn save_with_no_files_commits_immediately() {
        init_test_logging();
        let backend = Arc::new(MockBackend::new());
        let dir = tempfile::tempdir().unwrap();
        let mut config = PipelineConfig::default();
        config.staging_dir = dir.path().join("staging");
        config.cache_dir = dir.path().join("cache");
        let saver = ArtifactSaver::new(backend, config);

        let manifest = Manifest::new(crate::manifest::StoragePolicy::default());
        let request = SaveRequest {
            artifact_type: "dataset".to_string(),
            name: "empty-artifact".to_string(),
            client_id: "c1".to_string(),
            sequence_client_id: "s1".to_string(),
            manifest,
            finalize: true,
            use_after_commit: false,
            run_id: None,
            entity: None,
            project: None,
        };
        let saved = saver.save(request).await.unwrap();
        assert!(!saved.artifact_id.is_empty());
        saver.finish().await;
    }

    #[tokio::test]
    async fn save_with_one_file_uploads_and_commits() {
        let backend = Arc::new(MockBackend::new());
        let dir = tempfile::tempdir().unwrap();
        let mut config = PipelineConfig::default();
        config.staging_dir = dir.path().join("staging");
        config.cache_dir = dir.path().join("cache");
        let saver = ArtifactSaver::new(backend, config);

        let mut file = tempfile::NamedTempFile::new_in(dir.path()).unwrap();
        file.write_all(b"artifact payload").unwrap();
        let digest = crate::hash::ContentDigest::new(b"artifact payload");

        let mut manifest = Manifest::new(crate::manifest::StoragePolicy::default());
        manifest.insert(
            ManifestEntry::new("payload.bin", digest, 17).with_local_path(file.path().to_path_buf()),
        );

        let request = SaveRequest {
            artifact_type: "dataset".to_string(),
            name: "one-file-artifact".to_string(),
            client_id: "c2".to_string(),
            sequence_client_id: "s2".to_string(),
            manifest,
            finalize: true,
            use_after_commit: false,
            run_id: None,
            entity: None,
            project: None,
        };
        let saved = saver.save(request).await.unwrap();
        assert!(!saved.artifact_id.is_empty());
        saver.finish().await;
    }
}
