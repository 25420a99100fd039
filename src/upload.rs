//! Upload stage: the concurrency-limited scheduler that turns prepared
//! descriptors into durable object-store writes and gates artifact commits.

use crate::backend::{Backend, CompletedPart};
use crate::cache::Cache;
use crate::errors::{ArtifactError, Result};
use crate::events::{CommitArtifactEvent, PreparedFile, UploadEvent, UploadRequest};
use crate::hash::ContentDigest;
use crate::prepare::PrepareBatcher;
use crate::stats::Stats;
use crate::url_provider::SharedUrlProvider;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, error, instrument, warn};

#[derive(Default)]
struct ArtifactUploadState {
    pending_count: usize,
    commit_requested: bool,
    finalize: bool,
    failed_save_names: Vec<String>,
    hooks: Option<(Option<crate::events::CommitHook>, Option<crate::events::CommitHook>)>,
    result: Option<tokio::sync::oneshot::Sender<std::result::Result<(), ArtifactError>>>,
}

pub struct UploadDispatcher<B: Backend + 'static> {
    input: mpsc::Receiver<UploadEvent>,
    self_tx: mpsc::Sender<UploadEvent>,
    backend: Arc<B>,
    prepare: Arc<PrepareBatcher>,
    cache: Cache,
    stats: Arc<Stats>,
    semaphore: Arc<Semaphore>,
    multipart_threshold: u64,
    multipart_chunk_size: u64,
    url_refresh_ttl: Duration,
    retry_budget: Duration,

    running: HashMap<String, ()>,
    pending: HashMap<String, VecDeque<UploadRequest>>,
    artifacts: HashMap<String, ArtifactUploadState>,
    finishing: bool,
    finish_callback: Option<tokio::sync::oneshot::Sender<()>>,
}

impl<B: Backend + 'static> UploadDispatcher<B> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        input: mpsc::Receiver<UploadEvent>,
        self_tx: mpsc::Sender<UploadEvent>,
        backend: Arc<B>,
        prepare: Arc<PrepareBatcher>,
        cache: Cache,
        stats: Arc<Stats>,
        max_jobs: usize,
        multipart_threshold: u64,
        multipart_chunk_size: u64,
        url_refresh_ttl: Duration,
        retry_budget: Duration,
    ) -> Self {
        Self {
            input,
            self_tx,
            backend,
            prepare,
            cache,
            stats,
            semaphore: Arc::new(Semaphore::new(max_jobs)),
            multipart_threshold,
            multipart_chunk_size,
            url_refresh_ttl,
            retry_budget,
            running: HashMap::new(),
            pending: HashMap::new(),
            artifacts: HashMap::new(),
            finishing: false,
            finish_callback: None,
        }
    }

    pub async fn run(mut self) {
        while let Some(event) = self.input.recv().await {
            match event {
                UploadEvent::Upload(request) => self.handle_upload(request),
                UploadEvent::CommitArtifact(event) => self.handle_commit(event).await,
                UploadEvent::JobDone {
                    save_name,
                    artifact_id,
                    success,
                } => {
                    self.handle_job_done(save_name, artifact_id, success).await;
                    if self.finishing && self.drained() {
                        if let Some(cb) = self.finish_callback.take() {
                            let _ = cb.send(());
                        }
                        break;
                    }
                }
                UploadEvent::Finish(callback) => {
                    self.finishing = true;
                    self.finish_callback = callback;
                    if self.drained() {
                        if let Some(cb) = self.finish_callback.take() {
                            let _ = cb.send(());
                        }
                        break;
                    }
                }
            }
        }
    }

    fn drained(&self) -> bool {
        self.running.is_empty() && self.pending.values().all(|v| v.is_empty())
    }

    fn handle_upload(&mut self, request: UploadRequest) {
        if let Some(artifact_id) = &request.artifact_id {
            self.artifacts.entry(artifact_id.clone()).or_default().pending_count += 1;
        }
        if self.running.contains_key(&request.save_name) {
            self.pending.entry(request.save_name.clone()).or_default().push_back(request);
            return;
        }
        self.spawn_worker(request);
    }

    fn spawn_worker(&mut self, request: UploadRequest) {
        self.running.insert(request.save_name.clone(), ());
        let backend = self.backend.clone();
        let prepare = self.prepare.clone();
        let cache = self.cache.clone();
        let stats = self.stats.clone();
        let semaphore = self.semaphore.clone();
        let self_tx = self.self_tx.clone();
        let multipart_threshold = self.multipart_threshold;
        let multipart_chunk_size = self.multipart_chunk_size;
        let url_refresh_ttl = self.url_refresh_ttl;
        let retry_budget = self.retry_budget;

        tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
            let save_name = request.save_name.clone();
            let artifact_id = request.artifact_id.clone();
            let success = run_upload_job(
                &request,
                backend.as_ref(),
                &prepare,
                &cache,
                &stats,
                multipart_threshold,
                multipart_chunk_size,
                url_refresh_ttl,
                retry_budget,
            )
            .await;

            if request.copied {
                let _ = tokio::fs::remove_file(&request.local_path).await;
            }
            if success && artifact_id.is_some() {
                // metrics-streaming notification hook; a full implementation
                // wires this into the run's event channel.
                debug!(save_name = %save_name, "artifact file upload succeeded");
            }

            let _ = self_tx
                .send(UploadEvent::JobDone {
                    save_name,
                    artifact_id,
                    success,
                })
                .await;
        });
    }

    async fn handle_job_done(&mut self, save_name: String, artifact_id: Option<String>, success: bool) {
        self.running.remove(&save_name);

        if !success {
            self.stats.update_failed_file(&save_name);
        }

        if let Some(artifact_id) = &artifact_id {
            if let Some(state) = self.artifacts.get_mut(artifact_id) {
                state.pending_count = state.pending_count.saturating_sub(1);
                if !success {
                    state.failed_save_names.push(save_name.clone());
                }
            }
            self.maybe_commit(artifact_id).await;
        }

        if let Some(queue) = self.pending.get_mut(&save_name) {
            if let Some(next) = queue.pop_front() {
                if queue.is_empty() {
                    self.pending.remove(&save_name);
                }
                self.spawn_worker(next);
            } else {
                self.pending.remove(&save_name);
            }
        }
    }

    async fn handle_commit(&mut self, event: CommitArtifactEvent) {
        let state = self.artifacts.entry(event.artifact_id.clone()).or_default();
        state.commit_requested = true;
        state.finalize = event.finalize;
        state.hooks = Some((event.before_commit, event.on_commit));
        state.result = Some(event.result);
        self.maybe_commit(&event.artifact_id).await;
    }

    #[instrument(skip(self), fields(artifact_id = %artifact_id))]
    async fn maybe_commit(&mut self, artifact_id: &str) {
        let ready = matches!(
            self.artifacts.get(artifact_id),
            Some(state) if state.commit_requested && state.pending_count == 0
        );
        if !ready {
            return;
        }
        let Some(mut state) = self.artifacts.remove(artifact_id) else { return };
        let result_tx = state.result.take();
        let hooks = state.hooks.take();
        let failed_save_names = state.failed_save_names;
        let finalize = state.finalize;
        let backend = self.backend.clone();
        let artifact_id = artifact_id.to_string();

        let outcome = run_commit(&artifact_id, &failed_save_names, finalize, hooks, backend.as_ref()).await;
        if let Some(tx) = result_tx {
            let _ = tx.send(outcome);
        }
    }
}

async fn run_commit(
    artifact_id: &str,
    failed_save_names: &[String],
    finalize: bool,
    hooks: Option<(Option<crate::events::CommitHook>, Option<crate::events::CommitHook>)>,
    backend: &impl Backend,
) -> std::result::Result<(), ArtifactError> {
    if !failed_save_names.is_empty() {
        return Err(ArtifactError::ArtifactFailed(
            artifact_id.to_string(),
            failed_save_names.len(),
            failed_save_names.join(", "),
        ));
    }
    let (before, after) = hooks.unwrap_or((None, None));
    if let Some(hook) = before {
        hook().await?;
    }
    if finalize {
        backend.commit_artifact(artifact_id).await?;
    }
    if let Some(hook) = after {
        hook().await?;
    }
    Ok(())
}

/// Retries a transient failure with capped exponential backoff until either
/// it succeeds, a non-retryable error surfaces, or `budget` has elapsed.
pub(crate) async fn retry_with_backoff<F, Fut>(budget: Duration, save_name: &str, mut op: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let start = Instant::now();
    let mut backoff = Duration::from_millis(200);
    loop {
        match op().await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_retryable() => {
                let elapsed = start.elapsed();
                if elapsed >= budget {
                    return Err(e);
                }
                let sleep_for = backoff.min(budget.saturating_sub(elapsed));
                warn!(save_name = %save_name, error = %e, backoff_ms = sleep_for.as_millis() as u64, "retrying transient upload failure");
                tokio::time::sleep(sleep_for).await;
                backoff = (backoff * 2).min(Duration::from_secs(30));
            }
            Err(e) => return Err(e),
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_upload_job(
    request: &UploadRequest,
    backend: &impl Backend,
    prepare: &PrepareBatcher,
    cache: &Cache,
    stats: &Stats,
    multipart_threshold: u64,
    multipart_chunk_size: u64,
    url_refresh_ttl: Duration,
    retry_budget: Duration,
) -> bool {
    match try_upload(
        request,
        backend,
        prepare,
        cache,
        stats,
        multipart_threshold,
        multipart_chunk_size,
        url_refresh_ttl,
        retry_budget,
    )
    .await
    {
        Ok(()) => true,
        Err(e) => {
            error!(save_name = %request.save_name, error = %e, "upload failed");
            false
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn try_upload(
    request: &UploadRequest,
    backend: &impl Backend,
    prepare: &PrepareBatcher,
    cache: &Cache,
    stats: &Stats,
    multipart_threshold: u64,
    multipart_chunk_size: u64,
    url_refresh_ttl: Duration,
    retry_budget: Duration,
) -> Result<()> {
    let artifact_id = request
        .artifact_id
        .clone()
        .ok_or_else(|| ArtifactError::Protocol("upload request missing artifact_id".to_string()))?;
    let manifest_id = request
        .artifact_manifest_id
        .clone()
        .ok_or_else(|| ArtifactError::Protocol("upload request missing artifact_manifest_id".to_string()))?;
    let md5 = request
        .md5
        .clone()
        .ok_or_else(|| ArtifactError::Protocol("upload request missing md5".to_string()))?;

    let metadata = tokio::fs::metadata(&request.local_path)
        .await
        .map_err(|_| ArtifactError::SourceVanished(request.local_path.display().to_string()))?;
    let size = metadata.len();

    let upload_parts_input = if size >= multipart_threshold {
        Some(size.div_ceil(multipart_chunk_size) as u32)
    } else {
        None
    };

    let prepared = prepare
        .prepare_async(artifact_id, manifest_id, request.save_name.clone(), md5.clone(), upload_parts_input)
        .await?;

    if prepared.is_dedup() {
        stats.set_file_deduped(&request.save_name);
        return Ok(());
    }

    if prepared.is_multipart() {
        upload_multipart(request, &prepared, backend, stats, multipart_chunk_size, url_refresh_ttl, retry_budget).await?;
    } else {
        upload_single(request, &prepared, backend, stats, retry_budget).await?;
    }

    if let Ok(digest) = ContentDigest::from_base64(&md5) {
        cache.insert_from_path(digest, &request.local_path);
    }
    Ok(())
}

async fn upload_single(
    request: &UploadRequest,
    prepared: &PreparedFile,
    backend: &impl Backend,
    stats: &Stats,
    retry_budget: Duration,
) -> Result<()> {
    let url = prepared
        .upload_url
        .clone()
        .ok_or_else(|| ArtifactError::Protocol("missing upload_url for non-dedup file".to_string()))?;
    let body = tokio::fs::read(&request.local_path)
        .await
        .map_err(|_| ArtifactError::SourceVanished(request.local_path.display().to_string()))?;
    let body = Bytes::from(body);
    let len = body.len() as i64;
    retry_with_backoff(retry_budget, &request.save_name, || async {
        backend.put_object(&url, &prepared.upload_headers, body.clone()).await?;
        Ok(())
    })
    .await?;
    stats.update_uploaded_file(&request.save_name, len);
    Ok(())
}

/// Uploads every part of a multipart job concurrently, each behind its own
/// [`SharedUrlProvider`] so a 401/403 mid-flight triggers exactly one
/// refetch shared by any other task racing on the same part. Each part
/// retries independently against the same wall-clock budget.
#[allow(clippy::too_many_arguments)]
async fn upload_multipart(
    request: &UploadRequest,
    prepared: &PreparedFile,
    backend: &impl Backend,
    stats: &Stats,
    chunk_size: u64,
    url_refresh_ttl: Duration,
    retry_budget: Duration,
) -> Result<()> {
    let urls = prepared
        .multipart_urls
        .clone()
        .ok_or_else(|| ArtifactError::Protocol("missing multipart urls".to_string()))?;
    let upload_id = prepared
        .upload_id
        .clone()
        .ok_or_else(|| ArtifactError::Protocol("missing multipart upload id".to_string()))?;

    let part_futures = urls.into_iter().enumerate().map(|(index, url)| {
        let part_number = (index + 1) as u32;
        async move {
            let chunk = read_chunk(&request.local_path, index as u64 * chunk_size, chunk_size).await?;
            let hex_md5 = hex::encode(md5::compute(&chunk).0);
            let uploaded_len = chunk.len() as i64;
            let body = Bytes::from(chunk);
            retry_with_backoff(retry_budget, &request.save_name, || {
                let url = url.clone();
                let body = body.clone();
                async move { upload_part_with_refresh(backend, url, url_refresh_ttl, body).await.map(|_| ()) }
            })
            .await?;
            stats.update_uploaded_file(&request.save_name, uploaded_len);
            Ok::<CompletedPart, ArtifactError>(CompletedPart { part_number, hex_md5 })
        }
    });
    let mut completed = futures::future::try_join_all(part_futures).await?;
    completed.sort_by_key(|part| part.part_number);

    backend
        .complete_multipart_upload_artifact(
            request.artifact_id.as_deref().unwrap_or_default(),
            &prepared.storage_path,
            &completed,
            &upload_id,
        )
        .await?;
    Ok(())
}

/// Refreshes the URL once on a 401/403 before giving up; the caller's
/// [`retry_with_backoff`] wraps this whole function and handles any further
/// transient failures against the job's wall-clock retry budget.
async fn upload_part_with_refresh(
    backend: &impl Backend,
    url: String,
    url_refresh_ttl: Duration,
    chunk: Bytes,
) -> Result<String> {
    let fetch_url = url.clone();
    let provider = SharedUrlProvider::new(
        url,
        url_refresh_ttl,
        Arc::new(move || {
            let fetch_url = fetch_url.clone();
            Box::pin(async move { Ok(fetch_url) })
        }),
    );
    match backend.put_object_part(&provider.get_url().await?, chunk.clone()).await {
        Err(ArtifactError::UrlExpired(_)) => {
            provider.invalidate().await;
            backend.put_object_part(&provider.get_url().await?, chunk).await
        }
        other => other,
    }
}

async fn read_chunk(path: &PathBuf, offset: u64, len: u64) -> Result<Vec<u8>> {
    use tokio::io::{AsyncReadExt, AsyncSeekExt};
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|_| ArtifactError::SourceVanished(path.display().to_string()))?;
    file.seek(std::io::SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; len as usize];
    let mut total = 0usize;
    loop {
        let n = file.read(&mut buf[total..]).await?;
        if n == 0 {
            break;
        }
        total += n;
        if total == buf.len() {
            break;
        }
    }
    buf.truncate(total);
    Ok(buf)
}
