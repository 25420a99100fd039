//! Prepare batcher: coalesces many single-file "create artifact file" calls
//! into few batched GraphQL round-trips while preserving low latency for
//! small bursts.

use crate::backend::{Backend, FileSpec};
use crate::errors::ArtifactError;
use crate::events::{PrepareRequest, PreparedFile};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, instrument};

pub struct PrepareBatcher {
    sender: mpsc::Sender<PrepareRequest>,
}

struct Worker<B> {
    input: mpsc::Receiver<PrepareRequest>,
    backend: Arc<B>,
    batch_time: Duration,
    inter_event_time: Duration,
    max_batch_size: usize,
}

impl PrepareBatcher {
    /// Spawns the background worker loop and returns a handle whose `prepare_async`
    /// enqueues requests onto it.
    pub fn start<B: Backend + 'static>(
        backend: Arc<B>,
        batch_time: Duration,
        inter_event_time: Duration,
        max_batch_size: usize,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(1024);
        let worker = Worker {
            input: rx,
            backend,
            batch_time,
            inter_event_time,
            max_batch_size,
        };
        let handle = tokio::spawn(worker.run());
        (Self { sender: tx }, handle)
    }

    pub async fn prepare_async(
        &self,
        artifact_id: String,
        artifact_manifest_id: String,
        save_name: String,
        md5: String,
        upload_parts_input: Option<u32>,
    ) -> Result<PreparedFile, ArtifactError> {
        let (resolve, await_result) = tokio::sync::oneshot::channel();
        let request = PrepareRequest {
            artifact_id,
            artifact_manifest_id,
            save_name,
            md5,
            upload_parts_input,
            resolve,
        };
        self.sender
            .send(request)
            .await
            .map_err(|_| ArtifactError::Cancelled)?;
        await_result.await.map_err(|_| ArtifactError::Cancelled)?
    }

    /// Stop accepting new requests; the worker drains whatever is already
    /// queued, flushes it, and exits on its own. Returns immediately.
    pub fn finish(self) {
        drop(self.sender);
    }

    /// [`PrepareBatcher::finish`], then wait for the worker task to actually exit.
    pub async fn shutdown(self, worker: tokio::task::JoinHandle<()>) {
        self.finish();
        let _ = worker.await;
    }
}

impl<B: Backend> Worker<B> {
    async fn run(mut self) {
        loop {
            let Some(first) = self.input.recv().await else {
                break;
            };
            let mut batch = vec![first];
            let batch_start = Instant::now();
            let mut remaining = self.batch_time;

            loop {
                let wait = remaining.min(self.inter_event_time);
                match timeout(wait, self.input.recv()).await {
                    Ok(Some(request)) => {
                        batch.push(request);
                        let elapsed = batch_start.elapsed();
                        remaining = self.batch_time.saturating_sub(elapsed);
                        if remaining.is_zero() || batch.len() >= self.max_batch_size {
                            break;
                        }
                    }
                    Ok(None) => {
                        self.flush(batch).await;
                        return;
                    }
                    Err(_elapsed) => break,
                }
            }
            self.flush(batch).await;
        }
    }

    #[instrument(skip(self, batch), fields(batch_size = batch.len()))]
    async fn flush(&self, batch: Vec<PrepareRequest>) {
        debug!("flushing prepare batch");
        let specs: Vec<FileSpec> = batch
            .iter()
            .map(|r| FileSpec {
                artifact_id: r.artifact_id.clone(),
                artifact_manifest_id: r.artifact_manifest_id.clone(),
                name: r.save_name.clone(),
                md5: r.md5.clone(),
                upload_parts_input: r.upload_parts_input,
            })
            .collect();

        match self.backend.create_artifact_files(&specs).await {
            Ok(results) => {
                for (request, result) in batch.into_iter().zip(results) {
                    let prepared = PreparedFile {
                        upload_url: result.upload_url,
                        upload_headers: result.upload_headers,
                        multipart_urls: result.multipart_urls,
                        upload_id: result.upload_id,
                        storage_path: result.storage_path,
                        birth_artifact_id: result.birth_artifact_id,
                    };
                    let _ = request.resolve.send(Ok(prepared));
                }
            }
            Err(e) => {
                let message = e.to_string();
                for request in batch {
                    let _ = request.resolve.send(Err(ArtifactError::Custom(message.clone())));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;

    #[tokio::test]
    async fn single_request_flushes_after_inter_event_timeout() {
        let backend = Arc::new(MockBackend::new());
        let (batcher, _handle) =
            PrepareBatcher::start(backend, Duration::from_millis(500), Duration::from_millis(20), 100);

        let prepared = batcher
            .prepare_async("a1".to_string(), "m1".to_string(), "file.bin".to_string(), "digest".to_string(), None)
            .await
            .unwrap();
        assert!(prepared.upload_url.is_some());
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_batch_response_order() {
        let backend = Arc::new(MockBackend::new());
        let (batcher, _handle) = PrepareBatcher::start(
            Arc::clone(&backend),
            Duration::from_millis(200),
            Duration::from_millis(50),
            100,
        );
        let batcher = Arc::new(batcher);

        let mut handles = Vec::new();
        for i in 0..5 {
            let batcher = batcher.clone();
            handles.push(tokio::spawn(async move {
                batcher
                    .prepare_async(
                        "a1".to_string(),
                        "m1".to_string(),
                        format!("file-{i}.bin"),
                        format!("digest-{i}"),
                        None,
                    )
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            let prepared = handle.await.unwrap();
            assert!(prepared.upload_url.is_some());
        }
    }

    #[tokio::test]
    async fn batch_caps_at_max_batch_size() {
        let backend = Arc::new(MockBackend::new());
        let (batcher, _handle) =
            PrepareBatcher::start(backend, Duration::from_secs(5), Duration::from_millis(5), 2);
        let batcher = Arc::new(batcher);

        let mut handles = Vec::new();
        for i in 0..4 {
            let batcher = batcher.clone();
            handles.push(tokio::spawn(async move {
                batcher
                    .prepare_async("a1".to_string(), "m1".to_string(), format!("f{i}"), format!("d{i}"), None)
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
