//! Deduplicates concurrent presigned-URL refreshes behind a TTL window.
//!
//! Multipart workers share one provider per file. A 401/403 from the object
//! store invalidates it; the next caller to ask for a URL triggers a single
//! refetch, and any other caller arriving within the TTL window gets the
//! same in-flight result instead of issuing its own request.

use crate::errors::ArtifactError;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, watch};

type FetchFn = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Result<String, ArtifactError>> + Send>> + Send + Sync>;

enum Slot {
    Fresh(String),
    Invalidated,
    Refreshing(watch::Receiver<Option<Result<String, String>>>),
}

pub struct SharedUrlProvider {
    fetch: FetchFn,
    ttl: Duration,
    state: Mutex<(Slot, Instant)>,
}

impl SharedUrlProvider {
    pub fn new(initial_url: String, ttl: Duration, fetch: FetchFn) -> Self {
        Self {
            fetch,
            ttl,
            state: Mutex::new((Slot::Fresh(initial_url), Instant::now())),
        }
    }

    /// Mark the current URL expired. The next `get_url()` call triggers a
    /// refetch; concurrent callers within `ttl` of that refetch share its result.
    pub async fn invalidate(&self) {
        let mut guard = self.state.lock().await;
        guard.0 = Slot::Invalidated;
    }

    pub async fn get_url(&self) -> Result<String, ArtifactError> {
        let mut guard = self.state.lock().await;
        match &guard.0 {
            Slot::Fresh(url) => return Ok(url.clone()),
            Slot::Refreshing(rx) => {
                if guard.1.elapsed() < self.ttl {
                    let mut rx = rx.clone();
                    drop(guard);
                    return wait_for_refresh(&mut rx).await;
                }
            }
            Slot::Invalidated => {}
        }

        let (tx, rx) = watch::channel(None);
        guard.0 = Slot::Refreshing(rx.clone());
        guard.1 = Instant::now();
        let fetch = self.fetch.clone();
        drop(guard);

        let result = fetch().await;
        let mut guard = self.state.lock().await;
        match &result {
            Ok(url) => {
                guard.0 = Slot::Fresh(url.clone());
                let _ = tx.send(Some(Ok(url.clone())));
            }
            Err(e) => {
                guard.0 = Slot::Invalidated;
                let _ = tx.send(Some(Err(e.to_string())));
            }
        }
        result
    }
}

async fn wait_for_refresh(rx: &mut watch::Receiver<Option<Result<String, String>>>) -> Result<String, ArtifactError> {
    loop {
        if let Some(result) = rx.borrow().clone() {
            return result.map_err(ArtifactError::Custom);
        }
        if rx.changed().await.is_err() {
            return Err(ArtifactError::Custom("URL refresh channel closed".to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_fetch(counter: Arc<AtomicUsize>, url: &'static str) -> FetchFn {
        Arc::new(move || {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(url.to_string())
            })
        })
    }

    #[tokio::test]
    async fn fresh_url_needs_no_fetch() {
        let counter = Arc::new(AtomicUsize::new(0));
        let provider = SharedUrlProvider::new(
            "https://example/initial".to_string(),
            Duration::from_secs(5),
            counting_fetch(counter.clone(), "https://example/refreshed"),
        );
        assert_eq!(provider.get_url().await.unwrap(), "https://example/initial");
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn concurrent_callers_after_invalidate_share_one_fetch() {
        let counter = Arc::new(AtomicUsize::new(0));
        let provider = Arc::new(SharedUrlProvider::new(
            "https://example/initial".to_string(),
            Duration::from_secs(5),
            counting_fetch(counter.clone(), "https://example/refreshed"),
        ));
        provider.invalidate().await;

        let mut handles = Vec::new();
        for _ in 0..5 {
            let provider = provider.clone();
            handles.push(tokio::spawn(async move { provider.get_url().await.unwrap() }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), "https://example/refreshed");
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
