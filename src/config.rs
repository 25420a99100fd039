//! Runtime configuration for the artifact upload pipeline.
//!
//! Mirrors the environment-driven path selection used elsewhere in this crate
//! family: staging and cache directories come from environment variables with
//! sane per-process fallbacks, while the batching/concurrency knobs have
//! conservative defaults tuned for the happy path and are overridable by
//! embedders that construct `PipelineConfig` directly.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Staging directory environment variable; falls back to [`std::env::temp_dir`].
pub const STAGING_DIR_ENV: &str = "ARTIFACT_STAGING_DIR";
/// Local content-addressed cache root environment variable.
pub const CACHE_DIR_ENV: &str = "ARTIFACT_CACHE_DIR";

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PipelineConfig {
    /// Upper bound on concurrently in-flight uploads across all artifacts.
    pub max_jobs: usize,
    /// Max wall-clock a prepare request may wait before its batch is flushed.
    #[serde(with = "duration_millis")]
    pub batch_time: Duration,
    /// Max gap between two consecutive arrivals within an open batch.
    #[serde(with = "duration_millis")]
    pub inter_event_time: Duration,
    /// Hard cap on the number of file specs in a single `createArtifactFiles` call.
    pub max_batch_size: usize,
    /// Files at or above this size use multipart upload instead of a single PUT.
    pub multipart_threshold_bytes: u64,
    /// Size of each part when uploading multipart.
    pub multipart_chunk_size_bytes: u64,
    /// Wall-clock budget for retrying a transient failure before giving up.
    #[serde(with = "duration_millis")]
    pub retry_budget: Duration,
    /// TTL window during which concurrent URL-refresh callers share one fetch.
    #[serde(with = "duration_millis")]
    pub url_refresh_ttl: Duration,
    /// Directory used for copy-on-enqueue staging copies.
    pub staging_dir: PathBuf,
    /// Root of the local content-addressed cache.
    pub cache_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_jobs: 64,
            batch_time: Duration::from_millis(200),
            inter_event_time: Duration::from_millis(50),
            max_batch_size: 10_000,
            multipart_threshold_bytes: 100 * 1024 * 1024,
            multipart_chunk_size_bytes: 16 * 1024 * 1024,
            retry_budget: Duration::from_secs(60 * 60 * 24 * 2),
            url_refresh_ttl: Duration::from_secs(5),
            staging_dir: std::env::temp_dir().join("artifact-upload-staging"),
            cache_dir: std::env::temp_dir().join("artifact-upload-cache"),
        }
    }
}

impl PipelineConfig {
    /// Build a config from the environment, falling back to [`PipelineConfig::default`]
    /// for anything not set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(dir) = std::env::var(STAGING_DIR_ENV) {
            config.staging_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var(CACHE_DIR_ENV) {
            config.cache_dir = PathBuf::from(dir);
        }
        config
    }

    /// A config tuned for the artifact saver's own short-lived prepare batcher:
    /// small time budgets so small artifacts don't pay batch-time latency, a
    /// large max-batch-size since one artifact's files arrive in a tight burst.
    pub fn saver_prepare_defaults(&self) -> Self {
        Self {
            batch_time: Duration::from_millis(100),
            inter_event_time: Duration::from_millis(10),
            max_batch_size: 10_000,
            ..self.clone()
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        (value.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_nonzero_budgets() {
        let config = PipelineConfig::default();
        assert!(config.max_jobs > 0);
        assert!(config.batch_time.as_millis() > 0);
        assert!(config.max_batch_size > 0);
    }

    #[test]
    fn saver_prepare_defaults_keep_other_fields() {
        let config = PipelineConfig::default();
        let saver = config.saver_prepare_defaults();
        assert_eq!(saver.max_jobs, config.max_jobs);
        assert!(saver.batch_time < config.batch_time);
    }

    #[test]
    fn from_env_overrides_staging_dir() {
        // SAFETY: test-local env var, not read concurrently elsewhere in this process.
        unsafe {
            std::env::set_var(STAGING_DIR_ENV, "/tmp/custom-staging");
        }
        let config = PipelineConfig::from_env();
        assert_eq!(config.staging_dir, PathBuf::from("/tmp/custom-staging"));
        unsafe {
            std::env::remove_var(STAGING_DIR_ENV);
        }
    }
}
