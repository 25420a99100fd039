//! Aggregate upload progress and failure counters shared across stages.

use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Default, Clone)]
struct FileStat {
    size: u64,
    uploaded: u64,
    is_artifact_file: bool,
    deduped: bool,
    failed: bool,
}

/// Mutex-guarded counters for one save() call's worth of file traffic.
///
/// Mirrors the single-mutex-around-all-mutations shape used elsewhere in this
/// crate for small, frequently touched shared state (see
/// [`crate::url_provider::SharedUrlProvider`]).
#[derive(Debug, Default)]
pub struct Stats {
    files: Mutex<HashMap<String, FileStat>>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn init_file(&self, save_name: &str, size: u64) {
        let mut files = self.files.lock().unwrap();
        files.insert(
            save_name.to_string(),
            FileStat {
                size,
                ..Default::default()
            },
        );
    }

    pub fn mark_artifact_file(&self, save_name: &str) {
        let mut files = self.files.lock().unwrap();
        if let Some(stat) = files.get_mut(save_name) {
            stat.is_artifact_file = true;
        }
    }

    /// Advance (or, with a negative `delta`, rewind on retry) the uploaded
    /// byte counter for `save_name`.
    pub fn update_uploaded_file(&self, save_name: &str, delta: i64) {
        let mut files = self.files.lock().unwrap();
        if let Some(stat) = files.get_mut(save_name) {
            stat.uploaded = (stat.uploaded as i64 + delta).max(0) as u64;
        }
    }

    pub fn update_failed_file(&self, save_name: &str) {
        let mut files = self.files.lock().unwrap();
        if let Some(stat) = files.get_mut(save_name) {
            stat.failed = true;
        }
    }

    pub fn set_file_deduped(&self, save_name: &str) {
        let mut files = self.files.lock().unwrap();
        if let Some(stat) = files.get_mut(save_name) {
            stat.deduped = true;
        }
    }

    pub fn uploaded_bytes(&self, save_name: &str) -> u64 {
        self.files
            .lock()
            .unwrap()
            .get(save_name)
            .map(|s| s.uploaded)
            .unwrap_or(0)
    }

    pub fn failed_count(&self) -> usize {
        self.files.lock().unwrap().values().filter(|s| s.failed).count()
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.lock().unwrap().values().map(|s| s.size).sum()
    }

    pub fn uploaded_total_bytes(&self) -> u64 {
        self.files.lock().unwrap().values().map(|s| s.uploaded).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_progress_and_retry_rewind() {
        let stats = Stats::new();
        stats.init_file("a.bin", 100);
        stats.update_uploaded_file("a.bin", 40);
        assert_eq!(stats.uploaded_bytes("a.bin"), 40);
        stats.update_uploaded_file("a.bin", -40);
        assert_eq!(stats.uploaded_bytes("a.bin"), 0);
    }

    #[test]
    fn counts_failures_independently_per_file() {
        let stats = Stats::new();
        stats.init_file("a.bin", 10);
        stats.init_file("b.bin", 10);
        stats.update_failed_file("a.bin");
        assert_eq!(stats.failed_count(), 1);
    }

    #[test]
    fn total_bytes_sums_across_files() {
        let stats = Stats::new();
        stats.init_file("a.bin", 10);
        stats.init_file("b.bin", 20);
        assert_eq!(stats.total_bytes(), 30);
    }
}
