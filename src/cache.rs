//! Local content-addressed file cache.
//!
//! Avoids re-uploading (and, for a future download path, re-fetching)
//! identical content across runs on the same host. Layout is
//! `<root>/md5/<aa>/<bb>/<rest>`; writes land in a tempfile in the same
//! directory and are renamed into place, so readers never observe a partial
//! file.

use crate::hash::ContentDigest;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct Cache {
    root: PathBuf,
}

/// Outcome of a [`Cache::check`] call.
pub struct CacheLookup {
    pub path: PathBuf,
    pub hit: bool,
}

impl Cache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn content_path(&self, digest: ContentDigest) -> PathBuf {
        let hex = digest.to_hex();
        let (aa, rest) = hex.split_at(2);
        let (bb, rest) = rest.split_at(2);
        self.root.join("md5").join(aa).join(bb).join(rest)
    }

    /// Returns the content-addressed path for `(digest, size)` and whether a
    /// complete, correctly sized file already lives there.
    pub fn check(&self, digest: ContentDigest, size: u64) -> io::Result<CacheLookup> {
        let path = self.content_path(digest);
        let hit = match std::fs::metadata(&path) {
            Ok(meta) => meta.len() == size,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(e),
        };
        Ok(CacheLookup { path, hit })
    }

    /// Copy `src` into the cache under `digest`, best-effort: failures are
    /// logged and swallowed since the cache is strictly an optimization.
    pub fn insert_from_path(&self, digest: ContentDigest, src: &Path) {
        if let Err(e) = self.try_insert_from_path(digest, src) {
            warn!(error = %e, source = %src.display(), "failed to populate local artifact cache");
        }
    }

    fn try_insert_from_path(&self, digest: ContentDigest, src: &Path) -> io::Result<()> {
        let dest = self.content_path(digest);
        if dest.exists() {
            return Ok(());
        }
        let dir = dest.parent().expect("content path always has a parent");
        std::fs::create_dir_all(dir)?;
        let tmp = NamedTempFile::new_in(dir)?;
        std::fs::copy(src, tmp.path())?;
        // Idempotent: a concurrent writer racing on the same digest just
        // overwrites identical bytes with identical bytes.
        tmp.persist(&dest).map_err(|e| e.error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn miss_before_insert_then_hit_after() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path());
        let digest = ContentDigest::new(b"cached content");

        let before = cache.check(digest, 14).unwrap();
        assert!(!before.hit);

        let mut src = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut src, b"cached content").unwrap();
        cache.insert_from_path(digest, src.path());

        let after = cache.check(digest, 14).unwrap();
        assert!(after.hit);
    }

    #[test]
    fn size_mismatch_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path());
        let digest = ContentDigest::new(b"x");
        let mut src = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut src, b"x").unwrap();
        cache.insert_from_path(digest, src.path());

        let lookup = cache.check(digest, 999).unwrap();
        assert!(!lookup.hit);
    }

    #[test]
    fn layout_splits_hex_digest_into_two_prefix_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path());
        let digest = ContentDigest::new(b"layout check");
        let path = cache.content_path(digest);
        let rel = path.strip_prefix(dir.path()).unwrap();
        let mut components = rel.components();
        assert_eq!(components.next().unwrap().as_os_str(), "md5");
        let aa = components.next().unwrap().as_os_str().to_str().unwrap().to_string();
        assert_eq!(aa.len(), 2);
    }
}
