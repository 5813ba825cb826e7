//! Content-addressed, on-disk cache of fetched chart archives (spec §4.5).
//! Same write-temp-then-rename pattern as [`crate::inventory::Inventory`],
//! keyed by the digest the fetcher resolved rather than by component ID.

use std::fs;
use std::io;
use std::path::PathBuf;

pub struct ChartCache {
    root: PathBuf,
}

impl ChartCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        ChartCache { root: root.into() }
    }

    fn entry_path(&self, digest: &str) -> PathBuf {
        self.root.join(format!("{digest}.tgz"))
    }

    pub fn get(&self, digest: &str) -> Option<PathBuf> {
        let path = self.entry_path(digest);
        path.is_file().then_some(path)
    }

    /// Stores `bytes` under `digest`, replacing any existing entry. The
    /// caller is expected to have verified `digest` against `bytes` already
    /// (spec §4.6 step 2); this type only persists, it does not verify.
    pub fn put(&self, digest: &str, bytes: &[u8]) -> io::Result<PathBuf> {
        fs::create_dir_all(&self.root)?;
        let tmp = tempfile::NamedTempFile::new_in(&self.root)?;
        fs::write(tmp.path(), bytes)?;
        let dest = self.entry_path(digest);
        tmp.persist(&dest)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        Ok(dest)
    }

    /// Evicts the least-recently-accessed entries (by mtime) until the
    /// cache's total size is at or below `max_bytes`. Optional: callers that
    /// never prune simply let the cache grow unbounded (spec §4.5's prune is
    /// explicitly an operator knob, not a correctness requirement).
    pub fn prune(&self, max_bytes: u64) -> io::Result<()> {
        if !self.root.exists() {
            return Ok(());
        }
        let mut entries: Vec<(PathBuf, u64, std::time::SystemTime)> = Vec::new();
        let mut total = 0u64;
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if meta.is_file() {
                total += meta.len();
                entries.push((entry.path(), meta.len(), meta.modified()?));
            }
        }
        if total <= max_bytes {
            return Ok(());
        }
        entries.sort_by_key(|(_, _, modified)| *modified);
        for (path, size, _) in entries {
            if total <= max_bytes {
                break;
            }
            fs::remove_file(&path)?;
            total = total.saturating_sub(size);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ChartCache::new(dir.path());
        assert!(cache.get("sha256:abc").is_none());
        let path = cache.put("sha256:abc", b"chart bytes").unwrap();
        assert_eq!(cache.get("sha256:abc"), Some(path));
    }

    #[test]
    fn prune_keeps_cache_under_budget() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ChartCache::new(dir.path());
        cache.put("a", &[0u8; 10]).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        cache.put("b", &[0u8; 10]).unwrap();
        cache.prune(10).unwrap();
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
    }
}
