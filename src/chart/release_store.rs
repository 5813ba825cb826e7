//! Release history, mirroring Helm's own release-secret bookkeeping (spec
//! §4.7). Persisted as one JSON file per release under the inventory root,
//! using the same write-temp-then-rename helper as
//! [`crate::inventory::Inventory`].

use std::fs;
use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReleaseStatus {
    PendingInstall,
    Deployed,
    PendingUpgrade,
    PendingRollback,
    Failed,
    Uninstalling,
}

/// Identifies one object this release last applied, so an orphaned release
/// can be uninstalled (spec §4.8's "release orphans trigger uninstall")
/// without having to re-fetch and re-render the chart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectRef {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseRecord {
    pub name: String,
    pub namespace: String,
    pub revision: u32,
    pub status: ReleaseStatus,
    pub chart_version: String,
    pub digest: String,
    /// Digest of the post-render, post-patch object set (spec §4.7
    /// idempotence: "rendered content and digest"). Lets `ChartEngine`
    /// detect a `values`-only change that leaves the chart digest untouched.
    #[serde(default)]
    pub rendered_digest: String,
    #[serde(default)]
    pub objects: Vec<ObjectRef>,
}

pub struct ReleaseStore {
    root: PathBuf,
}

impl ReleaseStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        ReleaseStore { root: root.into() }
    }

    fn path(&self, namespace: &str, name: &str) -> PathBuf {
        self.root.join(namespace).join(format!("{name}.release.json"))
    }

    pub fn load(&self, namespace: &str, name: &str) -> io::Result<Option<ReleaseRecord>> {
        let path = self.path(namespace, name);
        if !path.is_file() {
            return Ok(None);
        }
        let bytes = fs::read(path)?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    pub fn save(&self, record: &ReleaseRecord) -> io::Result<()> {
        let path = self.path(&record.namespace, &record.name);
        let dir = path.parent().expect("release path always has a parent");
        fs::create_dir_all(dir)?;
        let tmp = tempfile::NamedTempFile::new_in(dir)?;
        fs::write(tmp.path(), serde_json::to_vec_pretty(record)?)?;
        tmp.persist(&path)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        Ok(())
    }

    pub fn delete(&self, namespace: &str, name: &str) -> io::Result<()> {
        let path = self.path(namespace, name);
        if path.is_file() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReleaseStore::new(dir.path());
        assert!(store.load("default", "web").unwrap().is_none());
        let record = ReleaseRecord {
            name: "web".to_string(),
            namespace: "default".to_string(),
            revision: 1,
            status: ReleaseStatus::Deployed,
            chart_version: "1.2.3".to_string(),
            digest: "sha256:abc".to_string(),
            rendered_digest: "deadbeef".to_string(),
            objects: vec![],
        };
        store.save(&record).unwrap();
        let loaded = store.load("default", "web").unwrap().unwrap();
        assert_eq!(loaded.revision, 1);
        assert_eq!(loaded.status, ReleaseStatus::Deployed);
    }
}
