//! On-disk record of everything last applied to the cluster (spec §3, §4.8).
//! Layout: `<root>/<namespace>/<component_id>/<Kind>_<apiVersion>_<name>.json`
//! for manifests, `<root>/<namespace>/<component_id>/<name>_HelmRelease.json`
//! for releases. Writes are content-addressed by that path and atomic
//! (write to a sibling temp file, then rename), the same pattern
//! qovery-engine uses to move a freshly-cloned chart directory into place
//! in `deploy_helm_chart::prepare_helm_chart` (`fs::rename(tmpdir..., dest)`)
//! generalized from directories to single JSON files.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::model::{ManifestInstance, ReleaseInstance};

pub struct Inventory {
    root: PathBuf,
}

impl Inventory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Inventory { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn component_dir(&self, namespace: &str, component_id: &str) -> PathBuf {
        self.root.join(namespace).join(component_id)
    }

    fn manifest_path(&self, namespace: &str, component_id: &str, manifest: &ManifestInstance) -> PathBuf {
        let kind = manifest.kind().unwrap_or("Unknown");
        let api_version = manifest.api_version().unwrap_or("v0").replace('/', "_");
        let name = manifest.name().unwrap_or(&manifest.id);
        self.component_dir(namespace, component_id)
            .join(format!("{kind}_{api_version}_{name}.json"))
    }

    fn release_path(&self, namespace: &str, component_id: &str, release: &ReleaseInstance) -> PathBuf {
        self.component_dir(namespace, component_id)
            .join(format!("{}_HelmRelease.json", release.content.name))
    }

    /// Persists the manifest under its content-addressed path, replacing any
    /// prior record at that path. Returns the path so the caller can include
    /// it in the pass's write-set for post-pass GC (spec §4.8).
    pub fn record_manifest(
        &self,
        namespace: &str,
        component_id: &str,
        manifest: &ManifestInstance,
    ) -> io::Result<PathBuf> {
        let path = self.manifest_path(namespace, component_id, manifest);
        write_atomic(&path, &serde_json::to_vec_pretty(manifest)?)?;
        Ok(path)
    }

    pub fn record_release(
        &self,
        namespace: &str,
        component_id: &str,
        release: &ReleaseInstance,
    ) -> io::Result<PathBuf> {
        let path = self.release_path(namespace, component_id, release);
        write_atomic(&path, &serde_json::to_vec_pretty(release)?)?;
        Ok(path)
    }

    pub fn read_manifest(&self, path: &Path) -> io::Result<ManifestInstance> {
        let bytes = fs::read(path)?;
        serde_json::from_slice(&bytes).map_err(io::Error::from)
    }

    pub fn read_release(&self, path: &Path) -> io::Result<ReleaseInstance> {
        let bytes = fs::read(path)?;
        serde_json::from_slice(&bytes).map_err(io::Error::from)
    }

    /// Every record path currently on disk, relative to `root`. The
    /// reconciler diffs this set taken before and after a pass to find
    /// records nothing wrote this time and deletes them (spec §4.8).
    pub fn snapshot(&self) -> io::Result<HashSet<PathBuf>> {
        if !self.root.exists() {
            return Ok(HashSet::new());
        }
        let mut paths = HashSet::new();
        for entry in walkdir::WalkDir::new(&self.root) {
            let entry = entry.map_err(io::Error::from)?;
            if entry.file_type().is_file() {
                paths.insert(entry.path().to_path_buf());
            }
        }
        Ok(paths)
    }

    pub fn remove(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)?;
        if let Some(parent) = path.parent() {
            let _ = fs::remove_dir(parent); // best-effort: only succeeds when empty
        }
        Ok(())
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = path.parent().ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    fs::create_dir_all(dir)?;
    let tmp = tempfile::NamedTempFile::new_in(dir)?;
    fs::write(tmp.path(), bytes)?;
    tmp.persist(path)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manifest() -> ManifestInstance {
        ManifestInstance {
            id: "web".to_string(),
            dependencies: vec![],
            content: json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "web-config"}}),
            metadata: Default::default(),
        }
    }

    #[test]
    fn records_and_reads_back_a_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let inventory = Inventory::new(dir.path());
        let instance = manifest();
        let path = inventory.record_manifest("default", "web", &instance).unwrap();
        assert!(path.exists());
        let read_back = inventory.read_manifest(&path).unwrap();
        assert_eq!(read_back.id, "web");
    }

    #[test]
    fn snapshot_and_gc_diff() {
        let dir = tempfile::tempdir().unwrap();
        let inventory = Inventory::new(dir.path());
        let instance = manifest();
        let before = inventory.snapshot().unwrap();
        let path = inventory.record_manifest("default", "web", &instance).unwrap();
        let after = inventory.snapshot().unwrap();
        let stale: Vec<_> = before.difference(&after).collect();
        assert!(stale.is_empty());
        let now_missing: Vec<_> = after.difference(&before).collect();
        assert_eq!(now_missing, vec![&path]);
        inventory.remove(&path).unwrap();
        assert!(!path.exists());
    }
}
