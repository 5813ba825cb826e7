//! Drives the per-release install/upgrade state machine (spec §4.7).

use std::sync::Arc;
use std::time::Duration;

use retry::delay::Exponential;

use crate::apply::{ApplyError, ClusterApply};
use crate::chart::cache::ChartCache;
use crate::chart::fetcher::{ChartSource, FetchError};
use crate::chart::postrender::PostRenderer;
use crate::chart::release_store::{ObjectRef, ReleaseRecord, ReleaseStatus, ReleaseStore};
use crate::chart::render::{RenderError, Renderer};
use crate::errors::ErrorClass;
use crate::model::{Chart, ReleaseDeclaration};

#[derive(Debug, thiserror::Error)]
pub enum ChartEngineError {
    #[error("release `{0}` in namespace `{1}` is currently being uninstalled")]
    ConcurrentUninstall(String, String),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error("release i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChartEngineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ChartEngineError::ConcurrentUninstall(..) => ErrorClass::TransientInfra,
            ChartEngineError::Fetch(e) => e.class(),
            ChartEngineError::Render(e) => e.class(),
            ChartEngineError::Apply(e) => e.class(),
            ChartEngineError::Io(_) => ErrorClass::TransientInfra,
        }
    }
}

pub struct ChartEngine {
    fetcher: Arc<dyn ChartSource>,
    cache: ChartCache,
    renderer: Renderer,
    postrenderer: PostRenderer,
    releases: ReleaseStore,
    apply: Arc<dyn ClusterApply>,
    /// Per-operation deadline for template rendering (spec §5's "render"
    /// timeout; `config.timeouts.render`), since `Renderer::render` is
    /// synchronous and must be bounded through `render_with_timeout`.
    render_timeout: Duration,
}

impl ChartEngine {
    pub fn new(
        fetcher: Arc<dyn ChartSource>,
        cache: ChartCache,
        releases: ReleaseStore,
        apply: Arc<dyn ClusterApply>,
        render_timeout: Duration,
    ) -> Self {
        ChartEngine {
            fetcher,
            cache,
            renderer: Renderer::new(),
            postrenderer: PostRenderer::new(),
            releases,
            apply,
            render_timeout,
        }
    }

    #[instrument(skip(self, declaration), fields(name = %declaration.name, namespace = %declaration.namespace))]
    pub async fn reconcile(&self, declaration: &ReleaseDeclaration) -> Result<ReleaseRecord, ChartEngineError> {
        let existing = self.releases.load(&declaration.namespace, &declaration.name)?;

        match existing.as_ref().map(|r| r.status) {
            None => self.install(declaration, 1).await,
            Some(ReleaseStatus::Deployed) | Some(ReleaseStatus::Failed) => {
                self.upgrade(declaration, existing.unwrap()).await
            }
            Some(ReleaseStatus::PendingInstall) => {
                self.releases.delete(&declaration.namespace, &declaration.name)?;
                self.install(declaration, 1).await
            }
            Some(ReleaseStatus::PendingUpgrade) | Some(ReleaseStatus::PendingRollback) => {
                let mut recovered = existing.unwrap();
                recovered.status = ReleaseStatus::Deployed;
                self.releases.save(&recovered)?;
                self.upgrade(declaration, recovered).await
            }
            Some(ReleaseStatus::Uninstalling) => Err(ChartEngineError::ConcurrentUninstall(
                declaration.name.clone(),
                declaration.namespace.clone(),
            )),
        }
    }

    async fn install(&self, declaration: &ReleaseDeclaration, revision: u32) -> Result<ReleaseRecord, ChartEngineError> {
        let (archive, digest) = self.fetch_and_cache(&declaration.chart, &declaration.namespace).await?;
        let objects = self.render_and_postrender(&archive, declaration, None).await?;
        let rendered_digest = content_digest(&objects);

        let pending = ReleaseRecord {
            name: declaration.name.clone(),
            namespace: declaration.namespace.clone(),
            revision,
            status: ReleaseStatus::PendingInstall,
            chart_version: declaration.chart.version.clone(),
            digest: digest.clone(),
            rendered_digest: rendered_digest.clone(),
            objects: Vec::new(),
        };
        self.releases.save(&pending)?;

        self.apply.ensure_namespace(&declaration.namespace).await?;
        for object in &objects {
            self.apply.apply_raw(&declaration.namespace, object).await?;
        }

        let deployed = ReleaseRecord {
            status: ReleaseStatus::Deployed,
            objects: objects.iter().map(|(content, _)| object_ref(content, &declaration.namespace)).collect(),
            ..pending
        };
        self.releases.save(&deployed)?;
        Ok(deployed)
    }

    async fn upgrade(
        &self,
        declaration: &ReleaseDeclaration,
        previous: ReleaseRecord,
    ) -> Result<ReleaseRecord, ChartEngineError> {
        let (archive, digest) = self.fetch_and_cache(&declaration.chart, &declaration.namespace).await?;
        let objects = self.render_and_postrender(&archive, declaration, Some(declaration.crds.allow_upgrade)).await?;
        let rendered_digest = content_digest(&objects);

        if digest == previous.digest && rendered_digest == previous.rendered_digest {
            // spec §4.7 idempotence: neither the chart digest nor the
            // rendered+patched content changed (a `values`-only edit would
            // still change `rendered_digest` even with the chart pinned),
            // so skip the write entirely.
            return Ok(previous);
        }

        let pending = ReleaseRecord {
            status: ReleaseStatus::PendingUpgrade,
            ..previous.clone()
        };
        self.releases.save(&pending)?;

        for object in &objects {
            self.apply.apply_raw(&declaration.namespace, object).await?;
        }

        let deployed = ReleaseRecord {
            revision: previous.revision + 1,
            status: ReleaseStatus::Deployed,
            chart_version: declaration.chart.version.clone(),
            digest,
            rendered_digest,
            objects: objects.iter().map(|(content, _)| object_ref(content, &declaration.namespace)).collect(),
            ..previous
        };
        self.releases.save(&deployed)?;
        Ok(deployed)
    }

    /// Looks up `(namespace, name)`'s release record and uninstalls it if
    /// present, used by [`crate::reconciler::Reconciler`]'s orphan GC pass
    /// which only knows a release's identity (recovered from the inventory's
    /// own persisted [`crate::model::ReleaseInstance`]) and not its live
    /// object list. A no-op if the release record is already gone.
    #[instrument(skip(self), fields(%namespace, %name))]
    pub async fn uninstall_release(&self, namespace: &str, name: &str) -> Result<(), ChartEngineError> {
        match self.releases.load(namespace, name)? {
            Some(record) => self.uninstall(&record).await,
            None => Ok(()),
        }
    }

    /// Uninstalls a release whose declaration has disappeared from the
    /// desired state (spec §4.8's orphan garbage-collection pass), deleting
    /// exactly the objects it last applied without needing to re-fetch or
    /// re-render the chart.
    #[instrument(skip(self, record), fields(name = %record.name, namespace = %record.namespace))]
    pub async fn uninstall(&self, record: &ReleaseRecord) -> Result<(), ChartEngineError> {
        let mut uninstalling = record.clone();
        uninstalling.status = ReleaseStatus::Uninstalling;
        self.releases.save(&uninstalling)?;

        for object in &record.objects {
            self.apply
                .delete_ref(&object.api_version, &object.kind, object.namespace.as_deref(), &object.name)
                .await?;
        }

        self.releases.delete(&record.namespace, &record.name)?;
        Ok(())
    }

    async fn fetch_and_cache(&self, chart: &Chart, namespace: &str) -> Result<(Vec<u8>, String), ChartEngineError> {
        let (_, pinned) = chart.version_and_digest();
        if let Some(digest) = pinned {
            if let Some(path) = self.cache.get(digest) {
                return Ok((std::fs::read(path)?, digest.to_string()));
            }
        }

        let mut backoff = Exponential::from_millis(250).take(3);
        loop {
            match self.fetcher.fetch(chart, namespace).await {
                Ok((bytes, digest)) => {
                    self.cache.put(&digest, &bytes)?;
                    return Ok((bytes, digest));
                }
                Err(e) if e.class() == ErrorClass::TransientInfra => match backoff.next() {
                    Some(delay) => tokio::time::sleep(delay).await,
                    None => return Err(e.into()),
                },
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Renders templates under the configured deadline, strips CRDs when
    /// upgrading without `crds.allowUpgrade` (spec P6), and merges declared
    /// patches.
    async fn render_and_postrender(
        &self,
        archive: &[u8],
        declaration: &ReleaseDeclaration,
        allow_crd_upgrade: Option<bool>,
    ) -> Result<Vec<(serde_json::Value, crate::model::MetaNode)>, ChartEngineError> {
        let mut rendered = self
            .renderer
            .render_with_timeout(archive.to_vec(), declaration.values.clone(), self.render_timeout)
            .await?;
        if let Some(false) = allow_crd_upgrade {
            rendered.retain(|obj| !obj.template_path.contains("/crds/"));
        }
        let merged = self.postrenderer.apply(rendered, &declaration.patches);
        Ok(merged.into_iter().map(|m| (m.content, m.metadata)).collect())
    }
}

/// Hashes the post-render, post-patch object set so `upgrade()` can detect a
/// `values`-only change that leaves the chart digest untouched (spec §4.7's
/// "rendered content and digest" idempotence check). Not cryptographic —
/// only used to compare a release's own content against its own prior
/// content, never across releases or for integrity verification.
fn content_digest(objects: &[(serde_json::Value, crate::model::MetaNode)]) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    for (content, _) in objects {
        content.to_string().hash(&mut hasher);
    }
    format!("{:016x}", hasher.finish())
}

/// Extracts the identity of an applied object so it can be recorded on the
/// [`ReleaseRecord`] and later targeted for deletion by [`ChartEngine::uninstall`].
fn object_ref(content: &serde_json::Value, default_namespace: &str) -> ObjectRef {
    ObjectRef {
        api_version: content
            .get("apiVersion")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string(),
        kind: content
            .get("kind")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string(),
        namespace: Some(
            content
                .get("metadata")
                .and_then(|m| m.get("namespace"))
                .and_then(serde_json::Value::as_str)
                .unwrap_or(default_namespace)
                .to_string(),
        ),
        name: content
            .get("metadata")
            .and_then(|m| m.get("name"))
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use kube::api::DynamicObject;
    use serde_json::json;
    use std::io::Write as _;
    use std::sync::Mutex;

    use crate::model::{Chart, CrdSettings};

    fn build_archive(files: &[(&str, &str)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, body) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(body.len() as u64);
            header.set_cksum();
            builder.append_data(&mut header, path, body.as_bytes()).unwrap();
        }
        let tar_bytes = builder.into_inner().unwrap();
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&tar_bytes).unwrap();
        encoder.finish().unwrap()
    }

    struct FakeChartSource {
        archive: Vec<u8>,
        digest: String,
    }

    #[async_trait]
    impl ChartSource for FakeChartSource {
        async fn fetch(&self, _chart: &Chart, _namespace: &str) -> Result<(Vec<u8>, String), FetchError> {
            Ok((self.archive.clone(), self.digest.clone()))
        }
    }

    #[derive(Default)]
    struct FakeApply {
        applied: Mutex<Vec<serde_json::Value>>,
        deleted: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ClusterApply for FakeApply {
        async fn ensure_namespace(&self, _namespace: &str) -> Result<(), ApplyError> {
            Ok(())
        }

        async fn apply_raw(
            &self,
            _default_namespace: &str,
            object: &(serde_json::Value, crate::model::MetaNode),
        ) -> Result<DynamicObject, ApplyError> {
            self.applied.lock().unwrap().push(object.0.clone());
            Ok(DynamicObject {
                types: None,
                metadata: Default::default(),
                data: serde_json::Value::Null,
            })
        }

        async fn delete_ref(
            &self,
            _api_version: &str,
            _kind: &str,
            _namespace: Option<&str>,
            name: &str,
        ) -> Result<(), ApplyError> {
            self.deleted.lock().unwrap().push(name.to_string());
            Ok(())
        }
    }

    fn test_chart() -> Chart {
        Chart {
            name: "demo".to_string(),
            repo_url: "oci://registry.example.com/charts/demo".to_string(),
            version: "1.0.0".to_string(),
            auth: None,
        }
    }

    fn test_engine(archive: Vec<u8>, digest: &str, apply: Arc<FakeApply>) -> (ChartEngine, tempfile::TempDir, tempfile::TempDir) {
        let cache_dir = tempfile::tempdir().unwrap();
        let release_dir = tempfile::tempdir().unwrap();
        let engine = ChartEngine::new(
            Arc::new(FakeChartSource { archive, digest: digest.to_string() }),
            ChartCache::new(cache_dir.path()),
            ReleaseStore::new(release_dir.path()),
            apply,
            Duration::from_secs(5),
        );
        (engine, cache_dir, release_dir)
    }

    #[tokio::test]
    async fn install_renders_and_applies_every_object() {
        let archive = build_archive(&[(
            "demo/templates/configmap.yaml",
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {{ name }}\n",
        )]);
        let apply = Arc::new(FakeApply::default());
        let (engine, _cache, _releases) = test_engine(archive, "sha256:initial", apply.clone());

        let declaration = ReleaseDeclaration {
            name: "web".to_string(),
            namespace: "default".to_string(),
            chart: test_chart(),
            values: json!({"name": "web-config"}),
            patches: Default::default(),
            crds: CrdSettings::default(),
        };

        let record = engine.reconcile(&declaration).await.unwrap();
        assert_eq!(record.status, ReleaseStatus::Deployed);
        assert_eq!(record.revision, 1);
        assert_eq!(apply.applied.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn upgrade_is_a_no_op_when_nothing_changed() {
        let archive = build_archive(&[(
            "demo/templates/configmap.yaml",
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {{ name }}\n",
        )]);
        let apply = Arc::new(FakeApply::default());
        let (engine, _cache, _releases) = test_engine(archive, "sha256:initial", apply.clone());

        let declaration = ReleaseDeclaration {
            name: "web".to_string(),
            namespace: "default".to_string(),
            chart: test_chart(),
            values: json!({"name": "web-config"}),
            patches: Default::default(),
            crds: CrdSettings::default(),
        };

        let first = engine.reconcile(&declaration).await.unwrap();
        assert_eq!(apply.applied.lock().unwrap().len(), 1);

        let second = engine.reconcile(&declaration).await.unwrap();
        assert_eq!(second.revision, first.revision);
        // still 1: the unchanged values produced the same rendered_digest, so
        // upgrade() short-circuited before calling apply_raw again.
        assert_eq!(apply.applied.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn upgrade_applies_again_when_only_values_changed() {
        let archive = build_archive(&[(
            "demo/templates/configmap.yaml",
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {{ name }}\n  replicas: \"{{ replicas }}\"\n",
        )]);
        let apply = Arc::new(FakeApply::default());
        let (engine, _cache, _releases) = test_engine(archive, "sha256:pinned", apply.clone());

        let mut declaration = ReleaseDeclaration {
            name: "web".to_string(),
            namespace: "default".to_string(),
            chart: test_chart(),
            values: json!({"name": "web-config", "replicas": 1}),
            patches: Default::default(),
            crds: CrdSettings::default(),
        };

        let first = engine.reconcile(&declaration).await.unwrap();
        assert_eq!(apply.applied.lock().unwrap().len(), 1);

        declaration.values = json!({"name": "web-config", "replicas": 3});
        let second = engine.reconcile(&declaration).await.unwrap();

        // chart digest/version is pinned and unchanged, but the rendered
        // content changed, so the upgrade must not be skipped (the bug this
        // guards against silently dropped a values-only replica bump).
        assert_eq!(second.revision, first.revision + 1);
        assert_eq!(apply.applied.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn upgrade_strips_crds_unless_allow_upgrade_is_set() {
        let archive = build_archive(&[
            ("demo/templates/deployment.yaml", "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\n"),
            (
                "demo/crds/widgets.yaml",
                "apiVersion: apiextensions.k8s.io/v1\nkind: CustomResourceDefinition\nmetadata:\n  name: widgets.example.com\n",
            ),
        ]);
        let apply = Arc::new(FakeApply::default());
        let (engine, _cache, _releases) = test_engine(archive, "sha256:crds", apply.clone());

        let declaration = ReleaseDeclaration {
            name: "web".to_string(),
            namespace: "default".to_string(),
            chart: test_chart(),
            values: json!({}),
            patches: Default::default(),
            crds: CrdSettings { allow_upgrade: false },
        };

        // install always ships CRDs regardless of the upgrade flag.
        engine.reconcile(&declaration).await.unwrap();
        assert_eq!(apply.applied.lock().unwrap().len(), 2);

        // force a second render by tweaking values so upgrade() actually runs.
        let mut bumped = declaration.clone();
        bumped.values = json!({"bump": 1});
        engine.reconcile(&bumped).await.unwrap();
        // install's 2 + upgrade's 1 (CRD stripped): 3 total applied calls.
        assert_eq!(apply.applied.lock().unwrap().len(), 3);
    }
}
