//! Server-side apply against the cluster (spec §4.4). Grounded on
//! qovery-engine's `kube_create_namespace_if_not_exists` /
//! `kube_copy_secret_to_another_namespace` (`infrastructure/models/kubernetes/mod.rs`):
//! the same `Api`/`Patch`/`PatchParams` shapes, generalized from the
//! teacher's fixed built-in types (`Namespace`, `Secret`) to an arbitrary
//! `DynamicObject` resolved through cluster discovery, and from 3-way merge
//! patch to server-side apply with a field manager.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams, PostParams};
use kube::core::{GroupVersionKind, ObjectMeta};
use kube::discovery;
use retry::delay::Exponential;
use thiserror::Error;

use crate::errors::ErrorClass;
use crate::model::{ManifestInstance, MetaNode};

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("manifest `{0}` has an empty or missing apiVersion")]
    MissingApiVersion(String),

    #[error("manifest `{0}` has an empty or missing kind")]
    MissingKind(String),

    #[error("manifest `{0}` has an empty or missing metadata.name")]
    MissingName(String),

    #[error("could not discover resource {group}/{version} {kind} on the cluster: {source}")]
    Discovery {
        group: String,
        version: String,
        kind: String,
        #[source]
        source: kube::Error,
    },

    #[error("server rejected apply of `{0}`: {1}")]
    Rejected(String, #[source] kube::Error),

    #[error("failed to build object payload for `{0}`: {1}")]
    Serialize(String, #[source] serde_json::Error),

    #[error("apply of `{0}` exceeded its configured deadline")]
    Timeout(String),
}

impl ApplyError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ApplyError::MissingApiVersion(_) | ApplyError::MissingKind(_) | ApplyError::MissingName(_) => {
                ErrorClass::Declarative
            }
            ApplyError::Serialize(..) => ErrorClass::Structural,
            ApplyError::Discovery { .. } | ApplyError::Rejected(..) | ApplyError::Timeout(_) => ErrorClass::TransientInfra,
        }
    }
}

/// Applies manifests to the cluster under a single field manager, stripping
/// `@ignore(conflict)` fields from the payload before it ever reaches the
/// API server (spec §4.4 step 2 — ignored fields must never appear in our
/// applied configuration, not merely be tolerated on conflict).
pub struct ApplyClient {
    client: kube::Client,
    field_manager: String,
    force: bool,
    /// Per-operation deadline (spec §5's "pull, apply, render" timeouts;
    /// `config.timeouts.apply`). Exceeding it surfaces as `ApplyError::Timeout`,
    /// classified `TransientInfra` so callers retry it like any other
    /// transient failure.
    timeout: Duration,
}

impl ApplyClient {
    pub fn new(client: kube::Client, field_manager: impl Into<String>, force: bool, timeout: Duration) -> Self {
        ApplyClient {
            client,
            field_manager: field_manager.into(),
            force,
            timeout,
        }
    }

    #[instrument(skip(self, manifest), fields(id = %manifest.id))]
    pub async fn apply(&self, manifest: &ManifestInstance) -> Result<DynamicObject, ApplyError> {
        let api_version = manifest
            .api_version()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ApplyError::MissingApiVersion(manifest.id.clone()))?;
        let kind = manifest
            .kind()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ApplyError::MissingKind(manifest.id.clone()))?;
        let name = manifest
            .name()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| ApplyError::MissingName(manifest.id.clone()))?;

        self.apply_content(
            api_version,
            kind,
            name,
            manifest.namespace(),
            manifest.content.clone(),
            &manifest.metadata,
            &manifest.id,
        )
        .await
    }

    /// Creates `namespace` if it doesn't already exist. Grounded directly on
    /// `kube_create_namespace_if_not_exists`: create, and treat a 409
    /// conflict (already exists) as success rather than an error.
    pub async fn ensure_namespace(&self, namespace: &str) -> Result<(), ApplyError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: None,
            status: None,
        };
        match tokio::time::timeout(self.timeout, api.create(&PostParams::default(), &ns)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(kube::Error::Api(e))) if e.code == 409 => Ok(()),
            Ok(Err(e)) => Err(ApplyError::Rejected(namespace.to_string(), e)),
            Err(_elapsed) => Err(ApplyError::Timeout(namespace.to_string())),
        }
    }

    /// Applies a chart-rendered object whose identity comes from the content
    /// tree itself rather than from a [`ManifestInstance`] (spec §4.7's
    /// `ChartEngine` applies its post-rendered objects through the same
    /// client and the same ignore-on-conflict stripping as hand-written
    /// manifests). `default_namespace` is used when the object carries no
    /// `metadata.namespace` of its own, matching Helm's own convention of
    /// templated objects inheriting the release namespace.
    #[instrument(skip(self, object, metadata), fields(%default_namespace))]
    pub async fn apply_raw(
        &self,
        default_namespace: &str,
        object: &(serde_json::Value, MetaNode),
    ) -> Result<DynamicObject, ApplyError> {
        let (content, metadata) = object;
        let label = content
            .get("metadata")
            .and_then(|m| m.get("name"))
            .and_then(serde_json::Value::as_str)
            .unwrap_or("<rendered>")
            .to_string();

        let api_version = content
            .get("apiVersion")
            .and_then(serde_json::Value::as_str)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ApplyError::MissingApiVersion(label.clone()))?;
        let kind = content
            .get("kind")
            .and_then(serde_json::Value::as_str)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ApplyError::MissingKind(label.clone()))?;
        let name = content
            .get("metadata")
            .and_then(|m| m.get("name"))
            .and_then(serde_json::Value::as_str)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| ApplyError::MissingName(label.clone()))?;
        let namespace = content
            .get("metadata")
            .and_then(|m| m.get("namespace"))
            .and_then(serde_json::Value::as_str)
            .unwrap_or(default_namespace);

        self.apply_content(api_version, kind, name, Some(namespace), content.clone(), metadata, &label)
            .await
    }

    /// Deletes a single cluster object by coordinates, tolerating a 404 as
    /// success. Used by the reconciler's garbage-collection pass and by
    /// [`crate::chart::ChartEngine::uninstall`] to tear down a release's
    /// previously-applied objects.
    #[instrument(skip(self), fields(%api_version, %kind, %name))]
    pub async fn delete_ref(
        &self,
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<(), ApplyError> {
        let (group, version) = match api_version.split_once('/') {
            Some((g, v)) => (g.to_string(), v.to_string()),
            None => (String::new(), api_version.to_string()),
        };
        let gvk = GroupVersionKind {
            group: group.clone(),
            version: version.clone(),
            kind: kind.to_string(),
        };

        let (api_resource, _caps) = self.discover(gvk, group, version, kind).await?;

        let api: Api<DynamicObject> = match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &api_resource),
            None => Api::all_with(self.client.clone(), &api_resource),
        };

        match tokio::time::timeout(self.timeout, api.delete(name, &DeleteParams::default())).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(kube::Error::Api(e))) if e.code == 404 => Ok(()),
            Ok(Err(e)) => Err(ApplyError::Rejected(name.to_string(), e)),
            Err(_elapsed) => Err(ApplyError::Timeout(name.to_string())),
        }
    }

    /// Resolves a `GroupVersionKind` against cluster discovery under the
    /// same configured deadline as every other cluster round-trip.
    async fn discover(
        &self,
        gvk: GroupVersionKind,
        group: String,
        version: String,
        kind: &str,
    ) -> Result<(kube::discovery::ApiResource, kube::discovery::ApiCapabilities), ApplyError> {
        match tokio::time::timeout(self.timeout, discovery::pinned_kind(&self.client, &gvk)).await {
            Ok(Ok(resolved)) => Ok(resolved),
            Ok(Err(source)) => Err(ApplyError::Discovery {
                group,
                version,
                kind: kind.to_string(),
                source,
            }),
            Err(_elapsed) => Err(ApplyError::Timeout(format!("{group}/{version} {kind} discovery"))),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply_content(
        &self,
        api_version: &str,
        kind: &str,
        name: &str,
        namespace: Option<&str>,
        mut payload: serde_json::Value,
        metadata: &MetaNode,
        label: &str,
    ) -> Result<DynamicObject, ApplyError> {
        let (group, version) = match api_version.split_once('/') {
            Some((g, v)) => (g.to_string(), v.to_string()),
            None => (String::new(), api_version.to_string()),
        };
        let gvk = GroupVersionKind {
            group: group.clone(),
            version: version.clone(),
            kind: kind.to_string(),
        };

        let (api_resource, _caps) = self.discover(gvk, group, version, kind).await?;

        let api: Api<DynamicObject> = match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &api_resource),
            None => Api::all_with(self.client.clone(), &api_resource),
        };

        metadata.strip(&mut payload);

        let mut object: DynamicObject =
            serde_json::from_value(payload).map_err(|e| ApplyError::Serialize(label.to_string(), e))?;
        object.types = Some(kube::api::TypeMeta {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
        });
        object.metadata = ObjectMeta {
            name: Some(name.to_string()),
            namespace: namespace.map(str::to_string),
            ..object.metadata
        };

        let mut params = PatchParams::apply(&self.field_manager);
        if self.force {
            params = params.force();
        }

        self.apply_with_retry(&api, name, &object, &params).await
    }

    async fn apply_with_retry(
        &self,
        api: &Api<DynamicObject>,
        name: &str,
        object: &DynamicObject,
        params: &PatchParams,
    ) -> Result<DynamicObject, ApplyError> {
        let mut backoff = Exponential::from_millis(200).take(4);
        loop {
            match tokio::time::timeout(self.timeout, api.patch(name, params, &Patch::Apply(object))).await {
                Ok(Ok(applied)) => return Ok(applied),
                Ok(Err(e)) if is_transient(&e) => match backoff.next() {
                    Some(delay) => {
                        warn!(name, error = %e, "transient apply failure, retrying");
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(ApplyError::Rejected(name.to_string(), e)),
                },
                Ok(Err(e)) => return Err(ApplyError::Rejected(name.to_string(), e)),
                Err(_elapsed) => match backoff.next() {
                    Some(delay) => {
                        warn!(name, "apply exceeded its deadline, retrying");
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(ApplyError::Timeout(name.to_string())),
                },
            }
        }
    }
}

/// The cluster-facing surface [`crate::chart::ChartEngine`] depends on,
/// split out so its install/upgrade/uninstall paths can be exercised against
/// an in-memory fake instead of a live cluster, mirroring
/// [`crate::updater::PullRequestClient`]'s trait-for-testability shape.
#[async_trait]
pub trait ClusterApply: Send + Sync {
    async fn ensure_namespace(&self, namespace: &str) -> Result<(), ApplyError>;

    async fn apply_raw(
        &self,
        default_namespace: &str,
        object: &(serde_json::Value, MetaNode),
    ) -> Result<DynamicObject, ApplyError>;

    async fn delete_ref(&self, api_version: &str, kind: &str, namespace: Option<&str>, name: &str) -> Result<(), ApplyError>;
}

#[async_trait]
impl ClusterApply for ApplyClient {
    async fn ensure_namespace(&self, namespace: &str) -> Result<(), ApplyError> {
        ApplyClient::ensure_namespace(self, namespace).await
    }

    async fn apply_raw(
        &self,
        default_namespace: &str,
        object: &(serde_json::Value, MetaNode),
    ) -> Result<DynamicObject, ApplyError> {
        ApplyClient::apply_raw(self, default_namespace, object).await
    }

    async fn delete_ref(&self, api_version: &str, kind: &str, namespace: Option<&str>, name: &str) -> Result<(), ApplyError> {
        ApplyClient::delete_ref(self, api_version, kind, namespace, name).await
    }
}

fn is_transient(err: &kube::Error) -> bool {
    match err {
        kube::Error::Api(api_err) => api_err.code == 429 || api_err.code >= 500,
        _ => false,
    }
}
