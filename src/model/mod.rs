//! Data model shared across the pipeline (spec §3): component instances,
//! charts, patches, and update instructions.

pub mod meta;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub use meta::{FieldMeta, MetaNode};

/// A user-authored declarative unit: either a raw cluster object or a
/// packaged-chart release.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Instance {
    Manifest(ManifestInstance),
    ReleaseComponent(ReleaseInstance),
}

impl Instance {
    pub fn id(&self) -> &str {
        match self {
            Instance::Manifest(m) => &m.id,
            Instance::ReleaseComponent(r) => &r.id,
        }
    }

    pub fn dependencies(&self) -> &[String] {
        match self {
            Instance::Manifest(m) => &m.dependencies,
            Instance::ReleaseComponent(r) => &r.dependencies,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestInstance {
    pub id: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub content: Value,
    #[serde(default)]
    pub metadata: MetaNode,
}

impl ManifestInstance {
    pub fn api_version(&self) -> Option<&str> {
        self.content.get("apiVersion")?.as_str()
    }

    pub fn kind(&self) -> Option<&str> {
        self.content.get("kind")?.as_str()
    }

    pub fn name(&self) -> Option<&str> {
        self.content.get("metadata")?.get("name")?.as_str()
    }

    pub fn namespace(&self) -> Option<&str> {
        self.content.get("metadata")?.get("namespace")?.as_str()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseInstance {
    pub id: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub content: ReleaseDeclaration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseDeclaration {
    pub name: String,
    pub namespace: String,
    pub chart: Chart,
    #[serde(default)]
    pub values: Value,
    #[serde(default)]
    pub patches: Patches,
    #[serde(default)]
    pub crds: CrdSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrdSettings {
    #[serde(default)]
    pub allow_upgrade: bool,
}

/// A versioned archive of templated cluster objects plus defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chart {
    pub name: String,
    pub repo_url: String,
    /// Either `"X"` or `"X@digest"`.
    pub version: String,
    #[serde(default)]
    pub auth: Option<ChartAuth>,
}

impl Chart {
    /// Splits the version field's optional `@digest` suffix, per §4.6 step 1.
    pub fn version_and_digest(&self) -> (&str, Option<&str>) {
        match self.version.split_once('@') {
            Some((v, d)) => (v, Some(d)),
            None => (&self.version, None),
        }
    }
}

/// A reference to a cluster-stored secret, or a workload-identity descriptor
/// naming a cloud provider. The compiler's disjunction must resolve to
/// exactly one shape (§4.2 step 2); both or neither is a `ValidateError`
/// surfaced by the `DeclCompiler`, never representable here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChartAuth {
    SecretRef { secret_ref: String },
    WorkloadIdentity { provider: CloudProvider },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloudProvider {
    Aws,
    Gcp,
    Azure,
}

/// Keyed by `"apiVersion-kind-namespace-name"` (namespace defaulted to
/// `"default"` when absent). Insertion order is irrelevant; keys are unique.
pub type Patches = BTreeMap<String, ExtendedUnstructured>;

/// A rendered-object patch: a content tree plus its own metadata tree, so
/// ignore-on-conflict annotations on patch fields flow through to
/// `ApplyClient` exactly like annotations on the original manifest (§4.7).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtendedUnstructured {
    pub content: Value,
    #[serde(default)]
    pub metadata: MetaNode,
}

pub fn patch_key(api_version: &str, kind: &str, namespace: Option<&str>, name: &str) -> String {
    format!("{api_version}-{kind}-{}-{name}", namespace.unwrap_or("default"))
}

/// An annotation-derived request to bump an image tag or chart version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateInstruction {
    pub strategy: UpdateStrategy,
    pub constraint: String,
    pub auth: Option<String>,
    pub integration: IntegrationMode,
    pub file: String,
    pub line: usize,
    pub target: UpdateTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateStrategy {
    Semver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrationMode {
    Direct,
    Pr,
}

impl Default for IntegrationMode {
    fn default() -> Self {
        IntegrationMode::Pr
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum UpdateTarget {
    ContainerImage {
        image: String,
        owning_node: String,
        key: String,
    },
    ChartVersion {
        chart: Chart,
    },
}
