//! Walks a compiled package and emits validated component instances plus the
//! update instructions extracted from `@update` attributes (spec §4.2). Pure
//! function of the compiler's output: no I/O, no observable side effects.

use serde_json::{Map, Number, Value};
use thiserror::Error;

use crate::decl_compiler::{CompiledPackage, CompiledValue, FieldKind};
use crate::errors::ErrorClass;
use crate::model::{
    Chart, ChartAuth, CloudProvider, CrdSettings, ExtendedUnstructured, Instance, IntegrationMode, ManifestInstance,
    MetaNode, Patches, ReleaseDeclaration, ReleaseInstance, UpdateInstruction, UpdateStrategy, UpdateTarget, patch_key,
};

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("missing required field `{0}`")]
    MissingField(String),

    #[error("component has an unrecognized or missing `type` field")]
    WrongComponentFormat,
}

impl BuildError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::Structural
    }
}

pub struct BuildResult {
    pub instances: Vec<Instance>,
    pub update_instructions: Vec<UpdateInstruction>,
    pub warnings: Vec<String>,
}

pub struct Builder<'a> {
    file: &'a str,
}

impl<'a> Builder<'a> {
    pub fn new(file: &'a str) -> Self {
        Builder { file }
    }

    /// `build(package_path, project_root)` per spec §4.2: here `pkg` is
    /// already the compiler's output (compilation is the caller's concern,
    /// done by [`crate::decl_compiler::DeclCompiler`]) so this stays pure.
    pub fn build(&self, pkg: &CompiledPackage) -> Result<BuildResult, BuildError> {
        let mut instances = Vec::new();
        let mut update_instructions = Vec::new();
        let mut warnings = Vec::new();

        for (_name, field) in pkg.value().fields() {
            let Some(field) = field.resolved() else { continue };
            let type_tag = field
                .field("type")
                .and_then(|t| t.resolved())
                .and_then(|t| t.as_str())
                .ok_or(BuildError::WrongComponentFormat)?;

            match type_tag {
                "Manifest" => instances.push(Instance::Manifest(self.decode_manifest(
                    field,
                    &mut update_instructions,
                    &mut warnings,
                )?)),
                "HelmRelease" => instances.push(Instance::ReleaseComponent(self.decode_release(
                    field,
                    &mut update_instructions,
                    &mut warnings,
                )?)),
                _ => return Err(BuildError::WrongComponentFormat),
            }
        }

        Ok(BuildResult {
            instances,
            update_instructions,
            warnings,
        })
    }

    fn decode_manifest(
        &self,
        field: CompiledValue<'_>,
        updates: &mut Vec<UpdateInstruction>,
        warnings: &mut Vec<String>,
    ) -> Result<ManifestInstance, BuildError> {
        let id = required_str(field, "id")?;
        if id.is_empty() {
            return Err(BuildError::MissingField("id".to_string()));
        }
        let dependencies = string_list(field.field("dependencies"));

        let content_field = field.field("content").ok_or_else(|| BuildError::MissingField("content".to_string()))?;
        let mut path = Vec::new();
        let (content, metadata) = self.decode_node(content_field, &mut path, &id, updates, warnings);
        let content = content.unwrap_or(Value::Object(Map::new()));

        let manifest = ManifestInstance {
            id,
            dependencies,
            content,
            metadata,
        };
        if manifest.api_version().unwrap_or("").is_empty() {
            return Err(BuildError::MissingField("content.apiVersion".to_string()));
        }
        if manifest.kind().unwrap_or("").is_empty() {
            return Err(BuildError::MissingField("content.kind".to_string()));
        }
        if manifest.name().unwrap_or("").is_empty() {
            return Err(BuildError::MissingField("content.metadata.name".to_string()));
        }
        Ok(manifest)
    }

    fn decode_release(
        &self,
        field: CompiledValue<'_>,
        updates: &mut Vec<UpdateInstruction>,
        warnings: &mut Vec<String>,
    ) -> Result<ReleaseInstance, BuildError> {
        let id = required_str(field, "id")?;
        let dependencies = string_list(field.field("dependencies"));

        let name = required_str(field, "name")?;
        let namespace = required_str(field, "namespace")?;
        let chart_field = field.field("chart").ok_or_else(|| BuildError::MissingField("chart".to_string()))?;
        let chart = self.decode_chart(chart_field, updates)?;
        if chart.name.is_empty() || chart.repo_url.is_empty() || chart.version.is_empty() {
            return Err(BuildError::MissingField("chart.{name,repoURL,version}".to_string()));
        }
        if !(chart.repo_url.starts_with("oci://")
            || chart.repo_url.starts_with("http://")
            || chart.repo_url.starts_with("https://"))
        {
            return Err(BuildError::MissingField("chart.repoURL (unsupported scheme)".to_string()));
        }

        let mut path = Vec::new();
        let values = match field.field("values") {
            Some(v) => self.decode_node(v, &mut path, &id, updates, warnings).0.unwrap_or(Value::Null),
            None => Value::Null,
        };

        let patches = self.decode_patches(field.field("patches"), &id, updates, warnings);

        let allow_upgrade = field
            .field("crds")
            .and_then(|c| c.field("allowUpgrade"))
            .and_then(|a| a.resolved())
            .and_then(|a| a.as_bool())
            .unwrap_or(false);

        Ok(ReleaseInstance {
            id,
            dependencies,
            content: ReleaseDeclaration {
                name,
                namespace,
                chart,
                values,
                patches,
                crds: CrdSettings { allow_upgrade },
            },
        })
    }

    fn decode_chart(
        &self,
        field: CompiledValue<'_>,
        updates: &mut Vec<UpdateInstruction>,
    ) -> Result<Chart, BuildError> {
        let name = required_str(field, "name")?;
        let repo_url = required_str(field, "repoURL")?;
        let version = required_str(field, "version")?;

        let auth = if let Some(secret_ref) = field.field("auth").and_then(|a| a.field("secretRef")) {
            secret_ref.resolved().and_then(|v| v.as_str()).map(|s| ChartAuth::SecretRef {
                secret_ref: s.to_string(),
            })
        } else if let Some(wi) = field.field("auth").and_then(|a| a.field("workloadIdentity")) {
            wi.field("provider").and_then(|p| p.resolved()).and_then(|p| p.as_str()).and_then(|p| {
                let provider = match p {
                    "aws" => CloudProvider::Aws,
                    "gcp" => CloudProvider::Gcp,
                    "azure" => CloudProvider::Azure,
                    _ => return None,
                };
                Some(ChartAuth::WorkloadIdentity { provider })
            })
        } else {
            None
        };

        let chart = Chart {
            name,
            repo_url,
            version,
            auth,
        };

        if let Some(update_attr) = field.attr("update") {
            updates.push(UpdateInstruction {
                strategy: parse_strategy(update_attr.keyed("strategy")),
                constraint: update_attr.keyed("constraint").unwrap_or("*").to_string(),
                auth: update_attr.keyed("secret").map(|s| s.to_string()),
                integration: parse_integration(update_attr.keyed("integration")),
                file: self.file.to_string(),
                line: field.line(),
                target: UpdateTarget::ChartVersion { chart: chart.clone() },
            });
        }

        Ok(chart)
    }

    fn decode_patches(
        &self,
        field: Option<CompiledValue<'_>>,
        owning_id: &str,
        updates: &mut Vec<UpdateInstruction>,
        warnings: &mut Vec<String>,
    ) -> Patches {
        let mut patches = Patches::new();
        let Some(field) = field else { return patches };
        for entry in field.items() {
            let Some(entry) = entry.resolved() else { continue };
            let api_version = entry.field("apiVersion").and_then(|v| v.resolved()).and_then(|v| v.as_str());
            let kind = entry.field("kind").and_then(|v| v.resolved()).and_then(|v| v.as_str());
            let name = entry.field("name").and_then(|v| v.resolved()).and_then(|v| v.as_str());
            let namespace = entry.field("namespace").and_then(|v| v.resolved()).and_then(|v| v.as_str());
            let (Some(api_version), Some(kind), Some(name)) = (api_version, kind, name) else {
                warnings.push("patch entry missing apiVersion/kind/name, skipped".to_string());
                continue;
            };
            let key = patch_key(api_version, kind, namespace, name);
            let mut path = Vec::new();
            let (content, metadata) = match entry.field("patch") {
                Some(p) => self.decode_node(p, &mut path, owning_id, updates, warnings),
                None => (Some(Value::Null), MetaNode::default()),
            };
            patches.insert(
                key,
                ExtendedUnstructured {
                    content: content.unwrap_or(Value::Null),
                    metadata,
                },
            );
        }
        patches
    }

    /// Generic recursive decode used for `Manifest.content`, `HelmRelease.values`,
    /// and patch bodies. Returns `None` when the field is an unresolved
    /// disjunction with no default (§4.2: omitted, never emitted as `null`).
    fn decode_node(
        &self,
        field: CompiledValue<'_>,
        path: &mut Vec<String>,
        owning_id: &str,
        updates: &mut Vec<UpdateInstruction>,
        warnings: &mut Vec<String>,
    ) -> (Option<Value>, MetaNode) {
        let Some(resolved) = field.resolved() else {
            return (None, MetaNode::default());
        };
        let ignored = resolved.attr("ignore").map(|a| a.positional(0) == Some("conflict")).unwrap_or(false);

        let (value, mut meta) = match resolved.kind() {
            FieldKind::Struct => {
                let mut obj = Map::new();
                let mut children = std::collections::BTreeMap::new();
                for (name, child) in resolved.fields() {
                    path.push(name.to_string());
                    let (val, child_meta) = self.decode_node(child, path, owning_id, updates, warnings);
                    if name == "image" {
                        if let Some(update_attr) = child.attr("update") {
                            if let Some(image) = val.as_ref().and_then(|v| v.as_str()) {
                                updates.push(UpdateInstruction {
                                    strategy: parse_strategy(update_attr.keyed("strategy")),
                                    constraint: update_attr.keyed("constraint").unwrap_or("*").to_string(),
                                    auth: update_attr.keyed("secret").map(|s| s.to_string()),
                                    integration: parse_integration(update_attr.keyed("integration")),
                                    file: self.file.to_string(),
                                    line: child.line(),
                                    target: UpdateTarget::ContainerImage {
                                        image: image.to_string(),
                                        owning_node: owning_id.to_string(),
                                        key: path.join("."),
                                    },
                                });
                            } else {
                                warnings.push(format!("@update on non-string `image` field at {}", path.join(".")));
                            }
                        }
                    } else if child.attr("update").is_some() {
                        warnings.push(format!(
                            "@update attribute on non-image, non-chart field `{}` ignored",
                            path.join(".")
                        ));
                    }
                    if let Some(val) = val {
                        obj.insert(name.to_string(), val);
                    }
                    children.insert(name.to_string(), child_meta);
                    path.pop();
                }
                (
                    Some(Value::Object(obj)),
                    MetaNode::Branch {
                        meta: Default::default(),
                        children,
                    },
                )
            }
            FieldKind::List => {
                let mut arr = Vec::new();
                let mut items = Vec::new();
                for (i, item) in resolved.items().enumerate() {
                    path.push(i.to_string());
                    let (val, item_meta) = self.decode_node(item, path, owning_id, updates, warnings);
                    if let Some(val) = val {
                        arr.push(val);
                    }
                    items.push(item_meta);
                    path.pop();
                }
                (
                    Some(Value::Array(arr)),
                    MetaNode::List {
                        meta: Default::default(),
                        items,
                    },
                )
            }
            FieldKind::String => (resolved.as_str().map(|s| Value::String(s.to_string())), MetaNode::Leaf(Default::default())),
            FieldKind::Bytes => (
                resolved.as_bytes().map(|bytes| Value::Array(bytes.into_iter().map(Value::from).collect())),
                MetaNode::Leaf(Default::default()),
            ),
            FieldKind::Int => (resolved.as_i64().map(Value::from), MetaNode::Leaf(Default::default())),
            FieldKind::Float => (
                resolved.as_f64().and_then(Number::from_f64).map(Value::Number),
                MetaNode::Leaf(Default::default()),
            ),
            FieldKind::Bool => (resolved.as_bool().map(Value::Bool), MetaNode::Leaf(Default::default())),
            FieldKind::Bottom => (None, MetaNode::default()),
        };

        if ignored {
            meta.mark_ignored();
        }
        (value, meta)
    }
}

fn required_str(field: CompiledValue<'_>, name: &str) -> Result<String, BuildError> {
    field
        .field(name)
        .and_then(|f| f.resolved())
        .and_then(|f| f.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| BuildError::MissingField(name.to_string()))
}

fn string_list(field: Option<CompiledValue<'_>>) -> Vec<String> {
    match field {
        Some(f) => f
            .items()
            .filter_map(|i| i.resolved().and_then(|i| i.as_str()).map(|s| s.to_string()))
            .collect(),
        None => Vec::new(),
    }
}

fn parse_strategy(s: Option<&str>) -> UpdateStrategy {
    match s {
        Some("semver") | None => UpdateStrategy::Semver,
        Some(_) => UpdateStrategy::Semver,
    }
}

fn parse_integration(s: Option<&str>) -> IntegrationMode {
    match s {
        Some("direct") => IntegrationMode::Direct,
        Some("pr") => IntegrationMode::Pr,
        _ => IntegrationMode::default(),
    }
}
