//! Wraps the external schema compiler (spec §4.1). Out of scope per spec §1
//! ("the Git client, the YAML/JSON-schema emission for CRDs... are specified
//! only by interface"): this module only needs the compiler's *output*
//! contract, which is an invocation of the external `cue` binary asked to
//! emit an enriched JSON export — value tree, per-field kind, source line,
//! and attribute list in one document — rather than plain `cue export`'s bare
//! value JSON. The exact flag the real binary uses for that enriched export
//! is an implementation detail of the external tool (out of scope); this
//! module documents and parses the contract it depends on.

mod value;

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;

pub use value::{Attribute, AttrArg, CompiledValue, FieldKind, NamedNode, RawNode};

use crate::errors::ErrorClass;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("{path}: compile error: {message}")]
    Compile { path: String, message: String },

    #[error("{path}: validate error: {message}")]
    Validate { path: String, message: String },

    #[error("{path}: import error: {message}")]
    Import { path: String, message: String },

    #[error("compiler invocation failed: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("compiler timed out after {0:?}")]
    Timeout(Duration),

    #[error("compiler produced malformed output: {0}")]
    MalformedOutput(#[from] serde_json::Error),
}

impl CompileError {
    pub fn class(&self) -> ErrorClass {
        match self {
            CompileError::Compile { .. } | CompileError::Validate { .. } | CompileError::Import { .. } => {
                ErrorClass::Declarative
            }
            _ => ErrorClass::TransientInfra,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    kind: String,
    message: String,
}

/// A compiled package: the top-level fields of the package's root value,
/// in source declaration order.
pub struct CompiledPackage {
    pub root: RawNode,
}

impl CompiledPackage {
    pub fn value(&self) -> CompiledValue<'_> {
        CompiledValue::new(&self.root)
    }
}

/// Invokes the external compiler binary and decodes its enriched JSON export.
pub struct DeclCompiler {
    binary: String,
    timeout: Duration,
}

impl DeclCompiler {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        DeclCompiler {
            binary: binary.into(),
            timeout,
        }
    }

    #[instrument(skip(self), fields(package = %package_path.as_ref().display()))]
    pub async fn compile(
        &self,
        package_path: impl AsRef<Path>,
        project_root: impl AsRef<Path>,
        registry_base_url: Option<&str>,
    ) -> Result<CompiledPackage, CompileError> {
        let package_path = package_path.as_ref();
        let mut cmd = Command::new(&self.binary);
        cmd.arg("export")
            .arg("--out")
            .arg("json+meta") // enriched export: value + kind + line + attrs
            .arg("--root")
            .arg(project_root.as_ref())
            .arg(package_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(base) = registry_base_url {
            cmd.env("CUE_REGISTRY", base);
        }

        let child = cmd.spawn()?;
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| CompileError::Timeout(self.timeout))??;

        let path_display = package_path.display().to_string();
        if !output.status.success() {
            let envelope: ErrorEnvelope = serde_json::from_slice(&output.stderr).unwrap_or(ErrorEnvelope {
                kind: "compile".to_string(),
                message: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
            return Err(match envelope.kind.as_str() {
                "validate" => CompileError::Validate {
                    path: path_display,
                    message: envelope.message,
                },
                "import" => CompileError::Import {
                    path: path_display,
                    message: envelope.message,
                },
                _ => CompileError::Compile {
                    path: path_display,
                    message: envelope.message,
                },
            });
        }

        let root: RawNode = serde_json::from_slice(&output.stdout)?;
        Ok(CompiledPackage { root })
    }
}
