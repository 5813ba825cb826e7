//! Crate-level error surface (spec §7). Each component defines its own
//! `thiserror` enum; this module aggregates them into the boundary error type
//! and classifies which kinds are retried versus surfaced immediately,
//! mirroring how qovery-engine's `container_registry::errors` module stays
//! local to its component while `errors::mod` is the outward-facing type.

use thiserror::Error;

use crate::apply::ApplyError;
use crate::builder::BuildError;
use crate::chart::ChartEngineError;
use crate::chart::fetcher::FetchError;
use crate::decl_compiler::CompileError;
use crate::graph::GraphError;
use crate::updater::UpdateError;

/// Structural / programmer-error and input/declarative kinds that abort a
/// reconcile pass immediately; transient-infra kinds that were retried and
/// still failed after exhausting backoff surface as their underlying kind
/// here too (spec §7).
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("project at {path} is missing required entry `{entry}`")]
    MainComponentNotFound { path: String, entry: &'static str },

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error(transparent)]
    Chart(#[from] ChartEngineError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Update(#[from] UpdateError),

    #[error("inventory i/o error: {0}")]
    Inventory(#[from] std::io::Error),
}

/// Propagation policy bucket, spec §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Structural,
    Declarative,
    TransientInfra,
    Security,
}

impl ReconcileError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ReconcileError::MainComponentNotFound { .. } => ErrorClass::Structural,
            ReconcileError::Graph(_) | ReconcileError::Build(_) => ErrorClass::Structural,
            ReconcileError::Compile(_) => ErrorClass::Declarative,
            ReconcileError::Apply(e) => e.class(),
            ReconcileError::Chart(e) => e.class(),
            ReconcileError::Fetch(e) => e.class(),
            ReconcileError::Update(_) => ErrorClass::TransientInfra,
            ReconcileError::Inventory(_) => ErrorClass::TransientInfra,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::TransientInfra
    }
}
