//! Explicit configuration and client handles threaded through every
//! component. Nothing here is read from a process-wide global: the original
//! system mutates process env vars for transport/registry overrides during
//! tests, this reimplementation passes an [`HttpClient`] and [`RegistryConfig`]
//! to whatever needs them instead (see DESIGN.md).

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

use kube::Client as KubeClient;
use reqwest::Client as HttpClient;

/// Roots discovered at the project root; each must contain an `entry.cue`.
pub const APPS_ROOT: &str = "apps";
pub const INFRA_ROOT: &str = "infra";

/// Per-operation deadlines. Exceeding one yields a retryable error (spec §5).
#[derive(Debug, Clone)]
pub struct Timeouts {
    pub pull: Duration,
    pub apply: Duration,
    pub render: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            pull: Duration::from_secs(60),
            apply: Duration::from_secs(30),
            render: Duration::from_secs(15),
        }
    }
}

/// Registry overrides used in place of env-var based transport tweaks.
#[derive(Debug, Clone, Default)]
pub struct RegistryConfig {
    /// Overrides the base URL used to resolve imported CUE modules.
    pub module_registry_base_url: Option<String>,
    /// Extra root CA bundle for self-hosted registries, PEM encoded.
    pub extra_root_ca_pem: Option<String>,
}

/// Threaded into every reconciling component. Construction owns the
/// long-lived `HttpClient`/`KubeClient`; nothing here is cloned from a
/// process-wide static.
#[derive(Clone)]
pub struct Config {
    pub project_root: PathBuf,
    pub inventory_root: PathBuf,
    pub field_manager: String,
    pub worker_pool_size: NonZeroUsize,
    pub timeouts: Timeouts,
    pub registry: RegistryConfig,
    pub http_client: HttpClient,
    pub kube_client: KubeClient,
}

impl Config {
    pub fn worker_pool_size_or_default(requested: Option<usize>) -> NonZeroUsize {
        requested
            .and_then(NonZeroUsize::new)
            .or_else(|| std::thread::available_parallelism().ok())
            .unwrap_or(NonZeroUsize::new(1).expect("1 is non-zero"))
    }
}
