//! Composes graph-order traversal with a bounded worker pool, dispatching
//! each instance to [`ApplyClient`] or [`ChartEngine`], recording inventory
//! items, and garbage-collecting what the current pass no longer desires
//! (spec §4.8). Grounded on qovery-engine's
//! `cloud_provider::helm::deploy_parallel_charts`: a bounded-concurrency
//! pool of spawned tasks joined back before the next dependency level is
//! allowed to start, generalized here from a fixed thread scope to an async
//! `tokio::sync::Semaphore` + `JoinSet` since this crate is async-native
//! (see SPEC_FULL.md §0).

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::apply::ApplyClient;
use crate::chart::ChartEngine;
use crate::config::Config;
use crate::errors::ReconcileError;
use crate::graph::DependencyGraph;
use crate::inventory::Inventory;
use crate::model::Instance;

/// Outcome of one reconcile pass: the inventory paths written and the
/// orphans that were deleted as a result of no longer being desired.
#[derive(Debug, Default)]
pub struct ReconcileSummary {
    pub applied: Vec<PathBuf>,
    pub deleted: Vec<PathBuf>,
}

pub struct Reconciler {
    apply: Arc<ApplyClient>,
    chart_engine: Arc<ChartEngine>,
    inventory: Arc<Inventory>,
    worker_pool_size: usize,
}

impl Reconciler {
    pub fn new(apply: ApplyClient, chart_engine: ChartEngine, inventory: Inventory, config: &Config) -> Self {
        Reconciler {
            apply: Arc::new(apply),
            chart_engine: Arc::new(chart_engine),
            inventory: Arc::new(inventory),
            worker_pool_size: config.worker_pool_size.get(),
        }
    }

    /// Runs one full reconcile pass over `graph` (spec §4.8): topologically
    /// sorts it, dispatches dependency-free instances onto a bounded pool
    /// eagerly, drains the pool before the first instance that has
    /// dependencies (the conservative level-scheduling approximation spec §5
    /// allows), records an inventory item per successful apply, then
    /// deletes whatever the previous pass recorded that this pass didn't
    /// touch.
    #[instrument(skip(self, graph))]
    pub async fn reconcile(&self, graph: &DependencyGraph) -> Result<ReconcileSummary, ReconcileError> {
        let before = self.inventory.snapshot()?;
        let ordered = graph.topological_sort()?;

        let semaphore = Arc::new(Semaphore::new(self.worker_pool_size));
        let mut in_flight: JoinSet<Result<PathBuf, ReconcileError>> = JoinSet::new();
        let mut applied = Vec::new();

        for instance in ordered {
            if instance.dependencies().is_empty() {
                let permit = semaphore.clone().acquire_owned().await.expect("semaphore never closed");
                let apply = self.apply.clone();
                let chart_engine = self.chart_engine.clone();
                let inventory = self.inventory.clone();
                in_flight.spawn(async move {
                    let _permit = permit;
                    apply_one(instance, apply, chart_engine, inventory).await
                });
            } else {
                drain(&mut in_flight, &mut applied).await?;
                let path = apply_one(instance, self.apply.clone(), self.chart_engine.clone(), self.inventory.clone()).await?;
                applied.push(path);
            }
        }
        drain(&mut in_flight, &mut applied).await?;

        let write_set: HashSet<PathBuf> = applied.iter().cloned().collect();
        let orphans: Vec<PathBuf> = before.difference(&write_set).cloned().collect();
        let deleted = self.garbage_collect(orphans).await?;

        Ok(ReconcileSummary { applied, deleted })
    }

    /// Deletes every orphaned inventory item, ordering the deletes so a
    /// dependent is torn down before the dependency it relied on (the
    /// reverse of the apply order; spec §4.8's "reverse dependency order").
    /// An orphan's own `dependencies` travel with its persisted record, so
    /// we rebuild a small graph over just the orphan set and sort it the
    /// same way the main pass does, dropping edges to ids outside that set
    /// since those components are still desired and were never removed.
    async fn garbage_collect(&self, orphans: Vec<PathBuf>) -> Result<Vec<PathBuf>, ReconcileError> {
        if orphans.is_empty() {
            return Ok(Vec::new());
        }

        let mut loaded: Vec<(PathBuf, Instance)> = Vec::with_capacity(orphans.len());
        for path in &orphans {
            let instance = self.load_orphan(path)?;
            loaded.push((path.clone(), instance));
        }
        let orphan_ids: HashSet<&str> = loaded.iter().map(|(_, i)| i.id()).collect();

        let mut graph = DependencyGraph::new();
        for (_, instance) in &loaded {
            let trimmed = trim_to_known(instance, &orphan_ids);
            graph.insert(trimmed)?;
        }
        let mut order = graph.topological_sort()?;
        order.reverse(); // dependents first, same rationale as apply order reversed

        let by_id: std::collections::HashMap<&str, &PathBuf> = loaded.iter().map(|(p, i)| (i.id(), p)).collect();
        let mut deleted = Vec::with_capacity(order.len());
        for instance in &order {
            let path = (*by_id.get(instance.id()).expect("every sorted id came from `loaded`")).clone();
            self.delete_orphan(instance).await?;
            self.inventory.remove(&path)?;
            deleted.push(path);
        }
        Ok(deleted)
    }

    fn load_orphan(&self, path: &PathBuf) -> Result<Instance, ReconcileError> {
        if path.file_name().and_then(|f| f.to_str()).is_some_and(|f| f.ends_with("_HelmRelease.json")) {
            Ok(Instance::ReleaseComponent(self.inventory.read_release(path)?))
        } else {
            Ok(Instance::Manifest(self.inventory.read_manifest(path)?))
        }
    }

    async fn delete_orphan(&self, instance: &Instance) -> Result<(), ReconcileError> {
        match instance {
            Instance::Manifest(m) => {
                let api_version = m.api_version().unwrap_or_default();
                let kind = m.kind().unwrap_or_default();
                let name = m.name().unwrap_or_default();
                self.apply.delete_ref(api_version, kind, m.namespace(), name).await?;
            }
            Instance::ReleaseComponent(r) => {
                self.chart_engine.uninstall_release(&r.content.namespace, &r.content.name).await?;
            }
        }
        Ok(())
    }
}

async fn drain(
    in_flight: &mut JoinSet<Result<PathBuf, ReconcileError>>,
    applied: &mut Vec<PathBuf>,
) -> Result<(), ReconcileError> {
    while let Some(result) = in_flight.join_next().await {
        let path = result.expect("reconcile task panicked")?;
        applied.push(path);
    }
    Ok(())
}

async fn apply_one(
    instance: Instance,
    apply: Arc<ApplyClient>,
    chart_engine: Arc<ChartEngine>,
    inventory: Arc<Inventory>,
) -> Result<PathBuf, ReconcileError> {
    match instance {
        Instance::Manifest(manifest) => {
            apply.apply(&manifest).await?;
            let namespace = manifest.namespace().unwrap_or("default").to_string();
            let path = inventory.record_manifest(&namespace, &manifest.id, &manifest)?;
            Ok(path)
        }
        Instance::ReleaseComponent(release) => {
            chart_engine.reconcile(&release.content).await?;
            let path = inventory.record_release(&release.content.namespace, &release.id, &release)?;
            Ok(path)
        }
    }
}

/// Rewrites `instance`'s dependency list to only those ids present in
/// `known`, so the orphan-only sort never fails with `UnknownComponentID`
/// over a dependency that's still part of the live (non-orphaned) graph.
fn trim_to_known(instance: &Instance, known: &HashSet<&str>) -> Instance {
    let keep = |deps: &[String]| deps.iter().filter(|d| known.contains(d.as_str())).cloned().collect::<Vec<_>>();
    match instance {
        Instance::Manifest(m) => Instance::Manifest(crate::model::ManifestInstance {
            dependencies: keep(&m.dependencies),
            ..m.clone()
        }),
        Instance::ReleaseComponent(r) => Instance::ReleaseComponent(crate::model::ReleaseInstance {
            dependencies: keep(&r.dependencies),
            ..r.clone()
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trim_to_known_drops_edges_outside_the_orphan_set() {
        let instance = Instance::Manifest(crate::model::ManifestInstance {
            id: "web".to_string(),
            dependencies: vec!["db".to_string(), "still-desired".to_string()],
            content: serde_json::json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "web"}}),
            metadata: Default::default(),
        });
        let known: HashSet<&str> = ["web", "db"].into_iter().collect();
        let trimmed = trim_to_known(&instance, &known);
        assert_eq!(trimmed.dependencies(), &["db".to_string()]);
    }
}
