//! Shared service state: per-project snapshots, the plan store and the
//! materialization dispatcher
//!
//! The stop set and matrix form an immutable snapshot per project. Every
//! operation reads the snapshot once at its start and works against that
//! copy; replacing the snapshot invalidates all materialized artifacts.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

use crate::materialize::Materializer;
use crate::plan_store::PlanStore;
use crate::types::{snapshot_hash, MatrixPair, StopSet};
use crate::validate::validate_matrix;
use crate::{PlanError, PlanResult};

/// One project's current stop set and matrix pair
#[derive(Debug)]
pub struct ProjectSnapshot {
    pub stops: StopSet,
    pub matrix: MatrixPair,
    pub snapshot_hash: String,
}

pub struct AppState {
    snapshots: RwLock<HashMap<String, Arc<ProjectSnapshot>>>,
    pub store: PlanStore,
    pub materializer: Materializer,
}

impl AppState {
    pub fn new(store: PlanStore, materializer: Materializer) -> Self {
        Self {
            snapshots: RwLock::new(HashMap::new()),
            store,
            materializer,
        }
    }

    /// Install a new snapshot for a project. All existing materializations
    /// become stale and are cleared.
    pub async fn set_snapshot(
        &self,
        project: &str,
        stops: Vec<crate::types::Stop>,
        matrix: MatrixPair,
    ) -> PlanResult<String> {
        let stops = StopSet::new(stops)?;
        validate_matrix(&stops, &matrix)?;
        let hash = snapshot_hash(&stops, &matrix);

        let replaced = {
            let mut snapshots = self.snapshots.write().await;
            snapshots
                .insert(
                    project.to_string(),
                    Arc::new(ProjectSnapshot {
                        stops,
                        matrix,
                        snapshot_hash: hash.clone(),
                    }),
                )
                .is_some()
        };
        if replaced {
            self.store.invalidate_materializations(project)?;
        }
        info!(project, hash = %hash, replaced, "installed stop/matrix snapshot");
        Ok(hash)
    }

    /// The snapshot an operation should work against, read once at start
    pub async fn snapshot(&self, project: &str) -> PlanResult<Arc<ProjectSnapshot>> {
        self.snapshots
            .read()
            .await
            .get(project)
            .cloned()
            .ok_or_else(|| PlanError::NotFound(format!("project '{}' has no snapshot", project)))
    }
}
