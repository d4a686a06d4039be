//! On-disk persistence for plan artifacts and edit scenarios
//!
//! Each project owns a directory holding the optimization output, the
//! baseline materialized artifact and one {edit plan, artifact} pair per
//! scenario. Artifact writes go through a temp-file rename so readers never
//! observe a half-written file.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;

use crate::types::{EditPlan, EditPlanRow, OrderedPlan, PlanArtifact};
use crate::{PlanError, PlanResult};

/// Reserved scenario id for the implicit baseline
pub const BASELINE_ID: &str = "baseline";

const ORDERED_PLAN_FILE: &str = "optimized_plan.json";
const BASELINE_FILE: &str = "baseline.json";
const EDITS_DIR: &str = "edits";
const PLAN_SUFFIX: &str = ".plan.json";
const ARTIFACT_SUFFIX: &str = ".artifact.json";

/// Scenario ids: alphanumerics, dash and underscore only
pub fn validate_scenario_id(id: &str) -> PlanResult<()> {
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(PlanError::BadInput(format!(
            "scenario id '{}' must match [A-Za-z0-9_-]+",
            id
        )));
    }
    Ok(())
}

pub struct PlanStore {
    root: PathBuf,
    /// Per-(project, scenario) write serialization; reload runs take the
    /// same mutex so delta operations on one scenario are linearized
    locks: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl PlanStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Mutex guarding writes to one (project, scenario) pair
    pub fn scenario_mutex(&self, project: &str, scenario: &str) -> Arc<tokio::sync::Mutex<()>> {
        let key = format!("{}/{}", project, scenario);
        let mut locks = self.locks.lock().unwrap();
        locks.entry(key).or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))).clone()
    }

    fn project_dir(&self, project: &str) -> PathBuf {
        self.root.join(project)
    }

    fn edits_dir(&self, project: &str) -> PathBuf {
        self.project_dir(project).join(EDITS_DIR)
    }

    fn edit_plan_path(&self, project: &str, edit_id: &str) -> PathBuf {
        self.edits_dir(project).join(format!("{}{}", edit_id, PLAN_SUFFIX))
    }

    fn edit_artifact_path(&self, project: &str, edit_id: &str) -> PathBuf {
        self.edits_dir(project).join(format!("{}{}", edit_id, ARTIFACT_SUFFIX))
    }

    // Ordered plan (optimization output)

    pub fn save_ordered_plan(&self, project: &str, plan: &OrderedPlan) -> PlanResult<()> {
        self.write_json(&self.project_dir(project).join(ORDERED_PLAN_FILE), plan)
    }

    pub fn load_ordered_plan(&self, project: &str) -> PlanResult<OrderedPlan> {
        self.read_json(&self.project_dir(project).join(ORDERED_PLAN_FILE), "optimized plan")
    }

    // Baseline artifact

    pub fn save_baseline(&self, project: &str, artifact: &PlanArtifact) -> PlanResult<()> {
        self.write_json(&self.project_dir(project).join(BASELINE_FILE), artifact)
    }

    pub fn load_baseline(&self, project: &str) -> PlanResult<PlanArtifact> {
        self.read_json(&self.project_dir(project).join(BASELINE_FILE), "baseline artifact")
    }

    pub fn try_load_baseline(&self, project: &str) -> PlanResult<Option<PlanArtifact>> {
        match self.load_baseline(project) {
            Ok(artifact) => Ok(Some(artifact)),
            Err(PlanError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    // Edit scenarios

    pub fn list_edits(&self, project: &str) -> PlanResult<Vec<String>> {
        let dir = self.edits_dir(project);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(dir)? {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if let Some(id) = name.strip_suffix(PLAN_SUFFIX) {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Create a scenario as a deep copy of the source scenario (the baseline
    /// when no source is given)
    pub fn create_edit(&self, project: &str, edit_id: &str, source: Option<&str>) -> PlanResult<()> {
        validate_scenario_id(edit_id)?;
        if edit_id == BASELINE_ID {
            return Err(PlanError::BadInput("'baseline' is reserved".to_string()));
        }
        if self.edit_plan_path(project, edit_id).exists() {
            return Err(PlanError::BadInput(format!("scenario '{}' already exists", edit_id)));
        }

        let (plan, artifact) = match source {
            None | Some(BASELINE_ID) => {
                let ordered = self.load_ordered_plan(project)?;
                (EditPlan::from_ordered(&ordered), self.try_load_baseline(project)?)
            }
            Some(source_id) => (
                self.load_edit_plan(project, source_id)?,
                self.try_load_edit_artifact(project, source_id)?,
            ),
        };

        self.save_edit_plan(project, edit_id, &plan)?;
        if let Some(artifact) = artifact {
            self.save_edit_artifact(project, edit_id, &artifact)?;
        }
        info!(project, edit_id, source = source.unwrap_or(BASELINE_ID), "created edit scenario");
        Ok(())
    }

    /// Remove both the tabular and materialized forms of a scenario
    pub fn delete_edit(&self, project: &str, edit_id: &str) -> PlanResult<()> {
        if edit_id == BASELINE_ID {
            return Err(PlanError::BadInput("the baseline cannot be deleted".to_string()));
        }
        let plan_path = self.edit_plan_path(project, edit_id);
        if !plan_path.exists() {
            return Err(PlanError::NotFound(format!("scenario '{}'", edit_id)));
        }
        fs::remove_file(plan_path)?;
        let artifact_path = self.edit_artifact_path(project, edit_id);
        if artifact_path.exists() {
            fs::remove_file(artifact_path)?;
        }
        info!(project, edit_id, "deleted edit scenario");
        Ok(())
    }

    pub fn save_edit_plan(&self, project: &str, edit_id: &str, plan: &EditPlan) -> PlanResult<()> {
        self.write_json(&self.edit_plan_path(project, edit_id), plan)
    }

    pub fn load_edit_plan(&self, project: &str, edit_id: &str) -> PlanResult<EditPlan> {
        self.read_json(&self.edit_plan_path(project, edit_id), "edit plan")
    }

    pub fn save_edit_artifact(&self, project: &str, edit_id: &str, artifact: &PlanArtifact) -> PlanResult<()> {
        self.write_json(&self.edit_artifact_path(project, edit_id), artifact)
    }

    pub fn load_edit_artifact(&self, project: &str, edit_id: &str) -> PlanResult<PlanArtifact> {
        self.read_json(&self.edit_artifact_path(project, edit_id), "edit artifact")
    }

    pub fn try_load_edit_artifact(&self, project: &str, edit_id: &str) -> PlanResult<Option<PlanArtifact>> {
        match self.load_edit_artifact(project, edit_id) {
            Ok(artifact) => Ok(Some(artifact)),
            Err(PlanError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Replace the rows of the given vehicles in a scenario's edit plan.
    /// Tabular only; never touches the materialized artifact.
    pub fn persist_reorder(
        &self,
        project: &str,
        edit_id: &str,
        orders: &BTreeMap<u32, Vec<String>>,
    ) -> PlanResult<()> {
        let mut plan = self.load_edit_plan(project, edit_id)?;
        plan.rows.retain(|row| !orders.contains_key(&row.vehicle_id));
        for (&vehicle_id, stop_ids) in orders {
            for (order, stop_id) in stop_ids.iter().enumerate() {
                plan.rows.push(EditPlanRow {
                    vehicle_id,
                    stop_order: order as u32,
                    stop_id: stop_id.clone(),
                });
            }
        }
        self.save_edit_plan(project, edit_id, &plan)
    }

    /// Stop-set mutation hook: clear geometry, cumulatives and totals from
    /// the baseline and every scenario artifact, keeping only tabular order
    pub fn invalidate_materializations(&self, project: &str) -> PlanResult<()> {
        if let Some(mut baseline) = self.try_load_baseline(project)? {
            baseline.clear_materialization();
            self.save_baseline(project, &baseline)?;
        }
        for edit_id in self.list_edits(project)? {
            if let Some(mut artifact) = self.try_load_edit_artifact(project, &edit_id)? {
                artifact.clear_materialization();
                self.save_edit_artifact(project, &edit_id, &artifact)?;
            }
        }
        info!(project, "invalidated all materializations");
        Ok(())
    }

    // JSON helpers

    fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> PlanResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_vec_pretty(value)?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, body)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn read_json<T: DeserializeOwned>(&self, path: &Path, what: &str) -> PlanResult<T> {
        if !path.exists() {
            return Err(PlanError::NotFound(format!("{} at {}", what, path.display())));
        }
        let body = fs::read_to_string(path)?;
        serde_json::from_str(&body)
            .map_err(|err| PlanError::CorruptArtifact(format!("{}: {}", what, err)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MaterializeParams, RouteMode};

    fn store() -> (tempfile::TempDir, PlanStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = PlanStore::new(dir.path());
        (dir, store)
    }

    fn ordered_plan() -> OrderedPlan {
        use crate::types::{PlannedStop, VehiclePlan};
        let planned = |id: &str, load: u32| PlannedStop {
            stop_id: id.to_string(),
            cumulative_load: load,
            provisional_time: 0.0,
            provisional_distance: 0.0,
        };
        OrderedPlan {
            route_mode: RouteMode::ClosedTour,
            vehicles: vec![VehiclePlan {
                vehicle_id: 0,
                stops: vec![planned("depot", 0), planned("a", 3), planned("depot", 3)],
            }],
            matrix_hash: "a".repeat(16),
            fallback_used: false,
            solve_time_ms: 5,
        }
    }

    #[test]
    fn scenario_id_charset() {
        assert!(validate_scenario_id("edit-1_A").is_ok());
        assert!(validate_scenario_id("").is_err());
        assert!(validate_scenario_id("bad id").is_err());
        assert!(validate_scenario_id("semi;colon").is_err());
    }

    #[test]
    fn ordered_plan_round_trips() {
        let (_dir, store) = store();
        let plan = ordered_plan();
        store.save_ordered_plan("p1", &plan).unwrap();
        let loaded = store.load_ordered_plan("p1").unwrap();
        assert_eq!(loaded.matrix_hash, plan.matrix_hash);
        assert_eq!(loaded.vehicles.len(), 1);
        assert_eq!(loaded.vehicles[0].stops[1].stop_id, "a");
    }

    #[test]
    fn missing_plan_is_not_found() {
        let (_dir, store) = store();
        assert!(matches!(
            store.load_ordered_plan("nope"),
            Err(PlanError::NotFound(_))
        ));
    }

    #[test]
    fn corrupt_artifact_is_fatal() {
        let (dir, store) = store();
        let path = dir.path().join("p1").join("baseline.json");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"{ not json").unwrap();
        assert!(matches!(
            store.load_baseline("p1"),
            Err(PlanError::CorruptArtifact(_))
        ));
    }

    #[test]
    fn create_copies_baseline_and_delete_removes_both() {
        let (_dir, store) = store();
        store.save_ordered_plan("p1", &ordered_plan()).unwrap();
        let baseline = PlanArtifact::empty("a".repeat(16), MaterializeParams::default());
        store.save_baseline("p1", &baseline).unwrap();

        store.create_edit("p1", "e1", None).unwrap();
        assert_eq!(store.list_edits("p1").unwrap(), vec!["e1".to_string()]);
        let plan = store.load_edit_plan("p1", "e1").unwrap();
        assert_eq!(plan.rows.len(), 3);
        assert!(store.try_load_edit_artifact("p1", "e1").unwrap().is_some());

        store.delete_edit("p1", "e1").unwrap();
        assert!(store.list_edits("p1").unwrap().is_empty());
        assert!(store.try_load_edit_artifact("p1", "e1").unwrap().is_none());
    }

    #[test]
    fn create_rejects_duplicates_and_reserved_id() {
        let (_dir, store) = store();
        store.save_ordered_plan("p1", &ordered_plan()).unwrap();
        store.create_edit("p1", "e1", None).unwrap();
        assert!(matches!(store.create_edit("p1", "e1", None), Err(PlanError::BadInput(_))));
        assert!(matches!(store.create_edit("p1", "baseline", None), Err(PlanError::BadInput(_))));
        assert!(matches!(store.delete_edit("p1", "baseline"), Err(PlanError::BadInput(_))));
    }

    #[test]
    fn create_from_missing_source_is_not_found() {
        let (_dir, store) = store();
        assert!(matches!(
            store.create_edit("p1", "e2", Some("ghost")),
            Err(PlanError::NotFound(_))
        ));
    }

    #[test]
    fn reorder_rewrites_only_named_vehicles() {
        let (_dir, store) = store();
        store.save_ordered_plan("p1", &ordered_plan()).unwrap();
        store.create_edit("p1", "e1", None).unwrap();

        let mut orders = BTreeMap::new();
        orders.insert(0u32, vec!["depot".to_string(), "a".to_string(), "depot".to_string()]);
        store.persist_reorder("p1", "e1", &orders).unwrap();

        let plan = store.load_edit_plan("p1", "e1").unwrap();
        let grouped = plan.by_vehicle();
        let ids: Vec<&str> = grouped[&0].iter().map(|row| row.stop_id.as_str()).collect();
        assert_eq!(ids, vec!["depot", "a", "depot"]);
    }
}
