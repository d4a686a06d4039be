//! HTTP handlers for the plan lifecycle API

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post, put},
    Router,
};
use tracing::{info, warn};

use crate::api_types::*;
use crate::app_state::AppState;
use crate::delta;
use crate::export::artifact_to_geojson;
use crate::plan_store::BASELINE_ID;
use crate::solver::{solve, SolveOptions};
use crate::summary::PlanSummary;
use crate::types::{Coordinate, MatrixPair, PlanArtifact};
use crate::{PlanError, PlanResult};

impl IntoResponse for PlanError {
    fn into_response(self) -> Response {
        let status = match &self {
            PlanError::BadInput(_) => StatusCode::BAD_REQUEST,
            PlanError::Infeasible(_) | PlanError::NoSolution => StatusCode::UNPROCESSABLE_ENTITY,
            PlanError::StaleMatrix { .. } | PlanError::StaleReference(_) => StatusCode::CONFLICT,
            PlanError::ProviderUnavailable(_) => StatusCode::BAD_GATEWAY,
            PlanError::PartialMaterialization { .. } => StatusCode::MULTI_STATUS,
            PlanError::NotFound(_) => StatusCode::NOT_FOUND,
            PlanError::CorruptArtifact(_) | PlanError::Io(_) | PlanError::Serialization(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        warn!(code = self.code(), status = %status, "operation failed");

        let body = match &self {
            PlanError::PartialMaterialization { failed_vehicle_ids } => ErrorResponse::with_details(
                self.code(),
                "some vehicles failed to materialize",
                &format!("failed_vehicle_ids={:?}", failed_vehicle_ids),
            ),
            _ => ErrorResponse::new(self.code(), &self.to_string()),
        };
        (status, Json(body)).into_response()
    }
}

pub fn create_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health_check))
        .route("/projects/:project/snapshot", put(put_snapshot))
        .route("/projects/:project/optimize", post(optimize))
        .route("/projects/:project/materialize", post(materialize_baseline))
        .route("/projects/:project/edits", get(list_edits).post(create_edit))
        .route("/projects/:project/edits/:edit_id", delete(delete_edit))
        .route("/projects/:project/edits/:edit_id/reload", post(reload_edit))
        .route(
            "/projects/:project/edits/:edit_id/stops/:stop_id/location",
            put(update_stop_location),
        )
        .route("/projects/:project/edits/:edit_id/plan", put(persist_reorder))
        .route("/projects/:project/edits/:edit_id/geojson", get(export_geojson))
        .route("/projects/:project/edits/:edit_id/summary", get(plan_summary))
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "healthy" }))
}

/// Snapshot ingestion from the external matrix store
async fn put_snapshot(
    State(state): State<Arc<AppState>>,
    Path(project): Path<String>,
    Json(request): Json<SnapshotRequest>,
) -> PlanResult<Json<SnapshotResponse>> {
    info!(
        %project,
        stops = request.stops.len(),
        "received stop/matrix snapshot"
    );
    let stop_count = request.stops.len();
    let matrix = MatrixPair {
        time: request.time_matrix,
        distance: request.distance_matrix,
    };
    let snapshot_hash = state.set_snapshot(&project, request.stops, matrix).await?;
    Ok(Json(SnapshotResponse {
        snapshot_hash,
        stops: stop_count,
    }))
}

async fn optimize(
    State(state): State<Arc<AppState>>,
    Path(project): Path<String>,
    Json(request): Json<OptimizeRequest>,
) -> PlanResult<Json<crate::types::OrderedPlan>> {
    let snapshot = state.snapshot(&project).await?;
    if request.snapshot_hash != snapshot.snapshot_hash {
        return Err(PlanError::StaleMatrix {
            expected: request.snapshot_hash,
            found: snapshot.snapshot_hash.clone(),
        });
    }
    info!(
        %project,
        stops = snapshot.stops.len(),
        vehicles = request.vehicle_count,
        budget_s = request.time_budget_seconds,
        "optimize requested"
    );

    let options = SolveOptions {
        vehicle_count: request.vehicle_count,
        capacity: request.capacity,
        route_mode: request.route_mode,
        objective: request.objective,
        time_budget: Duration::from_secs(request.time_budget_seconds),
        time_windows: request.time_windows,
    };
    // CPU-bound and budget-limited; keep it off the IO runtime
    let plan = tokio::task::spawn_blocking(move || solve(&snapshot.stops, &snapshot.matrix, &options))
        .await
        .map_err(|err| {
            PlanError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("solver task failed: {}", err),
            ))
        })??;

    state.store.save_ordered_plan(&project, &plan)?;
    Ok(Json(plan))
}

async fn materialize_baseline(
    State(state): State<Arc<AppState>>,
    Path(project): Path<String>,
    request: Option<Json<MaterializeRequest>>,
) -> PlanResult<Json<PlanArtifact>> {
    let snapshot = state.snapshot(&project).await?;
    let plan = state.store.load_ordered_plan(&project)?;
    if plan.matrix_hash != snapshot.snapshot_hash {
        return Err(PlanError::StaleMatrix {
            expected: plan.matrix_hash,
            found: snapshot.snapshot_hash.clone(),
        });
    }

    let params = request.map(|Json(body)| body).unwrap_or_default().params();
    info!(%project, vehicles = plan.vehicles.len(), "materializing baseline");

    let artifact = state
        .materializer
        .materialize_plan(&plan, &snapshot.stops, &params)
        .await?;
    state.store.save_baseline(&project, &artifact)?;

    let failed_vehicle_ids = artifact.failed_vehicle_ids();
    if !failed_vehicle_ids.is_empty() {
        if failed_vehicle_ids.len() == artifact.routes.len() {
            return Err(PlanError::ProviderUnavailable(format!(
                "all {} vehicles failed to materialize",
                failed_vehicle_ids.len()
            )));
        }
        return Err(PlanError::PartialMaterialization { failed_vehicle_ids });
    }
    Ok(Json(artifact))
}

async fn list_edits(
    State(state): State<Arc<AppState>>,
    Path(project): Path<String>,
) -> PlanResult<Json<EditListResponse>> {
    Ok(Json(EditListResponse {
        edits: state.store.list_edits(&project)?,
    }))
}

async fn create_edit(
    State(state): State<Arc<AppState>>,
    Path(project): Path<String>,
    Json(request): Json<CreateEditRequest>,
) -> PlanResult<StatusCode> {
    state
        .store
        .create_edit(&project, &request.edit_id, request.source.as_deref())?;
    Ok(StatusCode::CREATED)
}

async fn delete_edit(
    State(state): State<Arc<AppState>>,
    Path((project, edit_id)): Path<(String, String)>,
) -> PlanResult<StatusCode> {
    state.store.delete_edit(&project, &edit_id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Run the edit-delta engine for one scenario
async fn reload_edit(
    State(state): State<Arc<AppState>>,
    Path((project, edit_id)): Path<(String, String)>,
    request: Option<Json<MaterializeRequest>>,
) -> PlanResult<Json<crate::types::ReloadStats>> {
    let snapshot = state.snapshot(&project).await?;

    // Unspecified parameters inherit the scenario's cached ones so an
    // unchanged reload stays a cache hit
    let inherited = match state.store.try_load_edit_artifact(&project, &edit_id)? {
        Some(artifact) => Some(artifact.params),
        None => state.store.try_load_baseline(&project)?.map(|artifact| artifact.params),
    };
    let params = request
        .map(|Json(body)| body)
        .unwrap_or_default()
        .params_with_base(inherited);

    let outcome = delta::reload_edit(
        &state.store,
        &state.materializer,
        &project,
        &edit_id,
        &snapshot.stops,
        &params,
        &snapshot.snapshot_hash,
    )
    .await?;
    Ok(Json(outcome.stats))
}

async fn update_stop_location(
    State(state): State<Arc<AppState>>,
    Path((project, edit_id, stop_id)): Path<(String, String, String)>,
    Json(request): Json<UpdateStopLocationRequest>,
) -> PlanResult<StatusCode> {
    delta::update_stop_location(
        &state.store,
        &project,
        &edit_id,
        &stop_id,
        Coordinate::new(request.lon, request.lat),
    )
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Timeline reorder: rewrites the tabular edit plan only, never calls the
/// directions provider
async fn persist_reorder(
    State(state): State<Arc<AppState>>,
    Path((project, edit_id)): Path<(String, String)>,
    Json(request): Json<ReorderRequest>,
) -> PlanResult<StatusCode> {
    let lock = state.store.scenario_mutex(&project, &edit_id);
    let _guard = lock.lock().await;

    info!(
        %project,
        %edit_id,
        vehicles = request.orders.len(),
        "persisting timeline reorder"
    );
    state.store.persist_reorder(&project, &edit_id, &request.orders)?;
    Ok(StatusCode::NO_CONTENT)
}

fn load_scenario_artifact(state: &AppState, project: &str, edit_id: &str) -> PlanResult<PlanArtifact> {
    if edit_id == BASELINE_ID {
        state.store.load_baseline(project)
    } else {
        state.store.load_edit_artifact(project, edit_id)
    }
}

async fn export_geojson(
    State(state): State<Arc<AppState>>,
    Path((project, edit_id)): Path<(String, String)>,
) -> PlanResult<Json<geojson::FeatureCollection>> {
    let artifact = load_scenario_artifact(&state, &project, &edit_id)?;
    Ok(Json(artifact_to_geojson(&artifact)))
}

async fn plan_summary(
    State(state): State<Arc<AppState>>,
    Path((project, edit_id)): Path<(String, String)>,
) -> PlanResult<Json<PlanSummary>> {
    let artifact = load_scenario_artifact(&state, &project, &edit_id)?;
    Ok(Json(PlanSummary::from_artifact(&artifact)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::materialize::{testing::ScriptedDirections, Materializer};
    use crate::plan_store::PlanStore;

    fn status_of(err: PlanError) -> StatusCode {
        err.into_response().status()
    }

    #[test]
    fn error_codes_map_to_statuses() {
        assert_eq!(status_of(PlanError::BadInput("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_of(PlanError::Infeasible("x".into())),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(status_of(PlanError::NoSolution), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(
            status_of(PlanError::StaleMatrix {
                expected: "a".into(),
                found: "b".into()
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(PlanError::StaleReference("x".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(PlanError::ProviderUnavailable("x".into())),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_of(PlanError::PartialMaterialization {
                failed_vehicle_ids: vec![2]
            }),
            StatusCode::MULTI_STATUS
        );
        assert_eq!(
            status_of(PlanError::NotFound("x".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(PlanError::CorruptArtifact("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn router_builds() {
        let dir = tempfile::tempdir().unwrap();
        let store = PlanStore::new(dir.path());
        let materializer = Materializer::new(Arc::new(ScriptedDirections::new()), 2);
        let state = Arc::new(AppState::new(store, materializer));
        let _router: Router = create_routes().with_state(state);
    }
}
