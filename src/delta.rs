//! Incremental re-materialization of edit scenarios
//!
//! Each vehicle is cached under a fingerprint: the ordered (stop_id, lon,
//! lat) tuples of its desired waypoints plus the materialization parameters.
//! A reload reuses every cached vehicle whose fingerprint is unchanged,
//! fetches only the changed ones and drops vehicles that no longer appear in
//! the edit plan. If nothing changed the provider is not called at all.

use std::collections::BTreeMap;

use tracing::info;

use crate::materialize::{Materializer, WaypointSeed};
use crate::plan_store::PlanStore;
use crate::types::{
    Coordinate, EditPlan, MaterializeParams, PlanArtifact, ReloadStats, RouteStatus, StopSet,
    VehicleRoute,
};
use crate::{PlanError, PlanResult};

/// Exact-match cache key for one vehicle's materialization. Coordinates are
/// compared at full stored precision via their bit patterns.
pub fn fingerprint(waypoints: &[(String, f64, f64)], params: &MaterializeParams) -> String {
    let mut parts: Vec<String> = waypoints
        .iter()
        .map(|(stop_id, lon, lat)| {
            format!("{}:{:016x}:{:016x}", stop_id, lon.to_bits(), lat.to_bits())
        })
        .collect();
    parts.push(format!(
        "opt={:?};class={:?};depart={};dwell={}",
        params.search_option,
        params.vehicle_class,
        params.depart_at.format("%Y%m%d%H%M"),
        params.via_dwell_seconds
    ));
    parts.join("|")
}

fn seed_fingerprint(seeds: &[WaypointSeed], params: &MaterializeParams) -> String {
    let waypoints: Vec<(String, f64, f64)> = seeds
        .iter()
        .map(|seed| (seed.stop_id.clone(), seed.coordinate.lon, seed.coordinate.lat))
        .collect();
    fingerprint(&waypoints, params)
}

fn route_fingerprint(route: &VehicleRoute, params: &MaterializeParams) -> String {
    fingerprint(&route.waypoint_signature(), params)
}

/// Join a scenario's edit plan against the current stop set, applying the
/// scenario's coordinate overrides. Vehicles left with no non-depot stop are
/// omitted (they become deletions).
pub fn desired_seeds(
    plan: &EditPlan,
    stops: &StopSet,
) -> PlanResult<Vec<(u32, Vec<WaypointSeed>)>> {
    let depot_id = &stops.depot().id;
    let mut jobs = Vec::new();
    for (vehicle_id, rows) in plan.by_vehicle() {
        let mut seeds = Vec::with_capacity(rows.len());
        let mut has_customer = false;
        for row in rows {
            let stop = stops.get(&row.stop_id).ok_or_else(|| {
                PlanError::StaleReference(format!(
                    "stop '{}' in scenario plan is missing from the stop set",
                    row.stop_id
                ))
            })?;
            let coordinate = plan
                .stop_overrides
                .get(&row.stop_id)
                .copied()
                .unwrap_or(stop.coordinate);
            if &stop.id != depot_id {
                has_customer = true;
            }
            seeds.push(WaypointSeed {
                stop_id: stop.id.clone(),
                name: stop.name.clone(),
                coordinate,
                demand: stop.demand,
            });
        }
        if has_customer {
            jobs.push((vehicle_id, seeds));
        }
    }
    Ok(jobs)
}

/// Result of one reload: the stats and the artifact that was written back
#[derive(Debug)]
pub struct DeltaOutcome {
    pub stats: ReloadStats,
    pub artifact: PlanArtifact,
}

/// Re-materialize an edit scenario with the minimum number of provider
/// calls. Linearized per scenario; the artifact is replaced atomically only
/// after every queued vehicle has settled.
pub async fn reload_edit(
    store: &PlanStore,
    materializer: &Materializer,
    project: &str,
    edit_id: &str,
    stops: &StopSet,
    params: &MaterializeParams,
    matrix_hash: &str,
) -> PlanResult<DeltaOutcome> {
    let lock = store.scenario_mutex(project, edit_id);
    let _guard = lock.lock().await;

    let plan = store.load_edit_plan(project, edit_id)?;
    let desired = desired_seeds(&plan, stops)?;
    let cached = store
        .try_load_edit_artifact(project, edit_id)?
        .unwrap_or_else(|| PlanArtifact::empty(matrix_hash.to_string(), *params));

    let mut stats = ReloadStats::default();
    let mut routes: BTreeMap<u32, VehicleRoute> = BTreeMap::new();
    let mut queue: Vec<(u32, Vec<WaypointSeed>)> = Vec::new();

    for (vehicle_id, seeds) in desired {
        let wanted = seed_fingerprint(&seeds, params);
        match cached.routes.get(&vehicle_id) {
            Some(route)
                if route.status == RouteStatus::Ok
                    && route_fingerprint(route, &cached.params) == wanted =>
            {
                routes.insert(vehicle_id, route.clone());
                stats.reused += 1;
            }
            _ => queue.push((vehicle_id, seeds)),
        }
    }

    stats.deleted = cached
        .routes
        .keys()
        .filter(|&&vehicle_id| {
            !routes.contains_key(&vehicle_id) && !queue.iter().any(|(id, _)| *id == vehicle_id)
        })
        .count();

    let queued = queue.len();
    let fetched = materializer.run(queue, params).await;
    for (vehicle_id, route) in fetched {
        if route.status == RouteStatus::Ok {
            stats.regenerated += 1;
        } else {
            stats.failed += 1;
            stats.failed_vehicle_ids.push(vehicle_id);
        }
        routes.insert(vehicle_id, route);
    }

    let artifact = PlanArtifact {
        matrix_hash: matrix_hash.to_string(),
        params: *params,
        routes,
    };
    store.save_edit_artifact(project, edit_id, &artifact)?;

    info!(
        project,
        edit_id,
        queued,
        regenerated = stats.regenerated,
        reused = stats.reused,
        deleted = stats.deleted,
        failed = stats.failed,
        "edit-delta reload finished"
    );
    Ok(DeltaOutcome { stats, artifact })
}

/// Move one stop within a scenario: the override changes the affected
/// vehicles' fingerprints, so the next reload re-materializes exactly them.
/// The baseline stop set is never touched.
pub async fn update_stop_location(
    store: &PlanStore,
    project: &str,
    edit_id: &str,
    stop_id: &str,
    location: Coordinate,
) -> PlanResult<()> {
    let lock = store.scenario_mutex(project, edit_id);
    let _guard = lock.lock().await;

    let mut plan = store.load_edit_plan(project, edit_id)?;
    if !plan.rows.iter().any(|row| row.stop_id == stop_id) {
        return Err(PlanError::NotFound(format!(
            "stop '{}' is not part of scenario '{}'",
            stop_id, edit_id
        )));
    }
    plan.stop_overrides.insert(stop_id.to_string(), location);
    store.save_edit_plan(project, edit_id, &plan)?;
    info!(project, edit_id, stop_id, "moved stop within scenario");
    Ok(())
}
