//! Invariant checks for matrices, ordered plans and materialized routes

use std::collections::HashMap;

use crate::types::{MatrixPair, OrderedPlan, RouteMode, StopSet, VehicleRoute};
use crate::{PlanError, PlanResult};

/// Tolerance for cumulative-vs-total comparisons, in seconds or meters
pub const CUMULATIVE_EPSILON: f64 = 1.0;

/// Check a matrix pair against the stop set it claims to cover.
///
/// Rejects non-square matrices, dimension mismatches with the stop count,
/// negative entries and nonzero diagonals.
pub fn validate_matrix(stops: &StopSet, matrix: &MatrixPair) -> PlanResult<()> {
    let n = stops.len();
    for (label, grid) in [("time", &matrix.time), ("distance", &matrix.distance)] {
        if grid.len() != n {
            return Err(PlanError::BadInput(format!(
                "{} matrix has {} rows for {} stops",
                label,
                grid.len(),
                n
            )));
        }
        for (i, row) in grid.iter().enumerate() {
            if row.len() != n {
                return Err(PlanError::BadInput(format!(
                    "{} matrix row {} has {} columns, expected {}",
                    label,
                    i,
                    row.len(),
                    n
                )));
            }
            for (j, &value) in row.iter().enumerate() {
                if value < 0.0 || !value.is_finite() {
                    return Err(PlanError::BadInput(format!(
                        "{} matrix [{}][{}] = {} is not a non-negative finite value",
                        label, i, j, value
                    )));
                }
                if i == j && value != 0.0 {
                    return Err(PlanError::BadInput(format!(
                        "{} matrix diagonal [{}][{}] must be 0, got {}",
                        label, i, j, value
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Check the structural invariants of an ordered plan:
/// every non-depot stop appears exactly once, loads respect capacity,
/// route endpoints match the route mode, no depot-only vehicles.
pub fn validate_plan(
    plan: &OrderedPlan,
    stops: &StopSet,
    capacity: u32,
) -> PlanResult<()> {
    let depot_id = &stops.depot().id;
    let mut seen: HashMap<&str, u32> = HashMap::new();

    for vehicle in &plan.vehicles {
        let first = vehicle
            .stops
            .first()
            .ok_or_else(|| PlanError::BadInput(format!("vehicle {} has an empty route", vehicle.vehicle_id)))?;
        if &first.stop_id != depot_id {
            return Err(PlanError::BadInput(format!(
                "vehicle {} does not start at the depot",
                vehicle.vehicle_id
            )));
        }
        let last = vehicle.stops.last().unwrap();
        match plan.route_mode {
            RouteMode::ClosedTour if &last.stop_id != depot_id => {
                return Err(PlanError::BadInput(format!(
                    "vehicle {} does not return to the depot in closed-tour mode",
                    vehicle.vehicle_id
                )));
            }
            RouteMode::OpenEnd if &last.stop_id == depot_id => {
                return Err(PlanError::BadInput(format!(
                    "vehicle {} ends at the depot in open-end mode",
                    vehicle.vehicle_id
                )));
            }
            _ => {}
        }

        let mut load = 0u32;
        let mut non_depot = 0usize;
        for planned in &vehicle.stops {
            if &planned.stop_id == depot_id {
                continue;
            }
            non_depot += 1;
            let stop = stops.get(&planned.stop_id).ok_or_else(|| {
                PlanError::StaleReference(format!("stop '{}' is not in the stop set", planned.stop_id))
            })?;
            load += stop.demand;
            *seen.entry(planned.stop_id.as_str()).or_insert(0) += 1;
        }
        if non_depot == 0 {
            return Err(PlanError::BadInput(format!(
                "vehicle {} serves no stops",
                vehicle.vehicle_id
            )));
        }
        if load > capacity {
            return Err(PlanError::BadInput(format!(
                "vehicle {} carries {} over capacity {}",
                vehicle.vehicle_id, load, capacity
            )));
        }
    }

    for stop in stops.stops.iter().skip(1) {
        match seen.get(stop.id.as_str()) {
            Some(1) => {}
            Some(n) => {
                return Err(PlanError::BadInput(format!(
                    "stop '{}' appears {} times across routes",
                    stop.id, n
                )));
            }
            None => {
                return Err(PlanError::BadInput(format!(
                    "stop '{}' is not assigned to any vehicle",
                    stop.id
                )));
            }
        }
    }
    Ok(())
}

/// Violations found on a materialized vehicle route. An empty list means the
/// materialization invariants hold.
pub fn check_materialized_route(route: &VehicleRoute) -> Vec<String> {
    let mut violations = Vec::new();

    if let Some(start) = route.start_point() {
        if start.cumulative_time != 0.0 || start.cumulative_distance != 0.0 {
            violations.push(format!(
                "vehicle {}: start point cumulatives are ({}, {}), expected (0, 0)",
                route.vehicle_id, start.cumulative_time, start.cumulative_distance
            ));
        }
    }

    for pair in route.waypoints.windows(2) {
        if pair[1].cumulative_time < pair[0].cumulative_time {
            violations.push(format!(
                "vehicle {}: cumulative time decreases at '{}'",
                route.vehicle_id, pair[1].stop_id
            ));
        }
        if pair[1].cumulative_distance < pair[0].cumulative_distance {
            violations.push(format!(
                "vehicle {}: cumulative distance decreases at '{}'",
                route.vehicle_id, pair[1].stop_id
            ));
        }
    }

    if route.route_geometry.is_some() {
        if let Some(end) = route.end_point() {
            if end.cumulative_time > route.geometry_total_time + CUMULATIVE_EPSILON {
                violations.push(format!(
                    "vehicle {}: end cumulative time {} exceeds geometry total {}",
                    route.vehicle_id, end.cumulative_time, route.geometry_total_time
                ));
            }
            if end.cumulative_distance > route.geometry_total_distance + CUMULATIVE_EPSILON {
                violations.push(format!(
                    "vehicle {}: end cumulative distance {} exceeds geometry total {}",
                    route.vehicle_id, end.cumulative_distance, route.geometry_total_distance
                ));
            }
        }
    }

    violations
}
