//! Aggregate metrics over a materialized plan
//!
//! Totals come from waypoint cumulatives, which are the authoritative
//! values; provider geometry totals are reported per vehicle only.

use serde::{Deserialize, Serialize};

use crate::types::{PlanArtifact, RouteStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VehicleSummary {
    pub vehicle_id: u32,
    pub stops: usize,
    pub route_load: u32,
    pub total_time: f64,
    pub total_distance: f64,
    pub status: RouteStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanSummary {
    pub vehicles_used: usize,
    pub total_time: f64,
    pub total_distance: f64,
    /// Longest single-vehicle route time
    pub makespan_time: f64,
    pub total_load: u32,
    pub failed_vehicles: usize,
    pub per_vehicle: Vec<VehicleSummary>,
}

impl PlanSummary {
    pub fn from_artifact(artifact: &PlanArtifact) -> Self {
        let mut per_vehicle = Vec::with_capacity(artifact.routes.len());
        for route in artifact.routes.values() {
            let end = route.end_point();
            per_vehicle.push(VehicleSummary {
                vehicle_id: route.vehicle_id,
                stops: route.via_points().len(),
                route_load: route.route_load,
                total_time: end.map(|w| w.cumulative_time).unwrap_or(0.0),
                total_distance: end.map(|w| w.cumulative_distance).unwrap_or(0.0),
                status: route.status,
            });
        }

        Self {
            vehicles_used: per_vehicle.len(),
            total_time: per_vehicle.iter().map(|v| v.total_time).sum(),
            total_distance: per_vehicle.iter().map(|v| v.total_distance).sum(),
            makespan_time: per_vehicle.iter().map(|v| v.total_time).fold(0.0, f64::max),
            total_load: per_vehicle.iter().map(|v| v.route_load).sum(),
            failed_vehicles: per_vehicle
                .iter()
                .filter(|v| v.status != RouteStatus::Ok)
                .count(),
            per_vehicle,
        }
    }
}
