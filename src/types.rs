//! Core data structures shared by the optimizer, materializer and plan store

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::directions::{SearchOption, VehicleClass};
use crate::{PlanError, PlanResult};

/// Geographic coordinate (longitude, latitude in WGS84)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lon: f64,
    pub lat: f64,
}

impl Coordinate {
    pub fn new(lon: f64, lat: f64) -> Self {
        Self { lon, lat }
    }
}

/// A stop in the plan (the depot or a customer)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stop {
    pub id: String,
    pub name: String,
    pub coordinate: Coordinate,
    pub demand: u32,
}

impl Stop {
    pub fn new(id: impl Into<String>, name: impl Into<String>, coordinate: Coordinate, demand: u32) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            coordinate,
            demand,
        }
    }

    /// Create the depot stop (always demand 0)
    pub fn depot(id: impl Into<String>, name: impl Into<String>, coordinate: Coordinate) -> Self {
        Self::new(id, name, coordinate, 0)
    }
}

/// The current set of stops for a project. Index 0 is always the depot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopSet {
    pub stops: Vec<Stop>,
}

impl StopSet {
    pub fn new(stops: Vec<Stop>) -> PlanResult<Self> {
        let depot = stops
            .first()
            .ok_or_else(|| PlanError::BadInput("stop set is empty".to_string()))?;
        if depot.demand != 0 {
            return Err(PlanError::BadInput(format!(
                "depot '{}' must have demand 0, got {}",
                depot.id, depot.demand
            )));
        }
        for (i, stop) in stops.iter().enumerate() {
            if stops.iter().skip(i + 1).any(|other| other.id == stop.id) {
                return Err(PlanError::BadInput(format!("duplicate stop id '{}'", stop.id)));
            }
        }
        Ok(Self { stops })
    }

    pub fn depot(&self) -> &Stop {
        &self.stops[0]
    }

    pub fn get(&self, id: &str) -> Option<&Stop> {
        self.stops.iter().find(|stop| stop.id == id)
    }

    pub fn len(&self) -> usize {
        self.stops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stops.is_empty()
    }

    /// Total demand over all non-depot stops
    pub fn total_demand(&self) -> u64 {
        self.stops.iter().skip(1).map(|stop| stop.demand as u64).sum()
    }
}

/// Square time (seconds) and distance (meters) matrices over the stop set.
///
/// Row and column 0 correspond to the depot. The pair is an immutable
/// snapshot: any stop-set change invalidates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatrixPair {
    pub time: Vec<Vec<f64>>,
    pub distance: Vec<Vec<f64>>,
}

impl MatrixPair {
    pub fn dim(&self) -> usize {
        self.time.len()
    }
}

/// Deterministic content hash tying a matrix pair to the stop set it was
/// computed for. Recorded in every artifact and checked on materialization.
pub fn snapshot_hash(stops: &StopSet, matrix: &MatrixPair) -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    for stop in &stops.stops {
        stop.id.hash(&mut hasher);
        stop.coordinate.lon.to_bits().hash(&mut hasher);
        stop.coordinate.lat.to_bits().hash(&mut hasher);
        stop.demand.hash(&mut hasher);
    }
    for row in matrix.time.iter().chain(matrix.distance.iter()) {
        for value in row {
            value.to_bits().hash(&mut hasher);
        }
    }
    format!("{:016x}", hasher.finish())
}

/// Whether vehicle routes return to the depot or end at their last stop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteMode {
    ClosedTour,
    OpenEnd,
}

/// One visit in an ordered plan, with provisional matrix-based cumulatives.
///
/// The cumulative time/distance here come from the matrix snapshot and are
/// replaced by provider-grounded values during materialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedStop {
    pub stop_id: String,
    pub cumulative_load: u32,
    pub provisional_time: f64,
    pub provisional_distance: f64,
}

/// Ordered stop sequence for one vehicle, depot first
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VehiclePlan {
    pub vehicle_id: u32,
    pub stops: Vec<PlannedStop>,
}

impl VehiclePlan {
    /// Non-depot demand carried by this vehicle
    pub fn load(&self) -> u32 {
        self.stops.last().map(|stop| stop.cumulative_load).unwrap_or(0)
    }
}

/// Output of the optimizer: per-vehicle ordered stop sequences
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderedPlan {
    pub route_mode: RouteMode,
    pub vehicles: Vec<VehiclePlan>,
    pub matrix_hash: String,
    /// Set when the requested objective failed to set up and the solve
    /// continued with a distance-primary objective instead
    pub fallback_used: bool,
    pub solve_time_ms: u64,
}

/// Parameters of a materialization pass; part of every vehicle fingerprint
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MaterializeParams {
    pub search_option: SearchOption,
    pub vehicle_class: VehicleClass,
    /// Departure wall-clock time, minute precision
    pub depart_at: NaiveDateTime,
    /// Dwell applied at each via point, seconds
    pub via_dwell_seconds: u32,
}

impl Default for MaterializeParams {
    fn default() -> Self {
        Self {
            search_option: SearchOption::Recommended,
            vehicle_class: VehicleClass::Passenger,
            depart_at: chrono::NaiveDate::from_ymd_opt(2024, 1, 1)
                .unwrap()
                .and_hms_opt(9, 0, 0)
                .unwrap(),
            via_dwell_seconds: 60,
        }
    }
}

/// A stop enriched with provider-grounded cumulative time and distance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Waypoint {
    pub stop_id: String,
    pub name: String,
    pub coordinate: Coordinate,
    pub demand: u32,
    /// Seconds from departure to this waypoint along the road geometry
    pub cumulative_time: f64,
    /// Meters from departure to this waypoint along the road geometry
    pub cumulative_distance: f64,
    /// depart_at + cumulative_time, second precision
    pub arrival_time: NaiveDateTime,
}

/// Per-vehicle materialization outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteStatus {
    Ok,
    ProviderError,
    NoMatch,
}

/// A vehicle route with real road geometry and per-waypoint cumulatives
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VehicleRoute {
    pub vehicle_id: u32,
    pub waypoints: Vec<Waypoint>,
    /// LineString coordinates as [lon, lat] pairs; None when status is not ok
    pub route_geometry: Option<Vec<[f64; 2]>>,
    /// Provider-reported total for the fetched geometry. May exceed the last
    /// waypoint's cumulative time when the geometry overshoots the final
    /// stop; waypoint cumulatives are authoritative for downstream use.
    pub geometry_total_time: f64,
    pub geometry_total_distance: f64,
    pub route_load: u32,
    pub status: RouteStatus,
    pub error_reason: Option<String>,
}

impl VehicleRoute {
    pub fn start_point(&self) -> Option<&Waypoint> {
        self.waypoints.first()
    }

    pub fn end_point(&self) -> Option<&Waypoint> {
        self.waypoints.last()
    }

    pub fn via_points(&self) -> &[Waypoint] {
        if self.waypoints.len() <= 2 {
            &[]
        } else {
            &self.waypoints[1..self.waypoints.len() - 1]
        }
    }

    /// Ordered (stop_id, lon, lat) tuples; the positional half of the
    /// vehicle's fingerprint
    pub fn waypoint_signature(&self) -> Vec<(String, f64, f64)> {
        self.waypoints
            .iter()
            .map(|w| (w.stop_id.clone(), w.coordinate.lon, w.coordinate.lat))
            .collect()
    }
}

/// A fully materialized plan: vehicle id to route, ascending id order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanArtifact {
    pub matrix_hash: String,
    pub params: MaterializeParams,
    pub routes: BTreeMap<u32, VehicleRoute>,
}

impl PlanArtifact {
    pub fn empty(matrix_hash: String, params: MaterializeParams) -> Self {
        Self {
            matrix_hash,
            params,
            routes: BTreeMap::new(),
        }
    }

    pub fn failed_vehicle_ids(&self) -> Vec<u32> {
        self.routes
            .values()
            .filter(|route| route.status != RouteStatus::Ok)
            .map(|route| route.vehicle_id)
            .collect()
    }

    /// Drop geometry, cumulatives and totals but keep the waypoint order.
    /// Used when a stop-set mutation invalidates all materializations.
    pub fn clear_materialization(&mut self) {
        for route in self.routes.values_mut() {
            route.route_geometry = None;
            route.geometry_total_time = 0.0;
            route.geometry_total_distance = 0.0;
            for waypoint in &mut route.waypoints {
                waypoint.cumulative_time = 0.0;
                waypoint.cumulative_distance = 0.0;
            }
        }
    }
}

/// One row of a scenario's tabular edit plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditPlanRow {
    pub vehicle_id: u32,
    pub stop_order: u32,
    pub stop_id: String,
}

/// The user-intended ordering and assignment for a scenario, plus any
/// per-scenario stop relocations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EditPlan {
    pub rows: Vec<EditPlanRow>,
    /// Scenario-local coordinate overrides from stop moves; never applied to
    /// the baseline stop set
    #[serde(default)]
    pub stop_overrides: BTreeMap<String, Coordinate>,
}

impl EditPlan {
    /// Rows grouped by vehicle, each group sorted by stop_order
    pub fn by_vehicle(&self) -> BTreeMap<u32, Vec<&EditPlanRow>> {
        let mut grouped: BTreeMap<u32, Vec<&EditPlanRow>> = BTreeMap::new();
        for row in &self.rows {
            grouped.entry(row.vehicle_id).or_default().push(row);
        }
        for rows in grouped.values_mut() {
            rows.sort_by_key(|row| row.stop_order);
        }
        grouped
    }

    /// Build an edit plan from an ordered plan, preserving stop order
    pub fn from_ordered(plan: &OrderedPlan) -> Self {
        let mut rows = Vec::new();
        for vehicle in &plan.vehicles {
            for (order, planned) in vehicle.stops.iter().enumerate() {
                rows.push(EditPlanRow {
                    vehicle_id: vehicle.vehicle_id,
                    stop_order: order as u32,
                    stop_id: planned.stop_id.clone(),
                });
            }
        }
        Self {
            rows,
            stop_overrides: BTreeMap::new(),
        }
    }
}

/// Outcome counters of one edit-delta run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadStats {
    pub regenerated: usize,
    pub reused: usize,
    pub deleted: usize,
    pub failed: usize,
    pub failed_vehicle_ids: Vec<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_stops() -> StopSet {
        StopSet::new(vec![
            Stop::depot("depot", "Depot", Coordinate::new(127.0, 37.5)),
            Stop::new("a", "Stop A", Coordinate::new(127.1, 37.5), 3),
            Stop::new("b", "Stop B", Coordinate::new(127.2, 37.6), 5),
        ])
        .unwrap()
    }

    #[test]
    fn stop_set_rejects_nonzero_depot_demand() {
        let result = StopSet::new(vec![Stop::new("d", "Depot", Coordinate::new(0.0, 0.0), 4)]);
        assert!(matches!(result, Err(PlanError::BadInput(_))));
    }

    #[test]
    fn stop_set_rejects_duplicate_ids() {
        let result = StopSet::new(vec![
            Stop::depot("d", "Depot", Coordinate::new(0.0, 0.0)),
            Stop::new("a", "A", Coordinate::new(1.0, 1.0), 1),
            Stop::new("a", "A again", Coordinate::new(2.0, 2.0), 1),
        ]);
        assert!(matches!(result, Err(PlanError::BadInput(_))));
    }

    #[test]
    fn snapshot_hash_changes_with_content() {
        let stops = sample_stops();
        let matrix = MatrixPair {
            time: vec![vec![0.0; 3]; 3],
            distance: vec![vec![0.0; 3]; 3],
        };
        let base = snapshot_hash(&stops, &matrix);

        let mut moved = stops.clone();
        moved.stops[1].coordinate.lon += 0.001;
        assert_ne!(base, snapshot_hash(&moved, &matrix));

        let mut retimed = matrix.clone();
        retimed.time[0][1] = 60.0;
        assert_ne!(base, snapshot_hash(&stops, &retimed));
    }

    #[test]
    fn vehicle_route_views() {
        let depart = MaterializeParams::default().depart_at;
        let make_waypoint = |id: &str| Waypoint {
            stop_id: id.to_string(),
            name: id.to_string(),
            coordinate: Coordinate::new(0.0, 0.0),
            demand: 0,
            cumulative_time: 0.0,
            cumulative_distance: 0.0,
            arrival_time: depart,
        };
        let route = VehicleRoute {
            vehicle_id: 0,
            waypoints: vec![make_waypoint("d"), make_waypoint("a"), make_waypoint("d")],
            route_geometry: None,
            geometry_total_time: 0.0,
            geometry_total_distance: 0.0,
            route_load: 0,
            status: RouteStatus::Ok,
            error_reason: None,
        };
        assert_eq!(route.start_point().unwrap().stop_id, "d");
        assert_eq!(route.end_point().unwrap().stop_id, "d");
        assert_eq!(route.via_points().len(), 1);
        assert_eq!(route.via_points()[0].stop_id, "a");
    }

    #[test]
    fn edit_plan_groups_by_vehicle_in_order() {
        let plan = EditPlan {
            rows: vec![
                EditPlanRow { vehicle_id: 1, stop_order: 1, stop_id: "b".into() },
                EditPlanRow { vehicle_id: 0, stop_order: 0, stop_id: "depot".into() },
                EditPlanRow { vehicle_id: 1, stop_order: 0, stop_id: "depot".into() },
                EditPlanRow { vehicle_id: 0, stop_order: 1, stop_id: "a".into() },
            ],
            stop_overrides: BTreeMap::new(),
        };
        let grouped = plan.by_vehicle();
        assert_eq!(grouped.len(), 2);
        let v1: Vec<&str> = grouped[&1].iter().map(|row| row.stop_id.as_str()).collect();
        assert_eq!(v1, vec!["depot", "b"]);
    }
}
