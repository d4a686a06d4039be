//! Route materialization: turning ordered plans into road geometry with
//! provider-grounded per-waypoint cumulative time and distance
//!
//! The provider responds with a sequence of segment features. The walk
//! accumulates time and distance along the geometry and records the running
//! values at every polyline vertex; each waypoint then reads its cumulatives
//! from the first vertex matching its coordinates, scanning monotonically so
//! the values can never decrease along a route. Totals are never spread
//! evenly across vias, not even as a fallback.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use crate::directions::{DirectionsProvider, FeatureGeometry, RouteRequest, RouteResponse};
use crate::types::{
    Coordinate, MaterializeParams, OrderedPlan, PlanArtifact, RouteStatus, StopSet, VehicleRoute,
    Waypoint,
};
use crate::{PlanError, PlanResult};

/// Position-match tolerance in degrees (roughly 10 m)
const MATCH_EPSILON: f64 = 1e-4;

/// A stop about to become a waypoint: everything the materializer needs
/// before cumulatives exist
#[derive(Debug, Clone)]
pub struct WaypointSeed {
    pub stop_id: String,
    pub name: String,
    pub coordinate: Coordinate,
    pub demand: u32,
}

/// Build per-vehicle waypoint seeds from an ordered plan and the current
/// stop set. Vehicles with no non-depot stop are omitted entirely.
pub fn plan_seeds(plan: &OrderedPlan, stops: &StopSet) -> PlanResult<Vec<(u32, Vec<WaypointSeed>)>> {
    let depot_id = &stops.depot().id;
    let mut jobs = Vec::new();
    for vehicle in &plan.vehicles {
        let mut seeds = Vec::with_capacity(vehicle.stops.len());
        let mut has_customer = false;
        for planned in &vehicle.stops {
            let stop = stops.get(&planned.stop_id).ok_or_else(|| {
                PlanError::StaleReference(format!(
                    "stop '{}' from the plan is missing from the stop set",
                    planned.stop_id
                ))
            })?;
            if &stop.id != depot_id {
                has_customer = true;
            }
            seeds.push(WaypointSeed {
                stop_id: stop.id.clone(),
                name: stop.name.clone(),
                coordinate: stop.coordinate,
                demand: stop.demand,
            });
        }
        if has_customer {
            jobs.push((vehicle.vehicle_id, seeds));
        }
    }
    Ok(jobs)
}

/// One geometry vertex with the cumulative values reached at it
#[derive(Debug, Clone, Copy)]
struct Vertex {
    coord: [f64; 2],
    time: f64,
    distance: f64,
}

/// Walk the response features in order, accumulating time and distance and
/// recording the running values at every vertex. Within a LineString the
/// segment's time/distance are spread by chord-length fraction; Point
/// features carrying cumulative values override the running totals.
fn accumulate_vertices(response: &RouteResponse) -> Vec<Vertex> {
    let mut vertices: Vec<Vertex> = Vec::new();
    let mut running_time = 0.0f64;
    let mut running_distance = 0.0f64;

    for feature in &response.features {
        match &feature.geometry {
            FeatureGeometry::Point(coord) => {
                // Point cumulatives override the running totals; the walk
                // stays monotone regardless
                if let (Some(time), Some(distance)) =
                    (feature.properties.time, feature.properties.distance)
                {
                    running_time = running_time.max(time);
                    running_distance = running_distance.max(distance);
                    if let Some(last) = vertices.last_mut() {
                        if last.coord == *coord {
                            last.time = running_time;
                            last.distance = running_distance;
                        }
                    }
                }
            }
            FeatureGeometry::LineString(coords) => {
                if coords.is_empty() {
                    continue;
                }
                let segment_time = feature.properties.time.unwrap_or(0.0);
                let segment_distance = feature.properties.distance.unwrap_or(0.0);

                let chords: Vec<f64> = coords
                    .windows(2)
                    .map(|pair| planar(pair[0], pair[1]))
                    .collect();
                let total_chord: f64 = chords.iter().sum();

                let mut prefix = 0.0;
                for (k, coord) in coords.iter().enumerate() {
                    if k > 0 {
                        prefix += chords[k - 1];
                    }
                    let fraction = if total_chord > 0.0 { prefix / total_chord } else { 0.0 };
                    let vertex = Vertex {
                        coord: *coord,
                        time: running_time + fraction * segment_time,
                        distance: running_distance + fraction * segment_distance,
                    };
                    match vertices.last() {
                        Some(last) if last.coord == vertex.coord => {}
                        _ => vertices.push(vertex),
                    }
                }
                running_time += segment_time;
                running_distance += segment_distance;
            }
        }
    }
    vertices
}

/// Planar distance proxy in degrees, longitude scaled by latitude
fn planar(a: [f64; 2], b: [f64; 2]) -> f64 {
    let lat_scale = ((a[1] + b[1]) / 2.0).to_radians().cos();
    let dx = (a[0] - b[0]) * lat_scale;
    let dy = a[1] - b[1];
    (dx * dx + dy * dy).sqrt()
}

/// Find cumulative values for each waypoint: first epsilon-close vertex at
/// or after the scan pointer, falling back to the nearest vertex at or after
/// the pointer. The pointer never moves backward.
fn match_waypoints(vertices: &[Vertex], seeds: &[WaypointSeed]) -> Option<Vec<(f64, f64)>> {
    if vertices.is_empty() {
        return None;
    }
    let mut pointer = 0usize;
    let mut matched = Vec::with_capacity(seeds.len());

    for seed in seeds {
        let target = [seed.coordinate.lon, seed.coordinate.lat];
        let hit = vertices[pointer..]
            .iter()
            .position(|vertex| planar(vertex.coord, target) <= MATCH_EPSILON)
            .map(|offset| pointer + offset);

        let index = hit.unwrap_or_else(|| {
            // Not on the route within epsilon: nearest remaining vertex
            let mut best = pointer;
            let mut best_distance = f64::INFINITY;
            for (offset, vertex) in vertices[pointer..].iter().enumerate() {
                let candidate = planar(vertex.coord, target);
                if candidate < best_distance {
                    best_distance = candidate;
                    best = pointer + offset;
                }
            }
            best
        });

        matched.push((vertices[index].time, vertices[index].distance));
        pointer = index;
    }
    Some(matched)
}

/// Materialize a single vehicle synchronously. Called from worker tasks.
pub fn materialize_vehicle(
    provider: &dyn DirectionsProvider,
    vehicle_id: u32,
    seeds: &[WaypointSeed],
    params: &MaterializeParams,
) -> VehicleRoute {
    let route_load = seeds.iter().map(|seed| seed.demand).sum();
    let started = Instant::now();

    let start = &seeds[0];
    let end = seeds.last().unwrap();
    let vias: Vec<(String, Coordinate)> = seeds[1..seeds.len() - 1]
        .iter()
        .map(|seed| (seed.stop_id.clone(), seed.coordinate))
        .collect();
    let request = RouteRequest::new(
        (&start.stop_id, start.coordinate),
        &vias,
        (&end.stop_id, end.coordinate),
        params,
    );

    let response = match provider.fetch_route(&request) {
        Ok(response) => response,
        Err(err) => {
            warn!(vehicle_id, reason = err.reason(), elapsed_ms = started.elapsed().as_millis() as u64, "provider call failed");
            return failed_route(vehicle_id, seeds, params, route_load, RouteStatus::ProviderError, err.reason());
        }
    };
    info!(
        vehicle_id,
        vias = vias.len(),
        latency_ms = started.elapsed().as_millis() as u64,
        "provider call completed"
    );

    let vertices = accumulate_vertices(&response);
    let Some(matched) = match_waypoints(&vertices, seeds) else {
        return failed_route(vehicle_id, seeds, params, route_load, RouteStatus::NoMatch, "no_route_geometry");
    };

    let geometry: Vec<[f64; 2]> = vertices.iter().map(|vertex| vertex.coord).collect();
    let (geometry_total_time, geometry_total_distance) = response.totals().unwrap_or_else(|| {
        vertices
            .last()
            .map(|vertex| (vertex.time, vertex.distance))
            .unwrap_or((0.0, 0.0))
    });

    let waypoints = seeds
        .iter()
        .zip(matched)
        .map(|(seed, (time, distance))| Waypoint {
            stop_id: seed.stop_id.clone(),
            name: seed.name.clone(),
            coordinate: seed.coordinate,
            demand: seed.demand,
            cumulative_time: time,
            cumulative_distance: distance,
            arrival_time: params.depart_at + chrono::Duration::seconds(time.round() as i64),
        })
        .collect();

    VehicleRoute {
        vehicle_id,
        waypoints,
        route_geometry: Some(geometry),
        geometry_total_time,
        geometry_total_distance,
        route_load,
        status: RouteStatus::Ok,
        error_reason: None,
    }
}

/// Route preserved in the artifact for a vehicle whose materialization
/// failed: ordered waypoints without geometry, plus the failure reason
fn failed_route(
    vehicle_id: u32,
    seeds: &[WaypointSeed],
    params: &MaterializeParams,
    route_load: u32,
    status: RouteStatus,
    reason: &str,
) -> VehicleRoute {
    VehicleRoute {
        vehicle_id,
        waypoints: seeds
            .iter()
            .map(|seed| Waypoint {
                stop_id: seed.stop_id.clone(),
                name: seed.name.clone(),
                coordinate: seed.coordinate,
                demand: seed.demand,
                cumulative_time: 0.0,
                cumulative_distance: 0.0,
                arrival_time: params.depart_at,
            })
            .collect(),
        route_geometry: None,
        geometry_total_time: 0.0,
        geometry_total_distance: 0.0,
        route_load,
        status,
        error_reason: Some(reason.to_string()),
    }
}

/// Concurrent per-vehicle dispatcher. Distinct vehicles are fetched in
/// parallel, bounded by the shared in-flight limiter; one vehicle's failure
/// never aborts the others. Dropping the returned future between vehicle
/// starts cancels the remaining launches while in-flight calls complete
/// naturally.
pub struct Materializer {
    provider: Arc<dyn DirectionsProvider>,
    limiter: Arc<tokio::sync::Semaphore>,
}

impl Materializer {
    pub fn new(provider: Arc<dyn DirectionsProvider>, max_in_flight: usize) -> Self {
        Self {
            provider,
            limiter: Arc::new(tokio::sync::Semaphore::new(max_in_flight.max(1))),
        }
    }

    /// Fetch every queued vehicle, returning routes keyed by vehicle id
    pub async fn run(
        &self,
        jobs: Vec<(u32, Vec<WaypointSeed>)>,
        params: &MaterializeParams,
    ) -> BTreeMap<u32, VehicleRoute> {
        let mut handles = Vec::with_capacity(jobs.len());
        for (vehicle_id, seeds) in jobs {
            if seeds.len() < 2 {
                continue;
            }
            let permit = self
                .limiter
                .clone()
                .acquire_owned()
                .await
                .expect("limiter is never closed");
            let provider = Arc::clone(&self.provider);
            let params = *params;
            handles.push(tokio::task::spawn_blocking(move || {
                let route = materialize_vehicle(provider.as_ref(), vehicle_id, &seeds, &params);
                drop(permit);
                route
            }));
        }

        let mut routes = BTreeMap::new();
        for handle in handles {
            if let Ok(route) = handle.await {
                routes.insert(route.vehicle_id, route);
            }
        }
        routes
    }

    /// Materialize a whole ordered plan into an artifact
    pub async fn materialize_plan(
        &self,
        plan: &OrderedPlan,
        stops: &StopSet,
        params: &MaterializeParams,
    ) -> PlanResult<PlanArtifact> {
        let jobs = plan_seeds(plan, stops)?;
        let routes = self.run(jobs, params).await;
        Ok(PlanArtifact {
            matrix_hash: plan.matrix_hash.clone(),
            params: *params,
            routes,
        })
    }
}

#[cfg(test)]
pub mod testing {
    //! Scripted provider double shared by materializer and delta tests

    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use crate::directions::{
        DirectionsError, DirectionsProvider, FeatureGeometry, FeatureProperties, RouteFeature,
        RouteRequest, RouteResponse,
    };

    /// Seconds and meters charged per leg of a scripted route
    pub const LEG_TIME: f64 = 120.0;
    pub const LEG_DISTANCE: f64 = 1_500.0;

    /// Deterministic in-memory provider: answers every request with straight
    /// legs through the requested points, fails requests touching the
    /// configured stop ids, and counts calls.
    pub struct ScriptedDirections {
        pub fail_for: Mutex<HashSet<String>>,
        pub calls: AtomicUsize,
    }

    impl ScriptedDirections {
        pub fn new() -> Self {
            Self {
                fail_for: Mutex::new(HashSet::new()),
                calls: AtomicUsize::new(0),
            }
        }

        pub fn fail_when_visiting(&self, stop_id: &str) {
            self.fail_for.lock().unwrap().insert(stop_id.to_string());
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl DirectionsProvider for ScriptedDirections {
        fn fetch_route(&self, request: &RouteRequest) -> Result<RouteResponse, DirectionsError> {
            self.calls.fetch_add(1, Ordering::SeqCst);

            let fail_for = self.fail_for.lock().unwrap();
            if request.via_points.iter().any(|via| fail_for.contains(&via.via_point_id))
                || fail_for.contains(&request.start_name)
                || fail_for.contains(&request.end_name)
            {
                return Err(DirectionsError::Status(502));
            }

            let mut points = vec![[request.start_x, request.start_y]];
            points.extend(request.via_points.iter().map(|via| [via.via_x, via.via_y]));
            points.push([request.end_x, request.end_y]);

            let legs = (points.len() - 1) as f64;
            let mut features = vec![RouteFeature {
                geometry: FeatureGeometry::Point(points[0]),
                properties: FeatureProperties {
                    total_time: Some(legs * LEG_TIME),
                    total_distance: Some(legs * LEG_DISTANCE),
                    time: None,
                    distance: None,
                    point_type: Some("S".to_string()),
                },
            }];
            for pair in points.windows(2) {
                features.push(RouteFeature {
                    geometry: FeatureGeometry::LineString(vec![pair[0], pair[1]]),
                    properties: FeatureProperties {
                        total_time: None,
                        total_distance: None,
                        time: Some(LEG_TIME),
                        distance: Some(LEG_DISTANCE),
                        point_type: None,
                    },
                });
            }
            Ok(RouteResponse { features })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{ScriptedDirections, LEG_DISTANCE, LEG_TIME};
    use super::*;
    use crate::directions::{FeatureGeometry, FeatureProperties, RouteFeature};
    use crate::types::MaterializeParams;
    use crate::validate::check_materialized_route;

    fn seed(id: &str, lon: f64, lat: f64, demand: u32) -> WaypointSeed {
        WaypointSeed {
            stop_id: id.to_string(),
            name: id.to_string(),
            coordinate: Coordinate::new(lon, lat),
            demand,
        }
    }

    fn line(coords: Vec<[f64; 2]>, time: f64, distance: f64) -> RouteFeature {
        RouteFeature {
            geometry: FeatureGeometry::LineString(coords),
            properties: FeatureProperties {
                total_time: None,
                total_distance: None,
                time: Some(time),
                distance: Some(distance),
                point_type: None,
            },
        }
    }

    #[test]
    fn walk_interpolates_within_segments() {
        let response = RouteResponse {
            features: vec![
                line(vec![[0.0, 0.0], [0.001, 0.0], [0.002, 0.0]], 100.0, 1000.0),
                line(vec![[0.002, 0.0], [0.004, 0.0]], 50.0, 600.0),
            ],
        };
        let vertices = accumulate_vertices(&response);

        // Shared vertex at the segment boundary is deduplicated
        assert_eq!(vertices.len(), 4);
        assert_eq!(vertices[0].time, 0.0);
        assert!((vertices[1].time - 50.0).abs() < 1e-9);
        assert!((vertices[2].time - 100.0).abs() < 1e-9);
        assert!((vertices[3].time - 150.0).abs() < 1e-9);
        assert!((vertices[3].distance - 1600.0).abs() < 1e-9);
    }

    #[test]
    fn point_cumulatives_override_running_totals() {
        let response = RouteResponse {
            features: vec![
                line(vec![[0.0, 0.0], [0.002, 0.0]], 100.0, 1000.0),
                RouteFeature {
                    geometry: FeatureGeometry::Point([0.002, 0.0]),
                    properties: FeatureProperties {
                        total_time: None,
                        total_distance: None,
                        time: Some(130.0),
                        distance: Some(1200.0),
                        point_type: Some("B".to_string()),
                    },
                },
                line(vec![[0.002, 0.0], [0.004, 0.0]], 50.0, 600.0),
            ],
        };
        let vertices = accumulate_vertices(&response);
        assert_eq!(vertices.len(), 3);
        // The boundary vertex takes the point feature's values, and the next
        // segment continues from them
        assert!((vertices[1].time - 130.0).abs() < 1e-9);
        assert!((vertices[2].time - 180.0).abs() < 1e-9);
        assert!((vertices[2].distance - 1800.0).abs() < 1e-9);
    }

    #[test]
    fn waypoint_matching_is_monotone() {
        // A route that passes the same coordinate twice: the second waypoint
        // visit must match the later vertex, not rewind to the earlier one
        let response = RouteResponse {
            features: vec![
                line(vec![[0.0, 0.0], [0.01, 0.0]], 100.0, 1000.0),
                line(vec![[0.01, 0.0], [0.0, 0.0]], 100.0, 1000.0),
                line(vec![[0.0, 0.0], [0.0, 0.01]], 100.0, 1000.0),
            ],
        };
        let vertices = accumulate_vertices(&response);
        let seeds = vec![
            seed("depot", 0.0, 0.0, 0),
            seed("a", 0.01, 0.0, 2),
            seed("depot2", 0.0, 0.0, 0),
            seed("b", 0.0, 0.01, 3),
        ];
        let matched = match_waypoints(&vertices, &seeds).unwrap();
        assert_eq!(matched[0].0, 0.0);
        assert!((matched[1].0 - 100.0).abs() < 1e-9);
        assert!((matched[2].0 - 200.0).abs() < 1e-9);
        assert!((matched[3].0 - 300.0).abs() < 1e-9);
    }

    #[test]
    fn unmatched_via_falls_back_to_nearest_forward_vertex() {
        let response = RouteResponse {
            features: vec![line(
                vec![[0.0, 0.0], [0.01, 0.0], [0.02, 0.0]],
                100.0,
                1000.0,
            )],
        };
        let vertices = accumulate_vertices(&response);
        // The via sits 0.003 degrees off the polyline, beyond epsilon
        let seeds = vec![
            seed("depot", 0.0, 0.0, 0),
            seed("off", 0.011, 0.003, 1),
            seed("end", 0.02, 0.0, 0),
        ];
        let matched = match_waypoints(&vertices, &seeds).unwrap();
        // Nearest vertex to the stray via is the middle one
        assert!((matched[1].0 - 50.0).abs() < 1e-9);
        assert!((matched[2].0 - 100.0).abs() < 1e-9);
        assert!(matched[1].0 <= matched[2].0);
    }

    #[test]
    fn materialized_vehicle_satisfies_cumulative_invariants() {
        let provider = ScriptedDirections::new();
        let params = MaterializeParams::default();
        let seeds = vec![
            seed("depot", 127.00, 37.50, 0),
            seed("a", 127.10, 37.50, 3),
            seed("depot", 127.00, 37.50, 0),
        ];
        let route = materialize_vehicle(&provider, 0, &seeds, &params);

        assert_eq!(route.status, RouteStatus::Ok);
        assert_eq!(route.route_load, 3);
        assert!(check_materialized_route(&route).is_empty());
        let end = route.end_point().unwrap();
        assert!(end.cumulative_time > 0.0);
        assert!((end.cumulative_time - 2.0 * LEG_TIME).abs() < 1e-9);
        assert!((end.cumulative_distance - 2.0 * LEG_DISTANCE).abs() < 1e-9);
        assert_eq!(
            end.arrival_time,
            params.depart_at + chrono::Duration::seconds(2 * LEG_TIME as i64)
        );
    }

    #[tokio::test]
    async fn failure_is_isolated_per_vehicle() {
        let provider = Arc::new(ScriptedDirections::new());
        provider.fail_when_visiting("b");
        let materializer = Materializer::new(provider, 4);
        let params = MaterializeParams::default();

        let jobs = vec![
            (1, vec![seed("depot", 0.0, 0.0, 0), seed("a", 0.01, 0.0, 2), seed("depot", 0.0, 0.0, 0)]),
            (2, vec![seed("depot", 0.0, 0.0, 0), seed("b", 0.02, 0.0, 2), seed("depot", 0.0, 0.0, 0)]),
            (3, vec![seed("depot", 0.0, 0.0, 0), seed("c", 0.03, 0.0, 2), seed("depot", 0.0, 0.0, 0)]),
        ];
        let routes = materializer.run(jobs, &params).await;

        assert_eq!(routes.len(), 3);
        assert_eq!(routes[&1].status, RouteStatus::Ok);
        assert!(routes[&1].route_geometry.is_some());
        assert_eq!(routes[&2].status, RouteStatus::ProviderError);
        assert!(routes[&2].route_geometry.is_none());
        assert_eq!(routes[&2].error_reason.as_deref(), Some("provider_5xx"));
        assert_eq!(routes[&2].waypoints.len(), 3);
        assert_eq!(routes[&3].status, RouteStatus::Ok);
    }

    #[tokio::test]
    async fn depot_only_vehicles_are_excluded() {
        use crate::types::{PlannedStop, RouteMode, Stop, VehiclePlan};

        let stops = StopSet::new(vec![
            Stop::depot("depot", "Depot", Coordinate::new(127.0, 37.5)),
            Stop::new("a", "A", Coordinate::new(127.1, 37.5), 3),
        ])
        .unwrap();
        let planned = |id: &str, load: u32| PlannedStop {
            stop_id: id.to_string(),
            cumulative_load: load,
            provisional_time: 0.0,
            provisional_distance: 0.0,
        };
        let plan = OrderedPlan {
            route_mode: RouteMode::ClosedTour,
            vehicles: vec![
                VehiclePlan {
                    vehicle_id: 0,
                    stops: vec![planned("depot", 0), planned("a", 3), planned("depot", 3)],
                },
                VehiclePlan {
                    vehicle_id: 1,
                    stops: vec![planned("depot", 0), planned("depot", 0)],
                },
            ],
            matrix_hash: "f".repeat(16),
            fallback_used: false,
            solve_time_ms: 1,
        };

        let provider = Arc::new(ScriptedDirections::new());
        let materializer = Materializer::new(provider.clone(), 2);
        let artifact = materializer
            .materialize_plan(&plan, &stops, &MaterializeParams::default())
            .await
            .unwrap();

        assert_eq!(artifact.routes.len(), 1);
        assert!(artifact.routes.contains_key(&0));
        assert_eq!(provider.call_count(), 1);
    }
}
