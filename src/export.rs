//! GeoJSON export of materialized plans for map display

use geojson::{Feature, FeatureCollection, Geometry, JsonObject, Value};
use serde_json::json;

use crate::types::{PlanArtifact, RouteStatus};

/// Render an artifact as a FeatureCollection: one LineString per vehicle
/// with geometry, plus one Point per waypoint carrying its cumulatives
pub fn artifact_to_geojson(artifact: &PlanArtifact) -> FeatureCollection {
    let mut features = Vec::new();

    for route in artifact.routes.values() {
        if let Some(geometry) = &route.route_geometry {
            let coords: Vec<Vec<f64>> = geometry.iter().map(|pair| pair.to_vec()).collect();
            let mut properties = JsonObject::new();
            properties.insert("kind".to_string(), json!("route"));
            properties.insert("vehicleId".to_string(), json!(route.vehicle_id));
            properties.insert("routeLoad".to_string(), json!(route.route_load));
            properties.insert("geometryTotalTime".to_string(), json!(route.geometry_total_time));
            properties.insert(
                "geometryTotalDistance".to_string(),
                json!(route.geometry_total_distance),
            );
            features.push(Feature {
                bbox: None,
                geometry: Some(Geometry::new(Value::LineString(coords))),
                id: None,
                properties: Some(properties),
                foreign_members: None,
            });
        }

        for (order, waypoint) in route.waypoints.iter().enumerate() {
            let mut properties = JsonObject::new();
            properties.insert("kind".to_string(), json!("waypoint"));
            properties.insert("vehicleId".to_string(), json!(route.vehicle_id));
            properties.insert("order".to_string(), json!(order));
            properties.insert("stopId".to_string(), json!(waypoint.stop_id));
            properties.insert("name".to_string(), json!(waypoint.name));
            properties.insert("demand".to_string(), json!(waypoint.demand));
            properties.insert("cumulativeTime".to_string(), json!(waypoint.cumulative_time));
            properties.insert(
                "cumulativeDistance".to_string(),
                json!(waypoint.cumulative_distance),
            );
            if route.status == RouteStatus::Ok {
                properties.insert(
                    "arrivalTime".to_string(),
                    json!(waypoint.arrival_time.format("%Y-%m-%dT%H:%M:%S").to_string()),
                );
            }
            features.push(Feature {
                bbox: None,
                geometry: Some(Geometry::new(Value::Point(vec![
                    waypoint.coordinate.lon,
                    waypoint.coordinate.lat,
                ]))),
                id: None,
                properties: Some(properties),
                foreign_members: None,
            });
        }
    }

    FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Coordinate, MaterializeParams, VehicleRoute, Waypoint};

    fn artifact() -> PlanArtifact {
        let params = MaterializeParams::default();
        let waypoint = |id: &str, lon: f64, time: f64| Waypoint {
            stop_id: id.to_string(),
            name: id.to_string(),
            coordinate: Coordinate::new(lon, 37.5),
            demand: 0,
            cumulative_time: time,
            cumulative_distance: time * 10.0,
            arrival_time: params.depart_at + chrono::Duration::seconds(time as i64),
        };
        let mut artifact = PlanArtifact::empty("0".repeat(16), params);
        artifact.routes.insert(
            0,
            VehicleRoute {
                vehicle_id: 0,
                waypoints: vec![waypoint("depot", 127.0, 0.0), waypoint("a", 127.1, 120.0)],
                route_geometry: Some(vec![[127.0, 37.5], [127.1, 37.5]]),
                geometry_total_time: 120.0,
                geometry_total_distance: 1200.0,
                route_load: 3,
                status: RouteStatus::Ok,
                error_reason: None,
            },
        );
        artifact
    }

    #[test]
    fn exports_route_line_and_waypoint_points() {
        let collection = artifact_to_geojson(&artifact());
        assert_eq!(collection.features.len(), 3);

        let kinds: Vec<&str> = collection
            .features
            .iter()
            .map(|feature| feature.properties.as_ref().unwrap()["kind"].as_str().unwrap())
            .collect();
        assert_eq!(kinds, vec!["route", "waypoint", "waypoint"]);

        let line = &collection.features[0];
        assert!(matches!(
            line.geometry.as_ref().unwrap().value,
            Value::LineString(_)
        ));
    }

    #[test]
    fn failed_routes_export_waypoints_without_geometry() {
        let mut artifact = artifact();
        let route = artifact.routes.get_mut(&0).unwrap();
        route.route_geometry = None;
        route.status = RouteStatus::ProviderError;

        let collection = artifact_to_geojson(&artifact);
        assert_eq!(collection.features.len(), 2);
        assert!(collection
            .features
            .iter()
            .all(|feature| feature.properties.as_ref().unwrap()["kind"] == "waypoint"));
    }
}
