//! Client for the external directions provider
//!
//! The provider takes a start point, an ordered via list and an end point and
//! returns the road route as a GeoJSON-style feature collection: LineString
//! features carrying per-segment time and distance, Point features optionally
//! carrying cumulative values at that point.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use tracing::{debug, warn};

use crate::types::{Coordinate, MaterializeParams};

/// Route search strategy, wire integer codes per the provider contract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum SearchOption {
    Recommended = 0,
    FreeRoads = 1,
    Fastest = 2,
    Beginner = 3,
    Truck = 17,
}

/// Vehicle class, wire integer codes per the provider contract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum VehicleClass {
    Passenger = 1,
    MidVan = 2,
    LargeVan = 3,
    LargeTruck = 4,
    SpecialTruck = 5,
}

/// One intermediate stop of a provider request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViaPoint {
    pub via_point_id: String,
    pub via_point_name: String,
    pub via_x: f64,
    pub via_y: f64,
}

/// Provider request body. Field names must match the provider schema exactly.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteRequest {
    pub start_name: String,
    pub start_x: f64,
    pub start_y: f64,
    pub end_name: String,
    pub end_x: f64,
    pub end_y: f64,
    pub via_points: Vec<ViaPoint>,
    pub search_option: SearchOption,
    pub car_type: VehicleClass,
    /// Dwell seconds applied at each via
    pub total_value: u32,
    pub req_coord_type: String,
    pub res_coord_type: String,
    /// Departure time as YYYYMMDDHHMM
    pub start_time: String,
}

impl RouteRequest {
    /// Build a request for one vehicle leg: depot start, ordered vias, end
    /// point per route mode
    pub fn new(
        start: (&str, Coordinate),
        vias: &[(String, Coordinate)],
        end: (&str, Coordinate),
        params: &MaterializeParams,
    ) -> Self {
        Self {
            start_name: start.0.to_string(),
            start_x: start.1.lon,
            start_y: start.1.lat,
            end_name: end.0.to_string(),
            end_x: end.1.lon,
            end_y: end.1.lat,
            via_points: vias
                .iter()
                .map(|(id, coordinate)| ViaPoint {
                    via_point_id: id.clone(),
                    via_point_name: id.clone(),
                    via_x: coordinate.lon,
                    via_y: coordinate.lat,
                })
                .collect(),
            search_option: params.search_option,
            car_type: params.vehicle_class,
            total_value: params.via_dwell_seconds,
            req_coord_type: "WGS84GEO".to_string(),
            res_coord_type: "WGS84GEO".to_string(),
            start_time: params.depart_at.format("%Y%m%d%H%M").to_string(),
        }
    }
}

/// Provider response: a feature collection of route segments
#[derive(Debug, Clone, Deserialize)]
pub struct RouteResponse {
    pub features: Vec<RouteFeature>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteFeature {
    pub geometry: FeatureGeometry,
    #[serde(default)]
    pub properties: FeatureProperties,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "coordinates")]
pub enum FeatureGeometry {
    Point([f64; 2]),
    LineString(Vec<[f64; 2]>),
}

/// Per-feature properties. On LineString features `time`/`distance` are the
/// segment's own duration and length; on Point features they are cumulative
/// values from the route start. Totals appear on the first feature.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureProperties {
    #[serde(default)]
    pub total_time: Option<f64>,
    #[serde(default)]
    pub total_distance: Option<f64>,
    #[serde(default)]
    pub time: Option<f64>,
    #[serde(default)]
    pub distance: Option<f64>,
    #[serde(default)]
    pub point_type: Option<String>,
}

impl RouteResponse {
    /// Provider totals in seconds/meters, read from the first feature that
    /// carries them
    pub fn totals(&self) -> Option<(f64, f64)> {
        self.features.iter().find_map(|feature| {
            match (feature.properties.total_time, feature.properties.total_distance) {
                (Some(time), Some(distance)) => Some((time, distance)),
                _ => None,
            }
        })
    }
}

/// Errors from a single provider call
#[derive(thiserror::Error, Debug)]
pub enum DirectionsError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider returned HTTP {0}")]
    Status(u16),

    #[error("malformed provider response: {0}")]
    Malformed(String),

    #[error("provider call timed out")]
    Timeout,
}

impl DirectionsError {
    /// Transient failures are retried with backoff; the rest fail fast
    pub fn is_transient(&self) -> bool {
        match self {
            DirectionsError::Http(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            DirectionsError::Status(code) => *code >= 500 || *code == 429,
            DirectionsError::Malformed(_) => false,
            DirectionsError::Timeout => false,
        }
    }

    /// Machine-readable reason recorded on failed vehicle routes
    pub fn reason(&self) -> &'static str {
        match self {
            DirectionsError::Timeout => "timeout",
            DirectionsError::Status(code) if *code >= 500 => "provider_5xx",
            DirectionsError::Status(_) => "provider_rejected",
            DirectionsError::Http(_) => "network",
            DirectionsError::Malformed(_) => "malformed_response",
        }
    }
}

/// The seam between the materializer and the outside world. The HTTP client
/// implements it for production; tests substitute scripted doubles.
pub trait DirectionsProvider: Send + Sync {
    fn fetch_route(&self, request: &RouteRequest) -> Result<RouteResponse, DirectionsError>;
}

/// Thin blocking HTTP client with bounded retry and exponential backoff
pub struct HttpDirections {
    client: reqwest::blocking::Client,
    endpoint: String,
    app_key: String,
    max_attempts: u32,
    backoff_base: Duration,
    per_vehicle_timeout: Duration,
}

impl HttpDirections {
    pub fn new(endpoint: &str, app_key: &str) -> Result<Self, DirectionsError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            app_key: app_key.to_string(),
            max_attempts: 3,
            backoff_base: Duration::from_millis(500),
            per_vehicle_timeout: Duration::from_secs(60),
        })
    }

    pub fn with_timeouts(mut self, per_call: Duration, per_vehicle: Duration) -> Result<Self, DirectionsError> {
        self.client = reqwest::blocking::Client::builder().timeout(per_call).build()?;
        self.per_vehicle_timeout = per_vehicle;
        Ok(self)
    }

    fn attempt(&self, request: &RouteRequest) -> Result<RouteResponse, DirectionsError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("appKey", &self.app_key)
            .json(request)
            .send()?;

        let status = response.status();
        if !status.is_success() {
            return Err(DirectionsError::Status(status.as_u16()));
        }

        let parsed: RouteResponse = response
            .json()
            .map_err(|err| DirectionsError::Malformed(err.to_string()))?;
        if parsed.features.is_empty() {
            return Err(DirectionsError::Malformed("empty feature collection".to_string()));
        }
        Ok(parsed)
    }
}

impl DirectionsProvider for HttpDirections {
    fn fetch_route(&self, request: &RouteRequest) -> Result<RouteResponse, DirectionsError> {
        let started = Instant::now();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.attempt(request) {
                Ok(response) => {
                    debug!(attempt, vias = request.via_points.len(), "provider call succeeded");
                    return Ok(response);
                }
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    let backoff = self.backoff_base * 2u32.pow(attempt - 1);
                    if started.elapsed() + backoff > self.per_vehicle_timeout {
                        warn!(attempt, "provider retries exhausted the per-vehicle timeout");
                        return Err(DirectionsError::Timeout);
                    }
                    warn!(attempt, error = %err, "transient provider failure, backing off");
                    std::thread::sleep(backoff);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MaterializeParams;

    #[test]
    fn request_serializes_provider_field_names() {
        let params = MaterializeParams::default();
        let request = RouteRequest::new(
            ("depot", Coordinate::new(127.0, 37.5)),
            &[("a".to_string(), Coordinate::new(127.1, 37.5))],
            ("depot", Coordinate::new(127.0, 37.5)),
            &params,
        );
        let body = serde_json::to_value(&request).unwrap();

        assert_eq!(body["searchOption"], 0);
        assert_eq!(body["carType"], 1);
        assert_eq!(body["totalValue"], 60);
        assert_eq!(body["reqCoordType"], "WGS84GEO");
        assert_eq!(body["startTime"], "202401010900");
        assert_eq!(body["viaPoints"][0]["viaPointId"], "a");
        assert_eq!(body["viaPoints"][0]["viaX"], 127.1);
    }

    #[test]
    fn search_option_codes_match_contract() {
        assert_eq!(serde_json::to_value(SearchOption::Recommended).unwrap(), 0);
        assert_eq!(serde_json::to_value(SearchOption::FreeRoads).unwrap(), 1);
        assert_eq!(serde_json::to_value(SearchOption::Fastest).unwrap(), 2);
        assert_eq!(serde_json::to_value(SearchOption::Beginner).unwrap(), 3);
        assert_eq!(serde_json::to_value(SearchOption::Truck).unwrap(), 17);
        assert_eq!(serde_json::to_value(VehicleClass::SpecialTruck).unwrap(), 5);
    }

    #[test]
    fn response_totals_read_from_first_carrying_feature() {
        let raw = serde_json::json!({
            "features": [
                {
                    "geometry": { "type": "Point", "coordinates": [127.0, 37.5] },
                    "properties": { "totalTime": 1200.0, "totalDistance": 15000.0, "pointType": "S" }
                },
                {
                    "geometry": { "type": "LineString", "coordinates": [[127.0, 37.5], [127.1, 37.5]] },
                    "properties": { "time": 600.0, "distance": 8000.0 }
                }
            ]
        });
        let response: RouteResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(response.totals(), Some((1200.0, 15000.0)));
        assert_eq!(response.features.len(), 2);
    }

    #[test]
    fn transient_classification() {
        assert!(DirectionsError::Status(503).is_transient());
        assert!(DirectionsError::Status(429).is_transient());
        assert!(!DirectionsError::Status(400).is_transient());
        assert!(!DirectionsError::Malformed("x".into()).is_transient());
        assert_eq!(DirectionsError::Timeout.reason(), "timeout");
        assert_eq!(DirectionsError::Status(502).reason(), "provider_5xx");
    }
}
