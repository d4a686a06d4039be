//! Request and response types for the plan lifecycle API

use std::collections::BTreeMap;

use chrono::{NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};

use crate::directions::{SearchOption, VehicleClass};
use crate::objective::{ObjectiveSpec, TimeWindow};
use crate::types::{MaterializeParams, RouteMode, Stop};

/// Snapshot ingestion: the matrix store hands the core its current stop set
/// and matrix pair
#[derive(Debug, Deserialize)]
pub struct SnapshotRequest {
    pub stops: Vec<Stop>,
    pub time_matrix: Vec<Vec<f64>>,
    pub distance_matrix: Vec<Vec<f64>>,
}

#[derive(Debug, Serialize)]
pub struct SnapshotResponse {
    pub snapshot_hash: String,
    pub stops: usize,
}

#[derive(Debug, Deserialize)]
pub struct OptimizeRequest {
    /// Must match the project's current snapshot
    pub snapshot_hash: String,
    pub vehicle_count: u32,
    pub capacity: u32,
    #[serde(default = "default_route_mode")]
    pub route_mode: RouteMode,
    #[serde(default = "ObjectiveSpec::distance")]
    pub objective: ObjectiveSpec,
    #[serde(default = "default_time_budget")]
    pub time_budget_seconds: u64,
    #[serde(default)]
    pub time_windows: BTreeMap<String, TimeWindow>,
}

fn default_route_mode() -> RouteMode {
    RouteMode::ClosedTour
}

fn default_time_budget() -> u64 {
    60
}

/// Materialization parameters; omitted fields take the documented defaults
#[derive(Debug, Default, Deserialize)]
pub struct MaterializeRequest {
    #[serde(default)]
    pub search_option: Option<SearchOption>,
    #[serde(default)]
    pub vehicle_class: Option<VehicleClass>,
    #[serde(default)]
    pub depart_at: Option<NaiveDateTime>,
    #[serde(default)]
    pub via_dwell_seconds: Option<u32>,
}

impl MaterializeRequest {
    /// Resolve against defaults; departure defaults to now at minute
    /// precision
    pub fn params(&self) -> MaterializeParams {
        MaterializeParams {
            search_option: self.search_option.unwrap_or(SearchOption::Recommended),
            vehicle_class: self.vehicle_class.unwrap_or(VehicleClass::Passenger),
            depart_at: self.depart_at.unwrap_or_else(|| {
                chrono::Local::now()
                    .naive_local()
                    .with_second(0)
                    .and_then(|t| t.with_nanosecond(0))
                    .expect("zero seconds is always valid")
            }),
            via_dwell_seconds: self.via_dwell_seconds.unwrap_or(60),
        }
    }

    /// Resolve against a scenario's previous parameters, so a reload that
    /// changes nothing keeps the cached fingerprints intact
    pub fn params_with_base(&self, base: Option<MaterializeParams>) -> MaterializeParams {
        match base {
            Some(base) => MaterializeParams {
                search_option: self.search_option.unwrap_or(base.search_option),
                vehicle_class: self.vehicle_class.unwrap_or(base.vehicle_class),
                depart_at: self.depart_at.unwrap_or(base.depart_at),
                via_dwell_seconds: self.via_dwell_seconds.unwrap_or(base.via_dwell_seconds),
            },
            None => self.params(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateEditRequest {
    pub edit_id: String,
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct EditListResponse {
    pub edits: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStopLocationRequest {
    pub lon: f64,
    pub lat: f64,
}

/// Timeline reorder: per-vehicle ordered stop-id lists, tabular write only
#[derive(Debug, Deserialize)]
pub struct ReorderRequest {
    pub orders: BTreeMap<u32, Vec<String>>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            details: None,
        }
    }

    pub fn with_details(error: &str, message: &str, details: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            details: Some(details.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optimize_request_defaults() {
        let raw = serde_json::json!({
            "snapshot_hash": "abc",
            "vehicle_count": 2,
            "capacity": 10
        });
        let request: OptimizeRequest = serde_json::from_value(raw).unwrap();
        assert_eq!(request.route_mode, RouteMode::ClosedTour);
        assert_eq!(request.time_budget_seconds, 60);
        assert!(request.time_windows.is_empty());
        assert_eq!(request.objective.primary, crate::objective::Objective::Distance);
    }

    #[test]
    fn materialize_request_resolves_defaults() {
        let request: MaterializeRequest = serde_json::from_str("{}").unwrap();
        let params = request.params();
        assert_eq!(params.search_option, SearchOption::Recommended);
        assert_eq!(params.vehicle_class, VehicleClass::Passenger);
        assert_eq!(params.via_dwell_seconds, 60);
        assert_eq!(params.depart_at.second(), 0);
    }

    #[test]
    fn materialize_request_accepts_wire_codes() {
        let raw = serde_json::json!({
            "search_option": 17,
            "vehicle_class": 4,
            "depart_at": "2026-08-01T06:30:00",
            "via_dwell_seconds": 120
        });
        let request: MaterializeRequest = serde_json::from_value(raw).unwrap();
        let params = request.params();
        assert_eq!(params.search_option, SearchOption::Truck);
        assert_eq!(params.vehicle_class, VehicleClass::LargeTruck);
        assert_eq!(params.via_dwell_seconds, 120);
    }
}
