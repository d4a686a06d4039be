//! Objective vocabulary and route cost evaluation
//!
//! The solver works against a scalarized cost: the primary objective plus up
//! to two tie-breakers scaled so that any primary improvement strictly
//! dominates them, plus weighted penalty terms folded into the primary tier.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{MatrixPair, RouteMode};
use crate::{PlanError, PlanResult};

/// Fixed cost charged per used vehicle when minimizing vehicles or cost.
/// Kept small relative to typical arc costs so the scalarization stays
/// numerically stable.
pub const FIXED_VEHICLE_COST: f64 = 1_000.0;

/// Workday length used by the overtime penalty, seconds
pub const DEFAULT_SHIFT_SECONDS: f64 = 8.0 * 3600.0;

/// Dominance factor between objective tiers
const TIER: f64 = 1.0e4;

/// Primary and tie-breaker objectives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Objective {
    Distance,
    Time,
    VehicleCount,
    Cost,
    Makespan,
}

/// Additional weighted penalty terms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PenaltyTerm {
    TimeWindowViolation,
    WaitTime,
    WorkloadBalance,
    Overtime,
    Co2Proxy,
    FixedCost,
    UtilizationPenalty,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightedTerm {
    pub term: PenaltyTerm,
    pub weight: f64,
}

/// Service window for a stop, seconds from the route departure
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: f64,
    pub end: f64,
}

/// Full objective specification for one solve
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectiveSpec {
    pub primary: Objective,
    #[serde(default)]
    pub tie_breakers: Vec<Objective>,
    #[serde(default)]
    pub extra_terms: Vec<WeightedTerm>,
}

impl ObjectiveSpec {
    pub fn distance() -> Self {
        Self {
            primary: Objective::Distance,
            tie_breakers: Vec::new(),
            extra_terms: Vec::new(),
        }
    }

    /// Reject invalid combinations before any solve work starts
    pub fn validate(&self) -> PlanResult<()> {
        if self.tie_breakers.len() > 2 {
            return Err(PlanError::BadInput(format!(
                "at most 2 tie-breakers are supported, got {}",
                self.tie_breakers.len()
            )));
        }
        let mut seen = vec![self.primary];
        for tie in &self.tie_breakers {
            if seen.contains(tie) {
                return Err(PlanError::BadInput(format!(
                    "objective {:?} appears more than once in primary/tie-breakers",
                    tie
                )));
            }
            seen.push(*tie);
        }
        for weighted in &self.extra_terms {
            if !(weighted.weight > 0.0) || !weighted.weight.is_finite() {
                return Err(PlanError::BadInput(format!(
                    "penalty term {:?} has non-positive or non-finite weight {}",
                    weighted.term, weighted.weight
                )));
            }
        }
        Ok(())
    }
}

/// Evaluation context: the matrices plus everything routes are scored
/// against. Routes are lists of non-depot stop indices; depot legs are
/// implied by the route mode.
pub struct CostModel<'a> {
    matrix: &'a MatrixPair,
    route_mode: RouteMode,
    capacity: u32,
    demands: &'a [u32],
    windows: BTreeMap<usize, TimeWindow>,
    spec: ObjectiveSpec,
}

impl<'a> CostModel<'a> {
    pub fn new(
        matrix: &'a MatrixPair,
        route_mode: RouteMode,
        capacity: u32,
        demands: &'a [u32],
        windows: BTreeMap<usize, TimeWindow>,
        spec: ObjectiveSpec,
    ) -> Self {
        Self {
            matrix,
            route_mode,
            capacity,
            demands,
            windows,
            spec,
        }
    }

    pub fn spec(&self) -> &ObjectiveSpec {
        &self.spec
    }

    /// Swap the requested objective for plain distance, keeping the rest of
    /// the context. Used by the solver's fallback path.
    pub fn with_distance_primary(&self) -> CostModel<'a> {
        CostModel {
            matrix: self.matrix,
            route_mode: self.route_mode,
            capacity: self.capacity,
            demands: self.demands,
            windows: self.windows.clone(),
            spec: ObjectiveSpec::distance(),
        }
    }

    pub fn route_time(&self, route: &[usize]) -> f64 {
        self.route_arc_sum(route, &self.matrix.time)
    }

    pub fn route_distance(&self, route: &[usize]) -> f64 {
        self.route_arc_sum(route, &self.matrix.distance)
    }

    fn route_arc_sum(&self, route: &[usize], grid: &[Vec<f64>]) -> f64 {
        if route.is_empty() {
            return 0.0;
        }
        let mut total = grid[0][route[0]];
        for pair in route.windows(2) {
            total += grid[pair[0]][pair[1]];
        }
        if self.route_mode == RouteMode::ClosedTour {
            total += grid[*route.last().unwrap()][0];
        }
        total
    }

    pub fn route_load(&self, route: &[usize]) -> u32 {
        route.iter().map(|&idx| self.demands[idx]).sum()
    }

    fn objective_value(&self, objective: Objective, routes: &[Vec<usize>]) -> f64 {
        let used: Vec<&Vec<usize>> = routes.iter().filter(|route| !route.is_empty()).collect();
        match objective {
            Objective::Distance => used.iter().map(|route| self.route_distance(route)).sum(),
            Objective::Time => used.iter().map(|route| self.route_time(route)).sum(),
            Objective::VehicleCount => used.len() as f64 * FIXED_VEHICLE_COST,
            Objective::Cost => {
                used.len() as f64 * FIXED_VEHICLE_COST
                    + used.iter().map(|route| self.route_distance(route)).sum::<f64>()
            }
            Objective::Makespan => used
                .iter()
                .map(|route| self.route_time(route))
                .fold(0.0, f64::max),
        }
    }

    fn penalty_sum(&self, routes: &[Vec<usize>]) -> f64 {
        if self.spec.extra_terms.is_empty() {
            return 0.0;
        }
        let used: Vec<&Vec<usize>> = routes.iter().filter(|route| !route.is_empty()).collect();
        let route_times: Vec<f64> = used.iter().map(|route| self.route_time(route)).collect();
        let mean_time = if route_times.is_empty() {
            0.0
        } else {
            route_times.iter().sum::<f64>() / route_times.len() as f64
        };

        self.spec
            .extra_terms
            .iter()
            .map(|weighted| {
                let raw = match weighted.term {
                    PenaltyTerm::TimeWindowViolation => self.window_violation(&used),
                    PenaltyTerm::WaitTime => self.wait_time(&used),
                    PenaltyTerm::WorkloadBalance => route_times
                        .iter()
                        .map(|time| (time - mean_time).abs())
                        .sum(),
                    PenaltyTerm::Overtime => route_times
                        .iter()
                        .map(|time| (time - DEFAULT_SHIFT_SECONDS).max(0.0))
                        .sum(),
                    PenaltyTerm::Co2Proxy => {
                        used.iter().map(|route| self.route_distance(route)).sum()
                    }
                    PenaltyTerm::FixedCost => used.len() as f64 * FIXED_VEHICLE_COST,
                    PenaltyTerm::UtilizationPenalty => used
                        .iter()
                        .map(|route| {
                            let slack = 1.0 - self.route_load(route) as f64 / self.capacity as f64;
                            slack * slack * FIXED_VEHICLE_COST
                        })
                        .sum(),
                };
                weighted.weight * raw
            })
            .sum()
    }

    fn window_violation(&self, used: &[&Vec<usize>]) -> f64 {
        self.fold_arrivals(used, |arrival, window| (arrival - window.end).max(0.0))
    }

    fn wait_time(&self, used: &[&Vec<usize>]) -> f64 {
        self.fold_arrivals(used, |arrival, window| (window.start - arrival).max(0.0))
    }

    fn fold_arrivals(&self, used: &[&Vec<usize>], cost: impl Fn(f64, &TimeWindow) -> f64) -> f64 {
        if self.windows.is_empty() {
            return 0.0;
        }
        let mut total = 0.0;
        for route in used {
            let mut arrival = 0.0;
            let mut previous = 0usize;
            for &idx in route.iter() {
                arrival += self.matrix.time[previous][idx];
                if let Some(window) = self.windows.get(&idx) {
                    total += cost(arrival, window);
                }
                previous = idx;
            }
        }
        total
    }

    /// Scalarized cost of a candidate assignment. Lower is better.
    /// A non-finite result means the requested objective is numerically
    /// unusable; the solver falls back to distance when it sees one.
    pub fn composite(&self, routes: &[Vec<usize>]) -> f64 {
        let mut tier_weight = TIER.powi(self.spec.tie_breakers.len() as i32);
        let mut score =
            (self.objective_value(self.spec.primary, routes) + self.penalty_sum(routes)) * tier_weight;
        for tie in &self.spec.tie_breakers {
            tier_weight /= TIER;
            score += self.objective_value(*tie, routes) * tier_weight;
        }
        score
    }

    /// Capacity feasibility of one route
    pub fn fits(&self, route: &[usize]) -> bool {
        self.route_load(route) <= self.capacity
    }
}
