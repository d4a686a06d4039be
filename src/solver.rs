//! Capacitated route optimization under a hard time budget
//!
//! Construction heuristics (Clarke-Wright savings and cheapest insertion)
//! seed the search in parallel; relocate/swap/2-opt local search improves the
//! best feasible seed until the deadline. If the requested objective cannot
//! produce a finite score, the solve falls back to a distance-primary
//! objective and records it in the result metadata.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use rand::Rng;
use rayon::prelude::*;
use tracing::{info, warn};

use crate::objective::{CostModel, Objective, ObjectiveSpec, TimeWindow};
use crate::types::{
    snapshot_hash, MatrixPair, OrderedPlan, PlannedStop, RouteMode, StopSet, VehiclePlan,
};
use crate::validate::validate_matrix;
use crate::{PlanError, PlanResult};

/// Solve parameters beyond the instance itself
#[derive(Debug, Clone)]
pub struct SolveOptions {
    pub vehicle_count: u32,
    pub capacity: u32,
    pub route_mode: RouteMode,
    pub objective: ObjectiveSpec,
    pub time_budget: Duration,
    /// Optional per-stop service windows, seconds from departure, keyed by
    /// stop id. Only consulted by window-related penalty terms.
    pub time_windows: BTreeMap<String, TimeWindow>,
}

impl SolveOptions {
    pub fn new(vehicle_count: u32, capacity: u32) -> Self {
        Self {
            vehicle_count,
            capacity,
            route_mode: RouteMode::ClosedTour,
            objective: ObjectiveSpec::distance(),
            time_budget: Duration::from_secs(60),
            time_windows: BTreeMap::new(),
        }
    }

    pub fn with_route_mode(mut self, route_mode: RouteMode) -> Self {
        self.route_mode = route_mode;
        self
    }

    pub fn with_objective(mut self, objective: ObjectiveSpec) -> Self {
        self.objective = objective;
        self
    }

    pub fn with_time_budget(mut self, budget: Duration) -> Self {
        self.time_budget = budget;
        self
    }
}

/// Produce an ordered plan for the given stops and matrix snapshot
pub fn solve(stops: &StopSet, matrix: &MatrixPair, options: &SolveOptions) -> PlanResult<OrderedPlan> {
    let started = Instant::now();
    let deadline = started + options.time_budget;

    check_inputs(stops, matrix, options)?;
    check_feasibility(stops, options)?;

    let demands: Vec<u32> = stops.stops.iter().map(|stop| stop.demand).collect();
    let windows = index_windows(stops, &options.time_windows);
    let mut model = CostModel::new(
        matrix,
        options.route_mode,
        options.capacity,
        &demands,
        windows,
        options.objective.clone(),
    );

    let customers: Vec<usize> = (1..stops.len()).collect();
    let vehicles = options.vehicle_count as usize;

    // Seed construction: both heuristics in parallel, keep feasible results
    let seeds: Vec<Vec<Vec<usize>>> = [
        SeedKind::Savings,
        SeedKind::CheapestInsertion,
        SeedKind::FarthestInsertion,
    ]
    .par_iter()
    .filter_map(|kind| construct(*kind, &customers, &demands, matrix, options))
    .collect();

    if seeds.is_empty() {
        return Err(PlanError::NoSolution);
    }

    let mut best = seeds
        .into_iter()
        .min_by(|a, b| model.composite(a).total_cmp(&model.composite(b)))
        .unwrap();
    let mut best_score = model.composite(&best);

    // Objective fallback: a non-finite score means the requested objective is
    // numerically unusable with this instance
    let mut fallback_used = false;
    let requested_plain_distance = options.objective.primary == Objective::Distance
        && options.objective.extra_terms.is_empty()
        && options.objective.tie_breakers.is_empty();
    if !best_score.is_finite() && !requested_plain_distance {
        warn!(
            objective = ?options.objective.primary,
            "objective produced a non-finite score, falling back to distance"
        );
        model = model.with_distance_primary();
        fallback_used = true;
        best_score = model.composite(&best);
    }
    if !best_score.is_finite() {
        return Err(PlanError::NoSolution);
    }

    // Pad with empty routes so moves can open unused vehicles
    while best.len() < vehicles {
        best.push(Vec::new());
    }

    improve(&mut best, &mut best_score, &model, deadline);

    let plan = to_ordered_plan(&best, stops, matrix, options, fallback_used, started);
    info!(
        vehicles = plan.vehicles.len(),
        fallback = plan.fallback_used,
        solve_ms = plan.solve_time_ms,
        "solve finished"
    );
    Ok(plan)
}

fn check_inputs(stops: &StopSet, matrix: &MatrixPair, options: &SolveOptions) -> PlanResult<()> {
    if options.vehicle_count < 1 {
        return Err(PlanError::BadInput("vehicle_count must be at least 1".to_string()));
    }
    if options.capacity < 1 {
        return Err(PlanError::BadInput("capacity must be at least 1".to_string()));
    }
    if options.time_budget < Duration::from_secs(1) {
        return Err(PlanError::BadInput("time budget must be at least 1 second".to_string()));
    }
    if stops.len() < 2 {
        return Err(PlanError::BadInput("need at least one non-depot stop".to_string()));
    }
    options.objective.validate()?;
    validate_matrix(stops, matrix)
}

/// Cheap infeasibility screens, run before any solve work
fn check_feasibility(stops: &StopSet, options: &SolveOptions) -> PlanResult<()> {
    let fleet_capacity = options.vehicle_count as u64 * options.capacity as u64;
    let total = stops.total_demand();
    if total > fleet_capacity {
        return Err(PlanError::Infeasible(format!(
            "total demand {} exceeds fleet capacity {}",
            total, fleet_capacity
        )));
    }
    for stop in stops.stops.iter().skip(1) {
        if stop.demand > options.capacity {
            return Err(PlanError::Infeasible(format!(
                "stop '{}' demand {} exceeds vehicle capacity {}",
                stop.id, stop.demand, options.capacity
            )));
        }
    }
    Ok(())
}

fn index_windows(
    stops: &StopSet,
    windows: &BTreeMap<String, TimeWindow>,
) -> BTreeMap<usize, TimeWindow> {
    stops
        .stops
        .iter()
        .enumerate()
        .filter_map(|(idx, stop)| windows.get(&stop.id).map(|window| (idx, *window)))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SeedKind {
    Savings,
    CheapestInsertion,
    FarthestInsertion,
}

fn construct(
    kind: SeedKind,
    customers: &[usize],
    demands: &[u32],
    matrix: &MatrixPair,
    options: &SolveOptions,
) -> Option<Vec<Vec<usize>>> {
    let routes = match kind {
        SeedKind::Savings => savings_seed(customers, demands, matrix, options),
        SeedKind::CheapestInsertion => insertion_seed(customers, demands, matrix, options, false),
        SeedKind::FarthestInsertion => insertion_seed(customers, demands, matrix, options, true),
    }?;
    debug_assert!(routes.iter().all(|route| !route.is_empty()));
    Some(routes)
}

/// Clarke-Wright savings: start with one route per customer, merge route
/// ends by descending savings while capacity allows, then require the result
/// to fit the fleet
fn savings_seed(
    customers: &[usize],
    demands: &[u32],
    matrix: &MatrixPair,
    options: &SolveOptions,
) -> Option<Vec<Vec<usize>>> {
    let mut routes: Vec<Vec<usize>> = customers.iter().map(|&idx| vec![idx]).collect();
    let mut route_of: BTreeMap<usize, usize> = customers
        .iter()
        .enumerate()
        .map(|(route, &idx)| (idx, route))
        .collect();

    let mut savings: Vec<(f64, usize, usize)> = Vec::new();
    for (a, &i) in customers.iter().enumerate() {
        for &j in customers.iter().skip(a + 1) {
            let value = matrix.distance[0][i] + matrix.distance[0][j] - matrix.distance[i][j];
            savings.push((value, i, j));
        }
    }
    savings.sort_by(|a, b| b.0.total_cmp(&a.0));

    for (_, i, j) in savings {
        let (ri, rj) = (route_of[&i], route_of[&j]);
        if ri == rj {
            continue;
        }
        let load: u32 = routes[ri].iter().chain(routes[rj].iter()).map(|&idx| demands[idx]).sum();
        if load > options.capacity {
            continue;
        }
        // Only merge at route ends so the interior order is preserved
        let merged = if routes[ri].last() == Some(&i) && routes[rj].first() == Some(&j) {
            let mut merged = routes[ri].clone();
            merged.extend(routes[rj].iter().copied());
            Some(merged)
        } else if routes[rj].last() == Some(&j) && routes[ri].first() == Some(&i) {
            let mut merged = routes[rj].clone();
            merged.extend(routes[ri].iter().copied());
            Some(merged)
        } else {
            None
        };
        if let Some(merged) = merged {
            for &idx in &merged {
                route_of.insert(idx, ri);
            }
            routes[ri] = merged;
            routes[rj] = Vec::new();
        }
    }

    let routes: Vec<Vec<usize>> = routes.into_iter().filter(|route| !route.is_empty()).collect();
    (routes.len() <= options.vehicle_count as usize).then_some(routes)
}

/// Insert customers one by one at the cheapest feasible position across the
/// fleet. Ordering by descending demand packs tight instances; the farthest
/// variant orders by distance from the depot instead.
fn insertion_seed(
    customers: &[usize],
    demands: &[u32],
    matrix: &MatrixPair,
    options: &SolveOptions,
    farthest_first: bool,
) -> Option<Vec<Vec<usize>>> {
    let mut order: Vec<usize> = customers.to_vec();
    if farthest_first {
        order.sort_by(|&a, &b| matrix.distance[0][b].total_cmp(&matrix.distance[0][a]));
    } else {
        order.sort_by(|&a, &b| demands[b].cmp(&demands[a]));
    }

    let vehicles = options.vehicle_count as usize;
    let mut routes: Vec<Vec<usize>> = vec![Vec::new(); vehicles];
    let mut loads = vec![0u32; vehicles];

    for idx in order {
        let mut best: Option<(usize, usize, f64)> = None;
        for (vehicle, route) in routes.iter().enumerate() {
            if loads[vehicle] + demands[idx] > options.capacity {
                continue;
            }
            for position in 0..=route.len() {
                let delta = insertion_delta(route, position, idx, matrix, options.route_mode);
                if best.is_none() || delta < best.unwrap().2 {
                    best = Some((vehicle, position, delta));
                }
            }
        }
        let (vehicle, position, _) = best?;
        routes[vehicle].insert(position, idx);
        loads[vehicle] += demands[idx];
    }

    Some(routes.into_iter().filter(|route| !route.is_empty()).collect())
}

fn insertion_delta(
    route: &[usize],
    position: usize,
    idx: usize,
    matrix: &MatrixPair,
    route_mode: RouteMode,
) -> f64 {
    let grid = &matrix.distance;
    let before = if position == 0 { 0 } else { route[position - 1] };
    match route.get(position) {
        Some(&after) => grid[before][idx] + grid[idx][after] - grid[before][after],
        None => match route_mode {
            RouteMode::ClosedTour => grid[before][idx] + grid[idx][0] - grid[before][0],
            RouteMode::OpenEnd => grid[before][idx],
        },
    }
}

/// Hill-climbing local search over relocate, swap and intra-route 2-opt
/// moves, running until the deadline
fn improve(routes: &mut Vec<Vec<usize>>, best_score: &mut f64, model: &CostModel, deadline: Instant) {
    let mut rng = rand::thread_rng();
    let mut stale_iterations = 0usize;

    while Instant::now() < deadline && stale_iterations < 50_000 {
        let candidate = match rng.gen_range(0..3) {
            0 => relocate(routes, &mut rng),
            1 => swap(routes, &mut rng),
            _ => two_opt(routes, &mut rng),
        };
        let Some(candidate) = candidate else {
            stale_iterations += 1;
            continue;
        };
        if candidate.iter().any(|route| !route.is_empty() && !model.fits(route)) {
            stale_iterations += 1;
            continue;
        }
        let score = model.composite(&candidate);
        if score.is_finite() && score < *best_score - 1e-9 {
            *routes = candidate;
            *best_score = score;
            stale_iterations = 0;
        } else {
            stale_iterations += 1;
        }
    }
}

fn relocate(routes: &[Vec<usize>], rng: &mut impl Rng) -> Option<Vec<Vec<usize>>> {
    let from = pick_nonempty(routes, rng)?;
    let mut candidate = routes.to_vec();
    let position = rng.gen_range(0..candidate[from].len());
    let stop = candidate[from].remove(position);
    let to = rng.gen_range(0..candidate.len());
    let insert_at = if candidate[to].is_empty() {
        0
    } else {
        rng.gen_range(0..=candidate[to].len())
    };
    candidate[to].insert(insert_at, stop);
    Some(candidate)
}

fn swap(routes: &[Vec<usize>], rng: &mut impl Rng) -> Option<Vec<Vec<usize>>> {
    let first = pick_nonempty(routes, rng)?;
    let second = pick_nonempty(routes, rng)?;
    let mut candidate = routes.to_vec();
    let i = rng.gen_range(0..candidate[first].len());
    let j = rng.gen_range(0..candidate[second].len());
    if first == second && i == j {
        return None;
    }
    let (a, b) = (candidate[first][i], candidate[second][j]);
    candidate[first][i] = b;
    candidate[second][j] = a;
    Some(candidate)
}

fn two_opt(routes: &[Vec<usize>], rng: &mut impl Rng) -> Option<Vec<Vec<usize>>> {
    let which = pick_nonempty(routes, rng)?;
    if routes[which].len() < 3 {
        return None;
    }
    let mut candidate = routes.to_vec();
    let len = candidate[which].len();
    let i = rng.gen_range(0..len - 1);
    let j = rng.gen_range(i + 1..len);
    candidate[which][i..=j].reverse();
    Some(candidate)
}

fn pick_nonempty(routes: &[Vec<usize>], rng: &mut impl Rng) -> Option<usize> {
    let nonempty: Vec<usize> = routes
        .iter()
        .enumerate()
        .filter(|(_, route)| !route.is_empty())
        .map(|(idx, _)| idx)
        .collect();
    if nonempty.is_empty() {
        None
    } else {
        Some(nonempty[rng.gen_range(0..nonempty.len())])
    }
}

/// Turn index routes into the ordered-plan artifact with per-stop
/// cumulative load and matrix-based provisional cumulatives
fn to_ordered_plan(
    routes: &[Vec<usize>],
    stops: &StopSet,
    matrix: &MatrixPair,
    options: &SolveOptions,
    fallback_used: bool,
    started: Instant,
) -> OrderedPlan {
    let depot = stops.depot();
    let mut vehicles = Vec::new();

    for route in routes.iter().filter(|route| !route.is_empty()) {
        let vehicle_id = vehicles.len() as u32;
        let mut planned = vec![PlannedStop {
            stop_id: depot.id.clone(),
            cumulative_load: 0,
            provisional_time: 0.0,
            provisional_distance: 0.0,
        }];

        let mut load = 0u32;
        let mut time = 0.0;
        let mut distance = 0.0;
        let mut previous = 0usize;
        for &idx in route {
            let stop = &stops.stops[idx];
            load += stop.demand;
            time += matrix.time[previous][idx];
            distance += matrix.distance[previous][idx];
            planned.push(PlannedStop {
                stop_id: stop.id.clone(),
                cumulative_load: load,
                provisional_time: time,
                provisional_distance: distance,
            });
            previous = idx;
        }

        if options.route_mode == RouteMode::ClosedTour {
            time += matrix.time[previous][0];
            distance += matrix.distance[previous][0];
            planned.push(PlannedStop {
                stop_id: depot.id.clone(),
                cumulative_load: load,
                provisional_time: time,
                provisional_distance: distance,
            });
        }

        vehicles.push(VehiclePlan {
            vehicle_id,
            stops: planned,
        });
    }

    OrderedPlan {
        route_mode: options.route_mode,
        vehicles,
        matrix_hash: snapshot_hash(stops, matrix),
        fallback_used,
        solve_time_ms: started.elapsed().as_millis() as u64,
    }
}
