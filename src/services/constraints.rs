//! Solver-ready stop constraints and the timing walk shared by every
//! sequencing strategy and by route assembly.
//!
//! All times are whole seconds relative to the route start. Stop `k` of the
//! model sits at index `k + 1` of the travel matrix (index 0 is the start).

use chrono::{DateTime, Utc};

use crate::config::PlanningConfig;
use crate::services::matrix::TravelMatrix;
use crate::types::Stop;

/// Feasibility window for the arrival at one stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopWindow {
    Unconstrained,
    /// Declared delivery window; either bound may be open
    Declared { start: Option<i64>, end: Option<i64> },
    /// Manual arrival at `at`, tolerated within `epsilon` either side
    Pinned { at: i64, epsilon: i64 },
}

impl StopWindow {
    /// Arrivals before this wait at the stop
    pub fn earliest(&self) -> Option<i64> {
        match *self {
            StopWindow::Unconstrained => None,
            StopWindow::Declared { start, .. } => start,
            StopWindow::Pinned { at, .. } => Some(at),
        }
    }

    /// Arrivals after this are late
    pub fn latest(&self) -> Option<i64> {
        match *self {
            StopWindow::Unconstrained => None,
            StopWindow::Declared { end, .. } => end,
            StopWindow::Pinned { at, epsilon } => Some(at + epsilon),
        }
    }

    /// Ordering key used by the fallback heuristic
    pub fn anchor(&self) -> Option<i64> {
        match *self {
            StopWindow::Unconstrained => None,
            StopWindow::Declared { start, end } => start.or(end),
            StopWindow::Pinned { at, .. } => Some(at),
        }
    }

    pub fn is_pinned(&self) -> bool {
        matches!(self, StopWindow::Pinned { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StopConstraint {
    pub stop_id: String,
    pub window: StopWindow,
    pub service_seconds: i64,
}

/// Penalties turning window violations into travel-time-equivalent cost
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CostWeights {
    /// Flat cost per late stop
    pub violation_penalty: i64,
    /// Cost per second of lateness
    pub lateness_weight: i64,
}

impl Default for CostWeights {
    fn default() -> Self {
        Self {
            violation_penalty: 10_000,
            lateness_weight: 100,
        }
    }
}

/// Simulated visit of one stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Visit {
    /// Position in the model's stop list
    pub stop: usize,
    pub travel_meters: u64,
    pub travel_seconds: i64,
    pub arrival: i64,
    pub departure: i64,
    /// Seconds past the latest allowed arrival
    pub lateness: i64,
}

#[derive(Debug, Clone)]
pub struct ConstraintModel {
    pub start: DateTime<Utc>,
    pub stops: Vec<StopConstraint>,
}

impl ConstraintModel {
    /// Translate stops into constraints relative to `start`.
    /// A manual arrival replaces any declared window.
    pub fn build(stops: &[Stop], start: DateTime<Utc>, config: &PlanningConfig) -> Self {
        let rel = |t: DateTime<Utc>| (t - start).num_seconds();
        let service_seconds = config.service_time().num_seconds();
        let epsilon = config.pin_epsilon().num_seconds();

        let stops = stops
            .iter()
            .map(|stop| {
                let window = match (stop.pins.arrival, stop.declared_window()) {
                    (Some(pin), _) => StopWindow::Pinned { at: rel(pin), epsilon },
                    (None, Some(declared)) => StopWindow::Declared {
                        start: declared.start.map(rel),
                        end: declared.end.map(rel),
                    },
                    (None, None) => StopWindow::Unconstrained,
                };
                StopConstraint {
                    stop_id: stop.id.clone(),
                    window,
                    service_seconds,
                }
            })
            .collect();

        Self { start, stops }
    }

    pub fn len(&self) -> usize {
        self.stops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stops.is_empty()
    }

    /// Walk `order` from the start, waiting for window openings
    pub fn simulate(&self, order: &[usize], matrix: &TravelMatrix) -> Vec<Visit> {
        let mut visits = Vec::with_capacity(order.len());
        let mut clock: i64 = 0;
        let mut prev = 0usize;

        for &stop in order {
            let constraint = &self.stops[stop];
            let idx = stop + 1;
            let travel_seconds = matrix.duration(prev, idx) as i64;
            let reach = clock + travel_seconds;
            let arrival = constraint.window.earliest().map_or(reach, |open| reach.max(open));
            let lateness = constraint
                .window
                .latest()
                .map_or(0, |close| (arrival - close).max(0));
            let departure = arrival + constraint.service_seconds;

            visits.push(Visit {
                stop,
                travel_meters: matrix.distance(prev, idx),
                travel_seconds,
                arrival,
                departure,
                lateness,
            });

            clock = departure;
            prev = idx;
        }

        visits
    }

    /// Penalised cost of visiting in `order`: travel seconds plus window penalties
    pub fn cost(&self, order: &[usize], matrix: &TravelMatrix, weights: &CostWeights) -> i64 {
        self.simulate(order, matrix)
            .iter()
            .map(|v| {
                let penalty = if v.lateness > 0 {
                    weights.violation_penalty + v.lateness * weights.lateness_weight
                } else {
                    0
                };
                v.travel_seconds + penalty
            })
            .sum()
    }

    /// A sequence is usable when it visits every stop exactly once
    pub fn is_complete(&self, order: &[usize]) -> bool {
        let mut seen = vec![false; self.stops.len()];
        order.len() == self.stops.len()
            && order
                .iter()
                .all(|&s| s < seen.len() && !std::mem::replace(&mut seen[s], true))
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// Matrix where travel between i and j takes |i - j| * step seconds (and meters)
    pub fn line_matrix(size: usize, step: u64) -> TravelMatrix {
        let rows: Vec<Vec<u64>> = (0..size)
            .map(|i| (0..size).map(|j| (i as i64 - j as i64).unsigned_abs() * step).collect())
            .collect();
        TravelMatrix::from_rows(rows.clone(), rows, false)
    }

    pub fn model(start: DateTime<Utc>, windows: Vec<StopWindow>, service_seconds: i64) -> ConstraintModel {
        ConstraintModel {
            start,
            stops: windows
                .into_iter()
                .enumerate()
                .map(|(i, window)| StopConstraint {
                    stop_id: format!("s{}", i + 1),
                    window,
                    service_seconds,
                })
                .collect(),
        }
    }
}
