//! Route types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Whether a planned arrival lands inside the stop's window
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowCheck {
    pub within_window: bool,
    /// Minutes past the window end, 0 when on time or unconstrained
    pub lateness_minutes: i64,
}

impl WindowCheck {
    pub fn on_time() -> Self {
        Self {
            within_window: true,
            lateness_minutes: 0,
        }
    }
}

/// One visit in an optimized route
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutePoint {
    /// 1-based position in the route
    pub order: u32,
    pub stop_id: String,
    pub address: String,
    pub arrival_time: DateTime<Utc>,
    pub departure_time: DateTime<Utc>,
    pub distance_from_previous_meters: u64,
    pub duration_from_previous_seconds: u64,
    pub window_check: WindowCheck,
}

/// The planned visiting order for one courier day.
/// Replaced as a whole on every optimization run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizedRoute {
    pub points: Vec<RoutePoint>,
    pub start_time: DateTime<Utc>,
    pub total_distance_meters: u64,
    /// Seconds from start until the last departure, including waiting and service
    pub total_duration_seconds: u64,
    pub estimated_completion: DateTime<Utc>,
}

impl OptimizedRoute {
    pub fn empty(start_time: DateTime<Utc>) -> Self {
        Self {
            points: Vec::new(),
            start_time,
            total_distance_meters: 0,
            total_duration_seconds: 0,
            estimated_completion: start_time,
        }
    }

    pub fn point(&self, stop_id: &str) -> Option<&RoutePoint> {
        self.points.iter().find(|p| p.stop_id == stop_id)
    }

    pub fn stop_ids(&self) -> Vec<&str> {
        self.points.iter().map(|p| p.stop_id.as_str()).collect()
    }
}

/// Which sequencing strategy produced the route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequencingAlgorithm {
    LocalSearch,
    Fallback,
}

/// Why the primary solver did not produce the route
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum FallbackReason {
    SolverTimeout,
    SolverFailed(String),
}

impl std::fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FallbackReason::SolverTimeout => write!(f, "solver timeout"),
            FallbackReason::SolverFailed(msg) => write!(f, "solver failed: {}", msg),
        }
    }
}

/// A stop whose planned arrival misses its window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowViolation {
    pub stop_id: String,
    pub lateness_minutes: i64,
    /// The violated window came from a manual arrival pin
    pub pinned: bool,
}

/// What happened during an optimization run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunDiagnostics {
    pub algorithm: SequencingAlgorithm,
    pub fallback_reason: Option<FallbackReason>,
    /// Some legs were estimated from straight-line distance
    pub degraded_matrix: bool,
    pub window_violations: Vec<WindowViolation>,
    pub solve_time_ms: u64,
    pub solver_log: Vec<String>,
    /// Manual arrival times were left out of sequencing for this run
    #[serde(default)]
    pub manual_arrivals_ignored: bool,
}

impl RunDiagnostics {
    pub fn used_fallback(&self) -> bool {
        self.algorithm == SequencingAlgorithm::Fallback
    }
}
