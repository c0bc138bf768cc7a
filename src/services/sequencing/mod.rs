//! Sequencing solver
//!
//! Two stages: a deterministic local search within the time budget, then the
//! fallback ordering when the search times out or fails. Both stages always
//! return a complete visiting order.

mod config;
mod fallback;
mod local_search;

pub use config::SolverConfig;
pub use fallback::fallback_order;

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::services::constraints::ConstraintModel;
use crate::services::matrix::TravelMatrix;
use crate::types::{FallbackReason, SequencingAlgorithm};

/// Why the primary solver gave up
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SolveError {
    #[error("solver timed out")]
    Timeout,
    #[error("solver failed: {0}")]
    Internal(String),
}

impl From<SolveError> for FallbackReason {
    fn from(err: SolveError) -> Self {
        match err {
            SolveError::Timeout => FallbackReason::SolverTimeout,
            SolveError::Internal(msg) => FallbackReason::SolverFailed(msg),
        }
    }
}

/// Visiting order plus how it was obtained
#[derive(Debug, Clone, PartialEq)]
pub struct SequencingOutcome {
    /// Positions into the model's stop list
    pub order: Vec<usize>,
    pub algorithm: SequencingAlgorithm,
    pub fallback_reason: Option<FallbackReason>,
    pub solve_time_ms: u64,
    pub solver_log: Vec<String>,
}

/// Sequence on the current thread
pub fn sequence(model: &ConstraintModel, matrix: &TravelMatrix, config: &SolverConfig) -> SequencingOutcome {
    let started_at = Instant::now();
    if model.is_empty() {
        return empty_outcome(started_at);
    }
    let primary = local_search::solve(model, matrix, config, started_at);
    finish(model, matrix, primary, started_at)
}

/// Sequence on the blocking pool so the solver budget never stalls the runtime.
/// A panicking solver is treated like any other solver failure.
pub async fn sequence_blocking(
    model: Arc<ConstraintModel>,
    matrix: Arc<TravelMatrix>,
    config: SolverConfig,
) -> SequencingOutcome {
    let started_at = Instant::now();
    if model.is_empty() {
        return empty_outcome(started_at);
    }

    let (task_model, task_matrix) = (Arc::clone(&model), Arc::clone(&matrix));
    let primary = tokio::task::spawn_blocking(move || {
        local_search::solve(&task_model, &task_matrix, &config, started_at)
    })
    .await
    .unwrap_or_else(|join_err| Err(SolveError::Internal(format!("solver task aborted: {}", join_err))));

    finish(&model, &matrix, primary, started_at)
}

fn empty_outcome(started_at: Instant) -> SequencingOutcome {
    debug!("No stops to sequence, returning empty order");
    SequencingOutcome {
        order: Vec::new(),
        algorithm: SequencingAlgorithm::LocalSearch,
        fallback_reason: None,
        solve_time_ms: started_at.elapsed().as_millis() as u64,
        solver_log: vec!["no_stops".to_string()],
    }
}

fn finish(
    model: &ConstraintModel,
    matrix: &TravelMatrix,
    primary: Result<local_search::Solved, SolveError>,
    started_at: Instant,
) -> SequencingOutcome {
    match primary {
        Ok(solved) => {
            let solve_time_ms = started_at.elapsed().as_millis() as u64;
            let mut solver_log = vec![format!("algorithm=local_search time_ms={}", solve_time_ms)];
            solver_log.extend(solved.log);
            info!(
                "Sequenced {} stops with local search (cost {}, {} ms)",
                solved.order.len(),
                solved.cost,
                solve_time_ms
            );
            SequencingOutcome {
                order: solved.order,
                algorithm: SequencingAlgorithm::LocalSearch,
                fallback_reason: None,
                solve_time_ms,
                solver_log,
            }
        }
        Err(err) => {
            warn!("Local search gave up, falling back to heuristic: {}", err);
            let order = fallback_order(model, matrix);
            let solve_time_ms = started_at.elapsed().as_millis() as u64;
            SequencingOutcome {
                order,
                algorithm: SequencingAlgorithm::Fallback,
                solver_log: vec![
                    format!("primary_error={}", err),
                    format!("algorithm=fallback time_ms={}", solve_time_ms),
                ],
                fallback_reason: Some(err.into()),
                solve_time_ms,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::constraints::fixtures::{line_matrix, model};
    use crate::services::constraints::StopWindow;
    use chrono::{TimeZone, Utc};

    fn sample() -> (ConstraintModel, TravelMatrix) {
        let start = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        let model = model(
            start,
            vec![
                StopWindow::Unconstrained,
                StopWindow::Declared { start: Some(3000), end: Some(4000) },
                StopWindow::Pinned { at: 1200, epsilon: 60 },
                StopWindow::Unconstrained,
            ],
            600,
        );
        (model, line_matrix(5, 150))
    }

    #[test]
    fn test_primary_success() {
        let (model, matrix) = sample();
        let outcome = sequence(&model, &matrix, &SolverConfig::default());

        assert_eq!(outcome.algorithm, SequencingAlgorithm::LocalSearch);
        assert!(outcome.fallback_reason.is_none());
        assert!(model.is_complete(&outcome.order));
    }

    #[test]
    fn test_timeout_uses_fallback() {
        let (model, matrix) = sample();
        let outcome = sequence(&model, &matrix, &SolverConfig::new(0));

        assert_eq!(outcome.algorithm, SequencingAlgorithm::Fallback);
        assert_eq!(outcome.fallback_reason, Some(FallbackReason::SolverTimeout));
        assert_eq!(outcome.order, fallback_order(&model, &matrix));
        assert!(model.is_complete(&outcome.order));
        assert!(outcome.solver_log[0].starts_with("primary_error="));
    }

    #[test]
    fn test_empty_model() {
        let start = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        let model = model(start, vec![], 600);
        let outcome = sequence(&model, &line_matrix(1, 100), &SolverConfig::new(0));

        assert!(outcome.order.is_empty());
        assert_eq!(outcome.algorithm, SequencingAlgorithm::LocalSearch);
    }

    #[tokio::test]
    async fn test_blocking_matches_inline() {
        let (model, matrix) = sample();
        let inline = sequence(&model, &matrix, &SolverConfig::default());

        let outcome = sequence_blocking(Arc::new(model), Arc::new(matrix), SolverConfig::default()).await;

        assert_eq!(outcome.order, inline.order);
        assert_eq!(outcome.algorithm, inline.algorithm);
    }

    #[tokio::test]
    async fn test_blocking_internal_failure_falls_back() {
        let (model, _) = sample();
        // sized for more locations than the model has
        let oversized = line_matrix(7, 150);

        let outcome = sequence_blocking(Arc::new(model.clone()), Arc::new(oversized), SolverConfig::default()).await;

        assert_eq!(outcome.algorithm, SequencingAlgorithm::Fallback);
        assert!(matches!(outcome.fallback_reason, Some(FallbackReason::SolverFailed(_))));
        assert!(model.is_complete(&outcome.order));
    }
}
