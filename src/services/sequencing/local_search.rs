//! Primary sequencing: cheapest of a few deterministic constructions,
//! improved by first-improvement 2-opt and or-opt on the penalised cost.

use std::time::Instant;

use tracing::debug;

use super::{fallback::fallback_order, SolveError, SolverConfig};
use crate::services::constraints::ConstraintModel;
use crate::services::matrix::TravelMatrix;

/// Result of a completed local search
#[derive(Debug, Clone)]
pub(super) struct Solved {
    pub order: Vec<usize>,
    pub cost: i64,
    pub log: Vec<String>,
}

struct Search<'a> {
    model: &'a ConstraintModel,
    matrix: &'a TravelMatrix,
    config: &'a SolverConfig,
    deadline: Instant,
}

impl Search<'_> {
    fn check_deadline(&self) -> Result<(), SolveError> {
        if Instant::now() >= self.deadline {
            Err(SolveError::Timeout)
        } else {
            Ok(())
        }
    }

    fn cost(&self, order: &[usize]) -> i64 {
        self.model.cost(order, self.matrix, &self.config.weights)
    }

    /// Reverse one slice; accept the first strictly cheaper result
    fn two_opt(&self, order: &mut Vec<usize>, cost: &mut i64) -> Result<bool, SolveError> {
        let n = order.len();
        for i in 0..n.saturating_sub(1) {
            for j in i + 1..n {
                self.check_deadline()?;
                let mut candidate = order.clone();
                candidate[i..=j].reverse();
                let candidate_cost = self.cost(&candidate);
                if candidate_cost < *cost {
                    *order = candidate;
                    *cost = candidate_cost;
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Move a run of 1..=max_segment_len stops elsewhere; first strictly cheaper wins
    fn or_opt(&self, order: &mut Vec<usize>, cost: &mut i64) -> Result<bool, SolveError> {
        let n = order.len();
        for segment_len in 1..=self.config.max_segment_len.min(n.saturating_sub(1)) {
            for start in 0..=n - segment_len {
                let mut base = order.clone();
                let segment: Vec<usize> = base.drain(start..start + segment_len).collect();

                for insert_pos in 0..=base.len() {
                    if insert_pos == start {
                        continue;
                    }
                    self.check_deadline()?;
                    let mut candidate = base.clone();
                    candidate.splice(insert_pos..insert_pos, segment.iter().copied());
                    let candidate_cost = self.cost(&candidate);
                    if candidate_cost < *cost {
                        *order = candidate;
                        *cost = candidate_cost;
                        return Ok(true);
                    }
                }
            }
        }
        Ok(false)
    }
}

/// Nearest neighbour by travel time from the start. Distance breaks ties,
/// then the earlier stop wins.
pub(super) fn nearest_neighbour(model: &ConstraintModel, matrix: &TravelMatrix) -> Vec<usize> {
    let mut unvisited: Vec<usize> = (0..model.len()).collect();
    let mut order = Vec::with_capacity(unvisited.len());
    let mut current = 0usize;

    while !unvisited.is_empty() {
        let mut best = 0;
        let mut best_key = (u64::MAX, u64::MAX);
        for (pos, &stop) in unvisited.iter().enumerate() {
            let key = (matrix.duration(current, stop + 1), matrix.distance(current, stop + 1));
            if key < best_key {
                best_key = key;
                best = pos;
            }
        }
        let next = unvisited.remove(best);
        order.push(next);
        current = next + 1;
    }

    order
}

pub(super) fn solve(
    model: &ConstraintModel,
    matrix: &TravelMatrix,
    config: &SolverConfig,
    started_at: Instant,
) -> Result<Solved, SolveError> {
    let search = Search {
        model,
        matrix,
        config,
        deadline: started_at + std::time::Duration::from_millis(config.timeout_ms),
    };
    search.check_deadline()?;

    if matrix.size() != model.len() + 1 {
        return Err(SolveError::Internal(format!(
            "matrix size {} does not match {} stops",
            matrix.size(),
            model.len()
        )));
    }

    let mut log = Vec::new();

    // construction candidates, first listed wins ties
    let candidates = [
        ("input", (0..model.len()).collect::<Vec<_>>()),
        ("nearest", nearest_neighbour(model, matrix)),
        ("timed", fallback_order(model, matrix)),
    ];
    let mut best: Option<(&str, Vec<usize>, i64)> = None;
    for (name, order) in candidates {
        let cost = search.cost(&order);
        log.push(format!("construct={} cost={}", name, cost));
        if best.as_ref().map_or(true, |(_, _, best_cost)| cost < *best_cost) {
            best = Some((name, order, cost));
        }
    }
    let Some((seed, mut order, mut cost)) = best else {
        return Err(SolveError::Internal("no construction candidate".to_string()));
    };
    debug!("Local search seeded from {} construction (cost {})", seed, cost);

    let mut moves = 0usize;
    for _ in 0..config.max_passes {
        search.check_deadline()?;
        let improved = search.two_opt(&mut order, &mut cost)? || search.or_opt(&mut order, &mut cost)?;
        if !improved {
            break;
        }
        moves += 1;
    }
    log.push(format!("seed={} improving_moves={} cost={}", seed, moves, cost));

    if !model.is_complete(&order) {
        return Err(SolveError::Internal("local search lost a stop".to_string()));
    }

    Ok(Solved { order, cost, log })
}
