//! Deterministic fallback ordering
//!
//! Timed stops first, by pin time or window start (input order on ties),
//! then the unconstrained stops by nearest neighbour from wherever the timed
//! part ends.

use crate::services::constraints::ConstraintModel;
use crate::services::matrix::TravelMatrix;

pub fn fallback_order(model: &ConstraintModel, matrix: &TravelMatrix) -> Vec<usize> {
    let mut timed: Vec<(i64, usize)> = Vec::new();
    let mut free: Vec<usize> = Vec::new();

    for (i, stop) in model.stops.iter().enumerate() {
        match stop.window.anchor() {
            Some(anchor) => timed.push((anchor, i)),
            None => free.push(i),
        }
    }

    // stable: equal anchors keep input order
    timed.sort_by_key(|&(anchor, _)| anchor);

    let mut order: Vec<usize> = timed.into_iter().map(|(_, i)| i).collect();
    let mut current = order.last().map_or(0, |&s| s + 1);

    while !free.is_empty() {
        let mut best = 0;
        let mut best_distance = u64::MAX;
        for (pos, &stop) in free.iter().enumerate() {
            let distance = matrix.distance(current, stop + 1);
            if distance < best_distance {
                best_distance = distance;
                best = pos;
            }
        }
        let next = free.remove(best);
        order.push(next);
        current = next + 1;
    }

    order
}
