//! Route assembly: turns a visiting order into timed route points

use chrono::Duration;

use crate::services::constraints::ConstraintModel;
use crate::services::matrix::TravelMatrix;
use crate::types::{OptimizedRoute, RoutePoint, Stop, WindowCheck, WindowViolation};

/// Assembled route plus the stops that miss their window
#[derive(Debug, Clone)]
pub struct AssembledRoute {
    pub route: OptimizedRoute,
    pub violations: Vec<WindowViolation>,
}

fn lateness_minutes(seconds: i64) -> i64 {
    // any lateness reports at least one minute
    (seconds + 59) / 60
}

/// `stops` must be the list the model was built from
pub fn assemble(
    model: &ConstraintModel,
    matrix: &TravelMatrix,
    stops: &[Stop],
    order: &[usize],
) -> AssembledRoute {
    let start = model.start;
    let visits = model.simulate(order, matrix);

    let mut points = Vec::with_capacity(visits.len());
    let mut violations = Vec::new();
    let mut total_distance_meters = 0u64;

    for (position, visit) in visits.iter().enumerate() {
        let stop = &stops[visit.stop];
        let late_minutes = lateness_minutes(visit.lateness);
        total_distance_meters += visit.travel_meters;

        if visit.lateness > 0 {
            violations.push(WindowViolation {
                stop_id: stop.id.clone(),
                lateness_minutes: late_minutes,
                pinned: model.stops[visit.stop].window.is_pinned(),
            });
        }

        points.push(RoutePoint {
            order: position as u32 + 1,
            stop_id: stop.id.clone(),
            address: stop.address.clone(),
            arrival_time: start + Duration::seconds(visit.arrival),
            departure_time: start + Duration::seconds(visit.departure),
            distance_from_previous_meters: visit.travel_meters,
            duration_from_previous_seconds: visit.travel_seconds as u64,
            window_check: WindowCheck {
                within_window: visit.lateness == 0,
                lateness_minutes: late_minutes,
            },
        });
    }

    let finish = visits.last().map_or(0, |v| v.departure);

    AssembledRoute {
        route: OptimizedRoute {
            points,
            start_time: start,
            total_distance_meters,
            total_duration_seconds: finish.max(0) as u64,
            estimated_completion: start + Duration::seconds(finish),
        },
        violations,
    }
}
