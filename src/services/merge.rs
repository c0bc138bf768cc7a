//! Re-optimization merge of call statuses
//!
//! Reconciles the statuses already stored for a courier day with a freshly
//! assembled route. Workflow progress survives while the call time stays
//! within tolerance; a moved call time starts the workflow over. Statuses of
//! stops that left the route go inactive.
//!
//! The result carries the storage writes as well. They touch schedule
//! columns only, plus progress on a rearm, so a reminder the scheduler
//! sends while the run is in flight keeps its new state.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::config::PlanningConfig;
use crate::db::CallWrite;
use crate::services::call_schedule::derive_schedule;
use crate::services::call_state::{apply, CallEvent, RetryPolicy};
use crate::types::{CallProgress, CallSchedule, CallState, CallStatus, CourierDay, OptimizedRoute, Stop};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub created: usize,
    pub carried: usize,
    pub rearmed: usize,
    pub deactivated: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MergeResult {
    /// Statuses that are new or changed; unchanged ones are left out
    pub changed: Vec<CallStatus>,
    /// One storage write per entry of `changed`
    pub writes: Vec<CallWrite>,
    pub summary: MergeSummary,
}

pub fn merge_call_statuses(
    day: CourierDay,
    route: &OptimizedRoute,
    stops: &[Stop],
    existing: &[CallStatus],
    config: &PlanningConfig,
    now: DateTime<Utc>,
) -> MergeResult {
    let policy = RetryPolicy::from_planning(config);
    let stops_by_id: HashMap<&str, &Stop> = stops.iter().map(|s| (s.id.as_str(), s)).collect();
    let existing_by_stop: HashMap<&str, &CallStatus> =
        existing.iter().map(|c| (c.stop_id.as_str(), c)).collect();

    let mut result = MergeResult::default();

    for point in &route.points {
        let Some(stop) = stops_by_id.get(point.stop_id.as_str()) else {
            continue;
        };
        let previous = existing_by_stop.get(point.stop_id.as_str()).copied();
        let schedule = derive_schedule(point, stop, previous.map(|p| &p.schedule), config.lead_time());

        let Some(previous) = previous else {
            let created = CallStatus::new(day, stop.id.clone(), schedule, now);
            result.writes.push(CallWrite::Create(created.clone()));
            result.changed.push(created);
            result.summary.created += 1;
            continue;
        };

        let (updated, rearmed) = reschedule(previous, schedule, config, now);
        if rearmed {
            result.summary.rearmed += 1;
        } else {
            result.summary.carried += 1;
        }
        if let Some(updated) = updated {
            result.writes.push(schedule_write(previous, &updated, rearmed));
            result.changed.push(updated);
        }
    }

    for status in existing {
        if status.state() != CallState::Inactive && route.point(&status.stop_id).is_none() {
            if let Ok(progress) = apply(&status.progress, CallEvent::Deactivated, now, &policy) {
                result.writes.push(CallWrite::Deactivate { id: status.id, at: now });
                result.changed.push(CallStatus {
                    progress,
                    updated_at: now,
                    ..status.clone()
                });
                result.summary.deactivated += 1;
            }
        }
    }

    debug!(
        "Merged call statuses for {}: {:?} ({} changed)",
        day,
        result.summary,
        result.changed.len()
    );
    result
}

/// Give `previous` a new schedule. Progress is kept while the call time
/// stays within tolerance and the status is active; otherwise the workflow
/// starts over. Returns `None` when nothing changed, plus whether it rearmed.
pub fn reschedule(
    previous: &CallStatus,
    schedule: CallSchedule,
    config: &PlanningConfig,
    now: DateTime<Utc>,
) -> (Option<CallStatus>, bool) {
    let drift = (schedule.call_time() - previous.schedule.call_time()).abs();
    let rearm = previous.state() == CallState::Inactive || drift > config.call_time_tolerance();

    let progress = if rearm {
        apply(&previous.progress, CallEvent::Rearmed, now, &RetryPolicy::from_planning(config))
            .unwrap_or_else(|_| CallProgress::fresh())
    } else {
        previous.progress.clone()
    };

    if schedule == previous.schedule && progress == previous.progress {
        return (None, rearm);
    }

    let updated = CallStatus {
        schedule,
        progress,
        updated_at: now,
        ..previous.clone()
    };
    (Some(updated), rearm)
}

/// Storage write taking `previous` to `updated`, guarded on the schedule
/// `previous` was read with
pub fn schedule_write(previous: &CallStatus, updated: &CallStatus, rearmed: bool) -> CallWrite {
    CallWrite::Reschedule {
        id: previous.id,
        expected: previous.schedule,
        schedule: updated.schedule,
        reset: rearmed.then(|| updated.progress.clone()),
        at: updated.updated_at,
    }
}
