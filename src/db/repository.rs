//! Storage contract used by the planner, the call scheduler and operator actions
//!
//! Call statuses are never written back whole. Optimization runs and pin
//! actions own the schedule columns, the scheduler and operator actions own
//! the progress columns, and every write is guarded on what its writer read.

use std::any::Any;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::SingleFlightPolicy;
use crate::error::StorageError;
use crate::types::{
    CallProgress, CallSchedule, CallStatus, Coordinates, CourierDay, OptimizedRoute, StartLocation, Stop,
};

/// A schedule-side change to one call status
#[derive(Debug, Clone, PartialEq)]
pub enum CallWrite {
    /// First status for a stop; fails if the stop already has one
    Create(CallStatus),
    /// New schedule, applied only while the stored schedule still equals
    /// `expected`. `reset` also starts the workflow over.
    Reschedule {
        id: Uuid,
        expected: CallSchedule,
        schedule: CallSchedule,
        reset: Option<CallProgress>,
        at: DateTime<Utc>,
    },
    /// Retire the call; the same result from any state
    Deactivate { id: Uuid, at: DateTime<Utc> },
}

impl CallWrite {
    pub fn id(&self) -> Uuid {
        match self {
            CallWrite::Create(status) => status.id,
            CallWrite::Reschedule { id, .. } | CallWrite::Deactivate { id, .. } => *id,
        }
    }
}

/// Everything one optimization run persists
#[derive(Debug, Clone)]
pub struct PlanCommit {
    pub day: CourierDay,
    pub route: OptimizedRoute,
    /// Schedule changes for new, moved and dropped stops
    pub call_writes: Vec<CallWrite>,
    /// Coordinates resolved by geocoding during the run
    pub geocoded_stops: Vec<(String, Coordinates)>,
    pub geocoded_start: Option<Coordinates>,
}

/// Holds a courier day for one optimization run; released on drop
pub struct DayLease {
    _held: Box<dyn Any + Send>,
}

impl DayLease {
    pub fn new(held: impl Any + Send) -> Self {
        Self { _held: Box::new(held) }
    }
}

impl std::fmt::Debug for DayLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DayLease")
    }
}

/// Lowercased, trimmed, single-spaced address used as the geocode cache key
pub fn geocode_key(address: &str) -> String {
    address
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[async_trait]
pub trait Repository: Send + Sync {
    /// Stops of the day in input order
    async fn load_stops(&self, day: CourierDay) -> Result<Vec<Stop>, StorageError>;

    async fn load_stop(&self, day: CourierDay, stop_id: &str) -> Result<Option<Stop>, StorageError>;

    /// Insert or replace; new stops go to the end of the input order
    async fn save_stop(&self, day: CourierDay, stop: &Stop) -> Result<(), StorageError>;

    async fn save_stop_coordinates(
        &self,
        day: CourierDay,
        stop_id: &str,
        coordinates: Coordinates,
    ) -> Result<(), StorageError>;

    async fn load_start_location(&self, day: CourierDay) -> Result<Option<StartLocation>, StorageError>;

    async fn save_start_location(&self, day: CourierDay, start: &StartLocation) -> Result<(), StorageError>;

    async fn load_route(&self, day: CourierDay) -> Result<Option<OptimizedRoute>, StorageError>;

    /// Replaces the previous route of the day
    async fn save_route(&self, day: CourierDay, route: &OptimizedRoute) -> Result<(), StorageError>;

    async fn load_call_statuses(&self, day: CourierDay) -> Result<Vec<CallStatus>, StorageError>;

    async fn load_call_status(&self, id: Uuid) -> Result<Option<CallStatus>, StorageError>;

    /// Pending and sent statuses across all couriers and days
    async fn load_open_call_statuses(&self) -> Result<Vec<CallStatus>, StorageError>;

    /// Apply one schedule-side write. A failed guard is `StorageError::Conflict`.
    async fn apply_call_write(&self, write: &CallWrite) -> Result<(), StorageError>;

    /// Replace the progress of `prior` if its state, attempt count and call
    /// time are still the stored ones. `false` when the record moved on.
    async fn update_call_progress(
        &self,
        prior: &CallStatus,
        progress: &CallProgress,
        at: DateTime<Utc>,
    ) -> Result<bool, StorageError>;

    /// Claim `day` for an optimization run. `None` when another run holds it
    /// and `policy` is reject; with wait this queues until it is free.
    async fn lock_day(&self, day: CourierDay, policy: SingleFlightPolicy) -> Result<Option<DayLease>, StorageError>;

    /// Coordinates cached for a `geocode_key`
    async fn load_geocode(&self, key: &str) -> Result<Option<Coordinates>, StorageError>;

    async fn save_geocode(&self, key: &str, coordinates: Coordinates) -> Result<(), StorageError>;

    /// Persist an optimization run: geocoded coordinates, then the route,
    /// then call status writes. Implementations with transactions make this
    /// atomic and roll everything back on a conflict.
    async fn save_plan(&self, commit: &PlanCommit) -> Result<(), StorageError> {
        if let Some(coords) = commit.geocoded_start {
            if let Some(mut start) = self.load_start_location(commit.day).await? {
                start.coordinates = Some(coords);
                self.save_start_location(commit.day, &start).await?;
            }
        }
        for (stop_id, coords) in &commit.geocoded_stops {
            self.save_stop_coordinates(commit.day, stop_id, *coords).await?;
        }
        self.save_route(commit.day, &commit.route).await?;
        for write in &commit.call_writes {
            self.apply_call_write(write).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geocode_key_normalizes() {
        assert_eq!(geocode_key("  Main St   12 "), "main st 12");
        assert_eq!(geocode_key("MAIN st 12"), geocode_key("main  ST 12"));
    }
}
