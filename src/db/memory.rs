//! In-memory repository for development and tests

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use super::repository::{CallWrite, DayLease, PlanCommit, Repository};
use crate::config::SingleFlightPolicy;
use crate::error::StorageError;
use crate::services::single_flight::SingleFlight;
use crate::types::{
    CallProgress, CallState, CallStatus, Coordinates, CourierDay, OptimizedRoute, StartLocation, Stop,
};

#[derive(Default)]
struct State {
    stops: HashMap<CourierDay, Vec<Stop>>,
    starts: HashMap<CourierDay, StartLocation>,
    routes: HashMap<CourierDay, OptimizedRoute>,
    calls: HashMap<Uuid, CallStatus>,
    geocodes: HashMap<String, Coordinates>,
}

fn conflict(id: Uuid, what: &str) -> StorageError {
    StorageError::Conflict(format!("call status {}: {}", id, what))
}

fn apply_write(calls: &mut HashMap<Uuid, CallStatus>, write: &CallWrite) -> Result<(), StorageError> {
    match write {
        CallWrite::Create(status) => {
            // one status per (day, stop)
            let taken = calls
                .values()
                .any(|c| c.id == status.id || (c.day() == status.day() && c.stop_id == status.stop_id));
            if taken {
                return Err(conflict(status.id, "stop already has a call status"));
            }
            calls.insert(status.id, status.clone());
        }
        CallWrite::Reschedule {
            id,
            expected,
            schedule,
            reset,
            at,
        } => {
            let call = calls.get_mut(id).ok_or_else(|| conflict(*id, "no longer stored"))?;
            if call.schedule != *expected {
                return Err(conflict(*id, "schedule changed since it was read"));
            }
            call.schedule = *schedule;
            if let Some(progress) = reset {
                call.progress = progress.clone();
            }
            call.updated_at = *at;
        }
        CallWrite::Deactivate { id, at } => {
            if let Some(call) = calls.get_mut(id) {
                call.progress.state = CallState::Inactive;
                call.progress.next_attempt_time = None;
                call.updated_at = *at;
            }
        }
    }
    Ok(())
}

impl State {
    fn set_stop_coordinates(&mut self, day: CourierDay, stop_id: &str, coordinates: Coordinates) {
        if let Some(stop) = self
            .stops
            .get_mut(&day)
            .and_then(|stops| stops.iter_mut().find(|s| s.id == stop_id))
        {
            stop.coordinates = Some(coordinates);
        }
    }
}

/// Repository held entirely in process memory
#[derive(Default)]
pub struct InMemoryRepository {
    state: Mutex<State>,
    flights: SingleFlight,
    unavailable: AtomicBool,
    broken_days: Mutex<HashSet<CourierDay>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with `StorageError::Unavailable` until switched back
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make `load_stops` fail for `day` only
    pub fn break_day(&self, day: CourierDay) {
        self.broken_days.lock().insert(day);
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StorageError::Unavailable("in-memory store switched off".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn load_stops(&self, day: CourierDay) -> Result<Vec<Stop>, StorageError> {
        self.check()?;
        if self.broken_days.lock().contains(&day) {
            return Err(StorageError::Unavailable(format!("stops of {} unreadable", day)));
        }
        Ok(self.state.lock().stops.get(&day).cloned().unwrap_or_default())
    }

    async fn load_stop(&self, day: CourierDay, stop_id: &str) -> Result<Option<Stop>, StorageError> {
        self.check()?;
        Ok(self
            .state
            .lock()
            .stops
            .get(&day)
            .and_then(|stops| stops.iter().find(|s| s.id == stop_id).cloned()))
    }

    async fn save_stop(&self, day: CourierDay, stop: &Stop) -> Result<(), StorageError> {
        self.check()?;
        let mut state = self.state.lock();
        let stops = state.stops.entry(day).or_default();
        match stops.iter_mut().find(|s| s.id == stop.id) {
            Some(existing) => *existing = stop.clone(),
            None => stops.push(stop.clone()),
        }
        Ok(())
    }

    async fn save_stop_coordinates(
        &self,
        day: CourierDay,
        stop_id: &str,
        coordinates: Coordinates,
    ) -> Result<(), StorageError> {
        self.check()?;
        self.state.lock().set_stop_coordinates(day, stop_id, coordinates);
        Ok(())
    }

    async fn load_start_location(&self, day: CourierDay) -> Result<Option<StartLocation>, StorageError> {
        self.check()?;
        Ok(self.state.lock().starts.get(&day).cloned())
    }

    async fn save_start_location(&self, day: CourierDay, start: &StartLocation) -> Result<(), StorageError> {
        self.check()?;
        self.state.lock().starts.insert(day, start.clone());
        Ok(())
    }

    async fn load_route(&self, day: CourierDay) -> Result<Option<OptimizedRoute>, StorageError> {
        self.check()?;
        Ok(self.state.lock().routes.get(&day).cloned())
    }

    async fn save_route(&self, day: CourierDay, route: &OptimizedRoute) -> Result<(), StorageError> {
        self.check()?;
        self.state.lock().routes.insert(day, route.clone());
        Ok(())
    }

    async fn load_call_statuses(&self, day: CourierDay) -> Result<Vec<CallStatus>, StorageError> {
        self.check()?;
        let mut calls: Vec<CallStatus> = self
            .state
            .lock()
            .calls
            .values()
            .filter(|c| c.day() == day)
            .cloned()
            .collect();
        calls.sort_by(|a, b| a.schedule.call_time().cmp(&b.schedule.call_time()).then(a.stop_id.cmp(&b.stop_id)));
        Ok(calls)
    }

    async fn load_call_status(&self, id: Uuid) -> Result<Option<CallStatus>, StorageError> {
        self.check()?;
        Ok(self.state.lock().calls.get(&id).cloned())
    }

    async fn load_open_call_statuses(&self) -> Result<Vec<CallStatus>, StorageError> {
        self.check()?;
        let mut calls: Vec<CallStatus> = self
            .state
            .lock()
            .calls
            .values()
            .filter(|c| c.state().is_open())
            .cloned()
            .collect();
        calls.sort_by(|a, b| a.schedule.call_time().cmp(&b.schedule.call_time()).then(a.id.cmp(&b.id)));
        Ok(calls)
    }

    async fn apply_call_write(&self, write: &CallWrite) -> Result<(), StorageError> {
        self.check()?;
        apply_write(&mut self.state.lock().calls, write)
    }

    async fn update_call_progress(
        &self,
        prior: &CallStatus,
        progress: &CallProgress,
        at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        self.check()?;
        let mut state = self.state.lock();
        let Some(call) = state.calls.get_mut(&prior.id) else {
            return Ok(false);
        };
        let unchanged = call.progress.state == prior.progress.state
            && call.progress.attempts == prior.progress.attempts
            && call.schedule.call_time() == prior.schedule.call_time();
        if unchanged {
            call.progress = progress.clone();
            call.updated_at = at;
        }
        Ok(unchanged)
    }

    async fn lock_day(&self, day: CourierDay, policy: SingleFlightPolicy) -> Result<Option<DayLease>, StorageError> {
        self.check()?;
        Ok(self.flights.acquire(day, policy).await.map(DayLease::new))
    }

    async fn load_geocode(&self, key: &str) -> Result<Option<Coordinates>, StorageError> {
        self.check()?;
        Ok(self.state.lock().geocodes.get(key).copied())
    }

    async fn save_geocode(&self, key: &str, coordinates: Coordinates) -> Result<(), StorageError> {
        self.check()?;
        self.state.lock().geocodes.insert(key.to_string(), coordinates);
        Ok(())
    }

    async fn save_plan(&self, commit: &PlanCommit) -> Result<(), StorageError> {
        self.check()?;
        let mut state = self.state.lock();

        // all call writes land or none do
        let mut calls = state.calls.clone();
        for write in &commit.call_writes {
            apply_write(&mut calls, write)?;
        }
        state.calls = calls;

        if let Some(coords) = commit.geocoded_start {
            if let Some(start) = state.starts.get_mut(&commit.day) {
                start.coordinates = Some(coords);
            }
        }
        for (stop_id, coords) in &commit.geocoded_stops {
            state.set_stop_coordinates(commit.day, stop_id, *coords);
        }
        state.routes.insert(commit.day, commit.route.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CallSchedule, ScheduledTime};
    use chrono::{NaiveDate, TimeZone};

    fn day() -> CourierDay {
        CourierDay::new(Uuid::nil(), NaiveDate::from_ymd_opt(2026, 3, 2).unwrap())
    }

    fn status(stop_id: &str) -> CallStatus {
        let t = Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap();
        let schedule = CallSchedule {
            arrival: ScheduledTime::Derived(t),
            call: ScheduledTime::Derived(t),
        };
        CallStatus::new(day(), stop_id, schedule, t)
    }

    #[tokio::test]
    async fn test_stops_keep_input_order() {
        let repo = InMemoryRepository::new();
        for id in ["c", "a", "b"] {
            repo.save_stop(day(), &Stop::new(id, id)).await.unwrap();
        }
        let mut updated = Stop::new("a", "new address");
        updated.phone = Some("123".to_string());
        repo.save_stop(day(), &updated).await.unwrap();

        let stops = repo.load_stops(day()).await.unwrap();
        let ids: Vec<&str> = stops.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
        assert_eq!(stops[1].address, "new address");
    }

    fn create(status: &CallStatus) -> CallWrite {
        CallWrite::Create(status.clone())
    }

    #[tokio::test]
    async fn test_one_status_per_stop() {
        let repo = InMemoryRepository::new();
        let first = status("a");
        repo.apply_call_write(&create(&first)).await.unwrap();

        let second = repo.apply_call_write(&create(&status("a"))).await;

        assert!(matches!(second, Err(StorageError::Conflict(_))));
        let calls = repo.load_call_statuses(day()).await.unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, first.id);
    }

    #[tokio::test]
    async fn test_open_statuses_only() {
        let repo = InMemoryRepository::new();
        let open = status("a");
        let mut done = status("b");
        done.progress.state = CallState::Confirmed;
        repo.apply_call_write(&create(&open)).await.unwrap();
        repo.apply_call_write(&create(&done)).await.unwrap();

        let calls = repo.load_open_call_statuses().await.unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].stop_id, "a");
    }

    #[tokio::test]
    async fn test_reschedule_keeps_claimed_progress() {
        let repo = InMemoryRepository::new();
        let pending = status("a");
        repo.apply_call_write(&create(&pending)).await.unwrap();
        let now = pending.updated_at;

        let mut sent = pending.progress.clone();
        sent.state = CallState::Sent;
        sent.sent_at = Some(now);
        assert!(repo.update_call_progress(&pending, &sent, now).await.unwrap());

        let later = now + chrono::Duration::minutes(3);
        let moved = CallSchedule {
            arrival: ScheduledTime::Derived(later),
            call: ScheduledTime::Derived(later),
        };
        let write = CallWrite::Reschedule {
            id: pending.id,
            expected: pending.schedule,
            schedule: moved,
            reset: None,
            at: now,
        };
        repo.apply_call_write(&write).await.unwrap();

        let stored = repo.load_call_status(pending.id).await.unwrap().unwrap();
        assert_eq!(stored.state(), CallState::Sent);
        assert_eq!(stored.schedule, moved);

        // a second run that read the old schedule loses
        assert!(matches!(
            repo.apply_call_write(&write).await,
            Err(StorageError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_stale_progress_update_refused() {
        let repo = InMemoryRepository::new();
        let pending = status("a");
        repo.apply_call_write(&create(&pending)).await.unwrap();
        let now = pending.updated_at;

        let mut confirmed = pending.progress.clone();
        confirmed.state = CallState::Confirmed;
        assert!(repo.update_call_progress(&pending, &confirmed, now).await.unwrap());

        let mut sent = pending.progress.clone();
        sent.state = CallState::Sent;
        assert!(!repo.update_call_progress(&pending, &sent, now).await.unwrap());

        let stored = repo.load_call_status(pending.id).await.unwrap().unwrap();
        assert_eq!(stored.state(), CallState::Confirmed);
    }

    #[tokio::test]
    async fn test_deactivate_is_idempotent() {
        let repo = InMemoryRepository::new();
        let pending = status("a");
        repo.apply_call_write(&create(&pending)).await.unwrap();
        let write = CallWrite::Deactivate {
            id: pending.id,
            at: pending.updated_at,
        };

        repo.apply_call_write(&write).await.unwrap();
        repo.apply_call_write(&write).await.unwrap();

        let stored = repo.load_call_status(pending.id).await.unwrap().unwrap();
        assert_eq!(stored.state(), CallState::Inactive);
    }

    #[tokio::test]
    async fn test_unavailable_fails_everything() {
        let repo = InMemoryRepository::new();
        repo.set_unavailable(true);
        assert!(matches!(repo.load_stops(day()).await, Err(StorageError::Unavailable(_))));
        assert!(repo.apply_call_write(&create(&status("a"))).await.is_err());
        assert!(repo.lock_day(day(), SingleFlightPolicy::Reject).await.is_err());

        repo.set_unavailable(false);
        assert!(repo.load_stops(day()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_day_lease_excludes_second_run() {
        let repo = InMemoryRepository::new();
        let lease = repo.lock_day(day(), SingleFlightPolicy::Reject).await.unwrap();
        assert!(lease.is_some());

        assert!(repo.lock_day(day(), SingleFlightPolicy::Reject).await.unwrap().is_none());

        drop(lease);
        assert!(repo.lock_day(day(), SingleFlightPolicy::Reject).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_save_plan_writes_back_coordinates() {
        let repo = InMemoryRepository::new();
        repo.save_stop(day(), &Stop::new("a", "A st")).await.unwrap();
        let start_time = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        let commit = PlanCommit {
            day: day(),
            route: OptimizedRoute::empty(start_time),
            call_writes: vec![create(&status("a"))],
            geocoded_stops: vec![("a".to_string(), Coordinates { lat: 50.0, lng: 14.0 })],
            geocoded_start: None,
        };

        repo.save_plan(&commit).await.unwrap();

        let stop = repo.load_stop(day(), "a").await.unwrap().unwrap();
        assert_eq!(stop.coordinates, Some(Coordinates { lat: 50.0, lng: 14.0 }));
        assert!(repo.load_route(day()).await.unwrap().is_some());
        assert_eq!(repo.load_call_statuses(day()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_conflicting_plan_persists_nothing() {
        let repo = InMemoryRepository::new();
        repo.save_stop(day(), &Stop::new("a", "A st")).await.unwrap();
        let existing = status("a");
        repo.apply_call_write(&create(&existing)).await.unwrap();
        let start_time = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        let commit = PlanCommit {
            day: day(),
            route: OptimizedRoute::empty(start_time),
            call_writes: vec![
                CallWrite::Deactivate {
                    id: existing.id,
                    at: start_time,
                },
                create(&status("a")),
            ],
            geocoded_stops: vec![("a".to_string(), Coordinates { lat: 50.0, lng: 14.0 })],
            geocoded_start: None,
        };

        assert!(matches!(repo.save_plan(&commit).await, Err(StorageError::Conflict(_))));

        assert!(repo.load_route(day()).await.unwrap().is_none());
        assert!(repo.load_stop(day(), "a").await.unwrap().unwrap().coordinates.is_none());
        let stored = repo.load_call_status(existing.id).await.unwrap().unwrap();
        assert_eq!(stored.state(), CallState::Pending);
    }
}
