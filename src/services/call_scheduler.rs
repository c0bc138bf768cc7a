//! Background call scheduler
//!
//! Polls open call statuses across all couriers. Due reminders are handed to
//! the notifier, unanswered ones are retried with backoff until the attempt
//! cap, and statuses of delivered stops are retired.
//!
//! Only progress is written, each time compared against the status as it
//! was loaded. A reminder is claimed as sent before the notifier runs, so a
//! status that moved on in the meantime is skipped rather than overwritten.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::db::{CallWrite, Repository};
use crate::error::StorageError;
use crate::services::call_state::{apply, response_overdue, CallEvent, RetryPolicy};
use crate::services::notifier::{build_notification, Notifier};
use crate::types::{CallStatus, CourierDay, Stop};

/// What one scheduler pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub dispatched: usize,
    pub dispatch_failed: usize,
    pub timed_out: usize,
    pub deactivated: usize,
    /// Statuses changed by someone else since the pass loaded them
    pub stale: usize,
    pub save_errors: usize,
    /// Courier days skipped because their stops failed to load
    pub day_errors: usize,
}

impl TickReport {
    fn is_idle(&self) -> bool {
        *self == TickReport::default()
    }
}

pub struct CallScheduler {
    repo: Arc<dyn Repository>,
    notifier: Arc<dyn Notifier>,
    policy: RetryPolicy,
    interval: Duration,
}

impl CallScheduler {
    pub fn new(repo: Arc<dyn Repository>, notifier: Arc<dyn Notifier>, policy: RetryPolicy, interval: Duration) -> Self {
        Self {
            repo,
            notifier,
            policy,
            interval,
        }
    }

    /// Run one pass at `now`
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, StorageError> {
        let open = self.repo.load_open_call_statuses().await?;
        let mut report = TickReport::default();
        let mut stops_by_day: HashMap<CourierDay, Option<HashMap<String, Stop>>> = HashMap::new();

        for status in open {
            let day = status.day();
            if !stops_by_day.contains_key(&day) {
                let stops = match self.repo.load_stops(day).await {
                    Ok(stops) => Some(stops.into_iter().map(|s| (s.id.clone(), s)).collect()),
                    Err(e) => {
                        error!("Skipping calls of {}: stops failed to load: {}", day, e);
                        report.day_errors += 1;
                        None
                    }
                };
                stops_by_day.insert(day, stops);
            }
            let Some(stops) = stops_by_day.get(&day).and_then(Option::as_ref) else {
                continue;
            };

            let result = match stops.get(&status.stop_id) {
                Some(stop) if stop.is_active() => {
                    if response_overdue(&status.progress, now, &self.policy) {
                        self.time_out(&status, now, &mut report).await
                    } else if status.is_due(now) {
                        self.dispatch(&status, stop, now, &mut report).await
                    } else {
                        continue;
                    }
                }
                _ => self.deactivate(&status, now, &mut report).await,
            };

            if let Err(e) = result {
                error!("Failed to update call status {}: {}", status.id, e);
                report.save_errors += 1;
            }
        }

        Ok(report)
    }

    async fn dispatch(
        &self,
        status: &CallStatus,
        stop: &Stop,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), StorageError> {
        let Some(claimed) = self.advance(status, CallEvent::Dispatched, now).await? else {
            report.stale += 1;
            return Ok(());
        };

        let notification = build_notification(status, stop);
        debug!("Call {} for stop {} is due (attempt {})", status.id, status.stop_id, notification.attempt);
        if self.notifier.send_call_reminder(&notification).await {
            report.dispatched += 1;
            return Ok(());
        }

        report.dispatch_failed += 1;
        // the attempt is charged to the pending progress the claim came from
        let failed = match apply(&status.progress, CallEvent::DispatchFailed, now, &self.policy) {
            Ok(progress) => progress,
            Err(e) => {
                warn!("Skipping call {}: {}", status.id, e);
                return Ok(());
            }
        };
        if !self.repo.update_call_progress(&claimed, &failed, now).await? {
            debug!("Call {} changed while its reminder was being sent", status.id);
            report.stale += 1;
        }
        Ok(())
    }

    async fn time_out(&self, status: &CallStatus, now: DateTime<Utc>, report: &mut TickReport) -> Result<(), StorageError> {
        match self.advance(status, CallEvent::ResponseTimedOut, now).await? {
            Some(_) => report.timed_out += 1,
            None => report.stale += 1,
        }
        Ok(())
    }

    async fn deactivate(&self, status: &CallStatus, now: DateTime<Utc>, report: &mut TickReport) -> Result<(), StorageError> {
        self.repo
            .apply_call_write(&CallWrite::Deactivate { id: status.id, at: now })
            .await?;
        report.deactivated += 1;
        Ok(())
    }

    /// Apply `event` if `status` is still what storage holds; the stored
    /// result, or `None` when it was not applied
    async fn advance(
        &self,
        status: &CallStatus,
        event: CallEvent,
        now: DateTime<Utc>,
    ) -> Result<Option<CallStatus>, StorageError> {
        let progress = match apply(&status.progress, event, now, &self.policy) {
            Ok(progress) => progress,
            Err(e) => {
                warn!("Skipping call {}: {}", status.id, e);
                return Ok(None);
            }
        };
        if !self.repo.update_call_progress(status, &progress, now).await? {
            debug!("Call {} changed since this pass loaded it", status.id);
            return Ok(None);
        }
        Ok(Some(CallStatus {
            progress,
            updated_at: now,
            ..status.clone()
        }))
    }

    /// Tick every interval until `shutdown` fires; a pass in progress is finished first
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("Call scheduler started (every {:?})", self.interval);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    match self.tick(Utc::now()).await {
                        Ok(report) if report.is_idle() => {}
                        Ok(report) => info!("Call scheduler pass: {:?}", report),
                        Err(e) => error!("Call scheduler pass failed: {}", e),
                    }
                }
            }
        }

        info!("Call scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PlanningConfig, SingleFlightPolicy};
    use crate::db::InMemoryRepository;
    use crate::services::call_actions::CallService;
    use crate::services::maps::testing::ScriptedMaps;
    use crate::services::notifier::testing::RecordingNotifier;
    use crate::services::planner::RoutePlanner;
    use crate::types::{
        CallNotification, CallSchedule, CallState, Coordinates, DeliveryStatus, ScheduledTime, StartLocation,
    };
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, NaiveDate, TimeZone};
    use uuid::Uuid;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, h, m, 0).unwrap()
    }

    fn day() -> CourierDay {
        CourierDay::new(Uuid::nil(), NaiveDate::from_ymd_opt(2026, 3, 2).unwrap())
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            retry_interval: ChronoDuration::minutes(10),
            max_attempts: 3,
        }
    }

    async fn setup(notifier: RecordingNotifier) -> (Arc<InMemoryRepository>, Arc<RecordingNotifier>, CallScheduler, CallStatus) {
        let repo = Arc::new(InMemoryRepository::new());
        let notifier = Arc::new(notifier);
        let mut stop = Stop::new("a", "A st");
        stop.phone = Some("555".to_string());
        repo.save_stop(day(), &stop).await.unwrap();
        let schedule = CallSchedule {
            arrival: ScheduledTime::Derived(at(11, 0)),
            call: ScheduledTime::Derived(at(10, 20)),
        };
        let status = CallStatus::new(day(), "a", schedule, at(9, 0));
        repo.apply_call_write(&CallWrite::Create(status.clone())).await.unwrap();
        let scheduler = CallScheduler::new(repo.clone(), notifier.clone(), policy(), Duration::from_millis(10));
        (repo, notifier, scheduler, status)
    }

    #[tokio::test]
    async fn test_not_due_yet() {
        let (_, notifier, scheduler, _) = setup(RecordingNotifier::new()).await;

        let report = scheduler.tick(at(10, 19)).await.unwrap();

        assert_eq!(report, TickReport::default());
        assert_eq!(notifier.count(), 0);
    }

    #[tokio::test]
    async fn test_due_call_is_sent() {
        let (repo, notifier, scheduler, status) = setup(RecordingNotifier::new()).await;

        let report = scheduler.tick(at(10, 20)).await.unwrap();

        assert_eq!(report.dispatched, 1);
        assert_eq!(notifier.count(), 1);
        assert_eq!(notifier.sent.lock()[0].phone.as_deref(), Some("555"));
        let saved = repo.load_call_status(status.id).await.unwrap().unwrap();
        assert_eq!(saved.state(), CallState::Sent);
        assert_eq!(saved.progress.sent_at, Some(at(10, 20)));
    }

    #[tokio::test]
    async fn test_unanswered_call_is_retried() {
        let (repo, notifier, scheduler, status) = setup(RecordingNotifier::new()).await;
        scheduler.tick(at(10, 20)).await.unwrap();

        // still inside the retry window
        scheduler.tick(at(10, 25)).await.unwrap();
        let saved = repo.load_call_status(status.id).await.unwrap().unwrap();
        assert_eq!(saved.state(), CallState::Sent);

        let report = scheduler.tick(at(10, 30)).await.unwrap();
        assert_eq!(report.timed_out, 1);
        let saved = repo.load_call_status(status.id).await.unwrap().unwrap();
        assert_eq!(saved.state(), CallState::Pending);
        assert_eq!(saved.progress.attempts, 1);
        assert_eq!(saved.progress.next_attempt_time, Some(at(10, 40)));

        // backoff holds the retry until 10:40
        scheduler.tick(at(10, 35)).await.unwrap();
        assert_eq!(notifier.count(), 1);
        scheduler.tick(at(10, 40)).await.unwrap();
        assert_eq!(notifier.count(), 2);
        assert!(notifier.sent.lock()[1].is_retry);
    }

    #[tokio::test]
    async fn test_attempts_stop_at_cap() {
        let (repo, notifier, scheduler, status) = setup(RecordingNotifier::new()).await;

        let mut now = at(10, 20);
        for _ in 0..10 {
            scheduler.tick(now).await.unwrap();
            now = now + ChronoDuration::minutes(10);
        }

        let saved = repo.load_call_status(status.id).await.unwrap().unwrap();
        assert_eq!(saved.state(), CallState::Failed);
        assert_eq!(saved.progress.attempts, 3);
        assert_eq!(notifier.count(), 3);
        assert!(repo.load_open_call_statuses().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_dispatch_counts_attempt() {
        let (repo, _, scheduler, status) = setup(RecordingNotifier::failing()).await;

        let report = scheduler.tick(at(10, 20)).await.unwrap();

        assert_eq!(report.dispatch_failed, 1);
        let saved = repo.load_call_status(status.id).await.unwrap().unwrap();
        assert_eq!(saved.state(), CallState::Pending);
        assert_eq!(saved.progress.attempts, 1);
        assert_eq!(saved.progress.next_attempt_time, Some(at(10, 30)));
    }

    #[tokio::test]
    async fn test_delivered_stop_goes_inactive() {
        let (repo, notifier, scheduler, status) = setup(RecordingNotifier::new()).await;
        let mut stop = repo.load_stop(day(), "a").await.unwrap().unwrap();
        stop.status = DeliveryStatus::Delivered;
        repo.save_stop(day(), &stop).await.unwrap();

        let report = scheduler.tick(at(10, 20)).await.unwrap();

        assert_eq!(report.deactivated, 1);
        assert_eq!(notifier.count(), 0);
        let saved = repo.load_call_status(status.id).await.unwrap().unwrap();
        assert_eq!(saved.state(), CallState::Inactive);
    }

    /// The stop moves and the day is planned again while the reminder is out
    struct ReplanningNotifier {
        repo: Arc<InMemoryRepository>,
        planner: RoutePlanner,
    }

    #[async_trait]
    impl Notifier for ReplanningNotifier {
        async fn send_call_reminder(&self, notification: &CallNotification) -> bool {
            let mut stop = self.repo.load_stop(day(), &notification.stop_id).await.unwrap().unwrap();
            stop.coordinates = Some(Coordinates { lat: 50.0, lng: 14.05 });
            self.repo.save_stop(day(), &stop).await.unwrap();
            self.planner.optimize(day()).await.unwrap();
            true
        }
    }

    #[tokio::test]
    async fn test_replan_during_send_keeps_new_schedule() {
        let repo = Arc::new(InMemoryRepository::new());
        let depot = Coordinates { lat: 50.0, lng: 14.0 };
        repo.save_start_location(day(), &StartLocation::at(depot, at(9, 0))).await.unwrap();
        repo.save_stop(day(), &Stop::new("a", "A st").with_coordinates(50.0, 14.01))
            .await
            .unwrap();
        let planner = || {
            RoutePlanner::new(
                repo.clone(),
                Arc::new(ScriptedMaps::new()),
                PlanningConfig::default(),
                SingleFlightPolicy::Reject,
            )
        };
        let first = planner().optimize(day()).await.unwrap();
        let call_time = first.call_statuses[0].schedule.call_time();
        let notifier = Arc::new(ReplanningNotifier {
            repo: repo.clone(),
            planner: planner(),
        });
        let scheduler = CallScheduler::new(repo.clone(), notifier, policy(), Duration::from_millis(10));

        let report = scheduler.tick(call_time).await.unwrap();

        assert_eq!(report.dispatched, 1);
        let route = repo.load_route(day()).await.unwrap().unwrap();
        let arrival = route.point("a").unwrap().arrival_time;
        let stored = repo.load_call_statuses(day()).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].schedule.arrival_time(), arrival);
        assert_eq!(stored[0].schedule.call_time(), arrival - ChronoDuration::minutes(40));
        assert_ne!(stored[0].schedule.call_time(), call_time);
    }

    /// An operator confirms the call while a failing send is in flight
    struct ConfirmingNotifier {
        service: CallService,
    }

    #[async_trait]
    impl Notifier for ConfirmingNotifier {
        async fn send_call_reminder(&self, notification: &CallNotification) -> bool {
            self.service
                .confirm(notification.call_status_id, Some("called back".to_string()), at(10, 21))
                .await
                .unwrap();
            false
        }
    }

    #[tokio::test]
    async fn test_failed_send_does_not_undo_confirmation() {
        let (repo, _, _, status) = setup(RecordingNotifier::new()).await;
        let notifier = Arc::new(ConfirmingNotifier {
            service: CallService::new(repo.clone(), PlanningConfig::default()),
        });
        let scheduler = CallScheduler::new(repo.clone(), notifier, policy(), Duration::from_millis(10));

        let report = scheduler.tick(at(10, 20)).await.unwrap();

        assert_eq!(report.dispatch_failed, 1);
        assert_eq!(report.stale, 1);
        let saved = repo.load_call_status(status.id).await.unwrap().unwrap();
        assert_eq!(saved.state(), CallState::Confirmed);
        assert_eq!(saved.progress.comment.as_deref(), Some("called back"));
        assert_eq!(saved.progress.attempts, 0);
    }

    #[tokio::test]
    async fn test_unreadable_day_skipped() {
        let (repo, notifier, scheduler, status) = setup(RecordingNotifier::new()).await;
        let other = CourierDay::new(Uuid::from_u128(7), day().date);
        repo.save_stop(other, &Stop::new("b", "B st")).await.unwrap();
        let stuck = CallStatus::new(other, "b", status.schedule, at(9, 0));
        repo.apply_call_write(&CallWrite::Create(stuck.clone())).await.unwrap();
        repo.break_day(other);

        let report = scheduler.tick(at(10, 20)).await.unwrap();

        assert_eq!(report.day_errors, 1);
        assert_eq!(report.dispatched, 1);
        assert_eq!(notifier.count(), 1);
        let saved = repo.load_call_status(status.id).await.unwrap().unwrap();
        assert_eq!(saved.state(), CallState::Sent);
        let skipped = repo.load_call_status(stuck.id).await.unwrap().unwrap();
        assert_eq!(skipped.state(), CallState::Pending);
    }

    #[tokio::test]
    async fn test_storage_outage_reported() {
        let (repo, _, scheduler, _) = setup(RecordingNotifier::new()).await;
        repo.set_unavailable(true);

        assert!(scheduler.tick(at(10, 20)).await.is_err());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (repo, _, scheduler, status) = setup(RecordingNotifier::new()).await;
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(Arc::new(scheduler).run(shutdown.clone()));

        // real clock is far past the call time
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();

        let saved = repo.load_call_status(status.id).await.unwrap().unwrap();
        assert_ne!(saved.state(), CallState::Pending);
    }
}
