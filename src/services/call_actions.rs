//! Operator actions on calls and stops
//!
//! The only code paths allowed to write manual pins. Every action loads the
//! current record and writes one change guarded on what it loaded, reloading
//! and trying again when a concurrent writer got there first.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::PlanningConfig;
use crate::db::{CallWrite, Repository};
use crate::error::{CallActionError, StorageError};
use crate::services::call_state::{apply, CallEvent, RetryPolicy};
use crate::services::merge::{reschedule, schedule_write};
use crate::types::{CallSchedule, CallStatus, CourierDay, DeliveryStatus, ScheduledTime, Stop, StopPins};

/// Guarded writes tried per action before giving up
const WRITE_ATTEMPTS: usize = 3;

pub struct CallService {
    repo: Arc<dyn Repository>,
    config: PlanningConfig,
}

impl CallService {
    pub fn new(repo: Arc<dyn Repository>, config: PlanningConfig) -> Self {
        Self { repo, config }
    }

    pub async fn list(&self, day: CourierDay) -> Result<Vec<CallStatus>, CallActionError> {
        let mut statuses = self.repo.load_call_statuses(day).await?;
        statuses.sort_by_key(|s| s.schedule.call_time());
        Ok(statuses)
    }

    /// Customer agreed to the delivery
    pub async fn confirm(
        &self,
        id: Uuid,
        comment: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<CallStatus, CallActionError> {
        self.transition(id, CallEvent::Confirmed { comment }, now).await
    }

    /// Customer declined; no further reminders for this call time
    pub async fn reject(
        &self,
        id: Uuid,
        comment: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<CallStatus, CallActionError> {
        self.transition(id, CallEvent::Rejected { comment }, now).await
    }

    async fn transition(&self, id: Uuid, event: CallEvent, now: DateTime<Utc>) -> Result<CallStatus, CallActionError> {
        let policy = RetryPolicy::from_planning(&self.config);
        for _ in 0..WRITE_ATTEMPTS {
            let status = self
                .repo
                .load_call_status(id)
                .await?
                .ok_or(CallActionError::CallNotFound(id))?;

            let progress = apply(&status.progress, event.clone(), now, &policy)?;
            if !self.repo.update_call_progress(&status, &progress, now).await? {
                debug!("Call {} changed underneath, reloading", id);
                continue;
            }

            let updated = CallStatus {
                progress,
                updated_at: now,
                ..status
            };
            info!("Call {} for stop {} is now {}", updated.id, updated.stop_id, updated.state());
            return Ok(updated);
        }
        Err(CallActionError::ConcurrentUpdate(id))
    }

    /// Fix the arrival time of a stop. A derived call time follows it.
    pub async fn pin_arrival_time(
        &self,
        day: CourierDay,
        stop_id: &str,
        arrival: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Stop, CallActionError> {
        let lead = self.config.lead_time();
        self.update_pins(
            day,
            stop_id,
            |pins| pins.arrival = Some(arrival),
            |schedule| CallSchedule {
                arrival: ScheduledTime::Manual(arrival),
                call: if schedule.is_manual_call() {
                    schedule.call
                } else {
                    ScheduledTime::Derived(arrival - lead)
                },
            },
            now,
        )
        .await
    }

    /// Fix the call time of a stop
    pub async fn pin_call_time(
        &self,
        day: CourierDay,
        stop_id: &str,
        call: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Stop, CallActionError> {
        self.update_pins(
            day,
            stop_id,
            |pins| pins.call = Some(call),
            |schedule| CallSchedule {
                arrival: schedule.arrival,
                call: ScheduledTime::Manual(call),
            },
            now,
        )
        .await
    }

    /// Drop both pins; the next optimization derives the times again
    pub async fn release_pins(
        &self,
        day: CourierDay,
        stop_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Stop, CallActionError> {
        let lead = self.config.lead_time();
        self.update_pins(
            day,
            stop_id,
            |pins| *pins = StopPins::default(),
            |schedule| {
                let arrival = schedule.arrival_time();
                CallSchedule {
                    arrival: ScheduledTime::Derived(arrival),
                    call: ScheduledTime::Derived(arrival - lead),
                }
            },
            now,
        )
        .await
    }

    async fn update_pins(
        &self,
        day: CourierDay,
        stop_id: &str,
        pin: impl FnOnce(&mut StopPins),
        schedule: impl Fn(&CallSchedule) -> CallSchedule,
        now: DateTime<Utc>,
    ) -> Result<Stop, CallActionError> {
        let mut stop = self.load_stop(day, stop_id).await?;
        pin(&mut stop.pins);
        self.repo.save_stop(day, &stop).await?;

        let mut last_id = None;
        for _ in 0..WRITE_ATTEMPTS {
            let Some(status) = self.status_for(day, stop_id).await? else {
                return Ok(stop);
            };
            last_id = Some(status.id);
            let (updated, rearmed) = reschedule(&status, schedule(&status.schedule), &self.config, now);
            let Some(updated) = updated else {
                return Ok(stop);
            };

            match self.repo.apply_call_write(&schedule_write(&status, &updated, rearmed)).await {
                Ok(()) => {
                    info!(
                        "Rescheduled call for stop {} to {}{}",
                        stop_id,
                        updated.schedule.call_time().format("%H:%M"),
                        if rearmed { " (rearmed)" } else { "" }
                    );
                    return Ok(stop);
                }
                Err(StorageError::Conflict(reason)) => debug!("Reloading call of stop {}: {}", stop_id, reason),
                Err(e) => return Err(e.into()),
            }
        }

        match last_id {
            Some(id) => Err(CallActionError::ConcurrentUpdate(id)),
            None => Ok(stop),
        }
    }

    /// Record the delivery and retire the stop's reminder
    pub async fn mark_stop_delivered(
        &self,
        day: CourierDay,
        stop_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Stop, CallActionError> {
        let mut stop = self.load_stop(day, stop_id).await?;
        stop.status = DeliveryStatus::Delivered;
        self.repo.save_stop(day, &stop).await?;

        if let Some(status) = self.status_for(day, stop_id).await? {
            self.repo
                .apply_call_write(&CallWrite::Deactivate { id: status.id, at: now })
                .await?;
        }

        info!("Stop {} of {} delivered", stop_id, day);
        Ok(stop)
    }

    async fn load_stop(&self, day: CourierDay, stop_id: &str) -> Result<Stop, CallActionError> {
        self.repo
            .load_stop(day, stop_id)
            .await?
            .ok_or_else(|| CallActionError::StopNotFound {
                day,
                stop_id: stop_id.to_string(),
            })
    }

    async fn status_for(&self, day: CourierDay, stop_id: &str) -> Result<Option<CallStatus>, CallActionError> {
        let statuses = self.repo.load_call_statuses(day).await?;
        Ok(statuses.into_iter().find(|s| s.stop_id == stop_id))
    }
}
