//! Call reminder types

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::CourierDay;

/// Lifecycle state of a call reminder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Pending,
    Sent,
    Confirmed,
    Rejected,
    Failed,
    Inactive,
}

impl CallState {
    pub const fn as_str(self) -> &'static str {
        match self {
            CallState::Pending => "pending",
            CallState::Sent => "sent",
            CallState::Confirmed => "confirmed",
            CallState::Rejected => "rejected",
            CallState::Failed => "failed",
            CallState::Inactive => "inactive",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(CallState::Pending),
            "sent" => Some(CallState::Sent),
            "confirmed" => Some(CallState::Confirmed),
            "rejected" => Some(CallState::Rejected),
            "failed" => Some(CallState::Failed),
            "inactive" => Some(CallState::Inactive),
            _ => None,
        }
    }

    /// States the scheduler still has work for
    pub const fn is_open(self) -> bool {
        matches!(self, CallState::Pending | CallState::Sent)
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A time that is either computed by the planner or entered by an operator.
///
/// Manual values can only be produced from an operator pin, so a planning
/// run has no way to replace one with a derived value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "source", content = "at")]
pub enum ScheduledTime {
    Derived(DateTime<Utc>),
    Manual(DateTime<Utc>),
}

impl ScheduledTime {
    pub fn at(self) -> DateTime<Utc> {
        match self {
            ScheduledTime::Derived(t) | ScheduledTime::Manual(t) => t,
        }
    }

    pub fn is_manual(self) -> bool {
        matches!(self, ScheduledTime::Manual(_))
    }

    /// Pick the effective value for a field.
    ///
    /// An operator pin always wins; a previously manual value survives;
    /// everything else takes the freshly derived time.
    pub fn resolve(
        pin: Option<DateTime<Utc>>,
        previous: Option<ScheduledTime>,
        derived: DateTime<Utc>,
    ) -> ScheduledTime {
        match (pin, previous) {
            (Some(pinned), _) => ScheduledTime::Manual(pinned),
            (None, Some(manual @ ScheduledTime::Manual(_))) => manual,
            _ => ScheduledTime::Derived(derived),
        }
    }
}

/// Arrival and call times of one reminder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSchedule {
    pub arrival: ScheduledTime,
    pub call: ScheduledTime,
}

impl CallSchedule {
    pub fn call_time(&self) -> DateTime<Utc> {
        self.call.at()
    }

    pub fn arrival_time(&self) -> DateTime<Utc> {
        self.arrival.at()
    }

    pub fn is_manual_call(&self) -> bool {
        self.call.is_manual()
    }

    pub fn is_manual_arrival(&self) -> bool {
        self.arrival.is_manual()
    }
}

/// Workflow progress of one reminder. Written by the scheduler, operator
/// actions and the re-optimization merge only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallProgress {
    pub state: CallState,
    pub attempts: u32,
    pub next_attempt_time: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    /// Operator comment from confirm/reject
    pub comment: Option<String>,
}

impl CallProgress {
    pub fn fresh() -> Self {
        Self {
            state: CallState::Pending,
            attempts: 0,
            next_attempt_time: None,
            sent_at: None,
            comment: None,
        }
    }
}

/// Call reminder for one stop on one courier day
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallStatus {
    pub id: Uuid,
    pub courier_id: Uuid,
    pub date: NaiveDate,
    pub stop_id: String,
    pub schedule: CallSchedule,
    pub progress: CallProgress,
    pub updated_at: DateTime<Utc>,
}

impl CallStatus {
    pub fn new(day: CourierDay, stop_id: impl Into<String>, schedule: CallSchedule, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            courier_id: day.courier_id,
            date: day.date,
            stop_id: stop_id.into(),
            schedule,
            progress: CallProgress::fresh(),
            updated_at: now,
        }
    }

    pub fn day(&self) -> CourierDay {
        CourierDay::new(self.courier_id, self.date)
    }

    pub fn state(&self) -> CallState {
        self.progress.state
    }

    /// Pending, call time reached and any retry backoff elapsed
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.progress.state == CallState::Pending
            && now >= self.schedule.call_time()
            && self.progress.next_attempt_time.map_or(true, |next| now >= next)
    }
}

/// Payload handed to the notifier when a reminder is due
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallNotification {
    pub call_status_id: Uuid,
    pub courier_id: Uuid,
    pub stop_id: String,
    pub customer_name: Option<String>,
    pub phone: Option<String>,
    pub address: String,
    pub call_time: DateTime<Utc>,
    pub arrival_time: DateTime<Utc>,
    /// 1-based attempt number of this dispatch
    pub attempt: u32,
    pub is_retry: bool,
    pub message: String,
}
