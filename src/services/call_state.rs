//! Call status state machine
//!
//! `pending -> sent -> {confirmed, rejected, failed}`. A failed attempt goes
//! back to pending with a backoff until the attempt cap, then stays failed.
//! Any state may become inactive once the stop is delivered.

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::config::PlanningConfig;
use crate::types::{CallProgress, CallState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retry_interval: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn from_planning(config: &PlanningConfig) -> Self {
        Self {
            retry_interval: config.retry_interval(),
            max_attempts: config.max_attempts,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    /// Notifier accepted the reminder
    Dispatched,
    /// Notifier could not deliver the reminder
    DispatchFailed,
    /// No operator response within the retry interval
    ResponseTimedOut,
    Confirmed { comment: Option<String> },
    Rejected { comment: Option<String> },
    /// Stop delivered or dropped from the route
    Deactivated,
    /// New call time derived; start over
    Rearmed,
}

impl CallEvent {
    fn name(&self) -> &'static str {
        match self {
            CallEvent::Dispatched => "dispatch",
            CallEvent::DispatchFailed => "fail dispatch of",
            CallEvent::ResponseTimedOut => "time out",
            CallEvent::Confirmed { .. } => "confirm",
            CallEvent::Rejected { .. } => "reject",
            CallEvent::Deactivated => "deactivate",
            CallEvent::Rearmed => "rearm",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot {action} a call in state {state}")]
pub struct TransitionError {
    pub action: &'static str,
    pub state: CallState,
}

/// Apply `event` to `progress`, returning the new progress
pub fn apply(
    progress: &CallProgress,
    event: CallEvent,
    now: DateTime<Utc>,
    policy: &RetryPolicy,
) -> Result<CallProgress, TransitionError> {
    let state = progress.state;
    let invalid = |event: &CallEvent| TransitionError {
        action: event.name(),
        state,
    };

    let next = match (state, event) {
        (CallState::Pending, CallEvent::Dispatched) => CallProgress {
            state: CallState::Sent,
            sent_at: Some(now),
            next_attempt_time: None,
            ..progress.clone()
        },
        (CallState::Pending, CallEvent::DispatchFailed) | (CallState::Sent, CallEvent::ResponseTimedOut) => {
            failed_attempt(progress, now, policy)
        }
        (CallState::Pending | CallState::Sent | CallState::Failed, CallEvent::Confirmed { comment }) => CallProgress {
            state: CallState::Confirmed,
            next_attempt_time: None,
            comment,
            ..progress.clone()
        },
        (CallState::Pending | CallState::Sent | CallState::Failed, CallEvent::Rejected { comment }) => CallProgress {
            state: CallState::Rejected,
            next_attempt_time: None,
            comment,
            ..progress.clone()
        },
        (_, CallEvent::Deactivated) => CallProgress {
            state: CallState::Inactive,
            next_attempt_time: None,
            ..progress.clone()
        },
        (_, CallEvent::Rearmed) => CallProgress::fresh(),
        (_, event) => return Err(invalid(&event)),
    };

    Ok(next)
}

fn failed_attempt(progress: &CallProgress, now: DateTime<Utc>, policy: &RetryPolicy) -> CallProgress {
    let attempts = (progress.attempts + 1).min(policy.max_attempts);
    if attempts >= policy.max_attempts {
        CallProgress {
            state: CallState::Failed,
            attempts,
            next_attempt_time: None,
            ..progress.clone()
        }
    } else {
        CallProgress {
            state: CallState::Pending,
            attempts,
            next_attempt_time: Some(now + policy.retry_interval),
            ..progress.clone()
        }
    }
}

/// A sent reminder nobody answered within the retry interval
pub fn response_overdue(progress: &CallProgress, now: DateTime<Utc>, policy: &RetryPolicy) -> bool {
    progress.state == CallState::Sent
        && progress
            .sent_at
            .map_or(true, |sent| now >= sent + policy.retry_interval)
}
