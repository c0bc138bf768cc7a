//! Typed errors surfaced by the planning and call services

use thiserror::Error;

use crate::types::CourierDay;

/// Failures of the maps collaborator
#[derive(Debug, Error)]
pub enum MapsError {
    #[error("maps provider unavailable: {0}")]
    Unavailable(String),
    #[error("could not geocode address '{address}'")]
    GeocodeFailed { address: String },
}

/// Failures of the repository collaborator
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    /// A guarded write found the record changed since it was read
    #[error("concurrent update: {0}")]
    Conflict(String),
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        StorageError::Unavailable(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Unavailable(format!("corrupt stored document: {}", err))
    }
}

/// Errors that abort an optimization run
#[derive(Debug, Error)]
pub enum PlanningError {
    #[error("no start location for courier day {day}")]
    NoStartLocation { day: CourierDay },
    #[error("address of {subject} could not be resolved: '{address}'")]
    UnresolvedAddress { subject: String, address: String },
    #[error("an optimization for courier day {day} is already running")]
    ConcurrentOptimizationInProgress { day: CourierDay },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl PlanningError {
    /// The caller may simply retry later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PlanningError::ConcurrentOptimizationInProgress { .. } | PlanningError::Storage(_)
        )
    }
}

/// Errors from operator actions on calls and stops
#[derive(Debug, Error)]
pub enum CallActionError {
    #[error("call status {0} not found")]
    CallNotFound(uuid::Uuid),
    #[error("stop {stop_id} not found for courier day {day}")]
    StopNotFound { day: CourierDay, stop_id: String },
    #[error("cannot {action} a call in state {state}")]
    InvalidTransition {
        action: &'static str,
        state: crate::types::CallState,
    },
    #[error("call status {0} kept changing while being updated")]
    ConcurrentUpdate(uuid::Uuid),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<crate::services::call_state::TransitionError> for CallActionError {
    fn from(err: crate::services::call_state::TransitionError) -> Self {
        CallActionError::InvalidTransition {
            action: err.action,
            state: err.state,
        }
    }
}
