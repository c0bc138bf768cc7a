//! Call schedule derivation
//!
//! Call time is the resolved arrival minus the lead time. Operator pins on
//! the stop always win, and a schedule field that is already manual stays so.

use chrono::Duration;

use crate::types::{CallSchedule, RoutePoint, ScheduledTime, Stop};

pub fn derive_schedule(
    point: &RoutePoint,
    stop: &Stop,
    previous: Option<&CallSchedule>,
    lead_time: Duration,
) -> CallSchedule {
    let arrival = ScheduledTime::resolve(
        stop.pins.arrival,
        previous.map(|s| s.arrival),
        point.arrival_time,
    );
    let call = ScheduledTime::resolve(
        stop.pins.call,
        previous.map(|s| s.call),
        arrival.at() - lead_time,
    );
    CallSchedule { arrival, call }
}
