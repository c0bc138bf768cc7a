//! Stop and start location types

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

/// One courier's planning day. Every route, stop and call belongs to exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourierDay {
    pub courier_id: Uuid,
    pub date: NaiveDate,
}

impl CourierDay {
    pub fn new(courier_id: Uuid, date: NaiveDate) -> Self {
        Self { courier_id, date }
    }
}

impl std::fmt::Display for CourierDay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.courier_id, self.date)
    }
}

/// Delivery window. Either bound may be open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeWindow {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl TimeWindow {
    pub fn new(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        Self { start, end }
    }

    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start: Some(start), end: Some(end) }
    }

    /// A window with neither bound constrains nothing
    pub fn is_open(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start.map_or(true, |s| at >= s) && self.end.map_or(true, |e| at <= e)
    }

    /// How far past the window end `at` falls (zero when on time)
    pub fn lateness(&self, at: DateTime<Utc>) -> Duration {
        match self.end {
            Some(end) if at > end => at - end,
            _ => Duration::zero(),
        }
    }
}

/// Delivery status of a stop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
}

impl DeliveryStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Delivered => "delivered",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(DeliveryStatus::Pending),
            "delivered" => Some(DeliveryStatus::Delivered),
            _ => None,
        }
    }
}

/// Operator-entered times. Only explicit operator actions write these.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopPins {
    /// Manual arrival time, authoritative when set
    pub arrival: Option<DateTime<Utc>>,
    /// Manual call time, authoritative when set
    pub call: Option<DateTime<Utc>>,
}

/// A single delivery destination for the planning day
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stop {
    pub id: String,
    pub address: String,
    pub customer_name: Option<String>,
    pub phone: Option<String>,
    pub comment: Option<String>,
    /// Missing until geocoded
    pub coordinates: Option<Coordinates>,
    pub time_window: Option<TimeWindow>,
    #[serde(default)]
    pub pins: StopPins,
    pub status: DeliveryStatus,
}

impl Stop {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            customer_name: None,
            phone: None,
            comment: None,
            coordinates: None,
            time_window: None,
            pins: StopPins::default(),
            status: DeliveryStatus::Pending,
        }
    }

    pub fn with_coordinates(mut self, lat: f64, lng: f64) -> Self {
        self.coordinates = Some(Coordinates { lat, lng });
        self
    }

    pub fn with_window(mut self, window: TimeWindow) -> Self {
        self.time_window = Some(window);
        self
    }

    pub fn is_active(&self) -> bool {
        self.status != DeliveryStatus::Delivered
    }

    /// Declared window, ignoring windows with no bounds at all
    pub fn declared_window(&self) -> Option<TimeWindow> {
        self.time_window.filter(|w| !w.is_open())
    }
}

/// Where and when the courier starts the day
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartLocation {
    /// Known coordinates; when absent the address is geocoded
    pub coordinates: Option<Coordinates>,
    pub address: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
}

impl StartLocation {
    pub fn at(coordinates: Coordinates, start_time: DateTime<Utc>) -> Self {
        Self {
            coordinates: Some(coordinates),
            address: None,
            start_time: Some(start_time),
        }
    }

    /// Start time, falling back to the default shift start on the planning day
    pub fn effective_start(&self, date: NaiveDate, default_start: NaiveTime) -> DateTime<Utc> {
        self.start_time
            .unwrap_or_else(|| date.and_time(default_start).and_utc())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, h, m, 0).unwrap()
    }

    #[test]
    fn test_window_contains_bounds_inclusive() {
        let window = TimeWindow::between(at(10, 0), at(12, 0));
        assert!(window.contains(at(10, 0)));
        assert!(window.contains(at(12, 0)));
        assert!(!window.contains(at(9, 59)));
        assert!(!window.contains(at(12, 1)));
    }

    #[test]
    fn test_window_lateness() {
        let window = TimeWindow::between(at(10, 0), at(12, 0));
        assert_eq!(window.lateness(at(11, 0)), Duration::zero());
        assert_eq!(window.lateness(at(12, 25)), Duration::minutes(25));
    }

    #[test]
    fn test_open_ended_window() {
        let window = TimeWindow::new(Some(at(14, 0)), None);
        assert!(window.contains(at(23, 0)));
        assert_eq!(window.lateness(at(23, 0)), Duration::zero());
        assert!(!window.is_open());
        assert!(TimeWindow::new(None, None).is_open());
    }

    #[test]
    fn test_declared_window_skips_unbounded() {
        let stop = Stop::new("s1", "Main st 1").with_window(TimeWindow::new(None, None));
        assert!(stop.declared_window().is_none());
    }

    #[test]
    fn test_delivery_status_roundtrip_str() {
        for status in [DeliveryStatus::Pending, DeliveryStatus::Delivered] {
            assert_eq!(DeliveryStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(DeliveryStatus::parse("lost"), None);
    }

    #[test]
    fn test_start_location_default_time() {
        let start = StartLocation {
            coordinates: None,
            address: Some("Depot".to_string()),
            start_time: None,
        };
        let date = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let nine = NaiveTime::from_hms_opt(9, 0, 0).unwrap();
        assert_eq!(start.effective_start(date, nine), at(9, 0));
    }
}
