use chrono::NaiveTime;

/// Minutes before the planned arrival the customer is called
pub const DEFAULT_LEAD_TIME_MINUTES: i64 = 40;
pub const DEFAULT_RETRY_INTERVAL_MINUTES: i64 = 10;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_SOLVER_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_SERVICE_TIME_MINUTES: i64 = 10;
pub const DEFAULT_MANUAL_PIN_EPSILON_MINUTES: i64 = 1;
pub const DEFAULT_CALL_TIME_TOLERANCE_MINUTES: i64 = 1;
pub const DEFAULT_SCHEDULER_INTERVAL_SECONDS: u64 = 30;

/// Average speed assumed for straight-line travel estimates
pub const FALLBACK_SPEED_KMH: f64 = 30.0;

pub const DEFAULT_NOMINATIM_URL: &str = "https://nominatim.openstreetmap.org";

pub fn default_start_time() -> NaiveTime {
    NaiveTime::from_hms_opt(9, 0, 0).expect("valid static default start time")
}
