//! PostgreSQL repository

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::repository::{CallWrite, DayLease, PlanCommit, Repository};
use crate::config::SingleFlightPolicy;
use crate::error::StorageError;
use crate::types::{
    CallProgress, CallSchedule, CallState, CallStatus, Coordinates, CourierDay, DeliveryStatus,
    OptimizedRoute, ScheduledTime, StartLocation, Stop, StopPins, TimeWindow,
};

#[derive(Debug, sqlx::FromRow)]
struct StopRow {
    stop_id: String,
    address: String,
    customer_name: Option<String>,
    phone: Option<String>,
    comment: Option<String>,
    lat: Option<f64>,
    lng: Option<f64>,
    window_start: Option<DateTime<Utc>>,
    window_end: Option<DateTime<Utc>>,
    manual_arrival_time: Option<DateTime<Utc>>,
    manual_call_time: Option<DateTime<Utc>>,
    delivery_status: String,
}

impl TryFrom<StopRow> for Stop {
    type Error = StorageError;

    fn try_from(row: StopRow) -> Result<Self, Self::Error> {
        let status = DeliveryStatus::parse(&row.delivery_status).ok_or_else(|| {
            StorageError::Unavailable(format!("unknown delivery status '{}'", row.delivery_status))
        })?;
        let window = TimeWindow::new(row.window_start, row.window_end);
        Ok(Stop {
            id: row.stop_id,
            address: row.address,
            customer_name: row.customer_name,
            phone: row.phone,
            comment: row.comment,
            coordinates: coordinates(row.lat, row.lng),
            time_window: (!window.is_open()).then_some(window),
            pins: StopPins {
                arrival: row.manual_arrival_time,
                call: row.manual_call_time,
            },
            status,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct StartRow {
    lat: Option<f64>,
    lng: Option<f64>,
    address: Option<String>,
    start_time: Option<DateTime<Utc>>,
}

#[derive(Debug, sqlx::FromRow)]
struct CallRow {
    id: Uuid,
    courier_id: Uuid,
    date: NaiveDate,
    stop_id: String,
    arrival_time: DateTime<Utc>,
    is_manual_arrival: bool,
    call_time: DateTime<Utc>,
    is_manual_call: bool,
    status: String,
    attempts: i32,
    next_attempt_time: Option<DateTime<Utc>>,
    sent_at: Option<DateTime<Utc>>,
    comment: Option<String>,
    updated_at: DateTime<Utc>,
}

fn scheduled(at: DateTime<Utc>, manual: bool) -> ScheduledTime {
    if manual {
        ScheduledTime::Manual(at)
    } else {
        ScheduledTime::Derived(at)
    }
}

fn coordinates(lat: Option<f64>, lng: Option<f64>) -> Option<Coordinates> {
    match (lat, lng) {
        (Some(lat), Some(lng)) => Some(Coordinates { lat, lng }),
        _ => None,
    }
}

impl TryFrom<CallRow> for CallStatus {
    type Error = StorageError;

    fn try_from(row: CallRow) -> Result<Self, Self::Error> {
        let state = CallState::parse(&row.status)
            .ok_or_else(|| StorageError::Unavailable(format!("unknown call status '{}'", row.status)))?;
        Ok(CallStatus {
            id: row.id,
            courier_id: row.courier_id,
            date: row.date,
            stop_id: row.stop_id,
            schedule: CallSchedule {
                arrival: scheduled(row.arrival_time, row.is_manual_arrival),
                call: scheduled(row.call_time, row.is_manual_call),
            },
            progress: CallProgress {
                state,
                attempts: row.attempts.max(0) as u32,
                next_attempt_time: row.next_attempt_time,
                sent_at: row.sent_at,
                comment: row.comment,
            },
            updated_at: row.updated_at,
        })
    }
}

const CALL_COLUMNS: &str = r#"
    id, courier_id, date, stop_id, arrival_time, is_manual_arrival,
    call_time, is_manual_call, status, attempts, next_attempt_time,
    sent_at, comment, updated_at
"#;

const STOP_COLUMNS: &str = r#"
    stop_id, address, customer_name, phone, comment, lat, lng,
    window_start, window_end, manual_arrival_time, manual_call_time, delivery_status
"#;

/// Repository backed by PostgreSQL
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

async fn insert_call<'e, E>(executor: E, status: &CallStatus) -> Result<u64, StorageError>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let result = sqlx::query(
        r#"
        INSERT INTO call_statuses (
            id, courier_id, date, stop_id, arrival_time, is_manual_arrival,
            call_time, is_manual_call, status, attempts, next_attempt_time,
            sent_at, comment, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(status.id)
    .bind(status.courier_id)
    .bind(status.date)
    .bind(&status.stop_id)
    .bind(status.schedule.arrival_time())
    .bind(status.schedule.is_manual_arrival())
    .bind(status.schedule.call_time())
    .bind(status.schedule.is_manual_call())
    .bind(status.progress.state.as_str())
    .bind(status.progress.attempts as i32)
    .bind(status.progress.next_attempt_time)
    .bind(status.progress.sent_at)
    .bind(&status.progress.comment)
    .bind(status.updated_at)
    .execute(executor)
    .await?;
    Ok(result.rows_affected())
}

/// Schedule columns only, guarded on the schedule the writer read
async fn reschedule_call<'e, E>(
    executor: E,
    id: Uuid,
    expected: &CallSchedule,
    schedule: &CallSchedule,
    at: DateTime<Utc>,
) -> Result<u64, StorageError>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let result = sqlx::query(
        r#"
        UPDATE call_statuses SET
            arrival_time = $6, is_manual_arrival = $7,
            call_time = $8, is_manual_call = $9,
            updated_at = $10
        WHERE id = $1
          AND arrival_time = $2 AND is_manual_arrival = $3
          AND call_time = $4 AND is_manual_call = $5
        "#,
    )
    .bind(id)
    .bind(expected.arrival_time())
    .bind(expected.is_manual_arrival())
    .bind(expected.call_time())
    .bind(expected.is_manual_call())
    .bind(schedule.arrival_time())
    .bind(schedule.is_manual_arrival())
    .bind(schedule.call_time())
    .bind(schedule.is_manual_call())
    .bind(at)
    .execute(executor)
    .await?;
    Ok(result.rows_affected())
}

/// Progress columns only. `prior` guards state, attempts and call time.
async fn update_progress<'e, E>(
    executor: E,
    prior: &CallStatus,
    progress: &CallProgress,
    at: DateTime<Utc>,
) -> Result<u64, StorageError>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let result = sqlx::query(
        r#"
        UPDATE call_statuses SET
            status = $5, attempts = $6, next_attempt_time = $7,
            sent_at = $8, comment = $9, updated_at = $10
        WHERE id = $1 AND status = $2 AND attempts = $3 AND call_time = $4
        "#,
    )
    .bind(prior.id)
    .bind(prior.progress.state.as_str())
    .bind(prior.progress.attempts as i32)
    .bind(prior.schedule.call_time())
    .bind(progress.state.as_str())
    .bind(progress.attempts as i32)
    .bind(progress.next_attempt_time)
    .bind(progress.sent_at)
    .bind(&progress.comment)
    .bind(at)
    .execute(executor)
    .await?;
    Ok(result.rows_affected())
}

async fn write_call(tx: &mut Transaction<'_, Postgres>, write: &CallWrite) -> Result<(), StorageError> {
    let affected = match write {
        CallWrite::Create(status) => insert_call(&mut **tx, status).await?,
        CallWrite::Reschedule {
            id,
            expected,
            schedule,
            reset,
            at,
        } => {
            let mut affected = reschedule_call(&mut **tx, *id, expected, schedule, *at).await?;
            if let (1, Some(progress)) = (affected, reset) {
                affected = sqlx::query(
                    r#"
                    UPDATE call_statuses SET
                        status = $2, attempts = $3, next_attempt_time = $4, sent_at = $5, comment = $6
                    WHERE id = $1
                    "#,
                )
                .bind(id)
                .bind(progress.state.as_str())
                .bind(progress.attempts as i32)
                .bind(progress.next_attempt_time)
                .bind(progress.sent_at)
                .bind(&progress.comment)
                .execute(&mut **tx)
                .await?
                .rows_affected();
            }
            affected
        }
        CallWrite::Deactivate { id, at } => {
            sqlx::query(
                "UPDATE call_statuses SET status = 'inactive', next_attempt_time = NULL, updated_at = $2 WHERE id = $1",
            )
            .bind(id)
            .bind(at)
            .execute(&mut **tx)
            .await?;
            return Ok(());
        }
    };
    if affected == 0 {
        return Err(StorageError::Conflict(format!(
            "call status {} changed since it was read",
            write.id()
        )));
    }
    Ok(())
}

/// Advisory lock key text for one courier day; hashed to bigint in SQL
fn day_lock_key(day: CourierDay) -> String {
    format!("optimize:{}:{}", day.courier_id, day.date)
}

fn day_lock_query(policy: SingleFlightPolicy) -> &'static str {
    match policy {
        SingleFlightPolicy::Reject => "SELECT pg_try_advisory_xact_lock(hashtextextended($1, 0))",
        // blocks until granted
        SingleFlightPolicy::Wait => "SELECT true FROM (SELECT pg_advisory_xact_lock(hashtextextended($1, 0))) AS granted",
    }
}

async fn update_stop_coordinates(
    tx: &mut Transaction<'_, Postgres>,
    day: CourierDay,
    stop_id: &str,
    coordinates: Coordinates,
) -> Result<(), StorageError> {
    sqlx::query("UPDATE courier_stops SET lat = $4, lng = $5 WHERE courier_id = $1 AND date = $2 AND stop_id = $3")
        .bind(day.courier_id)
        .bind(day.date)
        .bind(stop_id)
        .bind(coordinates.lat)
        .bind(coordinates.lng)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn upsert_route<'e, E>(executor: E, day: CourierDay, route: &OptimizedRoute) -> Result<(), StorageError>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let document = serde_json::to_value(route)?;
    sqlx::query(
        r#"
        INSERT INTO courier_routes (courier_id, date, route, updated_at)
        VALUES ($1, $2, $3, NOW())
        ON CONFLICT (courier_id, date) DO UPDATE SET route = EXCLUDED.route, updated_at = NOW()
        "#,
    )
    .bind(day.courier_id)
    .bind(day.date)
    .bind(document)
    .execute(executor)
    .await?;
    Ok(())
}

#[async_trait]
impl Repository for PgRepository {
    async fn load_stops(&self, day: CourierDay) -> Result<Vec<Stop>, StorageError> {
        let rows = sqlx::query_as::<_, StopRow>(&format!(
            "SELECT {} FROM courier_stops WHERE courier_id = $1 AND date = $2 ORDER BY position, stop_id",
            STOP_COLUMNS
        ))
        .bind(day.courier_id)
        .bind(day.date)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Stop::try_from).collect()
    }

    async fn load_stop(&self, day: CourierDay, stop_id: &str) -> Result<Option<Stop>, StorageError> {
        let row = sqlx::query_as::<_, StopRow>(&format!(
            "SELECT {} FROM courier_stops WHERE courier_id = $1 AND date = $2 AND stop_id = $3",
            STOP_COLUMNS
        ))
        .bind(day.courier_id)
        .bind(day.date)
        .bind(stop_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Stop::try_from).transpose()
    }

    async fn save_stop(&self, day: CourierDay, stop: &Stop) -> Result<(), StorageError> {
        let window = stop.time_window.unwrap_or(TimeWindow::new(None, None));
        sqlx::query(
            r#"
            INSERT INTO courier_stops (
                courier_id, date, stop_id, position, address, customer_name, phone, comment,
                lat, lng, window_start, window_end, manual_arrival_time, manual_call_time,
                delivery_status
            )
            VALUES (
                $1, $2, $3,
                (SELECT COALESCE(MAX(position) + 1, 0) FROM courier_stops WHERE courier_id = $1 AND date = $2),
                $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14
            )
            ON CONFLICT (courier_id, date, stop_id) DO UPDATE SET
                address = EXCLUDED.address,
                customer_name = EXCLUDED.customer_name,
                phone = EXCLUDED.phone,
                comment = EXCLUDED.comment,
                lat = EXCLUDED.lat,
                lng = EXCLUDED.lng,
                window_start = EXCLUDED.window_start,
                window_end = EXCLUDED.window_end,
                manual_arrival_time = EXCLUDED.manual_arrival_time,
                manual_call_time = EXCLUDED.manual_call_time,
                delivery_status = EXCLUDED.delivery_status
            "#,
        )
        .bind(day.courier_id)
        .bind(day.date)
        .bind(&stop.id)
        .bind(&stop.address)
        .bind(&stop.customer_name)
        .bind(&stop.phone)
        .bind(&stop.comment)
        .bind(stop.coordinates.map(|c| c.lat))
        .bind(stop.coordinates.map(|c| c.lng))
        .bind(window.start)
        .bind(window.end)
        .bind(stop.pins.arrival)
        .bind(stop.pins.call)
        .bind(stop.status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_stop_coordinates(
        &self,
        day: CourierDay,
        stop_id: &str,
        coordinates: Coordinates,
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        update_stop_coordinates(&mut tx, day, stop_id, coordinates).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn load_start_location(&self, day: CourierDay) -> Result<Option<StartLocation>, StorageError> {
        let row = sqlx::query_as::<_, StartRow>(
            "SELECT lat, lng, address, start_time FROM courier_start_locations WHERE courier_id = $1 AND date = $2",
        )
        .bind(day.courier_id)
        .bind(day.date)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| StartLocation {
            coordinates: coordinates(r.lat, r.lng),
            address: r.address,
            start_time: r.start_time,
        }))
    }

    async fn save_start_location(&self, day: CourierDay, start: &StartLocation) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO courier_start_locations (courier_id, date, lat, lng, address, start_time)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (courier_id, date) DO UPDATE SET
                lat = EXCLUDED.lat,
                lng = EXCLUDED.lng,
                address = EXCLUDED.address,
                start_time = EXCLUDED.start_time
            "#,
        )
        .bind(day.courier_id)
        .bind(day.date)
        .bind(start.coordinates.map(|c| c.lat))
        .bind(start.coordinates.map(|c| c.lng))
        .bind(&start.address)
        .bind(start.start_time)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_route(&self, day: CourierDay) -> Result<Option<OptimizedRoute>, StorageError> {
        let row: Option<(serde_json::Value,)> =
            sqlx::query_as("SELECT route FROM courier_routes WHERE courier_id = $1 AND date = $2")
                .bind(day.courier_id)
                .bind(day.date)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|(document,)| serde_json::from_value(document).map_err(StorageError::from))
            .transpose()
    }

    async fn save_route(&self, day: CourierDay, route: &OptimizedRoute) -> Result<(), StorageError> {
        upsert_route(&self.pool, day, route).await
    }

    async fn load_call_statuses(&self, day: CourierDay) -> Result<Vec<CallStatus>, StorageError> {
        let rows = sqlx::query_as::<_, CallRow>(&format!(
            "SELECT {} FROM call_statuses WHERE courier_id = $1 AND date = $2 ORDER BY call_time, stop_id",
            CALL_COLUMNS
        ))
        .bind(day.courier_id)
        .bind(day.date)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(CallStatus::try_from).collect()
    }

    async fn load_call_status(&self, id: Uuid) -> Result<Option<CallStatus>, StorageError> {
        let row = sqlx::query_as::<_, CallRow>(&format!("SELECT {} FROM call_statuses WHERE id = $1", CALL_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(CallStatus::try_from).transpose()
    }

    async fn load_open_call_statuses(&self) -> Result<Vec<CallStatus>, StorageError> {
        let rows = sqlx::query_as::<_, CallRow>(&format!(
            "SELECT {} FROM call_statuses WHERE status IN ('pending', 'sent') ORDER BY call_time, id",
            CALL_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(CallStatus::try_from).collect()
    }

    async fn apply_call_write(&self, write: &CallWrite) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        write_call(&mut tx, write).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update_call_progress(
        &self,
        prior: &CallStatus,
        progress: &CallProgress,
        at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        Ok(update_progress(&self.pool, prior, progress, at).await? == 1)
    }

    /// Transaction-scoped advisory lock, so every process sharing the
    /// database sees the same claim. The lease owns the transaction and
    /// dropping it rolls back, which releases the lock.
    async fn lock_day(&self, day: CourierDay, policy: SingleFlightPolicy) -> Result<Option<DayLease>, StorageError> {
        let mut tx = self.pool.begin().await?;
        let (granted,): (bool,) = sqlx::query_as(day_lock_query(policy))
            .bind(day_lock_key(day))
            .fetch_one(&mut *tx)
            .await?;
        if !granted {
            return Ok(None);
        }
        Ok(Some(DayLease::new(tx)))
    }

    async fn load_geocode(&self, key: &str) -> Result<Option<Coordinates>, StorageError> {
        let row: Option<(f64, f64)> = sqlx::query_as("SELECT lat, lng FROM geocode_cache WHERE address_key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(lat, lng)| Coordinates { lat, lng }))
    }

    async fn save_geocode(&self, key: &str, coordinates: Coordinates) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO geocode_cache (address_key, lat, lng, created_at, updated_at)
            VALUES ($1, $2, $3, NOW(), NOW())
            ON CONFLICT (address_key) DO UPDATE SET
                lat = EXCLUDED.lat,
                lng = EXCLUDED.lng,
                updated_at = NOW()
            "#,
        )
        .bind(key)
        .bind(coordinates.lat)
        .bind(coordinates.lng)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_plan(&self, commit: &PlanCommit) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;

        if let Some(coords) = commit.geocoded_start {
            sqlx::query("UPDATE courier_start_locations SET lat = $3, lng = $4 WHERE courier_id = $1 AND date = $2")
                .bind(commit.day.courier_id)
                .bind(commit.day.date)
                .bind(coords.lat)
                .bind(coords.lng)
                .execute(&mut *tx)
                .await?;
        }
        for (stop_id, coords) in &commit.geocoded_stops {
            update_stop_coordinates(&mut tx, commit.day, stop_id, *coords).await?;
        }
        upsert_route(&mut *tx, commit.day, &commit.route).await?;
        for write in &commit.call_writes {
            write_call(&mut tx, write).await?;
        }

        tx.commit().await?;
        Ok(())
    }
}
