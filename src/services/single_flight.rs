//! At most one optimization per courier day within this process
//!
//! Each running optimization holds a `FlightGuard`; dropping it frees the
//! courier day for the next run and removes idle entries from the registry.
//! The in-memory repository hands these out as day leases.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use crate::config::SingleFlightPolicy;
use crate::types::CourierDay;

type Slot = Arc<AsyncMutex<()>>;

/// Thread-safe registry of courier days with an optimization in flight
#[derive(Debug, Clone, Default)]
pub struct SingleFlight {
    slots: Arc<Mutex<HashMap<CourierDay, Slot>>>,
}

/// RAII guard; the courier day stays busy while it is alive
#[derive(Debug)]
pub struct FlightGuard {
    day: CourierDay,
    registry: SingleFlight,
    lock: Option<OwnedMutexGuard<()>>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.lock.take();
        self.registry.release(self.day);
    }
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `day`, either failing fast or queueing behind the current holder.
    /// `None` only under reject while the day is busy.
    pub async fn acquire(&self, day: CourierDay, policy: SingleFlightPolicy) -> Option<FlightGuard> {
        let slot = self.slots.lock().entry(day).or_default().clone();

        let lock = match policy {
            SingleFlightPolicy::Reject => match slot.clone().try_lock_owned() {
                Ok(lock) => lock,
                Err(_) => {
                    drop(slot);
                    self.release(day);
                    return None;
                }
            },
            SingleFlightPolicy::Wait => {
                debug!("Waiting for running optimization of {}", day);
                slot.lock_owned().await
            }
        };

        Some(FlightGuard {
            day,
            registry: self.clone(),
            lock: Some(lock),
        })
    }

    pub fn is_running(&self, day: CourierDay) -> bool {
        self.slots
            .lock()
            .get(&day)
            .map_or(false, |slot| slot.try_lock().is_err())
    }

    fn release(&self, day: CourierDay) {
        let mut slots = self.slots.lock();
        // only the map itself still references an idle slot
        if slots.get(&day).map_or(false, |slot| Arc::strong_count(slot) == 1) {
            slots.remove(&day);
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.slots.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::time::Duration;
    use uuid::Uuid;

    fn day(n: u32) -> CourierDay {
        CourierDay::new(Uuid::nil(), NaiveDate::from_ymd_opt(2026, 3, n).unwrap())
    }

    #[tokio::test]
    async fn test_reject_second_run() {
        let flights = SingleFlight::new();
        let _guard = flights.acquire(day(2), SingleFlightPolicy::Reject).await.unwrap();

        let second = flights.acquire(day(2), SingleFlightPolicy::Reject).await;

        assert!(second.is_none());
        assert!(flights.is_running(day(2)));
        assert_eq!(flights.tracked(), 1);
    }

    #[tokio::test]
    async fn test_other_days_independent() {
        let flights = SingleFlight::new();
        let _a = flights.acquire(day(2), SingleFlightPolicy::Reject).await.unwrap();

        assert!(flights.acquire(day(3), SingleFlightPolicy::Reject).await.is_some());
    }

    #[tokio::test]
    async fn test_guard_drop_frees_day() {
        let flights = SingleFlight::new();
        {
            let _guard = flights.acquire(day(2), SingleFlightPolicy::Reject).await.unwrap();
            assert_eq!(flights.tracked(), 1);
        }

        assert_eq!(flights.tracked(), 0);
        assert!(!flights.is_running(day(2)));
        assert!(flights.acquire(day(2), SingleFlightPolicy::Reject).await.is_some());
    }

    #[tokio::test]
    async fn test_wait_queues_behind_holder() {
        let flights = SingleFlight::new();
        let guard = flights.acquire(day(2), SingleFlightPolicy::Reject).await.unwrap();

        let waiter = {
            let flights = flights.clone();
            tokio::spawn(async move {
                let _guard = flights.acquire(day(2), SingleFlightPolicy::Wait).await.unwrap();
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should get the slot")
            .unwrap();
        assert_eq!(flights.tracked(), 0);
    }

    #[test]
    fn test_waiter_woken_on_release() {
        let flights = SingleFlight::new();
        let guard = tokio_test::block_on(flights.acquire(day(4), SingleFlightPolicy::Reject)).unwrap();

        let mut waiting = tokio_test::task::spawn(flights.acquire(day(4), SingleFlightPolicy::Wait));
        tokio_test::assert_pending!(waiting.poll());

        drop(guard);
        assert!(waiting.is_woken());
        let next = tokio_test::assert_ready!(waiting.poll());
        assert!(next.is_some());
        assert!(flights.is_running(day(4)));
    }
}
