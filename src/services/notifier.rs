//! Call reminder delivery
//!
//! Reminders are published as JSON to JetStream so the operator-facing
//! consumers can pick them up; without NATS they are only logged.
//!
//! ## Streams
//! - `COURIER_CALL_REMINDERS` - `courier.calls.reminder.<courier_id>`

use anyhow::Result;
use async_nats::jetstream::{self, Context as JsContext};
use async_trait::async_trait;
use tracing::{info, warn};

use crate::types::{CallNotification, CallStatus, Stop};

const STREAM_NAME: &str = "COURIER_CALL_REMINDERS";
const SUBJECT: &str = "courier.calls.reminder";

/// Delivers call reminders. Only the call scheduler uses this.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// `true` when the reminder was handed off successfully
    async fn send_call_reminder(&self, notification: &CallNotification) -> bool;
}

/// Build the reminder for the next dispatch of `status`
pub fn build_notification(status: &CallStatus, stop: &Stop) -> CallNotification {
    let attempt = status.progress.attempts + 1;
    let is_retry = status.progress.attempts > 0;
    CallNotification {
        call_status_id: status.id,
        courier_id: status.courier_id,
        stop_id: stop.id.clone(),
        customer_name: stop.customer_name.clone(),
        phone: stop.phone.clone(),
        address: stop.address.clone(),
        call_time: status.schedule.call_time(),
        arrival_time: status.schedule.arrival_time(),
        attempt,
        is_retry,
        message: render_message(status, stop, is_retry),
    }
}

fn render_message(status: &CallStatus, stop: &Stop, is_retry: bool) -> String {
    let mut message = format!(
        "Time to call{}\nCustomer: {}\nPhone: {}\nAddress: {}\nArrival: {}",
        if is_retry { " (retry)" } else { "" },
        stop.customer_name.as_deref().unwrap_or("Customer"),
        stop.phone.as_deref().unwrap_or("-"),
        stop.address,
        status.schedule.arrival_time().format("%H:%M"),
    );
    if let Some(comment) = stop.comment.as_deref().filter(|c| !c.trim().is_empty()) {
        message.push_str("\nComment: ");
        message.push_str(comment);
    }
    message
}

/// Publishes reminders to JetStream and waits for the stream ack
pub struct NatsNotifier {
    js: JsContext,
}

impl NatsNotifier {
    /// Create the notifier, initializing the JetStream stream
    pub async fn new(client: async_nats::Client) -> Result<Self> {
        let js = jetstream::new(client);

        let stream_config = jetstream::stream::Config {
            name: STREAM_NAME.to_string(),
            subjects: vec![format!("{}.>", SUBJECT)],
            max_messages: 100_000,
            max_bytes: 64 * 1024 * 1024,
            ..Default::default()
        };
        js.get_or_create_stream(stream_config).await?;
        info!("JetStream reminder stream '{}' ready", STREAM_NAME);

        Ok(Self { js })
    }

    async fn publish(&self, notification: &CallNotification) -> Result<()> {
        let subject = format!("{}.{}", SUBJECT, notification.courier_id);
        let payload = serde_json::to_vec(notification)?;
        self.js.publish(subject, payload.into()).await?.await?;
        Ok(())
    }
}

#[async_trait]
impl Notifier for NatsNotifier {
    async fn send_call_reminder(&self, notification: &CallNotification) -> bool {
        match self.publish(notification).await {
            Ok(()) => {
                info!(
                    "Reminder for stop {} published (attempt {})",
                    notification.stop_id, notification.attempt
                );
                true
            }
            Err(e) => {
                warn!("Failed to publish reminder {}: {}", notification.call_status_id, e);
                false
            }
        }
    }
}

/// Logs reminders instead of delivering them
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_call_reminder(&self, notification: &CallNotification) -> bool {
        info!(
            courier_id = %notification.courier_id,
            stop_id = %notification.stop_id,
            attempt = notification.attempt,
            "Call reminder: {}",
            notification.message.replace('\n', " | ")
        );
        true
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicBool, Ordering};

    use parking_lot::Mutex;

    use super::*;

    /// Records every reminder; answers with `accept`
    pub struct RecordingNotifier {
        pub accept: AtomicBool,
        pub sent: Mutex<Vec<CallNotification>>,
    }

    impl RecordingNotifier {
        pub fn new() -> Self {
            Self {
                accept: AtomicBool::new(true),
                sent: Mutex::new(Vec::new()),
            }
        }

        pub fn failing() -> Self {
            let notifier = Self::new();
            notifier.accept.store(false, Ordering::SeqCst);
            notifier
        }

        pub fn count(&self) -> usize {
            self.sent.lock().len()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send_call_reminder(&self, notification: &CallNotification) -> bool {
            self.sent.lock().push(notification.clone());
            self.accept.load(Ordering::SeqCst)
        }
    }
}
