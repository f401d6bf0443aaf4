//! Transports a delivered event to a subscriber.

use crate::event::UpsEvent;
use crate::subscription::Subscription;
use async_trait::async_trait;
use std::sync::Mutex;
use tokio::sync::Notify;

#[derive(thiserror::Error, Debug)]
#[error("delivery to {ae_title} failed: {message}")]
pub struct DeliveryError {
    pub ae_title: String,
    pub message: String,
}

/// How events reach subscribers. Production implementations speak whatever
/// the subscriber listens on; the server only needs `deliver_event`.
#[async_trait]
pub trait EventDeliveryService: Send + Sync {
    async fn start(&self) {}

    async fn stop(&self) {}

    async fn deliver_event(
        &self,
        event: &UpsEvent,
        subscription: &Subscription,
    ) -> Result<(), DeliveryError>;
}

/// Writes every delivered event to the log.
#[derive(Debug, Default)]
pub struct LoggingEventDelivery;

#[async_trait]
impl EventDeliveryService for LoggingEventDelivery {
    async fn deliver_event(
        &self,
        event: &UpsEvent,
        subscription: &Subscription,
    ) -> Result<(), DeliveryError> {
        tracing::info!(
            aet = subscription.ae_title.as_str(),
            workitem = event.workitem_uid(),
            event_type = ?event.event_type(),
            "delivered workitem event"
        );
        Ok(())
    }
}

/// Records every delivered `(event, subscription)` pair.
#[derive(Debug, Default)]
pub struct RecordingEventDelivery {
    delivered: Mutex<Vec<(UpsEvent, Subscription)>>,
    notify: Notify,
}

impl RecordingEventDelivery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delivered(&self) -> Vec<(UpsEvent, Subscription)> {
        self.delivered.lock().unwrap().clone()
    }

    /// Wait until at least `count` deliveries were recorded, or give up after
    /// `timeout`.
    pub async fn wait_for(&self, count: usize, timeout: std::time::Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.delivered.lock().unwrap().len() >= count {
                return true;
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return self.delivered.lock().unwrap().len() >= count;
            }
        }
    }
}

#[async_trait]
impl EventDeliveryService for RecordingEventDelivery {
    async fn deliver_event(
        &self,
        event: &UpsEvent,
        subscription: &Subscription,
    ) -> Result<(), DeliveryError> {
        self.delivered
            .lock()
            .unwrap()
            .push((event.clone(), subscription.clone()));
        self.notify.notify_waiters();
        Ok(())
    }
}
