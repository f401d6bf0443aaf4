//! Workitem events, the bounded event queue, and the dispatcher which fans
//! queued events out to the delivery service.

use crate::delivery::EventDeliveryService;
use crate::subscription::{Subscription, SubscriptionManager};
use crate::workitem::{ProcedureStepState, ProgressInformation};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpsEventType {
    StateReport,
    ProgressReport,
    CancelRequested,
    Assigned,
    Completed,
    Canceled,
}

/// Events produced by mutating UPS storage operations.
#[derive(Debug, Clone, PartialEq)]
pub enum UpsEvent {
    StateReport {
        workitem_uid: String,
        transaction_uid: Option<String>,
        previous_state: ProcedureStepState,
        new_state: ProcedureStepState,
    },
    ProgressReport {
        workitem_uid: String,
        transaction_uid: Option<String>,
        progress: ProgressInformation,
    },
    CancelRequested {
        workitem_uid: String,
        transaction_uid: Option<String>,
        reason: Option<String>,
    },
    Assigned {
        workitem_uid: String,
        transaction_uid: Option<String>,
        performer: String,
    },
    Completed {
        workitem_uid: String,
        transaction_uid: Option<String>,
    },
    Canceled {
        workitem_uid: String,
        transaction_uid: Option<String>,
        reason: Option<String>,
    },
}

impl UpsEvent {
    pub fn event_type(&self) -> UpsEventType {
        match self {
            Self::StateReport { .. } => UpsEventType::StateReport,
            Self::ProgressReport { .. } => UpsEventType::ProgressReport,
            Self::CancelRequested { .. } => UpsEventType::CancelRequested,
            Self::Assigned { .. } => UpsEventType::Assigned,
            Self::Completed { .. } => UpsEventType::Completed,
            Self::Canceled { .. } => UpsEventType::Canceled,
        }
    }

    pub fn workitem_uid(&self) -> &str {
        match self {
            Self::StateReport { workitem_uid, .. }
            | Self::ProgressReport { workitem_uid, .. }
            | Self::CancelRequested { workitem_uid, .. }
            | Self::Assigned { workitem_uid, .. }
            | Self::Completed { workitem_uid, .. }
            | Self::Canceled { workitem_uid, .. } => workitem_uid,
        }
    }
}

/// An event paired with the subscriptions interested in it at enqueue time.
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    pub event: UpsEvent,
    pub subscriptions: Vec<Subscription>,
}

/// Bounded FIFO of event envelopes. On overflow the oldest entries make way:
/// newer events take priority.
#[derive(Debug)]
pub struct EventQueue {
    inner: Mutex<VecDeque<EventEnvelope>>,
    notify: Notify,
    max_size: usize,
}

impl EventQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            max_size: max_size.max(1),
        }
    }

    pub fn enqueue(&self, envelope: EventEnvelope) {
        {
            let mut inner = self.inner.lock().unwrap();
            while inner.len() >= self.max_size {
                let dropped = inner.pop_front();
                if let Some(dropped) = dropped {
                    tracing::warn!(
                        workitem = dropped.event.workitem_uid(),
                        event_type = ?dropped.event.event_type(),
                        "event queue overflow, dropping oldest event"
                    );
                }
            }
            inner.push_back(envelope);
        }
        self.notify.notify_one();
    }

    /// Pop the oldest envelope, waiting while the queue is empty.
    pub async fn dequeue(&self) -> EventEnvelope {
        loop {
            if let Some(envelope) = self.try_dequeue() {
                return envelope;
            }
            self.notify.notified().await;
        }
    }

    pub fn try_dequeue(&self) -> Option<EventEnvelope> {
        self.inner.lock().unwrap().pop_front()
    }

    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }
}

/// Consumes the queue from a single background task and hands each event to
/// the delivery service, one subscription at a time, preserving
/// per-subscription order.
pub struct EventDispatcher {
    queue: Arc<EventQueue>,
    subscriptions: Arc<SubscriptionManager>,
    delivery: Arc<dyn EventDeliveryService>,
    task: Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl EventDispatcher {
    pub fn new(
        queue: Arc<EventQueue>,
        subscriptions: Arc<SubscriptionManager>,
        delivery: Arc<dyn EventDeliveryService>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            queue,
            subscriptions,
            delivery,
            task: Mutex::new(None),
            shutdown,
        }
    }

    /// Resolve interested subscriptions and enqueue the event. Called from
    /// inside storage critical sections, so this never blocks or awaits.
    /// Returns how many subscriptions the event was addressed to.
    pub fn publish(&self, event: UpsEvent) -> usize {
        let subscriptions = self.subscriptions.subscriptions_for_event(&event);
        let count = subscriptions.len();
        if count == 0 {
            tracing::debug!(
                workitem = event.workitem_uid(),
                event_type = ?event.event_type(),
                "no subscribers for event"
            );
            return 0;
        }
        self.queue.enqueue(EventEnvelope {
            event,
            subscriptions,
        });
        count
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    /// Spawn the dispatch loop. Calling `start` on a running dispatcher does
    /// nothing.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().unwrap();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let _ = self.shutdown.send(false);
        let dispatcher = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            dispatcher.run().await;
        }));
        tracing::debug!("event dispatcher started");
    }

    async fn run(&self) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                envelope = self.queue.dequeue() => {
                    self.deliver(envelope).await;
                }
            }
        }
    }

    /// Hand one envelope to the delivery service, subscription by
    /// subscription. Failures are logged and never halt the loop.
    async fn deliver(&self, envelope: EventEnvelope) {
        let event = &envelope.event;
        futures::stream::iter(&envelope.subscriptions)
            .for_each(|subscription| async move {
                if let Err(e) = self.delivery.deliver_event(event, subscription).await {
                    tracing::error!(
                        aet = subscription.ae_title.as_str(),
                        workitem = event.workitem_uid(),
                        message = e.to_string(),
                        "event delivery failed"
                    );
                }
            })
            .await;
    }

    /// Cancel the loop, await its termination, and discard whatever is left
    /// in the queue.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!("event dispatcher task ended abnormally: {e}");
            }
        }
        self.queue.clear();
        tracing::debug!("event dispatcher stopped");
    }

    pub fn running(&self) -> bool {
        self.task
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }
}
