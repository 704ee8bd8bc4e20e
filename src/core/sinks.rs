//! Fire-and-forget side effects
//!
//! Customer notifications and background jobs leave the ledger only after the
//! transaction that caused them has committed. Delivery is at-least-once and
//! consumers are expected to be idempotent; a failed dispatch is logged and
//! never rolls anything back.

use crate::types::{Cents, PurchaseId, UserId};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::{info, warn};

/// Customer-facing refund notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationEvent {
    Refund,
    PartialRefund,
    RefundForFraud,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub event: NotificationEvent,
    pub purchase_id: PurchaseId,
    /// Gross amount returned to the buyer
    pub amount_cents: Cents,
}

/// Background work fanned out after a commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    ActivateIntegrations { purchase_id: PurchaseId },
    RecalculateBalance { seller_id: UserId },
    ReindexPurchase { purchase_id: PurchaseId },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("dispatch failed: {0}")]
pub struct DispatchError(pub String);

pub trait NotificationSink: Send + Sync + fmt::Debug {
    fn send(&self, notification: Notification) -> Result<(), DispatchError>;
}

pub trait JobQueue: Send + Sync + fmt::Debug {
    fn enqueue(&self, job: Job) -> Result<(), DispatchError>;
}

/// Keeps everything it receives; used by tests and CLI diagnostics
#[derive(Debug, Default)]
pub struct RecordingSink {
    notifications: Mutex<Vec<Notification>>,
    jobs: Mutex<Vec<Job>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl NotificationSink for RecordingSink {
    fn send(&self, notification: Notification) -> Result<(), DispatchError> {
        self.notifications
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(notification);
        Ok(())
    }
}

impl JobQueue for RecordingSink {
    fn enqueue(&self, job: Job) -> Result<(), DispatchError> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(job);
        Ok(())
    }
}

/// Writes every side effect to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn send(&self, notification: Notification) -> Result<(), DispatchError> {
        info!(
            event = ?notification.event,
            purchase = %notification.purchase_id,
            amount_cents = notification.amount_cents,
            "notification sent"
        );
        Ok(())
    }
}

impl JobQueue for TracingSink {
    fn enqueue(&self, job: Job) -> Result<(), DispatchError> {
        info!(?job, "job enqueued");
        Ok(())
    }
}

/// The pair of sinks every ledger service dispatches through
#[derive(Debug, Clone)]
pub struct SideEffects {
    notifications: Arc<dyn NotificationSink>,
    jobs: Arc<dyn JobQueue>,
}

impl SideEffects {
    pub fn new(notifications: Arc<dyn NotificationSink>, jobs: Arc<dyn JobQueue>) -> Self {
        SideEffects {
            notifications,
            jobs,
        }
    }

    /// Route both notifications and jobs to one recorder
    pub fn recording(sink: Arc<RecordingSink>) -> Self {
        SideEffects {
            notifications: sink.clone(),
            jobs: sink,
        }
    }

    pub fn notify(&self, notification: Notification) {
        if let Err(error) = self.notifications.send(notification) {
            warn!(%error, "notification dropped");
        }
    }

    pub fn enqueue_all(&self, jobs: impl IntoIterator<Item = Job>) {
        for job in jobs {
            if let Err(error) = self.jobs.enqueue(job) {
                warn!(%error, "job dropped");
            }
        }
    }
}

impl Default for SideEffects {
    fn default() -> Self {
        SideEffects::new(Arc::new(TracingSink), Arc::new(TracingSink))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct FailingQueue;

    impl JobQueue for FailingQueue {
        fn enqueue(&self, _job: Job) -> Result<(), DispatchError> {
            Err(DispatchError("queue offline".to_string()))
        }
    }

    #[test]
    fn test_recording_sink_keeps_order() {
        let sink = Arc::new(RecordingSink::new());
        let effects = SideEffects::recording(sink.clone());

        effects.enqueue_all([
            Job::RecalculateBalance { seller_id: UserId(1) },
            Job::ReindexPurchase { purchase_id: PurchaseId(2) },
        ]);
        effects.notify(Notification {
            event: NotificationEvent::PartialRefund,
            purchase_id: PurchaseId(2),
            amount_cents: 500,
        });

        assert_eq!(
            sink.jobs(),
            vec![
                Job::RecalculateBalance { seller_id: UserId(1) },
                Job::ReindexPurchase { purchase_id: PurchaseId(2) },
            ]
        );
        assert_eq!(sink.notifications().len(), 1);
    }

    #[test]
    fn test_failed_dispatch_is_swallowed() {
        let effects = SideEffects::new(Arc::new(TracingSink), Arc::new(FailingQueue));
        effects.enqueue_all([Job::ActivateIntegrations {
            purchase_id: PurchaseId(1),
        }]);
    }
}
