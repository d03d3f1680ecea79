//! Booking notices, delivered off the write path.
//!
//! The engine enqueues a [`Notice`] after a transaction commits. A background
//! dispatcher drains the queue and hands each notice to a [`Mailer`], retrying
//! with backoff. Nothing here can fail or roll back a booking.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::model::{BookingSummary, Requester};
use crate::observability;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    /// Self-service client request waiting for staff approval.
    Requested,
    Confirmed,
    Approved,
    Rejected,
    Cancelled,
    /// Day-before reminder.
    Reminder,
}

impl NoticeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoticeKind::Requested => "requested",
            NoticeKind::Confirmed => "confirmed",
            NoticeKind::Approved => "approved",
            NoticeKind::Rejected => "rejected",
            NoticeKind::Cancelled => "cancelled",
            NoticeKind::Reminder => "reminder",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub kind: NoticeKind,
    pub requester: Requester,
    pub booking: BookingSummary,
    pub reschedule_token: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("delivery failed: {0}")]
pub struct DeliveryError(pub String);

/// Delivery channel for notices (email in production).
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn deliver(&self, notice: &Notice) -> Result<(), DeliveryError>;
}

/// Mailer that only logs. Used when no mail transport is configured.
#[derive(Debug, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn deliver(&self, notice: &Notice) -> Result<(), DeliveryError> {
        info!(
            kind = notice.kind.as_str(),
            requester = %notice.requester,
            role = %notice.booking.role_name,
            date = %notice.booking.date,
            "booking notice"
        );
        Ok(())
    }
}

/// Producer side of the notice queue. Cheap to clone.
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::Sender<Notice>,
}

impl Outbox {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Notice>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queue a notice without waiting. Returns false if it was dropped.
    pub fn enqueue(&self, notice: Notice) -> bool {
        match self.tx.try_send(notice) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(n)) => {
                warn!(kind = n.kind.as_str(), requester = %n.requester, "outbox full, notice dropped");
                metrics::counter!(observability::NOTICES_DROPPED_TOTAL).increment(1);
                false
            }
            Err(mpsc::error::TrySendError::Closed(n)) => {
                warn!(kind = n.kind.as_str(), requester = %n.requester, "outbox closed, notice dropped");
                metrics::counter!(observability::NOTICES_DROPPED_TOTAL).increment(1);
                false
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles after each failure.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Duration::from_millis(500),
        }
    }
}

/// Background task: deliver queued notices until every `Outbox` handle is dropped.
pub async fn run_dispatcher(
    mut rx: mpsc::Receiver<Notice>,
    mailer: Arc<dyn Mailer>,
    policy: RetryPolicy,
) {
    while let Some(notice) = rx.recv().await {
        deliver_with_retry(mailer.as_ref(), &notice, policy).await;
    }
    debug!("outbox dispatcher stopped");
}

async fn deliver_with_retry(mailer: &dyn Mailer, notice: &Notice, policy: RetryPolicy) -> bool {
    let attempts = policy.max_attempts.max(1);
    let mut delay = policy.backoff;
    for attempt in 1..=attempts {
        match mailer.deliver(notice).await {
            Ok(()) => {
                metrics::counter!(observability::NOTICES_DELIVERED_TOTAL, "kind" => notice.kind.as_str())
                    .increment(1);
                return true;
            }
            Err(e) if attempt < attempts => {
                warn!(attempt, kind = notice.kind.as_str(), requester = %notice.requester, "{e}, retrying");
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
            Err(e) => {
                error!(
                    attempts,
                    kind = notice.kind.as_str(),
                    requester = %notice.requester,
                    booking = ?notice.booking.booking_id,
                    "giving up on notice: {e}"
                );
            }
        }
    }
    metrics::counter!(observability::NOTICES_FAILED_TOTAL, "kind" => notice.kind.as_str()).increment(1);
    false
}
