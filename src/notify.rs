use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::model::{Booking, Resource};
use crate::observability;
use crate::timestamp::format_instant;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("delivery failed: {0}")]
    Delivery(String),
    #[error("notifier unavailable")]
    Unavailable,
}

/// Told about bookings after they are committed. Its result never changes
/// the outcome reported to the requester.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn booking_confirmed(&self, booking: &Booking, resource: &Resource)
    -> Result<(), NotifyError>;
}

/// The confirmation sent to a requester.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmationMessage {
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

impl ConfirmationMessage {
    pub fn render(booking: &Booking, resource: &Resource) -> Self {
        let requester = &booking.requester;
        Self {
            recipient: requester.contact.clone(),
            subject: "Campus Booking Success".to_string(),
            body: format!(
                "Success! {} is booked for {} ({}).",
                resource.name, requester.name, requester.role
            ),
        }
    }
}

/// Emits confirmations to the log instead of delivering them.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn booking_confirmed(
        &self,
        booking: &Booking,
        resource: &Resource,
    ) -> Result<(), NotifyError> {
        let msg = ConfirmationMessage::render(booking, resource);
        info!(
            booking = %booking.id,
            to = %msg.recipient,
            from = %format_instant(booking.span.start),
            until = %format_instant(booking.span.end),
            "{}: {}",
            msg.subject,
            msg.body
        );
        Ok(())
    }
}

struct Job {
    booking: Booking,
    resource: Resource,
}

/// Bounded hand-off from request handlers to a single notifier worker.
pub struct NotificationQueue {
    tx: mpsc::Sender<Job>,
}

impl NotificationQueue {
    /// Start the worker. It exits once every queue handle is dropped.
    pub fn spawn(notifier: Arc<dyn Notifier>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let worker = tokio::spawn(run_worker(notifier, rx));
        (Self { tx }, worker)
    }

    /// Queue a confirmation. Never blocks; a full queue drops the job.
    pub fn enqueue(&self, booking: Booking, resource: Resource) {
        let id = booking.id;
        if let Err(e) = self.tx.try_send(Job { booking, resource }) {
            metrics::counter!(observability::NOTIFICATIONS_DROPPED_TOTAL).increment(1);
            warn!("dropping confirmation for booking {id}: {e}");
        }
    }
}

async fn run_worker(notifier: Arc<dyn Notifier>, mut rx: mpsc::Receiver<Job>) {
    while let Some(job) = rx.recv().await {
        match notifier.booking_confirmed(&job.booking, &job.resource).await {
            Ok(()) => debug!("confirmation sent for booking {}", job.booking.id),
            Err(e) => {
                metrics::counter!(observability::NOTIFICATIONS_FAILED_TOTAL).increment(1);
                warn!("confirmation for booking {} failed: {e}", job.booking.id);
            }
        }
    }
}
