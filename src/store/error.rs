use std::time::Duration;

use thiserror::Error;
use ulid::Ulid;

use crate::model::{ResourceId, Span};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("resource not found: {0}")]
    NotFound(ResourceId),
    #[error("booking not found: {0}")]
    BookingNotFound(Ulid),
    #[error("invalid interval [{}, {}): {reason}", .span.start, .span.end)]
    InvalidInterval { span: Span, reason: &'static str },
    #[error("conflict with booking: {0}")]
    Conflict(Ulid),
    #[error("resource {resource_id} busy: lock not acquired within {waited:?}")]
    Busy {
        resource_id: ResourceId,
        waited: Duration,
    },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
    #[error("WAL I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store is closed")]
    Closed,
}

impl StoreError {
    /// Retrying the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Busy { .. } | StoreError::WalError(_) | StoreError::Io(_) | StoreError::Closed
        )
    }
}
