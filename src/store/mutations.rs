use std::time::Instant;

use tracing::debug;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::conflict::{check_no_conflict, validate_span};
use super::{BookingStore, StoreError};

impl BookingStore {
    /// Check-and-insert as one atomic step.
    ///
    /// On success the booking is durable in the WAL and visible to every
    /// later reader. On any error nothing was written.
    pub async fn try_commit(
        &self,
        resource_id: &ResourceId,
        span: Span,
        payload: BookingPayload,
    ) -> Result<Booking, StoreError> {
        validate_span(&span)?;
        if !self.catalog.resource_exists(resource_id) {
            return Err(StoreError::NotFound(resource_id.clone()));
        }

        let started = Instant::now();
        let guard = self.lock_for_commit(resource_id).await?;
        if guard.state.bookings.len() >= MAX_BOOKINGS_PER_RESOURCE {
            return Err(StoreError::LimitExceeded("too many bookings on resource"));
        }
        check_no_conflict(&guard.state, &span)?;

        let booking = Booking {
            id: Ulid::new(),
            resource_id: resource_id.clone(),
            span,
            requester: payload.requester,
            reason: payload.reason,
        };
        let event = Event::BookingCommitted {
            booking: booking.clone(),
        };
        self.persist_and_apply(guard, event).await?;

        metrics::histogram!(observability::COMMIT_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        debug!(
            "committed booking {} on {} [{}, {})",
            booking.id, booking.resource_id, span.start, span.end
        );
        Ok(booking)
    }

    /// Remove a committed booking, freeing its interval.
    pub async fn cancel_booking(&self, id: Ulid) -> Result<Booking, StoreError> {
        let resource_id = self
            .booking_index
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(StoreError::BookingNotFound(id))?;

        let guard = self.lock_for_commit(&resource_id).await?;
        // A concurrent cancel may have won the lock first.
        let booking = guard
            .state
            .bookings
            .iter()
            .find(|b| b.id == id)
            .cloned()
            .ok_or(StoreError::BookingNotFound(id))?;

        let event = Event::BookingCancelled {
            id,
            resource_id: resource_id.clone(),
        };
        self.persist_and_apply(guard, event).await?;
        debug!("cancelled booking {id} on {resource_id}");
        Ok(booking)
    }
}
