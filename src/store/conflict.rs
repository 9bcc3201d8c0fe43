use crate::limits::*;
use crate::model::*;

use super::StoreError;

/// A span must be well ordered. Ordered spans outside the supported range
/// or wider than the cap are a policy limit, not a malformed interval.
pub(crate) fn validate_span(span: &Span) -> Result<(), StoreError> {
    if !span.is_valid() {
        return Err(StoreError::InvalidInterval {
            span: *span,
            reason: "start must be before end",
        });
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(StoreError::LimitExceeded("timestamp outside supported range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(StoreError::LimitExceeded("span wider than 366 days"));
    }
    Ok(())
}

/// Fails with the id of the earliest committed booking overlapping `span`.
/// Caller must hold the resource's write lock for the result to stay true.
pub(crate) fn check_no_conflict(rs: &ResourceState, span: &Span) -> Result<(), StoreError> {
    match rs.overlapping(span).next() {
        Some(existing) => Err(StoreError::Conflict(existing.id)),
        None => Ok(()),
    }
}
