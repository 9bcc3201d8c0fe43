//! Request validation in front of the store.
//!
//! A raw request moves `Received → Validated → CommitAttempted` and ends
//! `Booked` or `Rejected`. Every rejection before `CommitAttempted` leaves
//! the store untouched; a commit attempt is made at most once.

use std::fmt;

use thiserror::Error;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;
use crate::store::{BookingStore, StoreError};
use crate::timestamp::parse_instant;

/// Raw booking request as it arrives from the transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingRequest {
    pub resource_id: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub requester_name: Option<String>,
    pub requester_contact: Option<String>,
    pub requester_role: Option<String>,
    pub reason: Option<String>,
}

pub type BookingResult = Result<Booking, BookingError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldProblem {
    Missing,
    Malformed,
    TooLong,
}

impl fmt::Display for FieldProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FieldProblem::Missing => "missing",
            FieldProblem::Malformed => "malformed",
            FieldProblem::TooLong => "too long",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field} is {problem}")]
pub struct FieldError {
    pub field: &'static str,
    pub problem: FieldProblem,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BookingError {
    #[error("invalid interval: {0}")]
    InvalidInterval(String),
    #[error("invalid request: {}", join_fields(.0))]
    Validation(Vec<FieldError>),
    #[error("resource not found: {0}")]
    ResourceNotFound(ResourceId),
    #[error("slot occupied by booking {conflicting}")]
    SlotOccupied { conflicting: Ulid },
    #[error("resource {0} is busy, try again")]
    Busy(ResourceId),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

fn join_fields(fields: &[FieldError]) -> String {
    fields
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl BookingError {
    /// Label used for the `outcome` metric.
    pub fn outcome(&self) -> &'static str {
        match self {
            BookingError::InvalidInterval(_) => "invalid_interval",
            BookingError::Validation(_) => "validation_error",
            BookingError::ResourceNotFound(_) => "resource_not_found",
            BookingError::SlotOccupied { .. } => "slot_occupied",
            BookingError::Busy(_) => "busy",
            BookingError::LimitExceeded(_) => "limit_exceeded",
            BookingError::StoreUnavailable(_) => "store_unavailable",
        }
    }

    /// Retrying the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, BookingError::Busy(_) | BookingError::StoreUnavailable(_))
    }
}

impl From<StoreError> for BookingError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => BookingError::ResourceNotFound(id),
            StoreError::Conflict(conflicting) => BookingError::SlotOccupied { conflicting },
            StoreError::InvalidInterval { reason, .. } => {
                BookingError::InvalidInterval(reason.to_string())
            }
            StoreError::Busy { resource_id, .. } => BookingError::Busy(resource_id),
            StoreError::LimitExceeded(what) => BookingError::LimitExceeded(what),
            e @ (StoreError::BookingNotFound(_)
            | StoreError::WalError(_)
            | StoreError::Io(_)
            | StoreError::Closed) => BookingError::StoreUnavailable(e.to_string()),
        }
    }
}

/// A request that passed validation and is ready for one commit attempt.
struct ValidRequest {
    resource_id: ResourceId,
    span: Span,
    payload: BookingPayload,
}

pub struct BookingService {
    store: BookingStore,
}

impl BookingService {
    pub fn new(store: BookingStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &BookingStore {
        &self.store
    }

    pub async fn close(&self) -> Result<(), StoreError> {
        self.store.close().await
    }

    /// Validate a raw request and make exactly one commit attempt.
    pub async fn request_booking(&self, request: BookingRequest) -> BookingResult {
        let result = match validate(request) {
            Ok(valid) => self
                .store
                .try_commit(&valid.resource_id, valid.span, valid.payload)
                .await
                .map_err(BookingError::from),
            Err(e) => Err(e),
        };

        let outcome = match &result {
            Ok(booking) => {
                info!(
                    "booked {} on {} for {}",
                    booking.id, booking.resource_id, booking.requester.name
                );
                "booked"
            }
            Err(e) if e.is_transient() => {
                warn!("booking rejected: {e}");
                e.outcome()
            }
            Err(e) => {
                debug!("booking rejected: {e}");
                e.outcome()
            }
        };
        metrics::counter!(observability::BOOKING_REQUESTS_TOTAL, "outcome" => outcome)
            .increment(1);
        result
    }
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn parse_span(request: &BookingRequest) -> Result<Span, BookingError> {
    let instant = |value: &Option<String>, field: &str| -> Result<Ms, BookingError> {
        let raw = present(value)
            .ok_or_else(|| BookingError::InvalidInterval(format!("{field} is missing")))?;
        parse_instant(raw)
            .ok_or_else(|| BookingError::InvalidInterval(format!("{field} {raw:?} is not a timestamp")))
    };
    let start = instant(&request.start, "start")?;
    let end = instant(&request.end, "end")?;
    Span::checked(start, end)
        .ok_or_else(|| BookingError::InvalidInterval("start must be before end".into()))
}

/// Loose `local@domain` shape check.
fn looks_like_email(s: &str) -> bool {
    match s.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.is_empty()
                && !domain.contains('@')
                && !s.chars().any(char::is_whitespace)
        }
        None => false,
    }
}

fn validate(request: BookingRequest) -> Result<ValidRequest, BookingError> {
    let span = parse_span(&request)?;

    let mut problems = Vec::new();
    let mut required = |field: &'static str, value: &Option<String>, max: usize| {
        match present(value) {
            None => problems.push(FieldError {
                field,
                problem: FieldProblem::Missing,
            }),
            Some(v) if v.len() > max => problems.push(FieldError {
                field,
                problem: FieldProblem::TooLong,
            }),
            Some(_) => {}
        }
        present(value).unwrap_or_default().to_string()
    };
    let resource_id = required("resource_id", &request.resource_id, MAX_RESOURCE_ID_LEN);
    let name = required("requester_name", &request.requester_name, MAX_NAME_LEN);
    let contact = required("requester_contact", &request.requester_contact, MAX_CONTACT_LEN);
    let role = required("requester_role", &request.requester_role, MAX_ROLE_LEN);

    if !contact.is_empty() && contact.len() <= MAX_CONTACT_LEN && !looks_like_email(&contact) {
        problems.push(FieldError {
            field: "requester_contact",
            problem: FieldProblem::Malformed,
        });
    }
    let reason = present(&request.reason).map(str::to_string);
    if reason.as_ref().is_some_and(|r| r.len() > MAX_REASON_LEN) {
        problems.push(FieldError {
            field: "reason",
            problem: FieldProblem::TooLong,
        });
    }
    if !problems.is_empty() {
        return Err(BookingError::Validation(problems));
    }

    Ok(ValidRequest {
        resource_id: ResourceId::new(resource_id),
        span,
        payload: BookingPayload {
            requester: Requester {
                name,
                contact,
                role: Role::from(role),
            },
            reason,
        },
    })
}
