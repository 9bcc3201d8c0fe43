use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, UTC.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// `None` for zero-length or inverted ranges.
    pub fn checked(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn is_valid(&self) -> bool {
        self.start < self.end
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Opaque resource identifier handed out by the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Category {
    Room,
    Lab,
    Equipment,
    Other(String),
}

impl From<String> for Category {
    fn from(s: String) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "room" => Category::Room,
            "lab" => Category::Lab,
            "equipment" => Category::Equipment,
            _ => Category::Other(s.trim().to_string()),
        }
    }
}

impl From<Category> for String {
    fn from(c: Category) -> Self {
        c.to_string()
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Category::Room => f.write_str("Room"),
            Category::Lab => f.write_str("Lab"),
            Category::Equipment => f.write_str("Equipment"),
            Category::Other(s) => f.write_str(s),
        }
    }
}

/// A bookable thing. Owned by the catalog, never mutated here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub name: String,
    pub category: Category,
    #[serde(default)]
    pub capacity: Option<u32>,
    #[serde(default)]
    pub requirements: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Role {
    Teacher,
    Student,
    Other(String),
}

impl From<String> for Role {
    fn from(s: String) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "teacher" => Role::Teacher,
            "student" => Role::Student,
            _ => Role::Other(s.trim().to_string()),
        }
    }
}

impl From<Role> for String {
    fn from(r: Role) -> Self {
        r.to_string()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Teacher => f.write_str("Teacher"),
            Role::Student => f.write_str("Student"),
            Role::Other(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requester {
    pub name: String,
    /// Email address.
    pub contact: String,
    pub role: Role,
}

/// Everything about a booking except what the store assigns on commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingPayload {
    pub requester: Requester,
    pub reason: Option<String>,
}

/// A committed booking. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub resource_id: ResourceId,
    pub span: Span,
    pub requester: Requester,
    pub reason: Option<String>,
}

/// Committed bookings of one resource, sorted by `span.start` and pairwise
/// non-overlapping.
#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: ResourceId,
    pub bookings: Vec<Booking>,
}

impl ResourceState {
    pub fn new(id: ResourceId) -> Self {
        Self {
            id,
            bookings: Vec::new(),
        }
    }

    /// Insert booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    /// Bookings whose span overlaps the query window.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        // Everything at index >= right_bound starts at or after query.end.
        let right_bound = self
            .bookings
            .partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }
}

/// WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BookingCommitted { booking: Booking },
    BookingCancelled { id: Ulid, resource_id: ResourceId },
}

impl Event {
    pub fn resource_id(&self) -> &ResourceId {
        match self {
            Event::BookingCommitted { booking } => &booking.resource_id,
            Event::BookingCancelled { resource_id, .. } => resource_id,
        }
    }
}
