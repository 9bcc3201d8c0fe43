use crate::model::Ms;

pub const MAX_RESOURCE_ID_LEN: usize = 128;
pub const MAX_NAME_LEN: usize = 256;
/// RFC 5321 path limit.
pub const MAX_CONTACT_LEN: usize = 254;
pub const MAX_ROLE_LEN: usize = 64;
pub const MAX_REASON_LEN: usize = 4096;

pub const MAX_BOOKINGS_PER_RESOURCE: usize = 100_000;

/// 1970-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 9999-12-31T23:59:59.999Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;
/// One leap year.
pub const MAX_SPAN_DURATION_MS: Ms = 366 * 24 * 3_600_000;

pub const MAX_CATALOG_SIZE: usize = 10_000;
