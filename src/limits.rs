use crate::model::{DAY_MS, Ms};

// Hard ceilings applied before anything reaches the WAL.

pub const MAX_TENANTS: usize = 10_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_NOTES_LEN: usize = 2_000;
pub const MAX_SERVICES_PER_APPOINTMENT: usize = 20;
pub const MAX_LINK_ALLOW_LIST: usize = 500;
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;
pub const MAX_TOKEN_LEN: usize = 128;

/// Generated booking-link tokens are this many alphanumeric characters.
pub const LINK_TOKEN_LEN: usize = 32;

/// A single service may not run longer than a day.
pub const MAX_SERVICE_DURATION_MIN: u32 = 24 * 60;
pub const MAX_BUFFER_MIN: u32 = 24 * 60;
pub const MAX_CANCELLATION_HOURS: u32 = 24 * 365;
/// ±18h covers every real-world zone.
pub const MAX_UTC_OFFSET_MIN: i32 = 18 * 60;

pub const MAX_AMOUNT_CENTS: i64 = 100_000_000_000;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// Appointments longer than this are rejected outright.
pub const MAX_APPOINTMENT_DURATION_MS: Ms = DAY_MS;
