//! Hard limits enforced by the engine and the tenant manager.

use chrono::NaiveDate;

/// Shortest bookable session.
pub const MIN_BOOKING_MINUTES: i64 = 15;

/// Longest single span (booking, session or query) in minutes: one day.
pub const MAX_SPAN_MINUTES: i64 = 24 * 60;

pub const MAX_USERS_PER_TENANT: usize = 100_000;
pub const MAX_WINDOWS_PER_TRAINER: usize = 500;
pub const MAX_COMMITMENTS_PER_TRAINER: usize = 50_000;
pub const MAX_BOOKINGS_PER_TRAINER: usize = 50_000;

pub const MAX_NAME_LEN: usize = 150;
pub const MAX_LABEL_LEN: usize = 255;
pub const MAX_NOTES_LEN: usize = 4096;

pub const MAX_TENANT_NAME_LEN: usize = 128;
pub const MAX_TENANTS: usize = 1024;

/// Commitments and bookings must fall inside this calendar range.
pub fn min_valid_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or(NaiveDate::MIN)
}

pub fn max_valid_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(9999, 12, 31).unwrap_or(NaiveDate::MAX)
}
