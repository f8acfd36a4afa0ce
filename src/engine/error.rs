use ulid::Ulid;

use crate::model::BookingStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Start is not strictly before end.
    InvalidRange,
    /// No availability window on that weekday encloses the interval.
    OutsideAvailability,
    /// The interval overlaps this existing commitment.
    Overlap(Ulid),
    SelfBooking,
    InvalidTransition {
        from: BookingStatus,
        to: BookingStatus,
    },
    DurationTooShort {
        minimum_minutes: i64,
    },
    NotFound(Ulid),
    AlreadyExists(Ulid),
    NotATrainer(Ulid),
    /// Commitment is derived from a booking and only changes through it.
    OwnedByBooking(Ulid),
    Forbidden(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidRange => write!(f, "invalid range: start must be before end"),
            EngineError::OutsideAvailability => {
                write!(f, "trainer is not available during the requested slot")
            }
            EngineError::Overlap(id) => {
                write!(f, "trainer is already committed during this time: {id}")
            }
            EngineError::SelfBooking => write!(f, "trainers cannot book themselves"),
            EngineError::InvalidTransition { from, to } => {
                write!(f, "invalid booking transition: {from} -> {to}")
            }
            EngineError::DurationTooShort { minimum_minutes } => {
                write!(f, "booking must last at least {minimum_minutes} minutes")
            }
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::NotATrainer(id) => write!(f, "user is not a trainer: {id}"),
            EngineError::OwnedByBooking(id) => {
                write!(f, "commitment is managed by booking {id}")
            }
            EngineError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl EngineError {
    /// Short label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            EngineError::InvalidRange => "invalid_range",
            EngineError::OutsideAvailability => "outside_availability",
            EngineError::Overlap(_) => "overlap",
            EngineError::SelfBooking => "self_booking",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::DurationTooShort { .. } => "duration_too_short",
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::NotATrainer(_) => "not_a_trainer",
            EngineError::OwnedByBooking(_) => "owned_by_booking",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal_error",
        }
    }
}
