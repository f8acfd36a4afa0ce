use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Wall-clock instant in the configured zone. The only instant type.
pub type Stamp = NaiveDateTime;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Stamp,
    pub end: Stamp,
}

impl Span {
    pub fn new(start: Stamp, end: Stamp) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// `date` at `start..end` time of day.
    pub fn on(date: NaiveDate, start: NaiveTime, end: NaiveTime) -> Self {
        Self::new(date.and_time(start), date.and_time(end))
    }

    pub fn duration(&self) -> TimeDelta {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn weekday(&self) -> Weekday {
        self.start.weekday()
    }

    pub fn is_single_day(&self) -> bool {
        self.start.date() == self.end.date()
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

// ── Users ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Admin,
    Trainer,
    Client,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Trainer => "trainer",
            Role::Client => "client",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "trainer" => Ok(Role::Trainer),
            "client" | "user" => Ok(Role::Client),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: Ulid,
    pub username: String,
    pub role: Role,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainerProfile {
    pub specialties: Option<String>,
    pub bio: Option<String>,
    pub experience_years: u32,
}

// ── Availability ─────────────────────────────────────────────────

/// Recurring weekly window during which a trainer may be booked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityWindow {
    pub id: Ulid,
    pub trainer_id: Ulid,
    pub day: Weekday,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl AvailabilityWindow {
    /// True if the window lies on the span's weekday and its time of day
    /// encloses the span. Windows never cover spans crossing midnight.
    pub fn covers(&self, span: &Span, day: Weekday) -> bool {
        self.day == day
            && span.is_single_day()
            && self.start <= span.start.time()
            && self.end >= span.end.time()
    }

    /// The window projected onto a concrete date.
    pub fn on(&self, date: NaiveDate) -> Span {
        Span::on(date, self.start, self.end)
    }
}

/// Caller-supplied window without identity, as passed to a full replace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSpec {
    pub day: Weekday,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

// ── Commitments ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommitmentStatus {
    Pending,
    Confirmed,
    Completed,
    Cancelled,
    Absent,
}

impl CommitmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommitmentStatus::Pending => "pending",
            CommitmentStatus::Confirmed => "confirmed",
            CommitmentStatus::Completed => "completed",
            CommitmentStatus::Cancelled => "cancelled",
            CommitmentStatus::Absent => "absent",
        }
    }

    /// Still expecting the trainer to show up.
    pub fn is_open(&self) -> bool {
        matches!(self, CommitmentStatus::Pending | CommitmentStatus::Confirmed)
    }
}

impl FromStr for CommitmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(CommitmentStatus::Pending),
            "confirmed" => Ok(CommitmentStatus::Confirmed),
            "completed" => Ok(CommitmentStatus::Completed),
            "cancelled" => Ok(CommitmentStatus::Cancelled),
            "absent" => Ok(CommitmentStatus::Absent),
            other => Err(format!("unknown commitment status: {other}")),
        }
    }
}

/// A concrete interval during which a trainer is occupied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commitment {
    pub id: Ulid,
    pub trainer_id: Ulid,
    pub span: Span,
    pub label: String,
    pub location: Option<String>,
    pub notes: Option<String>,
    pub feedback: Option<String>,
    pub status: CommitmentStatus,
    /// Set when the commitment was derived from a confirmed booking.
    pub booking_id: Option<Ulid>,
}

/// A session the trainer schedules directly, before validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitmentDraft {
    pub id: Ulid,
    pub trainer_id: Ulid,
    pub start: Stamp,
    pub end: Stamp,
    pub label: String,
    pub location: Option<String>,
    pub notes: Option<String>,
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    CancelledByUser,
    CancelledByTrainer,
    Completed,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::CancelledByUser => "cancelled_by_user",
            BookingStatus::CancelledByTrainer => "cancelled_by_trainer",
            BookingStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(BookingStatus::Pending),
            "confirmed" => Ok(BookingStatus::Confirmed),
            "cancelled_by_user" => Ok(BookingStatus::CancelledByUser),
            "cancelled_by_trainer" => Ok(BookingStatus::CancelledByTrainer),
            "completed" => Ok(BookingStatus::Completed),
            other => Err(format!("unknown booking status: {other}")),
        }
    }
}

/// A client-initiated request for a trainer's time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub client_id: Ulid,
    pub trainer_id: Ulid,
    pub span: Span,
    pub status: BookingStatus,
    pub notes: Option<String>,
    pub linked_commitment: Option<Ulid>,
}

impl Booking {
    /// Label of the session this booking claims, kept in step with the notes.
    pub fn session_label(&self) -> String {
        let title = self.notes.as_deref().unwrap_or("Session");
        format!("Booking: {} - {title}", self.id)
    }
}

/// Field changes requested for an existing booking. `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingPatch {
    pub trainer_id: Option<Ulid>,
    pub start: Option<Stamp>,
    pub end: Option<Stamp>,
    pub notes: Option<String>,
}

impl BookingPatch {
    /// Changes that require the slot to be validated again.
    pub fn moves_slot(&self) -> bool {
        self.trainer_id.is_some() || self.start.is_some() || self.end.is_some()
    }
}

// ── Per-trainer aggregate ────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TrainerState {
    pub id: Ulid,
    pub username: String,
    pub profile: TrainerProfile,
    pub windows: Vec<AvailabilityWindow>,
    /// Sorted by `span.start`.
    pub commitments: Vec<Commitment>,
    pub bookings: HashMap<Ulid, Booking>,
}

impl TrainerState {
    pub fn new(id: Ulid, username: String) -> Self {
        Self {
            id,
            username,
            profile: TrainerProfile::default(),
            windows: Vec::new(),
            commitments: Vec::new(),
            bookings: HashMap::new(),
        }
    }

    /// Insert commitment maintaining sort order by span.start.
    pub fn insert_commitment(&mut self, commitment: Commitment) {
        let pos = self
            .commitments
            .binary_search_by_key(&commitment.span.start, |c| c.span.start)
            .unwrap_or_else(|e| e);
        self.commitments.insert(pos, commitment);
    }

    pub fn remove_commitment(&mut self, id: Ulid) -> Option<Commitment> {
        let pos = self.commitments.iter().position(|c| c.id == id)?;
        Some(self.commitments.remove(pos))
    }

    pub fn commitment(&self, id: Ulid) -> Option<&Commitment> {
        self.commitments.iter().find(|c| c.id == id)
    }

    pub fn commitment_mut(&mut self, id: Ulid) -> Option<&mut Commitment> {
        self.commitments.iter_mut().find(|c| c.id == id)
    }

    /// Return only commitments whose span overlaps the query window.
    /// Uses binary search to skip commitments starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Commitment> {
        let right_bound = self
            .commitments
            .partition_point(|c| c.span.start < query.end);
        self.commitments[..right_bound]
            .iter()
            .filter(move |c| c.span.end > query.start)
    }

    pub fn windows_on(&self, day: Weekday) -> impl Iterator<Item = &AvailabilityWindow> {
        self.windows.iter().filter(move |w| w.day == day)
    }

    pub fn info(&self) -> TrainerInfo {
        TrainerInfo {
            id: self.id,
            username: self.username.clone(),
            specialties: self.profile.specialties.clone(),
            bio: self.profile.bio.clone(),
            experience_years: self.profile.experience_years,
        }
    }
}

/// Everything that changes state. This is also the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UserRegistered {
        id: Ulid,
        username: String,
        role: Role,
    },
    ProfileUpdated {
        trainer_id: Ulid,
        profile: TrainerProfile,
    },
    AvailabilityReplaced {
        trainer_id: Ulid,
        windows: Vec<AvailabilityWindow>,
    },
    WindowAdded {
        window: AvailabilityWindow,
    },
    WindowRemoved {
        id: Ulid,
        trainer_id: Ulid,
    },
    CommitmentScheduled {
        commitment: Commitment,
    },
    CommitmentRescheduled {
        id: Ulid,
        trainer_id: Ulid,
        span: Span,
    },
    CommitmentStatusSet {
        id: Ulid,
        trainer_id: Ulid,
        status: CommitmentStatus,
        feedback: Option<String>,
    },
    CommitmentRemoved {
        id: Ulid,
        trainer_id: Ulid,
    },
    BookingCreated {
        booking: Booking,
    },
    /// Full replacement of a booking record. A linked commitment follows
    /// the booking's new span and trainer.
    BookingUpdated {
        booking: Booking,
        from_trainer: Ulid,
    },
    /// Status change plus its commitment side effect, as one record.
    BookingTransitioned {
        id: Ulid,
        trainer_id: Ulid,
        status: BookingStatus,
        created: Option<Commitment>,
        released: Option<Ulid>,
    },
    BookingDeleted {
        id: Ulid,
        trainer_id: Ulid,
    },
}

impl Event {
    /// The trainer aggregate this event applies to. `None` for user registration.
    pub fn trainer_id(&self) -> Option<Ulid> {
        match self {
            Event::UserRegistered { .. } => None,
            Event::ProfileUpdated { trainer_id, .. }
            | Event::AvailabilityReplaced { trainer_id, .. }
            | Event::WindowRemoved { trainer_id, .. }
            | Event::CommitmentRescheduled { trainer_id, .. }
            | Event::CommitmentStatusSet { trainer_id, .. }
            | Event::CommitmentRemoved { trainer_id, .. }
            | Event::BookingTransitioned { trainer_id, .. }
            | Event::BookingDeleted { trainer_id, .. } => Some(*trainer_id),
            Event::WindowAdded { window } => Some(window.trainer_id),
            Event::CommitmentScheduled { commitment } => Some(commitment.trainer_id),
            Event::BookingCreated { booking } | Event::BookingUpdated { booking, .. } => {
                Some(booking.trainer_id)
            }
        }
    }

    /// JSON rendering used for notification payloads.
    pub fn to_payload(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}"))
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainerInfo {
    pub id: Ulid,
    pub username: String,
    pub specialties: Option<String>,
    pub bio: Option<String>,
    pub experience_years: u32,
}

/// Filter for booking listings. Empty filter lists everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingFilter {
    pub trainer_id: Option<Ulid>,
    pub client_id: Option<Ulid>,
    pub status: Option<BookingStatus>,
    /// Bookings starting on or after this date.
    pub from_date: Option<NaiveDate>,
    /// Bookings ending on or before this date.
    pub to_date: Option<NaiveDate>,
}

impl BookingFilter {
    pub fn matches(&self, booking: &Booking) -> bool {
        self.trainer_id.is_none_or(|t| booking.trainer_id == t)
            && self.client_id.is_none_or(|c| booking.client_id == c)
            && self.status.is_none_or(|s| booking.status == s)
            && self.from_date.is_none_or(|d| booking.span.start.date() >= d)
            && self.to_date.is_none_or(|d| booking.span.end.date() <= d)
    }
}

/// Trainer directory search. Text fields match case-insensitive substrings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrainerFilter {
    pub specialty: Option<String>,
    pub username: Option<String>,
    pub experience_years: Option<u32>,
}

impl TrainerFilter {
    pub fn matches(&self, trainer: &TrainerInfo) -> bool {
        let contains = |haystack: &str, needle: &str| {
            haystack.to_lowercase().contains(&needle.to_lowercase())
        };
        self.specialty
            .as_deref()
            .is_none_or(|s| trainer.specialties.as_deref().is_some_and(|have| contains(have, s)))
            && self.username.as_deref().is_none_or(|u| contains(&trainer.username, u))
            && self.experience_years.is_none_or(|y| trainer.experience_years == y)
    }
}

/// A trainer's next piece of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextSession {
    /// A confirmed booking, reported with the session it claimed.
    Booking(Booking, Commitment),
    /// A session scheduled directly by the trainer.
    Session(Commitment),
}

impl NextSession {
    pub fn session(&self) -> &Commitment {
        match self {
            NextSession::Booking(_, c) | NextSession::Session(c) => c,
        }
    }
}

/// Parse a full English weekday name (`Monday`), case-insensitive.
pub fn parse_weekday(s: &str) -> Result<Weekday, String> {
    s.trim()
        .parse::<Weekday>()
        .map_err(|_| format!("bad day_of_week: {s}"))
}

pub fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}
