use chrono::{FixedOffset, TimeDelta, Utc, Weekday};
use ulid::Ulid;

use crate::model::*;

use super::EngineError;

/// Current wall-clock time in the configured zone.
pub(crate) fn now_local(offset: FixedOffset) -> Stamp {
    Utc::now().with_timezone(&offset).naive_local()
}

/// Build a span from raw bounds, rejecting inverted/empty ranges before anything
/// else looks at them.
pub(crate) fn checked_span(start: Stamp, end: Stamp) -> Result<Span, EngineError> {
    use crate::limits::*;
    if start >= end {
        return Err(EngineError::InvalidRange);
    }
    if start.date() < min_valid_date() || end.date() > max_valid_date() {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if end - start > TimeDelta::minutes(MAX_SPAN_MINUTES) {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(Span::new(start, end))
}

pub(crate) fn check_min_duration(span: &Span) -> Result<(), EngineError> {
    let minimum_minutes = crate::limits::MIN_BOOKING_MINUTES;
    if span.duration() < TimeDelta::minutes(minimum_minutes) {
        return Err(EngineError::DurationTooShort { minimum_minutes });
    }
    Ok(())
}

pub(crate) fn check_within_availability(
    ts: &TrainerState,
    span: &Span,
    day: Weekday,
) -> Result<(), EngineError> {
    if ts.windows_on(day).any(|w| w.covers(span, day)) {
        Ok(())
    } else {
        Err(EngineError::OutsideAvailability)
    }
}

/// Strict open-interval overlap against every commitment of the trainer.
/// `exclude` skips the commitment with that id, or the one owned by the booking with that id.
pub(crate) fn check_no_overlap(
    ts: &TrainerState,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    for commitment in ts.overlapping(span) {
        if let Some(ex) = exclude
            && (commitment.id == ex || commitment.booking_id == Some(ex))
        {
            continue;
        }
        return Err(EngineError::Overlap(commitment.id));
    }
    Ok(())
}

/// Availability containment first, then overlap.
pub(crate) fn validate_slot(
    ts: &TrainerState,
    span: &Span,
    day: Weekday,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    check_within_availability(ts, span, day)?;
    check_no_overlap(ts, span, exclude)
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, NaiveTime};

    use super::*;

    fn monday(h: u32, m: u32) -> Stamp {
        NaiveDate::from_ymd_opt(2024, 6, 3)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn trainer_with_window(day: Weekday, start: NaiveTime, end: NaiveTime) -> TrainerState {
        let mut ts = TrainerState::new(Ulid::new(), "coach".into());
        ts.windows.push(AvailabilityWindow {
            id: Ulid::new(),
            trainer_id: ts.id,
            day,
            start,
            end,
        });
        ts
    }

    fn commit(ts: &mut TrainerState, start: Stamp, end: Stamp, booking_id: Option<Ulid>) -> Ulid {
        let id = Ulid::new();
        ts.insert_commitment(Commitment {
            id,
            trainer_id: ts.id,
            span: Span::new(start, end),
            label: "session".into(),
            location: None,
            notes: None,
            feedback: None,
            status: CommitmentStatus::Confirmed,
            booking_id,
        });
        id
    }

    #[test]
    fn checked_span_rejects_inverted_and_empty() {
        assert_eq!(checked_span(monday(10, 0), monday(9, 0)), Err(EngineError::InvalidRange));
        assert_eq!(checked_span(monday(10, 0), monday(10, 0)), Err(EngineError::InvalidRange));
        assert!(checked_span(monday(9, 0), monday(10, 0)).is_ok());
    }

    #[test]
    fn checked_span_rejects_multi_day() {
        let start = monday(9, 0);
        let end = start + TimeDelta::days(2);
        assert!(matches!(checked_span(start, end), Err(EngineError::LimitExceeded(_))));
    }

    #[test]
    fn min_duration_boundary() {
        assert!(check_min_duration(&Span::new(monday(9, 0), monday(9, 15))).is_ok());
        assert_eq!(
            check_min_duration(&Span::new(monday(9, 0), monday(9, 14))),
            Err(EngineError::DurationTooShort { minimum_minutes: 15 })
        );
    }

    #[test]
    fn interval_equal_to_window_is_contained() {
        let ts = trainer_with_window(Weekday::Mon, t(9, 0), t(17, 0));
        let span = Span::new(monday(9, 0), monday(17, 0));
        assert!(validate_slot(&ts, &span, Weekday::Mon, None).is_ok());
    }

    #[test]
    fn one_minute_outside_window_fails() {
        let ts = trainer_with_window(Weekday::Mon, t(9, 0), t(17, 0));
        let early = Span::new(monday(8, 59), monday(17, 0));
        let late = Span::new(monday(9, 0), monday(17, 1));
        assert_eq!(
            validate_slot(&ts, &early, Weekday::Mon, None),
            Err(EngineError::OutsideAvailability)
        );
        assert_eq!(
            validate_slot(&ts, &late, Weekday::Mon, None),
            Err(EngineError::OutsideAvailability)
        );
    }

    #[test]
    fn wrong_day_fails() {
        let ts = trainer_with_window(Weekday::Tue, t(9, 0), t(17, 0));
        let span = Span::new(monday(10, 0), monday(11, 0));
        assert_eq!(
            validate_slot(&ts, &span, Weekday::Mon, None),
            Err(EngineError::OutsideAvailability)
        );
    }

    #[test]
    fn any_one_window_suffices() {
        let mut ts = trainer_with_window(Weekday::Mon, t(9, 0), t(10, 0));
        ts.windows.push(AvailabilityWindow {
            id: Ulid::new(),
            trainer_id: ts.id,
            day: Weekday::Mon,
            start: t(12, 0),
            end: t(18, 0),
        });
        let span = Span::new(monday(13, 0), monday(14, 0));
        assert!(validate_slot(&ts, &span, Weekday::Mon, None).is_ok());
        // Spanning the gap between two windows is not contained by either.
        let gap = Span::new(monday(9, 30), monday(12, 30));
        assert_eq!(
            validate_slot(&ts, &gap, Weekday::Mon, None),
            Err(EngineError::OutsideAvailability)
        );
    }

    #[test]
    fn back_to_back_is_not_overlap() {
        let mut ts = trainer_with_window(Weekday::Mon, t(8, 0), t(17, 0));
        commit(&mut ts, monday(9, 0), monday(10, 0), None);
        let next = Span::new(monday(10, 0), monday(11, 0));
        assert!(validate_slot(&ts, &next, Weekday::Mon, None).is_ok());
        let before = Span::new(monday(8, 0), monday(9, 0));
        assert!(check_no_overlap(&ts, &before, None).is_ok());
    }

    #[test]
    fn one_minute_overlap_conflicts() {
        let mut ts = trainer_with_window(Weekday::Mon, t(9, 0), t(17, 0));
        let existing = commit(&mut ts, monday(9, 0), monday(10, 0), None);
        let span = Span::new(monday(9, 59), monday(10, 30));
        assert_eq!(
            validate_slot(&ts, &span, Weekday::Mon, None),
            Err(EngineError::Overlap(existing))
        );
    }

    #[test]
    fn availability_checked_before_overlap() {
        let mut ts = trainer_with_window(Weekday::Mon, t(9, 0), t(12, 0));
        commit(&mut ts, monday(11, 0), monday(13, 0), None);
        let span = Span::new(monday(11, 30), monday(12, 30));
        assert_eq!(
            validate_slot(&ts, &span, Weekday::Mon, None),
            Err(EngineError::OutsideAvailability)
        );
    }

    #[test]
    fn exclude_by_commitment_or_booking_id() {
        let mut ts = trainer_with_window(Weekday::Mon, t(9, 0), t(17, 0));
        let booking = Ulid::new();
        let cid = commit(&mut ts, monday(10, 0), monday(11, 0), Some(booking));
        let span = Span::new(monday(10, 30), monday(11, 30));

        assert_eq!(check_no_overlap(&ts, &span, None), Err(EngineError::Overlap(cid)));
        assert!(check_no_overlap(&ts, &span, Some(cid)).is_ok());
        assert!(check_no_overlap(&ts, &span, Some(booking)).is_ok());
        assert_eq!(
            check_no_overlap(&ts, &span, Some(Ulid::new())),
            Err(EngineError::Overlap(cid))
        );
    }

    #[test]
    fn validate_is_idempotent() {
        let mut ts = trainer_with_window(Weekday::Mon, t(9, 0), t(17, 0));
        commit(&mut ts, monday(12, 0), monday(13, 0), None);
        for span in [
            Span::new(monday(10, 0), monday(11, 0)),
            Span::new(monday(12, 30), monday(13, 30)),
            Span::new(monday(16, 0), monday(18, 0)),
        ] {
            let first = validate_slot(&ts, &span, Weekday::Mon, None);
            let second = validate_slot(&ts, &span, Weekday::Mon, None);
            assert_eq!(first, second);
        }
    }
}
