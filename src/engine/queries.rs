use std::collections::BTreeSet;

use chrono::{Datelike, NaiveDate, NaiveTime, Weekday};
use ulid::Ulid;

use crate::model::*;

use super::availability::open_slots;
use super::conflict::{self, checked_span};
use super::{Engine, EngineError, SharedTrainerState};

impl Engine {
    /// Check a slot against one trainer's calendar without booking it.
    /// `day` defaults to the weekday of `start`; `exclude` names a commitment
    /// or booking to ignore in the overlap check.
    pub async fn validate_slot(
        &self,
        trainer_id: Ulid,
        start: Stamp,
        end: Stamp,
        day: Option<Weekday>,
        exclude: Option<Ulid>,
    ) -> Result<(), EngineError> {
        let span = checked_span(start, end)?;
        let ts = self.trainer_state(&trainer_id)?;
        let guard = ts.read().await;
        conflict::validate_slot(&guard, &span, day.unwrap_or(span.weekday()), exclude)
    }

    /// Trainers free for the whole of `start..end` on `date`: some window on
    /// that weekday encloses it and no commitment overlaps it.
    pub async fn find_available(
        &self,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
    ) -> Result<BTreeSet<Ulid>, EngineError> {
        if start >= end {
            return Err(EngineError::InvalidRange);
        }
        let span = checked_span(date.and_time(start), date.and_time(end))?;
        let day = date.weekday();

        let mut found = BTreeSet::new();
        for (trainer_id, ts) in self.trainers() {
            let guard = ts.read().await;
            if conflict::validate_slot(&guard, &span, day, None).is_ok() {
                found.insert(trainer_id);
            }
        }
        Ok(found)
    }

    pub async fn open_slots(
        &self,
        trainer_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<Span>, EngineError> {
        let ts = self.trainer_state(&trainer_id)?;
        let guard = ts.read().await;
        Ok(open_slots(&guard, date))
    }

    /// Weekly schedule ordered by weekday, then start time.
    pub async fn get_windows(
        &self,
        trainer_id: Ulid,
    ) -> Result<Vec<AvailabilityWindow>, EngineError> {
        let ts = self.trainer_state(&trainer_id)?;
        let guard = ts.read().await;
        let mut windows = guard.windows.clone();
        windows.sort_by_key(|w| (w.day.num_days_from_monday(), w.start, w.end));
        Ok(windows)
    }

    /// Commitments ordered by start, optionally limited to those overlapping `from..to`.
    pub async fn get_commitments(
        &self,
        trainer_id: Ulid,
        from: Option<Stamp>,
        to: Option<Stamp>,
    ) -> Result<Vec<Commitment>, EngineError> {
        let ts = self.trainer_state(&trainer_id)?;
        let guard = ts.read().await;
        Ok(guard
            .commitments
            .iter()
            .filter(|c| from.is_none_or(|f| c.span.end > f) && to.is_none_or(|t| c.span.start < t))
            .cloned()
            .collect())
    }

    pub async fn get_commitment(&self, id: Ulid) -> Result<Commitment, EngineError> {
        let trainer_id = self.get_trainer_for_entity(&id).ok_or(EngineError::NotFound(id))?;
        let ts = self.trainer_state(&trainer_id)?;
        let guard = ts.read().await;
        guard.commitment(id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Bookings matching `filter`, ordered by start.
    pub async fn get_bookings(&self, filter: &BookingFilter) -> Vec<Booking> {
        let trainers: Vec<SharedTrainerState> = match filter.trainer_id {
            Some(id) => self.get_trainer(&id).into_iter().collect(),
            None => self.trainers().into_iter().map(|(_, ts)| ts).collect(),
        };

        let mut out = Vec::new();
        for ts in trainers {
            let guard = ts.read().await;
            out.extend(guard.bookings.values().filter(|b| filter.matches(b)).cloned());
        }
        out.sort_by_key(|b| (b.span.start, b.id));
        out
    }

    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let trainer_id = self.get_trainer_for_entity(&id).ok_or(EngineError::NotFound(id))?;
        let ts = self.trainer_state(&trainer_id)?;
        let guard = ts.read().await;
        guard.bookings.get(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    pub async fn trainer_info(&self, id: Ulid) -> Result<TrainerInfo, EngineError> {
        let ts = self.trainer_state(&id)?;
        let guard = ts.read().await;
        Ok(guard.info())
    }

    pub async fn list_trainers(&self, filter: &TrainerFilter) -> Vec<TrainerInfo> {
        let mut out = Vec::new();
        for (_, ts) in self.trainers() {
            let info = ts.read().await.info();
            if filter.matches(&info) {
                out.push(info);
            }
        }
        out
    }

    /// Earliest session starting at or after `now`. A session claimed by a
    /// confirmed booking is reported together with that booking. Cancelled
    /// sessions are skipped.
    pub async fn next_session(
        &self,
        trainer_id: Ulid,
        now: Stamp,
    ) -> Result<Option<NextSession>, EngineError> {
        let ts = self.trainer_state(&trainer_id)?;
        let guard = ts.read().await;
        let from = guard.commitments.partition_point(|c| c.span.start < now);
        let Some(session) = guard.commitments[from..]
            .iter()
            .find(|c| c.status != CommitmentStatus::Cancelled)
        else {
            return Ok(None);
        };
        let booking = session
            .booking_id
            .and_then(|id| guard.bookings.get(&id))
            .filter(|b| b.status == BookingStatus::Confirmed);
        Ok(Some(match booking {
            Some(b) => NextSession::Booking(b.clone(), session.clone()),
            None => NextSession::Session(session.clone()),
        }))
    }

    pub fn get_user(&self, id: &Ulid) -> Option<UserInfo> {
        self.users.get(id).map(|u| u.value().clone())
    }

    pub fn find_user(&self, username: &str) -> Option<UserInfo> {
        let id = *self.usernames.get(username)?.value();
        self.get_user(&id)
    }

    /// Snapshot of the trainer map in id order, so no DashMap shard lock is
    /// held across an await.
    fn trainers(&self) -> Vec<(Ulid, SharedTrainerState)> {
        let mut all: Vec<_> = self.state.iter().map(|e| (*e.key(), e.value().clone())).collect();
        all.sort_by_key(|(id, _)| *id);
        all
    }
}
