use chrono::TimeDelta;
use tokio::sync::oneshot;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{BOOKING_TRANSITIONS_TOTAL, SESSIONS_ABSENT_TOTAL, SLOT_REJECTIONS_TOTAL};
use crate::policy::{authorize, Action, Actor, Resource};

use super::conflict::{check_min_duration, checked_span, validate_slot};
use super::transition::{plan, Effect};
use super::{Engine, EngineError, SharedTrainerState, WalCommand};

fn rejected(trainer_id: Ulid, err: EngineError) -> EngineError {
    metrics::counter!(SLOT_REJECTIONS_TOTAL, "reason" => err.reason()).increment(1);
    tracing::debug!("slot rejected for trainer {trainer_id}: {err}");
    err
}

fn check_len(value: Option<&str>, max: usize, what: &'static str) -> Result<(), EngineError> {
    if value.is_some_and(|v| v.len() > max) {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

fn check_window(spec: &WindowSpec) -> Result<(), EngineError> {
    if spec.start >= spec.end {
        return Err(EngineError::InvalidRange);
    }
    Ok(())
}

/// How long after start an unattended session is considered missed:
/// half the session up to an hour long, thirty minutes beyond that.
pub(crate) fn absence_grace(span: &Span) -> TimeDelta {
    let duration = span.duration();
    if duration <= TimeDelta::minutes(60) {
        duration / 2
    } else {
        TimeDelta::minutes(30)
    }
}

/// The commitment a booking claims when it is confirmed.
fn booked_session(booking: &Booking) -> Commitment {
    Commitment {
        id: Ulid::new(),
        trainer_id: booking.trainer_id,
        span: booking.span,
        label: booking.session_label(),
        location: Some("booked session".into()),
        notes: booking.notes.clone(),
        feedback: None,
        status: CommitmentStatus::Confirmed,
        booking_id: Some(booking.id),
    }
}

/// Apply `patch` to `booking` after the actor check. Validates the new
/// range but not the trainer's calendar.
fn prepare_update(
    booking: &Booking,
    patch: &BookingPatch,
    actor: &Actor,
) -> Result<Booking, EngineError> {
    let action = if patch.moves_slot() { Action::Reschedule } else { Action::UpdateStatus };
    authorize(
        actor,
        action,
        &Resource::Booking { client_id: booking.client_id, trainer_id: booking.trainer_id },
    )?;

    let mut updated = booking.clone();
    if let Some(notes) = &patch.notes {
        updated.notes = Some(notes.clone());
    }
    if patch.moves_slot() {
        let trainer_id = patch.trainer_id.unwrap_or(booking.trainer_id);
        if trainer_id == booking.client_id {
            return Err(EngineError::SelfBooking);
        }
        let span = checked_span(
            patch.start.unwrap_or(booking.span.start),
            patch.end.unwrap_or(booking.span.end),
        )?;
        check_min_duration(&span)?;
        updated.trainer_id = trainer_id;
        updated.span = span;
    }
    Ok(updated)
}

impl Engine {
    // ── Users & profiles ─────────────────────────────────

    /// Register a user. Superusers are always stored as admins; trainers get
    /// an empty aggregate.
    pub async fn register_user(
        &self,
        id: Ulid,
        username: &str,
        role: Role,
        superuser: bool,
    ) -> Result<UserInfo, EngineError> {
        let username = username.trim();
        if username.is_empty() {
            return Err(EngineError::LimitExceeded("username must not be empty"));
        }
        if username.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("username too long"));
        }

        let _serial = self.registration.lock().await;
        if self.users.len() >= MAX_USERS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many users"));
        }
        if self.users.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if let Some(existing) = self.usernames.get(username) {
            return Err(EngineError::AlreadyExists(*existing.value()));
        }

        let role = if superuser { Role::Admin } else { role };
        let info = UserInfo { id, username: username.to_string(), role };
        let event = Event::UserRegistered { id, username: info.username.clone(), role };

        let _gate = self.commit_gate.read().await;
        self.wal_append(&event).await?;
        self.insert_user(info.clone());
        tracing::debug!("registered {} ({}) as {}", info.username, id, role.as_str());
        Ok(info)
    }

    pub async fn set_trainer_profile(
        &self,
        trainer_id: Ulid,
        profile: TrainerProfile,
    ) -> Result<(), EngineError> {
        check_len(profile.specialties.as_deref(), MAX_LABEL_LEN, "specialties too long")?;
        check_len(profile.bio.as_deref(), MAX_NOTES_LEN, "bio too long")?;

        let _gate = self.commit_gate.read().await;
        let ts = self.trainer_state(&trainer_id)?;
        let mut guard = ts.write().await;
        let event = Event::ProfileUpdated { trainer_id, profile };
        self.persist_and_apply(trainer_id, &mut guard, &event).await
    }

    // ── Availability ─────────────────────────────────────

    /// Replace the trainer's whole weekly schedule. Every window is checked
    /// before the old ones are discarded.
    pub async fn replace_availability(
        &self,
        trainer_id: Ulid,
        specs: Vec<WindowSpec>,
    ) -> Result<(), EngineError> {
        if specs.len() > MAX_WINDOWS_PER_TRAINER {
            return Err(EngineError::LimitExceeded("too many availability windows"));
        }
        for spec in &specs {
            check_window(spec)?;
        }

        let _gate = self.commit_gate.read().await;
        let ts = self.trainer_state(&trainer_id)?;
        let mut guard = ts.write().await;
        let windows: Vec<AvailabilityWindow> = specs
            .into_iter()
            .map(|s| AvailabilityWindow {
                id: Ulid::new(),
                trainer_id,
                day: s.day,
                start: s.start,
                end: s.end,
            })
            .collect();
        let count = windows.len();
        let event = Event::AvailabilityReplaced { trainer_id, windows };
        self.persist_and_apply(trainer_id, &mut guard, &event).await?;
        tracing::debug!("trainer {trainer_id}: weekly schedule replaced with {count} windows");
        Ok(())
    }

    pub async fn add_availability(
        &self,
        id: Ulid,
        trainer_id: Ulid,
        spec: WindowSpec,
    ) -> Result<(), EngineError> {
        check_window(&spec)?;

        let _gate = self.commit_gate.read().await;
        if self.entity_to_trainer.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let ts = self.trainer_state(&trainer_id)?;
        let mut guard = ts.write().await;
        if guard.windows.len() >= MAX_WINDOWS_PER_TRAINER {
            return Err(EngineError::LimitExceeded("too many availability windows"));
        }
        let window = AvailabilityWindow {
            id,
            trainer_id,
            day: spec.day,
            start: spec.start,
            end: spec.end,
        };
        let event = Event::WindowAdded { window };
        self.persist_and_apply(trainer_id, &mut guard, &event).await
    }

    pub async fn remove_availability(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let _gate = self.commit_gate.read().await;
        let (trainer_id, mut guard) = self.resolve_entity_write(&id).await?;
        if !guard.windows.iter().any(|w| w.id == id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::WindowRemoved { id, trainer_id };
        self.persist_and_apply(trainer_id, &mut guard, &event).await?;
        Ok(trainer_id)
    }

    // ── Directly scheduled sessions ──────────────────────

    pub async fn schedule_commitment(
        &self,
        draft: CommitmentDraft,
    ) -> Result<Commitment, EngineError> {
        let span = checked_span(draft.start, draft.end)?;
        if draft.label.len() > MAX_LABEL_LEN {
            return Err(EngineError::LimitExceeded("label too long"));
        }
        check_len(draft.location.as_deref(), MAX_LABEL_LEN, "location too long")?;
        check_len(draft.notes.as_deref(), MAX_NOTES_LEN, "notes too long")?;

        let _gate = self.commit_gate.read().await;
        if self.entity_to_trainer.contains_key(&draft.id) {
            return Err(EngineError::AlreadyExists(draft.id));
        }
        let trainer_id = draft.trainer_id;
        let ts = self.trainer_state(&trainer_id)?;
        let mut guard = ts.write().await;
        if guard.commitments.len() >= MAX_COMMITMENTS_PER_TRAINER {
            return Err(EngineError::LimitExceeded("too many sessions on trainer"));
        }
        validate_slot(&guard, &span, span.weekday(), None).map_err(|e| rejected(trainer_id, e))?;

        let commitment = Commitment {
            id: draft.id,
            trainer_id,
            span,
            label: draft.label,
            location: draft.location,
            notes: draft.notes,
            feedback: None,
            status: CommitmentStatus::Pending,
            booking_id: None,
        };
        let event = Event::CommitmentScheduled { commitment: commitment.clone() };
        self.persist_and_apply(trainer_id, &mut guard, &event).await?;
        Ok(commitment)
    }

    pub async fn reschedule_commitment(
        &self,
        id: Ulid,
        start: Stamp,
        end: Stamp,
    ) -> Result<Commitment, EngineError> {
        let span = checked_span(start, end)?;

        let _gate = self.commit_gate.read().await;
        let (trainer_id, mut guard) = self.resolve_entity_write(&id).await?;
        let current = guard.commitment(id).ok_or(EngineError::NotFound(id))?;
        if let Some(booking_id) = current.booking_id {
            return Err(EngineError::OwnedByBooking(booking_id));
        }
        validate_slot(&guard, &span, span.weekday(), Some(id))
            .map_err(|e| rejected(trainer_id, e))?;

        let event = Event::CommitmentRescheduled { id, trainer_id, span };
        self.persist_and_apply(trainer_id, &mut guard, &event).await?;
        guard.commitment(id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Status and feedback edits. The calendar is not re-checked.
    pub async fn set_commitment_status(
        &self,
        id: Ulid,
        status: Option<CommitmentStatus>,
        feedback: Option<String>,
    ) -> Result<Commitment, EngineError> {
        check_len(feedback.as_deref(), MAX_NOTES_LEN, "feedback too long")?;

        let _gate = self.commit_gate.read().await;
        let (trainer_id, mut guard) = self.resolve_entity_write(&id).await?;
        let current = guard.commitment(id).ok_or(EngineError::NotFound(id))?;
        let status = status.unwrap_or(current.status);

        let event = Event::CommitmentStatusSet { id, trainer_id, status, feedback };
        self.persist_and_apply(trainer_id, &mut guard, &event).await?;
        guard.commitment(id).cloned().ok_or(EngineError::NotFound(id))
    }

    pub async fn remove_commitment(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let _gate = self.commit_gate.read().await;
        let (trainer_id, mut guard) = self.resolve_entity_write(&id).await?;
        let current = guard.commitment(id).ok_or(EngineError::NotFound(id))?;
        if let Some(booking_id) = current.booking_id {
            return Err(EngineError::OwnedByBooking(booking_id));
        }
        let event = Event::CommitmentRemoved { id, trainer_id };
        self.persist_and_apply(trainer_id, &mut guard, &event).await?;
        Ok(trainer_id)
    }

    // ── Bookings ─────────────────────────────────────────

    /// New bookings start out pending and claim nothing until confirmed,
    /// but the slot must be free and inside the trainer's hours already.
    pub async fn create_booking(
        &self,
        id: Ulid,
        client_id: Ulid,
        trainer_id: Ulid,
        start: Stamp,
        end: Stamp,
        notes: Option<String>,
    ) -> Result<Booking, EngineError> {
        let span = checked_span(start, end)?;
        check_min_duration(&span)?;
        if client_id == trainer_id {
            return Err(EngineError::SelfBooking);
        }
        check_len(notes.as_deref(), MAX_NOTES_LEN, "notes too long")?;
        if !self.users.contains_key(&client_id) {
            return Err(EngineError::NotFound(client_id));
        }

        let _gate = self.commit_gate.read().await;
        if self.entity_to_trainer.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let ts = self.trainer_state(&trainer_id)?;
        let mut guard = ts.write().await;
        if guard.bookings.len() >= MAX_BOOKINGS_PER_TRAINER {
            return Err(EngineError::LimitExceeded("too many bookings on trainer"));
        }
        validate_slot(&guard, &span, span.weekday(), None).map_err(|e| rejected(trainer_id, e))?;

        let booking = Booking {
            id,
            client_id,
            trainer_id,
            span,
            status: BookingStatus::Pending,
            notes,
            linked_commitment: None,
        };
        let event = Event::BookingCreated { booking: booking.clone() };
        self.persist_and_apply(trainer_id, &mut guard, &event).await?;
        tracing::debug!("booking {id} created for trainer {trainer_id} at {span}");
        Ok(booking)
    }

    /// Edit notes, times or trainer. Slot changes are validated against the
    /// target trainer, ignoring the booking's own commitment, which moves
    /// along with it.
    pub async fn update_booking(
        &self,
        id: Ulid,
        patch: BookingPatch,
        actor: &Actor,
    ) -> Result<Booking, EngineError> {
        check_len(patch.notes.as_deref(), MAX_NOTES_LEN, "notes too long")?;

        let _gate = self.commit_gate.read().await;
        loop {
            let current = self.get_trainer_for_entity(&id).ok_or(EngineError::NotFound(id))?;
            let target = patch.trainer_id.unwrap_or(current);

            if target == current {
                let (trainer_id, mut guard) = self.resolve_booking_write(&id).await?;
                if trainer_id != target {
                    continue;
                }
                let booking = guard.bookings.get(&id).cloned().ok_or(EngineError::NotFound(id))?;
                let updated = prepare_update(&booking, &patch, actor)?;
                if patch.moves_slot() {
                    validate_slot(&guard, &updated.span, updated.span.weekday(), Some(id))
                        .map_err(|e| rejected(trainer_id, e))?;
                }
                let event =
                    Event::BookingUpdated { booking: updated.clone(), from_trainer: trainer_id };
                self.persist_and_apply(trainer_id, &mut guard, &event).await?;
                return Ok(updated);
            }

            let (mut from, mut to) = self.lock_pair(current, target).await?;
            let Some(booking) = from.bookings.get(&id).cloned() else {
                continue;
            };
            let updated = prepare_update(&booking, &patch, actor)?;
            if to.bookings.len() >= MAX_BOOKINGS_PER_TRAINER {
                return Err(EngineError::LimitExceeded("too many bookings on trainer"));
            }
            validate_slot(&to, &updated.span, updated.span.weekday(), None)
                .map_err(|e| rejected(target, e))?;

            let event = Event::BookingUpdated { booking: updated.clone(), from_trainer: current };
            self.persist_and_move(&mut from, &mut to, &event).await?;
            tracing::debug!("booking {id} moved from trainer {current} to {target}");
            return Ok(updated);
        }
    }

    /// Move a booking to `to`. Entering confirmed re-checks the slot and
    /// claims a commitment; leaving confirmed releases it. The status and
    /// the commitment change are one WAL record, so a failure leaves both
    /// untouched.
    pub async fn transition_booking(
        &self,
        id: Ulid,
        to: BookingStatus,
        actor: &Actor,
    ) -> Result<Booking, EngineError> {
        let _gate = self.commit_gate.read().await;
        let (trainer_id, mut guard) = self.resolve_booking_write(&id).await?;
        let booking = guard.bookings.get(&id).cloned().ok_or(EngineError::NotFound(id))?;
        authorize(
            actor,
            Action::UpdateStatus,
            &Resource::Booking { client_id: booking.client_id, trainer_id },
        )?;

        let effect =
            plan(booking.status, to).inspect_err(|e| tracing::debug!("booking {id}: {e}"))?;
        let (created, released) = match effect {
            Effect::Unchanged => return Ok(booking),
            Effect::StatusOnly => (None, None),
            Effect::Release => (None, booking.linked_commitment),
            Effect::Claim => {
                if guard.commitments.len() >= MAX_COMMITMENTS_PER_TRAINER {
                    return Err(EngineError::LimitExceeded("too many sessions on trainer"));
                }
                validate_slot(&guard, &booking.span, booking.span.weekday(), Some(id))
                    .map_err(|e| rejected(trainer_id, e))?;
                (Some(booked_session(&booking)), None)
            }
        };

        let event = Event::BookingTransitioned { id, trainer_id, status: to, created, released };
        self.persist_and_apply(trainer_id, &mut guard, &event).await?;
        metrics::counter!(BOOKING_TRANSITIONS_TOTAL, "to" => to.as_str()).increment(1);
        tracing::debug!("booking {id}: {} -> {to}", booking.status);
        guard.bookings.get(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Remove a booking together with its linked commitment.
    pub async fn delete_booking(&self, id: Ulid, actor: &Actor) -> Result<Ulid, EngineError> {
        let _gate = self.commit_gate.read().await;
        let (trainer_id, mut guard) = self.resolve_booking_write(&id).await?;
        let booking = guard.bookings.get(&id).ok_or(EngineError::NotFound(id))?;
        authorize(
            actor,
            Action::Delete,
            &Resource::Booking { client_id: booking.client_id, trainer_id },
        )?;
        let event = Event::BookingDeleted { id, trainer_id };
        self.persist_and_apply(trainer_id, &mut guard, &event).await?;
        Ok(trainer_id)
    }

    // ── Absent sweep ─────────────────────────────────────

    /// Open sessions whose grace period has run out by `now`, as
    /// `(commitment_id, trainer_id)`. Trainers locked right now are skipped
    /// and picked up by the next sweep.
    pub fn collect_overdue_commitments(&self, now: Stamp) -> Vec<(Ulid, Ulid)> {
        let mut overdue = Vec::new();
        for entry in self.state.iter() {
            let ts = entry.value().clone();
            let Ok(guard) = ts.try_read() else { continue };
            for c in &guard.commitments {
                if c.span.start > now {
                    break;
                }
                if c.status.is_open() && now > c.span.start + absence_grace(&c.span) {
                    overdue.push((c.id, guard.id));
                }
            }
        }
        overdue
    }

    /// Mark a session absent. Returns false if it was already closed, so
    /// repeated sweeps never touch a row twice.
    pub async fn mark_absent(&self, id: Ulid) -> Result<bool, EngineError> {
        let _gate = self.commit_gate.read().await;
        let (trainer_id, mut guard) = self.resolve_entity_write(&id).await?;
        let current = guard.commitment(id).ok_or(EngineError::NotFound(id))?;
        if !current.status.is_open() {
            return Ok(false);
        }
        let event = Event::CommitmentStatusSet {
            id,
            trainer_id,
            status: CommitmentStatus::Absent,
            feedback: None,
        };
        self.persist_and_apply(trainer_id, &mut guard, &event).await?;
        metrics::counter!(SESSIONS_ABSENT_TOTAL).increment(1);
        Ok(true)
    }

    // ── Compaction ───────────────────────────────────────

    /// Rewrite the WAL with just the events needed to rebuild current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;

        let mut users: Vec<UserInfo> = self.users.iter().map(|e| e.value().clone()).collect();
        users.sort_by_key(|u| u.id);
        let mut events: Vec<Event> = users
            .into_iter()
            .map(|u| Event::UserRegistered { id: u.id, username: u.username, role: u.role })
            .collect();

        let mut trainers: Vec<(Ulid, SharedTrainerState)> =
            self.state.iter().map(|e| (*e.key(), e.value().clone())).collect();
        trainers.sort_by_key(|(id, _)| *id);

        for (trainer_id, ts) in trainers {
            let guard = ts.read().await;
            if guard.profile != TrainerProfile::default() {
                events.push(Event::ProfileUpdated { trainer_id, profile: guard.profile.clone() });
            }
            if !guard.windows.is_empty() {
                events.push(Event::AvailabilityReplaced {
                    trainer_id,
                    windows: guard.windows.clone(),
                });
            }
            for c in &guard.commitments {
                events.push(Event::CommitmentScheduled { commitment: c.clone() });
            }
            let mut bookings: Vec<&Booking> = guard.bookings.values().collect();
            bookings.sort_by_key(|b| b.id);
            events.extend(
                bookings
                    .into_iter()
                    .map(|b| Event::BookingCreated { booking: b.clone() }),
            );
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        tracing::info!("WAL compacted to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
