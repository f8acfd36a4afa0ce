mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
mod transition;

pub use availability::{merge_overlapping, open_slots, subtract_intervals};
pub use error::EngineError;
pub use transition::{can_transition, is_terminal};

pub(crate) use conflict::now_local;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedTrainerState = Arc<RwLock<TrainerState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Appends that queue up while a flush is in progress are
/// written together and share one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    // Keep ordering: everything queued before it lands first.
                    deferred = Some(other);
                    break;
                }
            }
        }

        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();

    let mut result = Ok(());
    for (event, _) in &batch {
        if let Err(e) = wal.append_buffered(event) {
            result = Err(e);
            break;
        }
    }
    // Flush even after a failed append so stale buffered bytes never
    // prefix the next batch.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => commit_batch(wal, vec![(event, response)]),
    }
}

// ── Engine ───────────────────────────────────────────────

pub struct Engine {
    /// One aggregate per registered trainer.
    pub state: DashMap<Ulid, SharedTrainerState>,
    pub(super) users: DashMap<Ulid, UserInfo>,
    pub(super) usernames: DashMap<String, Ulid>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: window/commitment/booking id → owning trainer.
    pub(super) entity_to_trainer: DashMap<Ulid, Ulid>,
    /// Held shared by every commit (append + apply) and exclusively by
    /// compaction, so a snapshot never misses an appended event.
    pub(super) commit_gate: RwLock<()>,
    /// Serializes registrations so username uniqueness holds.
    pub(super) registration: Mutex<()>,
}

/// Apply an event to one trainer aggregate. Caller holds the write lock.
fn apply_to_trainer(ts: &mut TrainerState, event: &Event, entity_map: &DashMap<Ulid, Ulid>) {
    match event {
        Event::ProfileUpdated { profile, .. } => {
            ts.profile = profile.clone();
        }
        Event::AvailabilityReplaced { windows, .. } => {
            for old in ts.windows.drain(..) {
                entity_map.remove(&old.id);
            }
            for w in windows {
                entity_map.insert(w.id, ts.id);
            }
            ts.windows = windows.clone();
        }
        Event::WindowAdded { window } => {
            entity_map.insert(window.id, ts.id);
            ts.windows.push(window.clone());
        }
        Event::WindowRemoved { id, .. } => {
            ts.windows.retain(|w| w.id != *id);
            entity_map.remove(id);
        }
        Event::CommitmentScheduled { commitment } => {
            entity_map.insert(commitment.id, ts.id);
            ts.insert_commitment(commitment.clone());
        }
        Event::CommitmentRescheduled { id, span, .. } => {
            if let Some(mut c) = ts.remove_commitment(*id) {
                c.span = *span;
                ts.insert_commitment(c);
            }
        }
        Event::CommitmentStatusSet { id, status, feedback, .. } => {
            if let Some(c) = ts.commitment_mut(*id) {
                c.status = *status;
                if feedback.is_some() {
                    c.feedback = feedback.clone();
                }
            }
        }
        Event::CommitmentRemoved { id, .. } => {
            ts.remove_commitment(*id);
            entity_map.remove(id);
        }
        Event::BookingCreated { booking } => {
            entity_map.insert(booking.id, ts.id);
            ts.bookings.insert(booking.id, booking.clone());
        }
        Event::BookingUpdated { booking, .. } => {
            let carried = booking
                .linked_commitment
                .and_then(|cid| ts.remove_commitment(cid));
            place_booking(ts, booking, carried, entity_map);
        }
        Event::BookingTransitioned { id, status, created, released, .. } => {
            if let Some(cid) = released {
                ts.remove_commitment(*cid);
                entity_map.remove(cid);
            }
            if let Some(c) = created {
                entity_map.insert(c.id, ts.id);
                ts.insert_commitment(c.clone());
            }
            if let Some(b) = ts.bookings.get_mut(id) {
                b.status = *status;
                if released.is_some() {
                    b.linked_commitment = None;
                }
                if let Some(c) = created {
                    b.linked_commitment = Some(c.id);
                }
            }
        }
        Event::BookingDeleted { id, .. } => {
            if let Some(b) = ts.bookings.remove(id)
                && let Some(cid) = b.linked_commitment
            {
                ts.remove_commitment(cid);
                entity_map.remove(&cid);
            }
            entity_map.remove(id);
        }
        // Registration is handled at the DashMap level.
        Event::UserRegistered { .. } => {}
    }
}

/// Store `booking` on `to`, re-homing the commitment it carries (if any).
fn place_booking(
    to: &mut TrainerState,
    booking: &Booking,
    carried: Option<Commitment>,
    entity_map: &DashMap<Ulid, Ulid>,
) {
    if let Some(mut c) = carried {
        c.span = booking.span;
        c.trainer_id = booking.trainer_id;
        c.label = booking.session_label();
        c.notes = booking.notes.clone();
        entity_map.insert(c.id, to.id);
        to.insert_commitment(c);
    }
    entity_map.insert(booking.id, to.id);
    to.bookings.insert(booking.id, booking.clone());
}

/// `BookingUpdated` whose trainer changed. Caller holds both write locks.
fn apply_booking_move(
    from: &mut TrainerState,
    to: &mut TrainerState,
    booking: &Booking,
    entity_map: &DashMap<Ulid, Ulid>,
) {
    from.bookings.remove(&booking.id);
    let carried = booking
        .linked_commitment
        .and_then(|cid| from.remove_commitment(cid));
    place_booking(to, booking, carried, entity_map);
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            users: DashMap::new(),
            usernames: DashMap::new(),
            wal_tx,
            notify,
            entity_to_trainer: DashMap::new(),
            commit_gate: RwLock::new(()),
            registration: Mutex::new(()),
        };

        // We are the sole owner of every Arc here, so try_write never
        // contends. blocking_write would panic inside a runtime.
        for event in &events {
            match event {
                Event::UserRegistered { id, username, role } => {
                    engine.insert_user(UserInfo { id: *id, username: username.clone(), role: *role });
                }
                Event::BookingUpdated { booking, from_trainer } if *from_trainer != booking.trainer_id => {
                    let (Some(from), Some(to)) =
                        (engine.get_trainer(from_trainer), engine.get_trainer(&booking.trainer_id))
                    else {
                        tracing::warn!("replay: booking {} moved between unknown trainers", booking.id);
                        continue;
                    };
                    let (Ok(mut from), Ok(mut to)) = (from.try_write(), to.try_write()) else {
                        continue;
                    };
                    apply_booking_move(&mut from, &mut to, booking, &engine.entity_to_trainer);
                }
                other => {
                    let Some(ts) = other.trainer_id().and_then(|tid| engine.get_trainer(&tid)) else {
                        continue;
                    };
                    if let Ok(mut guard) = ts.try_write() {
                        apply_to_trainer(&mut guard, other, &engine.entity_to_trainer);
                    }
                }
            }
        }

        tracing::debug!(
            "replayed {} events: {} users, {} trainers",
            events.len(),
            engine.users.len(),
            engine.state.len()
        );
        Ok(engine)
    }

    pub(super) fn insert_user(&self, info: UserInfo) {
        if info.role == Role::Trainer {
            let ts = TrainerState::new(info.id, info.username.clone());
            self.state.insert(info.id, Arc::new(RwLock::new(ts)));
        }
        self.usernames.insert(info.username.clone(), info.id);
        self.users.insert(info.id, info);
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { event: event.clone(), response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_trainer(&self, id: &Ulid) -> Option<SharedTrainerState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    /// Trainer aggregate for `id`, distinguishing unknown users from non-trainers.
    pub(super) fn trainer_state(&self, id: &Ulid) -> Result<SharedTrainerState, EngineError> {
        if let Some(ts) = self.get_trainer(id) {
            return Ok(ts);
        }
        if self.users.contains_key(id) {
            Err(EngineError::NotATrainer(*id))
        } else {
            Err(EngineError::NotFound(*id))
        }
    }

    pub fn get_trainer_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_trainer.get(entity_id).map(|e| *e.value())
    }

    /// WAL append, then apply, then notify. Nothing touches memory unless
    /// the append succeeded.
    pub(super) async fn persist_and_apply(
        &self,
        trainer_id: Ulid,
        ts: &mut TrainerState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_trainer(ts, event, &self.entity_to_trainer);
        self.notify.send(trainer_id, event);
        Ok(())
    }

    /// Both sides of a trainer reassignment. Caller holds both write locks.
    pub(super) async fn persist_and_move(
        &self,
        from: &mut TrainerState,
        to: &mut TrainerState,
        event: &Event,
    ) -> Result<(), EngineError> {
        let Event::BookingUpdated { booking, .. } = event else {
            return Err(EngineError::WalError("move requires a booking update".into()));
        };
        self.wal_append(event).await?;
        apply_booking_move(from, to, booking, &self.entity_to_trainer);
        self.notify.send(from.id, event);
        self.notify.send(to.id, event);
        Ok(())
    }

    /// Lookup entity → trainer, acquire that trainer's write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<(Ulid, OwnedRwLockWriteGuard<TrainerState>), EngineError> {
        let trainer_id = self
            .get_trainer_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        let ts = self
            .get_trainer(&trainer_id)
            .ok_or(EngineError::NotFound(trainer_id))?;
        Ok((trainer_id, ts.write_owned().await))
    }

    /// Like `resolve_entity_write` for bookings, which may change trainer
    /// between the index lookup and the lock.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<(Ulid, OwnedRwLockWriteGuard<TrainerState>), EngineError> {
        loop {
            let (trainer_id, guard) = self.resolve_entity_write(booking_id).await?;
            if guard.bookings.contains_key(booking_id) {
                return Ok((trainer_id, guard));
            }
            if self.get_trainer_for_entity(booking_id) == Some(trainer_id) {
                return Err(EngineError::NotFound(*booking_id));
            }
        }
    }

    /// Write-lock two distinct trainers in ascending id order.
    pub(super) async fn lock_pair(
        &self,
        a: Ulid,
        b: Ulid,
    ) -> Result<(OwnedRwLockWriteGuard<TrainerState>, OwnedRwLockWriteGuard<TrainerState>), EngineError>
    {
        let ts_a = self.trainer_state(&a)?;
        let ts_b = self.trainer_state(&b)?;
        if a < b {
            let ga = ts_a.write_owned().await;
            let gb = ts_b.write_owned().await;
            Ok((ga, gb))
        } else {
            let gb = ts_b.write_owned().await;
            let ga = ts_a.write_owned().await;
            Ok((ga, gb))
        }
    }
}
