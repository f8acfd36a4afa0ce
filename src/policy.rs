//! Authorization: one table mapping (role, action, ownership) to allow/deny.

use ulid::Ulid;

use crate::engine::EngineError;
use crate::model::Role;

/// Who is asking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub id: Ulid,
    pub role: Role,
}

impl Actor {
    pub fn new(id: Ulid, role: Role) -> Self {
        Self { id, role }
    }

    /// Built-in operator identity, used by the configured admin login and
    /// by background jobs.
    pub fn system() -> Self {
        Self { id: Ulid::nil(), role: Role::Admin }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Read,
    Create,
    /// Booking status/notes, or commitment status/feedback.
    UpdateStatus,
    /// Moving start/end/trainer.
    Reschedule,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    /// A booking, existing or about to be created (the client of a new booking is the actor).
    Booking { client_id: Ulid, trainer_id: Ulid },
    Availability { trainer_id: Ulid },
    Commitment { trainer_id: Ulid },
    Profile { user_id: Ulid },
    TrainerSearch,
    Users,
}

pub fn authorize(actor: &Actor, action: Action, resource: &Resource) -> Result<(), EngineError> {
    if actor.role == Role::Admin {
        return Ok(());
    }
    match *resource {
        Resource::TrainerSearch => Ok(()),
        Resource::Users => Err(EngineError::Forbidden("user management requires admin")),
        Resource::Booking { client_id, trainer_id } => {
            if client_id == actor.id {
                Ok(())
            } else if trainer_id == actor.id {
                match action {
                    Action::Read | Action::UpdateStatus => Ok(()),
                    _ => Err(EngineError::Forbidden("trainers may only change status and notes")),
                }
            } else {
                Err(EngineError::Forbidden("not a party to this booking"))
            }
        }
        Resource::Availability { trainer_id } => {
            if actor.role == Role::Trainer && trainer_id == actor.id {
                Ok(())
            } else {
                Err(EngineError::Forbidden("availability belongs to another trainer"))
            }
        }
        Resource::Commitment { trainer_id } => {
            if actor.role != Role::Trainer || trainer_id != actor.id {
                return Err(EngineError::Forbidden("session belongs to another trainer"));
            }
            match action {
                Action::Read | Action::Create | Action::UpdateStatus => Ok(()),
                Action::Reschedule | Action::Delete => {
                    Err(EngineError::Forbidden("trainers may only change status and feedback"))
                }
            }
        }
        Resource::Profile { user_id } => match action {
            _ if user_id != actor.id => Err(EngineError::Forbidden("not your profile")),
            Action::Delete => Err(EngineError::Forbidden("profiles cannot be deleted")),
            _ => Ok(()),
        },
    }
}
