use crate::model::BookingStatus;

use super::EngineError;

/// What a legal status change does to the booking's linked commitment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Effect {
    /// Same status re-asserted; nothing to write.
    Unchanged,
    /// Entering confirmed: validate the slot and create the commitment.
    Claim,
    /// Leaving confirmed: delete the linked commitment.
    Release,
    /// Status write only.
    StatusOnly,
}

/// Legal edges of the booking lifecycle.
///
/// ```text
/// pending ──> confirmed ──> completed
///    │            │
///    └────────────┴──> cancelled_by_user | cancelled_by_trainer
/// ```
pub fn can_transition(from: BookingStatus, to: BookingStatus) -> bool {
    use BookingStatus::*;
    matches!(
        (from, to),
        (Pending, Confirmed)
            | (Pending, CancelledByUser)
            | (Pending, CancelledByTrainer)
            | (Confirmed, Completed)
            | (Confirmed, CancelledByUser)
            | (Confirmed, CancelledByTrainer)
    )
}

pub fn is_terminal(status: BookingStatus) -> bool {
    matches!(
        status,
        BookingStatus::Completed
            | BookingStatus::CancelledByUser
            | BookingStatus::CancelledByTrainer
    )
}

pub(crate) fn plan(from: BookingStatus, to: BookingStatus) -> Result<Effect, EngineError> {
    if from == to {
        return Ok(Effect::Unchanged);
    }
    if !can_transition(from, to) {
        return Err(EngineError::InvalidTransition { from, to });
    }
    Ok(match (from, to) {
        (_, BookingStatus::Confirmed) => Effect::Claim,
        (BookingStatus::Confirmed, _) => Effect::Release,
        _ => Effect::StatusOnly,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use BookingStatus::*;

    const ALL: [BookingStatus; 5] = [Pending, Confirmed, CancelledByUser, CancelledByTrainer, Completed];

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        for from in ALL.into_iter().filter(|s| is_terminal(*s)) {
            for to in ALL {
                assert!(!can_transition(from, to), "{from} -> {to} must be illegal");
            }
        }
    }

    #[test]
    fn completed_rejects_everything_but_itself() {
        for to in ALL {
            let result = plan(Completed, to);
            if to == Completed {
                assert_eq!(result, Ok(Effect::Unchanged));
            } else {
                assert_eq!(result, Err(EngineError::InvalidTransition { from: Completed, to }));
            }
        }
    }

    #[test]
    fn confirmed_to_pending_is_regression() {
        assert_eq!(
            plan(Confirmed, Pending),
            Err(EngineError::InvalidTransition { from: Confirmed, to: Pending })
        );
    }

    #[test]
    fn pending_cannot_skip_to_completed() {
        assert!(plan(Pending, Completed).is_err());
    }

    #[test]
    fn effects() {
        assert_eq!(plan(Pending, Confirmed), Ok(Effect::Claim));
        assert_eq!(plan(Confirmed, Completed), Ok(Effect::Release));
        assert_eq!(plan(Confirmed, CancelledByTrainer), Ok(Effect::Release));
        assert_eq!(plan(Pending, CancelledByUser), Ok(Effect::StatusOnly));
        assert_eq!(plan(Confirmed, Confirmed), Ok(Effect::Unchanged));
    }
}
