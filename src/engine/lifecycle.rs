use crate::model::*;

use super::EngineError;

/// Facts about a work order's resources, gathered by the caller before a
/// guarded transition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Guards {
    pub appointment_committed: bool,
    pub reservations_committed: bool,
}

impl JobState {
    /// Invoiced and Cancelled accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Invoiced | JobState::Cancelled)
    }

    /// Whether `self -> to` is an edge of the lifecycle, ignoring guards.
    pub fn permits(self, to: JobState) -> bool {
        use JobState::*;
        match (self, to) {
            // Scheduled -> Scheduled is a reschedule.
            (Draft | Scheduled, Scheduled) => true,
            (Scheduled, InProgress) => true,
            (InProgress, Completed) => true,
            (Completed, Invoiced) => true,
            (Draft | Scheduled | InProgress, Cancelled) => true,
            (Draft | Scheduled | InProgress | Completed | Invoiced | Cancelled, _) => false,
        }
    }
}

/// Fail with `IllegalTransition` unless `from -> to` is an edge.
pub(crate) fn ensure_edge(from: JobState, to: JobState) -> Result<(), EngineError> {
    if from.permits(to) {
        Ok(())
    } else {
        Err(EngineError::IllegalTransition { from, to })
    }
}

/// The only writer of `WorkOrder::state`. On error the state is unchanged.
pub(crate) fn advance(order: &mut WorkOrder, to: JobState, guards: Guards) -> Result<(), EngineError> {
    ensure_edge(order.state, to)?;
    match to {
        JobState::Scheduled if !guards.appointment_committed => {
            return Err(EngineError::IllegalTransition {
                from: order.state,
                to,
            });
        }
        JobState::InProgress if !guards.reservations_committed => {
            return Err(EngineError::ReservationsIncomplete(order.id));
        }
        JobState::Draft
        | JobState::Scheduled
        | JobState::InProgress
        | JobState::Completed
        | JobState::Invoiced
        | JobState::Cancelled => {}
    }
    order.state = to;
    Ok(())
}
