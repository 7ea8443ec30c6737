//! Worker lifecycle state machine.
//!
//! ```text
//! stopped ──start──▶ starting ──grace──▶ running ──stop──▶ stopping ──exit──▶ stopped
//!                                           │
//!                                           └──exit 0──▶ stopped
//!
//! (any) ──failure──▶ error ──start──▶ starting
//! ```
//!
//! `error → starting` covers both a manual start and an automatic restart.

use chrono::Utc;

use warden_core::types::WorkerStatus;
use warden_core::{Result, WardenError};

use crate::types::WorkerState;

/// Returns true if `from → to` is an allowed transition.
pub fn can_transition(from: WorkerStatus, to: WorkerStatus) -> bool {
    use WorkerStatus::*;

    matches!(
        (from, to),
        (Stopped, Starting)
            | (Error, Starting)
            | (Starting, Running)
            | (Running, Stopping)
            | (Running, Stopped)
            | (Stopping, Stopped)
            | (_, Error)
    )
}

/// Validate `from → to`, returning `InvalidTransition` if it is not in the table.
pub fn check_transition(from: WorkerStatus, to: WorkerStatus) -> Result<()> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(WardenError::InvalidTransition { from, to })
    }
}

/// Move `state` to `to`, letting `update` adjust the other fields.
///
/// Returns the previous status. `last_update` is always refreshed, and the
/// state is left untouched when the transition is rejected.
pub fn apply_transition(
    state: &mut WorkerState,
    to: WorkerStatus,
    update: impl FnOnce(&mut WorkerState),
) -> Result<WorkerStatus> {
    let from = state.status;
    check_transition(from, to)?;

    state.status = to;
    update(state);
    state.last_update = Utc::now();

    debug_assert!(
        state.is_consistent(),
        "process id invariant broken after {from} -> {to}: {state:?}"
    );

    Ok(from)
}
