use crate::model::BookingStatus;

use super::EngineError;

use BookingStatus::*;

/// Legal status moves. Rejected, Cancelled and Completed are terminal.
const TRANSITIONS: &[(BookingStatus, &[BookingStatus])] = &[
    (Pending, &[Approved, Rejected, Cancelled]),
    (Approved, &[Cancelled, Completed]),
    (Rejected, &[]),
    (Cancelled, &[]),
    (Completed, &[]),
];

pub fn allowed_transitions(from: BookingStatus) -> &'static [BookingStatus] {
    TRANSITIONS
        .iter()
        .find(|(status, _)| *status == from)
        .map(|(_, next)| *next)
        .unwrap_or(&[])
}

/// A same-status move is allowed so notes can be edited. `force` skips the table.
pub(crate) fn check_transition(
    from: BookingStatus,
    to: BookingStatus,
    force: bool,
) -> Result<(), EngineError> {
    if force || from == to || allowed_transitions(from).contains(&to) {
        return Ok(());
    }
    Err(EngineError::InvalidState(format!(
        "booking cannot move from {from} to {to}"
    )))
}
