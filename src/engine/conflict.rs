use uuid::Uuid;

use crate::model::*;

use super::EngineError;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or_default()
}

pub(crate) fn validate_interval(interval: &TimeInterval) -> Result<(), EngineError> {
    use crate::limits::*;
    if interval.start < MIN_VALID_TIMESTAMP_MS || interval.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if interval.duration_ms() > MAX_BOOKING_DURATION_MS {
        return Err(EngineError::LimitExceeded("booking too long"));
    }
    Ok(())
}

/// First approved booking of the room overlapping `candidate`, skipping `exclude`.
///
/// Pending, rejected, cancelled and completed bookings never block.
pub(crate) fn find_conflict<'a>(
    rs: &'a RoomState,
    candidate: &TimeInterval,
    exclude: Option<Uuid>,
) -> Option<&'a Booking> {
    rs.overlapping(candidate).find(|b| {
        b.status == BookingStatus::Approved
            && Some(b.id) != exclude
            && b.interval.overlaps(candidate)
    })
}

/// Caller must hold the room's write lock across this check and the commit that follows.
pub(crate) fn check_no_conflict(
    rs: &RoomState,
    candidate: &TimeInterval,
    exclude: Option<Uuid>,
) -> Result<(), EngineError> {
    match find_conflict(rs, candidate, exclude) {
        Some(existing) => Err(EngineError::Conflict(format!(
            "room time overlaps with approved booking {} [{} - {})",
            existing.id,
            format_ms(existing.interval.start),
            format_ms(existing.interval.end),
        ))),
        None => Ok(()),
    }
}
