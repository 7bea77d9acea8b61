//! Hard caps on input sizes and collection growth.

use crate::model::Ms;

pub const MAX_ROOMS: usize = 10_000;
pub const MAX_USERS: usize = 1_000_000;
pub const MAX_BOOKINGS_PER_ROOM: usize = 100_000;
pub const MAX_EVENTS: usize = 1_000_000;
pub const MAX_NOTIFICATIONS: usize = 1_000_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_TITLE_LEN: usize = 256;
pub const MAX_PURPOSE_LEN: usize = 1024;
pub const MAX_NOTES_LEN: usize = 4096;
pub const MAX_DESCRIPTION_LEN: usize = 8192;
pub const MAX_CONTENT_LEN: usize = 8192;
pub const MAX_LOCATION_LEN: usize = 512;
pub const MAX_RECURRENCE_RULE_LEN: usize = 1024;

/// Largest WAL frame payload. Every record is one entity, far below this.
pub const MAX_RECORD_BYTES: usize = 1 << 20;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;
/// A single booking may not hold a room for more than 31 days.
pub const MAX_BOOKING_DURATION_MS: Ms = 31 * 86_400_000;
