use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unix milliseconds, UTC. The only time type inside the engine.
pub type Ms = i64;

pub const DAY_MS: Ms = 86_400_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeInterval {
    pub start: Ms,
    pub end: Ms,
}

impl TimeInterval {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "TimeInterval start must be before end");
        Self { start, end }
    }

    /// `None` unless `end > start`.
    pub fn try_new(start: Ms, end: Ms) -> Option<Self> {
        (end > start).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Back-to-back intervals (`self.end == other.start`) do not overlap.
    pub fn overlaps(&self, other: &TimeInterval) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// Days since the Unix epoch of the UTC calendar date containing `ms`.
pub fn calendar_day(ms: Ms) -> i64 {
    ms.div_euclid(DAY_MS)
}

/// RFC 3339 rendering, falling back to raw millis for out-of-range values.
pub fn format_ms(ms: Ms) -> String {
    DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_else(|| ms.to_string())
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS`, `YYYY-MM-DDTHH:MM:SS` (UTC) and bare dates.
pub fn parse_timestamp(s: &str) -> Option<Ms> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc().timestamp_millis());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc().timestamp_millis())
}

/// Closed string-valued enum with case-insensitive parsing.
macro_rules! labeled_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => stringify!($variant)),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let s = s.trim();
                $name::ALL
                    .iter()
                    .copied()
                    .find(|v| v.as_str().eq_ignore_ascii_case(s))
                    .ok_or_else(|| format!("unknown {} '{}'", stringify!($name), s))
            }
        }
    };
}

labeled_enum!(RoomStatus {
    Available,
    Occupied,
    Maintenance,
    Unavailable,
});

labeled_enum!(BookingStatus {
    Pending,
    Approved,
    Rejected,
    Cancelled,
    Completed,
});

impl BookingStatus {
    /// Pending and Approved bookings still claim their room.
    pub fn is_active(self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Approved)
    }
}

labeled_enum!(EventStatus {
    Active,
    Inactive,
    Cancelled,
    Completed,
});

labeled_enum!(NotificationStatus {
    Active,
    Expired,
    Inactive,
});

labeled_enum!(
    /// Audience of a notification.
    TargetGroup {
        All,
        Lecturer,
        Student,
    }
);

impl TargetGroup {
    /// Groups whose notifications a user holding `roles` receives.
    pub fn eligible_for(roles: &[Role]) -> Vec<TargetGroup> {
        let mut groups = vec![TargetGroup::All];
        if roles.contains(&Role::Lecturer) {
            groups.push(TargetGroup::Lecturer);
        }
        if roles.contains(&Role::Student) {
            groups.push(TargetGroup::Student);
        }
        groups
    }

    /// The role a non-`All` group addresses.
    pub fn role(self) -> Option<Role> {
        match self {
            TargetGroup::All => None,
            TargetGroup::Lecturer => Some(Role::Lecturer),
            TargetGroup::Student => Some(Role::Student),
        }
    }
}

labeled_enum!(Role {
    Admin,
    Lecturer,
    Student,
});

labeled_enum!(UserStatus { Active, Inactive });

// ── Entities ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: Uuid,
    pub name: String,
    pub capacity: u32,
    pub status: RoomStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Uuid,
    pub room_id: Uuid,
    pub user_id: Uuid,
    pub event_id: Option<Uuid>,
    pub interval: TimeInterval,
    pub status: BookingStatus,
    pub purpose: String,
    pub notes: Option<String>,
    pub created_at: Ms,
    pub last_updated_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub start_date: Ms,
    pub end_date: Ms,
    pub location: Option<String>,
    pub status: EventStatus,
    pub visibility: bool,
    pub audience: TargetGroup,
    /// Stored verbatim; never expanded into occurrences.
    pub recurrence_rule: Option<String>,
    pub created_by: Uuid,
    pub created_at: Ms,
    pub last_updated_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub title: String,
    pub content: String,
    pub target_group: TargetGroup,
    /// Visibility window, inclusive on both ends.
    pub start_date: Ms,
    pub end_date: Ms,
    pub status: NotificationStatus,
    pub created_by: Uuid,
    pub created_at: Ms,
}

impl Notification {
    pub fn is_visible_at(&self, now: Ms) -> bool {
        self.status == NotificationStatus::Active && self.start_date <= now && now <= self.end_date
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub full_name: String,
    pub roles: Vec<Role>,
    pub status: UserStatus,
}

impl User {
    pub fn is_active(&self) -> bool {
        self.status == UserStatus::Active
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }
}

// ── Per-room state ───────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RoomState {
    pub room: Room,
    /// All bookings of this room in any status, sorted by `interval.start`.
    pub bookings: Vec<Booking>,
}

impl RoomState {
    pub fn new(room: Room) -> Self {
        Self {
            room,
            bookings: Vec::new(),
        }
    }

    /// Insert maintaining sort order by interval start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| b.interval.start <= booking.interval.start);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Uuid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn booking(&self, id: Uuid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Uuid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// Bookings whose interval overlaps `query`, in start order.
    pub fn overlapping(&self, query: &TimeInterval) -> impl Iterator<Item = &Booking> {
        // Everything at index >= right_bound starts at or after query.end.
        let right_bound = self
            .bookings
            .partition_point(|b| b.interval.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.interval.end > query.start)
    }

    pub fn has_active_bookings(&self) -> bool {
        self.bookings.iter().any(|b| b.status.is_active())
    }
}

/// WAL record. Every state change is one of these, applied after it is durable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Record {
    RoomCreated {
        room: Room,
    },
    RoomUpdated {
        room: Room,
    },
    RoomDeleted {
        id: Uuid,
    },
    UserUpserted {
        user: User,
    },
    BookingCreated {
        booking: Booking,
    },
    BookingStatusChanged {
        id: Uuid,
        room_id: Uuid,
        status: BookingStatus,
        notes: Option<String>,
        at: Ms,
    },
    BookingDeleted {
        id: Uuid,
        room_id: Uuid,
    },
    EventCreated {
        event: Event,
    },
    EventUpdated {
        event: Event,
    },
    EventDeleted {
        id: Uuid,
    },
    NotificationCreated {
        notification: Notification,
    },
    NotificationUpdated {
        notification: Notification,
    },
    NotificationDeleted {
        id: Uuid,
    },
    NotificationsExpired {
        ids: Vec<Uuid>,
    },
    NotificationsRead {
        user_id: Uuid,
        notification_ids: Vec<Uuid>,
        read_at: Ms,
    },
}

// ── Requests ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBooking {
    pub room_id: Uuid,
    pub start: Ms,
    pub end: Ms,
    pub purpose: String,
    pub event_id: Option<Uuid>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingStatusChange {
    pub status: BookingStatus,
    /// `None` keeps the existing notes.
    pub notes: Option<String>,
    /// Skip the transition table. Approval still re-checks conflicts.
    pub force: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewEvent {
    pub title: String,
    pub description: Option<String>,
    pub start_date: Option<Ms>,
    pub end_date: Option<Ms>,
    pub location: Option<String>,
    pub status: Option<EventStatus>,
    pub visibility: Option<bool>,
    pub audience: Option<TargetGroup>,
    pub recurrence_rule: Option<String>,
}

/// Partial event update; `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub start_date: Option<Ms>,
    pub end_date: Option<Ms>,
    pub location: Option<String>,
    pub status: Option<EventStatus>,
    pub visibility: Option<bool>,
    pub audience: Option<TargetGroup>,
    pub recurrence_rule: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewNotification {
    pub title: String,
    pub content: String,
    pub target_group: TargetGroup,
    pub start_date: Ms,
    pub end_date: Ms,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotificationPatch {
    pub title: Option<String>,
    pub content: Option<String>,
    pub target_group: Option<TargetGroup>,
    pub start_date: Option<Ms>,
    pub end_date: Option<Ms>,
    pub status: Option<NotificationStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomPatch {
    pub name: Option<String>,
    pub capacity: Option<u32>,
    pub status: Option<RoomStatus>,
}

// ── Query filters and results ────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingFilter {
    pub room_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub event_id: Option<Uuid>,
    pub status: Option<BookingStatus>,
    /// Keep bookings ending at or after this instant.
    pub from: Option<Ms>,
    /// Keep bookings starting at or before this instant.
    pub to: Option<Ms>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    pub status: Option<EventStatus>,
    /// Only Active events starting after now.
    pub upcoming_only: bool,
    pub from: Option<Ms>,
    pub to: Option<Ms>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserNotification {
    pub notification: Notification,
    pub is_read: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = 3_600_000;

    fn booking_at(start: Ms, end: Ms) -> Booking {
        Booking {
            id: Uuid::new_v4(),
            room_id: Uuid::nil(),
            user_id: Uuid::nil(),
            event_id: None,
            interval: TimeInterval::new(start, end),
            status: BookingStatus::Approved,
            purpose: "lab".into(),
            notes: None,
            created_at: 0,
            last_updated_at: 0,
        }
    }

    #[test]
    fn interval_overlap_is_half_open() {
        let a = TimeInterval::new(9 * H, 10 * H);
        assert!(a.overlaps(&TimeInterval::new(9 * H + 1, 11 * H)));
        assert!(a.overlaps(&TimeInterval::new(8 * H, 12 * H)));
        assert!(!a.overlaps(&TimeInterval::new(10 * H, 11 * H)));
        assert!(!a.overlaps(&TimeInterval::new(8 * H, 9 * H)));
    }

    #[test]
    fn try_new_rejects_empty_and_inverted() {
        assert!(TimeInterval::try_new(10, 10).is_none());
        assert!(TimeInterval::try_new(11, 10).is_none());
        assert_eq!(TimeInterval::try_new(10, 11), Some(TimeInterval { start: 10, end: 11 }));
    }

    #[test]
    fn calendar_day_is_utc_date() {
        let jan_10_23h = parse_timestamp("2025-01-10T23:30:00Z").unwrap();
        let jan_11_00h = parse_timestamp("2025-01-11T00:10:00Z").unwrap();
        assert_eq!(calendar_day(jan_10_23h) + 1, calendar_day(jan_11_00h));
        assert_eq!(calendar_day(-1), -1);
    }

    #[test]
    fn timestamp_formats() {
        let rfc = parse_timestamp("2025-01-10T09:00:00Z").unwrap();
        assert_eq!(parse_timestamp("2025-01-10 09:00:00"), Some(rfc));
        assert_eq!(parse_timestamp("2025-01-10T10:00:00+01:00"), Some(rfc));
        assert_eq!(parse_timestamp("2025-01-10"), Some(rfc - 9 * H));
        assert_eq!(format_ms(rfc), "2025-01-10T09:00:00Z");
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn enums_parse_case_insensitively() {
        assert_eq!("approved".parse::<BookingStatus>(), Ok(BookingStatus::Approved));
        assert_eq!(" Student ".parse::<TargetGroup>(), Ok(TargetGroup::Student));
        assert!("Archived".parse::<EventStatus>().is_err());
        assert_eq!(RoomStatus::Maintenance.to_string(), "Maintenance");
    }

    #[test]
    fn eligible_groups_follow_roles() {
        assert_eq!(TargetGroup::eligible_for(&[Role::Admin]), vec![TargetGroup::All]);
        assert_eq!(
            TargetGroup::eligible_for(&[Role::Student, Role::Lecturer]),
            vec![TargetGroup::All, TargetGroup::Lecturer, TargetGroup::Student]
        );
    }

    #[test]
    fn notification_window_is_inclusive() {
        let n = Notification {
            id: Uuid::new_v4(),
            title: "t".into(),
            content: "c".into(),
            target_group: TargetGroup::All,
            start_date: 100,
            end_date: 200,
            status: NotificationStatus::Active,
            created_by: Uuid::nil(),
            created_at: 100,
        };
        assert!(n.is_visible_at(100));
        assert!(n.is_visible_at(200));
        assert!(!n.is_visible_at(201));
        let expired = Notification { status: NotificationStatus::Expired, ..n };
        assert!(!expired.is_visible_at(150));
    }

    #[test]
    fn room_state_keeps_start_order() {
        let mut rs = RoomState::new(Room {
            id: Uuid::new_v4(),
            name: "Lab 1".into(),
            capacity: 30,
            status: RoomStatus::Available,
        });
        let late = booking_at(14 * H, 15 * H);
        let early = booking_at(9 * H, 10 * H);
        let mid = booking_at(11 * H, 12 * H);
        rs.insert_booking(late.clone());
        rs.insert_booking(early.clone());
        rs.insert_booking(mid.clone());
        let starts: Vec<Ms> = rs.bookings.iter().map(|b| b.interval.start).collect();
        assert_eq!(starts, vec![9 * H, 11 * H, 14 * H]);

        let hits: Vec<Uuid> = rs
            .overlapping(&TimeInterval::new(10 * H, 14 * H))
            .map(|b| b.id)
            .collect();
        assert_eq!(hits, vec![mid.id]);

        assert_eq!(rs.remove_booking(mid.id).map(|b| b.id), Some(mid.id));
        assert!(rs.remove_booking(mid.id).is_none());
    }
}
