use uuid::Uuid;

/// Kind of record a `NotFound` refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Room,
    Booking,
    Event,
    Notification,
    User,
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Entity::Room => "room",
            Entity::Booking => "booking",
            Entity::Event => "event",
            Entity::Notification => "notification",
            Entity::User => "user",
        })
    }
}

#[derive(Debug)]
pub enum EngineError {
    NotFound(Entity, Uuid),
    /// Missing or malformed input.
    Validation(String),
    /// Overlapping approved booking or duplicate event title.
    Conflict(String),
    /// The operation is not allowed in the subject's current state.
    InvalidState(String),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(entity, id) => write!(f, "{entity} not found: {id}"),
            EngineError::Validation(msg) => write!(f, "validation failed: {msg}"),
            EngineError::Conflict(msg) => write!(f, "conflict: {msg}"),
            EngineError::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
