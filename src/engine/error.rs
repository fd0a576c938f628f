use ulid::Ulid;

#[derive(Debug)]
pub enum EngineError {
    /// Malformed or missing input. The caller fixes the input and retries.
    Validation(String),
    NotFound(Ulid),
    /// The resource is already allocated to `event_id` (via `allocation_id`)
    /// during an overlapping interval.
    Conflict { event_id: Ulid, allocation_id: Ulid },
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "invalid input: {msg}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::Conflict { event_id, allocation_id } => write!(
                f,
                "resource is already booked for another event during this time \
                 (event {event_id}, allocation {allocation_id})"
            ),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
