use ulid::Ulid;

#[derive(Debug)]
pub enum EngineError {
    Validation(String),
    /// Client already holds an overlapping appointment.
    AlreadyBooked(Ulid),
    /// Every worker is busy over the requested range.
    NoWorkerFree,
    NotFound(Ulid),
    LimitExceeded(&'static str),
    Roster(String),
    WalError(String),
}

impl EngineError {
    /// Refused because the range is taken, by the client or by every worker.
    pub fn is_conflict(&self) -> bool {
        matches!(self, EngineError::AlreadyBooked(_) | EngineError::NoWorkerFree)
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "invalid request: {msg}"),
            EngineError::AlreadyBooked(id) => {
                write!(f, "client already booked in this time range: {id}")
            }
            EngineError::NoWorkerFree => write!(f, "fully booked: no worker is free in this time range"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Roster(e) => write!(f, "roster unavailable: {e}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
