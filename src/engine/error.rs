use ulid::Ulid;

use crate::model::{Ms, OwnerKind};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("invalid span: start {start} must be before end {end}")]
    InvalidSpan { start: Ms, end: Ms },
    #[error("{0}")]
    Invalid(&'static str),
    #[error("schedule version not found: {0}")]
    VersionNotFound(String),
    #[error("\"{0}\" is a reserved name and cannot be used as a schedule version")]
    ReservedVersion(String),
    #[error("a schedule version \"{0}\" already exists")]
    DuplicateVersion(String),
    #[error("cannot freeze a schedule without a version name")]
    EmptyVersion,
    #[error("released schedules cannot be changed")]
    Immutable,
    #[error("{0} is still referenced by the schedule or a submission")]
    InUse(Ulid),
    #[error("{id} is not a {expected}")]
    WrongOwnerKind { id: Ulid, expected: OwnerKind },
    #[error("unknown timezone: {0}")]
    UnknownTimezone(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}
