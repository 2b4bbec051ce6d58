use thiserror::Error;

use crate::model::{Ms, ReservationId, ResourceId};

/// Outcome classes the boundary layer maps onto its own transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Conflict,
    NotFound,
    Invalid,
    Transient,
    Permanent,
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// The interval overlaps a committed reservation on the same equipment.
    #[error("conflict with reservation: {existing}")]
    Conflict { existing: ReservationId },

    #[error("reservation not found: {0}")]
    NotFound(ReservationId),

    #[error("invalid interval [{start}, {end}): {reason}")]
    InvalidInterval {
        start: Ms,
        end: Ms,
        reason: &'static str,
    },

    /// Persistence unavailable or the commit did not complete. Safe to retry.
    #[error("transient store failure: {0}")]
    Transient(String),

    #[error(transparent)]
    Permanent(#[from] PermanentError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PermanentError {
    #[error("unknown equipment: {0}")]
    UnknownEquipment(ResourceId),

    #[error("equipment already registered: {0}")]
    EquipmentExists(ResourceId),

    #[error("equipment {0} still has reservations")]
    EquipmentInUse(ResourceId),

    #[error("requester id must be non-empty and at most {} bytes", crate::limits::MAX_REQUESTER_LEN)]
    InvalidRequester,

    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Conflict { .. } => ErrorKind::Conflict,
            StoreError::NotFound(_) => ErrorKind::NotFound,
            StoreError::InvalidInterval { .. } => ErrorKind::Invalid,
            StoreError::Transient(_) => ErrorKind::Transient,
            StoreError::Permanent(_) => ErrorKind::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Conflict => "conflict",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Invalid => "invalid",
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Transient(format!("WAL error: {e}"))
    }
}
