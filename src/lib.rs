//! Laboratory equipment reservation engine.
//!
//! Admission control for time-bounded reservations on shared equipment: no two
//! reservations committed for the same equipment ever overlap, under any
//! interleaving of concurrent callers. Reservations live in memory behind one
//! lock per equipment and are made durable through a group-committed WAL.

pub mod compactor;
pub mod config;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod store;
pub mod wal;

pub use engine::{Engine, ErrorKind, PermanentError, StoreError};
pub use model::{Reservation, ReservationId, RequesterId, ResourceId};
pub use store::{with_deadline, ReservationStore};
