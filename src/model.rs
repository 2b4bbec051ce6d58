use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the storage time type. Instants cross the API as `DateTime<Utc>`.
pub type Ms = i64;

/// Store-assigned reservation identity.
pub type ReservationId = Ulid;

/// Identifier of a piece of equipment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(pub i64);

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for ResourceId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Opaque identity of the user who made a reservation. Resolved by the
/// boundary layer from an authenticated session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequesterId(String);

impl RequesterId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequesterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequesterId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for RequesterId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// Convert stored milliseconds back to an instant.
pub fn instant(ms: Ms) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// A committed reservation. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub resource_id: ResourceId,
    pub requester_id: RequesterId,
    pub span: Span,
}

impl Reservation {
    pub fn start(&self) -> DateTime<Utc> {
        instant(self.span.start)
    }

    pub fn end(&self) -> DateTime<Utc> {
        instant(self.span.end)
    }
}

#[derive(Debug, Clone)]
pub struct EquipmentState {
    pub id: ResourceId,
    pub name: Option<String>,
    /// Set under the write lock when the equipment is retired, so a creator that
    /// grabbed the Arc before removal cannot commit into a detached state.
    pub retired: bool,
    /// Committed reservations, sorted by `span.start`.
    pub reservations: Vec<Reservation>,
}

impl EquipmentState {
    pub fn new(id: ResourceId, name: Option<String>) -> Self {
        Self {
            id,
            name,
            retired: false,
            reservations: Vec::new(),
        }
    }

    /// Insert maintaining sort order by span.start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .binary_search_by_key(&reservation.span.start, |r| r.span.start)
            .unwrap_or_else(|e| e);
        self.reservations.insert(pos, reservation);
    }

    pub fn remove_reservation(&mut self, id: ReservationId) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.id == id)?;
        Some(self.reservations.remove(pos))
    }

    pub fn find(&self, id: ReservationId) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    pub fn info(&self) -> EquipmentInfo {
        EquipmentInfo {
            id: self.id,
            name: self.name.clone(),
            reservation_count: self.reservations.len(),
        }
    }

    /// Return only reservations whose span overlaps the query window.
    /// Uses binary search to skip reservations starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span.end > query.start)
    }
}

/// WAL record format. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    EquipmentRegistered {
        id: ResourceId,
        name: Option<String>,
    },
    EquipmentRetired {
        id: ResourceId,
    },
    ReservationCreated {
        id: ReservationId,
        resource_id: ResourceId,
        requester_id: RequesterId,
        span: Span,
    },
    ReservationCancelled {
        id: ReservationId,
        resource_id: ResourceId,
    },
    EquipmentRenamed {
        id: ResourceId,
        name: Option<String>,
    },
}

impl Event {
    pub fn resource_id(&self) -> ResourceId {
        match self {
            Event::EquipmentRegistered { id, .. }
            | Event::EquipmentRetired { id }
            | Event::EquipmentRenamed { id, .. } => *id,
            Event::ReservationCreated { resource_id, .. }
            | Event::ReservationCancelled { resource_id, .. } => *resource_id,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EquipmentInfo {
    pub id: ResourceId,
    pub name: Option<String>,
    pub reservation_count: usize,
}
