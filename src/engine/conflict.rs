//! Interval overlap oracle. Pure functions, no I/O, no errors: every span
//! passed in is assumed to satisfy `start < end`.

use chrono::{DateTime, Utc};

use crate::model::*;

use super::{PermanentError, StoreError};

/// Half-open overlap: touching boundaries do not conflict, and there is no
/// buffer between consecutive reservations.
pub fn conflicts(candidate: &Span, existing: &Span) -> bool {
    candidate.start < existing.end && existing.start < candidate.end
}

pub fn any_conflict<'a>(candidate: &Span, existing: impl IntoIterator<Item = &'a Span>) -> bool {
    existing.into_iter().any(|span| conflicts(candidate, span))
}

/// The earliest-starting reservation that blocks `candidate`, if any.
pub fn first_conflict<'a>(
    candidate: &Span,
    existing: impl IntoIterator<Item = &'a Reservation>,
) -> Option<&'a Reservation> {
    existing.into_iter().find(|r| conflicts(candidate, &r.span))
}

pub(crate) fn check_no_conflict(es: &EquipmentState, span: &Span) -> Result<(), StoreError> {
    match first_conflict(span, es.overlapping(span)) {
        Some(existing) => Err(StoreError::Conflict { existing: existing.id }),
        None => Ok(()),
    }
}

/// `start < end` is the only interval rule; the range and width caps are
/// store limits and report as `Permanent`.
pub(crate) fn validate_span(span: &Span) -> Result<(), StoreError> {
    use crate::limits::*;
    if span.start >= span.end {
        return Err(StoreError::InvalidInterval {
            start: span.start,
            end: span.end,
            reason: "start must be before end",
        });
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(PermanentError::LimitExceeded("timestamp out of range").into());
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(PermanentError::LimitExceeded("reservation longer than a year").into());
    }
    Ok(())
}

/// Build a validated span from boundary instants. Sub-millisecond precision is
/// truncated before the `start < end` check.
pub(crate) fn span_from_instants(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Span, StoreError> {
    let span = Span {
        start: start.timestamp_millis(),
        end: end.timestamp_millis(),
    };
    validate_span(&span)?;
    Ok(span)
}
