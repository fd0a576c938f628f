use ulid::Ulid;

use crate::model::*;

use super::EngineError;

/// First booking on `rs` whose span overlaps `span`, skipping bookings of
/// `ignore_event` (an event being moved does not conflict with itself).
///
/// Pure: the answer depends only on the resource's current bookings and the
/// candidate interval.
pub(crate) fn find_conflict<'a>(
    rs: &'a ResourceState,
    span: &Span,
    ignore_event: Option<Ulid>,
) -> Option<&'a Booking> {
    rs.overlapping(span)
        .find(|b| Some(b.event_id) != ignore_event && b.span.overlaps(span))
}

pub(crate) fn check_no_conflict(
    rs: &ResourceState,
    span: &Span,
    ignore_event: Option<Ulid>,
) -> Result<(), EngineError> {
    match find_conflict(rs, span, ignore_event) {
        Some(b) => {
            metrics::counter!(crate::observability::CONFLICTS_TOTAL).increment(1);
            Err(EngineError::Conflict {
                event_id: b.event_id,
                allocation_id: b.allocation_id,
            })
        }
        None => Ok(()),
    }
}

/// Length-check a text field, optionally requiring it to be non-blank.
pub(crate) fn validate_text(
    field: &'static str,
    value: &str,
    max_len: usize,
    required: bool,
) -> Result<(), EngineError> {
    if required && value.trim().is_empty() {
        return Err(EngineError::Validation(format!("{field} is required")));
    }
    if value.len() > max_len {
        return Err(EngineError::LimitExceeded(field));
    }
    Ok(())
}
