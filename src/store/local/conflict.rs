use crate::error::{Error, Result};
use crate::limits::*;
use crate::model::*;

/// Any restriction on the range, block or reservation, makes it unavailable.
pub(super) fn check_range_free(state: &ItemState, span: &DateSpan) -> Result<()> {
    if let Some(hit) = state.overlapping(span).next() {
        tracing::debug!(item_id = state.item.id, restriction_id = hit.id, %span, "range occupied");
        return Err(Error::Conflict {
            item_id: state.item.id,
            span: *span,
        });
    }
    Ok(())
}

/// Two reservation-kind restrictions may never overlap on one item.
/// Manual blocks are left to query-time resolution.
pub(super) fn check_no_double_booking(state: &ItemState, span: &DateSpan) -> Result<()> {
    let clash = state
        .overlapping(span)
        .any(|r| r.kind == RestrictionKind::Reservation);
    if clash {
        return Err(Error::Conflict {
            item_id: state.item.id,
            span: *span,
        });
    }
    Ok(())
}

pub(super) fn check_capacity(state: &ItemState, op: &'static str) -> Result<()> {
    if state.restrictions.len() >= MAX_RESTRICTIONS_PER_ITEM {
        return Err(Error::persistence(op, "too many restrictions on item"));
    }
    Ok(())
}
