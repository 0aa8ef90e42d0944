use crate::model::*;

use super::EngineError;

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.start >= span.end {
        return Err(EngineError::validation("start must be before end"));
    }
    Ok(())
}

/// First busy interval overlapping `span`. Every overlap decision in the
/// engine goes through here.
pub fn first_conflict(span: &Span, busy: &[Span]) -> Option<Span> {
    busy.iter().find(|b| b.overlaps(span)).copied()
}

/// Candidates that start strictly after `now` and whose
/// `[start, start + duration)` overlaps no busy interval. Order is kept.
pub fn available_slots(candidates: &[Ms], duration_ms: Ms, busy: &[Span], now: Ms) -> Vec<Ms> {
    if duration_ms <= 0 {
        return Vec::new();
    }
    candidates
        .iter()
        .copied()
        .filter(|&start| start > now)
        .filter(|&start| first_conflict(&Span::new(start, start + duration_ms), busy).is_none())
        .collect()
}

/// Claim-time check: `span` against the host's confirmed bookings and any
/// external busy intervals.
pub(crate) fn check_no_conflict(
    host: &HostState,
    span: &Span,
    external: &[Span],
) -> Result<(), EngineError> {
    let booked: Vec<Span> = host.confirmed_overlapping(span).map(|b| b.span).collect();
    if let Some(hit) = first_conflict(span, &booked).or_else(|| first_conflict(span, external)) {
        return Err(EngineError::Conflict(hit));
    }
    Ok(())
}
