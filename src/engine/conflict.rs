use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub fn now_ms() -> Ms {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

pub(crate) fn duration_ms(d: Duration) -> Ms {
    Ms::try_from(d.as_millis()).unwrap_or(Ms::MAX)
}

pub(crate) fn minutes_ms(minutes: u32) -> Ms {
    Ms::from(minutes) * MINUTE_MS
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(EngineError::InvalidInput("span must end after it starts"));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

pub(crate) fn validate_text(
    value: Option<&str>,
    max: usize,
    what: &'static str,
) -> Result<(), EngineError> {
    match value {
        Some(v) if v.len() > max => Err(EngineError::LimitExceeded(what)),
        _ => Ok(()),
    }
}

/// Fail with the first live occupant overlapping `span`, ignoring `exclude`.
pub(crate) fn check_no_conflict(
    busy: &[Busy],
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    match busy
        .iter()
        .find(|b| Some(b.id) != exclude && b.span.overlaps(span))
    {
        Some(b) => Err(EngineError::Conflict(b.id)),
        None => Ok(()),
    }
}
