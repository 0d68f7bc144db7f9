use crate::model::Ms;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

/// A single booking, session or hold may not span more than 7 days.
pub const MAX_SPAN_DURATION_MS: Ms = 7 * 24 * 3_600_000;

/// Availability: longest slot and smallest step, in minutes.
pub const MAX_SLOT_MINUTES: u32 = 24 * 60;
pub const MIN_STEP_MINUTES: u32 = 5;

/// Availability: furthest horizon for date scans.
pub const MAX_RANGE_DAYS: u32 = 366;

pub const MAX_TOKEN_LEN: usize = 128;
pub const MAX_LABEL_LEN: usize = 256;
pub const MAX_REASON_LEN: usize = 1024;
pub const MAX_NAME_LEN: usize = 256;
