use crate::model::Ms;

/// Earliest accepted instant: 2000-01-01T00:00:00Z.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;

/// Latest accepted instant: 2100-01-01T00:00:00Z.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// A single appointment never spans more than a day.
pub const MAX_SPAN_DURATION_MS: Ms = 24 * 3_600_000;

pub const MAX_NAME_LEN: usize = 200;

pub const MAX_NOTES_LEN: usize = 2_000;

/// Cap on slot rows per staff member per day (5-minute granularity over
/// 24h). Bounds the calendar scans.
pub const MAX_SLOTS_PER_DAY: usize = 288;

pub const MAX_SHOPS: usize = 10_000;

pub const MAX_USERS: usize = 1_000_000;

pub const MAX_SERVICES: usize = 100_000;
