use crate::model::Ms;

pub const MAX_TENANTS: usize = 64;
pub const MAX_TENANT_NAME_LEN: usize = 128;

pub const MAX_OWNERS_PER_TENANT: usize = 10_000;
pub const MAX_SUBMISSIONS_PER_TENANT: usize = 20_000;
pub const MAX_AVAILABILITIES_PER_OWNER: usize = 1_000;
pub const MAX_SLOTS_PER_SCHEDULE: usize = 10_000;
pub const MAX_RELEASES_PER_TENANT: usize = 1_000;
pub const MAX_SPEAKERS_PER_SUBMISSION: usize = 32;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_TITLE_LEN: usize = 1_024;
pub const MAX_VERSION_LEN: usize = 190;
pub const MAX_COMMENT_LEN: usize = 4_096;

pub const MAX_BATCH_SIZE: usize = 1_000;
pub const MAX_IN_CLAUSE_IDS: usize = 256;

pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
/// A single availability or slot may not exceed 31 days.
pub const MAX_SPAN_DURATION_MS: Ms = 31 * 24 * 3_600_000;
/// Availability queries are capped at one year.
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * 24 * 3_600_000;

/// Widest grid timetable column, in characters.
pub const MAX_COLUMN_WIDTH: usize = 200;

pub const DEFAULT_SLOT_DURATION_MS: Ms = 30 * 60_000;
pub const DEFAULT_TIMEZONE: &str = "UTC";
