use crate::model::Ms;

pub const MAX_COMPUTERS: usize = 100_000;
pub const MAX_IMAGES: usize = 50_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_GROUPS_PER_ENTITY: usize = 1_024;

/// Live slots a single computer may carry in the interval index.
pub const MAX_SLOTS_PER_COMPUTER: usize = 10_000;

/// Hard ceiling for block allocations regardless of configuration.
pub const MAX_BLOCK_SIZE: usize = 512;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// One reservation may not span more than a year.
pub const MAX_WINDOW_DURATION_MS: Ms = 366 * 24 * 3_600_000;

/// Upper bound on the search range of alternate-window suggestions.
pub const MAX_SUGGEST_RANGE_MS: Ms = 31 * 24 * 3_600_000;
pub const MAX_SUGGESTIONS: usize = 64;
