use crate::model::Ms;

pub const MAX_HOSTS: usize = 100_000;
pub const MAX_EVENT_TYPES: usize = 1_000_000;
pub const MAX_RULES_PER_HOST: usize = 256;
pub const MAX_OVERRIDES_PER_HOST: usize = 4_096;
pub const MAX_BOOKINGS_PER_HOST: usize = 500_000;
pub const MAX_BUSY_INTERVALS_PER_HOST: usize = 10_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_USERNAME_LEN: usize = 50;
pub const MAX_SLUG_LEN: usize = 128;
pub const MAX_EMAIL_LEN: usize = 254;
pub const MAX_NOTES_LEN: usize = 4_096;
pub const MAX_URL_LEN: usize = 2_048;

/// Event durations accepted at registration, in minutes.
pub const MIN_EVENT_DURATION_MIN: u32 = 15;
pub const MAX_EVENT_DURATION_MIN: u32 = 240;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;
