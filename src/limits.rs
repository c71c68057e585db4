use crate::model::{Ms, Qty};

pub const MAX_RESOURCES: usize = 100_000;
pub const MAX_PARTS: usize = 100_000;
pub const MAX_WORK_ORDERS: usize = 100_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_REMARKS_LEN: usize = 1024;
pub const MAX_CAPABILITIES: usize = 64;
pub const MAX_PARTS_PER_JOB: usize = 64;
pub const MAX_RESOURCES_PER_APPOINTMENT: usize = 16;

/// Bookings still ahead of (or running at) a new booking's start.
pub const MAX_BOOKINGS_PER_RESOURCE: usize = 100_000;

/// Stock movements kept per part; the oldest are dropped first.
pub const MAX_STOCK_HISTORY: usize = 1024;

pub const DEFAULT_MINIMUM_THRESHOLD: Qty = 5;

pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 3000-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 32_503_680_000_000;

const DAY_MS: Ms = 86_400_000;
pub const MAX_SPAN_DURATION_MS: Ms = 30 * DAY_MS;
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * DAY_MS;

/// Finished bookings, and reservations of invoiced or cancelled jobs, are
/// dropped at compaction once they ended this long ago.
pub const HISTORY_RETENTION_MS: Ms = 90 * DAY_MS;
