use crate::model::{Ms, MINUTE_MS};

/// Candidate start times are spaced this far apart, from each window start.
pub const GRID_STEP_MS: Ms = 15 * MINUTE_MS;

/// Largest number of slots written in one insert batch.
pub const MAX_INSERT_BATCH: usize = 1000;

/// Longest date range a single run may cover.
pub const MAX_HORIZON_DAYS: u32 = 366;

pub const DEFAULT_HORIZON_DAYS: u32 = 30;
pub const DEFAULT_BUFFER_MINUTES: u32 = 15;

/// Upper bound on a configured buffer (one day).
pub const MAX_BUFFER_MINUTES: u32 = 24 * 60;

pub const MAX_TENANT_ID_LEN: usize = 256;
