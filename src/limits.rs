//! Hard limits enforced per tenant. Requests that exceed them fail with
//! `LimitExceeded` instead of growing state without bound.

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 256;

pub const MAX_RESOURCES_PER_TENANT: usize = 100_000;
pub const MAX_NAME_LEN: usize = 256;

pub const MIN_SLOT_DURATION_MINUTES: u16 = 10;
pub const MAX_SLOT_CAPACITY: u32 = 10_000;

/// Widest inclusive date range a single materialization may cover.
pub const MAX_GENERATION_DAYS: i64 = 366;

pub const MAX_PARTY_SIZE: u32 = 1_000;

pub const MAX_DEAD_LETTER_REASON_LEN: usize = 512;
