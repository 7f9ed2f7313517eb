pub const MAX_TENANTS: usize = 1_000;
pub const MAX_TENANT_NAME_LEN: usize = 128;

pub const MAX_ENTRIES_PER_DAY: usize = 10_000;
pub const MAX_SHARED_WITH: usize = 64;
pub const MAX_TITLE_LEN: usize = 256;
pub const MAX_DESCRIPTION_LEN: usize = 4_096;
pub const MAX_CLIENT_NAME_LEN: usize = 256;

pub const MIN_YEAR: i32 = 1970;
pub const MAX_YEAR: i32 = 9_999;
