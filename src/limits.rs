pub const MAX_EVENTS: usize = 100_000;
pub const MAX_RESOURCES: usize = 100_000;
pub const MAX_ALLOCATIONS_PER_RESOURCE: usize = 10_000;

pub const MAX_TITLE_LEN: usize = 256;
pub const MAX_DESCRIPTION_LEN: usize = 4096;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_KIND_LEN: usize = 256;
