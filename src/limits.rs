/// Hard caps on request shape and directory size.
pub const MAX_LABS: usize = 10_000;
pub const MAX_COMPONENTS: usize = 100_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_PURPOSE_LEN: usize = 2_000;
pub const MAX_REMARKS_LEN: usize = 2_000;
pub const MAX_LABS_PER_REQUEST: usize = 16;
pub const MAX_ITEMS_PER_REQUEST: usize = 64;
pub const MAX_ITEM_QUANTITY: u32 = 1_000_000;
pub const MAX_TIMETABLE_ENTRIES_PER_LAB: usize = 512;
pub const MAX_QUERY_LABS: usize = 64;

/// Longest accepted wire line (bytes).
pub const MAX_LINE_LEN: usize = 64 * 1024;
