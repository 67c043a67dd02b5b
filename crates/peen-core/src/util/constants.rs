/// Page shift value (12 bits) for 4KB pages
pub const PAGE_SHIFT: usize = 12;
/// Standard page size (4096 bytes)
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
/// Mask for extracting the page offset
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

/// Row shift value (13 bits) for 8KB rows
pub const ROW_SHIFT: usize = 13;
/// Standard DRAM row size (8192 bytes)
pub const ROW_SIZE: usize = 1 << ROW_SHIFT;

/// Number of 4KB pages per DRAM row
pub const PAGES_PER_ROW: usize = ROW_SIZE / PAGE_SIZE;

/// Cache line size (64 bytes) for x86_64
pub const CL_SIZE: usize = 64;

/// Pagemap entries fetched per read (1 KiB worth of 8-byte entries)
pub const PAGEMAP_CHUNK: usize = 128;
