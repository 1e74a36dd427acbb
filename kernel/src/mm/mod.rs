// =============================================================================
// Tern OS - Memory Management
// =============================================================================

pub mod heap;
pub mod paging;

pub use paging::{Granule, MapOutcome, MemoryAttr, PageTableManager, Privilege};

/// Size of a translation granule page.
pub const PAGE_SIZE: u64 = 0x1000;

/// Size of an L2 block mapping.
pub const BLOCK_SIZE: u64 = 0x20_0000;
