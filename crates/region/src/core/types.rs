//! Constants shared by the allocator, the pools and the string builder

/// Block sizing
///
/// Every block the allocator hands out is a whole number of boundary
/// units. A block's size class is that number of units.
pub mod boundary {
    /// log2 of [`BOUNDARY_SIZE`]
    pub const BOUNDARY_INDEX: u32 = 12;

    /// Size of one boundary unit
    pub const BOUNDARY_SIZE: usize = 1 << BOUNDARY_INDEX;

    /// Number of free-list buckets; bucket 0 is the overflow sink
    pub const MAX_INDEX: usize = 20;

    /// Smallest block handed out by a default-configured allocator
    pub const MIN_ALLOC: usize = 8192;

    /// Size class (in boundary units) of a block size that is already a
    /// multiple of [`BOUNDARY_SIZE`]
    #[inline]
    pub const fn units(size: usize) -> usize {
        size >> BOUNDARY_INDEX
    }
}

/// Memory alignment requirements
pub mod alignment {
    /// Every pool allocation is rounded up to this
    pub const DEFAULT_ALIGN: usize = 8;

    /// Alignment of block starts obtained from the system heap
    pub const BLOCK_ALIGN: usize = 16;
}

/// Smallest buffer the string builder grows to on its first flush
pub const MIN_STRING_SIZE: usize = 32;

/// Byte written over released memory by the instrumented backend
pub const POISON_BYTE: u8 = b'A';

/// Tag given to the process-wide root pool
pub const GLOBAL_POOL_TAG: &str = "global_pool";
