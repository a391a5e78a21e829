//! Configuration constants and tunables.
//!
//! Constants that depend on each other live next to each other:
//!
//! ```text
//! BLOCK_SIZE (4096)
//!       │
//!       ├─> BLOCK_HEADER_SIZE (16: block_id u64 + next u64)
//!       │
//!       ├─> BLOCK_PAYLOAD_SIZE (derived)
//!       │
//!       └─> MAX_HEADER_FREE_ENTRIES (free list entries that fit in block 0)
//!
//! SLOTS_PER_BUFFER (256)
//!       │
//!       └─> vacuum considers a kind worth compacting once at least
//!           DEFAULT_VACUUM_THRESHOLD_PERCENT of its slots are free
//! ```

/// Size of one persisted block.
pub const BLOCK_SIZE: usize = 4096;

/// Per-block header: `[block_id: u64][next_block: u64]`.
pub const BLOCK_HEADER_SIZE: usize = 16;

pub const BLOCK_PAYLOAD_SIZE: usize = BLOCK_SIZE - BLOCK_HEADER_SIZE;

/// Bytes of block 0 used by the fixed part of the file header.
pub const FILE_HEADER_SIZE: usize = 64;

/// Free block ids that fit in block 0 after the fixed header (8 bytes each).
pub const MAX_HEADER_FREE_ENTRIES: usize = (BLOCK_SIZE - FILE_HEADER_SIZE - 8) / 8;

/// Default LRU capacity (in blocks) of the file block manager read cache.
pub const DEFAULT_CACHE_CAPACITY: usize = 256;

/// Node slots per allocator buffer.
pub const SLOTS_PER_BUFFER: usize = 256;

/// A node kind is vacuumed only when at least this share of its slots is free.
pub const DEFAULT_VACUUM_THRESHOLD_PERCENT: usize = 10;

const _: () = assert!(BLOCK_PAYLOAD_SIZE == BLOCK_SIZE - BLOCK_HEADER_SIZE);
const _: () = assert!(FILE_HEADER_SIZE + 8 + MAX_HEADER_FREE_ENTRIES * 8 <= BLOCK_SIZE);
const _: () = assert!(SLOTS_PER_BUFFER <= u32::MAX as usize);

/// Settings for [`crate::storage::file_manager::FileBlockManager`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Number of blocks kept in the read cache.
    pub cache_capacity: usize,
    /// Call `fsync` on every `flush`.
    pub sync_on_flush: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            sync_on_flush: true,
        }
    }
}

/// Settings for [`crate::art::Art`].
#[derive(Debug, Clone)]
pub struct ArtConfig {
    /// Upper bound on buffers per node kind. `None` means unbounded.
    pub max_buffers_per_kind: Option<usize>,
    pub vacuum_threshold_percent: usize,
}

impl Default for ArtConfig {
    fn default() -> Self {
        ArtConfig {
            max_buffers_per_kind: None,
            vacuum_threshold_percent: DEFAULT_VACUUM_THRESHOLD_PERCENT,
        }
    }
}
