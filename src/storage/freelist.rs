use crate::config::MAX_HEADER_FREE_ENTRIES;
use crate::storage::block::BlockId;

/// Free block ids, kept in memory and written into the file header on flush.
///
/// Header area format: [count: u64] [block_id: u64 ...]
#[derive(Default, Debug)]
pub struct FreeList {
    free_blocks: Vec<BlockId>,
}

impl FreeList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a free block. Returns None if no free blocks are available.
    pub fn allocate(&mut self) -> Option<BlockId> {
        self.free_blocks.pop()
    }

    /// Return a block to the free list.
    /// Panics in debug mode if the block is already free (double-free).
    /// In release mode the duplicate is ignored.
    pub fn free(&mut self, block_id: BlockId) {
        if self.free_blocks.contains(&block_id) {
            debug_assert!(
                false,
                "double-free detected: block {} is already in freelist",
                block_id
            );
            return;
        }
        self.free_blocks.push(block_id);
    }

    pub fn len(&self) -> usize {
        self.free_blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.free_blocks.is_empty()
    }

    /// Serialize into the header area. Entries beyond `MAX_HEADER_FREE_ENTRIES`
    /// are not persisted; the returned count tells the caller how many were dropped.
    pub fn serialize(&self) -> (Vec<u8>, usize) {
        let kept = self.free_blocks.len().min(MAX_HEADER_FREE_ENTRIES);
        let mut buf = Vec::with_capacity(8 + kept * 8);
        buf.extend_from_slice(&(kept as u64).to_le_bytes());
        for &block_id in &self.free_blocks[..kept] {
            buf.extend_from_slice(&block_id.to_le_bytes());
        }
        (buf, self.free_blocks.len() - kept)
    }

    pub fn deserialize(data: &[u8]) -> Self {
        if data.len() < 8 {
            return FreeList::new();
        }
        let count = u64::from_le_bytes(data[0..8].try_into().unwrap()) as usize;
        let mut free_blocks = Vec::with_capacity(count.min(MAX_HEADER_FREE_ENTRIES));
        for i in 0..count {
            let offset = 8 + i * 8;
            if offset + 8 > data.len() {
                break;
            }
            free_blocks.push(u64::from_le_bytes(
                data[offset..offset + 8].try_into().unwrap(),
            ));
        }
        FreeList { free_blocks }
    }

    /// Validate that all entries are below `block_count` and unique.
    pub fn validate(&self, block_count: u64) -> std::result::Result<(), String> {
        let mut seen = std::collections::HashSet::new();
        for &bid in &self.free_blocks {
            if bid >= block_count {
                return Err(format!(
                    "freelist entry {} is beyond block_count {}",
                    bid, block_count
                ));
            }
            if !seen.insert(bid) {
                return Err(format!("duplicate freelist entry: block {}", bid));
            }
        }
        Ok(())
    }

    /// Drop out-of-range and duplicate entries.
    pub fn sanitize(&mut self, block_count: u64) {
        let mut seen = std::collections::HashSet::new();
        self.free_blocks
            .retain(|&bid| bid < block_count && seen.insert(bid));
    }
}
