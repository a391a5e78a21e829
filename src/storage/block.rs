/// Fixed-size storage block (4096 bytes).
///
/// Layout:
///   [BlockHeader (16 bytes)] [Payload ...]
///
/// BlockHeader:
///   block_id:   u64 (8 bytes)
///   next_block: u64 (8 bytes, INVALID_BLOCK when the block ends a chain)
///
/// Blocks are chained by `next_block` when a serialized structure spans
/// more than one block (see `meta_block`).
use crate::config::{BLOCK_HEADER_SIZE, BLOCK_SIZE};

pub type BlockId = u64;

/// Marker for "no block".
pub const INVALID_BLOCK: BlockId = u64::MAX;

#[derive(Clone)]
pub struct Block {
    pub data: [u8; BLOCK_SIZE],
}

impl Block {
    pub fn new(block_id: BlockId) -> Self {
        let mut block = Block {
            data: [0u8; BLOCK_SIZE],
        };
        block.set_block_id(block_id);
        block.set_next_block(INVALID_BLOCK);
        block
    }

    // --- Header accessors ---

    pub fn block_id(&self) -> BlockId {
        u64::from_le_bytes(self.data[0..8].try_into().unwrap())
    }

    pub fn set_block_id(&mut self, id: BlockId) {
        self.data[0..8].copy_from_slice(&id.to_le_bytes());
    }

    pub fn next_block(&self) -> BlockId {
        u64::from_le_bytes(self.data[8..16].try_into().unwrap())
    }

    pub fn set_next_block(&mut self, id: BlockId) {
        self.data[8..16].copy_from_slice(&id.to_le_bytes());
    }

    /// Payload area after the header.
    pub fn payload(&self) -> &[u8] {
        &self.data[BLOCK_HEADER_SIZE..]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.data[BLOCK_HEADER_SIZE..]
    }

    /// Get the raw block bytes.
    pub fn as_bytes(&self) -> &[u8; BLOCK_SIZE] {
        &self.data
    }

    /// Create a block from raw bytes.
    pub fn from_bytes(data: [u8; BLOCK_SIZE]) -> Self {
        Block { data }
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("block_id", &self.block_id())
            .field("next_block", &self.next_block())
            .finish()
    }
}

/// Location of a serialized structure: block id plus byte offset into the
/// block's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockPointer {
    pub block_id: BlockId,
    pub offset: u32,
}

impl BlockPointer {
    pub const INVALID: BlockPointer = BlockPointer {
        block_id: INVALID_BLOCK,
        offset: 0,
    };

    /// Encoded size: block_id (8) + offset (4).
    pub const ENCODED_SIZE: usize = 12;

    pub fn new(block_id: BlockId, offset: u32) -> Self {
        BlockPointer { block_id, offset }
    }

    pub fn is_valid(&self) -> bool {
        self.block_id != INVALID_BLOCK
    }

    pub fn encode(&self) -> [u8; Self::ENCODED_SIZE] {
        let mut buf = [0u8; Self::ENCODED_SIZE];
        buf[0..8].copy_from_slice(&self.block_id.to_le_bytes());
        buf[8..12].copy_from_slice(&self.offset.to_le_bytes());
        buf
    }

    pub fn decode(bytes: &[u8; Self::ENCODED_SIZE]) -> Self {
        BlockPointer {
            block_id: u64::from_le_bytes(bytes[0..8].try_into().unwrap()),
            offset: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BLOCK_PAYLOAD_SIZE;

    #[test]
    fn test_new_block() {
        let block = Block::new(42);
        assert_eq!(block.block_id(), 42);
        assert_eq!(block.next_block(), INVALID_BLOCK);
        assert_eq!(block.payload().len(), BLOCK_PAYLOAD_SIZE);
    }

    #[test]
    fn test_payload_does_not_touch_header() {
        let mut block = Block::new(7);
        block.payload_mut().fill(0xAB);
        block.set_next_block(9);
        assert_eq!(block.block_id(), 7);
        assert_eq!(block.next_block(), 9);
        assert!(block.payload().iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn test_block_pointer_encoding() {
        let ptr = BlockPointer::new(123_456, 789);
        assert_eq!(BlockPointer::decode(&ptr.encode()), ptr);
        assert!(ptr.is_valid());
        assert!(!BlockPointer::INVALID.is_valid());
    }
}
