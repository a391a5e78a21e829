use std::collections::HashMap;

use crate::error::{ArtError, Result};
use crate::storage::block::{Block, BlockId, BlockPointer};
use crate::storage::block_manager::BlockManager;
use crate::storage::freelist::FreeList;

/// Block manager that keeps every block in memory.
#[derive(Default)]
pub struct InMemoryBlockManager {
    blocks: HashMap<BlockId, Block>,
    block_count: u64,
    freelist: FreeList,
    meta_pointer: Option<BlockPointer>,
}

impl InMemoryBlockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks currently holding data (allocated and not freed).
    pub fn used_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn free_blocks(&self) -> usize {
        self.freelist.len()
    }

    /// Overwrite a stored byte, bypassing the block API. Used to simulate
    /// on-disk corruption in tests.
    pub fn corrupt_byte(&mut self, block_id: BlockId, index: usize, value: u8) {
        if let Some(block) = self.blocks.get_mut(&block_id) {
            block.data[index] = value;
        }
    }
}

impl BlockManager for InMemoryBlockManager {
    fn read_block(&mut self, block_id: BlockId) -> Result<Block> {
        self.blocks
            .get(&block_id)
            .cloned()
            .ok_or(ArtError::BlockNotFound(block_id))
    }

    fn write_block(&mut self, block: &Block) -> Result<()> {
        self.blocks.insert(block.block_id(), block.clone());
        Ok(())
    }

    fn allocate_block(&mut self) -> Result<Block> {
        let block_id = match self.freelist.allocate() {
            Some(id) => id,
            None => {
                let id = self.block_count;
                self.block_count += 1;
                id
            }
        };
        Ok(Block::new(block_id))
    }

    fn free_block(&mut self, block_id: BlockId) {
        self.blocks.remove(&block_id);
        self.freelist.free(block_id);
    }

    fn meta_pointer(&self) -> BlockPointer {
        self.meta_pointer.unwrap_or(BlockPointer::INVALID)
    }

    fn set_meta_pointer(&mut self, pointer: BlockPointer) {
        self.meta_pointer = Some(pointer);
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}
