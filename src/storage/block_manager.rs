use crate::error::Result;
use crate::storage::block::{Block, BlockId, BlockPointer};

/// Abstraction over block I/O.
///
/// Implemented by `FileBlockManager` (single-file store) and
/// `InMemoryBlockManager` (tests and transient indexes).
pub trait BlockManager {
    fn read_block(&mut self, block_id: BlockId) -> Result<Block>;
    fn write_block(&mut self, block: &Block) -> Result<()>;
    fn allocate_block(&mut self) -> Result<Block>;
    fn free_block(&mut self, block_id: BlockId);

    /// Root of the most recent checkpoint, `BlockPointer::INVALID` if none.
    fn meta_pointer(&self) -> BlockPointer;
    fn set_meta_pointer(&mut self, pointer: BlockPointer);

    /// Persist header state (meta pointer, free list).
    fn flush(&mut self) -> Result<()>;
}
