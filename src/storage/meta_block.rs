/// Sequential byte streams over chained blocks.
///
/// A `MetaBlockWriter` appends bytes into the payload of the current block and
/// links a freshly allocated block through `next_block` whenever the payload
/// fills up. Any position in the stream can be addressed by a `BlockPointer`
/// (block id + payload offset); a `MetaBlockReader` seeks to such a pointer and
/// reads forward, following the `next_block` links.
use std::collections::{BTreeSet, HashSet};

use crate::config::BLOCK_PAYLOAD_SIZE;
use crate::error::{ArtError, Result};
use crate::storage::block::{Block, BlockId, BlockPointer, INVALID_BLOCK};
use crate::storage::block_manager::BlockManager;

pub struct MetaBlockWriter<'a, M: BlockManager + ?Sized> {
    manager: &'a mut M,
    block: Block,
    offset: usize,
    written: Vec<BlockId>,
}

impl<'a, M: BlockManager + ?Sized> MetaBlockWriter<'a, M> {
    pub fn new(manager: &'a mut M) -> Result<Self> {
        let block = manager.allocate_block()?;
        let written = vec![block.block_id()];
        Ok(MetaBlockWriter {
            manager,
            block,
            offset: 0,
            written,
        })
    }

    /// Location of the next byte to be written.
    pub fn pointer(&mut self) -> Result<BlockPointer> {
        if self.offset == BLOCK_PAYLOAD_SIZE {
            self.advance()?;
        }
        Ok(BlockPointer::new(self.block.block_id(), self.offset as u32))
    }

    pub fn write_bytes(&mut self, mut bytes: &[u8]) -> Result<()> {
        while !bytes.is_empty() {
            if self.offset == BLOCK_PAYLOAD_SIZE {
                self.advance()?;
            }
            let n = bytes.len().min(BLOCK_PAYLOAD_SIZE - self.offset);
            self.block.payload_mut()[self.offset..self.offset + n].copy_from_slice(&bytes[..n]);
            self.offset += n;
            bytes = &bytes[n..];
        }
        Ok(())
    }

    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.write_bytes(&[value])
    }

    pub fn write_u16(&mut self, value: u16) -> Result<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    pub fn write_pointer(&mut self, pointer: BlockPointer) -> Result<()> {
        self.write_bytes(&pointer.encode())
    }

    fn advance(&mut self) -> Result<()> {
        let next = self.manager.allocate_block()?;
        self.block.set_next_block(next.block_id());
        self.manager.write_block(&self.block)?;
        self.written.push(next.block_id());
        self.block = next;
        self.offset = 0;
        Ok(())
    }

    /// Write out the last block and return every block id this writer used.
    pub fn finish(self) -> Result<Vec<BlockId>> {
        self.manager.write_block(&self.block)?;
        Ok(self.written)
    }
}

pub struct MetaBlockReader<'a, M: BlockManager + ?Sized> {
    manager: &'a mut M,
    block: Option<Block>,
    offset: usize,
    visited: BTreeSet<BlockId>,
    records: HashSet<BlockPointer>,
}

impl<'a, M: BlockManager + ?Sized> MetaBlockReader<'a, M> {
    pub fn new(manager: &'a mut M) -> Self {
        MetaBlockReader {
            manager,
            block: None,
            offset: 0,
            visited: BTreeSet::new(),
            records: HashSet::new(),
        }
    }

    /// Every block this reader has loaded so far.
    pub fn visited_blocks(&self) -> Vec<BlockId> {
        self.visited.iter().copied().collect()
    }

    fn load(&mut self, block_id: BlockId) -> Result<Block> {
        let block = self.manager.read_block(block_id)?;
        self.visited.insert(block_id);
        Ok(block)
    }

    /// Position the reader at `pointer`.
    pub fn seek(&mut self, pointer: BlockPointer) -> Result<()> {
        if !pointer.is_valid() {
            return Err(ArtError::Corruption("seek to invalid block pointer".into()));
        }
        let offset = pointer.offset as usize;
        if offset > BLOCK_PAYLOAD_SIZE {
            return Err(ArtError::Corruption(format!(
                "block offset {} beyond payload size",
                offset
            )));
        }
        let reuse = matches!(&self.block, Some(b) if b.block_id() == pointer.block_id);
        if !reuse {
            self.block = Some(self.load(pointer.block_id)?);
        }
        self.offset = offset;
        Ok(())
    }

    /// Position the reader at the start of a record. Every record of a
    /// checkpoint is referenced once, so a second visit means the stored
    /// pointers form a cycle or a shared subtree.
    pub fn seek_record(&mut self, pointer: BlockPointer) -> Result<()> {
        if !self.records.insert(pointer) {
            return Err(ArtError::Corruption(format!(
                "record at block {} offset {} referenced twice",
                pointer.block_id, pointer.offset
            )));
        }
        self.seek(pointer)
    }

    pub fn read_bytes(&mut self, mut out: &mut [u8]) -> Result<()> {
        while !out.is_empty() {
            let block = self
                .block
                .as_ref()
                .ok_or_else(|| ArtError::Internal("read before seek".into()))?;
            if self.offset == BLOCK_PAYLOAD_SIZE {
                let next = block.next_block();
                if next == INVALID_BLOCK {
                    return Err(ArtError::Corruption("read past end of block chain".into()));
                }
                self.block = Some(self.load(next)?);
                self.offset = 0;
                continue;
            }
            let n = out.len().min(BLOCK_PAYLOAD_SIZE - self.offset);
            out[..n].copy_from_slice(&block.payload()[self.offset..self.offset + n]);
            self.offset += n;
            out = &mut out[n..];
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_bytes(&mut buf)?;
        Ok(buf[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_bytes(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_bytes(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_bytes(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn read_pointer(&mut self) -> Result<BlockPointer> {
        let mut buf = [0u8; BlockPointer::ENCODED_SIZE];
        self.read_bytes(&mut buf)?;
        Ok(BlockPointer::decode(&buf))
    }
}
