use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::Path;

use fs4::fs_std::FileExt;
use lru::LruCache;

use crate::config::{StoreConfig, BLOCK_SIZE, FILE_HEADER_SIZE};
use crate::error::{ArtError, Result};
use crate::storage::block::{Block, BlockId, BlockPointer};
use crate::storage::block_manager::BlockManager;
use crate::storage::freelist::FreeList;

/// On-disk block frame = payload(4096) + crc32(4).
const FRAME_SIZE: usize = BLOCK_SIZE + 4;

/// File header stored raw in block 0.
/// Magic(8) + version(4) + block_count(8) + meta_block(8) + meta_offset(4) + reserved,
/// followed by the free list at FILE_HEADER_SIZE.
const MAGIC: &[u8; 8] = b"ARTPATH1";
const FORMAT_VERSION: u32 = 1;

pub struct FileBlockManager {
    file: File,
    config: StoreConfig,
    block_count: u64,
    meta_pointer: BlockPointer,
    freelist: FreeList,
    cache: LruCache<BlockId, Block>,
}

impl FileBlockManager {
    /// Create a new block file. Fails if the file already exists.
    pub fn create(path: &Path) -> Result<Self> {
        Self::create_with_config(path, StoreConfig::default())
    }

    pub fn create_with_config(path: &Path, config: StoreConfig) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        Self::lock(&file)?;

        let mut manager = FileBlockManager {
            file,
            cache: new_cache(config.cache_capacity),
            config,
            block_count: 1, // block 0 is the file header
            meta_pointer: BlockPointer::INVALID,
            freelist: FreeList::new(),
        };
        manager.write_header()?;
        tracing::debug!(path = %path.display(), "created block file");
        Ok(manager)
    }

    /// Open an existing block file.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_config(path, StoreConfig::default())
    }

    pub fn open_with_config(path: &Path, config: StoreConfig) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Self::lock(&file)?;

        let mut manager = FileBlockManager {
            file,
            cache: new_cache(config.cache_capacity),
            config,
            block_count: 0,
            meta_pointer: BlockPointer::INVALID,
            freelist: FreeList::new(),
        };
        manager.read_header()?;
        tracing::debug!(
            path = %path.display(),
            blocks = manager.block_count,
            free = manager.freelist.len(),
            "opened block file"
        );
        Ok(manager)
    }

    fn lock(file: &File) -> Result<()> {
        file.lock_exclusive()
            .map_err(|e| ArtError::Lock(format!("Failed to acquire exclusive file lock: {}", e)))
    }

    fn write_header(&mut self) -> Result<()> {
        let mut data = [0u8; BLOCK_SIZE];
        data[0..8].copy_from_slice(MAGIC);
        data[8..12].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        data[12..20].copy_from_slice(&self.block_count.to_le_bytes());
        data[20..32].copy_from_slice(&self.meta_pointer.encode());
        // Bytes 32..FILE_HEADER_SIZE reserved

        let (freelist, dropped) = self.freelist.serialize();
        if dropped > 0 {
            tracing::warn!(dropped, "free list exceeds header capacity; blocks leaked");
        }
        data[FILE_HEADER_SIZE..FILE_HEADER_SIZE + freelist.len()].copy_from_slice(&freelist);
        self.write_frame(0, &data)
    }

    fn read_header(&mut self) -> Result<()> {
        let data = self.read_frame(0)?;
        if &data[0..8] != MAGIC {
            return Err(ArtError::Corruption("bad block file magic".into()));
        }
        let version = u32::from_le_bytes(data[8..12].try_into().unwrap());
        if version > FORMAT_VERSION {
            return Err(ArtError::Corruption(format!(
                "unsupported block file version {}",
                version
            )));
        }
        self.block_count = u64::from_le_bytes(data[12..20].try_into().unwrap());
        self.meta_pointer = BlockPointer::decode((&data[20..32]).try_into().unwrap());

        let mut freelist = FreeList::deserialize(&data[FILE_HEADER_SIZE..]);
        if let Err(msg) = freelist.validate(self.block_count) {
            tracing::warn!(%msg, "sanitizing free list");
            freelist.sanitize(self.block_count);
        }
        self.freelist = freelist;
        Ok(())
    }

    fn read_frame(&mut self, block_id: BlockId) -> Result<[u8; BLOCK_SIZE]> {
        let offset = block_id * FRAME_SIZE as u64;
        self.file.seek(SeekFrom::Start(offset))?;

        let mut frame = vec![0u8; FRAME_SIZE];
        self.file.read_exact(&mut frame)?;

        let stored = u32::from_le_bytes(frame[BLOCK_SIZE..].try_into().unwrap());
        if crc32fast::hash(&frame[..BLOCK_SIZE]) != stored {
            return Err(ArtError::Corruption(format!(
                "checksum mismatch in block {}",
                block_id
            )));
        }

        let mut data = [0u8; BLOCK_SIZE];
        data.copy_from_slice(&frame[..BLOCK_SIZE]);
        Ok(data)
    }

    fn write_frame(&mut self, block_id: BlockId, data: &[u8; BLOCK_SIZE]) -> Result<()> {
        let mut frame = Vec::with_capacity(FRAME_SIZE);
        frame.extend_from_slice(data);
        frame.extend_from_slice(&crc32fast::hash(data).to_le_bytes());

        let offset = block_id * FRAME_SIZE as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&frame)?;
        Ok(())
    }

    /// Get current block count (including the header block).
    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    pub fn free_block_count(&self) -> usize {
        self.freelist.len()
    }
}

fn new_cache(capacity: usize) -> LruCache<BlockId, Block> {
    LruCache::new(NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN))
}

impl BlockManager for FileBlockManager {
    fn read_block(&mut self, block_id: BlockId) -> Result<Block> {
        if block_id == 0 || block_id >= self.block_count {
            return Err(ArtError::BlockNotFound(block_id));
        }
        if let Some(block) = self.cache.get(&block_id) {
            return Ok(block.clone());
        }

        let block = Block::from_bytes(self.read_frame(block_id)?);
        if block.block_id() != block_id {
            return Err(ArtError::Corruption(format!(
                "block {} carries id {}",
                block_id,
                block.block_id()
            )));
        }
        self.cache.put(block_id, block.clone());
        Ok(block)
    }

    fn write_block(&mut self, block: &Block) -> Result<()> {
        let block_id = block.block_id();
        if block_id == 0 || block_id >= self.block_count {
            return Err(ArtError::BlockNotFound(block_id));
        }
        self.write_frame(block_id, block.as_bytes())?;
        self.cache.put(block_id, block.clone());
        Ok(())
    }

    fn allocate_block(&mut self) -> Result<Block> {
        let block_id = if let Some(free_id) = self.freelist.allocate() {
            free_id
        } else {
            let id = self.block_count;
            self.block_count += 1;
            id
        };
        tracing::trace!(block_id, "allocated block");
        Ok(Block::new(block_id))
    }

    fn free_block(&mut self, block_id: BlockId) {
        self.cache.pop(&block_id);
        self.freelist.free(block_id);
    }

    fn meta_pointer(&self) -> BlockPointer {
        self.meta_pointer
    }

    fn set_meta_pointer(&mut self, pointer: BlockPointer) {
        self.meta_pointer = pointer;
    }

    fn flush(&mut self) -> Result<()> {
        self.write_header()?;
        if self.config.sync_on_flush {
            self.file.sync_all()?;
        }
        Ok(())
    }
}

impl Drop for FileBlockManager {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_and_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.art");

        {
            let mut manager = FileBlockManager::create(&path).unwrap();
            assert_eq!(manager.block_count(), 1); // header block
            manager.set_meta_pointer(BlockPointer::new(5, 17));
            manager.flush().unwrap();
        }

        {
            let manager = FileBlockManager::open(&path).unwrap();
            assert_eq!(manager.block_count(), 1);
            assert_eq!(manager.meta_pointer(), BlockPointer::new(5, 17));
        }
    }

    #[test]
    fn test_write_and_read_blocks() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.art");

        {
            let mut manager = FileBlockManager::create(&path).unwrap();
            let mut block = manager.allocate_block().unwrap();
            block.payload_mut()[..11].copy_from_slice(b"hello world");
            manager.write_block(&block).unwrap();

            let mut block2 = manager.allocate_block().unwrap();
            block2.payload_mut()[..3].copy_from_slice(b"two");
            manager.write_block(&block2).unwrap();
            manager.flush().unwrap();
        }

        {
            let mut manager = FileBlockManager::open(&path).unwrap();
            assert_eq!(manager.block_count(), 3);
            let block = manager.read_block(1).unwrap();
            assert_eq!(&block.payload()[..11], b"hello world");
            let block2 = manager.read_block(2).unwrap();
            assert_eq!(&block2.payload()[..3], b"two");
        }
    }

    #[test]
    fn test_freelist_survives_flush() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.art");

        {
            let mut manager = FileBlockManager::create(&path).unwrap();
            for _ in 0..3 {
                let block = manager.allocate_block().unwrap();
                manager.write_block(&block).unwrap();
            }
            manager.free_block(2);
            manager.flush().unwrap();
        }

        let mut manager = FileBlockManager::open(&path).unwrap();
        assert_eq!(manager.free_block_count(), 1);
        let reused = manager.allocate_block().unwrap();
        assert_eq!(reused.block_id(), 2);
        assert_eq!(manager.block_count(), 4);
    }

    #[test]
    fn test_checksum_mismatch_is_corruption() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.art");

        {
            let mut manager = FileBlockManager::create(&path).unwrap();
            let mut block = manager.allocate_block().unwrap();
            block.payload_mut()[0] = 1;
            manager.write_block(&block).unwrap();
            manager.flush().unwrap();
        }

        // Flip one payload byte of block 1 on disk.
        {
            let mut file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
            file.seek(SeekFrom::Start(FRAME_SIZE as u64 + 100)).unwrap();
            file.write_all(&[0xEE]).unwrap();
        }

        let mut manager = FileBlockManager::open(&path).unwrap();
        match manager.read_block(1) {
            Err(ArtError::Corruption(_)) => {}
            other => panic!("expected corruption, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_block() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.art");
        let mut manager = FileBlockManager::create(&path).unwrap();
        assert!(matches!(
            manager.read_block(99),
            Err(ArtError::BlockNotFound(99))
        ));
    }
}
