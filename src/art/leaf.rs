use crate::art::node::{NodeHandle, NodeKind};
use crate::art::Art;
use crate::error::{ArtError, Result};
use crate::storage::block::BlockPointer;
use crate::storage::block_manager::BlockManager;
use crate::storage::meta_block::{MetaBlockReader, MetaBlockWriter};

/// Row identifier stored under a key.
pub type RowId = u64;

/// Terminal node: the sorted row ids stored under one full key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Leaf {
    row_ids: Vec<RowId>,
}

impl Leaf {
    pub fn new(art: &mut Art, row_id: RowId) -> Result<NodeHandle> {
        art.leaves.allocate(Leaf {
            row_ids: vec![row_id],
        })
    }

    pub fn row_ids(&self) -> &[RowId] {
        &self.row_ids
    }

    pub fn is_empty(&self) -> bool {
        self.row_ids.is_empty()
    }

    /// Returns false if `row_id` was already present.
    pub fn insert(&mut self, row_id: RowId) -> bool {
        match self.row_ids.binary_search(&row_id) {
            Ok(_) => false,
            Err(pos) => {
                self.row_ids.insert(pos, row_id);
                true
            }
        }
    }

    pub fn remove(&mut self, row_id: RowId) -> bool {
        match self.row_ids.binary_search(&row_id) {
            Ok(pos) => {
                self.row_ids.remove(pos);
                true
            }
            Err(_) => false,
        }
    }

    /// Move all row ids of `r` into `l` and free `r`.
    pub fn merge(art: &mut Art, l: NodeHandle, r: NodeHandle) {
        let other = art.leaves.take(r);
        let leaf = art.leaves.get_mut(l);
        for row_id in other.row_ids {
            leaf.insert(row_id);
        }
    }

    /// Record layout: `[tag][count: u32][row_id: u64]*`.
    pub fn serialize<M: BlockManager + ?Sized>(
        art: &Art,
        node: NodeHandle,
        writer: &mut MetaBlockWriter<M>,
    ) -> Result<BlockPointer> {
        let leaf = art.leaves.get(node);
        let pointer = writer.pointer()?;
        writer.write_u8(NodeKind::Leaf.tag())?;
        writer.write_u32(leaf.row_ids.len() as u32)?;
        for &row_id in &leaf.row_ids {
            writer.write_u64(row_id)?;
        }
        Ok(pointer)
    }

    pub fn deserialize<M: BlockManager + ?Sized>(
        art: &mut Art,
        reader: &mut MetaBlockReader<M>,
    ) -> Result<NodeHandle> {
        let count = reader.read_u32()?;
        if count == 0 {
            return Err(ArtError::Corruption("leaf without row ids".into()));
        }
        let mut row_ids = Vec::with_capacity(count as usize);
        for _ in 0..count {
            row_ids.push(reader.read_u64()?);
        }
        if row_ids.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ArtError::Corruption("leaf row ids out of order".into()));
        }
        art.leaves.allocate(Leaf { row_ids })
    }
}
