//! Node handles and kind dispatch.
//!
//! A [`NodeHandle`] is a small `Copy` value naming a node by kind and slab
//! position. Operations that have to look at any kind of node (freeing a
//! subtree, merge preparation, vacuum, serialization) live here as free
//! functions and dispatch on [`NodeKind`].

use crate::art::branch;
use crate::art::leaf::Leaf;
use crate::art::prefix::Prefix;
use crate::art::Art;
use crate::error::{ArtError, Result};
use crate::storage::block::BlockPointer;
use crate::storage::block_manager::BlockManager;
use crate::storage::meta_block::{MetaBlockReader, MetaBlockWriter};

pub const NODE_KINDS: usize = 6;

/// Node kinds. The discriminant order is the allocator order; `tag()` is the
/// stable on-disk identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Prefix,
    Leaf,
    Branch4,
    Branch16,
    Branch48,
    Branch256,
}

impl NodeKind {
    pub const ALL: [NodeKind; NODE_KINDS] = [
        NodeKind::Prefix,
        NodeKind::Leaf,
        NodeKind::Branch4,
        NodeKind::Branch16,
        NodeKind::Branch48,
        NodeKind::Branch256,
    ];

    pub fn index(self) -> usize {
        match self {
            NodeKind::Prefix => 0,
            NodeKind::Leaf => 1,
            NodeKind::Branch4 => 2,
            NodeKind::Branch16 => 3,
            NodeKind::Branch48 => 4,
            NodeKind::Branch256 => 5,
        }
    }

    pub fn tag(self) -> u8 {
        match self {
            NodeKind::Prefix => 1,
            NodeKind::Leaf => 2,
            NodeKind::Branch4 => 3,
            NodeKind::Branch16 => 4,
            NodeKind::Branch48 => 5,
            NodeKind::Branch256 => 6,
        }
    }

    pub fn from_tag(tag: u8) -> Option<NodeKind> {
        match tag {
            1 => Some(NodeKind::Prefix),
            2 => Some(NodeKind::Leaf),
            3 => Some(NodeKind::Branch4),
            4 => Some(NodeKind::Branch16),
            5 => Some(NodeKind::Branch48),
            6 => Some(NodeKind::Branch256),
            _ => None,
        }
    }

    pub fn is_branch(self) -> bool {
        !matches!(self, NodeKind::Prefix | NodeKind::Leaf)
    }
}

/// Reference to a node: kind plus `(buffer_id, offset)` inside that kind's
/// allocator. The default value, [`NodeHandle::EMPTY`], refers to nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NodeHandle {
    kind: Option<NodeKind>,
    buffer_id: u32,
    offset: u32,
}

impl NodeHandle {
    pub const EMPTY: NodeHandle = NodeHandle {
        kind: None,
        buffer_id: 0,
        offset: 0,
    };

    pub(crate) fn new(kind: NodeKind, buffer_id: u32, offset: u32) -> Self {
        NodeHandle {
            kind: Some(kind),
            buffer_id,
            offset,
        }
    }

    pub fn kind(&self) -> Option<NodeKind> {
        self.kind
    }

    pub fn is_set(&self) -> bool {
        self.kind.is_some()
    }

    pub fn is_prefix(&self) -> bool {
        self.kind == Some(NodeKind::Prefix)
    }

    pub fn is_branch(&self) -> bool {
        self.kind.is_some_and(NodeKind::is_branch)
    }

    pub fn buffer_id(&self) -> u32 {
        self.buffer_id
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// This handle as it will read after its allocator is absorbed by another
    /// tree during a merge.
    pub fn merged(self, flags: &ArtFlags) -> NodeHandle {
        match self.kind {
            Some(kind) => NodeHandle {
                buffer_id: self.buffer_id + flags.merge_buffer_offsets[kind.index()],
                ..self
            },
            None => self,
        }
    }
}

/// Per-kind parameters for a tree-wide pass.
#[derive(Debug, Clone, Default)]
pub struct ArtFlags {
    /// Kinds whose allocator is being vacuumed.
    pub vacuum: [bool; NODE_KINDS],
    /// Buffer id shift applied to each kind when merging.
    pub merge_buffer_offsets: [u32; NODE_KINDS],
}

impl ArtFlags {
    pub fn vacuums(&self, kind: NodeKind) -> bool {
        self.vacuum[kind.index()]
    }
}

/// Free `node` and everything reachable from it, then reset the handle.
pub fn free(art: &mut Art, node: &mut NodeHandle) {
    if !node.is_set() {
        return;
    }
    let mut stack = vec![*node];
    *node = NodeHandle::EMPTY;
    while let Some(current) = stack.pop() {
        stack.extend(art.children(current).iter().copied().filter(NodeHandle::is_set));
        art.release(current);
    }
}

/// Rewrite every handle in the subtree so that it stays valid once the
/// tree's allocators are absorbed with the shifts in `flags`.
pub fn initialize_merge(art: &mut Art, node: &mut NodeHandle, flags: &ArtFlags) {
    if !node.is_set() {
        return;
    }
    let mut stack = vec![*node];
    *node = node.merged(flags);
    while let Some(current) = stack.pop() {
        match current.kind() {
            Some(NodeKind::Prefix) => {
                let old = Prefix::get_mut(art, current).initialize_merge(flags);
                if old.is_set() {
                    stack.push(old);
                }
            }
            Some(NodeKind::Leaf) | None => {}
            Some(_) => stack.extend(branch::initialize_merge(art, current, flags)),
        }
    }
}

/// Move every node of a vacuumed kind out of the buffers being emptied.
pub fn vacuum(art: &mut Art, node: &mut NodeHandle, flags: &ArtFlags) -> Result<()> {
    let Some(kind) = node.kind() else {
        return Ok(());
    };
    if flags.vacuums(kind) && art.allocator(kind).needs_vacuum(*node) {
        *node = art.allocator_mut(kind).relocate(*node)?;
    }
    match kind {
        NodeKind::Prefix => Prefix::vacuum(art, *node, flags),
        NodeKind::Leaf => Ok(()),
        _ => branch::vacuum(art, *node, flags),
    }
}

/// Write the subtree in post-order and return the position of its root.
pub fn serialize<M: BlockManager + ?Sized>(
    art: &Art,
    node: NodeHandle,
    writer: &mut MetaBlockWriter<M>,
) -> Result<BlockPointer> {
    match node.kind() {
        None => Ok(BlockPointer::INVALID),
        Some(NodeKind::Prefix) => Prefix::serialize(art, node, writer),
        Some(NodeKind::Leaf) => Leaf::serialize(art, node, writer),
        Some(_) => branch::serialize(art, node, writer),
    }
}

/// Rebuild the subtree stored at `pointer`.
pub fn deserialize<M: BlockManager + ?Sized>(
    art: &mut Art,
    reader: &mut MetaBlockReader<M>,
    pointer: BlockPointer,
) -> Result<NodeHandle> {
    if !pointer.is_valid() {
        return Ok(NodeHandle::EMPTY);
    }
    reader.seek_record(pointer)?;
    let kind = read_kind(reader)?;
    deserialize_body(art, reader, kind)
}

pub(crate) fn read_kind<M: BlockManager + ?Sized>(
    reader: &mut MetaBlockReader<M>,
) -> Result<NodeKind> {
    let tag = reader.read_u8()?;
    NodeKind::from_tag(tag).ok_or_else(|| ArtError::Corruption(format!("unknown node tag {}", tag)))
}

/// Deserialize a node whose tag has already been consumed.
pub(crate) fn deserialize_body<M: BlockManager + ?Sized>(
    art: &mut Art,
    reader: &mut MetaBlockReader<M>,
    kind: NodeKind,
) -> Result<NodeHandle> {
    match kind {
        NodeKind::Prefix => Prefix::deserialize(art, reader),
        NodeKind::Leaf => Leaf::deserialize(art, reader),
        _ => branch::deserialize(art, reader, kind),
    }
}
