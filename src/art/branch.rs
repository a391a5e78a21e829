//! Inner nodes with 4, 16, 48 or 256 children.
//!
//! All four sizes share one layout, `Branch<N>`: `count` sorted edge bytes and
//! the matching child handles. A branch grows into the next size when it is
//! full and shrinks when it falls below the smaller size's threshold.

use crate::art::node::{self, ArtFlags, NodeHandle, NodeKind};
use crate::art::Art;
use crate::error::{ArtError, Result};
use crate::storage::block::BlockPointer;
use crate::storage::block_manager::BlockManager;
use crate::storage::meta_block::{MetaBlockReader, MetaBlockWriter};

#[derive(Debug, Clone, Copy)]
pub struct Branch<const N: usize> {
    count: u16,
    keys: [u8; N],
    children: [NodeHandle; N],
}

impl<const N: usize> Default for Branch<N> {
    fn default() -> Self {
        Branch {
            count: 0,
            keys: [0; N],
            children: [NodeHandle::EMPTY; N],
        }
    }
}

impl<const N: usize> Branch<N> {
    fn from_entries(entries: &[(u8, NodeHandle)]) -> Self {
        debug_assert!(entries.len() <= N);
        let mut branch = Branch::default();
        for (i, &(byte, child)) in entries.iter().enumerate() {
            branch.keys[i] = byte;
            branch.children[i] = child;
        }
        branch.count = entries.len() as u16;
        branch
    }

    pub fn len(&self) -> usize {
        self.count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == N
    }

    pub fn keys(&self) -> &[u8] {
        &self.keys[..self.len()]
    }

    pub fn children(&self) -> &[NodeHandle] {
        &self.children[..self.len()]
    }

    pub fn children_mut(&mut self) -> &mut [NodeHandle] {
        let len = self.len();
        &mut self.children[..len]
    }

    pub fn child(&self, byte: u8) -> Option<NodeHandle> {
        self.keys()
            .binary_search(&byte)
            .ok()
            .map(|pos| self.children[pos])
    }

    pub fn entries(&self) -> impl Iterator<Item = (u8, NodeHandle)> + '_ {
        self.keys().iter().copied().zip(self.children().iter().copied())
    }

    fn set(&mut self, byte: u8, child: NodeHandle) {
        match self.keys().binary_search(&byte) {
            Ok(pos) => self.children[pos] = child,
            Err(_) => debug_assert!(false, "no child at byte {:#04x}", byte),
        }
    }

    fn insert(&mut self, byte: u8, child: NodeHandle) {
        debug_assert!(!self.is_full());
        let len = self.len();
        match self.keys().binary_search(&byte) {
            Ok(pos) => self.children[pos] = child,
            Err(pos) => {
                self.keys.copy_within(pos..len, pos + 1);
                self.children.copy_within(pos..len, pos + 1);
                self.keys[pos] = byte;
                self.children[pos] = child;
                self.count += 1;
            }
        }
    }

    fn remove(&mut self, byte: u8) -> Option<NodeHandle> {
        let len = self.len();
        let pos = self.keys().binary_search(&byte).ok()?;
        let child = self.children[pos];
        self.keys.copy_within(pos + 1..len, pos);
        self.children.copy_within(pos + 1..len, pos);
        self.children[len - 1] = NodeHandle::EMPTY;
        self.count -= 1;
        Some(child)
    }
}

macro_rules! with_branch {
    ($art:expr, $node:expr, |$b:ident| $body:expr) => {
        match $node.kind() {
            Some(NodeKind::Branch4) => {
                let $b = $art.branch4.get($node);
                $body
            }
            Some(NodeKind::Branch16) => {
                let $b = $art.branch16.get($node);
                $body
            }
            Some(NodeKind::Branch48) => {
                let $b = $art.branch48.get($node);
                $body
            }
            Some(NodeKind::Branch256) => {
                let $b = $art.branch256.get($node);
                $body
            }
            other => panic!("expected a branch node, found {:?}", other),
        }
    };
}

macro_rules! with_branch_mut {
    ($art:expr, $node:expr, |$b:ident| $body:expr) => {
        match $node.kind() {
            Some(NodeKind::Branch4) => {
                let $b = $art.branch4.get_mut($node);
                $body
            }
            Some(NodeKind::Branch16) => {
                let $b = $art.branch16.get_mut($node);
                $body
            }
            Some(NodeKind::Branch48) => {
                let $b = $art.branch48.get_mut($node);
                $body
            }
            Some(NodeKind::Branch256) => {
                let $b = $art.branch256.get_mut($node);
                $body
            }
            other => panic!("expected a branch node, found {:?}", other),
        }
    };
}

pub(crate) use with_branch;

pub fn capacity(kind: NodeKind) -> usize {
    match kind {
        NodeKind::Branch4 => 4,
        NodeKind::Branch16 => 16,
        NodeKind::Branch48 => 48,
        NodeKind::Branch256 => 256,
        NodeKind::Prefix | NodeKind::Leaf => 0,
    }
}

/// Smallest branch kind holding `count` children.
pub fn kind_for(count: usize) -> NodeKind {
    debug_assert!(count <= 256);
    match count {
        0..=4 => NodeKind::Branch4,
        5..=16 => NodeKind::Branch16,
        17..=48 => NodeKind::Branch48,
        _ => NodeKind::Branch256,
    }
}

/// Kind to shrink into after a removal left `count` children, if any.
fn shrink_target(kind: NodeKind, count: usize) -> Option<NodeKind> {
    match kind {
        NodeKind::Branch16 if count < 4 => Some(NodeKind::Branch4),
        NodeKind::Branch48 if count < 12 => Some(NodeKind::Branch16),
        NodeKind::Branch256 if count <= 36 => Some(NodeKind::Branch48),
        _ => None,
    }
}

fn build(art: &mut Art, kind: NodeKind, entries: &[(u8, NodeHandle)]) -> Result<NodeHandle> {
    debug_assert!(entries.windows(2).all(|w| w[0].0 < w[1].0));
    match kind {
        NodeKind::Branch4 => art.branch4.allocate(Branch::from_entries(entries)),
        NodeKind::Branch16 => art.branch16.allocate(Branch::from_entries(entries)),
        NodeKind::Branch48 => art.branch48.allocate(Branch::from_entries(entries)),
        NodeKind::Branch256 => art.branch256.allocate(Branch::from_entries(entries)),
        NodeKind::Prefix | NodeKind::Leaf => Err(ArtError::Internal(format!(
            "{:?} is not a branch kind",
            kind
        ))),
    }
}

/// New branch over `entries` (any order, distinct bytes), in the smallest
/// kind that fits.
pub fn new_branch(art: &mut Art, entries: &[(u8, NodeHandle)]) -> Result<NodeHandle> {
    let mut sorted = entries.to_vec();
    sorted.sort_unstable_by_key(|&(byte, _)| byte);
    build(art, kind_for(sorted.len()), &sorted)
}

pub fn count(art: &Art, node: NodeHandle) -> usize {
    with_branch!(art, node, |b| b.len())
}

pub fn get_child(art: &Art, node: NodeHandle, byte: u8) -> Option<NodeHandle> {
    with_branch!(art, node, |b| b.child(byte))
}

/// Replace the child at an existing edge.
pub fn set_child(art: &mut Art, node: NodeHandle, byte: u8, child: NodeHandle) {
    with_branch_mut!(art, node, |b| b.set(byte, child))
}

pub fn entries(art: &Art, node: NodeHandle) -> Vec<(u8, NodeHandle)> {
    with_branch!(art, node, |b| b.entries().collect())
}

/// Add an edge, growing into the next kind if the branch is full.
pub fn insert_child(art: &mut Art, node: &mut NodeHandle, byte: u8, child: NodeHandle) -> Result<()> {
    let current = *node;
    if !with_branch!(art, current, |b| b.is_full()) {
        with_branch_mut!(art, current, |b| b.insert(byte, child));
        return Ok(());
    }
    let mut all = entries(art, current);
    all.push((byte, child));
    all.sort_unstable_by_key(|&(byte, _)| byte);
    let grown = build(art, kind_for(all.len()), &all)?;
    art.release(current);
    tracing::trace!(from = ?current.kind(), to = ?grown.kind(), "branch grown");
    *node = grown;
    Ok(())
}

/// Remove the edge at `byte` and return its child, which the caller now
/// owns. The branch may be replaced by a smaller kind.
pub fn remove_child(art: &mut Art, node: &mut NodeHandle, byte: u8) -> Result<Option<NodeHandle>> {
    let current = *node;
    let removed = with_branch_mut!(art, current, |b| b.remove(byte));
    let Some(kind) = current.kind() else {
        return Ok(removed);
    };
    if let Some(target) = shrink_target(kind, count(art, current)) {
        let all = entries(art, current);
        let shrunk = build(art, target, &all)?;
        art.release(current);
        tracing::trace!(from = ?kind, to = ?target, "branch shrunk");
        *node = shrunk;
    }
    Ok(removed)
}

/// Rewrite the child handles for a merge and return their old values.
pub fn initialize_merge(art: &mut Art, node: NodeHandle, flags: &ArtFlags) -> Vec<NodeHandle> {
    with_branch_mut!(art, node, |b| b
        .children_mut()
        .iter_mut()
        .map(|child| {
            let old = *child;
            *child = old.merged(flags);
            old
        })
        .collect())
}

pub fn vacuum(art: &mut Art, node: NodeHandle, flags: &ArtFlags) -> Result<()> {
    for (byte, old) in entries(art, node) {
        let mut child = old;
        node::vacuum(art, &mut child, flags)?;
        if child != old {
            set_child(art, node, byte, child);
        }
    }
    Ok(())
}

/// Record layout: `[tag][count: u16][key bytes][child pointer]*`, written
/// after all children.
pub fn serialize<M: BlockManager + ?Sized>(
    art: &Art,
    node: NodeHandle,
    writer: &mut MetaBlockWriter<M>,
) -> Result<BlockPointer> {
    let children = entries(art, node);
    let mut pointers = Vec::with_capacity(children.len());
    for &(_, child) in &children {
        pointers.push(node::serialize(art, child, writer)?);
    }

    let kind = node
        .kind()
        .ok_or_else(|| ArtError::Internal("serializing an empty branch handle".into()))?;
    let pointer = writer.pointer()?;
    writer.write_u8(kind.tag())?;
    writer.write_u16(children.len() as u16)?;
    for &(byte, _) in &children {
        writer.write_u8(byte)?;
    }
    for child in pointers {
        writer.write_pointer(child)?;
    }
    Ok(pointer)
}

/// Read a branch whose tag has already been consumed.
pub fn deserialize<M: BlockManager + ?Sized>(
    art: &mut Art,
    reader: &mut MetaBlockReader<M>,
    kind: NodeKind,
) -> Result<NodeHandle> {
    let count = reader.read_u16()? as usize;
    if count == 0 || count > capacity(kind) {
        return Err(ArtError::Corruption(format!(
            "{:?} with {} children",
            kind, count
        )));
    }
    let mut keys = vec![0u8; count];
    reader.read_bytes(&mut keys)?;
    if keys.windows(2).any(|w| w[0] >= w[1]) {
        return Err(ArtError::Corruption(format!("{:?} keys out of order", kind)));
    }
    let mut pointers = Vec::with_capacity(count);
    for _ in 0..count {
        pointers.push(reader.read_pointer()?);
    }

    let mut children = Vec::with_capacity(count);
    for (byte, pointer) in keys.into_iter().zip(pointers) {
        let child = node::deserialize(art, reader, pointer)?;
        if !child.is_set() {
            return Err(ArtError::Corruption(format!(
                "{:?} edge {:#04x} without child",
                kind, byte
            )));
        }
        children.push((byte, child));
    }
    build(art, kind, &children)
}
