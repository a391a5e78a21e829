//! Adaptive radix tree index.
//!
//! Keys are byte strings; each full key maps to a sorted set of row ids.
//! Paths without branching are compressed into [`prefix::Prefix`] chains.
//! All nodes live in per-kind slab allocators owned by the [`Art`]; the tree
//! only holds [`NodeHandle`]s.
//!
//! Structural operations are written functionally: each step takes the
//! handle of a subtree and returns the handle that replaces it.

pub mod allocator;
pub mod branch;
pub mod key;
pub mod leaf;
pub mod node;
pub mod prefix;


use std::collections::HashSet;

use crate::config::ArtConfig;
use crate::error::{ArtError, Result};
use crate::storage::block::{BlockId, BlockPointer};
use crate::storage::block_manager::BlockManager;
use crate::storage::meta_block::{MetaBlockReader, MetaBlockWriter};

use allocator::{FixedSizeAllocator, NodeAllocator};
use branch::{with_branch, Branch};
use key::ArtKey;
use leaf::{Leaf, RowId};
use node::{ArtFlags, NodeHandle, NodeKind, NODE_KINDS};
use prefix::Prefix;

pub struct Art {
    pub(crate) prefixes: FixedSizeAllocator<Prefix>,
    pub(crate) leaves: FixedSizeAllocator<Leaf>,
    pub(crate) branch4: FixedSizeAllocator<Branch<4>>,
    pub(crate) branch16: FixedSizeAllocator<Branch<16>>,
    pub(crate) branch48: FixedSizeAllocator<Branch<48>>,
    pub(crate) branch256: FixedSizeAllocator<Branch<256>>,
    root: NodeHandle,
    config: ArtConfig,
    /// Blocks holding the last checkpoint written or loaded.
    persisted_blocks: Vec<BlockId>,
}

/// Result of erasing below a node.
enum Erased {
    /// The subtree is now rooted here (possibly `EMPTY`).
    Node(NodeHandle),
    /// A branch was left with a single edge and has been freed; the caller
    /// must fold `byte` and `child` into the path above.
    Collapsed { byte: u8, child: NodeHandle },
}

/// Node and buffer counts, plus shape figures for prefix chains.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtStats {
    pub nodes: [usize; NODE_KINDS],
    pub buffers: [usize; NODE_KINDS],
    pub keys: usize,
    pub row_ids: usize,
    pub prefix_chains: usize,
    pub prefix_bytes: usize,
    pub longest_chain: usize,
}

impl Default for Art {
    fn default() -> Self {
        Self::with_config(ArtConfig::default())
    }
}

impl Art {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: ArtConfig) -> Self {
        let max = config.max_buffers_per_kind;
        Art {
            prefixes: FixedSizeAllocator::new(NodeKind::Prefix, max),
            leaves: FixedSizeAllocator::new(NodeKind::Leaf, max),
            branch4: FixedSizeAllocator::new(NodeKind::Branch4, max),
            branch16: FixedSizeAllocator::new(NodeKind::Branch16, max),
            branch48: FixedSizeAllocator::new(NodeKind::Branch48, max),
            branch256: FixedSizeAllocator::new(NodeKind::Branch256, max),
            root: NodeHandle::EMPTY,
            config,
            persisted_blocks: Vec::new(),
        }
    }

    pub fn root(&self) -> NodeHandle {
        self.root
    }

    pub fn is_empty(&self) -> bool {
        !self.root.is_set()
    }

    pub fn config(&self) -> &ArtConfig {
        &self.config
    }

    pub fn allocator(&self, kind: NodeKind) -> &dyn NodeAllocator {
        match kind {
            NodeKind::Prefix => &self.prefixes,
            NodeKind::Leaf => &self.leaves,
            NodeKind::Branch4 => &self.branch4,
            NodeKind::Branch16 => &self.branch16,
            NodeKind::Branch48 => &self.branch48,
            NodeKind::Branch256 => &self.branch256,
        }
    }

    pub(crate) fn allocator_mut(&mut self, kind: NodeKind) -> &mut dyn NodeAllocator {
        match kind {
            NodeKind::Prefix => &mut self.prefixes,
            NodeKind::Leaf => &mut self.leaves,
            NodeKind::Branch4 => &mut self.branch4,
            NodeKind::Branch16 => &mut self.branch16,
            NodeKind::Branch48 => &mut self.branch48,
            NodeKind::Branch256 => &mut self.branch256,
        }
    }

    /// Handles owned directly by `node`.
    pub(crate) fn children(&self, node: NodeHandle) -> &[NodeHandle] {
        match node.kind() {
            None | Some(NodeKind::Leaf) => &[],
            Some(NodeKind::Prefix) => self.prefixes.get(node).links(),
            Some(_) => with_branch!(self, node, |b| b.children()),
        }
    }

    /// Release the slot of a single node, leaving its children alone.
    pub(crate) fn release(&mut self, node: NodeHandle) {
        if let Some(kind) = node.kind() {
            self.allocator_mut(kind).release(node);
        }
    }

    pub fn lookup(&self, key: &ArtKey) -> Option<&[RowId]> {
        let mut node = self.root;
        let mut depth = 0;
        loop {
            match node.kind()? {
                NodeKind::Prefix => {
                    Prefix::traverse(self, &mut node, key, &mut depth);
                    if node.is_prefix() {
                        return None;
                    }
                }
                NodeKind::Leaf => {
                    return (depth == key.len()).then(|| self.leaves.get(node).row_ids());
                }
                _ => {
                    if depth >= key.len() {
                        return None;
                    }
                    node = branch::get_child(self, node, key[depth])?;
                    depth += 1;
                }
            }
        }
    }

    /// Add `row_id` under `key`. Inserting a pair that is already present
    /// is a no-op. Fails with `KeyConflict` if `key` is a proper prefix of a
    /// stored key or the other way round.
    pub fn insert(&mut self, key: &ArtKey, row_id: RowId) -> Result<()> {
        let root = self.root;
        self.root = self.insert_into(root, key, 0, row_id)?;
        Ok(())
    }

    fn new_path(&mut self, key: &ArtKey, depth: usize, row_id: RowId) -> Result<NodeHandle> {
        let mut leaf = Leaf::new(self, row_id)?;
        match Prefix::new_chain(self, key, depth, key.len() - depth, leaf) {
            Ok(head) => Ok(head),
            Err(e) => {
                node::free(self, &mut leaf);
                Err(e)
            }
        }
    }

    fn insert_into(
        &mut self,
        node: NodeHandle,
        key: &ArtKey,
        depth: usize,
        row_id: RowId,
    ) -> Result<NodeHandle> {
        let Some(kind) = node.kind() else {
            return self.new_path(key, depth, row_id);
        };
        match kind {
            NodeKind::Prefix => {
                let mut cursor = node;
                let mut end = depth;
                Prefix::traverse(self, &mut cursor, key, &mut end);
                if !cursor.is_prefix() {
                    let child = self.insert_into(cursor, key, end, row_id)?;
                    if child != cursor {
                        let tail = Prefix::tail(self, node);
                        Prefix::get_mut(self, tail).continuation = child;
                    }
                    return Ok(node);
                }
                if end == key.len() {
                    return Err(key_conflict(key));
                }

                let mut head = node;
                let split = Prefix::split(self, &mut head, end - depth)?;
                let Some(existing) = split.byte else {
                    return Err(ArtError::Internal("split inside a chain yielded no byte".into()));
                };
                let fresh = self.new_path(key, end + 1, row_id)?;
                let branch = branch::new_branch(self, &[(existing, split.child), (key[end], fresh)])?;
                Ok(self.attach(head, split.parent_tail, branch))
            }
            NodeKind::Leaf => {
                if depth != key.len() {
                    return Err(key_conflict(key));
                }
                self.leaves.get_mut(node).insert(row_id);
                Ok(node)
            }
            _ => {
                if depth == key.len() {
                    return Err(key_conflict(key));
                }
                let byte = key[depth];
                match branch::get_child(self, node, byte) {
                    Some(child) => {
                        let updated = self.insert_into(child, key, depth + 1, row_id)?;
                        if updated != child {
                            branch::set_child(self, node, byte, updated);
                        }
                        Ok(node)
                    }
                    None => {
                        let fresh = self.new_path(key, depth + 1, row_id)?;
                        let mut updated = node;
                        branch::insert_child(self, &mut updated, byte, fresh)?;
                        Ok(updated)
                    }
                }
            }
        }
    }

    /// Hang `node` below a split chain. Returns the new subtree root.
    fn attach(&mut self, head: NodeHandle, parent_tail: Option<NodeHandle>, node: NodeHandle) -> NodeHandle {
        match parent_tail {
            Some(tail) => {
                Prefix::get_mut(self, tail).continuation = node;
                head
            }
            None => node,
        }
    }

    /// Remove `row_id` from `key`. Returns whether it was present. A key
    /// whose last row id goes is removed together with every node that
    /// only served it.
    pub fn erase(&mut self, key: &ArtKey, row_id: RowId) -> Result<bool> {
        let root = self.root;
        let (outcome, removed) = self.erase_from(root, key, 0, row_id)?;
        self.root = self.settle(outcome)?;
        Ok(removed)
    }

    /// Turn an erase outcome into a plain handle, folding a collapsed branch
    /// into a new chain.
    fn settle(&mut self, outcome: Erased) -> Result<NodeHandle> {
        match outcome {
            Erased::Node(node) => Ok(node),
            Erased::Collapsed { byte, child } => {
                let mut head = NodeHandle::EMPTY;
                Prefix::concatenate(self, &mut head, byte, child)?;
                Ok(head)
            }
        }
    }

    fn erase_from(
        &mut self,
        node: NodeHandle,
        key: &ArtKey,
        depth: usize,
        row_id: RowId,
    ) -> Result<(Erased, bool)> {
        let Some(kind) = node.kind() else {
            return Ok((Erased::Node(node), false));
        };
        match kind {
            NodeKind::Prefix => {
                let mut cursor = node;
                let mut end = depth;
                Prefix::traverse(self, &mut cursor, key, &mut end);
                if cursor.is_prefix() {
                    return Ok((Erased::Node(node), false));
                }
                let (outcome, removed) = self.erase_from(cursor, key, end, row_id)?;
                let tail = Prefix::tail(self, node);
                match outcome {
                    Erased::Node(child) if child == cursor => {}
                    Erased::Node(child) if !child.is_set() => {
                        Prefix::get_mut(self, tail).continuation = NodeHandle::EMPTY;
                        let mut head = node;
                        Prefix::free(self, &mut head);
                        return Ok((Erased::Node(head), removed));
                    }
                    Erased::Node(child) => Prefix::get_mut(self, tail).continuation = child,
                    Erased::Collapsed { byte, child } => {
                        let mut head = node;
                        Prefix::concatenate(self, &mut head, byte, child)?;
                        return Ok((Erased::Node(head), removed));
                    }
                }
                Ok((Erased::Node(node), removed))
            }
            NodeKind::Leaf => {
                if depth != key.len() {
                    return Ok((Erased::Node(node), false));
                }
                let leaf = self.leaves.get_mut(node);
                let removed = leaf.remove(row_id);
                if leaf.is_empty() {
                    self.leaves.take(node);
                    return Ok((Erased::Node(NodeHandle::EMPTY), removed));
                }
                Ok((Erased::Node(node), removed))
            }
            _ => {
                if depth >= key.len() {
                    return Ok((Erased::Node(node), false));
                }
                let byte = key[depth];
                let Some(child) = branch::get_child(self, node, byte) else {
                    return Ok((Erased::Node(node), false));
                };
                let (outcome, removed) = self.erase_from(child, key, depth + 1, row_id)?;
                let updated = self.settle(outcome)?;
                if updated.is_set() {
                    if updated != child {
                        branch::set_child(self, node, byte, updated);
                    }
                    return Ok((Erased::Node(node), removed));
                }

                let mut current = node;
                branch::remove_child(self, &mut current, byte)?;
                if branch::count(self, current) == 1 {
                    let (only_byte, only_child) = branch::entries(self, current)[0];
                    self.release(current);
                    return Ok((
                        Erased::Collapsed {
                            byte: only_byte,
                            child: only_child,
                        },
                        removed,
                    ));
                }
                Ok((Erased::Node(current), removed))
            }
        }
    }

    /// Move every key of `other` into this tree. Row ids under keys present
    /// in both are united.
    pub fn merge(&mut self, mut other: Art) -> Result<()> {
        if other.is_empty() {
            return Ok(());
        }
        let mut flags = ArtFlags::default();
        for kind in NodeKind::ALL {
            flags.merge_buffer_offsets[kind.index()] = self.allocator(kind).next_buffer_id();
        }
        let mut other_root = other.root;
        node::initialize_merge(&mut other, &mut other_root, &flags);

        let Art {
            prefixes,
            leaves,
            branch4,
            branch16,
            branch48,
            branch256,
            ..
        } = other;
        self.prefixes.absorb(prefixes);
        self.leaves.absorb(leaves);
        self.branch4.absorb(branch4);
        self.branch16.absorb(branch16);
        self.branch48.absorb(branch48);
        self.branch256.absorb(branch256);

        let root = self.root;
        self.root = self.merge_nodes(root, other_root)?;
        tracing::debug!(prefix_nodes = self.prefixes.live(), "merged trees");
        Ok(())
    }

    fn merge_nodes(&mut self, l: NodeHandle, r: NodeHandle) -> Result<NodeHandle> {
        if !r.is_set() {
            return Ok(l);
        }
        if !l.is_set() {
            return Ok(r);
        }
        match (l.is_prefix(), r.is_prefix()) {
            (true, true) => self.merge_prefixes(l, r),
            (false, true) => self.merge_chain_into(l, r),
            (true, false) => self.merge_chain_into(r, l),
            (false, false) => self.merge_terminals(l, r),
        }
    }

    fn merge_prefixes(&mut self, l: NodeHandle, r: NodeHandle) -> Result<NodeHandle> {
        let mut left = l;
        let mut right = r;
        let matched = Prefix::traverse_pair(self, &mut left, &mut right)?;
        match (left.is_prefix(), right.is_prefix()) {
            (false, _) => {
                // l's chain is used up; whatever r still has goes below it.
                let merged = self.merge_nodes(left, right)?;
                if merged != left {
                    let tail = Prefix::tail(self, l);
                    Prefix::get_mut(self, tail).continuation = merged;
                }
                Ok(l)
            }
            (true, false) => {
                if !right.is_branch() {
                    return Err(prefix_of_other());
                }
                let mut head = l;
                let split = Prefix::split(self, &mut head, matched)?;
                let Some(byte) = split.byte else {
                    return Err(ArtError::Internal("split inside a chain yielded no byte".into()));
                };
                let merged = self.merge_edge(right, byte, split.child)?;
                Ok(self.attach(head, split.parent_tail, merged))
            }
            (true, true) => {
                let mut head = l;
                let split = Prefix::split(self, &mut head, matched)?;
                let Some(left_byte) = split.byte else {
                    return Err(ArtError::Internal("split inside a chain yielded no byte".into()));
                };
                let right_byte = Prefix::get_byte(self, right, 0);
                Prefix::reduce(self, &mut right, 1)?;
                let branch =
                    branch::new_branch(self, &[(left_byte, split.child), (right_byte, right)])?;
                Ok(self.attach(head, split.parent_tail, branch))
            }
        }
    }

    /// Merge the chain `chain` into the subtree at `node`, which is not a
    /// prefix: the chain's first byte selects an edge of `node`.
    fn merge_chain_into(&mut self, node: NodeHandle, chain: NodeHandle) -> Result<NodeHandle> {
        if !node.is_branch() {
            return Err(prefix_of_other());
        }
        let byte = Prefix::get_byte(self, chain, 0);
        let mut rest = chain;
        Prefix::reduce(self, &mut rest, 1)?;
        self.merge_edge(node, byte, rest)
    }

    /// Put `child` under edge `byte` of `branch`, merging with an existing
    /// child there.
    fn merge_edge(&mut self, branch: NodeHandle, byte: u8, child: NodeHandle) -> Result<NodeHandle> {
        match branch::get_child(self, branch, byte) {
            Some(existing) => {
                let merged = self.merge_nodes(existing, child)?;
                if merged != existing {
                    branch::set_child(self, branch, byte, merged);
                }
                Ok(branch)
            }
            None => {
                let mut updated = branch;
                branch::insert_child(self, &mut updated, byte, child)?;
                Ok(updated)
            }
        }
    }

    fn merge_terminals(&mut self, l: NodeHandle, r: NodeHandle) -> Result<NodeHandle> {
        match (l.kind(), r.kind()) {
            (Some(NodeKind::Leaf), Some(NodeKind::Leaf)) => {
                Leaf::merge(self, l, r);
                Ok(l)
            }
            _ if l.is_branch() && r.is_branch() => {
                let edges = branch::entries(self, r);
                self.release(r);
                let mut merged = l;
                for (byte, child) in edges {
                    merged = self.merge_edge(merged, byte, child)?;
                }
                Ok(merged)
            }
            _ => Err(prefix_of_other()),
        }
    }

    /// Compact allocators whose free space exceeds the configured threshold.
    pub fn vacuum(&mut self) -> Result<()> {
        let mut flags = ArtFlags::default();
        let threshold = self.config.vacuum_threshold_percent;
        for kind in NodeKind::ALL {
            flags.vacuum[kind.index()] = self.allocator_mut(kind).initialize_vacuum(threshold);
        }
        if !flags.vacuum.iter().any(|&v| v) {
            return Ok(());
        }
        let before: usize = NodeKind::ALL
            .iter()
            .map(|&kind| self.allocator(kind).buffer_count())
            .sum();

        let mut root = self.root;
        let result = node::vacuum(self, &mut root, &flags);
        self.root = root;
        result?;

        for kind in NodeKind::ALL {
            if flags.vacuums(kind) {
                self.allocator_mut(kind).finalize_vacuum();
            }
        }
        let after: usize = NodeKind::ALL
            .iter()
            .map(|&kind| self.allocator(kind).buffer_count())
            .sum();
        tracing::debug!(before, after, "vacuumed node buffers");
        Ok(())
    }

    /// Persist the tree through `manager`, replacing the previous checkpoint.
    pub fn checkpoint<M: BlockManager + ?Sized>(&mut self, manager: &mut M) -> Result<BlockPointer> {
        let (pointer, blocks) = if !self.root.is_set() {
            (BlockPointer::INVALID, Vec::new())
        } else {
            let mut writer = MetaBlockWriter::new(manager)?;
            let pointer = node::serialize(self, self.root, &mut writer)?;
            (pointer, writer.finish()?)
        };
        for block_id in std::mem::replace(&mut self.persisted_blocks, blocks) {
            manager.free_block(block_id);
        }
        manager.set_meta_pointer(pointer);
        manager.flush()?;
        tracing::debug!(
            block_id = pointer.block_id,
            offset = pointer.offset,
            blocks = self.persisted_blocks.len(),
            "checkpointed index"
        );
        Ok(pointer)
    }

    /// Rebuild the tree from the checkpoint `manager` points at.
    pub fn load<M: BlockManager + ?Sized>(manager: &mut M, config: ArtConfig) -> Result<Art> {
        let mut art = Art::with_config(config);
        let pointer = manager.meta_pointer();
        if !pointer.is_valid() {
            return Ok(art);
        }
        let mut reader = MetaBlockReader::new(manager);
        art.root = node::deserialize(&mut art, &mut reader, pointer)?;
        art.persisted_blocks = reader.visited_blocks();
        tracing::debug!(blocks = art.persisted_blocks.len(), "loaded index");
        Ok(art)
    }

    /// Check the structural invariants of every reachable node and that no
    /// allocated node is unreachable.
    pub fn verify(&self) -> Result<()> {
        let mut seen = HashSet::new();
        let mut reachable = [0usize; NODE_KINDS];
        let mut stack = Vec::new();
        if self.root.is_set() {
            stack.push(self.root);
        }
        while let Some(node) = stack.pop() {
            let Some(kind) = node.kind() else {
                return Err(ArtError::Corruption("empty handle inside the tree".into()));
            };
            if !self.allocator(kind).contains(node) {
                return Err(ArtError::Corruption(format!("dangling handle {:?}", node)));
            }
            if !seen.insert(node) {
                return Err(ArtError::Corruption(format!("{:?} reachable twice", node)));
            }
            reachable[kind.index()] += 1;
            match kind {
                NodeKind::Prefix => {
                    let prefix = Prefix::get(self, node);
                    if prefix.count() == 0 {
                        return Err(ArtError::Corruption(format!("empty prefix node {:?}", node)));
                    }
                    let next = prefix.continuation();
                    if next.is_prefix() && !prefix.is_full() {
                        return Err(ArtError::Corruption(format!(
                            "prefix node {:?} holds {} bytes but is not the last of its chain",
                            node,
                            prefix.count()
                        )));
                    }
                    if !next.is_set() {
                        return Err(ArtError::Corruption(format!(
                            "prefix chain ends at {:?} without a continuation",
                            node
                        )));
                    }
                    stack.push(next);
                }
                NodeKind::Leaf => {
                    if self.leaves.get(node).is_empty() {
                        return Err(ArtError::Corruption(format!("empty leaf {:?}", node)));
                    }
                }
                _ => {
                    let count = branch::count(self, node);
                    if count < 2 {
                        return Err(ArtError::Corruption(format!(
                            "{:?} with {} children",
                            kind, count
                        )));
                    }
                    stack.extend_from_slice(self.children(node));
                }
            }
        }
        for kind in NodeKind::ALL {
            let live = self.allocator(kind).live();
            if live != reachable[kind.index()] {
                return Err(ArtError::Corruption(format!(
                    "{:?}: {} nodes allocated, {} reachable",
                    kind,
                    live,
                    reachable[kind.index()]
                )));
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> ArtStats {
        let mut stats = ArtStats::default();
        for kind in NodeKind::ALL {
            let allocator = self.allocator(kind);
            stats.nodes[kind.index()] = allocator.live();
            stats.buffers[kind.index()] = allocator.buffer_count();
        }
        let mut stack = vec![self.root];
        while let Some(mut node) = stack.pop() {
            if node.is_prefix() {
                let mut bytes = 0;
                while node.is_prefix() {
                    let prefix = Prefix::get(self, node);
                    bytes += prefix.count();
                    node = prefix.continuation();
                }
                stats.prefix_chains += 1;
                stats.prefix_bytes += bytes;
                stats.longest_chain = stats.longest_chain.max(bytes);
            }
            match node.kind() {
                None | Some(NodeKind::Prefix) => {}
                Some(NodeKind::Leaf) => {
                    stats.keys += 1;
                    stats.row_ids += self.leaves.get(node).row_ids().len();
                }
                Some(_) => stack.extend_from_slice(self.children(node)),
            }
        }
        stats
    }

    /// Every key with its row ids, in key order.
    pub fn scan(&self) -> Vec<(Vec<u8>, Vec<RowId>)> {
        let mut out = Vec::new();
        let mut path = Vec::new();
        self.scan_into(self.root, &mut path, &mut out);
        out
    }

    fn scan_into(&self, node: NodeHandle, path: &mut Vec<u8>, out: &mut Vec<(Vec<u8>, Vec<RowId>)>) {
        let base = path.len();
        let mut node = node;
        while node.is_prefix() {
            let prefix = Prefix::get(self, node);
            path.extend_from_slice(prefix.bytes());
            node = prefix.continuation();
        }
        match node.kind() {
            None | Some(NodeKind::Prefix) => {}
            Some(NodeKind::Leaf) => out.push((path.clone(), self.leaves.get(node).row_ids().to_vec())),
            Some(_) => {
                for (byte, child) in branch::entries(self, node) {
                    path.push(byte);
                    self.scan_into(child, path, out);
                    path.pop();
                }
            }
        }
        path.truncate(base);
    }
}

fn key_conflict(key: &ArtKey) -> ArtError {
    ArtError::KeyConflict(format!(
        "key {:02x?} is a prefix of a stored key or has one as prefix",
        key.as_bytes()
    ))
}

fn prefix_of_other() -> ArtError {
    ArtError::IncompatibleMerge("a key of one tree is a proper prefix of a key of the other".into())
}
