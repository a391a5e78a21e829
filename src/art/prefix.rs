//! Path compression.
//!
//! A run of key bytes with no branching is stored as a chain of `Prefix`
//! nodes, each holding up to [`PREFIX_CAPACITY`] bytes and a continuation
//! handle. A canonical chain satisfies:
//!
//! - every node except the last is full,
//! - no node is empty,
//! - the last node's continuation is a non-prefix node.
//!
//! Every operation here leaves a chain canonical on success. The chain owns
//! its nodes and the node it terminates in; freeing the head frees all of it.

use crate::art::key::ArtKey;
use crate::art::node::{self, ArtFlags, NodeHandle, NodeKind};
use crate::art::Art;
use crate::error::{ArtError, Result};
use crate::storage::block::BlockPointer;
use crate::storage::block_manager::BlockManager;
use crate::storage::meta_block::{MetaBlockReader, MetaBlockWriter};

/// Key bytes stored inline in one prefix node.
pub const PREFIX_CAPACITY: usize = 7;

const _: () = assert!(PREFIX_CAPACITY > 0 && PREFIX_CAPACITY <= u8::MAX as usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prefix {
    data: [u8; PREFIX_CAPACITY],
    count: u8,
    pub(crate) continuation: NodeHandle,
}

/// Result of [`Prefix::split`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefixSplit {
    /// Byte at the split position; it becomes the edge label towards
    /// `child`. `None` when the split position is the chain length.
    pub byte: Option<u8>,
    /// Everything after the split byte.
    pub child: NodeHandle,
    /// Last node of the part kept before the split, with its continuation
    /// reset to `EMPTY` for the caller to fill in. `None` when nothing is
    /// kept, in which case the split handle now equals `child`.
    pub parent_tail: Option<NodeHandle>,
}

impl Prefix {
    fn empty() -> Self {
        Prefix {
            data: [0; PREFIX_CAPACITY],
            count: 0,
            continuation: NodeHandle::EMPTY,
        }
    }

    pub fn count(&self) -> usize {
        self.count as usize
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.count()]
    }

    pub fn continuation(&self) -> NodeHandle {
        self.continuation
    }

    pub fn is_full(&self) -> bool {
        self.count() == PREFIX_CAPACITY
    }

    /// The continuation as a one-element slice, for generic child walks.
    pub(crate) fn links(&self) -> &[NodeHandle] {
        std::slice::from_ref(&self.continuation)
    }

    pub fn get(art: &Art, node: NodeHandle) -> &Prefix {
        art.prefixes.get(node)
    }

    pub fn get_mut(art: &mut Art, node: NodeHandle) -> &mut Prefix {
        art.prefixes.get_mut(node)
    }

    /// Allocate an empty prefix node and point `node` at it.
    pub fn new<'a>(art: &'a mut Art, node: &mut NodeHandle) -> Result<&'a mut Prefix> {
        *node = art.prefixes.allocate(Prefix::empty())?;
        Ok(art.prefixes.get_mut(*node))
    }

    /// Allocate a one-byte prefix node continuing at `next`.
    pub fn new_with_byte<'a>(
        art: &'a mut Art,
        node: &mut NodeHandle,
        byte: u8,
        next: NodeHandle,
    ) -> Result<&'a mut Prefix> {
        let prefix = Self::new(art, node)?;
        prefix.data[0] = byte;
        prefix.count = 1;
        prefix.continuation = next;
        Ok(prefix)
    }

    /// Build a chain holding `key[depth..depth + count]` that continues at
    /// `next`, and return its head. With `count == 0` this is `next` itself.
    /// The node whose continuation is `next` is found with [`Prefix::tail`].
    ///
    /// On failure no node of the new chain survives and `next` is left to
    /// the caller.
    pub fn new_chain(
        art: &mut Art,
        key: &ArtKey,
        depth: usize,
        count: usize,
        next: NodeHandle,
    ) -> Result<NodeHandle> {
        debug_assert!(depth + count <= key.len());
        Self::from_bytes(art, &key.as_bytes()[depth..depth + count], next)
    }

    /// Chain holding `bytes` in canonical layout, continuing at `next`.
    pub(crate) fn from_bytes(art: &mut Art, bytes: &[u8], next: NodeHandle) -> Result<NodeHandle> {
        let mut head = next;
        for chunk in bytes.chunks(PREFIX_CAPACITY).rev() {
            let mut prefix = Prefix::empty();
            prefix.data[..chunk.len()].copy_from_slice(chunk);
            prefix.count = chunk.len() as u8;
            prefix.continuation = head;
            match art.prefixes.allocate(prefix) {
                Ok(handle) => head = handle,
                Err(e) => {
                    Self::release_until(art, head, next);
                    return Err(e);
                }
            }
        }
        Ok(head)
    }

    /// Release the prefix nodes from `head` up to (not including) `stop`.
    fn release_until(art: &mut Art, mut head: NodeHandle, stop: NodeHandle) {
        while head != stop && head.is_prefix() {
            let next = art.prefixes.take(head).continuation;
            head = next;
        }
    }

    /// Last node of the chain starting at `node`.
    pub fn tail(art: &Art, node: NodeHandle) -> NodeHandle {
        debug_assert!(node.is_prefix());
        let mut current = node;
        loop {
            let next = Self::get(art, current).continuation;
            if !next.is_prefix() {
                return current;
            }
            current = next;
        }
    }

    /// Free the chain and everything below it.
    pub fn free(art: &mut Art, node: &mut NodeHandle) {
        node::free(art, node);
    }

    pub fn get_byte(art: &Art, node: NodeHandle, position: usize) -> u8 {
        debug_assert!(position < PREFIX_CAPACITY);
        let prefix = Self::get(art, node);
        debug_assert!(
            position < prefix.count(),
            "byte {} of a {}-byte prefix node",
            position,
            prefix.count()
        );
        prefix.data[position]
    }

    /// Match the chain at `node` against `key` from `depth`.
    ///
    /// Returns the number of matched bytes. On a full match `node` ends at
    /// the chain's continuation; otherwise it stays on the prefix node that
    /// holds the first differing byte, and `depth` indexes the key byte that
    /// did not match. Running out of key counts as a mismatch.
    pub fn traverse(art: &Art, node: &mut NodeHandle, key: &ArtKey, depth: &mut usize) -> usize {
        let mut matched = 0;
        while node.is_prefix() {
            let prefix = Self::get(art, *node);
            for &byte in prefix.bytes() {
                if *depth >= key.len() || key[*depth] != byte {
                    return matched;
                }
                *depth += 1;
                matched += 1;
            }
            *node = prefix.continuation;
        }
        matched
    }

    /// Match two chains against each other, as the first step of merging
    /// the subtrees below them. Returns the number of common bytes.
    ///
    /// The outcome is read off the handle kinds afterwards:
    ///
    /// - neither is a prefix: both chains matched completely,
    /// - only `l` is a prefix: `r` ended first; `l` points at the node
    ///   holding its first unmatched byte, at offset `matched % PREFIX_CAPACITY`,
    /// - only `r` is a prefix: `l` ended first,
    /// - both are prefixes: the chains differ at that byte.
    ///
    /// `r` always ends up owning exactly its unmatched remainder: nodes it
    /// had fully matched are freed and a partially matched node is trimmed.
    /// `l` is a read-only cursor; nothing in it changes.
    pub fn traverse_pair(art: &mut Art, l: &mut NodeHandle, r: &mut NodeHandle) -> Result<usize> {
        let mut matched = 0;
        while l.is_prefix() && r.is_prefix() {
            let left = *Self::get(art, *l);
            let right = *Self::get(art, *r);
            let common = left.count().min(right.count());
            let same = left.data[..common]
                .iter()
                .zip(&right.data[..common])
                .take_while(|(a, b)| a == b)
                .count();
            matched += same;

            if same < common {
                if same > 0 {
                    Self::reduce(art, r, same)?;
                }
                return Ok(matched);
            }

            if left.count() == right.count() {
                art.prefixes.take(*r);
                *r = right.continuation;
                *l = left.continuation;
            } else if right.count() < left.count() {
                // r's last node is short; l keeps going inside this node.
                art.prefixes.take(*r);
                *r = right.continuation;
                return Ok(matched);
            } else {
                Self::reduce(art, r, common)?;
                *l = left.continuation;
                return Ok(matched);
            }
        }
        Ok(matched)
    }

    /// Split the chain at byte `position` (counted from the head).
    ///
    /// The byte at `position` is taken out as the edge byte; the bytes after
    /// it become the child chain, re-packed so it is canonical. The bytes
    /// before it stay in the original nodes. If `position` is the first byte
    /// of a node, that node is reused as the head of the child.
    pub fn split(art: &mut Art, node: &mut NodeHandle, position: usize) -> Result<PrefixSplit> {
        debug_assert!(node.is_prefix());
        let mut previous: Option<NodeHandle> = None;
        let mut current = *node;
        let mut offset = position;
        loop {
            let prefix = *Self::get(art, current);
            if offset < prefix.count() {
                break;
            }
            if offset == prefix.count() && !prefix.continuation.is_prefix() {
                // Split behind the last byte: nothing is left for the child
                Self::get_mut(art, current).continuation = NodeHandle::EMPTY;
                return Ok(PrefixSplit {
                    byte: None,
                    child: prefix.continuation,
                    parent_tail: Some(current),
                });
            }
            debug_assert!(
                prefix.continuation.is_prefix(),
                "split position {} beyond the chain",
                position
            );
            offset -= prefix.count();
            previous = Some(current);
            current = prefix.continuation;
        }

        let prefix = *Self::get(art, current);
        let byte = prefix.data[offset];
        let (rest_nodes, rest_bytes, terminal) = Self::collect(art, prefix.continuation);

        if offset == 0 {
            let mut nodes = Vec::with_capacity(rest_nodes.len() + 1);
            nodes.push(current);
            nodes.extend(rest_nodes);
            let mut bytes = prefix.bytes()[1..].to_vec();
            bytes.extend(rest_bytes);
            let child = Self::rewrite(art, &nodes, &bytes, terminal)?;
            return Ok(match previous {
                Some(tail) => {
                    Self::get_mut(art, tail).continuation = NodeHandle::EMPTY;
                    PrefixSplit {
                        byte: Some(byte),
                        child,
                        parent_tail: Some(tail),
                    }
                }
                None => {
                    *node = child;
                    PrefixSplit {
                        byte: Some(byte),
                        child,
                        parent_tail: None,
                    }
                }
            });
        }

        let mut bytes = prefix.bytes()[offset + 1..].to_vec();
        bytes.extend(rest_bytes);
        let child = Self::rewrite(art, &rest_nodes, &bytes, terminal)?;
        let kept = Self::get_mut(art, current);
        kept.count = offset as u8;
        kept.continuation = NodeHandle::EMPTY;
        Ok(PrefixSplit {
            byte: Some(byte),
            child,
            parent_tail: Some(current),
        })
    }

    /// Drop the first `n` bytes of the chain. Nodes that become empty are
    /// freed; if the whole chain goes, `node` ends at the continuation.
    pub fn reduce(art: &mut Art, node: &mut NodeHandle, n: usize) -> Result<()> {
        debug_assert!(n > 0);
        let mut remaining = n;
        loop {
            debug_assert!(node.is_prefix(), "reduce by {} past the end of the chain", n);
            let prefix = *Self::get(art, *node);
            if remaining < prefix.count() {
                break;
            }
            art.prefixes.take(*node);
            *node = prefix.continuation;
            remaining -= prefix.count();
            if remaining == 0 {
                return Ok(());
            }
        }
        let (nodes, bytes, terminal) = Self::collect(art, *node);
        *node = Self::rewrite(art, &nodes, &bytes[remaining..], terminal)?;
        Ok(())
    }

    /// Append `byte` followed by `child` to the chain at `prefix_node`.
    ///
    /// This is the inverse of collapsing a one-child branch: the branch's
    /// edge byte and its child are folded into the path above it. If
    /// `prefix_node` is not a prefix it is replaced by a new chain that
    /// starts with `byte`. Prefix nodes of `child` are absorbed into the
    /// result.
    pub fn concatenate(
        art: &mut Art,
        prefix_node: &mut NodeHandle,
        byte: u8,
        child: NodeHandle,
    ) -> Result<()> {
        if !prefix_node.is_prefix() {
            let mut head = NodeHandle::EMPTY;
            Self::new_with_byte(art, &mut head, byte, child)?;
            if child.is_prefix() {
                if let Err(e) = Self::append_chain(art, head, child) {
                    art.prefixes.take(head);
                    return Err(e);
                }
            }
            *prefix_node = head;
            return Ok(());
        }

        let tail = Self::tail(art, *prefix_node);
        let tail = Self::append_byte(art, tail, byte)?;
        if child.is_prefix() {
            Self::append_chain(art, tail, child)?;
        } else {
            Self::get_mut(art, tail).continuation = child;
        }
        Ok(())
    }

    /// Add one byte behind the tail node. Returns the node now holding the
    /// byte; if a new node was needed it inherits the tail's continuation.
    fn append_byte(art: &mut Art, tail: NodeHandle, byte: u8) -> Result<NodeHandle> {
        let prefix = Self::get_mut(art, tail);
        if !prefix.is_full() {
            prefix.data[prefix.count()] = byte;
            prefix.count += 1;
            return Ok(tail);
        }
        let continuation = prefix.continuation;
        let mut node = NodeHandle::EMPTY;
        Self::new_with_byte(art, &mut node, byte, continuation)?;
        Self::get_mut(art, tail).continuation = node;
        Ok(node)
    }

    /// Attach the chain `other` behind `tail`.
    ///
    /// A full tail links `other` as it is. Otherwise the bytes of `other`
    /// are shifted forward into the tail and `other`'s nodes are re-filled
    /// in order; any that end up empty are freed.
    fn append_chain(art: &mut Art, tail: NodeHandle, other: NodeHandle) -> Result<()> {
        let prefix = *Self::get(art, tail);
        if prefix.is_full() {
            Self::get_mut(art, tail).continuation = other;
            return Ok(());
        }
        let (other_nodes, other_bytes, terminal) = Self::collect(art, other);
        let mut nodes = Vec::with_capacity(other_nodes.len() + 1);
        nodes.push(tail);
        nodes.extend(other_nodes);
        let mut bytes = prefix.bytes().to_vec();
        bytes.extend(other_bytes);
        Self::rewrite(art, &nodes, &bytes, terminal)?;
        Ok(())
    }

    /// Nodes and bytes of the chain at `node`, plus the handle it ends in.
    fn collect(art: &Art, node: NodeHandle) -> (Vec<NodeHandle>, Vec<u8>, NodeHandle) {
        let mut nodes = Vec::new();
        let mut bytes = Vec::new();
        let mut current = node;
        while current.is_prefix() {
            let prefix = Self::get(art, current);
            nodes.push(current);
            bytes.extend_from_slice(prefix.bytes());
            current = prefix.continuation;
        }
        (nodes, bytes, current)
    }

    /// Store `bytes` as a canonical chain ending in `terminal`, reusing
    /// `nodes` in order. Missing nodes are allocated before anything is
    /// written, so on failure the old chain is untouched. Unused nodes are
    /// released. Returns the head (`terminal` if `bytes` is empty).
    fn rewrite(
        art: &mut Art,
        nodes: &[NodeHandle],
        bytes: &[u8],
        terminal: NodeHandle,
    ) -> Result<NodeHandle> {
        let needed = bytes.len().div_ceil(PREFIX_CAPACITY);
        let mut handles: Vec<NodeHandle> = nodes.iter().copied().take(needed).collect();
        while handles.len() < needed {
            match art.prefixes.allocate(Prefix::empty()) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    for &fresh in &handles[nodes.len()..] {
                        art.prefixes.take(fresh);
                    }
                    return Err(e);
                }
            }
        }

        let mut head = terminal;
        for (handle, chunk) in handles.iter().zip(bytes.chunks(PREFIX_CAPACITY)).rev() {
            let prefix = Self::get_mut(art, *handle);
            prefix.data[..chunk.len()].copy_from_slice(chunk);
            prefix.count = chunk.len() as u8;
            prefix.continuation = head;
            head = *handle;
        }
        for &unused in nodes.iter().skip(needed) {
            art.prefixes.take(unused);
        }
        Ok(head)
    }

    /// Point the continuation at its post-merge location and return the old
    /// handle so the caller can keep walking the source tree.
    pub fn initialize_merge(&mut self, flags: &ArtFlags) -> NodeHandle {
        let old = self.continuation;
        self.continuation = old.merged(flags);
        old
    }

    /// Vacuum the nodes below `node`, walking the chain iteratively.
    pub fn vacuum(art: &mut Art, node: NodeHandle, flags: &ArtFlags) -> Result<()> {
        let vacuum_prefixes = flags.vacuums(NodeKind::Prefix);
        let mut current = node;
        loop {
            let mut next = Self::get(art, current).continuation;
            if next.is_prefix() {
                if vacuum_prefixes && art.allocator(NodeKind::Prefix).needs_vacuum(next) {
                    next = art.allocator_mut(NodeKind::Prefix).relocate(next)?;
                    Self::get_mut(art, current).continuation = next;
                }
                current = next;
                continue;
            }
            node::vacuum(art, &mut next, flags)?;
            Self::get_mut(art, current).continuation = next;
            return Ok(());
        }
    }

    /// Record layout: `[tag][count][PREFIX_CAPACITY bytes][child pointer]`.
    /// The chain is written tail first so each record can point at the one
    /// after it.
    pub fn serialize<M: BlockManager + ?Sized>(
        art: &Art,
        node: NodeHandle,
        writer: &mut MetaBlockWriter<M>,
    ) -> Result<BlockPointer> {
        let (nodes, _, terminal) = Self::collect(art, node);
        let mut child = node::serialize(art, terminal, writer)?;
        for &handle in nodes.iter().rev() {
            let prefix = Self::get(art, handle);
            let mut data = [0u8; PREFIX_CAPACITY];
            data[..prefix.count()].copy_from_slice(prefix.bytes());

            let pointer = writer.pointer()?;
            writer.write_u8(NodeKind::Prefix.tag())?;
            writer.write_u8(prefix.count)?;
            writer.write_bytes(&data)?;
            writer.write_pointer(child)?;
            child = pointer;
        }
        Ok(child)
    }

    /// Read a chain whose first tag has already been consumed.
    pub fn deserialize<M: BlockManager + ?Sized>(
        art: &mut Art,
        reader: &mut MetaBlockReader<M>,
    ) -> Result<NodeHandle> {
        let mut head = NodeHandle::EMPTY;
        let mut previous: Option<NodeHandle> = None;
        loop {
            let count = reader.read_u8()?;
            if count == 0 || count as usize > PREFIX_CAPACITY {
                return Err(ArtError::Corruption(format!(
                    "prefix node with {} bytes",
                    count
                )));
            }
            let mut prefix = Prefix::empty();
            reader.read_bytes(&mut prefix.data)?;
            prefix.count = count;
            let child = reader.read_pointer()?;

            if let Some(previous) = previous {
                if !Self::get(art, previous).is_full() {
                    return Err(ArtError::Corruption(
                        "prefix node below capacity inside a chain".into(),
                    ));
                }
            }
            let handle = art.prefixes.allocate(prefix)?;
            match previous {
                Some(previous) => Self::get_mut(art, previous).continuation = handle,
                None => head = handle,
            }
            previous = Some(handle);

            if !child.is_valid() {
                return Err(ArtError::Corruption("prefix chain without continuation".into()));
            }
            reader.seek_record(child)?;
            let kind = node::read_kind(reader)?;
            if kind == NodeKind::Prefix {
                continue;
            }
            let continuation = node::deserialize_body(art, reader, kind)?;
            Self::get_mut(art, handle).continuation = continuation;
            return Ok(head);
        }
    }
}

#[cfg(test)]
mod tests;
