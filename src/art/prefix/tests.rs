use super::*;
use crate::art::allocator::NodeAllocator;
use crate::art::leaf::Leaf;
use crate::art::node::NodeKind;
use crate::storage::memory_manager::InMemoryBlockManager;

fn terminal(art: &mut Art) -> NodeHandle {
    Leaf::new(art, 1).unwrap()
}

fn chain(art: &mut Art, bytes: &[u8]) -> NodeHandle {
    let leaf = terminal(art);
    Prefix::from_bytes(art, bytes, leaf).unwrap()
}

/// Per-node bytes of the chain at `head` and the handle it ends in.
fn layout(art: &Art, head: NodeHandle) -> (Vec<Vec<u8>>, NodeHandle) {
    let mut nodes = Vec::new();
    let mut current = head;
    while current.is_prefix() {
        let prefix = Prefix::get(art, current);
        nodes.push(prefix.bytes().to_vec());
        current = prefix.continuation();
    }
    (nodes, current)
}

fn bytes_of(art: &Art, head: NodeHandle) -> Vec<u8> {
    layout(art, head).0.concat()
}

fn assert_canonical(art: &Art, head: NodeHandle) {
    let (nodes, end) = layout(art, head);
    for (i, node) in nodes.iter().enumerate() {
        assert!(!node.is_empty(), "node {} is empty", i);
        if i + 1 < nodes.len() {
            assert_eq!(node.len(), PREFIX_CAPACITY, "inner node {} not full", i);
        }
    }
    assert!(end.is_set() && !end.is_prefix());
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + 3) as u8).collect()
}

#[test]
fn test_nine_bytes_make_two_nodes() {
    let mut art = Art::new();
    let key = ArtKey::from_bytes(vec![0x41, 0x42, 0x43, 0x44, 0x45, 0x46, 0x47, 0x48, 0x49]);
    let leaf = terminal(&mut art);
    let mut head = Prefix::new_chain(&mut art, &key, 0, key.len(), leaf).unwrap();

    let (nodes, end) = layout(&art, head);
    assert_eq!(
        nodes,
        vec![
            vec![0x41, 0x42, 0x43, 0x44, 0x45, 0x46, 0x47],
            vec![0x48, 0x49]
        ]
    );
    assert_eq!(end, leaf);
    assert_eq!(Prefix::tail(&art, head), Prefix::get(&art, head).continuation());

    Prefix::reduce(&mut art, &mut head, 8).unwrap();
    let (nodes, end) = layout(&art, head);
    assert_eq!(nodes, vec![vec![0x49]]);
    assert_eq!(end, leaf);
    assert_eq!(art.prefixes.live(), 1);
}

#[test]
fn test_new_chain_respects_depth() {
    let mut art = Art::new();
    let key = ArtKey::from_bytes(pattern(20));
    let leaf = terminal(&mut art);
    let head = Prefix::new_chain(&mut art, &key, 5, 10, leaf).unwrap();
    assert_eq!(bytes_of(&art, head), &key.as_bytes()[5..15]);
    assert_canonical(&art, head);

    let same = Prefix::new_chain(&mut art, &key, 3, 0, leaf).unwrap();
    assert_eq!(same, leaf);
}

#[test]
fn test_new_forms() {
    let mut art = Art::new();
    let mut node = NodeHandle::EMPTY;
    let prefix = Prefix::new(&mut art, &mut node).unwrap();
    assert_eq!(prefix.count(), 0);
    assert_eq!(prefix.continuation(), NodeHandle::EMPTY);
    assert!(node.is_prefix());

    let leaf = terminal(&mut art);
    let mut single = NodeHandle::EMPTY;
    let prefix = Prefix::new_with_byte(&mut art, &mut single, 0xAB, leaf).unwrap();
    assert_eq!(prefix.bytes(), &[0xAB]);
    assert_eq!(prefix.continuation(), leaf);
    assert_eq!(Prefix::get_byte(&art, single, 0), 0xAB);
}

#[test]
fn test_bounded_allocator_leaves_no_partial_chain() {
    let mut art = Art::with_config(crate::config::ArtConfig {
        max_buffers_per_kind: Some(1),
        ..Default::default()
    });
    let leaf = terminal(&mut art);
    let too_long = pattern((crate::config::SLOTS_PER_BUFFER + 1) * PREFIX_CAPACITY);
    let err = Prefix::from_bytes(&mut art, &too_long, leaf).unwrap_err();
    assert!(matches!(err, ArtError::OutOfMemory { kind: NodeKind::Prefix, .. }));
    assert_eq!(art.prefixes.live(), 0);
    assert!(art.leaves.contains(leaf));
}

#[test]
fn test_free_releases_chain_and_terminal() {
    let mut art = Art::new();
    let mut head = chain(&mut art, &pattern(30));
    assert_eq!(art.prefixes.live(), 5);
    Prefix::free(&mut art, &mut head);
    assert_eq!(head, NodeHandle::EMPTY);
    assert_eq!(art.prefixes.live(), 0);
    assert_eq!(art.leaves.live(), 0);
}

#[test]
fn test_traverse_key() {
    let mut art = Art::new();
    let bytes = pattern(10);
    let head = chain(&mut art, &bytes);
    let (_, leaf) = layout(&art, head);

    // Full match
    let key = ArtKey::from_bytes(bytes.clone());
    let mut node = head;
    let mut depth = 0;
    assert_eq!(Prefix::traverse(&art, &mut node, &key, &mut depth), 10);
    assert_eq!(node, leaf);
    assert_eq!(depth, 10);

    // Mismatch inside the second node
    let mut other = bytes.clone();
    other[8] ^= 0xFF;
    let key = ArtKey::from_bytes(other);
    let mut node = head;
    let mut depth = 0;
    assert_eq!(Prefix::traverse(&art, &mut node, &key, &mut depth), 8);
    assert_eq!(node, Prefix::get(&art, head).continuation());
    assert_eq!(depth, 8);

    // Key runs out inside the chain
    let key = ArtKey::from_bytes(bytes[..4].to_vec());
    let mut node = head;
    let mut depth = 0;
    assert_eq!(Prefix::traverse(&art, &mut node, &key, &mut depth), 4);
    assert_eq!(node, head);
    assert_eq!(depth, 4);
}

#[test]
fn test_traverse_pair_full_match_frees_right() {
    let mut art = Art::new();
    let bytes = pattern(23);
    let l = chain(&mut art, &bytes);
    let mut r = chain(&mut art, &bytes);
    assert_eq!(art.prefixes.live(), 8);
    let (_, l_end) = layout(&art, l);
    let (_, r_end) = layout(&art, r);

    let mut left = l;
    let matched = Prefix::traverse_pair(&mut art, &mut left, &mut r).unwrap();
    assert_eq!(matched, 23);
    assert_eq!(left, l_end);
    assert_eq!(r, r_end);
    assert_eq!(art.prefixes.live(), 4);
    assert_eq!(bytes_of(&art, l), bytes);
}

#[test]
fn test_traverse_pair_mismatch_trims_right() {
    let mut art = Art::new();
    let bytes = pattern(12);
    let mut other = bytes.clone();
    other[9] = 0xEE;
    let l = chain(&mut art, &bytes);
    let mut r = chain(&mut art, &other);

    let mut left = l;
    let matched = Prefix::traverse_pair(&mut art, &mut left, &mut r).unwrap();
    assert_eq!(matched, 9);
    assert!(left.is_prefix() && r.is_prefix());
    assert_eq!(Prefix::get_byte(&art, left, matched % PREFIX_CAPACITY), bytes[9]);
    assert_eq!(bytes_of(&art, r), &other[9..]);
    assert_canonical(&art, r);
    assert_eq!(bytes_of(&art, l), bytes);
}

#[test]
fn test_traverse_pair_right_ends_first() {
    let mut art = Art::new();
    let bytes = pattern(12);
    let l = chain(&mut art, &bytes);
    let mut r = chain(&mut art, &bytes[..10]);
    let (_, r_end) = layout(&art, r);

    let mut left = l;
    let matched = Prefix::traverse_pair(&mut art, &mut left, &mut r).unwrap();
    assert_eq!(matched, 10);
    assert!(left.is_prefix());
    assert_eq!(r, r_end);
    assert_eq!(Prefix::get_byte(&art, left, matched % PREFIX_CAPACITY), bytes[10]);
    // Only l's nodes remain.
    assert_eq!(art.prefixes.live(), 2);
}

#[test]
fn test_traverse_pair_left_ends_first() {
    let mut art = Art::new();
    let bytes = pattern(12);
    let l = chain(&mut art, &bytes[..7]);
    let mut r = chain(&mut art, &bytes);
    let (_, l_end) = layout(&art, l);

    let mut left = l;
    let matched = Prefix::traverse_pair(&mut art, &mut left, &mut r).unwrap();
    assert_eq!(matched, 7);
    assert_eq!(left, l_end);
    assert_eq!(bytes_of(&art, r), &bytes[7..]);
    assert_canonical(&art, r);
}

#[test]
fn test_split_every_position() {
    let len = 3 * PREFIX_CAPACITY + 2;
    let bytes = pattern(len);
    for position in 0..=len {
        let mut art = Art::new();
        let original = chain(&mut art, &bytes);
        let (_, leaf) = layout(&art, original);
        let mut head = original;
        let split = Prefix::split(&mut art, &mut head, position).unwrap();

        let mut rebuilt = Vec::new();
        if let Some(tail) = split.parent_tail {
            assert_eq!(Prefix::get(&art, tail).continuation(), NodeHandle::EMPTY);
            rebuilt.extend(layout(&art, head).0.concat());
            assert_eq!(Prefix::tail(&art, head), tail);
        } else {
            assert_eq!(position, 0);
            assert_eq!(head, split.child);
        }
        match split.byte {
            Some(byte) => {
                rebuilt.push(byte);
                rebuilt.extend(bytes_of(&art, split.child));
                if split.child.is_prefix() {
                    assert_canonical(&art, split.child);
                } else {
                    assert_eq!(split.child, leaf);
                }
            }
            None => {
                assert_eq!(position, len);
                assert_eq!(split.child, leaf);
            }
        }
        assert_eq!(rebuilt, bytes, "position {}", position);

        let (parent_nodes, _) = layout(&art, head);
        if split.parent_tail.is_some() {
            assert_eq!(parent_nodes.concat().len(), position);
            for node in &parent_nodes[..parent_nodes.len() - 1] {
                assert_eq!(node.len(), PREFIX_CAPACITY);
            }
        }
    }
}

#[test]
fn test_split_at_zero_keeps_head_identity() {
    let mut art = Art::new();
    let bytes = pattern(10);
    let original = chain(&mut art, &bytes);
    let mut head = original;
    let split = Prefix::split(&mut art, &mut head, 0).unwrap();
    assert_eq!(split.byte, Some(bytes[0]));
    assert_eq!(split.child, original);
    assert_eq!(head, original);
    assert_eq!(split.parent_tail, None);
    assert_eq!(bytes_of(&art, original), &bytes[1..]);
    assert_canonical(&art, original);
}

#[test]
fn test_split_single_byte_chain_at_zero() {
    let mut art = Art::new();
    let mut head = chain(&mut art, &[0x10]);
    let (_, leaf) = layout(&art, head);
    let split = Prefix::split(&mut art, &mut head, 0).unwrap();
    assert_eq!(split.byte, Some(0x10));
    assert_eq!(split.child, leaf);
    assert_eq!(head, leaf);
    assert_eq!(art.prefixes.live(), 0);
}

#[test]
fn test_reduce_every_length() {
    let len = 2 * PREFIX_CAPACITY + 3;
    let bytes = pattern(len);
    for n in 1..=len {
        let mut art = Art::new();
        let mut head = chain(&mut art, &bytes);
        let (_, leaf) = layout(&art, head);
        Prefix::reduce(&mut art, &mut head, n).unwrap();
        if n == len {
            assert_eq!(head, leaf);
            assert_eq!(art.prefixes.live(), 0);
        } else {
            assert_eq!(bytes_of(&art, head), &bytes[n..]);
            assert_canonical(&art, head);
            assert_eq!(art.prefixes.live(), (len - n).div_ceil(PREFIX_CAPACITY));
        }
    }
}

#[test]
fn test_concatenate_without_chains() {
    let mut art = Art::new();
    let leaf = terminal(&mut art);
    let mut node = NodeHandle::EMPTY;
    Prefix::concatenate(&mut art, &mut node, 0x33, leaf).unwrap();
    let (nodes, end) = layout(&art, node);
    assert_eq!(nodes, vec![vec![0x33]]);
    assert_eq!(end, leaf);
}

#[test]
fn test_concatenate_onto_existing_chain() {
    let mut art = Art::new();
    let mut head = chain(&mut art, &pattern(7));
    let leaf = terminal(&mut art);
    Prefix::concatenate(&mut art, &mut head, 0x99, leaf).unwrap();
    let mut expected = pattern(7);
    expected.push(0x99);
    assert_eq!(bytes_of(&art, head), expected);
    assert_eq!(layout(&art, head).1, leaf);
    assert_canonical(&art, head);
}

#[test]
fn test_concatenate_two_chains_repacks() {
    for (left_len, right_len) in [(3, 4), (3, 12), (6, 1), (7, 9), (13, 13)] {
        let mut art = Art::new();
        let left = pattern(left_len);
        let right: Vec<u8> = pattern(right_len).into_iter().map(|b| b ^ 0x5A).collect();
        let mut head = chain(&mut art, &left);
        let (_, dangling) = layout(&art, head);
        // The left chain's own terminal is replaced by the concatenation.
        art.leaves.take(dangling);
        let child = chain(&mut art, &right);

        Prefix::concatenate(&mut art, &mut head, 0x00, child).unwrap();

        let mut expected = left.clone();
        expected.push(0x00);
        expected.extend(&right);
        assert_eq!(bytes_of(&art, head), expected);
        assert_canonical(&art, head);
        assert_eq!(
            art.prefixes.live(),
            expected.len().div_ceil(PREFIX_CAPACITY),
            "left {} right {}",
            left_len,
            right_len
        );
    }
}

#[test]
fn test_concatenate_chain_into_empty_slot() {
    let mut art = Art::new();
    let child = chain(&mut art, &pattern(9));
    let mut node = NodeHandle::EMPTY;
    Prefix::concatenate(&mut art, &mut node, 0x01, child).unwrap();
    let mut expected = vec![0x01];
    expected.extend(pattern(9));
    assert_eq!(bytes_of(&art, node), expected);
    assert_canonical(&art, node);
    assert_eq!(art.prefixes.live(), 2);
}

#[test]
fn test_serialize_round_trip_preserves_topology() {
    let mut art = Art::new();
    let head = chain(&mut art, &pattern(40));
    let mut manager = InMemoryBlockManager::new();
    let pointer = {
        let mut writer = MetaBlockWriter::new(&mut manager).unwrap();
        let pointer = node::serialize(&art, head, &mut writer).unwrap();
        writer.finish().unwrap();
        pointer
    };

    let mut loaded = Art::new();
    let mut reader = MetaBlockReader::new(&mut manager);
    let copy = node::deserialize(&mut loaded, &mut reader, pointer).unwrap();
    let (nodes, end) = layout(&loaded, copy);
    assert_eq!(nodes, layout(&art, head).0);
    assert_eq!(end.kind(), Some(NodeKind::Leaf));
    assert_eq!(loaded.leaves.get(end).row_ids(), &[1]);
}

fn write_prefix_record(
    writer: &mut MetaBlockWriter<InMemoryBlockManager>,
    count: u8,
    child: BlockPointer,
) -> BlockPointer {
    let pointer = writer.pointer().unwrap();
    writer.write_u8(NodeKind::Prefix.tag()).unwrap();
    writer.write_u8(count).unwrap();
    writer.write_bytes(&[0xAA; PREFIX_CAPACITY]).unwrap();
    writer.write_pointer(child).unwrap();
    pointer
}

#[test]
fn test_deserialize_rejects_bad_counts() {
    let mut manager = InMemoryBlockManager::new();
    let (oversized, empty, short_inner) = {
        let mut writer = MetaBlockWriter::new(&mut manager).unwrap();
        let leaf = writer.pointer().unwrap();
        writer.write_u8(NodeKind::Leaf.tag()).unwrap();
        writer.write_u32(1).unwrap();
        writer.write_u64(5).unwrap();

        let oversized = write_prefix_record(&mut writer, PREFIX_CAPACITY as u8 + 1, leaf);
        let empty = write_prefix_record(&mut writer, 0, leaf);
        let last = write_prefix_record(&mut writer, 3, leaf);
        let short_inner = write_prefix_record(&mut writer, 2, last);
        writer.finish().unwrap();
        (oversized, empty, short_inner)
    };

    for pointer in [oversized, empty, short_inner] {
        let mut art = Art::new();
        let mut reader = MetaBlockReader::new(&mut manager);
        match node::deserialize(&mut art, &mut reader, pointer) {
            Err(ArtError::Corruption(_)) => {}
            other => panic!("expected corruption, got {:?}", other),
        }
    }
}

#[test]
fn test_deserialize_rejects_cyclic_chains() {
    // Record size: tag, count, bytes, pointer.
    let record = 2 + PREFIX_CAPACITY as u32 + BlockPointer::ENCODED_SIZE as u32;
    let mut manager = InMemoryBlockManager::new();
    let (own, pair) = {
        let mut writer = MetaBlockWriter::new(&mut manager).unwrap();
        let own = writer.pointer().unwrap();
        assert_eq!(write_prefix_record(&mut writer, PREFIX_CAPACITY as u8, own), own);

        let first = writer.pointer().unwrap();
        let second = BlockPointer::new(first.block_id, first.offset + record);
        write_prefix_record(&mut writer, PREFIX_CAPACITY as u8, second);
        assert_eq!(write_prefix_record(&mut writer, PREFIX_CAPACITY as u8, first), second);
        writer.finish().unwrap();
        (own, first)
    };

    for pointer in [own, pair] {
        let mut art = Art::with_config(crate::config::ArtConfig {
            max_buffers_per_kind: Some(4),
            ..Default::default()
        });
        let mut reader = MetaBlockReader::new(&mut manager);
        match node::deserialize(&mut art, &mut reader, pointer) {
            Err(ArtError::Corruption(_)) => {}
            other => panic!("expected corruption, got {:?}", other),
        }
        assert!(art.prefixes.live() <= 2);
    }
}

#[test]
fn test_deserialize_rejects_branch_pointing_at_itself() {
    let mut manager = InMemoryBlockManager::new();
    let pointer = {
        let mut writer = MetaBlockWriter::new(&mut manager).unwrap();
        let pointer = writer.pointer().unwrap();
        writer.write_u8(NodeKind::Branch4.tag()).unwrap();
        writer.write_u16(1).unwrap();
        writer.write_u8(b'a').unwrap();
        writer.write_pointer(pointer).unwrap();
        writer.finish().unwrap();
        pointer
    };
    let mut art = Art::new();
    let mut reader = MetaBlockReader::new(&mut manager);
    assert!(matches!(
        node::deserialize(&mut art, &mut reader, pointer),
        Err(ArtError::Corruption(_))
    ));
}

#[test]
fn test_deserialize_rejects_unknown_tag() {
    let mut manager = InMemoryBlockManager::new();
    let pointer = {
        let mut writer = MetaBlockWriter::new(&mut manager).unwrap();
        let pointer = writer.pointer().unwrap();
        writer.write_u8(0x7F).unwrap();
        writer.finish().unwrap();
        pointer
    };
    let mut art = Art::new();
    let mut reader = MetaBlockReader::new(&mut manager);
    assert!(matches!(
        node::deserialize(&mut art, &mut reader, pointer),
        Err(ArtError::Corruption(_))
    ));
}

#[test]
fn test_vacuum_relocates_chain_nodes() {
    let mut art = Art::new();
    let heads: Vec<NodeHandle> = (0..crate::config::SLOTS_PER_BUFFER * 3 / 4)
        .map(|i| chain(&mut art, &pattern(4 * PREFIX_CAPACITY + i % 5)))
        .collect();
    // Keep a few chains spread over every buffer.
    let mut keep = Vec::new();
    for (i, mut head) in heads.into_iter().enumerate() {
        if i % 10 == 0 {
            keep.push(head);
        } else {
            Prefix::free(&mut art, &mut head);
        }
    }
    let expected: Vec<Vec<u8>> = keep.iter().map(|&h| bytes_of(&art, h)).collect();
    let before = art.prefixes.buffer_count();

    let mut flags = ArtFlags::default();
    flags.vacuum[NodeKind::Prefix.index()] = art
        .allocator_mut(NodeKind::Prefix)
        .initialize_vacuum(crate::config::DEFAULT_VACUUM_THRESHOLD_PERCENT);
    assert!(flags.vacuums(NodeKind::Prefix));

    let mut moved = Vec::new();
    for mut head in keep {
        node::vacuum(&mut art, &mut head, &flags).unwrap();
        moved.push(head);
    }
    art.allocator_mut(NodeKind::Prefix).finalize_vacuum();

    assert!(art.prefixes.buffer_count() < before);
    let actual: Vec<Vec<u8>> = moved.iter().map(|&h| bytes_of(&art, h)).collect();
    assert_eq!(actual, expected);
    for &head in &moved {
        assert_canonical(&art, head);
    }
}
