// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! On-disk page format.
//!
//! Every block starts with an 8-byte header: level (`0xff` marks an overflow
//! block), a pad byte, the item count, and the revision that wrote the
//! block. A directory of 2-byte item offsets grows up from the header while
//! item data grows down from the end of the block.
//!
//! Leaf items carry the tag inline when it is small; larger tags live in a
//! chain of overflow blocks linked through their headers.

use crate::binary_search::partition_point;
use crate::{Error, Revision, Slice};

/// Size of the common block header.
pub const BLOCK_HEADER_SIZE: usize = 8;

/// Size of an overflow block's header.
pub const OVERFLOW_HEADER_SIZE: usize = 12;

/// Level byte marking an overflow block.
pub const OVERFLOW_MARKER: u8 = 0xff;

/// Sentinel for "no block" (end of an overflow chain).
pub const NO_BLOCK: u32 = u32::MAX;

/// Longest allowed encoded key.
pub const MAX_KEY_LEN: usize = 252;

const TAG_INLINE: u8 = 0;
const TAG_OVERFLOW: u8 = 1;

// Worst-case footprint of a branch item: length field, key, child pointer,
// directory entry.
const BRANCH_MAX_FOOTPRINT: usize = 2 + MAX_KEY_LEN + 4 + 2;

/// Worst-case footprint of any single item (including its directory entry).
///
/// Keeping this at a quarter of the usable block space guarantees that after
/// a byte-balanced split, both halves can accept one more worst-case item.
#[must_use]
pub fn max_item_footprint(block_size: usize) -> usize {
    (block_size - BLOCK_HEADER_SIZE) / 4
}

/// Largest tag stored inline in a leaf; anything bigger spills into an
/// overflow chain.
#[must_use]
pub fn max_inline_tag(block_size: usize) -> usize {
    // length field + key + kind byte + tag length field + directory entry
    max_item_footprint(block_size) - (2 + MAX_KEY_LEN + 1 + 2 + 2)
}

/// Payload bytes per overflow block.
#[must_use]
pub fn overflow_capacity(block_size: usize) -> usize {
    block_size - OVERFLOW_HEADER_SIZE
}

/// Stamps the writing revision into an already serialized block.
pub fn patch_revision(buf: &mut [u8], revision: Revision) {
    if let Some(slot) = buf.get_mut(4..8) {
        slot.copy_from_slice(&revision.to_le_bytes());
    }
}

fn read_u16(data: &[u8], offset: usize) -> u16 {
    let bytes = data.get(offset..offset + 2).unwrap_or(&[0, 0]);
    u16::from_le_bytes([bytes[0], bytes[1]])
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    match data.get(offset..offset + 4) {
        Some(b) => u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
        None => 0,
    }
}

/// Location of a leaf item's tag.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LeafTagRef {
    /// Tag bytes stored inside the block, as absolute offsets
    Inline {
        /// Start offset inside the block
        start: usize,
        /// Tag length
        len: usize,
    },

    /// Tag stored in an overflow chain
    Overflow {
        /// Total tag length across the chain
        total_len: u32,
        /// First block of the chain
        first_block: u32,
    },
}

/// Read-only, validated view over a tree block.
pub struct BlockView<'a> {
    data: &'a [u8],
}

impl<'a> BlockView<'a> {
    /// Validates the header, directory, and every item's bounds.
    pub fn new(data: &'a [u8], block_size: usize) -> crate::Result<Self> {
        if data.len() != block_size {
            return Err(Error::Corrupt("block has wrong length"));
        }

        let level = data.first().copied().unwrap_or(OVERFLOW_MARKER);
        if level == OVERFLOW_MARKER {
            return Err(Error::Corrupt("tree block expected, found overflow block"));
        }

        let count = read_u16(data, 2) as usize;
        let dir_end = BLOCK_HEADER_SIZE + 2 * count;
        if dir_end > block_size {
            return Err(Error::Corrupt("block directory exceeds block size"));
        }

        let view = Self { data };
        for i in 0..count {
            view.validate_item(i, level, dir_end)?;
        }

        Ok(view)
    }

    fn validate_item(&self, i: usize, level: u8, dir_end: usize) -> crate::Result<()> {
        let offset = read_u16(self.data, BLOCK_HEADER_SIZE + 2 * i) as usize;
        if offset < dir_end || offset >= self.data.len() {
            return Err(Error::Corrupt("item offset out of bounds"));
        }

        let key_len = read_u16(self.data, offset) as usize;
        let key_end = offset + 2 + key_len;
        if key_len > MAX_KEY_LEN || key_end > self.data.len() {
            return Err(Error::Corrupt("item key out of bounds"));
        }

        if level > 0 {
            if key_end + 4 > self.data.len() {
                return Err(Error::Corrupt("child pointer out of bounds"));
            }
            return Ok(());
        }

        match self.data.get(key_end).copied() {
            Some(TAG_INLINE) => {
                let tag_len = read_u16(self.data, key_end + 1) as usize;
                if key_end + 3 + tag_len > self.data.len() {
                    return Err(Error::Corrupt("inline tag out of bounds"));
                }
            }
            Some(TAG_OVERFLOW) => {
                if key_end + 9 > self.data.len() {
                    return Err(Error::Corrupt("overflow descriptor out of bounds"));
                }
            }
            _ => return Err(Error::Corrupt("unknown tag kind")),
        }

        Ok(())
    }

    /// Tree level of this block (0 = leaf).
    #[must_use]
    pub fn level(&self) -> u8 {
        self.data.first().copied().unwrap_or_default()
    }

    /// Revision that wrote this block.
    #[must_use]
    pub fn revision(&self) -> Revision {
        read_u32(self.data, 4)
    }

    /// Number of items.
    #[must_use]
    pub fn count(&self) -> usize {
        read_u16(self.data, 2) as usize
    }

    fn item_offset(&self, i: usize) -> usize {
        read_u16(self.data, BLOCK_HEADER_SIZE + 2 * i) as usize
    }

    /// Key of item `i`.
    #[must_use]
    pub fn key_at(&self, i: usize) -> &'a [u8] {
        let offset = self.item_offset(i);
        let key_len = read_u16(self.data, offset) as usize;
        self.data
            .get(offset + 2..offset + 2 + key_len)
            .unwrap_or_default()
    }

    /// Child block of branch item `i`.
    #[must_use]
    pub fn child_at(&self, i: usize) -> u32 {
        let offset = self.item_offset(i);
        let key_len = read_u16(self.data, offset) as usize;
        read_u32(self.data, offset + 2 + key_len)
    }

    /// Tag location of leaf item `i`.
    #[must_use]
    pub fn leaf_tag_at(&self, i: usize) -> LeafTagRef {
        let offset = self.item_offset(i);
        let key_len = read_u16(self.data, offset) as usize;
        let key_end = offset + 2 + key_len;

        if self.data.get(key_end).copied() == Some(TAG_INLINE) {
            let len = read_u16(self.data, key_end + 1) as usize;
            LeafTagRef::Inline {
                start: key_end + 3,
                len,
            }
        } else {
            LeafTagRef::Overflow {
                total_len: read_u32(self.data, key_end + 1),
                first_block: read_u32(self.data, key_end + 5),
            }
        }
    }

    /// Binary-searches a leaf: `Ok(i)` on an exact match, `Err(i)` with the
    /// insertion point otherwise.
    pub fn search_leaf(&self, key: &[u8]) -> std::result::Result<usize, usize> {
        let idx = partition_point(self.count(), |i| self.key_at(i) < key);
        if idx < self.count() && self.key_at(idx) == key {
            Ok(idx)
        } else {
            Err(idx)
        }
    }

    /// Chooses the child to descend into for `key`.
    ///
    /// Item 0's key acts as negative infinity, so the leftmost child catches
    /// everything that sorts before the first separator.
    #[must_use]
    pub fn search_child(&self, key: &[u8]) -> usize {
        partition_point(self.count().saturating_sub(1), |i| {
            self.key_at(i + 1) <= key
        })
    }
}

/// Read-only view over an overflow block.
pub struct OverflowView<'a> {
    data: &'a [u8],
}

impl<'a> OverflowView<'a> {
    /// Validates the marker and fragment bounds.
    pub fn new(data: &'a [u8], block_size: usize) -> crate::Result<Self> {
        if data.len() != block_size {
            return Err(Error::Corrupt("block has wrong length"));
        }
        if data.first().copied() != Some(OVERFLOW_MARKER) {
            return Err(Error::Corrupt("overflow block expected"));
        }

        let frag_len = read_u16(data, 2) as usize;
        if OVERFLOW_HEADER_SIZE + frag_len > block_size {
            return Err(Error::Corrupt("overflow fragment out of bounds"));
        }

        Ok(Self { data })
    }

    /// Revision that wrote this block.
    #[must_use]
    pub fn revision(&self) -> Revision {
        read_u32(self.data, 4)
    }

    /// Next block in the chain, or [`NO_BLOCK`].
    #[must_use]
    pub fn next(&self) -> u32 {
        read_u32(self.data, 8)
    }

    /// Payload bytes of this block.
    #[must_use]
    pub fn fragment(&self) -> &'a [u8] {
        let frag_len = read_u16(self.data, 2) as usize;
        self.data
            .get(OVERFLOW_HEADER_SIZE..OVERFLOW_HEADER_SIZE + frag_len)
            .unwrap_or_default()
    }
}

/// Builds a raw overflow block (revision stamped later at commit time).
#[must_use]
pub fn build_overflow_block(block_size: usize, fragment: &[u8], next: u32) -> Vec<u8> {
    debug_assert!(fragment.len() <= overflow_capacity(block_size));

    let mut buf = vec![0u8; block_size];
    buf[0] = OVERFLOW_MARKER;

    #[allow(clippy::cast_possible_truncation)]
    buf[2..4].copy_from_slice(&(fragment.len() as u16).to_le_bytes());
    buf[8..12].copy_from_slice(&next.to_le_bytes());
    buf[OVERFLOW_HEADER_SIZE..OVERFLOW_HEADER_SIZE + fragment.len()]
        .copy_from_slice(fragment);

    buf
}

/// Where a leaf item's tag lives, owned form.
#[derive(Clone, Debug)]
pub enum LeafTag {
    /// Tag stored inline
    Inline(Slice),

    /// Tag stored in an overflow chain
    Overflow {
        /// Total tag length across the chain
        total_len: u32,
        /// First block of the chain
        first_block: u32,
    },
}

/// One leaf entry.
#[derive(Clone, Debug)]
pub struct LeafItem {
    /// Entry key
    pub key: Slice,
    /// Entry tag location
    pub tag: LeafTag,
}

/// One branch entry.
#[derive(Clone, Debug)]
pub struct BranchItem {
    /// Separator key (ignored for item 0)
    pub key: Slice,
    /// Child block number
    pub child: u32,
}

/// Parsed, mutable form of a tree block, held for dirty blocks.
#[derive(Clone, Debug)]
pub enum Node {
    /// Level-0 block
    Leaf(Vec<LeafItem>),

    /// Internal block
    Branch {
        /// Tree level (> 0)
        level: u8,
        /// Child separators
        items: Vec<BranchItem>,
    },
}

fn leaf_item_footprint(key_len: usize, tag: &LeafTag) -> usize {
    let tag_size = match tag {
        LeafTag::Inline(tag) => 2 + tag.len(),
        LeafTag::Overflow { .. } => 8,
    };
    // length field + key + kind byte + tag + directory entry
    2 + key_len + 1 + tag_size + 2
}

fn branch_item_footprint(key_len: usize) -> usize {
    2 + key_len + 4 + 2
}

impl Node {
    /// Parses a block into its owned form, sharing the block's buffer for
    /// keys and inline tags.
    pub fn from_block(block: &Slice, block_size: usize) -> crate::Result<Self> {
        let view = BlockView::new(block, block_size)?;
        let level = view.level();
        let count = view.count();

        if level == 0 {
            let mut items = Vec::with_capacity(count);
            for i in 0..count {
                let key_range = {
                    let key = view.key_at(i);
                    let start = offset_in(block, key);
                    start..start + key.len()
                };

                let tag = match view.leaf_tag_at(i) {
                    LeafTagRef::Inline { start, len } => {
                        LeafTag::Inline(block.slice(start..start + len))
                    }
                    LeafTagRef::Overflow {
                        total_len,
                        first_block,
                    } => LeafTag::Overflow {
                        total_len,
                        first_block,
                    },
                };

                items.push(LeafItem {
                    key: block.slice(key_range),
                    tag,
                });
            }
            Ok(Self::Leaf(items))
        } else {
            let mut items = Vec::with_capacity(count);
            for i in 0..count {
                let key = view.key_at(i);
                let start = offset_in(block, key);

                items.push(BranchItem {
                    key: block.slice(start..start + key.len()),
                    child: view.child_at(i),
                });
            }
            Ok(Self::Branch { level, items })
        }
    }

    /// Tree level (0 = leaf).
    #[must_use]
    pub fn level(&self) -> u8 {
        match self {
            Self::Leaf(_) => 0,
            Self::Branch { level, .. } => *level,
        }
    }

    /// Number of items.
    #[must_use]
    pub fn count(&self) -> usize {
        match self {
            Self::Leaf(items) => items.len(),
            Self::Branch { items, .. } => items.len(),
        }
    }

    /// Bytes this node occupies when serialized (directory included).
    #[must_use]
    pub fn used_bytes(&self) -> usize {
        let items: usize = match self {
            Self::Leaf(items) => items
                .iter()
                .map(|i| leaf_item_footprint(i.key.len(), &i.tag))
                .sum(),
            Self::Branch { items, .. } => items
                .iter()
                .map(|i| branch_item_footprint(i.key.len()))
                .sum(),
        };
        BLOCK_HEADER_SIZE + items
    }

    /// Whether one more worst-case item fits without splitting.
    #[must_use]
    pub fn has_room(&self, block_size: usize) -> bool {
        let worst = match self {
            Self::Leaf(_) => max_item_footprint(block_size),
            Self::Branch { .. } => BRANCH_MAX_FOOTPRINT,
        };
        self.used_bytes() + worst <= block_size
    }

    /// Splits off the upper half (byte-balanced), returning the separator
    /// key and the new right sibling.
    ///
    /// # Panics
    ///
    /// Panics if the node has fewer than two items.
    pub fn split(&mut self) -> (Slice, Self) {
        let total = self.used_bytes() - BLOCK_HEADER_SIZE;
        let half = total / 2;

        match self {
            Self::Leaf(items) => {
                assert!(items.len() >= 2, "cannot split node with < 2 items");

                let mut acc = 0;
                let mut at = items.len() - 1;
                for (i, item) in items.iter().enumerate() {
                    acc += leaf_item_footprint(item.key.len(), &item.tag);
                    if acc >= half && i + 1 < items.len() {
                        at = i + 1;
                        break;
                    }
                }

                let right = items.split_off(at);
                #[allow(clippy::indexing_slicing)]
                let sep = right[0].key.clone();
                (sep, Self::Leaf(right))
            }
            Self::Branch { level, items } => {
                assert!(items.len() >= 2, "cannot split node with < 2 items");

                let mut acc = 0;
                let mut at = items.len() - 1;
                for (i, item) in items.iter().enumerate() {
                    acc += branch_item_footprint(item.key.len());
                    if acc >= half && i + 1 < items.len() {
                        at = i + 1;
                        break;
                    }
                }

                let right = items.split_off(at);
                #[allow(clippy::indexing_slicing)]
                let sep = right[0].key.clone();
                (
                    sep,
                    Self::Branch {
                        level: *level,
                        items: right,
                    },
                )
            }
        }
    }

    /// Serializes into a full block buffer (revision stamped in).
    #[must_use]
    pub fn serialize(&self, block_size: usize, revision: Revision) -> Vec<u8> {
        debug_assert!(self.used_bytes() <= block_size, "node overflows block");

        let mut buf = vec![0u8; block_size];
        buf[0] = self.level();

        #[allow(clippy::cast_possible_truncation)]
        buf[2..4].copy_from_slice(&(self.count() as u16).to_le_bytes());
        patch_revision(&mut buf, revision);

        let mut data_pos = block_size;

        let write_dir = |buf: &mut Vec<u8>, i: usize, pos: usize| {
            #[allow(clippy::cast_possible_truncation)]
            let pos16 = (pos as u16).to_le_bytes();
            buf[BLOCK_HEADER_SIZE + 2 * i..BLOCK_HEADER_SIZE + 2 * i + 2]
                .copy_from_slice(&pos16);
        };

        match self {
            Self::Leaf(items) => {
                for (i, item) in items.iter().enumerate() {
                    let size = leaf_item_footprint(item.key.len(), &item.tag) - 2;
                    data_pos -= size;
                    write_dir(&mut buf, i, data_pos);

                    let mut pos = data_pos;
                    #[allow(clippy::cast_possible_truncation)]
                    buf[pos..pos + 2].copy_from_slice(&(item.key.len() as u16).to_le_bytes());
                    pos += 2;
                    buf[pos..pos + item.key.len()].copy_from_slice(&item.key);
                    pos += item.key.len();

                    match &item.tag {
                        LeafTag::Inline(tag) => {
                            buf[pos] = TAG_INLINE;
                            pos += 1;
                            #[allow(clippy::cast_possible_truncation)]
                            buf[pos..pos + 2]
                                .copy_from_slice(&(tag.len() as u16).to_le_bytes());
                            pos += 2;
                            buf[pos..pos + tag.len()].copy_from_slice(tag);
                        }
                        LeafTag::Overflow {
                            total_len,
                            first_block,
                        } => {
                            buf[pos] = TAG_OVERFLOW;
                            pos += 1;
                            buf[pos..pos + 4].copy_from_slice(&total_len.to_le_bytes());
                            pos += 4;
                            buf[pos..pos + 4].copy_from_slice(&first_block.to_le_bytes());
                        }
                    }
                }
            }
            Self::Branch { items, .. } => {
                for (i, item) in items.iter().enumerate() {
                    let size = branch_item_footprint(item.key.len()) - 2;
                    data_pos -= size;
                    write_dir(&mut buf, i, data_pos);

                    let mut pos = data_pos;
                    #[allow(clippy::cast_possible_truncation)]
                    buf[pos..pos + 2].copy_from_slice(&(item.key.len() as u16).to_le_bytes());
                    pos += 2;
                    buf[pos..pos + item.key.len()].copy_from_slice(&item.key);
                    pos += item.key.len();
                    buf[pos..pos + 4].copy_from_slice(&item.child.to_le_bytes());
                }
            }
        }

        buf
    }

    /// Chooses the child index to descend into for `key`.
    #[must_use]
    pub fn search_child(&self, key: &[u8]) -> usize {
        match self {
            Self::Leaf(_) => 0,
            Self::Branch { items, .. } => {
                partition_point(items.len().saturating_sub(1), |i| {
                    items.get(i + 1).map(|item| &*item.key <= key) == Some(true)
                })
            }
        }
    }
}

fn offset_in(block: &Slice, sub: &[u8]) -> usize {
    let base = block.as_ptr() as usize;
    sub.as_ptr() as usize - base
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use test_log::test;

    const BS: usize = 2048;

    fn leaf(items: &[(&[u8], &[u8])]) -> Node {
        Node::Leaf(
            items
                .iter()
                .map(|(k, v)| LeafItem {
                    key: Slice::from(*k),
                    tag: LeafTag::Inline(Slice::from(*v)),
                })
                .collect(),
        )
    }

    #[test]
    fn block_leaf_roundtrip() -> crate::Result<()> {
        let node = leaf(&[
            (b"alpha", b"1"),
            (b"beta", b""),
            (b"gamma", b"some longer tag value"),
        ]);

        let buf: Slice = node.serialize(BS, 7).into();
        let view = BlockView::new(&buf, BS)?;

        assert_eq!(0, view.level());
        assert_eq!(7, view.revision());
        assert_eq!(3, view.count());
        assert_eq!(b"alpha", view.key_at(0));
        assert_eq!(b"gamma", view.key_at(2));

        let reparsed = Node::from_block(&buf, BS)?;
        assert_eq!(3, reparsed.count());
        assert_eq!(node.used_bytes(), reparsed.used_bytes());

        Ok(())
    }

    #[test]
    fn block_branch_roundtrip() -> crate::Result<()> {
        let node = Node::Branch {
            level: 2,
            items: vec![
                BranchItem {
                    key: Slice::from(b"apple"),
                    child: 10,
                },
                BranchItem {
                    key: Slice::from(b"mango"),
                    child: 11,
                },
                BranchItem {
                    key: Slice::from(b"zebra"),
                    child: 12,
                },
            ],
        };

        let buf: Slice = node.serialize(BS, 3).into();
        let view = BlockView::new(&buf, BS)?;

        assert_eq!(2, view.level());
        assert_eq!(3, view.count());
        assert_eq!(11, view.child_at(1));

        // Item 0's key is -inf: everything before "mango" descends left
        assert_eq!(0, view.search_child(b"aardvark"));
        assert_eq!(0, view.search_child(b"banana"));
        assert_eq!(1, view.search_child(b"mango"));
        assert_eq!(1, view.search_child(b"pear"));
        assert_eq!(2, view.search_child(b"zzz"));

        Ok(())
    }

    #[test]
    fn block_leaf_search() -> crate::Result<()> {
        let node = leaf(&[(b"b", b"1"), (b"d", b"2"), (b"f", b"3")]);
        let buf: Slice = node.serialize(BS, 1).into();
        let view = BlockView::new(&buf, BS)?;

        assert_eq!(Err(0), view.search_leaf(b"a"));
        assert_eq!(Ok(0), view.search_leaf(b"b"));
        assert_eq!(Err(1), view.search_leaf(b"c"));
        assert_eq!(Ok(2), view.search_leaf(b"f"));
        assert_eq!(Err(3), view.search_leaf(b"g"));

        Ok(())
    }

    #[test]
    fn block_split_is_balanced() {
        let mut node = leaf(&[
            (b"a", b"xxxxxxxxxx"),
            (b"b", b"xxxxxxxxxx"),
            (b"c", b"xxxxxxxxxx"),
            (b"d", b"xxxxxxxxxx"),
        ]);

        let before = node.used_bytes();
        let (sep, right) = node.split();

        assert_eq!(sep, *b"c");
        assert_eq!(2, node.count());
        assert_eq!(2, right.count());
        assert!(node.used_bytes() < before);
    }

    #[test]
    fn block_rejects_garbage() {
        let buf = vec![0xabu8; BS];
        assert!(BlockView::new(&buf, BS).is_err());

        let mut buf = leaf(&[(b"a", b"1")]).serialize(BS, 1);
        // Corrupt the item offset
        buf[BLOCK_HEADER_SIZE] = 0xff;
        buf[BLOCK_HEADER_SIZE + 1] = 0xff;
        assert!(BlockView::new(&buf, BS).is_err());
    }

    #[test]
    fn overflow_block_roundtrip() -> crate::Result<()> {
        let mut buf = build_overflow_block(BS, b"fragment data", 99);
        patch_revision(&mut buf, 5);

        let view = OverflowView::new(&buf, BS)?;
        assert_eq!(b"fragment data", view.fragment());
        assert_eq!(99, view.next());
        assert_eq!(5, view.revision());

        Ok(())
    }
}
