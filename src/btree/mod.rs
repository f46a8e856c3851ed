// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Disk-resident B-tree with multi-version commits.
//!
//! Blocks are never updated in place: modifying a block that belongs to a
//! committed revision reallocates it under a fresh number (shadow paging),
//! so every committed revision stays readable until its base file slot is
//! overwritten by a later commit.

pub mod base;
pub mod bitmap;
pub mod block;
pub mod cursor;

use crate::coding::{Decode, Encode};
use crate::file::{base_file_path, data_file_path, read_exact_at, rewrite_atomic, write_all_at, BaseSlot};
use crate::{Error, Revision, Slice};
use base::BaseFile;
use bitmap::{find_free, Bitmap};
use block::{
    build_overflow_block, max_inline_tag, overflow_capacity, patch_revision, BlockView,
    BranchItem, LeafItem, LeafTag, LeafTagRef, Node, OverflowView, MAX_KEY_LEN, NO_BLOCK,
};
use quick_cache::sync::Cache;
use rustc_hash::FxHashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Smallest allowed block size.
pub const MIN_BLOCK_SIZE: u32 = 2_048;

/// Largest allowed block size (item offsets are 16-bit).
pub const MAX_BLOCK_SIZE: u32 = 65_536;

const BLOCK_CACHE_ITEMS: usize = 1_024;

/// A single sorted key→tag store on disk.
pub struct Btree {
    dir: PathBuf,
    name: String,
    file: std::fs::File,
    writable: bool,
    block_size: usize,

    /// Base of the revision this handle has open
    committed: BaseFile,

    /// Slot the open base came from; commits go to the other one
    active_slot: BaseSlot,

    /// Live-block maps of both base slots, for the allocator
    slot_maps: [Option<Bitmap>; 2],

    latest_revision: Revision,

    // In-progress (uncommitted) state
    work_root: u32,
    work_level: u8,
    work_count: u64,
    work_last_block: u32,
    building: Bitmap,
    dirty: FxHashMap<u32, Node>,
    dirty_overflow: FxHashMap<u32, Vec<u8>>,
    failed: bool,

    cache: Cache<u32, Slice>,
    generation: AtomicU64,
}

fn slot_index(slot: BaseSlot) -> usize {
    match slot {
        BaseSlot::A => 0,
        BaseSlot::B => 1,
    }
}

fn check_block_size(block_size: u32) -> crate::Result<()> {
    if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size) {
        return Err(Error::InvalidArgument("block size out of range"));
    }
    Ok(())
}

impl Btree {
    /// Creates (or overwrites) a table on disk at revision 0.
    pub fn create(dir: &Path, name: &str, block_size: u32) -> crate::Result<()> {
        check_block_size(block_size)?;

        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(data_file_path(dir, name))
            .map_err(|e| Error::Create(format!("cannot create table '{name}': {e}")))?;

        let root = Node::Leaf(Vec::new()).serialize(block_size as usize, 0);
        write_all_at(&file, 0, &root)?;
        file.sync_all()?;

        let mut bitmap = Bitmap::new();
        bitmap.set(0);

        let base = BaseFile {
            revision: 0,
            block_size,
            root: 0,
            level: 0,
            entry_count: 0,
            last_block: 0,
            bitmap,
        };

        rewrite_atomic(&base_file_path(dir, name, BaseSlot::A), &base.encode_into_vec())?;

        // A stale second base from a previous database would confuse open
        let base_b = base_file_path(dir, name, BaseSlot::B);
        if base_b.try_exists()? {
            std::fs::remove_file(base_b)?;
        }

        log::debug!("created table {name:?} with block size {block_size}");

        Ok(())
    }

    /// Returns whether the table exists on disk.
    #[must_use]
    pub fn exists(dir: &Path, name: &str) -> bool {
        data_file_path(dir, name).exists()
            && (base_file_path(dir, name, BaseSlot::A).exists()
                || base_file_path(dir, name, BaseSlot::B).exists())
    }

    /// Opens the table, either at a specific revision or at the newest one.
    pub fn open(
        dir: &Path,
        name: &str,
        writable: bool,
        revision: Option<Revision>,
    ) -> crate::Result<Self> {
        let read_base = |slot: BaseSlot| -> Option<BaseFile> {
            let path = base_file_path(dir, name, slot);
            let bytes = std::fs::read(path).ok()?;
            match BaseFile::decode_from(&mut &bytes[..]) {
                Ok(base) => Some(base),
                Err(e) => {
                    log::warn!("discarding unreadable base file of table {name:?}: {e}");
                    None
                }
            }
        };

        let base_a = read_base(BaseSlot::A);
        let base_b = read_base(BaseSlot::B);

        let slot_maps = [
            base_a.as_ref().map(|b| b.bitmap.clone()),
            base_b.as_ref().map(|b| b.bitmap.clone()),
        ];

        let newest = |a: &Option<BaseFile>, b: &Option<BaseFile>| match (a, b) {
            (Some(a), Some(b)) => {
                if a.revision >= b.revision {
                    Some((BaseSlot::A, a.clone()))
                } else {
                    Some((BaseSlot::B, b.clone()))
                }
            }
            (Some(a), None) => Some((BaseSlot::A, a.clone())),
            (None, Some(b)) => Some((BaseSlot::B, b.clone())),
            (None, None) => None,
        };

        let Some((newest_slot, newest_base)) = newest(&base_a, &base_b) else {
            return Err(Error::Opening(format!(
                "table '{name}' has no readable base file",
            )));
        };
        let latest_revision = newest_base.revision;

        let (active_slot, committed) = match revision {
            None => (newest_slot, newest_base),
            Some(rev) => {
                if let Some(base) = base_a.filter(|b| b.revision == rev) {
                    (BaseSlot::A, base)
                } else if let Some(base) = base_b.filter(|b| b.revision == rev) {
                    (BaseSlot::B, base)
                } else {
                    return Err(Error::RevisionNotFound(rev));
                }
            }
        };

        check_block_size(committed.block_size)?;

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(writable)
            .open(data_file_path(dir, name))
            .map_err(|e| Error::Opening(format!("cannot open table '{name}': {e}")))?;

        log::debug!(
            "opened table {name:?} at revision {} (latest {latest_revision})",
            committed.revision,
        );

        Ok(Self {
            dir: dir.into(),
            name: name.into(),
            file,
            writable,
            block_size: committed.block_size as usize,
            work_root: committed.root,
            work_level: committed.level,
            work_count: committed.entry_count,
            work_last_block: committed.last_block,
            building: committed.bitmap.clone(),
            committed,
            active_slot,
            slot_maps,
            latest_revision,
            dirty: FxHashMap::default(),
            dirty_overflow: FxHashMap::default(),
            failed: false,
            cache: Cache::new(BLOCK_CACHE_ITEMS),
            generation: AtomicU64::new(0),
        })
    }

    /// Revision this handle has open.
    #[must_use]
    pub fn open_revision(&self) -> Revision {
        self.committed.revision
    }

    /// Newest revision present on disk (may be newer than the open one).
    #[must_use]
    pub fn latest_revision(&self) -> Revision {
        self.latest_revision
    }

    /// Number of committed entries.
    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.committed.entry_count
    }

    /// Block size of this table.
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn committed_root(&self) -> u32 {
        self.committed.root
    }

    /// Reads a committed block, going through the clean-block cache.
    pub(crate) fn read_block(&self, n: u32) -> crate::Result<Slice> {
        if let Some(block) = self.cache.get(&n) {
            return Ok(block);
        }

        let mut buf = vec![0u8; self.block_size];
        read_exact_at(&self.file, u64::from(n) * self.block_size as u64, &mut buf).map_err(
            |e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    Error::Corrupt("block read past end of data file")
                } else {
                    Error::Io(e)
                }
            },
        )?;

        let block: Slice = buf.into();

        // A stamp from the future means a writer reused this block after our
        // revision was superseded.
        let stamp = u32::from_le_bytes([block[4], block[5], block[6], block[7]]);
        if stamp > self.committed.revision {
            return Err(Error::Modified(
                "block was overwritten by a newer revision; reopen the database",
            ));
        }

        self.cache.insert(n, block.clone());
        Ok(block)
    }

    pub(crate) fn materialize_tag(&self, block: &Slice, tag: LeafTagRef) -> crate::Result<Slice> {
        match tag {
            LeafTagRef::Inline { start, len } => Ok(block.slice(start..start + len)),
            LeafTagRef::Overflow {
                total_len,
                first_block,
            } => self.read_overflow_chain(first_block, total_len),
        }
    }

    fn read_leaf_tag(&self, tag: &LeafTag) -> crate::Result<Slice> {
        match tag {
            LeafTag::Inline(tag) => Ok(tag.clone()),
            LeafTag::Overflow {
                total_len,
                first_block,
            } => self.read_overflow_chain(*first_block, *total_len),
        }
    }

    fn read_overflow_chain(&self, first: u32, total_len: u32) -> crate::Result<Slice> {
        let mut out = Vec::with_capacity(total_len as usize);
        let mut n = first;
        let max_blocks = total_len as usize / overflow_capacity(self.block_size) + 2;
        let mut steps = 0;

        while n != NO_BLOCK {
            steps += 1;
            if steps > max_blocks {
                return Err(Error::Corrupt("overflow chain longer than its tag"));
            }

            let next = if let Some(raw) = self.dirty_overflow.get(&n) {
                let view = OverflowView::new(raw, self.block_size)?;
                out.extend_from_slice(view.fragment());
                view.next()
            } else {
                let block = self.read_block(n)?;
                let view = OverflowView::new(&block, self.block_size)?;
                out.extend_from_slice(view.fragment());
                view.next()
            };
            n = next;
        }

        if out.len() != total_len as usize {
            return Err(Error::Corrupt("overflow chain length mismatch"));
        }

        Ok(out.into())
    }

    /// Point lookup.
    pub fn get(&self, key: &[u8]) -> crate::Result<Option<Slice>> {
        let mut n = self.work_root;

        loop {
            if let Some(node) = self.dirty.get(&n) {
                match node {
                    Node::Branch { items, .. } => {
                        let idx = node.search_child(key);
                        n = items
                            .get(idx)
                            .ok_or(Error::Corrupt("child index out of bounds"))?
                            .child;
                    }
                    Node::Leaf(items) => {
                        return match items.binary_search_by(|item| item.key.as_ref().cmp(key)) {
                            Ok(i) => {
                                let item = items
                                    .get(i)
                                    .ok_or(Error::Corrupt("leaf index out of bounds"))?;
                                self.read_leaf_tag(&item.tag).map(Some)
                            }
                            Err(_) => Ok(None),
                        };
                    }
                }
            } else {
                let block = self.read_block(n)?;
                let view = BlockView::new(&block, self.block_size)?;

                if view.level() > 0 {
                    n = view.child_at(view.search_child(key));
                } else {
                    return match view.search_leaf(key) {
                        Ok(i) => self.materialize_tag(&block, view.leaf_tag_at(i)).map(Some),
                        Err(_) => Ok(None),
                    };
                }
            }
        }
    }

    fn ensure_writable(&self) -> crate::Result<()> {
        if !self.writable {
            return Err(Error::InvalidArgument("table is read-only"));
        }
        Ok(())
    }

    fn allocate_block(&mut self) -> u32 {
        let mut maps: Vec<&Bitmap> = Vec::with_capacity(3);
        maps.push(&self.building);
        for map in self.slot_maps.iter().flatten() {
            maps.push(map);
        }

        let n = find_free(&maps);
        self.building.set(n);
        self.work_last_block = self.work_last_block.max(n);
        n
    }

    fn free_block(&mut self, n: u32) {
        self.building.clear(n);
    }

    /// Makes block `n` dirty under a this-revision block number, rewiring
    /// its parent (or the root pointer).
    fn shadow(&mut self, n: u32, parent: Option<(u32, usize)>) -> crate::Result<u32> {
        if self.dirty.contains_key(&n) {
            return Ok(n);
        }

        let block = self.read_block(n)?;
        let node = Node::from_block(&block, self.block_size)?;

        self.free_block(n);
        let new_n = self.allocate_block();
        self.dirty.insert(new_n, node);

        match parent {
            None => self.work_root = new_n,
            Some((parent_n, idx)) => {
                let Some(Node::Branch { items, .. }) = self.dirty.get_mut(&parent_n) else {
                    return Err(Error::Corrupt("parent of shadowed block is not dirty"));
                };
                items
                    .get_mut(idx)
                    .ok_or(Error::Corrupt("child index out of bounds"))?
                    .child = new_n;
            }
        }

        Ok(new_n)
    }

    fn dirty_node(&self, n: u32) -> crate::Result<&Node> {
        self.dirty.get(&n).ok_or(Error::Corrupt("dirty node missing"))
    }

    fn dirty_node_mut(&mut self, n: u32) -> crate::Result<&mut Node> {
        self.dirty
            .get_mut(&n)
            .ok_or(Error::Corrupt("dirty node missing"))
    }

    fn build_leaf_tag(&mut self, tag: &[u8]) -> crate::Result<LeafTag> {
        if tag.len() <= max_inline_tag(self.block_size) {
            return Ok(LeafTag::Inline(tag.into()));
        }

        let total_len =
            u32::try_from(tag.len()).map_err(|_| Error::InvalidArgument("tag too large"))?;

        let mut next = NO_BLOCK;
        for fragment in tag.chunks(overflow_capacity(self.block_size)).rev() {
            let n = self.allocate_block();
            let buf = build_overflow_block(self.block_size, fragment, next);
            self.dirty_overflow.insert(n, buf);
            next = n;
        }

        Ok(LeafTag::Overflow {
            total_len,
            first_block: next,
        })
    }

    fn free_overflow_chain(&mut self, first: u32) -> crate::Result<()> {
        let mut n = first;
        let mut steps = 0u32;

        while n != NO_BLOCK {
            steps += 1;
            if steps > self.work_last_block.saturating_add(2) {
                return Err(Error::Corrupt("overflow chain contains a cycle"));
            }

            let next = if let Some(raw) = self.dirty_overflow.remove(&n) {
                OverflowView::new(&raw, self.block_size)?.next()
            } else {
                let block = self.read_block(n)?;
                OverflowView::new(&block, self.block_size)?.next()
            };

            self.free_block(n);
            n = next;
        }

        Ok(())
    }

    fn split_root_if_full(&mut self) -> crate::Result<()> {
        let root = self.shadow(self.work_root, None)?;
        if self.dirty_node(root)?.has_room(self.block_size) {
            return Ok(());
        }

        let (sep, right) = self.dirty_node_mut(root)?.split();
        let right_n = self.allocate_block();
        self.dirty.insert(right_n, right);

        let left_key = match self.dirty_node(root)? {
            Node::Leaf(items) => items.first().map(|i| i.key.clone()),
            Node::Branch { items, .. } => items.first().map(|i| i.key.clone()),
        }
        .unwrap_or_else(Slice::empty);

        let new_root = self.allocate_block();
        self.dirty.insert(
            new_root,
            Node::Branch {
                level: self.work_level + 1,
                items: vec![
                    BranchItem {
                        key: left_key,
                        child: root,
                    },
                    BranchItem {
                        key: sep,
                        child: right_n,
                    },
                ],
            },
        );

        self.work_root = new_root;
        self.work_level += 1;

        Ok(())
    }

    /// Inserts or replaces an entry.
    pub fn put(&mut self, key: &[u8], tag: &[u8]) -> crate::Result<()> {
        self.ensure_writable()?;
        if key.is_empty() || key.len() > MAX_KEY_LEN {
            return Err(Error::InvalidArgument("key length out of range"));
        }

        self.bump_generation();
        self.split_root_if_full()?;

        // Descend, splitting full children before entering them, so every
        // node on the path is dirty and can absorb one more item.
        let mut cur = self.work_root;
        loop {
            let (idx, child) = match self.dirty_node(cur)? {
                Node::Leaf(_) => break,
                node @ Node::Branch { .. } => {
                    let idx = node.search_child(key);
                    let Node::Branch { items, .. } = node else {
                        unreachable!()
                    };
                    (
                        idx,
                        items
                            .get(idx)
                            .ok_or(Error::Corrupt("child index out of bounds"))?
                            .child,
                    )
                }
            };

            let child = self.shadow(child, Some((cur, idx)))?;

            if self.dirty_node(child)?.has_room(self.block_size) {
                cur = child;
                continue;
            }

            let (sep, right) = self.dirty_node_mut(child)?.split();
            let right_n = self.allocate_block();
            self.dirty.insert(right_n, right);

            let Node::Branch { items, .. } = self.dirty_node_mut(cur)? else {
                return Err(Error::Corrupt("descent hit a leaf at branch level"));
            };
            items.insert(
                idx + 1,
                BranchItem {
                    key: sep.clone(),
                    child: right_n,
                },
            );

            cur = if key >= &*sep { right_n } else { child };
        }

        let tag = self.build_leaf_tag(tag)?;

        let (inserted, freed_chain) = {
            let Node::Leaf(items) = self.dirty_node_mut(cur)? else {
                return Err(Error::Corrupt("descent ended on a non-leaf"));
            };

            match items.binary_search_by(|item| item.key.as_ref().cmp(key)) {
                Ok(i) => {
                    let slot = items
                        .get_mut(i)
                        .ok_or(Error::Corrupt("leaf index out of bounds"))?;
                    let old = std::mem::replace(&mut slot.tag, tag);
                    let freed = match old {
                        LeafTag::Overflow { first_block, .. } => Some(first_block),
                        LeafTag::Inline(_) => None,
                    };
                    (false, freed)
                }
                Err(i) => {
                    items.insert(
                        i,
                        LeafItem {
                            key: key.into(),
                            tag,
                        },
                    );
                    (true, None)
                }
            }
        };

        if inserted {
            self.work_count += 1;
        }
        if let Some(first) = freed_chain {
            self.free_overflow_chain(first)?;
        }

        Ok(())
    }

    /// Removes an entry; returns whether it existed.
    ///
    /// Leaves that become empty are not rebalanced; cursors skip them.
    pub fn delete(&mut self, key: &[u8]) -> crate::Result<bool> {
        self.ensure_writable()?;

        if self.get(key)?.is_none() {
            return Ok(false);
        }

        self.bump_generation();

        let mut cur = self.shadow(self.work_root, None)?;
        loop {
            let (idx, child) = match self.dirty_node(cur)? {
                Node::Leaf(_) => break,
                node @ Node::Branch { .. } => {
                    let idx = node.search_child(key);
                    let Node::Branch { items, .. } = node else {
                        unreachable!()
                    };
                    (
                        idx,
                        items
                            .get(idx)
                            .ok_or(Error::Corrupt("child index out of bounds"))?
                            .child,
                    )
                }
            };
            cur = self.shadow(child, Some((cur, idx)))?;
        }

        let freed_chain = {
            let Node::Leaf(items) = self.dirty_node_mut(cur)? else {
                return Err(Error::Corrupt("descent ended on a non-leaf"));
            };

            match items.binary_search_by(|item| item.key.as_ref().cmp(key)) {
                Ok(i) => match items.remove(i).tag {
                    LeafTag::Overflow { first_block, .. } => Some(first_block),
                    LeafTag::Inline(_) => None,
                },
                Err(_) => return Ok(false),
            }
        };

        self.work_count -= 1;
        if let Some(first) = freed_chain {
            self.free_overflow_chain(first)?;
        }

        Ok(true)
    }

    /// Writes all dirty blocks and a new base file for `new_revision`.
    ///
    /// The base goes into the slot not holding the currently open revision,
    /// so a crash anywhere in here leaves the old revision intact.
    pub fn commit(&mut self, new_revision: Revision) -> crate::Result<()> {
        self.ensure_writable()?;
        if self.failed {
            return Err(Error::Corrupt("table is in a failed state"));
        }
        if new_revision <= self.latest_revision {
            return Err(Error::InvalidArgument("revision numbers must increase"));
        }

        let result = self.commit_inner(new_revision);
        if result.is_err() {
            self.failed = true;
        }
        result
    }

    fn commit_inner(&mut self, new_revision: Revision) -> crate::Result<()> {
        for (&n, node) in &self.dirty {
            let buf = node.serialize(self.block_size, new_revision);
            write_all_at(&self.file, u64::from(n) * self.block_size as u64, &buf)?;
            self.cache.insert(n, buf.into());
        }

        for (&n, raw) in &mut self.dirty_overflow {
            patch_revision(raw, new_revision);
            write_all_at(&self.file, u64::from(n) * self.block_size as u64, raw)?;
            self.cache.insert(n, raw.clone().into());
        }

        self.file.sync_all()?;

        let base = BaseFile {
            revision: new_revision,
            #[allow(clippy::cast_possible_truncation)]
            block_size: self.block_size as u32,
            root: self.work_root,
            level: self.work_level,
            entry_count: self.work_count,
            last_block: self.work_last_block,
            bitmap: self.building.clone(),
        };

        let slot = self.active_slot.other();
        rewrite_atomic(
            &base_file_path(&self.dir, &self.name, slot),
            &base.encode_into_vec(),
        )?;

        self.slot_maps[slot_index(slot)] = Some(self.building.clone());
        self.active_slot = slot;
        self.latest_revision = new_revision;
        self.committed = base;
        self.dirty.clear();
        self.dirty_overflow.clear();
        self.bump_generation();

        log::debug!(
            "committed table {:?} at revision {new_revision} ({} entries)",
            self.name,
            self.work_count,
        );

        Ok(())
    }

    /// Opens a cursor over the committed state of the tree.
    #[must_use]
    pub fn cursor(&self) -> cursor::Cursor<'_> {
        cursor::Cursor::new(self)
    }

    /// Discards all uncommitted changes.
    pub fn rollback(&mut self) {
        self.dirty.clear();
        self.dirty_overflow.clear();
        self.building = self.committed.bitmap.clone();
        self.work_root = self.committed.root;
        self.work_level = self.committed.level;
        self.work_count = self.committed.entry_count;
        self.work_last_block = self.committed.last_block;
        self.failed = false;
        self.bump_generation();
    }
}
