// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Buffered table: a disk B-tree plus an in-memory overlay of pending
//! changes.
//!
//! The overlay maps keys to either a replacement tag or a tombstone. Reads
//! consult the overlay first; cursors merge both sides. [`Table::apply`]
//! drains the overlay into the B-tree and commits, [`Table::cancel`] simply
//! drops it.

pub mod cursor;

use crate::btree::Btree;
use crate::{Revision, Slice};
use crossbeam_skiplist::SkipMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

/// A table of a database: one sorted key→tag store with a write buffer.
pub struct Table {
    pub(crate) btree: Btree,

    /// Pending modifications; `None` marks a deletion.
    overlay: SkipMap<Slice, Option<Slice>>,

    /// Entry count including pending changes.
    entry_count: AtomicU64,

    /// Bumped on every buffered write; outstanding cursors check it.
    generation: AtomicU64,
}

impl Table {
    /// Creates (or overwrites) the table on disk.
    pub fn create(dir: &Path, name: &str, block_size: u32) -> crate::Result<()> {
        Btree::create(dir, name, block_size)
    }

    /// Returns whether the table exists on disk.
    #[must_use]
    pub fn exists(dir: &Path, name: &str) -> bool {
        Btree::exists(dir, name)
    }

    /// Opens the table at a specific revision, or at the newest one.
    pub fn open(
        dir: &Path,
        name: &str,
        writable: bool,
        revision: Option<Revision>,
    ) -> crate::Result<Self> {
        let btree = Btree::open(dir, name, writable, revision)?;
        let entry_count = btree.entry_count();

        Ok(Self {
            btree,
            overlay: SkipMap::new(),
            entry_count: AtomicU64::new(entry_count),
            generation: AtomicU64::new(0),
        })
    }

    /// Revision this table has open.
    #[must_use]
    pub fn open_revision(&self) -> Revision {
        self.btree.open_revision()
    }

    /// Newest revision on disk.
    #[must_use]
    pub fn latest_revision(&self) -> Revision {
        self.btree.latest_revision()
    }

    /// Number of entries, counting pending changes.
    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.entry_count.load(Ordering::Acquire)
    }

    /// Whether there are pending, unapplied changes.
    #[must_use]
    pub fn is_modified(&self) -> bool {
        !self.overlay.is_empty()
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Reads the tag stored under exactly `key`.
    ///
    /// An empty tag is a real value, distinct from the key being absent.
    pub fn get_exact_entry(&self, key: &[u8]) -> crate::Result<Option<Slice>> {
        if let Some(entry) = self.overlay.get(key) {
            return Ok(entry.value().clone());
        }
        self.btree.get(key)
    }

    /// Buffers a write (`Some`) or a deletion (`None`) of `key`.
    pub fn set_entry(&self, key: Slice, tag: Option<Slice>) -> crate::Result<()> {
        let existed = match self.overlay.get(&*key) {
            Some(entry) => entry.value().is_some(),
            None => self.btree.get(&key)?.is_some(),
        };

        match (existed, tag.is_some()) {
            (false, true) => {
                self.entry_count.fetch_add(1, Ordering::AcqRel);
            }
            (true, false) => {
                self.entry_count.fetch_sub(1, Ordering::AcqRel);
            }
            _ => {}
        }

        self.overlay.insert(key, tag);
        self.bump_generation();

        Ok(())
    }

    /// Flushes the overlay into the B-tree and commits `new_revision`.
    ///
    /// Called with an empty overlay this still commits, which is how
    /// recovery forces every table to a common revision number.
    pub fn apply(&mut self, new_revision: Revision) -> crate::Result<()> {
        let overlay = &self.overlay;
        let btree = &mut self.btree;

        for entry in overlay.iter() {
            let result = match entry.value() {
                Some(tag) => btree.put(entry.key(), tag).map(|()| ()),
                None => btree.delete(entry.key()).map(|_| ()),
            };

            if let Err(e) = result {
                btree.rollback();
                return Err(e);
            }
        }

        self.btree.commit(new_revision)?;

        self.overlay = SkipMap::new();
        self.entry_count
            .store(self.btree.entry_count(), Ordering::Release);
        self.bump_generation();

        Ok(())
    }

    /// Discards all pending changes; disk state is untouched.
    pub fn cancel(&mut self) {
        self.overlay = SkipMap::new();
        self.btree.rollback();
        self.entry_count
            .store(self.btree.entry_count(), Ordering::Release);
        self.bump_generation();
    }

    /// Opens a merged cursor over overlay and disk state.
    #[must_use]
    pub fn cursor(&self) -> cursor::TableCursor<'_> {
        cursor::TableCursor::new(self)
    }
}
