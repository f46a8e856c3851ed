// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::pack::{docid_key, pack_uint32, Unpacker};
use crate::table::Table;
use crate::{DocId, Error, Slice, TermPos};

/// Positions of one term inside one document, stored as
/// `count, gap₁−1, gap₂−1, …` under the key `docid ⧺ term`.
pub struct PositionTable {
    pub(crate) store: Table,
}

impl PositionTable {
    pub(crate) fn new(store: Table) -> Self {
        Self { store }
    }

    fn make_key(did: DocId, term: &[u8]) -> crate::Result<Vec<u8>> {
        let mut key = docid_key(did)?;
        key.extend_from_slice(term);
        Ok(key)
    }

    /// Stores the full position list for `(did, term)`, replacing any prior
    /// one. Positions must be ≥ 1 and strictly increasing.
    pub fn set(&self, did: DocId, term: &[u8], positions: &[TermPos]) -> crate::Result<()> {
        let mut tag = Vec::new();
        pack_uint32(&mut tag, positions.len() as u32);

        let mut prev = 0;
        for &pos in positions {
            if pos <= prev {
                return Err(Error::InvalidArgument(
                    "positions must be >= 1 and strictly increasing",
                ));
            }
            pack_uint32(&mut tag, pos - prev - 1);
            prev = pos;
        }

        self.store
            .set_entry(Self::make_key(did, term)?.into(), Some(tag.into()))
    }

    /// Removes the position list for `(did, term)`.
    pub fn delete(&self, did: DocId, term: &[u8]) -> crate::Result<()> {
        self.store
            .set_entry(Self::make_key(did, term)?.into(), None)
    }

    /// Reads the position list for `(did, term)`.
    ///
    /// A missing record is not an error: it reads as the empty list,
    /// meaning no positional information is available.
    pub fn positions(&self, did: DocId, term: &[u8]) -> crate::Result<PositionIterator> {
        let key = Self::make_key(did, term)?;

        let Some(tag) = self.store.get_exact_entry(&key)? else {
            return Ok(PositionIterator::empty());
        };

        let mut unpacker = Unpacker::new(&tag);
        let count = unpacker.uint32().map_err(|e| {
            e.into_error(
                "position list truncated",
                "position list length too large",
            )
        })?;

        let start = unpacker.position();
        Ok(PositionIterator {
            data: tag.slice(start..),
            pos: 0,
            count,
            current: 0,
            at_end: false,
            have_started: false,
        })
    }
}

/// Iterator over the positions of one `(document, term)` pair, ascending.
pub struct PositionIterator {
    data: Slice,
    pos: usize,
    count: u32,
    current: TermPos,
    at_end: bool,
    have_started: bool,
}

impl PositionIterator {
    fn empty() -> Self {
        Self {
            data: Slice::empty(),
            pos: 0,
            count: 0,
            current: 0,
            at_end: false,
            have_started: false,
        }
    }

    /// Number of positions in the list.
    #[must_use]
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Whether iteration has run past the last position.
    #[must_use]
    pub fn at_end(&self) -> bool {
        self.at_end
    }

    /// The current position.
    #[must_use]
    pub fn position(&self) -> TermPos {
        self.current
    }

    fn next_internal(&mut self) -> crate::Result<()> {
        if self.pos >= self.data.len() {
            self.at_end = true;
            return Ok(());
        }

        let mut unpacker = Unpacker::new(self.data.get(self.pos..).unwrap_or_default());
        let increment = unpacker.uint32().map_err(|e| {
            e.into_error("position list truncated", "position in list too large")
        })?;
        self.pos += unpacker.position();

        self.current = self
            .current
            .checked_add(increment)
            .and_then(|p| p.checked_add(1))
            .ok_or(Error::Range("position out of representable range"))?;

        Ok(())
    }

    /// Advances to the next position.
    pub fn next(&mut self) -> crate::Result<()> {
        if self.at_end {
            return Ok(());
        }
        self.next_internal()?;
        self.have_started = true;
        Ok(())
    }

    /// Advances until the current position is at least `target`.
    pub fn skip_to(&mut self, target: TermPos) -> crate::Result<()> {
        if !self.have_started {
            self.next_internal()?;
            self.have_started = true;
        }
        while !self.at_end && self.current < target {
            self.next_internal()?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::btree::MIN_BLOCK_SIZE;
    use test_log::test;

    fn open_table(dir: &std::path::Path) -> crate::Result<PositionTable> {
        Table::create(dir, "position", MIN_BLOCK_SIZE)?;
        Ok(PositionTable::new(Table::open(dir, "position", true, None)?))
    }

    #[test]
    fn position_list_roundtrip() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let table = open_table(dir.path())?;

        table.set(1, b"foo", &[5, 8, 10, 12])?;

        let mut it = table.positions(1, b"foo")?;
        assert_eq!(4, it.count());

        let mut got = Vec::new();
        loop {
            it.next()?;
            if it.at_end() {
                break;
            }
            got.push(it.position());
        }
        assert_eq!(vec![5, 8, 10, 12], got);

        Ok(())
    }

    #[test]
    fn position_list_skip_to() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let table = open_table(dir.path())?;
        table.set(1, b"foo", &[5, 8, 10, 12])?;

        let mut it = table.positions(1, b"foo")?;
        it.skip_to(9)?;
        assert_eq!(10, it.position());

        it.next()?;
        assert_eq!(12, it.position());
        it.next()?;
        assert!(it.at_end());

        // Fresh read: skipping past the last position ends the iterator
        let mut it = table.positions(1, b"foo")?;
        it.skip_to(13)?;
        assert!(it.at_end());

        Ok(())
    }

    #[test]
    fn missing_position_list_reads_empty() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let table = open_table(dir.path())?;

        let mut it = table.positions(7, b"ghost")?;
        assert_eq!(0, it.count());
        assert!(!it.at_end());
        it.next()?;
        assert!(it.at_end());

        Ok(())
    }

    #[test]
    fn position_list_delete() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let table = open_table(dir.path())?;

        table.set(1, b"foo", &[1, 2])?;
        table.delete(1, b"foo")?;

        let it = table.positions(1, b"foo")?;
        assert_eq!(0, it.count());

        Ok(())
    }

    #[test]
    fn position_list_rejects_unsorted() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let table = open_table(dir.path())?;

        assert!(table.set(1, b"foo", &[5, 5]).is_err());
        assert!(table.set(1, b"foo", &[5, 3]).is_err());
        assert!(table.set(1, b"foo", &[0]).is_err());

        Ok(())
    }
}
