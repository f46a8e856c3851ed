// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::Table;
use crate::btree::block::MAX_KEY_LEN;
use crate::btree::cursor::Cursor as DiskCursor;
use crate::{Error, Slice};
use std::ops::Bound;

/// Sorts above every legal key.
const HIGH_KEY: [u8; MAX_KEY_LEN + 1] = [0xff; MAX_KEY_LEN + 1];

#[derive(Clone, Debug, Eq, PartialEq)]
enum State {
    Unpositioned,
    AtStart,
    At(Slice),
    AfterEnd,
}

/// A cursor over the merged view of a table's overlay and its on-disk tree.
///
/// At each step the smaller of the two next keys wins; tombstoned keys are
/// skipped entirely. Any buffered write to the table invalidates the cursor.
pub struct TableCursor<'a> {
    table: &'a Table,
    generation: u64,
    disk: DiskCursor<'a>,
    state: State,
}

impl<'a> TableCursor<'a> {
    pub(crate) fn new(table: &'a Table) -> Self {
        Self {
            table,
            generation: table.generation(),
            disk: table.btree.cursor(),
            state: State::Unpositioned,
        }
    }

    fn check_valid(&self) -> crate::Result<()> {
        if self.generation != self.table.generation() {
            return Err(Error::Modified(
                "cursor was invalidated by a write to the table",
            ));
        }
        Ok(())
    }

    /// Whether the cursor sits on a real entry.
    #[must_use]
    pub fn is_positioned(&self) -> bool {
        matches!(self.state, State::At(_))
    }

    /// Whether the cursor has run past the last entry.
    #[must_use]
    pub fn after_end(&self) -> bool {
        self.state == State::AfterEnd
    }

    /// Current key; empty when on the sentinel.
    #[must_use]
    pub fn current_key(&self) -> &[u8] {
        match &self.state {
            State::At(key) => key,
            _ => &[],
        }
    }

    /// Positions on `key` or the greatest live key before it; always leaves
    /// the cursor positioned (possibly on the empty sentinel).
    pub fn find_entry(&mut self, key: &[u8]) -> crate::Result<bool> {
        self.check_valid()?;

        match self.table.overlay.get(key) {
            Some(entry) => {
                if entry.value().is_some() {
                    self.state = State::At(key.into());
                    return Ok(true);
                }
                // Tombstoned: fall through to the predecessor search
            }
            None => {
                if self.disk.find(key)? {
                    self.state = State::At(key.into());
                    return Ok(true);
                }
            }
        }

        match self.prev_live(Some(key))? {
            Some(prev) => self.state = State::At(prev),
            None => self.state = State::AtStart,
        }
        Ok(false)
    }

    /// Advances to the next live key.
    pub fn next(&mut self) -> crate::Result<bool> {
        self.check_valid()?;

        let from: Slice = match &self.state {
            State::At(key) => key.clone(),
            State::AtStart => Slice::empty(),
            State::Unpositioned | State::AfterEnd => return Ok(false),
        };

        match self.next_live(&from)? {
            Some(key) => {
                self.state = State::At(key);
                Ok(true)
            }
            None => {
                self.state = State::AfterEnd;
                Ok(false)
            }
        }
    }

    /// Moves back to the previous live key; lands on the sentinel when none
    /// is left.
    pub fn prev(&mut self) -> crate::Result<bool> {
        self.check_valid()?;

        let bound = match &self.state {
            State::At(key) => Some(key.clone()),
            State::AfterEnd => None,
            State::AtStart | State::Unpositioned => return Ok(false),
        };

        match self.prev_live(bound.as_deref())? {
            Some(key) => {
                self.state = State::At(key);
                Ok(true)
            }
            None => {
                self.state = State::AtStart;
                Ok(false)
            }
        }
    }

    /// Fetches the tag of the current entry.
    pub fn read_tag(&self) -> crate::Result<Slice> {
        self.check_valid()?;

        let State::At(key) = &self.state else {
            return Err(Error::InvalidArgument("cursor is not on an entry"));
        };

        if let Some(entry) = self.table.overlay.get(&**key) {
            return entry
                .value()
                .clone()
                .ok_or(Error::Corrupt("cursor is on a deleted entry"));
        }

        self.table
            .btree
            .get(key)?
            .ok_or(Error::Corrupt("cursor entry disappeared from the table"))
    }

    /// Smallest live key strictly greater than `after`.
    fn next_live(&mut self, after: &[u8]) -> crate::Result<Option<Slice>> {
        let mut from: Slice = after.into();

        loop {
            let disk_key = {
                self.disk.find(&from)?;
                if self.disk.next()? {
                    Some(self.disk.key().clone())
                } else {
                    None
                }
            };

            let overlay = self.table.overlay.lower_bound(Bound::Excluded(&*from));

            match (disk_key, overlay) {
                (None, None) => return Ok(None),
                (Some(disk), None) => return Ok(Some(disk)),
                (None, Some(overlay)) => {
                    let key: Slice = overlay.key().clone();
                    if overlay.value().is_some() {
                        return Ok(Some(key));
                    }
                    from = key;
                }
                (Some(disk), Some(overlay)) => {
                    let okey: Slice = overlay.key().clone();
                    if okey <= disk {
                        // Overlay wins ties; a tombstone hides the disk key
                        if overlay.value().is_some() {
                            return Ok(Some(okey));
                        }
                        from = okey;
                    } else {
                        // No overlay entry for `disk`, else lower_bound
                        // would have returned it first
                        return Ok(Some(disk));
                    }
                }
            }
        }
    }

    /// Greatest live key strictly below `bound` (unbounded when `None`).
    fn prev_live(&mut self, bound: Option<&[u8]>) -> crate::Result<Option<Slice>> {
        let mut bound: Option<Slice> = bound.map(Into::into);

        loop {
            let disk_key = match &bound {
                Some(b) => {
                    let exact = self.disk.find(b)?;
                    let positioned = if exact { self.disk.prev()? } else { self.disk.is_positioned() };
                    positioned.then(|| self.disk.key().clone())
                }
                None => {
                    self.disk.find(&HIGH_KEY)?;
                    self.disk
                        .is_positioned()
                        .then(|| self.disk.key().clone())
                }
            };

            let overlay = match &bound {
                Some(b) => self.table.overlay.upper_bound(Bound::Excluded(&**b)),
                None => self.table.overlay.back(),
            };

            match (disk_key, overlay) {
                (None, None) => return Ok(None),
                (Some(disk), None) => return Ok(Some(disk)),
                (None, Some(overlay)) => {
                    let key: Slice = overlay.key().clone();
                    if overlay.value().is_some() {
                        return Ok(Some(key));
                    }
                    bound = Some(key);
                }
                (Some(disk), Some(overlay)) => {
                    let okey: Slice = overlay.key().clone();
                    if okey >= disk {
                        if overlay.value().is_some() {
                            return Ok(Some(okey));
                        }
                        bound = Some(okey);
                    } else {
                        return Ok(Some(disk));
                    }
                }
            }
        }
    }
}
