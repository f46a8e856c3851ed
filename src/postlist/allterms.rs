// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::chunk::read_first_chunk_header;
use super::{term_key, PostlistTable};
use crate::pack::Unpacker;
use crate::table::cursor::TableCursor;
use crate::Error;

/// Iterator over every term in the database, ascending, optionally bounded
/// to a prefix; backed by the postlist table's first-chunk keys.
///
/// Term statistics are read lazily from the first-chunk header, so scans
/// that only need the term names never touch the tags.
pub struct AllTermsIterator<'a> {
    cursor: TableCursor<'a>,
    prefix: Vec<u8>,
    current_term: Vec<u8>,
    termfreq: u32,
    collfreq: u32,
    have_stats: bool,
    at_end: bool,
    started: bool,
    size_hint: u64,
}

impl<'a> AllTermsIterator<'a> {
    pub(crate) fn new(table: &'a PostlistTable, prefix: &[u8]) -> crate::Result<Self> {
        let mut iterator = Self {
            cursor: table.store.cursor(),
            prefix: prefix.to_vec(),
            current_term: Vec::new(),
            termfreq: 0,
            collfreq: 0,
            have_stats: false,
            at_end: false,
            started: false,
            size_hint: table.store.entry_count(),
        };

        if prefix.is_empty() {
            iterator.cursor.find_entry(b"")?;
            iterator.advance_to_first_chunk_key()?;
        } else if iterator.cursor.find_entry(&term_key(prefix))? {
            iterator.current_term = prefix.to_vec();
        } else {
            iterator.advance_to_first_chunk_key()?;
        }

        iterator.check_prefix();
        Ok(iterator)
    }

    /// Moves the cursor forward until it sits on a first-chunk key,
    /// skipping continuation chunks and the reserved (NUL-prefixed) keys.
    fn advance_to_first_chunk_key(&mut self) -> crate::Result<()> {
        loop {
            if !self.cursor.next()? {
                self.at_end = true;
                return Ok(());
            }

            let key = self.cursor.current_key();
            let mut unpacker = Unpacker::new(key);
            let Ok(term) = unpacker.string_preserving_sort() else {
                return Err(Error::Corrupt("postlist key has no term"));
            };

            // Reserved keys (metadata, …) parse as an empty term;
            // continuation chunks carry a docid suffix
            if term.is_empty() || !unpacker.is_empty() {
                continue;
            }

            self.current_term = term;
            return Ok(());
        }
    }

    fn check_prefix(&mut self) {
        if !self.at_end && !self.current_term.starts_with(&self.prefix) {
            self.at_end = true;
        }
    }

    /// Whether iteration has run past the last term.
    #[must_use]
    pub fn at_end(&self) -> bool {
        self.at_end
    }

    /// The current term.
    #[must_use]
    pub fn term(&self) -> &[u8] {
        &self.current_term
    }

    fn stats(&mut self) -> crate::Result<(u32, u32)> {
        if self.at_end {
            return Err(Error::InvalidArgument(
                "term statistics requested past the end",
            ));
        }

        if !self.have_stats {
            let tag = self.cursor.read_tag()?;
            let mut unpacker = Unpacker::new(&tag);
            let (termfreq, collfreq, _) = read_first_chunk_header(&mut unpacker)?;
            self.termfreq = termfreq;
            self.collfreq = collfreq;
            self.have_stats = true;
        }

        Ok((self.termfreq, self.collfreq))
    }

    /// Number of documents containing the current term.
    pub fn termfreq(&mut self) -> crate::Result<u32> {
        Ok(self.stats()?.0)
    }

    /// Collection frequency of the current term.
    pub fn collfreq(&mut self) -> crate::Result<u32> {
        Ok(self.stats()?.1)
    }

    /// Advances to the next term.
    ///
    /// The iterator starts *before* the first term, so the first call
    /// moves onto it.
    pub fn next(&mut self) -> crate::Result<()> {
        if !self.started {
            self.started = true;
            return Ok(());
        }
        if self.at_end {
            return Ok(());
        }

        self.have_stats = false;
        self.advance_to_first_chunk_key()?;
        self.check_prefix();
        Ok(())
    }

    /// Positions on the smallest term ≥ `term` (within the prefix bound).
    pub fn skip_to(&mut self, term: &[u8]) -> crate::Result<()> {
        self.started = true;
        self.have_stats = false;

        if self.cursor.find_entry(&term_key(term))? {
            self.current_term = term.to_vec();
            self.at_end = false;
        } else {
            self.at_end = false;
            self.advance_to_first_chunk_key()?;
        }

        self.check_prefix();
        Ok(())
    }

    /// Cheap estimate of the number of terms (table entries include
    /// continuation chunks and reserved keys, so this overestimates).
    #[must_use]
    pub fn approx_size(&self) -> u64 {
        self.size_hint
    }
}
