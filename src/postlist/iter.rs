// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::chunk::{
    read_chunk_header, read_did_increase, read_first_chunk_header, read_wdf_and_length,
};
use super::{chunk_key, parse_key, term_key, PostlistTable};
use crate::pack::Unpacker;
use crate::table::cursor::TableCursor;
use crate::{DocId, Error, Slice};

/// Iterator over one term's postings: `(docid, wdf, doclen)` ascending by
/// docid, walking the chunks through a table cursor.
pub struct PostingIterator<'a> {
    cursor: TableCursor<'a>,
    term: Slice,

    termfreq: u32,
    collfreq: u32,

    did: DocId,
    wdf: u32,
    doclen: u32,

    first_did_in_chunk: DocId,
    last_did_in_chunk: DocId,
    is_last_chunk: bool,

    chunk: Slice,
    chunk_pos: usize,

    at_end: bool,
    started: bool,
}

impl<'a> PostingIterator<'a> {
    pub(crate) fn new(table: &'a PostlistTable, term: &[u8]) -> crate::Result<Self> {
        let mut cursor = table.store.cursor();
        let exact = cursor.find_entry(&term_key(term))?;

        let mut iterator = Self {
            cursor,
            term: term.into(),
            termfreq: 0,
            collfreq: 0,
            did: 0,
            wdf: 0,
            doclen: 0,
            first_did_in_chunk: 0,
            last_did_in_chunk: 0,
            is_last_chunk: true,
            chunk: Slice::empty(),
            chunk_pos: 0,
            at_end: !exact,
            started: false,
        };

        if !exact {
            // Term does not occur anywhere
            return Ok(iterator);
        }

        let tag = iterator.cursor.read_tag()?;
        let mut unpacker = Unpacker::new(&tag);

        let (termfreq, collfreq, first_did) = read_first_chunk_header(&mut unpacker)?;
        iterator.termfreq = termfreq;
        iterator.collfreq = collfreq;
        iterator.did = first_did;
        iterator.first_did_in_chunk = first_did;

        let (is_last, last_did) = read_chunk_header(&mut unpacker, first_did)?;
        iterator.is_last_chunk = is_last;
        iterator.last_did_in_chunk = last_did;

        let (wdf, doclen) = read_wdf_and_length(&mut unpacker)?;
        iterator.wdf = wdf;
        iterator.doclen = doclen;

        iterator.chunk_pos = unpacker.position();
        iterator.chunk = tag;

        Ok(iterator)
    }

    /// Number of documents containing the term.
    #[must_use]
    pub fn termfreq(&self) -> u32 {
        self.termfreq
    }

    /// Total occurrences of the term across the collection.
    #[must_use]
    pub fn collfreq(&self) -> u32 {
        self.collfreq
    }

    /// Whether iteration has run past the last posting.
    #[must_use]
    pub fn at_end(&self) -> bool {
        self.at_end
    }

    /// Current document id.
    #[must_use]
    pub fn docid(&self) -> DocId {
        self.did
    }

    /// Within-document frequency of the term in the current document.
    #[must_use]
    pub fn wdf(&self) -> u32 {
        self.wdf
    }

    /// Length of the current document.
    #[must_use]
    pub fn doc_length(&self) -> u32 {
        self.doclen
    }

    fn next_in_chunk(&mut self) -> crate::Result<bool> {
        if self.chunk_pos >= self.chunk.len() {
            return Ok(false);
        }

        let mut unpacker = Unpacker::new(self.chunk.get(self.chunk_pos..).unwrap_or_default());
        read_did_increase(&mut unpacker, &mut self.did)?;
        let (wdf, doclen) = read_wdf_and_length(&mut unpacker)?;
        self.wdf = wdf;
        self.doclen = doclen;
        self.chunk_pos += unpacker.position();

        if self.did > self.last_did_in_chunk {
            return Err(Error::Corrupt("posting chunk overruns its header's span"));
        }

        Ok(true)
    }

    fn load_chunk(&mut self, key_did: Option<DocId>) -> crate::Result<()> {
        let tag = self.cursor.read_tag()?;
        let mut unpacker = Unpacker::new(&tag);

        let first_did = match key_did {
            None => read_first_chunk_header(&mut unpacker)?.2,
            Some(did) => did,
        };

        let (is_last, last_did) = read_chunk_header(&mut unpacker, first_did)?;
        self.is_last_chunk = is_last;
        self.first_did_in_chunk = first_did;
        self.last_did_in_chunk = last_did;
        self.did = first_did;

        let (wdf, doclen) = read_wdf_and_length(&mut unpacker)?;
        self.wdf = wdf;
        self.doclen = doclen;

        self.chunk_pos = unpacker.position();
        self.chunk = tag;

        Ok(())
    }

    fn next_chunk(&mut self) -> crate::Result<()> {
        if self.is_last_chunk {
            self.at_end = true;
            return Ok(());
        }

        if !self.cursor.next()? {
            self.at_end = true;
            return Err(Error::Corrupt("posting list ends before its last chunk"));
        }

        let (term, key_did) = parse_key(self.cursor.current_key())?;
        if term.as_slice() != self.term.as_ref() {
            self.at_end = true;
            return Err(Error::Corrupt("posting list ends before its last chunk"));
        }

        let new_did = key_did.ok_or(Error::Corrupt("posting chunk key lost its docid"))?;
        if new_did <= self.did {
            return Err(Error::Corrupt(
                "posting chunk docids are not strictly increasing",
            ));
        }

        self.load_chunk(Some(new_did))
    }

    /// Advances to the next posting.
    ///
    /// The iterator starts *before* the first posting, so the first call
    /// moves onto it.
    pub fn next(&mut self) -> crate::Result<()> {
        if !self.started {
            self.started = true;
            return Ok(());
        }
        if self.at_end {
            return Ok(());
        }

        if !self.next_in_chunk()? {
            self.next_chunk()?;
        }
        Ok(())
    }

    fn current_chunk_contains(&self, did: DocId) -> bool {
        (self.first_did_in_chunk..=self.last_did_in_chunk).contains(&did)
    }

    /// Re-seeks through the table to the chunk that could contain `did`.
    fn move_to_chunk_containing(&mut self, did: DocId) -> crate::Result<()> {
        self.cursor.find_entry(&chunk_key(&self.term, did))?;

        let in_this_term = self.cursor.is_positioned()
            && parse_key(self.cursor.current_key())
                .map(|(t, _)| t.as_slice() == self.term.as_ref())
                .unwrap_or(false);

        if !in_this_term {
            // Only possible if the posting list does not exist at all
            self.at_end = true;
            self.is_last_chunk = true;
            return Ok(());
        }

        let (_, key_did) = parse_key(self.cursor.current_key())?;
        self.at_end = false;
        self.load_chunk(key_did)
    }

    fn move_forward_in_chunk_to_at_least(&mut self, did: DocId) -> crate::Result<bool> {
        if did > self.last_did_in_chunk {
            self.chunk_pos = self.chunk.len();
            return Ok(false);
        }

        while self.did < did {
            if !self.next_in_chunk()? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Positions on the smallest docid ≥ `did`, or at the end.
    ///
    /// Within the current chunk this scans forward; otherwise it re-seeks
    /// via the table.
    pub fn skip_to(&mut self, did: DocId) -> crate::Result<()> {
        // Before the first next() the iterator already sits on the first
        // posting, so starting is all that may be needed
        self.started = true;

        if self.at_end || did <= self.did {
            return Ok(());
        }

        if !self.current_chunk_contains(did) {
            self.move_to_chunk_containing(did)?;

            // The target may fall into the gap between two chunks
            if !self.at_end && !self.current_chunk_contains(did) {
                self.next_chunk()?;
            }
        }

        if !self.at_end {
            let _ = self.move_forward_in_chunk_to_at_least(did)?;
        }

        Ok(())
    }
}
