// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Posting-list chunk encoding.
//!
//! A posting list is split into chunks, each one table entry. The first
//! chunk's tag opens with `(termfreq, collfreq, first_docid − 1)`; every
//! chunk then carries `(is_last, last_docid − first_docid − 1)` followed by
//! `(wdf, doclen)` for the first posting and `(docid_gap − 1, wdf, doclen)`
//! for the rest.
//!
//! The `− 1` in the chunk header wraps around for single-entry chunks (and
//! for the empty head chunk a fresh term briefly has); readers undo it with
//! a wrapping add, so the value round-trips. This matches the on-disk
//! format this engine inherits and must not be "fixed".

use super::PostlistTable;
use crate::pack::{pack_bool, pack_uint32, Unpacker};
use crate::{DocId, Error, Slice};

/// Chunks are sealed once they grow past this size.
pub(crate) const CHUNK_SIZE_TARGET: usize = 2_048;

pub(crate) fn read_first_chunk_header(
    unpacker: &mut Unpacker<'_>,
) -> crate::Result<(u32, u32, DocId)> {
    let termfreq = unpacker.uint32().map_err(|e| {
        e.into_error("posting list truncated", "posting list termfreq too large")
    })?;
    let collfreq = unpacker.uint32().map_err(|e| {
        e.into_error("posting list truncated", "posting list collfreq too large")
    })?;
    let first_did = unpacker
        .uint32()
        .map_err(|e| e.into_error("posting list truncated", "docid in posting list too large"))?
        .wrapping_add(1);

    Ok((termfreq, collfreq, first_did))
}

pub(crate) fn make_first_chunk_header(
    out: &mut Vec<u8>,
    termfreq: u32,
    collfreq: u32,
    first_did: DocId,
) {
    pack_uint32(out, termfreq);
    pack_uint32(out, collfreq);
    pack_uint32(out, first_did.wrapping_sub(1));
}

pub(crate) fn read_chunk_header(
    unpacker: &mut Unpacker<'_>,
    first_did: DocId,
) -> crate::Result<(bool, DocId)> {
    let is_last = unpacker
        .boolean()
        .map_err(|_| Error::Corrupt("posting chunk header truncated"))?;
    let increase_to_last = unpacker.uint32().map_err(|e| {
        e.into_error("posting chunk header truncated", "docid span too large")
    })?;

    let last_did = first_did.wrapping_add(increase_to_last.wrapping_add(1));
    Ok((is_last, last_did))
}

pub(crate) fn make_chunk_header(
    out: &mut Vec<u8>,
    is_last: bool,
    first_did: DocId,
    last_did: DocId,
) {
    debug_assert!(last_did >= first_did);
    pack_bool(out, is_last);
    pack_uint32(out, (last_did - first_did).wrapping_sub(1));
}

pub(crate) fn read_wdf_and_length(unpacker: &mut Unpacker<'_>) -> crate::Result<(u32, u32)> {
    let wdf = unpacker
        .uint32()
        .map_err(|e| e.into_error("posting list truncated", "wdf in posting list too large"))?;
    let doclen = unpacker.uint32().map_err(|e| {
        e.into_error("posting list truncated", "doclen in posting list too large")
    })?;
    Ok((wdf, doclen))
}

pub(crate) fn make_wdf_and_length(out: &mut Vec<u8>, wdf: u32, doclen: u32) {
    pack_uint32(out, wdf);
    pack_uint32(out, doclen);
}

pub(crate) fn read_did_increase(
    unpacker: &mut Unpacker<'_>,
    did: &mut DocId,
) -> crate::Result<()> {
    let increase = unpacker.uint32().map_err(|e| {
        e.into_error("posting list truncated", "docid in posting list too large")
    })?;

    *did = did
        .checked_add(increase)
        .and_then(|d| d.checked_add(1))
        .ok_or(Error::Range("docid out of representable range"))?;

    Ok(())
}

/// Iterates the postings of one chunk (header already consumed).
pub(crate) struct ChunkReader {
    data: Slice,
    pos: usize,
    at_end: bool,
    did: DocId,
    wdf: u32,
    doclen: u32,
}

impl ChunkReader {
    /// `data` is the chunk body with all headers stripped.
    pub fn new(first_did: DocId, data: Slice) -> crate::Result<Self> {
        let mut reader = Self {
            data,
            pos: 0,
            at_end: false,
            did: first_did,
            wdf: 0,
            doclen: 0,
        };

        if reader.data.is_empty() {
            reader.at_end = true;
        } else {
            let mut unpacker = Unpacker::new(&reader.data);
            let (wdf, doclen) = read_wdf_and_length(&mut unpacker)?;
            reader.wdf = wdf;
            reader.doclen = doclen;
            reader.pos = unpacker.position();
        }

        Ok(reader)
    }

    pub fn at_end(&self) -> bool {
        self.at_end
    }

    pub fn docid(&self) -> DocId {
        self.did
    }

    pub fn wdf(&self) -> u32 {
        self.wdf
    }

    pub fn doc_length(&self) -> u32 {
        self.doclen
    }

    pub fn next(&mut self) -> crate::Result<()> {
        if self.pos >= self.data.len() {
            self.at_end = true;
            return Ok(());
        }

        let mut unpacker = Unpacker::new(self.data.get(self.pos..).unwrap_or_default());
        read_did_increase(&mut unpacker, &mut self.did)?;
        let (wdf, doclen) = read_wdf_and_length(&mut unpacker)?;
        self.wdf = wdf;
        self.doclen = doclen;
        self.pos += unpacker.position();

        Ok(())
    }
}

/// Accumulates postings and writes them back out as correctly keyed and
/// headed chunks, sealing a new chunk whenever the current one passes the
/// size target.
pub(crate) struct ChunkWriter {
    orig_key: Slice,
    term: Slice,
    is_first_chunk: bool,
    is_last_chunk: bool,
    started: bool,
    first_did: DocId,
    current_did: DocId,
    chunk: Vec<u8>,
}

impl ChunkWriter {
    pub fn new(orig_key: Slice, is_first_chunk: bool, term: Slice, is_last_chunk: bool) -> Self {
        Self {
            orig_key,
            term,
            is_first_chunk,
            is_last_chunk,
            started: false,
            first_did: 0,
            current_did: 0,
            chunk: Vec::new(),
        }
    }

    /// Adopts the raw body of an existing chunk wholesale (append path).
    pub fn raw_append(&mut self, first_did: DocId, current_did: DocId, body: &[u8]) {
        debug_assert!(!self.started);
        self.first_did = first_did;
        self.current_did = current_did;
        if !body.is_empty() {
            self.chunk.extend_from_slice(body);
            self.started = true;
        }
    }

    /// Appends one posting.
    pub fn append(
        &mut self,
        table: &PostlistTable,
        did: DocId,
        wdf: u32,
        doclen: u32,
    ) -> crate::Result<()> {
        if !self.started {
            self.started = true;
            self.first_did = did;
        } else {
            debug_assert!(did > self.current_did);

            if self.chunk.len() >= CHUNK_SIZE_TARGET {
                // Seal this chunk and open a fresh one keyed by `did`
                let saved_is_last = self.is_last_chunk;
                self.is_last_chunk = false;
                self.flush(table)?;
                self.is_last_chunk = saved_is_last;
                self.is_first_chunk = false;
                self.first_did = did;
                self.chunk.clear();
                self.orig_key = super::chunk_key(&self.term, did).into();
            } else {
                pack_uint32(&mut self.chunk, did - self.current_did - 1);
            }
        }

        self.current_did = did;
        make_wdf_and_length(&mut self.chunk, wdf, doclen);
        Ok(())
    }

    /// Writes the chunk out, handling deletions, rekeying, and repairs of
    /// the neighbouring chunks' headers.
    pub fn flush(&mut self, table: &PostlistTable) -> crate::Result<()> {
        if !self.started {
            return self.flush_empty(table);
        }

        if self.is_first_chunk {
            // Re-read the (already updated) frequencies, then rebuild the
            // whole first chunk around them.
            let key = super::term_key(&self.term);
            let tag = table
                .store
                .get_exact_entry(&key)?
                .ok_or(Error::Corrupt("first posting chunk disappeared"))?;

            let mut unpacker = Unpacker::new(&tag);
            let (termfreq, collfreq, _) = read_first_chunk_header(&mut unpacker)?;

            let mut new_tag = Vec::new();
            make_first_chunk_header(&mut new_tag, termfreq, collfreq, self.first_did);
            make_chunk_header(
                &mut new_tag,
                self.is_last_chunk,
                self.first_did,
                self.current_did,
            );
            new_tag.extend_from_slice(&self.chunk);

            return table.store.set_entry(key.into(), Some(new_tag.into()));
        }

        // A non-first chunk: if its first entry changed, the key changes too
        let (_, initial_did) = super::parse_key(&self.orig_key)?;
        let initial_did =
            initial_did.ok_or(Error::Corrupt("posting chunk key lost its docid"))?;

        let new_key: Slice = if initial_did == self.first_did {
            self.orig_key.clone()
        } else {
            table.store.set_entry(self.orig_key.clone(), None)?;
            super::chunk_key(&self.term, self.first_did).into()
        };

        let mut new_tag = Vec::new();
        make_chunk_header(
            &mut new_tag,
            self.is_last_chunk,
            self.first_did,
            self.current_did,
        );
        new_tag.extend_from_slice(&self.chunk);

        table.store.set_entry(new_key, Some(new_tag.into()))
    }

    /// The chunk came out empty, so its entry disappears; neighbours may
    /// need their headers fixed up.
    fn flush_empty(&mut self, table: &PostlistTable) -> crate::Result<()> {
        if self.orig_key.is_empty() {
            // The posting list never existed and nothing was added
            return Ok(());
        }

        if self.is_first_chunk {
            if self.is_last_chunk {
                // Only chunk of the term: the whole list disappears
                return table.store.set_entry(self.orig_key.clone(), None);
            }
            return self.promote_next_chunk(table);
        }

        table.store.set_entry(self.orig_key.clone(), None)?;

        if self.is_last_chunk {
            self.mark_predecessor_last(table)?;
        }

        Ok(())
    }

    /// The first chunk disappears but successors exist: the next chunk is
    /// rewritten as the first chunk, preserving the term's frequencies.
    fn promote_next_chunk(&self, table: &PostlistTable) -> crate::Result<()> {
        let (next_key, new_tag) = {
            let mut cursor = table.store.cursor();
            if !cursor.find_entry(&self.orig_key)? {
                return Err(Error::Corrupt("first posting chunk disappeared"));
            }

            let tag = cursor.read_tag()?;
            let mut unpacker = Unpacker::new(&tag);
            let (termfreq, collfreq, _) = read_first_chunk_header(&mut unpacker)?;

            if !cursor.next()? {
                return Err(Error::Corrupt("posting list ends before its last chunk"));
            }

            let next_key: Slice = cursor.current_key().into();
            let (next_term, next_did) = super::parse_key(&next_key)?;
            if next_term.as_slice() != self.term.as_ref() {
                return Err(Error::Corrupt("posting list ends before its last chunk"));
            }
            let new_first_did =
                next_did.ok_or(Error::Corrupt("posting chunk key lost its docid"))?;

            let next_tag = cursor.read_tag()?;
            let mut unpacker = Unpacker::new(&next_tag);
            let (is_last, last_did) = read_chunk_header(&mut unpacker, new_first_did)?;
            let body = next_tag.slice(unpacker.position()..);

            let mut new_tag = Vec::new();
            make_first_chunk_header(&mut new_tag, termfreq, collfreq, new_first_did);
            make_chunk_header(&mut new_tag, is_last, new_first_did, last_did);
            new_tag.extend_from_slice(&body);

            (next_key, new_tag)
        };

        table.store.set_entry(next_key, None)?;
        table
            .store
            .set_entry(self.orig_key.clone(), Some(new_tag.into()))
    }

    /// The last chunk disappeared; its predecessor becomes the last chunk.
    fn mark_predecessor_last(&self, table: &PostlistTable) -> crate::Result<()> {
        let (prev_key, new_tag) = {
            // Created after the deletion above, so this cursor must not
            // find the deleted key, only its predecessor
            let mut cursor = table.store.cursor();
            if cursor.find_entry(&self.orig_key)? {
                return Err(Error::Corrupt("posting chunk survived its deletion"));
            }

            let prev_key: Slice = cursor.current_key().into();
            let (prev_term, prev_did) = super::parse_key(&prev_key)?;
            if prev_term.as_slice() != self.term.as_ref() {
                return Err(Error::Corrupt("no chunk before the deleted last chunk"));
            }

            let tag = cursor.read_tag()?;
            let mut unpacker = Unpacker::new(&tag);

            let first_did = match prev_did {
                // The predecessor is the first chunk
                None => read_first_chunk_header(&mut unpacker)?.2,
                Some(did) => did,
            };

            let header_start = unpacker.position();
            let (_, last_did) = read_chunk_header(&mut unpacker, first_did)?;
            let header_end = unpacker.position();

            let mut new_tag = Vec::with_capacity(tag.len());
            new_tag.extend_from_slice(&tag.slice(..header_start));
            make_chunk_header(&mut new_tag, true, first_did, last_did);
            new_tag.extend_from_slice(&tag.slice(header_end..));

            (prev_key, new_tag)
        };

        table.store.set_entry(prev_key, Some(new_tag.into()))
    }
}
