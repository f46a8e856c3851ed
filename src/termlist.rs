// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Per-document term lists.
//!
//! The tag layout is `doclen, n_terms, has_termfreqs, entries…` where each
//! entry is prefix-compressed against the previous term. A small wdf is
//! squeezed into the reuse byte as `(wdf + 1) * (prev_len + 1) + reuse`.

use crate::pack::{docid_key, pack_bool, pack_uint32, Unpacker};
use crate::table::cursor::TableCursor;
use crate::table::Table;
use crate::{DocId, Error, Slice};

/// Longest allowed term, in bytes.
pub const MAX_TERM_LENGTH: usize = 245;

/// Per-document sorted term lists with wdf and document length.
pub struct TermlistTable {
    pub(crate) store: Table,
}

impl TermlistTable {
    pub(crate) fn new(store: Table) -> Self {
        Self { store }
    }

    /// Writes the full term list of a document.
    ///
    /// Terms must arrive non-empty, at most [`MAX_TERM_LENGTH`] bytes, and
    /// in strictly ascending order. `store_termfreqs` is reserved on disk
    /// but rejected until it has semantics.
    pub fn set_entries<'t>(
        &self,
        did: DocId,
        entries: impl IntoIterator<Item = (&'t [u8], u32)>,
        doclen: u32,
        store_termfreqs: bool,
    ) -> crate::Result<()> {
        if store_termfreqs {
            return Err(Error::Unimplemented(
                "per-termlist term frequencies are reserved but not supported",
            ));
        }

        let mut body = Vec::new();
        let mut prev_term: Vec<u8> = Vec::new();
        let mut size = 0u32;

        for (term, wdf) in entries {
            if term.is_empty() || term.len() > MAX_TERM_LENGTH {
                return Err(Error::InvalidArgument("term length out of range"));
            }
            if !prev_term.is_empty() && term <= &prev_term[..] {
                return Err(Error::InvalidArgument(
                    "terms must be written in strictly ascending order",
                ));
            }

            let mut stored_wdf = false;
            if prev_term.is_empty() {
                #[allow(clippy::cast_possible_truncation)]
                body.push(term.len() as u8);
                body.extend_from_slice(term);
            } else {
                let reuse = prev_term
                    .iter()
                    .zip(term.iter())
                    .take_while(|(a, b)| a == b)
                    .count();

                // See if the wdf fits into the spare space of the reuse byte
                let squeezed =
                    (u64::from(wdf) + 1) * (prev_term.len() as u64 + 1) + reuse as u64;
                if squeezed < 256 {
                    #[allow(clippy::cast_possible_truncation)]
                    body.push(squeezed as u8);
                    stored_wdf = true;
                } else {
                    #[allow(clippy::cast_possible_truncation)]
                    body.push(reuse as u8);
                }

                #[allow(clippy::cast_possible_truncation)]
                body.push((term.len() - reuse) as u8);
                body.extend_from_slice(term.get(reuse..).unwrap_or_default());
            }

            if !stored_wdf {
                pack_uint32(&mut body, wdf);
            }

            prev_term.clear();
            prev_term.extend_from_slice(term);
            size += 1;
        }

        let mut tag = Vec::new();
        pack_uint32(&mut tag, doclen);
        pack_uint32(&mut tag, size);
        pack_bool(&mut tag, store_termfreqs);
        tag.extend_from_slice(&body);

        self.store.set_entry(docid_key(did)?.into(), Some(tag.into()))
    }

    /// Removes a document's term list.
    pub fn delete(&self, did: DocId) -> crate::Result<()> {
        self.store.set_entry(docid_key(did)?.into(), None)
    }

    /// Reads the document length without iterating the terms.
    pub fn doc_length(&self, did: DocId) -> crate::Result<u32> {
        Ok(self.open(did)?.doc_length())
    }

    /// Opens the term list of a document.
    pub fn open(&self, did: DocId) -> crate::Result<TermlistIterator> {
        let tag = self
            .store
            .get_exact_entry(&docid_key(did)?)?
            .ok_or(Error::DocNotFound(did))?;

        let mut unpacker = Unpacker::new(&tag);

        let doclen = unpacker.uint32().map_err(|e| {
            e.into_error("termlist truncated reading doclen", "doclen out of range")
        })?;
        let size = unpacker.uint32().map_err(|e| {
            e.into_error("termlist truncated reading size", "termlist size out of range")
        })?;
        let has_termfreqs = unpacker
            .boolean()
            .map_err(|_| Error::Corrupt("termlist truncated reading flags"))?;

        let start = unpacker.position();
        Ok(TermlistIterator {
            data: tag.slice(start..),
            pos: 0,
            doclen,
            size,
            has_termfreqs,
            current_term: Vec::new(),
            current_wdf: 0,
            current_termfreq: 0,
            at_end: false,
        })
    }
}

/// Iterator over one document's terms in ascending order.
pub struct TermlistIterator {
    data: Slice,
    pos: usize,
    doclen: u32,
    size: u32,
    has_termfreqs: bool,
    current_term: Vec<u8>,
    current_wdf: u32,
    current_termfreq: u32,
    at_end: bool,
}

impl TermlistIterator {
    /// Length of the document (sum of all wdfs).
    #[must_use]
    pub fn doc_length(&self) -> u32 {
        self.doclen
    }

    /// Number of distinct terms.
    #[must_use]
    pub fn size(&self) -> u32 {
        self.size
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

    /// Within-document frequency of the current term.
    #[must_use]
    pub fn wdf(&self) -> u32 {
        self.current_wdf
    }

    /// Stored term frequency of the current term (0 unless the reserved
    /// `has_termfreqs` flag was set by the writer).
    #[must_use]
    pub fn termfreq(&self) -> u32 {
        self.current_termfreq
    }

    fn take_byte(&mut self) -> crate::Result<u8> {
        let byte = self
            .data
            .get(self.pos)
            .copied()
            .ok_or(Error::Corrupt("termlist entry truncated"))?;
        self.pos += 1;
        Ok(byte)
    }

    /// Advances to the next term; returns `false` at the end.
    pub fn next(&mut self) -> crate::Result<bool> {
        if self.pos >= self.data.len() {
            self.at_end = true;
            return Ok(false);
        }

        let mut got_wdf = false;

        // Entries after the first reuse a prefix of the previous term
        if !self.current_term.is_empty() {
            let mut reuse = self.take_byte()? as usize;
            if reuse > self.current_term.len() {
                // The wdf was squeezed into the same byte
                #[allow(clippy::cast_possible_truncation)]
                {
                    self.current_wdf = (reuse / (self.current_term.len() + 1) - 1) as u32;
                }
                reuse %= self.current_term.len() + 1;
                got_wdf = true;
            }
            self.current_term.truncate(reuse);
        }

        let append = self.take_byte()? as usize;
        let suffix = self
            .data
            .get(self.pos..self.pos + append)
            .ok_or(Error::Corrupt("termlist entry truncated"))?;
        self.current_term.extend_from_slice(suffix);
        self.pos += append;

        if !got_wdf {
            let mut unpacker = Unpacker::new(self.data.get(self.pos..).unwrap_or_default());
            self.current_wdf = unpacker.uint32().map_err(|e| {
                e.into_error("termlist truncated reading wdf", "wdf out of range in termlist")
            })?;
            self.pos += unpacker.position();
        }

        if self.has_termfreqs {
            let mut unpacker = Unpacker::new(self.data.get(self.pos..).unwrap_or_default());
            self.current_termfreq = unpacker.uint32().map_err(|e| {
                e.into_error(
                    "termlist truncated reading termfreq",
                    "termfreq out of range in termlist",
                )
            })?;
            self.pos += unpacker.position();
        } else {
            self.current_termfreq = 0;
        }

        Ok(true)
    }

    /// Scans forward until the current term is at least `term`.
    pub fn skip_to(&mut self, term: &[u8]) -> crate::Result<()> {
        if self.current_term.is_empty() && !self.at_end {
            self.next()?;
        }
        while !self.at_end && self.current_term.as_slice() < term {
            self.next()?;
        }
        Ok(())
    }
}

/// Iterator over every document in the database, ascending by docid, with
/// document lengths; backed by the termlist table's keys.
pub struct AllDocsIterator<'a> {
    cursor: TableCursor<'a>,
    doc_count: u64,
    current_did: DocId,
    current_doclen: u32,
    at_end: bool,
    started: bool,
}

impl<'a> AllDocsIterator<'a> {
    pub(crate) fn new(table: &'a TermlistTable) -> crate::Result<Self> {
        let mut cursor = table.store.cursor();
        cursor.find_entry(b"")?;

        Ok(Self {
            cursor,
            doc_count: table.store.entry_count(),
            current_did: 0,
            current_doclen: 0,
            at_end: false,
            started: false,
        })
    }

    fn load_current(&mut self) -> crate::Result<()> {
        let key = self.cursor.current_key();
        let mut unpacker = Unpacker::new(key);
        self.current_did = unpacker
            .uint_preserving_sort32()
            .map_err(|_| Error::Corrupt("termlist table key is not a docid"))?;

        let tag = self.cursor.read_tag()?;
        let mut unpacker = Unpacker::new(&tag);
        self.current_doclen = unpacker.uint32().map_err(|e| {
            e.into_error("termlist truncated reading doclen", "doclen out of range")
        })?;

        Ok(())
    }

    /// Number of documents.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.doc_count
    }

    /// Whether iteration has run past the last document.
    #[must_use]
    pub fn at_end(&self) -> bool {
        self.at_end
    }

    /// Current document id.
    #[must_use]
    pub fn docid(&self) -> DocId {
        self.current_did
    }

    /// Current document's length.
    #[must_use]
    pub fn doc_length(&self) -> u32 {
        self.current_doclen
    }

    /// Advances to the next document.
    pub fn next(&mut self) -> crate::Result<()> {
        if self.at_end {
            return Ok(());
        }
        self.started = true;

        if self.cursor.next()? {
            self.load_current()
        } else {
            self.at_end = true;
            Ok(())
        }
    }

    /// Positional information is not meaningful on the all-documents list.
    pub fn positions(&self) -> crate::Result<crate::PositionIterator> {
        Err(Error::Unimplemented(
            "no positional information on the all-documents posting list",
        ))
    }

    /// Positions on the smallest docid ≥ `did`, or at the end.
    pub fn skip_to(&mut self, did: DocId) -> crate::Result<()> {
        if self.at_end || (self.started && self.current_did >= did) {
            return Ok(());
        }
        self.started = true;

        if did == 0 {
            return self.next();
        }

        if self.cursor.find_entry(&docid_key(did)?)? {
            self.load_current()
        } else if self.cursor.next()? {
            self.load_current()
        } else {
            self.at_end = true;
            Ok(())
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::btree::MIN_BLOCK_SIZE;
    use test_log::test;

    fn open_table(dir: &std::path::Path) -> crate::Result<TermlistTable> {
        Table::create(dir, "termlist", MIN_BLOCK_SIZE)?;
        Ok(TermlistTable::new(Table::open(dir, "termlist", true, None)?))
    }

    #[test]
    fn termlist_roundtrip() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let table = open_table(dir.path())?;

        let entries: [(&[u8], u32); 4] = [
            (b"apple", 2),
            (b"application", 1),
            (b"banana", 7),
            (b"bandana", 100_000),
        ];
        table.set_entries(1, entries, 100_010, false)?;

        let mut it = table.open(1)?;
        assert_eq!(100_010, it.doc_length());
        assert_eq!(4, it.size());

        let mut got = Vec::new();
        while it.next()? {
            got.push((it.term().to_vec(), it.wdf()));
        }

        assert_eq!(
            vec![
                (b"apple".to_vec(), 2),
                (b"application".to_vec(), 1),
                (b"banana".to_vec(), 7),
                (b"bandana".to_vec(), 100_000),
            ],
            got,
        );

        Ok(())
    }

    #[test]
    fn termlist_skip_to() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let table = open_table(dir.path())?;

        let entries: [(&[u8], u32); 3] = [(b"alpha", 1), (b"gamma", 2), (b"omega", 3)];
        table.set_entries(1, entries, 6, false)?;

        let mut it = table.open(1)?;
        it.skip_to(b"beta")?;
        assert_eq!(b"gamma", it.term());
        assert_eq!(2, it.wdf());

        it.skip_to(b"zzz")?;
        assert!(it.at_end());

        Ok(())
    }

    #[test]
    fn termlist_empty_document() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let table = open_table(dir.path())?;

        table.set_entries(1, std::iter::empty::<(&[u8], u32)>(), 0, false)?;

        let mut it = table.open(1)?;
        assert_eq!(0, it.doc_length());
        assert_eq!(0, it.size());
        assert!(!it.next()?);
        assert!(it.at_end());

        Ok(())
    }

    #[test]
    fn termlist_rejects_unsorted_terms() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let table = open_table(dir.path())?;

        let entries: [(&[u8], u32); 2] = [(b"b", 1), (b"a", 1)];
        assert!(matches!(
            table.set_entries(1, entries, 2, false),
            Err(Error::InvalidArgument(_)),
        ));

        let dupes: [(&[u8], u32); 2] = [(b"a", 1), (b"a", 1)];
        assert!(table.set_entries(1, dupes, 2, false).is_err());

        Ok(())
    }

    #[test]
    fn termlist_rejects_stored_termfreqs() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let table = open_table(dir.path())?;

        assert!(matches!(
            table.set_entries(1, std::iter::empty::<(&[u8], u32)>(), 0, true),
            Err(Error::Unimplemented(_)),
        ));

        Ok(())
    }

    #[test]
    fn all_docs_iteration() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let table = open_table(dir.path())?;

        for did in [3u32, 5, 9] {
            let entries: [(&[u8], u32); 1] = [(b"x", did)];
            table.set_entries(did, entries, did, false)?;
        }

        let mut it = AllDocsIterator::new(&table)?;
        assert_eq!(3, it.count());

        let mut got = Vec::new();
        loop {
            it.next()?;
            if it.at_end() {
                break;
            }
            got.push((it.docid(), it.doc_length()));
        }
        assert_eq!(vec![(3, 3), (5, 5), (9, 9)], got);

        let mut it = AllDocsIterator::new(&table)?;
        it.skip_to(4)?;
        assert_eq!(5, it.docid());
        it.skip_to(100)?;
        assert!(it.at_end());

        Ok(())
    }
}
