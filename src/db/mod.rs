// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The database orchestrator.
//!
//! Five tables make up a database. The record table is committed last, so
//! its revision defines the database's committed state: every other table
//! must be openable at that revision. Read-only opening retries through the
//! window where a writer commits; writable opening detects a partially
//! applied revision and forces all tables back onto a common number.

pub mod lock;
pub mod writer;

use crate::pack::Unpacker;
use crate::positionlist::{PositionIterator, PositionTable};
use crate::postlist::allterms::AllTermsIterator;
use crate::postlist::iter::PostingIterator;
use crate::postlist::PostlistTable;
use crate::record::RecordTable;
use crate::table::cursor::TableCursor;
use crate::table::Table;
use crate::termlist::{AllDocsIterator, TermlistIterator, TermlistTable};
use crate::values::{ValueStats, ValueTable};
use crate::{DocId, Error, Revision, Slice, Slot};
use std::path::{Path, PathBuf};

pub(crate) const TABLE_POSTLIST: &str = "postlist";
pub(crate) const TABLE_POSITION: &str = "position";
pub(crate) const TABLE_TERMLIST: &str = "termlist";
pub(crate) const TABLE_VALUE: &str = "value";
pub(crate) const TABLE_RECORD: &str = "record";

const CONSISTENT_OPEN_TRIES: u32 = 100;

const METADATA_PREFIX: [u8; 2] = [0, b'M'];

pub(crate) fn metadata_key(key: &[u8]) -> Vec<u8> {
    let mut full = METADATA_PREFIX.to_vec();
    full.extend_from_slice(key);
    full
}

/// A database handle observing one committed revision.
///
/// Many read-only handles may coexist; each keeps seeing its snapshot until
/// it is reopened. Operations fail with [`Error::Modified`] once a writer
/// has overwritten the snapshot's blocks.
pub struct Database {
    pub(crate) dir: PathBuf,
    pub(crate) postlist: PostlistTable,
    pub(crate) position: PositionTable,
    pub(crate) termlist: TermlistTable,
    pub(crate) value: ValueTable,
    pub(crate) record: RecordTable,
}

impl Database {
    /// Opens the database read-only at its newest consistent revision.
    pub fn open<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        Self::open_consistent(path.as_ref(), false)
    }

    pub(crate) fn exists(dir: &Path) -> bool {
        [
            TABLE_POSTLIST,
            TABLE_POSITION,
            TABLE_TERMLIST,
            TABLE_VALUE,
            TABLE_RECORD,
        ]
        .iter()
        .all(|name| Table::exists(dir, name))
    }

    pub(crate) fn create(dir: &Path, block_size: u32) -> crate::Result<()> {
        // The record table comes last: its existence implies the database's
        for name in [
            TABLE_POSTLIST,
            TABLE_POSITION,
            TABLE_TERMLIST,
            TABLE_VALUE,
            TABLE_RECORD,
        ] {
            Table::create(dir, name, block_size)?;
        }
        Ok(())
    }

    /// Opens the record table, then everything else at its revision,
    /// retrying while a writer races past us.
    pub(crate) fn open_consistent(dir: &Path, writable: bool) -> crate::Result<Self> {
        if !Self::exists(dir) {
            return Err(Error::Opening(format!(
                "cannot open database at {dir:?}: it does not exist",
            )));
        }

        let mut record = Table::open(dir, TABLE_RECORD, writable, None)?;
        let mut revision = record.open_revision();

        for _ in 0..CONSISTENT_OPEN_TRIES {
            log::debug!("trying to open tables at revision {revision}");

            match Self::open_non_record_tables(dir, writable, revision) {
                Ok((postlist, position, termlist, value)) => {
                    log::debug!("opened tables at revision {revision}");

                    return Ok(Self {
                        dir: dir.into(),
                        postlist: PostlistTable::new(postlist),
                        position: PositionTable::new(position),
                        termlist: TermlistTable::new(termlist),
                        value: ValueTable::new(value),
                        record: RecordTable::new(record),
                    });
                }
                Err(Error::RevisionNotFound(_)) => {
                    // Either a writer moved on (record will show a newer
                    // revision), or no consistent state exists at all
                    record = Table::open(dir, TABLE_RECORD, writable, None)?;
                    let newer = record.open_revision();

                    if newer == revision {
                        return Err(Error::Corrupt(
                            "cannot open tables at consistent revisions",
                        ));
                    }
                    revision = newer;
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::Modified(
            "cannot open tables at a stable revision - changing too fast",
        ))
    }

    fn open_non_record_tables(
        dir: &Path,
        writable: bool,
        revision: Revision,
    ) -> crate::Result<(Table, Table, Table, Table)> {
        let value = Table::open(dir, TABLE_VALUE, writable, Some(revision))?;
        let termlist = Table::open(dir, TABLE_TERMLIST, writable, Some(revision))?;
        let position = Table::open(dir, TABLE_POSITION, writable, Some(revision))?;
        let postlist = Table::open(dir, TABLE_POSTLIST, writable, Some(revision))?;
        Ok((postlist, position, termlist, value))
    }

    /// Opens every table at exactly `revision`.
    pub(crate) fn open_at(
        dir: &Path,
        writable: bool,
        revision: Revision,
    ) -> crate::Result<Self> {
        let record = Table::open(dir, TABLE_RECORD, writable, Some(revision))?;
        let (postlist, position, termlist, value) =
            Self::open_non_record_tables(dir, writable, revision)?;

        Ok(Self {
            dir: dir.into(),
            postlist: PostlistTable::new(postlist),
            position: PositionTable::new(position),
            termlist: TermlistTable::new(termlist),
            value: ValueTable::new(value),
            record: RecordTable::new(record),
        })
    }

    /// Re-opens this handle at the newest consistent revision.
    pub fn reopen(&mut self) -> crate::Result<()> {
        *self = Self::open_consistent(&self.dir, false)?;
        Ok(())
    }

    /// Revision this handle observes.
    #[must_use]
    pub fn revision(&self) -> Revision {
        self.postlist.store.open_revision()
    }

    /// Commits every table (with whatever it has buffered, usually
    /// nothing) at `revision`, postlist first and record last.
    pub(crate) fn force_revision(&mut self, revision: Revision) -> crate::Result<()> {
        self.postlist.store.apply(revision)?;
        self.position.store.apply(revision)?;
        self.termlist.store.apply(revision)?;
        self.value.store.apply(revision)?;
        self.record.store.apply(revision)?;
        Ok(())
    }

    /// Discards all buffered changes of every table.
    pub(crate) fn cancel_all(&mut self) {
        self.postlist.store.cancel();
        self.position.store.cancel();
        self.termlist.store.cancel();
        self.value.store.cancel();
        self.record.store.cancel();
    }

    pub(crate) fn any_modified(&self) -> bool {
        self.postlist.store.is_modified()
            || self.position.store.is_modified()
            || self.termlist.store.is_modified()
            || self.value.store.is_modified()
            || self.record.store.is_modified()
    }

    /// Number of documents.
    #[must_use]
    pub fn doc_count(&self) -> u64 {
        self.record.doc_count()
    }

    /// Highest document id ever allocated.
    pub fn last_docid(&self) -> crate::Result<DocId> {
        self.record.last_docid()
    }

    /// Sum of all document lengths.
    pub fn total_length(&self) -> crate::Result<u64> {
        self.record.total_length()
    }

    /// Average document length (0 for an empty database).
    #[allow(clippy::cast_precision_loss)]
    pub fn avg_length(&self) -> crate::Result<f64> {
        let docs = self.doc_count();
        if docs == 0 {
            return Ok(0.0);
        }

        Ok(self.total_length()? as f64 / docs as f64)
    }

    /// Length of one document.
    pub fn doc_length(&self, did: DocId) -> crate::Result<u32> {
        self.termlist.doc_length(did)
    }

    /// Number of distinct terms in one document.
    pub fn unique_terms(&self, did: DocId) -> crate::Result<u32> {
        Ok(self.termlist.open(did)?.size())
    }

    /// Number of documents containing `term`.
    pub fn term_freq(&self, term: &[u8]) -> crate::Result<u32> {
        Ok(self
            .postlist
            .term_info(term)?
            .map(|(tf, _)| tf)
            .unwrap_or_default())
    }

    /// Total occurrences of `term` across the collection.
    pub fn collection_freq(&self, term: &[u8]) -> crate::Result<u32> {
        Ok(self
            .postlist
            .term_info(term)?
            .map(|(_, cf)| cf)
            .unwrap_or_default())
    }

    /// Whether any document contains `term`.
    pub fn term_exists(&self, term: &[u8]) -> crate::Result<bool> {
        if term.is_empty() {
            return Err(Error::InvalidArgument("term must not be empty"));
        }
        self.postlist.term_exists(term)
    }

    /// Whether any positional information is stored.
    #[must_use]
    pub fn has_positions(&self) -> bool {
        self.position.store.entry_count() > 0
    }

    /// Fetches a document's data.
    pub fn get_document(&self, did: DocId) -> crate::Result<Slice> {
        self.record.get(did)
    }

    /// Fetches one value of a document.
    pub fn get_value(&self, did: DocId, slot: Slot) -> crate::Result<Option<Slice>> {
        self.value.get_value(did, slot)
    }

    /// Fetches all values of a document.
    pub fn get_all_values(&self, did: DocId) -> crate::Result<Vec<(Slot, Slice)>> {
        self.value.get_all_values(did)
    }

    /// Statistics of a value slot.
    pub fn value_stats(&self, slot: Slot) -> crate::Result<ValueStats> {
        self.value.stats(slot)
    }

    /// Opens the posting list of a term.
    pub fn postings(&self, term: &[u8]) -> crate::Result<PostingIterator<'_>> {
        if term.is_empty() {
            return Err(Error::InvalidArgument("term must not be empty"));
        }
        PostingIterator::new(&self.postlist, term)
    }

    /// Iterates every document with its length.
    pub fn all_docs(&self) -> crate::Result<AllDocsIterator<'_>> {
        AllDocsIterator::new(&self.termlist)
    }

    /// Iterates every term in the database.
    pub fn all_terms(&self) -> crate::Result<AllTermsIterator<'_>> {
        AllTermsIterator::new(&self.postlist, b"")
    }

    /// Iterates every term starting with `prefix`.
    pub fn all_terms_with_prefix(&self, prefix: &[u8]) -> crate::Result<AllTermsIterator<'_>> {
        AllTermsIterator::new(&self.postlist, prefix)
    }

    /// Opens the term list of a document.
    pub fn term_list(&self, did: DocId) -> crate::Result<TermlistIterator> {
        self.termlist.open(did)
    }

    /// Opens the position list of `(did, term)`.
    ///
    /// An empty list for an existing document whose term list does not
    /// contain `term` is reported as a range error rather than silently
    /// yielding nothing.
    pub fn positions(&self, did: DocId, term: &[u8]) -> crate::Result<PositionIterator> {
        let list = self.position.positions(did, term)?;

        if list.count() == 0 {
            // Distinguish "no positions stored" from "term not in document"
            let mut termlist = self.termlist.open(did)?;
            termlist.skip_to(term)?;
            if termlist.at_end() || termlist.term() != term {
                return Err(Error::Range(
                    "cannot open position list: term is not present in document",
                ));
            }
        }

        Ok(list)
    }

    /// Reads a user metadata entry; absent keys read as the empty value.
    pub fn metadata(&self, key: &[u8]) -> crate::Result<Slice> {
        if key.is_empty() {
            return Err(Error::InvalidArgument("metadata key must not be empty"));
        }

        Ok(self
            .postlist
            .store
            .get_exact_entry(&metadata_key(key))?
            .unwrap_or_else(Slice::empty))
    }

    /// Iterates user metadata keys starting with `prefix`.
    pub fn metadata_keys(&self, prefix: &[u8]) -> crate::Result<MetadataIterator<'_>> {
        MetadataIterator::new(&self.postlist.store, prefix)
    }
}

/// Iterator over the user metadata keys, ascending.
pub struct MetadataIterator<'a> {
    cursor: TableCursor<'a>,
    prefix: Vec<u8>,
    current: Vec<u8>,
    at_end: bool,
    started: bool,
}

impl<'a> MetadataIterator<'a> {
    fn new(store: &'a Table, prefix: &[u8]) -> crate::Result<Self> {
        let mut cursor = store.cursor();
        cursor.find_entry(&metadata_key(prefix))?;

        Ok(Self {
            cursor,
            prefix: prefix.to_vec(),
            current: Vec::new(),
            at_end: false,
            started: false,
        })
    }

    /// Whether iteration has run past the last key.
    #[must_use]
    pub fn at_end(&self) -> bool {
        self.at_end
    }

    /// The current metadata key (without the reserved prefix).
    #[must_use]
    pub fn key(&self) -> &[u8] {
        &self.current
    }

    /// Advances to the next metadata key.
    pub fn next(&mut self) -> crate::Result<()> {
        if self.at_end {
            return Ok(());
        }

        // The seek in the constructor lands just before the first match,
        // except when the prefix itself is a stored key
        if !self.started {
            self.started = true;
            if self.cursor.is_positioned()
                && self.cursor.current_key() == metadata_key(&self.prefix).as_slice()
            {
                self.current.clone_from(&self.prefix);
                return Ok(());
            }
        }

        if !self.cursor.next()? {
            self.at_end = true;
            return Ok(());
        }

        let key = self.cursor.current_key();
        let mut unpacker = Unpacker::new(key);
        let matches = unpacker.bytes(METADATA_PREFIX.len()) == Ok(&METADATA_PREFIX[..]);

        if !matches {
            self.at_end = true;
            return Ok(());
        }

        let user_key = key.get(METADATA_PREFIX.len()..).unwrap_or_default();
        if !user_key.starts_with(&self.prefix) {
            self.at_end = true;
            return Ok(());
        }

        self.current = user_key.to_vec();
        Ok(())
    }
}
