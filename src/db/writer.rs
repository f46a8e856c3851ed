// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The single writer of a database.
//!
//! Document operations accumulate in memory (posting modifications, new
//! document lengths, frequency deltas) and are merged into the tables on
//! commit, or earlier when the auto-flush threshold is reached. The commit
//! pipeline applies the postlist table first and the record table last; the
//! record table's revision is the durable commit point. A failure mid-apply
//! reopens everything at the old revision and forces all tables onto a
//! fresh common revision, so the database stays consistent.

use super::lock::WriteLock;
use super::{metadata_key, Database};
use crate::config::OpenMode;
use crate::document::Document;
use crate::positionlist::PositionIterator;
use crate::postlist::allterms::AllTermsIterator;
use crate::postlist::iter::PostingIterator;
use crate::postlist::{
    term_key, DocLengths, FreqDeltas, ModifiedPostlists, PostingChange,
};
use crate::termlist::{AllDocsIterator, TermlistIterator};
use crate::values::ValueStats;
use crate::{DocId, Error, Revision, Slice, Slot};
use std::path::Path;

// Chunk keys append an encoded docid to the term key, which must still fit
// a table key.
const MAX_ENCODED_TERM_KEY: usize = crate::btree::block::MAX_KEY_LEN - 5;

/// The writable database handle; at most one exists per database, enforced
/// by the `db_lock` file.
pub struct WritableDatabase {
    db: Database,
    _lock: WriteLock,

    flush_threshold: u32,

    total_length: u64,
    last_docid: DocId,

    mod_plists: ModifiedPostlists,
    doclens: DocLengths,
    freq_deltas: FreqDeltas,

    changes: u32,
    in_transaction: bool,
}

impl WritableDatabase {
    pub(crate) fn open(
        dir: &Path,
        mode: OpenMode,
        block_size: u32,
        flush_threshold: u32,
    ) -> crate::Result<Self> {
        let exists = Database::exists(dir);

        match mode {
            OpenMode::Open if !exists => {
                return Err(Error::Opening(format!(
                    "cannot open database at {dir:?}: it does not exist",
                )));
            }
            OpenMode::Create if exists => {
                return Err(Error::Create(format!(
                    "a database already exists at {dir:?}",
                )));
            }
            _ => {}
        }

        if mode != OpenMode::Open && !dir.is_dir() {
            std::fs::create_dir_all(dir).map_err(|e| {
                Error::Create(format!("cannot create directory {dir:?}: {e}"))
            })?;
        }

        let lock = WriteLock::acquire(dir)?;

        let create = !exists || mode == OpenMode::CreateOrOverwrite;
        let db = if create {
            log::debug!("creating database at {dir:?}");
            Database::create(dir, block_size)?;
            let db = Database::open_consistent(dir, true)?;
            db.record.set_total_length_and_last_docid(0, 0)?;
            db
        } else {
            let mut db = Database::open_consistent(dir, true)?;

            // A crash mid-commit leaves the record table behind the
            // postlist table; move everything onto a fresh revision
            let open_revision = db.record.store.open_revision();
            let latest = db.postlist.store.latest_revision();
            if open_revision != latest {
                let next = latest + 1;
                log::debug!(
                    "detected partially applied changes, updating all \
                     revision numbers to {next} to proceed",
                );
                db.force_revision(next)?;
            }

            if !db.record.has_meta()? {
                db.record.set_total_length_and_last_docid(0, 0)?;
            }

            db
        };

        let total_length = db.record.total_length()?;
        let last_docid = db.record.last_docid()?;

        Ok(Self {
            db,
            _lock: lock,
            flush_threshold: flush_threshold.max(1),
            total_length,
            last_docid,
            mod_plists: ModifiedPostlists::new(),
            doclens: DocLengths::new(),
            freq_deltas: FreqDeltas::new(),
            changes: 0,
            in_transaction: false,
        })
    }

    fn clear_buffers(&mut self) -> crate::Result<()> {
        self.mod_plists.clear();
        self.doclens.clear();
        self.freq_deltas.clear();
        self.changes = 0;
        self.total_length = self.db.record.total_length()?;
        self.last_docid = self.db.record.last_docid()?;
        Ok(())
    }

    /// Commits all changes durably. The new revision becomes visible to
    /// readers that (re)open afterwards.
    pub fn commit(&mut self) -> crate::Result<()> {
        if self.in_transaction {
            return Err(Error::InvalidArgument(
                "cannot commit during a transaction",
            ));
        }
        self.flush_changes()
    }

    /// Discards all uncommitted changes.
    pub fn cancel(&mut self) -> crate::Result<()> {
        self.db.cancel_all();
        self.clear_buffers()
    }

    fn flush_changes(&mut self) -> crate::Result<()> {
        if self.changes == 0 && !self.db.any_modified() {
            log::debug!("no modifications to apply");
            return Ok(());
        }

        self.db
            .postlist
            .merge_changes(&self.mod_plists, &self.doclens, &self.freq_deltas)?;
        self.db
            .record
            .set_total_length_and_last_docid(self.total_length, self.last_docid)?;

        self.apply_tables()?;

        self.mod_plists.clear();
        self.doclens.clear();
        self.freq_deltas.clear();
        self.changes = 0;

        Ok(())
    }

    fn apply_tables(&mut self) -> crate::Result<()> {
        let old_revision = self.db.revision();
        let new_revision = self.db.postlist.store.latest_revision() + 1;

        log::debug!("applying modifications, new revision is {new_revision}");

        if let Err(e) = self.db.force_revision(new_revision) {
            log::warn!("applying modifications failed ({e}), reverting to revision {old_revision}");

            // Reopen at the old revision and push every table onto one
            // fresh revision number so they agree again
            self.db = Database::open_at(&self.db.dir, true, old_revision)?;
            self.db
                .force_revision(new_revision + 1)
                .map_err(|_| {
                    Error::Corrupt(
                        "modifications failed and revision numbers could not be restored",
                    )
                })?;

            self.clear_buffers()?;
            return Err(e);
        }

        Ok(())
    }

    fn note_change(&mut self) -> crate::Result<()> {
        self.changes += 1;
        if self.changes >= self.flush_threshold && !self.in_transaction {
            self.flush_changes()?;
        }
        Ok(())
    }

    fn check_term(term: &Slice) -> crate::Result<()> {
        if term.is_empty() || term.len() > crate::termlist::MAX_TERM_LENGTH {
            return Err(Error::InvalidArgument("term length out of range"));
        }
        if term_key(term).len() > MAX_ENCODED_TERM_KEY {
            return Err(Error::InvalidArgument(
                "term does not fit a posting list key once encoded",
            ));
        }
        Ok(())
    }

    fn bump_freqs(&mut self, term: &Slice, docs: i64, occurrences: i64) {
        let entry = self.freq_deltas.entry(term.clone()).or_insert((0, 0));
        entry.0 += docs;
        entry.1 += occurrences;
    }

    /// Adds a document under the next free document id.
    pub fn add_document(&mut self, document: &Document) -> crate::Result<DocId> {
        let did = self
            .last_docid
            .checked_add(1)
            .ok_or(Error::Range("document ids are exhausted"))?;
        self.last_docid = did;

        self.add_document_at(did, document)?;
        Ok(did)
    }

    fn add_document_at(&mut self, did: DocId, document: &Document) -> crate::Result<()> {
        if let Err(e) = self.try_add_document(did, document) {
            // Partial modifications must not survive into a later flush
            self.cancel()?;
            return Err(e);
        }
        self.note_change()
    }

    fn try_add_document(&mut self, did: DocId, document: &Document) -> crate::Result<()> {
        self.db.record.replace(did, document.data.clone())?;

        for (slot, value) in &document.values {
            self.db.value.add_value(did, *slot, value.clone())?;
        }

        let mut new_doclen = 0u32;
        for (term, data) in &document.terms {
            Self::check_term(term)?;

            new_doclen = new_doclen
                .checked_add(data.wdf)
                .ok_or(Error::Range("document length out of range"))?;

            self.bump_freqs(term, 1, i64::from(data.wdf));

            let postings = self.mod_plists.entry(term.clone()).or_default();
            debug_assert!(!postings.contains_key(&did), "docid added twice");
            postings.insert(did, (PostingChange::Added, data.wdf));

            if !data.positions.is_empty() {
                self.db.position.set(did, term, &data.positions)?;
            }
        }

        self.db.termlist.set_entries(
            did,
            document.terms.iter().map(|(t, d)| (t.as_ref(), d.wdf)),
            new_doclen,
            false,
        )?;

        self.doclens.insert(did, new_doclen);
        self.total_length += u64::from(new_doclen);

        Ok(())
    }

    /// Removes a document and all its index entries.
    pub fn delete_document(&mut self, did: DocId) -> crate::Result<()> {
        if let Err(e) = self.try_delete_document(did) {
            if !matches!(e, Error::DocNotFound(_)) {
                self.cancel()?;
            }
            return Err(e);
        }
        self.note_change()
    }

    fn try_delete_document(&mut self, did: DocId) -> crate::Result<()> {
        // Walk the (possibly still buffered) term list first so a missing
        // document fails before anything is modified
        let mut termlist = self.db.termlist.open(did)?;
        let old_doclen = termlist.doc_length();

        let mut old_terms: Vec<(Slice, u32)> = Vec::new();
        while termlist.next()? {
            old_terms.push((termlist.term().into(), termlist.wdf()));
        }

        self.db.record.delete(did)?;
        self.db.value.delete_all_values(did)?;

        for (term, wdf) in &old_terms {
            self.db.position.delete(did, term)?;
            self.bump_freqs(term, -1, -i64::from(*wdf));

            let postings = self.mod_plists.entry(term.clone()).or_default();
            postings.insert(did, (PostingChange::Deleted, 0));
        }

        self.db.termlist.delete(did)?;
        self.doclens.remove(&did);
        self.total_length -= u64::from(old_doclen);

        Ok(())
    }

    /// Replaces the document stored under `did` (or adds it, if `did` is
    /// above the high-watermark or was deleted).
    pub fn replace_document(&mut self, did: DocId, document: &Document) -> crate::Result<()> {
        if did == 0 {
            return Err(Error::InvalidArgument("document id 0 is reserved"));
        }

        if did > self.last_docid {
            // Above the high-watermark we cannot be replacing anything
            self.last_docid = did;
            return self.add_document_at(did, document);
        }

        match self.try_replace_document(did, document) {
            Ok(()) => self.note_change(),
            Err(Error::DocNotFound(_)) => self.add_document_at(did, document),
            Err(e) => {
                self.cancel()?;
                Err(e)
            }
        }
    }

    fn try_replace_document(&mut self, did: DocId, document: &Document) -> crate::Result<()> {
        let mut termlist = self.db.termlist.open(did)?;
        let old_doclen = termlist.doc_length();

        let mut old_terms: Vec<(Slice, u32)> = Vec::new();
        while termlist.next()? {
            old_terms.push((termlist.term().into(), termlist.wdf()));
        }

        for (term, wdf) in &old_terms {
            self.bump_freqs(term, -1, -i64::from(*wdf));

            let postings = self.mod_plists.entry(term.clone()).or_default();
            postings.insert(did, (PostingChange::Deleted, 0));

            // Dropped terms must not leave position lists behind; terms the
            // new document keeps get theirs rewritten below
            self.db.position.delete(did, term)?;
        }

        self.total_length -= u64::from(old_doclen);

        self.db.record.replace(did, document.data.clone())?;

        self.db.value.delete_all_values(did)?;
        for (slot, value) in &document.values {
            self.db.value.add_value(did, *slot, value.clone())?;
        }

        let mut new_doclen = 0u32;
        for (term, data) in &document.terms {
            Self::check_term(term)?;

            new_doclen = new_doclen
                .checked_add(data.wdf)
                .ok_or(Error::Range("document length out of range"))?;

            self.bump_freqs(term, 1, i64::from(data.wdf));

            let postings = self.mod_plists.entry(term.clone()).or_default();
            match postings.get(&did) {
                Some((PostingChange::Deleted, _)) => {
                    postings.insert(did, (PostingChange::Modified, data.wdf));
                }
                Some(_) => {
                    return Err(Error::Corrupt(
                        "posting buffer holds an impossible change mark",
                    ));
                }
                None => {
                    postings.insert(did, (PostingChange::Added, data.wdf));
                }
            }

            if data.positions.is_empty() {
                self.db.position.delete(did, term)?;
            } else {
                self.db.position.set(did, term, &data.positions)?;
            }
        }

        self.db.termlist.set_entries(
            did,
            document.terms.iter().map(|(t, d)| (t.as_ref(), d.wdf)),
            new_doclen,
            false,
        )?;

        self.doclens.insert(did, new_doclen);
        self.total_length += u64::from(new_doclen);

        Ok(())
    }

    /// Starts a transaction: auto-flush is suppressed until it ends.
    pub fn begin_transaction(&mut self) -> crate::Result<()> {
        if self.in_transaction {
            return Err(Error::InvalidArgument("a transaction is already active"));
        }

        // Committing first makes cancel_transaction roll back to exactly
        // this point
        self.flush_changes()?;
        self.in_transaction = true;
        Ok(())
    }

    /// Commits the active transaction.
    pub fn commit_transaction(&mut self) -> crate::Result<()> {
        if !self.in_transaction {
            return Err(Error::InvalidArgument("no transaction is active"));
        }
        self.in_transaction = false;
        self.flush_changes()
    }

    /// Abandons the active transaction, discarding its changes.
    pub fn cancel_transaction(&mut self) -> crate::Result<()> {
        if !self.in_transaction {
            return Err(Error::InvalidArgument("no transaction is active"));
        }
        self.in_transaction = false;
        self.cancel()
    }

    /// Whether a transaction is active.
    #[must_use]
    pub fn transaction_active(&self) -> bool {
        self.in_transaction
    }

    /// Number of documents (including uncommitted ones).
    #[must_use]
    pub fn doc_count(&self) -> u64 {
        self.db.doc_count()
    }

    /// Highest document id allocated so far.
    #[must_use]
    pub fn last_docid(&self) -> DocId {
        self.last_docid
    }

    /// Sum of all document lengths (including uncommitted changes).
    #[must_use]
    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    /// Average document length (including uncommitted changes).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn avg_length(&self) -> f64 {
        let docs = self.doc_count();
        if docs == 0 {
            return 0.0;
        }

        self.total_length as f64 / docs as f64
    }

    /// Length of one document.
    pub fn doc_length(&self, did: DocId) -> crate::Result<u32> {
        if let Some(len) = self.doclens.get(&did) {
            return Ok(*len);
        }
        self.db.doc_length(did)
    }

    /// Number of distinct terms in one document.
    pub fn unique_terms(&self, did: DocId) -> crate::Result<u32> {
        self.db.unique_terms(did)
    }

    /// Number of documents containing `term`, with buffered changes
    /// folded in.
    pub fn term_freq(&self, term: &[u8]) -> crate::Result<u32> {
        let on_disk = i64::from(self.db.term_freq(term)?);
        let delta = self
            .freq_deltas
            .get(term)
            .map(|(docs, _)| *docs)
            .unwrap_or_default();

        u32::try_from(on_disk + delta)
            .map_err(|_| Error::Corrupt("term frequency went out of range"))
    }

    /// Collection frequency of `term`, with buffered changes folded in.
    pub fn collection_freq(&self, term: &[u8]) -> crate::Result<u32> {
        let on_disk = i64::from(self.db.collection_freq(term)?);
        let delta = self
            .freq_deltas
            .get(term)
            .map(|(_, occurrences)| *occurrences)
            .unwrap_or_default();

        u32::try_from(on_disk + delta)
            .map_err(|_| Error::Corrupt("collection frequency went out of range"))
    }

    /// Whether any document contains `term`.
    pub fn term_exists(&self, term: &[u8]) -> crate::Result<bool> {
        Ok(self.term_freq(term)? != 0)
    }

    /// Whether any positional information is stored.
    #[must_use]
    pub fn has_positions(&self) -> bool {
        self.db.has_positions()
    }

    /// Fetches a document's data.
    pub fn get_document(&self, did: DocId) -> crate::Result<Slice> {
        self.db.get_document(did)
    }

    /// Fetches one value of a document.
    pub fn get_value(&self, did: DocId, slot: Slot) -> crate::Result<Option<Slice>> {
        self.db.get_value(did, slot)
    }

    /// Fetches all values of a document.
    pub fn get_all_values(&self, did: DocId) -> crate::Result<Vec<(Slot, Slice)>> {
        self.db.get_all_values(did)
    }

    /// Statistics of a value slot.
    pub fn value_stats(&self, slot: Slot) -> crate::Result<ValueStats> {
        self.db.value_stats(slot)
    }

    /// Opens the posting list of a term.
    ///
    /// Buffered changes to this term's postings are flushed first, which
    /// is not possible inside a transaction.
    pub fn postings(&mut self, term: &[u8]) -> crate::Result<PostingIterator<'_>> {
        if self.mod_plists.contains_key(term) {
            if self.in_transaction {
                return Err(Error::Unimplemented(
                    "cannot open a modified posting list during a transaction",
                ));
            }
            self.flush_changes()?;
        }
        self.db.postings(term)
    }

    /// Iterates every document with its length.
    pub fn all_docs(&self) -> crate::Result<AllDocsIterator<'_>> {
        self.db.all_docs()
    }

    /// Iterates every term; buffered changes are flushed first.
    pub fn all_terms(&mut self) -> crate::Result<AllTermsIterator<'_>> {
        self.flush_for_term_iteration()?;
        self.db.all_terms()
    }

    /// Iterates every term with `prefix`; buffered changes are flushed
    /// first.
    pub fn all_terms_with_prefix(
        &mut self,
        prefix: &[u8],
    ) -> crate::Result<AllTermsIterator<'_>> {
        self.flush_for_term_iteration()?;
        self.db.all_terms_with_prefix(prefix)
    }

    fn flush_for_term_iteration(&mut self) -> crate::Result<()> {
        if self.changes > 0 {
            if self.in_transaction {
                return Err(Error::Unimplemented(
                    "cannot iterate terms during a transaction",
                ));
            }
            self.flush_changes()?;
        }
        Ok(())
    }

    /// Opens the term list of a document.
    pub fn term_list(&self, did: DocId) -> crate::Result<TermlistIterator> {
        self.db.term_list(did)
    }

    /// Opens the position list of `(did, term)`.
    pub fn positions(&self, did: DocId, term: &[u8]) -> crate::Result<PositionIterator> {
        self.db.positions(did, term)
    }

    /// Sets a user metadata entry; an empty value removes the key.
    pub fn set_metadata(&mut self, key: &[u8], value: &[u8]) -> crate::Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidArgument("metadata key must not be empty"));
        }

        let full_key = metadata_key(key);
        if full_key.len() > crate::btree::block::MAX_KEY_LEN {
            return Err(Error::InvalidArgument("metadata key too long"));
        }

        let tag = if value.is_empty() {
            None
        } else {
            Some(value.into())
        };
        self.db.postlist.store.set_entry(full_key.into(), tag)?;

        self.note_change()
    }

    /// Reads a user metadata entry.
    pub fn get_metadata(&self, key: &[u8]) -> crate::Result<Slice> {
        self.db.metadata(key)
    }

    /// Iterates user metadata keys starting with `prefix`.
    pub fn metadata_keys(
        &self,
        prefix: &[u8],
    ) -> crate::Result<super::MetadataIterator<'_>> {
        self.db.metadata_keys(prefix)
    }

    /// Revision the handle currently has open.
    #[must_use]
    pub fn revision(&self) -> Revision {
        self.db.revision()
    }
}
