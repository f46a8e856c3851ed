// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::pack::{docid_key, pack_uint32, pack_uint_last64, Unpacker};
use crate::table::Table;
use crate::{DocId, Error, Slice};

// The meta entry (last allocated docid + total document length) lives under
// a single NUL byte, which no docid key can collide with since docid 0 is
// reserved.
const META_KEY: [u8; 1] = [0];

/// Opaque per-document data blobs, plus the database-wide meta entry.
pub struct RecordTable {
    pub(crate) store: Table,
}

impl RecordTable {
    pub(crate) fn new(store: Table) -> Self {
        Self { store }
    }

    /// Fetches a document's data.
    pub fn get(&self, did: DocId) -> crate::Result<Slice> {
        self.store
            .get_exact_entry(&docid_key(did)?)?
            .ok_or(Error::DocNotFound(did))
    }

    /// Returns whether the document exists.
    pub fn exists(&self, did: DocId) -> crate::Result<bool> {
        Ok(self.store.get_exact_entry(&docid_key(did)?)?.is_some())
    }

    /// Overwrites (or inserts) a document's data.
    pub fn replace(&self, did: DocId, data: Slice) -> crate::Result<()> {
        self.store.set_entry(docid_key(did)?.into(), Some(data))
    }

    /// Removes a document.
    pub fn delete(&self, did: DocId) -> crate::Result<()> {
        let key = docid_key(did)?;
        if self.store.get_exact_entry(&key)?.is_none() {
            return Err(Error::DocNotFound(did));
        }
        self.store.set_entry(key.into(), None)
    }

    /// Number of documents (the meta entry does not count).
    #[must_use]
    pub fn doc_count(&self) -> u64 {
        self.store.entry_count().saturating_sub(1)
    }

    /// Whether the meta entry has ever been written.
    pub(crate) fn has_meta(&self) -> crate::Result<bool> {
        Ok(self.store.get_exact_entry(&META_KEY)?.is_some())
    }

    fn meta(&self) -> crate::Result<Option<(DocId, u64)>> {
        let Some(tag) = self.store.get_exact_entry(&META_KEY)? else {
            return Ok(None);
        };

        let mut unpacker = Unpacker::new(&tag);
        let last_docid = unpacker
            .uint32()
            .map_err(|_| Error::Corrupt("record meta entry is corrupt"))?;
        let total_length = unpacker
            .uint_last64()
            .map_err(|_| Error::Corrupt("record meta entry is corrupt"))?;

        Ok(Some((last_docid, total_length)))
    }

    /// Highest document id ever allocated.
    ///
    /// An empty (or never-committed) table reads as zero.
    pub fn last_docid(&self) -> crate::Result<DocId> {
        Ok(self.meta()?.map(|(did, _)| did).unwrap_or_default())
    }

    /// Sum of all document lengths.
    pub fn total_length(&self) -> crate::Result<u64> {
        Ok(self.meta()?.map(|(_, len)| len).unwrap_or_default())
    }

    /// Updates the meta entry.
    pub fn set_total_length_and_last_docid(
        &self,
        total_length: u64,
        last_docid: DocId,
    ) -> crate::Result<()> {
        let mut tag = Vec::new();
        pack_uint32(&mut tag, last_docid);
        pack_uint_last64(&mut tag, total_length);

        self.store.set_entry(META_KEY.into(), Some(tag.into()))
    }
}
