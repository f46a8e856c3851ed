// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Chunked inverted lists, one per term, multi-version like everything
//! else in the engine.
//!
//! The first chunk lives under the bare (sort-encoded) term; every further
//! chunk under `term ⧺ first_docid`. [`PostlistTable::merge_changes`]
//! applies a batch of per-document additions, modifications, and deletions
//! while keeping chunks near their size target and the chunk invariants
//! intact: docids strictly increase across chunks, exactly one chunk per
//! term carries the last-chunk flag, and the first chunk's header holds the
//! term's frequencies.

pub mod allterms;
mod chunk;
pub mod iter;

use crate::pack::{
    pack_string_preserving_sort, pack_uint_preserving_sort32, Unpacker,
};
use crate::table::Table;
use crate::{DocId, Error, Slice};
use chunk::{
    make_chunk_header, make_first_chunk_header, read_chunk_header, read_first_chunk_header,
    ChunkReader, ChunkWriter,
};
use std::collections::BTreeMap;

/// How one document's posting for a term changed since the last flush.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum PostingChange {
    /// The document gained the term
    Added,

    /// The document was deleted and re-added with the term in one batch
    Modified,

    /// The document lost the term
    Deleted,
}

/// term → docid → (change, new wdf); docids sorted for the merge walk.
pub(crate) type ModifiedPostlists = BTreeMap<Slice, BTreeMap<DocId, (PostingChange, u32)>>;

/// term → (termfreq delta, collfreq delta).
pub(crate) type FreqDeltas = BTreeMap<Slice, (i64, i64)>;

/// docid → new document length.
pub(crate) type DocLengths = BTreeMap<DocId, u32>;

/// Key of a term's first chunk.
pub(crate) fn term_key(term: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(term.len() + 2);
    pack_string_preserving_sort(&mut key, term);
    key
}

/// Key of a continuation chunk starting at `did`.
pub(crate) fn chunk_key(term: &[u8], did: DocId) -> Vec<u8> {
    let mut key = term_key(term);
    pack_uint_preserving_sort32(&mut key, did);
    key
}

/// Splits a postlist key into its term and, for continuation chunks, the
/// first docid of the chunk.
pub(crate) fn parse_key(key: &[u8]) -> crate::Result<(Vec<u8>, Option<DocId>)> {
    let mut unpacker = Unpacker::new(key);

    let term = unpacker
        .string_preserving_sort()
        .map_err(|_| Error::Corrupt("postlist key has no term"))?;

    if unpacker.is_empty() {
        return Ok((term, None));
    }

    let did = unpacker
        .uint_preserving_sort32()
        .map_err(|_| Error::Corrupt("postlist key has a malformed docid"))?;
    if !unpacker.is_empty() {
        return Err(Error::Corrupt("postlist key has trailing bytes"));
    }

    Ok((term, Some(did)))
}

/// The posting-list table.
pub struct PostlistTable {
    pub(crate) store: Table,
}

impl PostlistTable {
    pub(crate) fn new(store: Table) -> Self {
        Self { store }
    }

    /// Reads `(termfreq, collfreq)` out of a term's first-chunk header.
    pub fn term_info(&self, term: &[u8]) -> crate::Result<Option<(u32, u32)>> {
        let Some(tag) = self.store.get_exact_entry(&term_key(term))? else {
            return Ok(None);
        };

        let mut unpacker = Unpacker::new(&tag);
        let (termfreq, collfreq, _) = read_first_chunk_header(&mut unpacker)?;
        Ok(Some((termfreq, collfreq)))
    }

    /// Returns whether the term has a posting list.
    pub fn term_exists(&self, term: &[u8]) -> crate::Result<bool> {
        Ok(self.store.get_exact_entry(&term_key(term))?.is_some())
    }

    /// Loads the chunk a modification of `did` belongs to.
    ///
    /// Returns the reader over the existing entries (`None` on the pure
    /// append path, where the raw body was adopted by the writer), the
    /// writer, and the highest docid this chunk may hold before the walk
    /// must move on to the next one.
    fn get_chunk(
        &self,
        term: &Slice,
        did: DocId,
        adding: bool,
    ) -> crate::Result<(Option<ChunkReader>, ChunkWriter, DocId)> {
        let key = chunk_key(term, did);

        let mut cursor = self.store.cursor();
        cursor.find_entry(&key)?;

        let in_this_term = cursor.is_positioned()
            && parse_key(cursor.current_key())
                .map(|(t, _)| t.as_slice() == term.as_ref())
                .unwrap_or(false);

        if !in_this_term {
            if !adding {
                return Err(Error::Corrupt(
                    "posting list missing for a modified term",
                ));
            }
            let writer = ChunkWriter::new(Slice::empty(), true, term.clone(), true);
            return Ok((None, writer, DocId::MAX));
        }

        let current_key: Slice = cursor.current_key().into();
        let (_, key_did) = parse_key(&current_key)?;
        let is_first_chunk = key_did.is_none();

        let tag = cursor.read_tag()?;
        let mut unpacker = Unpacker::new(&tag);

        let first_did = match key_did {
            None => read_first_chunk_header(&mut unpacker)?.2,
            Some(did) => did,
        };
        let (is_last, last_did) = read_chunk_header(&mut unpacker, first_did)?;

        let mut writer = ChunkWriter::new(current_key, is_first_chunk, term.clone(), is_last);

        let body = tag.slice(unpacker.position()..);
        let reader = if did > last_did {
            // Pure append: adopt the existing body wholesale
            writer.raw_append(first_did, last_did, &body);
            None
        } else {
            Some(ChunkReader::new(first_did, body)?)
        };

        let max_did = if is_last {
            DocId::MAX
        } else {
            if !cursor.next()? {
                return Err(Error::Corrupt("posting list ends before its last chunk"));
            }
            let (next_term, next_did) = parse_key(cursor.current_key())?;
            if next_term.as_slice() != term.as_ref() {
                return Err(Error::Corrupt("posting list ends before its last chunk"));
            }
            next_did
                .ok_or(Error::Corrupt("posting chunk key lost its docid"))?
                .saturating_sub(1)
        };

        Ok((reader, writer, max_did))
    }

    /// Deletes every chunk of a term (its termfreq dropped to zero).
    fn delete_all_chunks(&self, term: &Slice) -> crate::Result<()> {
        let keys = {
            let mut cursor = self.store.cursor();
            if !cursor.find_entry(&term_key(term))? {
                return Err(Error::Corrupt("first posting chunk disappeared"));
            }

            let mut keys: Vec<Slice> = vec![cursor.current_key().into()];
            while cursor.next()? {
                let (chunk_term, _) = parse_key(cursor.current_key())?;
                if chunk_term.as_slice() != term.as_ref() {
                    break;
                }
                keys.push(cursor.current_key().into());
            }
            keys
        };

        for key in keys {
            self.store.set_entry(key, None)?;
        }

        Ok(())
    }

    /// Rewrites the first chunk's header with updated frequencies; returns
    /// `false` if the term's postings are all gone (and deleted).
    fn update_freqs(&self, term: &Slice, deltas: (i64, i64)) -> crate::Result<bool> {
        let key = term_key(term);
        let tag = self.store.get_exact_entry(&key)?;
        let list_exists = tag.is_some();

        let (mut termfreq, mut collfreq, first_did, is_last, last_did, body_start, tag) =
            match tag {
                None => (0i64, 0i64, 0, true, 0, 0, Slice::empty()),
                Some(tag) => {
                    let mut unpacker = Unpacker::new(&tag);
                    let (termfreq, collfreq, first_did) =
                        read_first_chunk_header(&mut unpacker)?;
                    let (is_last, last_did) = read_chunk_header(&mut unpacker, first_did)?;
                    (
                        i64::from(termfreq),
                        i64::from(collfreq),
                        first_did,
                        is_last,
                        last_did,
                        unpacker.position(),
                        tag,
                    )
                }
            };

        termfreq += deltas.0;
        if termfreq < 0 {
            return Err(Error::Corrupt("posting list termfreq went negative"));
        }
        if termfreq == 0 {
            // A term added and removed again within one batch never made it
            // to disk, so there is nothing to delete
            if list_exists {
                self.delete_all_chunks(term)?;
            }
            return Ok(false);
        }

        collfreq += deltas.1;
        if collfreq < 0 {
            return Err(Error::Corrupt("posting list collfreq went negative"));
        }

        let mut new_tag = Vec::new();
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        make_first_chunk_header(&mut new_tag, termfreq as u32, collfreq as u32, first_did);
        make_chunk_header(&mut new_tag, is_last, first_did, last_did);
        new_tag.extend_from_slice(&tag.slice(body_start.min(tag.len())..));

        self.store.set_entry(key.into(), Some(new_tag.into()))?;
        Ok(true)
    }

    /// Applies one flush worth of posting modifications.
    ///
    /// For every modified term the first chunk's frequencies are updated
    /// first; a termfreq of zero removes the whole list. The sorted
    /// per-docid changes are then spliced through the chunks in one
    /// forward walk.
    pub(crate) fn merge_changes(
        &self,
        mod_plists: &ModifiedPostlists,
        doclens: &DocLengths,
        freq_deltas: &FreqDeltas,
    ) -> crate::Result<()> {
        for (term, postings) in mod_plists {
            if postings.is_empty() {
                continue;
            }

            let deltas = freq_deltas
                .get(term)
                .copied()
                .ok_or(Error::Corrupt("frequency deltas missing for a modified term"))?;

            if !self.update_freqs(term, deltas)? {
                // All postings of this term were deleted
                continue;
            }

            let mut postings_iter = postings.iter();
            let Some((&first_mod_did, &(first_change, _))) = postings.iter().next() else {
                continue;
            };

            let (mut from, mut to, mut max_did) = self.get_chunk(
                term,
                first_mod_did,
                first_change == PostingChange::Added,
            )?;

            for (&did, &(change, wdf)) in &mut postings_iter {
                loop {
                    // Copy everything below `did` into the writer
                    if let Some(reader) = &mut from {
                        while !reader.at_end() {
                            let copy_did = reader.docid();
                            if copy_did >= did {
                                if copy_did == did {
                                    debug_assert!(change != PostingChange::Added);
                                    reader.next()?;
                                }
                                break;
                            }
                            to.append(self, copy_did, reader.wdf(), reader.doc_length())?;
                            reader.next()?;
                        }
                    }

                    // The modification belongs to a later chunk
                    if from.as_ref().map_or(true, ChunkReader::at_end) && did > max_did {
                        to.flush(self)?;
                        let (f, t, m) = self.get_chunk(term, did, false)?;
                        from = f;
                        to = t;
                        max_did = m;
                        continue;
                    }

                    break;
                }

                if change != PostingChange::Deleted {
                    let doclen = doclens
                        .get(&did)
                        .copied()
                        .ok_or(Error::Corrupt("document length missing for a posting"))?;
                    to.append(self, did, wdf, doclen)?;
                }
            }

            // Copy the rest of the list through
            if let Some(reader) = &mut from {
                while !reader.at_end() {
                    to.append(self, reader.docid(), reader.wdf(), reader.doc_length())?;
                    reader.next()?;
                }
            }
            to.flush(self)?;
        }

        Ok(())
    }
}
