// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! An embeddable, multi-revision B-tree storage engine for full-text index
//! data.
//!
//! ##### About
//!
//! This crate persists the building blocks of an inverted index — posting
//! lists, term positions, per-document term lists, document data, and value
//! slots — in five block-structured B-tree tables inside one database
//! directory.
//!
//! Every table keeps sorted key→tag pairs on fixed-size blocks and commits
//! through a pair of alternating base files, so each commit produces a new
//! revision while the previous one stays intact on disk. The record table
//! is committed last; its revision defines the database's committed state,
//! and recovery after a crash mid-commit simply moves every table onto a
//! fresh common revision.
//!
//! One writer (guarded by a lock file) and any number of read-only handles
//! may use a database concurrently; each reader keeps observing the
//! revision it opened until it reopens, and is told via a distinct error
//! when a writer has overwritten its snapshot.
//!
//! # Example usage
//!
//! ```
//! use mica::{Config, Document, OpenMode};
//! #
//! # let folder = tempfile::tempdir()?;
//!
//! let mut db = Config::new(&folder).open_writable(OpenMode::CreateOrOpen)?;
//!
//! let mut doc = Document::new();
//! doc.set_data("an example document");
//! doc.add_posting("example", 1);
//! doc.add_posting("document", 2);
//! doc.add_value(0, "2026-08-01");
//!
//! let docid = db.add_document(&doc)?;
//! db.commit()?;
//!
//! assert_eq!(1, db.doc_count());
//! assert_eq!(1, db.term_freq(b"example")?);
//!
//! // Walk the term's postings
//! let mut postings = db.postings(b"example")?;
//! postings.next()?;
//! assert_eq!(docid, postings.docid());
//! #
//! # Ok::<(), mica::Error>(())
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::missing_const_for_fn)]
#![warn(clippy::multiple_crate_versions)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::module_name_repetitions)]

mod binary_search;

#[doc(hidden)]
pub mod btree;

mod coding;
mod config;
mod db;
mod document;
mod error;

#[doc(hidden)]
pub mod file;

#[doc(hidden)]
pub mod pack;

mod positionlist;
mod postlist;
mod record;
mod slice;

#[doc(hidden)]
pub mod table;

mod termlist;
mod values;

/// Document id; ids start at 1, 0 is reserved.
pub type DocId = u32;

/// Revision number of one committed table (and database) state.
pub type Revision = u32;

/// Numeric identifier of a per-document value.
pub type Slot = u32;

/// Position of a term occurrence within a document.
pub type TermPos = u32;

pub use {
    config::{Config, OpenMode, DEFAULT_BLOCK_SIZE, DEFAULT_FLUSH_THRESHOLD},
    db::writer::WritableDatabase,
    db::{Database, MetadataIterator},
    document::Document,
    error::{Error, Result},
    positionlist::PositionIterator,
    postlist::allterms::AllTermsIterator,
    postlist::iter::PostingIterator,
    slice::Slice,
    termlist::{AllDocsIterator, TermlistIterator, MAX_TERM_LENGTH},
    values::ValueStats,
};

#[doc(hidden)]
pub use pack::{UnpackError, Unpacker};
