// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::db::writer::WritableDatabase;
use crate::db::Database;
use std::path::PathBuf;

/// Default block size of newly created tables.
pub const DEFAULT_BLOCK_SIZE: u32 = 8_192;

/// Default number of document operations before an implicit commit.
pub const DEFAULT_FLUSH_THRESHOLD: u32 = 10_000;

/// Environment variable overriding the flush threshold; read once when a
/// writable database is opened.
pub const FLUSH_THRESHOLD_ENV: &str = "XAPIAN_FLUSH_THRESHOLD";

/// How a writable database open treats existing on-disk state.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OpenMode {
    /// Open an existing database, failing if there is none
    Open,

    /// Create a new database, failing if one exists
    Create,

    /// Open the database, creating it first if needed
    CreateOrOpen,

    /// Create a new database, replacing any existing one
    CreateOrOverwrite,
}

/// Database configuration, forming the entry point of the crate.
///
/// ```
/// # use mica::{Config, Document, OpenMode};
/// # let folder = tempfile::tempdir()?;
/// let mut db = Config::new(&folder).open_writable(OpenMode::CreateOrOpen)?;
///
/// let mut doc = Document::new();
/// doc.set_data("Foobar rising");
/// doc.add_posting("foobar", 1);
/// db.add_document(&doc)?;
/// db.commit()?;
///
/// let reader = Config::new(&folder).open()?;
/// assert_eq!(1, reader.doc_count());
/// # Ok::<(), mica::Error>(())
/// ```
#[derive(Clone, Debug)]
pub struct Config {
    path: PathBuf,
    block_size: u32,
    flush_threshold: Option<u32>,
}

impl Config {
    /// Configuration for the database directory at `path`.
    pub fn new<P: AsRef<std::path::Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            block_size: DEFAULT_BLOCK_SIZE,
            flush_threshold: None,
        }
    }

    /// Block size for newly created tables (2048..=65536 bytes).
    ///
    /// Ignored when opening an existing database, which keeps the block
    /// size it was created with.
    #[must_use]
    pub fn block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size;
        self
    }

    /// Number of document operations that trigger an implicit commit.
    ///
    /// When not set, the `XAPIAN_FLUSH_THRESHOLD` environment variable is
    /// consulted at open time, then the default of 10 000.
    #[must_use]
    pub fn flush_threshold(mut self, threshold: u32) -> Self {
        self.flush_threshold = Some(threshold);
        self
    }

    fn resolve_flush_threshold(&self) -> u32 {
        if let Some(threshold) = self.flush_threshold {
            return threshold;
        }

        let from_env = std::env::var(FLUSH_THRESHOLD_ENV)
            .ok()
            .and_then(|value| value.parse::<u32>().ok())
            .filter(|&threshold| threshold > 0);

        from_env.unwrap_or(DEFAULT_FLUSH_THRESHOLD)
    }

    /// Opens the database read-only, observing its newest consistent
    /// revision.
    pub fn open(self) -> crate::Result<Database> {
        Database::open(&self.path)
    }

    /// Opens the database for writing, taking the exclusive write lock.
    pub fn open_writable(self, mode: OpenMode) -> crate::Result<WritableDatabase> {
        let flush_threshold = self.resolve_flush_threshold();
        WritableDatabase::open(&self.path, mode, self.block_size, flush_threshold)
    }
}
