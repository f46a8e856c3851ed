// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Name of the write-lock file inside a database directory.
pub const LOCK_FILE: &str = "db_lock";

/// Which of the two alternating base files a revision descriptor lives in.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BaseSlot {
    /// `<table>_baseA`
    A,
    /// `<table>_baseB`
    B,
}

impl BaseSlot {
    /// The slot that will be overwritten by the next commit.
    #[must_use]
    pub fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
        }
    }
}

/// Path of a table's block data file.
#[must_use]
pub fn data_file_path(dir: &Path, table: &str) -> PathBuf {
    dir.join(format!("{table}_DB"))
}

/// Path of one of a table's two base files.
#[must_use]
pub fn base_file_path(dir: &Path, table: &str, slot: BaseSlot) -> PathBuf {
    dir.join(format!("{table}_base{}", slot.suffix()))
}

/// Reads an exact amount of bytes at an offset using `pread`.
#[cfg(unix)]
pub fn read_exact_at(file: &File, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

/// Reads an exact amount of bytes at an offset.
#[cfg(windows)]
pub fn read_exact_at(file: &File, mut offset: u64, mut buf: &mut [u8]) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;

    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "failed to fill whole buffer",
                ))
            }
            Ok(n) => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Writes all bytes at an offset using `pwrite`.
#[cfg(unix)]
pub fn write_all_at(file: &File, offset: u64, buf: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

/// Writes all bytes at an offset.
#[cfg(windows)]
pub fn write_all_at(file: &File, mut offset: u64, mut buf: &[u8]) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;

    while !buf.is_empty() {
        match file.seek_write(buf, offset) {
            Ok(0) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "failed to write whole buffer",
                ))
            }
            Ok(n) => {
                buf = &buf[n..];
                offset += n as u64;
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Atomically rewrites a file.
pub fn rewrite_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
    #[allow(clippy::expect_used)]
    let folder = path.parent().expect("should have a parent");

    let mut temp_file = tempfile::NamedTempFile::new_in(folder)?;
    temp_file.write_all(content)?;
    temp_file.flush()?;
    temp_file.as_file_mut().sync_all()?;
    temp_file.persist(path)?;

    #[cfg(not(target_os = "windows"))]
    {
        let file = File::open(path)?;
        file.sync_all()?;

        fsync_directory(folder)?;
    }

    Ok(())
}

/// Flushes a directory's entries to stable storage.
#[cfg(not(target_os = "windows"))]
pub fn fsync_directory(path: &Path) -> std::io::Result<()> {
    let file = File::open(path)?;
    debug_assert!(file.metadata()?.is_dir());
    file.sync_all()
}

/// Flushes a directory's entries to stable storage.
#[cfg(target_os = "windows")]
pub fn fsync_directory(_path: &Path) -> std::io::Result<()> {
    // Cannot fsync directory on Windows
    Ok(())
}
