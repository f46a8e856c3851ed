// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::file::LOCK_FILE;
use crate::Error;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Exclusive write lock on a database directory.
///
/// Acquired by hard-linking a freshly written temporary file to `db_lock`;
/// the link refuses to overwrite, which makes acquisition atomic even over
/// network filesystems. Released (best-effort) on drop.
pub struct WriteLock {
    path: PathBuf,
}

impl WriteLock {
    /// Tries to take the write lock of `dir`.
    pub fn acquire(dir: &Path) -> crate::Result<Self> {
        let path = dir.join(LOCK_FILE);

        let mut temp = tempfile::NamedTempFile::new_in(dir)?;
        writeln!(temp, "{}", std::process::id())?;
        temp.flush()?;

        match std::fs::hard_link(temp.path(), &path) {
            Ok(()) => {
                log::debug!("acquired write lock {path:?}");
                Ok(Self { path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(Error::Locked(path))
            }
            Err(e) => Err(Error::Io(e)),
        }
    }
}

impl Drop for WriteLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            log::warn!("could not release write lock {:?}: {e}", self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn lock_is_exclusive() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        let lock = WriteLock::acquire(dir.path())?;
        assert!(matches!(
            WriteLock::acquire(dir.path()),
            Err(Error::Locked(_)),
        ));

        drop(lock);
        let _relock = WriteLock::acquire(dir.path())?;

        Ok(())
    }
}
