//! Sidecar lock files.
//!
//! Every process with a file-backed session on a realm holds a shared
//! advisory lock on `<path>.lock`. The file carries one line describing the
//! engine build, written by whichever process found the lock free. A
//! process whose own line differs cannot share the file and fails to open.

use super::log::FORMAT_VERSION;
use crate::error::{CoreError, CoreResult, FileAccessKind};
use fs2::FileExt;
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Returns `<realm_path>.<extension>`.
pub(crate) fn sidecar_path(realm_path: &Path, extension: &str) -> PathBuf {
    let mut name = OsString::from(realm_path.as_os_str());
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}

/// The compatibility line this build writes to lock files.
pub(crate) fn compat_line() -> String {
    let endian = if cfg!(target_endian = "little") {
        "le"
    } else {
        "be"
    };
    format!(
        "realmkit-lock format={FORMAT_VERSION} ptr={} endian={endian}",
        usize::BITS
    )
}

/// Shared lock on `<path>.lock` held for the life of a session.
#[derive(Debug)]
pub(crate) struct LockFile {
    file: File,
    path: PathBuf,
}

impl LockFile {
    /// Opens the lock file of `realm_path` and joins the set of sharers.
    pub(crate) fn acquire(realm_path: &Path) -> CoreResult<Self> {
        let path = sidecar_path(realm_path, "lock");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| CoreError::from_open_io(realm_path, &e))?;

        let expected = compat_line();
        if file.try_lock_exclusive().is_ok() {
            file.set_len(0)?;
            (&file).write_all(expected.as_bytes())?;
            file.sync_all()?;
            FileExt::unlock(&file)?;
            FileExt::lock_shared(&file)?;
        } else {
            FileExt::lock_shared(&file)?;
            let mut found = String::new();
            (&file).seek(SeekFrom::Start(0))?;
            (&file).read_to_string(&mut found)?;
            if found != expected {
                return Err(CoreError::file_access(
                    FileAccessKind::IncompatibleLockFile,
                    realm_path,
                    format!("realm is open in another process as '{found}', this process is '{expected}'"),
                ));
            }
        }

        Ok(Self { file, path })
    }

    /// Trades the shared lock for an exclusive one if no other process
    /// holds the file. Returns false, still sharing, otherwise.
    pub(crate) fn try_upgrade(&self) -> CoreResult<bool> {
        FileExt::unlock(&self.file)?;
        if self.file.try_lock_exclusive().is_ok() {
            return Ok(true);
        }
        FileExt::lock_shared(&self.file)?;
        Ok(false)
    }

    /// Returns to a shared lock after [`LockFile::try_upgrade`].
    pub(crate) fn downgrade(&self) -> CoreResult<()> {
        FileExt::unlock(&self.file)?;
        FileExt::lock_shared(&self.file)?;
        Ok(())
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn sidecar_appends_extension() {
        assert_eq!(
            sidecar_path(Path::new("/tmp/a.realm"), "lock"),
            PathBuf::from("/tmp/a.realm.lock")
        );
    }

    #[test]
    fn sharers_agree_on_the_line() {
        let dir = tempdir().unwrap();
        let realm = dir.path().join("a.realm");
        let first = LockFile::acquire(&realm).unwrap();
        let second = LockFile::acquire(&realm).unwrap();
        assert_eq!(first.path(), second.path());
        assert_eq!(
            std::fs::read_to_string(first.path()).unwrap(),
            compat_line()
        );
    }

    #[test]
    fn foreign_line_is_incompatible_while_held() {
        let dir = tempdir().unwrap();
        let realm = dir.path().join("a.realm");
        let lock_path = sidecar_path(&realm, "lock");
        std::fs::write(&lock_path, "some-other-engine v9").unwrap();
        let holder = File::open(&lock_path).unwrap();
        FileExt::lock_shared(&holder).unwrap();

        let err = LockFile::acquire(&realm).unwrap_err();
        assert_eq!(
            err.file_access_kind(),
            Some(FileAccessKind::IncompatibleLockFile)
        );

        FileExt::unlock(&holder).unwrap();
        drop(holder);
        LockFile::acquire(&realm).unwrap();
    }

    #[test]
    fn upgrade_fails_while_shared_elsewhere() {
        let dir = tempdir().unwrap();
        let realm = dir.path().join("a.realm");
        let a = LockFile::acquire(&realm).unwrap();
        let b = LockFile::acquire(&realm).unwrap();
        assert!(!a.try_upgrade().unwrap());
        drop(b);
        assert!(a.try_upgrade().unwrap());
        a.downgrade().unwrap();
    }
}
