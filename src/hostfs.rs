//! Host-FS port: the abstract operations the core needs from the
//! filesystem, kept behind a trait so `archive_action`/`restore`/
//! `catalogue` never call `std::fs` directly. `PosixHostFs` is the only
//! implementation shipped; ACL hooks are `#[cfg(target_os = "linux")]`
//! via `posix-acl` and no-ops elsewhere.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::error::{ArchivariusError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
    Other,
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub path: PathBuf,
    pub kind: EntryKind,
}

/// An exclusive advisory lock, released when dropped.
pub trait FileLock: Send {}

pub trait HostFs {
    /// Direct (non-recursive) children of `path`, files before
    /// directories is *not* enforced here — callers that need the
    /// files-then-subdirectories traversal order build it themselves
    /// from this listing (see `archive_action::enumerate`).
    fn read_dir(&self, path: &Path) -> Result<Vec<DirEntry>>;

    fn exists(&self, path: &Path) -> bool;
    fn entry_kind(&self, path: &Path) -> Result<EntryKind>;
    fn last_write_time(&self, path: &Path) -> Result<SystemTime>;
    fn file_size(&self, path: &Path) -> Result<u64>;
    fn read_symlink(&self, path: &Path) -> Result<PathBuf>;
    fn create_symlink(&self, target: &Path, link: &Path) -> Result<()>;
    fn create_dir_all(&self, path: &Path) -> Result<()>;
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;
    fn remove_file(&self, path: &Path) -> Result<()>;
    fn unix_permissions(&self, path: &Path) -> Result<u32>;
    fn set_unix_permissions(&self, path: &Path, mode: u32) -> Result<()>;
    fn set_mod_time(&self, path: &Path, time: SystemTime) -> Result<()>;

    /// Exclusive whole-file advisory lock. Must fail fast with
    /// `LockHeld` if another process already holds it.
    fn lock_exclusive(&self, path: &Path) -> Result<Box<dyn FileLock>>;

    /// Global sync barrier (`sync(2)` on POSIX, best-effort elsewhere).
    fn sync_all(&self);

    fn get_acl(&self, path: &Path) -> Result<Option<String>>;
    fn set_acl(&self, path: &Path, text: &str) -> Result<()>;
    fn get_default_acl(&self, path: &Path) -> Result<Option<String>>;
    fn set_default_acl(&self, path: &Path, text: &str) -> Result<()>;
}

pub struct PosixHostFs;

struct FlockGuard {
    #[allow(dead_code)]
    file: fs::File,
}
impl FileLock for FlockGuard {}

fn io_err(path: &Path, e: io::Error) -> ArchivariusError {
    ArchivariusError::io(path, e)
}

impl HostFs for PosixHostFs {
    fn read_dir(&self, path: &Path) -> Result<Vec<DirEntry>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(path).map_err(|e| io_err(path, e))? {
            let entry = entry.map_err(|e| io_err(path, e))?;
            let file_type = entry.file_type().map_err(|e| io_err(path, e))?;
            let kind = if file_type.is_symlink() {
                EntryKind::Symlink
            } else if file_type.is_dir() {
                EntryKind::Dir
            } else if file_type.is_file() {
                EntryKind::File
            } else {
                EntryKind::Other
            };
            out.push(DirEntry {
                path: entry.path(),
                kind,
            });
        }
        Ok(out)
    }

    fn exists(&self, path: &Path) -> bool {
        path.symlink_metadata().is_ok()
    }

    fn entry_kind(&self, path: &Path) -> Result<EntryKind> {
        let meta = fs::symlink_metadata(path).map_err(|e| io_err(path, e))?;
        let file_type = meta.file_type();
        Ok(if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_dir() {
            EntryKind::Dir
        } else if file_type.is_file() {
            EntryKind::File
        } else {
            EntryKind::Other
        })
    }

    fn last_write_time(&self, path: &Path) -> Result<SystemTime> {
        fs::metadata(path)
            .and_then(|m| m.modified())
            .map_err(|e| io_err(path, e))
    }

    fn file_size(&self, path: &Path) -> Result<u64> {
        fs::metadata(path)
            .map(|m| m.len())
            .map_err(|e| io_err(path, e))
    }

    fn read_symlink(&self, path: &Path) -> Result<PathBuf> {
        fs::read_link(path).map_err(|e| io_err(path, e))
    }

    fn create_symlink(&self, target: &Path, link: &Path) -> Result<()> {
        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(target, link).map_err(|e| io_err(link, e))
        }
        #[cfg(not(unix))]
        {
            let _ = (target, link);
            Err(ArchivariusError::UserInputError(
                "symlinks are not supported on this platform".into(),
            ))
        }
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path).map_err(|e| io_err(path, e))
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        fs::rename(from, to).map_err(|e| io_err(from, e))
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        fs::remove_file(path).map_err(|e| io_err(path, e))
    }

    fn unix_permissions(&self, path: &Path) -> Result<u32> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::symlink_metadata(path)
                .map(|m| m.permissions().mode())
                .map_err(|e| io_err(path, e))
        }
        #[cfg(not(unix))]
        {
            let _ = path;
            Ok(0o644)
        }
    }

    fn set_unix_permissions(&self, path: &Path, mode: u32) -> Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| io_err(path, e))
        }
        #[cfg(not(unix))]
        {
            let _ = (path, mode);
            Ok(())
        }
    }

    fn set_mod_time(&self, path: &Path, time: SystemTime) -> Result<()> {
        let ft = filetime::FileTime::from_system_time(time);
        filetime::set_file_mtime(path, ft).map_err(|e| io_err(path, e))
    }

    fn lock_exclusive(&self, path: &Path) -> Result<Box<dyn FileLock>> {
        use fs4::FileExt;
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| io_err(path, e))?;
        file.try_lock_exclusive()
            .map_err(|_| ArchivariusError::LockHeld {
                path: path.to_path_buf(),
            })?;
        Ok(Box::new(FlockGuard { file }))
    }

    fn sync_all(&self) {
        #[cfg(unix)]
        unsafe {
            libc::sync();
        }
    }

    #[cfg(target_os = "linux")]
    fn get_acl(&self, path: &Path) -> Result<Option<String>> {
        match posix_acl::PosixACL::read_acl(path) {
            Ok(acl) => Ok(Some(acl.as_text())),
            Err(_) => Ok(None),
        }
    }
    #[cfg(not(target_os = "linux"))]
    fn get_acl(&self, _path: &Path) -> Result<Option<String>> {
        Ok(None)
    }

    #[cfg(target_os = "linux")]
    fn set_acl(&self, path: &Path, text: &str) -> Result<()> {
        let mut acl = posix_acl::PosixACL::from_text(text, None)
            .map_err(|e| ArchivariusError::CorruptFile {
                path: path.to_path_buf(),
                detail: format!("invalid ACL text: {e}"),
            })?;
        acl.write_acl(path).map_err(|e| io_err(path, e))
    }
    #[cfg(not(target_os = "linux"))]
    fn set_acl(&self, _path: &Path, _text: &str) -> Result<()> {
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn get_default_acl(&self, path: &Path) -> Result<Option<String>> {
        match posix_acl::PosixACL::read_default_acl(path) {
            Ok(acl) => Ok(Some(acl.as_text())),
            Err(_) => Ok(None),
        }
    }
    #[cfg(not(target_os = "linux"))]
    fn get_default_acl(&self, _path: &Path) -> Result<Option<String>> {
        Ok(None)
    }

    #[cfg(target_os = "linux")]
    fn set_default_acl(&self, path: &Path, text: &str) -> Result<()> {
        let mut acl = posix_acl::PosixACL::from_text(text, None)
            .map_err(|e| ArchivariusError::CorruptFile {
                path: path.to_path_buf(),
                detail: format!("invalid default ACL text: {e}"),
            })?;
        acl.write_default_acl(path).map_err(|e| io_err(path, e))
    }
    #[cfg(not(target_os = "linux"))]
    fn set_default_acl(&self, _path: &Path, _text: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exists_reports_false_for_missing_path() {
        let host = PosixHostFs;
        assert!(!host.exists(Path::new("/does/not/exist/hopefully")));
    }

    #[test]
    fn round_trip_dir_listing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("b")).unwrap();
        let host = PosixHostFs;
        let mut entries = host.read_dir(dir.path()).unwrap();
        entries.sort_by_key(|e| e.path.clone());
        assert_eq!(entries.len(), 2);
    }
}
