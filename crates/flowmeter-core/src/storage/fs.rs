//! Minimal file system seam for the file-based backends

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use log::debug;

use crate::error::StoreError;

/// The handful of file operations the file-based backends need.
///
/// Paths are plain names relative to whatever root the implementation was
/// opened on.
pub trait FileSystem {
    /// Read a whole file.
    fn read(&mut self, path: &str) -> Result<Vec<u8>, StoreError>;

    /// Create or truncate `path` and write `data`, durably.
    fn write(&mut self, path: &str, data: &[u8]) -> Result<(), StoreError>;

    /// Move `from` over `to`.
    fn rename(&mut self, from: &str, to: &str) -> Result<(), StoreError>;

    fn remove(&mut self, path: &str) -> Result<(), StoreError>;

    /// Whether `rename` replaces an existing target atomically.
    fn atomic_rename(&self) -> bool {
        true
    }

    /// Read at most `buf.len()` bytes from the start of `path`.
    fn read_into(&mut self, path: &str, buf: &mut [u8]) -> Result<usize, StoreError> {
        let data = self.read(path)?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }
}

/// Replace the contents of `path` so that a power cut leaves either the old
/// or the new file, never a torn one.
///
/// File systems without an atomic rename get a plain overwrite.
pub fn replace_file<F>(fs: &mut F, path: &str, data: &[u8]) -> Result<(), StoreError>
where
    F: FileSystem + ?Sized,
{
    if !fs.atomic_rename() {
        debug!("No atomic rename available, overwriting {} in place", path);
        return fs.write(path, data);
    }

    let tmp = format!("{path}.tmp");
    fs.write(&tmp, data)?;
    fs.rename(&tmp, path)
}

/// RAM-backed file system for tests and simulations.
#[derive(Debug, Default)]
pub struct MemoryFs {
    files: BTreeMap<String, Vec<u8>>,
    writes: usize,
    fail_writes: bool,
    no_rename: bool,
}

impl MemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Contents of `path`, if it exists
    pub fn file(&self, path: &str) -> Option<&[u8]> {
        self.files.get(path).map(Vec::as_slice)
    }

    /// Put a file in place without counting it as a write
    pub fn insert(&mut self, path: &str, data: &[u8]) {
        self.files.insert(path.to_string(), data.to_vec());
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    /// Number of successful `write` calls so far
    pub fn writes(&self) -> usize {
        self.writes
    }

    /// Make every subsequent write fail, as a full or removed card would.
    pub fn set_fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    /// Behave like a card without rename support: `rename` fails and
    /// [`FileSystem::atomic_rename`] reports `false`.
    pub fn set_atomic_rename(&mut self, atomic: bool) {
        self.no_rename = !atomic;
    }
}

impl FileSystem for MemoryFs {
    fn read(&mut self, path: &str) -> Result<Vec<u8>, StoreError> {
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| StoreError::MediaUnavailable(format!("{path}: no such file")))
    }

    fn write(&mut self, path: &str, data: &[u8]) -> Result<(), StoreError> {
        if self.fail_writes {
            return Err(StoreError::Write(format!("{path}: write refused")));
        }
        self.files.insert(path.to_string(), data.to_vec());
        self.writes += 1;
        Ok(())
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<(), StoreError> {
        if self.no_rename {
            return Err(StoreError::Write(format!("cannot rename {from} to {to}")));
        }
        let data = self
            .files
            .remove(from)
            .ok_or_else(|| StoreError::Write(format!("{from}: no such file")))?;
        self.files.insert(to.to_string(), data);
        Ok(())
    }

    fn remove(&mut self, path: &str) -> Result<(), StoreError> {
        self.files.remove(path);
        Ok(())
    }

    fn atomic_rename(&self) -> bool {
        !self.no_rename
    }
}

#[cfg(feature = "std")]
pub use host::StdFs;

#[cfg(feature = "std")]
mod host {
    use alloc::format;
    use alloc::vec::Vec;
    use std::fs::{self, File};
    use std::io::{self, Write};
    use std::path::{Path, PathBuf};

    use super::FileSystem;
    use crate::error::StoreError;

    /// Files under a root directory of the host file system.
    #[derive(Debug, Clone)]
    pub struct StdFs {
        root: PathBuf,
    }

    impl StdFs {
        pub fn new(root: impl Into<PathBuf>) -> Self {
            Self { root: root.into() }
        }

        pub fn root(&self) -> &Path {
            &self.root
        }

        fn path(&self, name: &str) -> PathBuf {
            self.root.join(name)
        }
    }

    impl FileSystem for StdFs {
        fn read(&mut self, path: &str) -> Result<Vec<u8>, StoreError> {
            fs::read(self.path(path))
                .map_err(|e| StoreError::MediaUnavailable(format!("{path}: {e}")))
        }

        fn write(&mut self, path: &str, data: &[u8]) -> Result<(), StoreError> {
            let write = || -> io::Result<()> {
                fs::create_dir_all(&self.root)?;
                let mut file = File::create(self.path(path))?;
                file.write_all(data)?;
                file.sync_all()
            };
            write().map_err(|e| StoreError::Write(format!("{path}: {e}")))
        }

        fn rename(&mut self, from: &str, to: &str) -> Result<(), StoreError> {
            fs::rename(self.path(from), self.path(to))
                .map_err(|e| StoreError::Write(format!("{from} -> {to}: {e}")))
        }

        fn remove(&mut self, path: &str) -> Result<(), StoreError> {
            match fs::remove_file(self.path(path)) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => {
                    Err(StoreError::Write(format!("{path}: {e}")))
                }
                _ => Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_file_leaves_no_temp_file() {
        let mut fs = MemoryFs::new();
        replace_file(&mut fs, "state", b"one").unwrap();
        replace_file(&mut fs, "state", b"two").unwrap();

        assert_eq!(fs.file("state"), Some(&b"two"[..]));
        assert!(!fs.contains("state.tmp"));
    }

    #[test]
    fn failed_temp_write_keeps_old_contents() {
        let mut fs = MemoryFs::new();
        fs.insert("state", b"old");
        fs.set_fail_writes(true);

        assert!(replace_file(&mut fs, "state", b"new").is_err());
        assert_eq!(fs.file("state"), Some(&b"old"[..]));
    }

    #[test]
    fn without_rename_overwrites_in_place() {
        let mut fs = MemoryFs::new();
        fs.set_atomic_rename(false);
        replace_file(&mut fs, "state", b"first").unwrap();
        replace_file(&mut fs, "state", b"two").unwrap();

        assert_eq!(fs.file("state"), Some(&b"two"[..]));
        assert!(!fs.contains("state.tmp"));
        assert_eq!(fs.writes(), 2);
    }

    #[test]
    fn read_into_truncates_to_buffer() {
        let mut fs = MemoryFs::new();
        fs.insert("long", b"0123456789");
        let mut buf = [0u8; 4];
        assert_eq!(fs.read_into("long", &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"0123");
    }

    #[test]
    fn missing_file_is_media_unavailable() {
        let mut fs = MemoryFs::new();
        assert!(matches!(
            fs.read("nope"),
            Err(StoreError::MediaUnavailable(_))
        ));
    }

    #[cfg(feature = "std")]
    #[test]
    fn std_fs_replaces_atomically() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut fs = StdFs::new(dir.path());

        replace_file(&mut fs, "state", b"first").unwrap();
        replace_file(&mut fs, "state", b"second").unwrap();

        assert_eq!(fs.read("state").unwrap(), b"second");
        assert!(!dir.path().join("state.tmp").exists());
    }
}
