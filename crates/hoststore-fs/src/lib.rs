//! # hoststore-fs
//!
//! Filesystem capability surface for the hoststore engine.
//!
//! The engine performs every disk access through the [`HostFs`] and
//! [`HostFile`] traits rather than calling `std::fs` directly. This keeps the
//! storage code testable: the production implementation is a thin shim over
//! the standard library, while [`fault::FaultFs`] injects read/write/sync
//! failures, simulates power loss by discarding unsynced writes, and answers
//! `disrupt` probes that the engine sprinkles at interesting points.
//!
//! The [`atomic_replace`] helper implements the write-tmp → fsync → rename →
//! parent-dir-fsync sequence used for every small document the engine
//! replaces whole (settings, folder metadata rebuilds).

pub mod fault;

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// Positioned I/O on one open file.
///
/// All methods take `&self`; implementations must be safe to share across
/// threads (positioned reads and writes do not touch a shared cursor).
pub trait HostFile: Send + Sync {
    /// Read exactly `buf.len()` bytes at `offset`.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()>;
    /// Write all of `buf` at `offset`.
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()>;
    /// Truncate or extend the file to `len` bytes.
    fn set_len(&self, len: u64) -> io::Result<()>;
    /// Flush file contents and metadata to the physical device.
    fn sync_all(&self) -> io::Result<()>;
    /// Current file length in bytes.
    fn len(&self) -> io::Result<u64>;
}

/// Filesystem primitives plus the clockless test hooks.
pub trait HostFs: Send + Sync {
    /// Create (truncating any existing file) and open read-write.
    fn create(&self, path: &Path) -> io::Result<Arc<dyn HostFile>>;
    /// Open an existing file read-write.
    fn open(&self, path: &Path) -> io::Result<Arc<dyn HostFile>>;
    fn mkdir_all(&self, path: &Path) -> io::Result<()>;
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
    fn remove_file(&self, path: &Path) -> io::Result<()>;
    fn exists(&self, path: &Path) -> bool;
    /// Read a whole small file into memory.
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;
    /// fsync a directory so a completed rename inside it is durable.
    fn sync_dir(&self, path: &Path) -> io::Result<()>;
    /// Bytes available to unprivileged writers on the filesystem holding
    /// `path`.
    fn free_space(&self, path: &Path) -> io::Result<u64>;

    /// Test hook. Production implementations always answer `false`; the
    /// fault implementation answers `true` for armed tags, letting tests
    /// steer the engine into rarely-taken paths.
    fn disrupt(&self, _tag: &str) -> bool {
        false
    }
}

/// Monotonic clock, injectable for tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Production clock backed by `Instant::now`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Production filesystem: `std::fs` plus `statvfs` for free-space probes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProductionFs;

struct StdFile(File);

impl HostFile for StdFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.0.read_exact_at(buf, offset)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.0.write_all_at(buf, offset)
    }

    fn set_len(&self, len: u64) -> io::Result<()> {
        self.0.set_len(len)
    }

    fn sync_all(&self) -> io::Result<()> {
        self.0.sync_all()
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.0.metadata()?.len())
    }
}

impl HostFs for ProductionFs {
    fn create(&self, path: &Path) -> io::Result<Arc<dyn HostFile>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Arc::new(StdFile(file)))
    }

    fn open(&self, path: &Path) -> io::Result<Arc<dyn HostFile>> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Arc::new(StdFile(file)))
    }

    fn mkdir_all(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(path)
    }

    fn sync_dir(&self, path: &Path) -> io::Result<()> {
        File::open(path)?.sync_all()
    }

    fn free_space(&self, path: &Path) -> io::Result<u64> {
        use std::os::unix::ffi::OsStrExt;
        let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))?;
        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
    }
}

/// Atomically replace the file at `path` with `data`.
///
/// Writes `path.tmp`, fsyncs it, renames it over `path`, then fsyncs the
/// parent directory so the rename itself survives power loss.
pub fn atomic_replace(fs: &dyn HostFs, path: &Path, data: &[u8]) -> io::Result<()> {
    let tmp = tmp_path(path);
    let file = fs.create(&tmp)?;
    file.write_at(data, 0)?;
    file.sync_all()?;
    drop(file);
    if let Err(e) = fs.rename(&tmp, path) {
        let _ = fs.remove_file(&tmp);
        return Err(e);
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs.sync_dir(parent)?;
        }
    }
    tracing::debug!(path = %path.display(), bytes = data.len(), "atomic replace");
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(std::ffi::OsString::from)
        .unwrap_or_else(|| std::ffi::OsString::from("replace"));
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_write_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let fs = ProductionFs;
        let path = dir.path().join("blob.dat");

        let file = fs.create(&path).unwrap();
        file.write_at(b"hello positioned io", 0).unwrap();
        file.write_at(b"HELLO", 6).unwrap();

        let mut buf = [0u8; 19];
        file.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"hello HELLOioned io");
    }

    #[test]
    fn test_set_len_extends_with_zeros() {
        let dir = TempDir::new().unwrap();
        let fs = ProductionFs;
        let file = fs.create(&dir.path().join("sparse.dat")).unwrap();
        file.set_len(4096).unwrap();
        assert_eq!(file.len().unwrap(), 4096);

        let mut buf = [0xFFu8; 16];
        file.read_at(&mut buf, 2048).unwrap();
        assert_eq!(buf, [0u8; 16]);
    }

    #[test]
    fn test_atomic_replace_swaps_content() {
        let dir = TempDir::new().unwrap();
        let fs = ProductionFs;
        let path = dir.path().join("doc.json");

        atomic_replace(&fs, &path, b"v1").unwrap();
        assert_eq!(fs.read(&path).unwrap(), b"v1");

        atomic_replace(&fs, &path, b"version two").unwrap();
        assert_eq!(fs.read(&path).unwrap(), b"version two");

        // No stray tmp file left behind.
        assert!(!fs.exists(&dir.path().join("doc.json.tmp")));
    }

    #[test]
    fn test_free_space_reports_nonzero() {
        let dir = TempDir::new().unwrap();
        let fs = ProductionFs;
        assert!(fs.free_space(dir.path()).unwrap() > 0);
    }

    #[test]
    fn test_open_missing_file_errors() {
        let dir = TempDir::new().unwrap();
        let fs = ProductionFs;
        assert!(fs.open(&dir.path().join("nope")).is_err());
    }
}
