//! Fault-injecting filesystem for crash and disk-failure tests.
//!
//! [`FaultFs`] wraps [`ProductionFs`] and adds three capabilities:
//!
//! - **Injected failures**: reads, writes, or syncs on files whose path
//!   contains a configured substring fail with an I/O error.
//! - **Hold-until-sync buffering**: writes to matching files are kept in
//!   memory until `sync_all` flushes them, so [`FaultFs::crash`] can model a
//!   power cut that loses everything after the last fsync.
//! - **Disrupt flags**: named booleans the engine probes via
//!   [`HostFs::disrupt`] to pause or derail itself at points a test cares
//!   about.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};

use crate::{HostFile, HostFs, ProductionFs};

#[derive(Default)]
struct FaultState {
    fail_reads: Vec<String>,
    fail_writes: Vec<String>,
    fail_syncs: Vec<String>,
    hold_unsynced: Vec<String>,
    disrupts: HashSet<String>,
    files: Vec<Weak<FaultFile>>,
}

impl FaultState {
    fn matches(patterns: &[String], path: &Path) -> bool {
        let p = path.to_string_lossy();
        patterns.iter().any(|pat| p.contains(pat.as_str()))
    }
}

/// Shared handle for configuring faults from a test while the engine runs.
#[derive(Clone)]
pub struct FaultFs {
    inner: ProductionFs,
    state: Arc<Mutex<FaultState>>,
}

impl FaultFs {
    pub fn new() -> Self {
        Self {
            inner: ProductionFs,
            state: Arc::new(Mutex::new(FaultState::default())),
        }
    }

    /// Reads on paths containing `pat` fail until cleared.
    pub fn fail_reads(&self, pat: &str) {
        self.state.lock().unwrap().fail_reads.push(pat.to_string());
    }

    /// Writes on paths containing `pat` fail until cleared.
    pub fn fail_writes(&self, pat: &str) {
        self.state.lock().unwrap().fail_writes.push(pat.to_string());
    }

    /// Syncs on paths containing `pat` fail until cleared.
    pub fn fail_syncs(&self, pat: &str) {
        self.state.lock().unwrap().fail_syncs.push(pat.to_string());
    }

    /// Buffer writes to paths containing `pat` in memory until `sync_all`.
    pub fn hold_unsynced(&self, pat: &str) {
        self.state
            .lock()
            .unwrap()
            .hold_unsynced
            .push(pat.to_string());
    }

    /// Arm or clear a disrupt flag.
    pub fn set_disrupt(&self, tag: &str, armed: bool) {
        let mut st = self.state.lock().unwrap();
        if armed {
            st.disrupts.insert(tag.to_string());
        } else {
            st.disrupts.remove(tag);
        }
    }

    /// Drop all injected failures and disrupt flags (held buffers survive).
    pub fn clear_faults(&self) {
        let mut st = self.state.lock().unwrap();
        st.fail_reads.clear();
        st.fail_writes.clear();
        st.fail_syncs.clear();
        st.disrupts.clear();
    }

    /// Simulate power loss: every write buffered since the last successful
    /// `sync_all` on a held file is discarded.
    pub fn crash(&self) {
        let files: Vec<Arc<FaultFile>> = {
            let mut st = self.state.lock().unwrap();
            st.files.retain(|w| w.strong_count() > 0);
            st.files.iter().filter_map(Weak::upgrade).collect()
        };
        for f in files {
            let dropped = {
                let mut pending = f.pending.lock().unwrap();
                let n = pending.len();
                pending.clear();
                n
            };
            if dropped > 0 {
                tracing::debug!(path = %f.path.display(), dropped, "crash dropped unsynced writes");
            }
        }
    }

    fn wrap(&self, path: &Path, file: Arc<dyn HostFile>) -> Arc<dyn HostFile> {
        let wrapped = Arc::new(FaultFile {
            inner: file,
            path: path.to_path_buf(),
            state: Arc::clone(&self.state),
            pending: Mutex::new(Vec::new()),
        });
        self.state
            .lock()
            .unwrap()
            .files
            .push(Arc::downgrade(&wrapped));
        wrapped
    }
}

impl Default for FaultFs {
    fn default() -> Self {
        Self::new()
    }
}

struct FaultFile {
    inner: Arc<dyn HostFile>,
    path: PathBuf,
    state: Arc<Mutex<FaultState>>,
    /// Writes held back until sync, oldest first.
    pending: Mutex<Vec<(u64, Vec<u8>)>>,
}

fn injected(what: &str, path: &Path) -> io::Error {
    io::Error::other(format!("injected {what} failure: {}", path.display()))
}

impl FaultFile {
    fn held(&self) -> bool {
        let st = self.state.lock().unwrap();
        FaultState::matches(&st.hold_unsynced, &self.path)
    }
}

impl HostFile for FaultFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        {
            let st = self.state.lock().unwrap();
            if FaultState::matches(&st.fail_reads, &self.path) {
                return Err(injected("read", &self.path));
            }
        }
        let pending = self.pending.lock().unwrap();
        if pending.is_empty() {
            return self.inner.read_at(buf, offset);
        }
        // Read-your-writes over the held buffer: base bytes from the inner
        // file where it has them, zeros past its end, then overlay pending
        // ranges that intersect the request.
        let inner_len = self.inner.len()?;
        let base = (inner_len.saturating_sub(offset)).min(buf.len() as u64) as usize;
        if base > 0 {
            self.inner.read_at(&mut buf[..base], offset)?;
        }
        buf[base..].fill(0);
        let req_end = offset + buf.len() as u64;
        for (woff, data) in pending.iter() {
            let woff = *woff;
            let wend = woff + data.len() as u64;
            if wend <= offset || woff >= req_end {
                continue;
            }
            let start = woff.max(offset);
            let end = wend.min(req_end);
            let dst = (start - offset) as usize;
            let src = (start - woff) as usize;
            let n = (end - start) as usize;
            buf[dst..dst + n].copy_from_slice(&data[src..src + n]);
        }
        Ok(())
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        {
            let st = self.state.lock().unwrap();
            if FaultState::matches(&st.fail_writes, &self.path) {
                return Err(injected("write", &self.path));
            }
        }
        if self.held() {
            self.pending
                .lock()
                .unwrap()
                .push((offset, buf.to_vec()));
            return Ok(());
        }
        self.inner.write_at(buf, offset)
    }

    fn set_len(&self, len: u64) -> io::Result<()> {
        let mut pending = self.pending.lock().unwrap();
        pending.retain(|(off, _)| *off < len);
        for (off, data) in pending.iter_mut() {
            let keep = (len - *off).min(data.len() as u64) as usize;
            data.truncate(keep);
        }
        drop(pending);
        self.inner.set_len(len)
    }

    fn sync_all(&self) -> io::Result<()> {
        {
            let st = self.state.lock().unwrap();
            if FaultState::matches(&st.fail_syncs, &self.path) {
                return Err(injected("sync", &self.path));
            }
        }
        let drained: Vec<(u64, Vec<u8>)> = std::mem::take(&mut *self.pending.lock().unwrap());
        for (off, data) in &drained {
            self.inner.write_at(data, *off)?;
        }
        self.inner.sync_all()
    }

    fn len(&self) -> io::Result<u64> {
        let inner_len = self.inner.len()?;
        let pending = self.pending.lock().unwrap();
        let held_end = pending
            .iter()
            .map(|(off, data)| off + data.len() as u64)
            .max()
            .unwrap_or(0);
        Ok(inner_len.max(held_end))
    }
}

impl HostFs for FaultFs {
    fn create(&self, path: &Path) -> io::Result<Arc<dyn HostFile>> {
        let file = self.inner.create(path)?;
        Ok(self.wrap(path, file))
    }

    fn open(&self, path: &Path) -> io::Result<Arc<dyn HostFile>> {
        {
            let st = self.state.lock().unwrap();
            if FaultState::matches(&st.fail_reads, path) {
                return Err(injected("open", path));
            }
        }
        let file = self.inner.open(path)?;
        Ok(self.wrap(path, file))
    }

    fn mkdir_all(&self, path: &Path) -> io::Result<()> {
        self.inner.mkdir_all(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        self.inner.rename(from, to)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        self.inner.remove_file(path)
    }

    fn exists(&self, path: &Path) -> bool {
        self.inner.exists(path)
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        {
            let st = self.state.lock().unwrap();
            if FaultState::matches(&st.fail_reads, path) {
                return Err(injected("read", path));
            }
        }
        self.inner.read(path)
    }

    fn sync_dir(&self, path: &Path) -> io::Result<()> {
        self.inner.sync_dir(path)
    }

    fn free_space(&self, path: &Path) -> io::Result<u64> {
        self.inner.free_space(path)
    }

    fn disrupt(&self, tag: &str) -> bool {
        self.state.lock().unwrap().disrupts.contains(tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_injected_read_failure() {
        let dir = TempDir::new().unwrap();
        let fs = FaultFs::new();
        let path = dir.path().join("victim.dat");
        let file = fs.create(&path).unwrap();
        file.write_at(b"data", 0).unwrap();

        fs.fail_reads("victim");
        let mut buf = [0u8; 4];
        assert!(file.read_at(&mut buf, 0).is_err());

        fs.clear_faults();
        file.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"data");
    }

    #[test]
    fn test_hold_until_sync_then_crash_discards() {
        let dir = TempDir::new().unwrap();
        let fs = FaultFs::new();
        fs.hold_unsynced("journal");
        let path = dir.path().join("journal.bin");
        let file = fs.create(&path).unwrap();

        file.write_at(b"synced", 0).unwrap();
        file.sync_all().unwrap();
        file.write_at(b"doomed", 6).unwrap();

        // Read-your-writes before the crash.
        let mut buf = [0u8; 12];
        file.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"synceddoomed");

        fs.crash();
        assert_eq!(file.len().unwrap(), 6);
        let mut buf = [0u8; 6];
        file.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"synced");
    }

    #[test]
    fn test_sync_flushes_held_writes() {
        let dir = TempDir::new().unwrap();
        let fs = FaultFs::new();
        fs.hold_unsynced("wal");
        let path = dir.path().join("wal.bin");
        let file = fs.create(&path).unwrap();

        file.write_at(b"abc", 0).unwrap();
        file.sync_all().unwrap();
        fs.crash();

        // The flushed bytes survive the crash.
        let mut buf = [0u8; 3];
        file.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"abc");
    }

    #[test]
    fn test_disrupt_flags() {
        let fs = FaultFs::new();
        assert!(!fs.disrupt("haltCommit"));
        fs.set_disrupt("haltCommit", true);
        assert!(fs.disrupt("haltCommit"));
        fs.set_disrupt("haltCommit", false);
        assert!(!fs.disrupt("haltCommit"));
    }
}
