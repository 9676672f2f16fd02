//! Write-ahead log: the engine's serialization point.
//!
//! The WAL owns the single mutex protecting all mutable in-memory state:
//! the folders map, the sector location index, the pending-entry buffer and
//! the sequence counter. Mutators hold the lock only for short sections; the
//! one piece of I/O performed under it is the log append itself.
//!
//! Entries appended to the file are *visible* (the in-memory state already
//! reflects them) but not *durable* until the sync loop writes and fsyncs a
//! commit record covering them. Callers that need durability block on
//! [`Wal::wait_commit`]; readers are allowed to observe uncommitted state,
//! which a crash would roll back without ever leaving accounting torn.
//!
//! Any I/O failure on the WAL file or the settings document is fatal: the
//! engine logs and panics, and the next boot recovers from the durable
//! prefix of the log. Failures on storage folder files are never fatal; the
//! folder is marked unavailable and the engine keeps running.

pub mod entry;
pub mod recovery;
pub mod sync_loop;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use tracing::error;

use hoststore_fs::{HostFile, HostFs};

use crate::error::{Result, StoreError};
use crate::folder::{Progress, StorageFolder};
use crate::index::{SectorId, SectorLocation};
use crate::settings::{FolderSettings, Settings};
use crate::SETTINGS_FILE;

use entry::{frame_commit, frame_entry, WalEntry, COMMIT_RECORD_LEN, WAL_HEADER_LEN};

/// Pending-entry count that nudges the sync loop ahead of its timer.
pub const PRESSURE_ENTRIES: usize = 128;

/// One appended-but-uncommitted entry.
pub struct PendingEntry {
    pub seq: u64,
    pub entry: WalEntry,
    pub payload: Vec<u8>,
}

/// A folder addition still writing out its files; shown in snapshots.
pub struct BuildingFolder {
    pub id: u16,
    pub path: PathBuf,
    pub capacity: u32,
    pub progress: Arc<Progress>,
}

pub struct WalState {
    pub file: Option<Arc<dyn HostFile>>,
    /// Append offset; the file tail.
    pub file_len: u64,
    pub next_seq: u64,
    pub committed_seq: u64,
    pub pending: Vec<PendingEntry>,
    pub folders: HashMap<u16, Arc<StorageFolder>>,
    pub locations: HashMap<SectorId, SectorLocation>,
    /// Folders whose sector files carry unsynced payloads.
    pub touched: HashSet<u16>,
    /// Folders with a structural operation (grow/shrink/remove) in flight.
    pub busy: HashSet<u16>,
    pub settings_version: u64,
    pub settings_dirty: bool,
    /// Folders removed from the map whose files await deletion at apply.
    pub retiring: Vec<(u16, Arc<StorageFolder>)>,
    pub building: Vec<BuildingFolder>,
    pub shutdown: bool,
    pub loop_exited: bool,
}

pub struct Wal {
    pub fs: Arc<dyn HostFs>,
    pub persist_dir: PathBuf,
    pub sector_size: u32,
    pub salt: [u8; 32],
    pub state: Mutex<WalState>,
    /// Signalled when `committed_seq` advances (and when the loop exits).
    pub commit_cv: Condvar,
    /// Signalled to nudge the sync loop out of its timed wait.
    pub loop_cv: Condvar,
}

impl Wal {
    pub fn new(
        fs: Arc<dyn HostFs>,
        persist_dir: PathBuf,
        sector_size: u32,
        salt: [u8; 32],
    ) -> Wal {
        Wal {
            fs,
            persist_dir,
            sector_size,
            salt,
            state: Mutex::new(WalState {
                file: None,
                file_len: WAL_HEADER_LEN,
                next_seq: 1,
                committed_seq: 0,
                pending: Vec::new(),
                folders: HashMap::new(),
                locations: HashMap::new(),
                touched: HashSet::new(),
                busy: HashSet::new(),
                settings_version: 0,
                settings_dirty: false,
                retiring: Vec::new(),
                building: Vec::new(),
                shutdown: false,
                loop_exited: false,
            }),
            commit_cv: Condvar::new(),
            loop_cv: Condvar::new(),
        }
    }

    pub fn lock_state(&self) -> MutexGuard<'_, WalState> {
        self.state.lock().unwrap()
    }

    /// Control-disk failures are unrecoverable by policy.
    fn fatal(&self, context: &str, err: &dyn std::fmt::Display) -> ! {
        error!(%err, "{context}");
        panic!("{context}: {err}");
    }

    /// Append one transaction's entries to the log tail (unsynced) and make
    /// them visible as pending. Returns the transaction's sequence number.
    ///
    /// The caller holds the state lock and has already mutated the in-memory
    /// folders/locations to match `entries`.
    pub fn append_txn(&self, st: &mut WalState, entries: &[WalEntry]) -> u64 {
        debug_assert!(!entries.is_empty());
        let seq = st.next_seq;
        st.next_seq += 1;

        let mut frames = Vec::new();
        for e in entries {
            let payload = e.encode();
            frames.extend_from_slice(&frame_entry(&payload));
            st.pending.push(PendingEntry {
                seq,
                entry: e.clone(),
                payload,
            });
        }
        let file = st.file.clone().expect("wal file not open");
        if let Err(err) = file.write_at(&frames, st.file_len) {
            self.fatal("append to write-ahead log failed", &err);
        }
        st.file_len += frames.len() as u64;

        if st.pending.len() >= PRESSURE_ENTRIES {
            self.loop_cv.notify_all();
        }
        seq
    }

    /// Block until the transaction `seq` is covered by a commit record.
    pub fn wait_commit(&self, seq: u64) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        while st.committed_seq < seq {
            if st.loop_exited {
                return Err(StoreError::Stopped);
            }
            st = self.commit_cv.wait(st).unwrap();
        }
        Ok(())
    }

    /// One pass of the commit protocol. Runs on the sync loop thread (and
    /// once more during shutdown).
    pub fn commit(&self) {
        let (batch, touched, file, record_off) = {
            let mut st = self.lock_state();
            if st.pending.is_empty() {
                if st.settings_dirty {
                    drop(st);
                    self.flush_settings();
                    let mut st = self.lock_state();
                    self.maybe_truncate_locked(&mut st);
                } else {
                    self.maybe_truncate_locked(&mut st);
                }
                return;
            }
            let batch = std::mem::take(&mut st.pending);
            let touched_ids: Vec<u16> = st.touched.drain().collect();
            let touched: Vec<Arc<StorageFolder>> = touched_ids
                .iter()
                .filter_map(|id| st.folders.get(id).cloned())
                .collect();
            let file = st.file.clone().expect("wal file not open");
            let record_off = st.file_len;
            st.file_len += COMMIT_RECORD_LEN;
            (batch, touched, file, record_off)
        };

        // Payloads first: the commit record must never cover sector data
        // that is still only in the page cache.
        for folder in &touched {
            let _ = folder.sync_sectors();
        }

        let seq_hi = batch.last().map(|p| p.seq).unwrap_or(0);
        let mut hasher = crc32fast::Hasher::new();
        for p in &batch {
            hasher.update(&p.payload);
        }
        let record = frame_commit(seq_hi, hasher.finalize());
        if let Err(err) = file.write_at(&record, record_off) {
            self.fatal("write of commit record failed", &err);
        }
        if let Err(err) = file.sync_all() {
            self.fatal("fsync of write-ahead log failed", &err);
        }

        // Durable: release waiters before the slower materialization below.
        {
            let mut st = self.lock_state();
            st.committed_seq = seq_hi;
        }
        self.commit_cv.notify_all();

        // Materialize into folder metadata.
        let mut applied: HashMap<u16, Arc<StorageFolder>> = HashMap::new();
        for p in &batch {
            self.apply_entry(&p.entry, &mut applied);
        }
        for folder in applied.values() {
            let _ = folder.sync_metadata();
        }

        let dirty = {
            let st = self.lock_state();
            st.settings_dirty
        };
        if dirty {
            self.flush_settings();
        }

        let mut st = self.lock_state();
        self.maybe_truncate_locked(&mut st);
    }

    /// Materialize one committed entry into the owning folder's metadata
    /// file. Folder-file failures mark the folder unavailable and are
    /// otherwise tolerated.
    fn apply_entry(&self, e: &WalEntry, applied: &mut HashMap<u16, Arc<StorageFolder>>) {
        let folder_of = |id: u16| -> Option<Arc<StorageFolder>> {
            self.lock_state().folders.get(&id).cloned()
        };
        match e {
            WalEntry::AddSector {
                id,
                folder,
                index,
                count,
            }
            | WalEntry::RemoveSector {
                id,
                folder,
                index,
                count,
            } if *count > 0 => {
                if let Some(f) = folder_of(*folder) {
                    let _ = f.apply_set_slot(*index, *id, *count);
                    applied.insert(*folder, f);
                }
            }
            WalEntry::RemoveSector { folder, index, .. } => {
                if let Some(f) = folder_of(*folder) {
                    // Plain removals keep their in-memory bit set until this
                    // point so an uncommitted free can never be recycled and
                    // overwritten, then rolled back by a crash into a slot
                    // whose payload is gone. Shrink relocations clear their
                    // bits at append time instead; their slots sit past the
                    // already-shrunk capacity, hence the bounds check.
                    {
                        let mut usage = f.usage.lock().unwrap();
                        if *index < usage.capacity && usage.is_set(*index) {
                            usage.clear(*index);
                        }
                    }
                    let _ = f.apply_clear_slot(*index);
                    applied.insert(*folder, f);
                }
            }
            WalEntry::AddFolder { .. } | WalEntry::GrowFolder { .. } => {
                // Folder files were built and fsynced before the entry was
                // appended; only the settings document still needs updating.
                self.lock_state().settings_dirty = true;
            }
            WalEntry::ShrinkFolder {
                folder,
                new_capacity,
            } => {
                if let Some(f) = folder_of(*folder) {
                    let _ = f.rebuild_metadata(self.fs.as_ref(), *new_capacity);
                    let _ = f.truncate_data(*new_capacity);
                    applied.insert(*folder, f);
                }
                self.lock_state().settings_dirty = true;
            }
            WalEntry::RemoveFolder { folder, .. } => {
                let retired = {
                    let mut st = self.lock_state();
                    st.settings_dirty = true;
                    let pos = st.retiring.iter().position(|(id, _)| id == folder);
                    pos.map(|i| st.retiring.remove(i).1)
                };
                if let Some(f) = retired {
                    f.delete_files(self.fs.as_ref());
                }
            }
            WalEntry::UpdateSettings { .. } => {
                self.lock_state().settings_dirty = true;
            }
            WalEntry::AddSector { .. } => unreachable!("add sector always has count >= 1"),
        }
    }

    /// Build the settings document from current state and replace the file.
    /// Fatal on failure.
    pub fn flush_settings(&self) {
        let doc = {
            let st = self.lock_state();
            self.settings_doc_locked(&st)
        };
        let path = self.persist_dir.join(SETTINGS_FILE);
        if let Err(err) = doc.save(self.fs.as_ref(), &path) {
            self.fatal("write of settings document failed", &err);
        }
        let mut st = self.lock_state();
        st.settings_version = doc.version;
        st.settings_dirty = false;
    }

    pub fn settings_doc_locked(&self, st: &WalState) -> Settings {
        let mut folders: Vec<FolderSettings> = st
            .folders
            .values()
            .map(|f| FolderSettings {
                id: f.id,
                path: f.path.clone(),
                capacity: f.usage.lock().unwrap().capacity,
            })
            .collect();
        folders.sort_by_key(|f| f.id);
        Settings {
            version: st.settings_version + 1,
            sector_salt: self.salt,
            sector_size: self.sector_size,
            folders,
        }
    }

    /// Truncate the log back to its header once everything in it has been
    /// committed and materialized. Skipped whenever new entries have raced
    /// in behind the last commit.
    fn maybe_truncate_locked(&self, st: &mut MutexGuard<'_, WalState>) {
        if !st.pending.is_empty() || st.file_len == WAL_HEADER_LEN {
            return;
        }
        let file = match &st.file {
            Some(f) => Arc::clone(f),
            None => return,
        };
        if let Err(err) = file.set_len(WAL_HEADER_LEN) {
            self.fatal("truncate of write-ahead log failed", &err);
        }
        st.file_len = WAL_HEADER_LEN;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::folder::{Progress, StorageFolder};
    use crate::settings::Settings;
    use crate::thread_group::ThreadGroup;
    use hoststore_fs::ProductionFs;
    use std::path::Path;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    const SECTOR: u32 = 4096;

    fn new_wal(persist: &Path) -> Arc<Wal> {
        let fs: Arc<dyn HostFs> = Arc::new(ProductionFs);
        fs.mkdir_all(persist).unwrap();
        let settings = Settings::bootstrap(SECTOR);
        settings
            .save(fs.as_ref(), &persist.join(SETTINGS_FILE))
            .unwrap();
        let wal = Arc::new(Wal::new(
            Arc::clone(&fs),
            persist.to_path_buf(),
            SECTOR,
            settings.sector_salt,
        ));
        wal.load(&settings).unwrap();
        wal
    }

    fn with_folder(wal: &Wal, dir: &TempDir) -> Arc<StorageFolder> {
        let folder = StorageFolder::create(
            &ProductionFs,
            0,
            &dir.path().join("f0"),
            64,
            SECTOR,
            &ThreadGroup::new().stop_signal(),
            &Progress::default(),
        )
        .unwrap();
        wal.lock_state().folders.insert(0, Arc::clone(&folder));
        folder
    }

    #[test]
    fn test_commit_materializes_and_truncates() {
        let dir = TempDir::new().unwrap();
        let wal = new_wal(&dir.path().join("persist"));
        let folder = with_folder(&wal, &dir);

        let id = SectorId([9u8; 12]);
        let seq = {
            let mut st = wal.lock_state();
            folder.usage.lock().unwrap().set(3);
            st.locations.insert(
                id,
                SectorLocation {
                    folder: 0,
                    index: 3,
                    count: 1,
                },
            );
            wal.append_txn(
                &mut st,
                &[WalEntry::AddSector {
                    id,
                    folder: 0,
                    index: 3,
                    count: 1,
                }],
            )
        };
        assert_eq!(seq, 1);
        {
            let st = wal.lock_state();
            assert!(st.file_len > WAL_HEADER_LEN);
            assert_eq!(st.committed_seq, 0);
        }

        wal.commit();

        let st = wal.lock_state();
        assert_eq!(st.committed_seq, 1);
        // Fully applied, so the log is back to just its header.
        assert_eq!(st.file_len, WAL_HEADER_LEN);
        drop(st);

        // The slot record reached the metadata file.
        let (_, records) =
            StorageFolder::open(&ProductionFs, 0, &dir.path().join("f0"), 64, SECTOR).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].slot, 3);
        assert_eq!(records[0].id, id);
    }

    #[test]
    fn test_wait_commit_blocks_until_commit() {
        let dir = TempDir::new().unwrap();
        let wal = new_wal(&dir.path().join("persist"));
        let folder = with_folder(&wal, &dir);

        let id = SectorId([7u8; 12]);
        let seq = {
            let mut st = wal.lock_state();
            folder.usage.lock().unwrap().set(0);
            st.locations.insert(
                id,
                SectorLocation {
                    folder: 0,
                    index: 0,
                    count: 1,
                },
            );
            wal.append_txn(
                &mut st,
                &[WalEntry::AddSector {
                    id,
                    folder: 0,
                    index: 0,
                    count: 1,
                }],
            )
        };

        let committer = {
            let wal = Arc::clone(&wal);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                wal.commit();
            })
        };
        wal.wait_commit(seq).unwrap();
        assert_eq!(wal.lock_state().committed_seq, seq);
        committer.join().unwrap();
    }

    #[test]
    fn test_wait_commit_after_loop_exit_is_stopped() {
        let dir = TempDir::new().unwrap();
        let wal = new_wal(&dir.path().join("persist"));
        {
            let mut st = wal.lock_state();
            st.loop_exited = true;
        }
        assert!(matches!(wal.wait_commit(5), Err(StoreError::Stopped)));
    }

    #[test]
    fn test_settings_doc_reflects_folder_set() {
        let dir = TempDir::new().unwrap();
        let wal = new_wal(&dir.path().join("persist"));
        let _folder = with_folder(&wal, &dir);

        let st = wal.lock_state();
        let doc = wal.settings_doc_locked(&st);
        assert_eq!(doc.folders.len(), 1);
        assert_eq!(doc.folders[0].id, 0);
        assert_eq!(doc.folders[0].capacity, 64);
        assert_eq!(doc.sector_size, SECTOR);
    }
}
