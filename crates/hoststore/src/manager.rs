//! The contract manager façade.
//!
//! Assembles the engine: dependency surface, thread group, sector lock
//! table, WAL, and the folders/index living behind the WAL mutex. Every
//! public operation opens a thread-group guard first and returns `Stopped`
//! without touching state once shutdown has begun.
//!
//! Startup order mirrors the recovery contract: create the persist
//! directory, load (or bootstrap) the settings document, recover the WAL and
//! folder state, then spawn the sync loop. Shutdown reverses it through the
//! thread group's after-stop closures, ending with a final commit pass that
//! flushes whatever the last operations appended.
//!
//! Lock discipline, outermost first: thread-group guard, sector lock, WAL
//! mutex, per-folder usage. The folder rwlock (shared for payload writes,
//! exclusive for grow) is never held while acquiring any of the others, and
//! the WAL mutex is never held across payload I/O: slot reservations are
//! made under it, the write happens outside it, and the journal append
//! reacquires it.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use hoststore_fs::{Clock, HostFs, ProductionFs, SystemClock};

use crate::error::{Result, StoreError};
use crate::folder::{metadata_len, Progress, StorageFolder};
use crate::index::{ContentRoot, SectorId, SectorLocation};
use crate::placement::pick_slot;
use crate::sector_lock::SectorLocks;
use crate::settings::Settings;
use crate::thread_group::ThreadGroup;
use crate::wal::entry::WalEntry;
use crate::wal::{sync_loop, BuildingFolder, Wal};
use crate::{
    MAX_FOLDER_SLOTS, MAX_STORAGE_FOLDERS, MIN_FOLDER_SLOTS, SECTOR_SIZE, SETTINGS_FILE,
    SLOT_GRANULARITY,
};

/// How long a shrink waits for in-flight writes in the departing region to
/// finish surfacing before giving up.
const EVACUATION_SETTLE_LIMIT: Duration = Duration::from_secs(30);

/// Construction knobs. Production hosts use the defaults; tests shrink both
/// so suites run in milliseconds on small files.
#[derive(Debug, Clone)]
pub struct Options {
    pub sector_size: u32,
    /// Commit interval of the sync loop.
    pub sync_interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            sector_size: SECTOR_SIZE,
            sync_interval: Duration::from_millis(1500),
        }
    }
}

/// Operator-visible folder snapshot.
#[derive(Debug, Clone)]
pub struct StorageFolderInfo {
    pub id: u16,
    pub path: PathBuf,
    /// Capacity in slots.
    pub capacity: u32,
    /// Occupied slots.
    pub used: u32,
    pub available: bool,
    /// (done, total) bytes of an in-flight add or grow; zeros when idle.
    pub progress: (u64, u64),
    pub failed_reads: u64,
    pub failed_writes: u64,
}

pub struct ContractManager {
    cm: Arc<Cm>,
}

struct Cm {
    fs: Arc<dyn HostFs>,
    clock: Arc<dyn Clock>,
    persist_dir: PathBuf,
    sector_size: u32,
    salt: [u8; 32],
    tg: ThreadGroup,
    locks: SectorLocks,
    wal: Arc<Wal>,
}

impl ContractManager {
    /// Open (or initialize) the engine over `persist_dir` with the
    /// production filesystem and default options.
    pub fn new<P: AsRef<Path>>(persist_dir: P) -> Result<ContractManager> {
        ContractManager::with_options(
            Arc::new(ProductionFs),
            Arc::new(SystemClock),
            persist_dir.as_ref(),
            Options::default(),
        )
    }

    /// Full-control constructor: injected filesystem, clock, and options.
    pub fn with_options(
        fs: Arc<dyn HostFs>,
        clock: Arc<dyn Clock>,
        persist_dir: &Path,
        options: Options,
    ) -> Result<ContractManager> {
        fs.mkdir_all(persist_dir)?;

        let settings_path = persist_dir.join(SETTINGS_FILE);
        let settings = match Settings::load(fs.as_ref(), &settings_path)? {
            Some(s) => {
                s.check(options.sector_size)?;
                s
            }
            None => {
                let s = Settings::bootstrap(options.sector_size);
                s.save(fs.as_ref(), &settings_path)?;
                info!(path = %persist_dir.display(), "persist directory initialized");
                s
            }
        };

        let wal = Arc::new(Wal::new(
            Arc::clone(&fs),
            persist_dir.to_path_buf(),
            options.sector_size,
            settings.sector_salt,
        ));
        wal.load(&settings)?;

        let tg = ThreadGroup::new();
        let handle = sync_loop::spawn(Arc::clone(&wal), options.sync_interval);
        let wal_for_stop = Arc::clone(&wal);
        let handle_cell = Mutex::new(Some(handle));
        tg.after_stop(move || {
            if let Some(h) = handle_cell.lock().unwrap().take() {
                sync_loop::shutdown(&wal_for_stop, h);
            }
        });

        let cm = Arc::new(Cm {
            fs,
            clock,
            persist_dir: persist_dir.to_path_buf(),
            sector_size: options.sector_size,
            salt: settings.sector_salt,
            tg,
            locks: SectorLocks::new(),
            wal,
        });

        if cm.fs.disrupt("erroredStartup") {
            let _ = cm.tg.stop();
            return Err(StoreError::Io(std::io::Error::other("startup disrupted")));
        }

        let folders = cm.wal.lock_state().folders.len();
        info!(path = %persist_dir.display(), folders, "contract manager ready");
        Ok(ContractManager { cm })
    }

    /// The salted id that `root` resolves to on this host.
    pub fn sector_id(&self, root: &ContentRoot) -> SectorId {
        SectorId::derive(&self.cm.salt, root)
    }

    /// Store one sector. Identical content bumps the existing slot's
    /// reference count instead of occupying a second slot. Returns once the
    /// operation is durable.
    #[tracing::instrument(skip(self, root, data), level = "debug")]
    pub fn add_sector(&self, root: ContentRoot, data: &[u8]) -> Result<SectorId> {
        let _g = self.cm.tg.add()?;
        let (id, seq) = self.cm.stage_sector(&root, data)?;
        self.cm.wal.wait_commit(seq)?;
        Ok(id)
    }

    /// Store many sectors, reporting success per item; one shared durability
    /// wait covers the whole batch.
    pub fn add_sector_batch(
        &self,
        items: &[(ContentRoot, Vec<u8>)],
    ) -> Result<Vec<Result<SectorId>>> {
        let _g = self.cm.tg.add()?;
        let mut results = Vec::with_capacity(items.len());
        let mut max_seq = 0u64;
        for (root, data) in items {
            match self.cm.stage_sector(root, data) {
                Ok((id, seq)) => {
                    max_seq = max_seq.max(seq);
                    results.push(Ok(id));
                }
                Err(e) => results.push(Err(e)),
            }
        }
        if max_seq > 0 {
            self.cm.wal.wait_commit(max_seq)?;
        }
        Ok(results)
    }

    /// Drop one reference to a sector; the slot is freed when the last
    /// reference goes.
    pub fn remove_sector(&self, id: SectorId) -> Result<()> {
        let _g = self.cm.tg.add()?;
        let seq = {
            let _lock = self.cm.locks.guard(id);
            let mut st = self.cm.wal.lock_state();
            let Some(loc) = st.locations.get(&id).copied() else {
                return Err(StoreError::UnknownSector);
            };
            if loc.count > 1 {
                st.locations.get_mut(&id).unwrap().count = loc.count - 1;
                self.cm.wal.append_txn(
                    &mut st,
                    &[WalEntry::RemoveSector {
                        id,
                        folder: loc.folder,
                        index: loc.index,
                        count: loc.count - 1,
                    }],
                )
            } else {
                // The usage bit stays set until the removal commits, so the
                // slot cannot be recycled and overwritten while a crash
                // could still roll this removal back.
                st.locations.remove(&id);
                self.cm.wal.append_txn(
                    &mut st,
                    &[WalEntry::RemoveSector {
                        id,
                        folder: loc.folder,
                        index: loc.index,
                        count: 0,
                    }],
                )
            }
        };
        self.cm.wal.wait_commit(seq)
    }

    /// Fetch a sector's payload.
    #[tracing::instrument(skip(self), level = "debug")]
    pub fn read_sector(&self, id: SectorId) -> Result<Vec<u8>> {
        let _g = self.cm.tg.add()?;
        let _lock = self.cm.locks.guard(id);
        let (folder, slot) = {
            let st = self.cm.wal.lock_state();
            let Some(loc) = st.locations.get(&id) else {
                return Err(StoreError::UnknownSector);
            };
            let Some(folder) = st.folders.get(&loc.folder).cloned() else {
                return Err(StoreError::UnknownFolder { id: loc.folder });
            };
            (folder, loc.index)
        };
        folder.read_sector(slot)
    }

    /// Snapshot of every configured folder, including additions still
    /// writing out their files.
    pub fn storage_folders(&self) -> Result<Vec<StorageFolderInfo>> {
        let _g = self.cm.tg.add()?;
        let st = self.cm.wal.lock_state();
        let mut out: Vec<StorageFolderInfo> = st
            .folders
            .values()
            .map(|f| {
                let usage = f.usage.lock().unwrap();
                let (failed_reads, failed_writes) = f.health();
                StorageFolderInfo {
                    id: f.id,
                    path: f.path.clone(),
                    capacity: usage.capacity,
                    used: usage.used(),
                    available: f.is_available(),
                    progress: f.progress(),
                    failed_reads,
                    failed_writes,
                }
            })
            .collect();
        for b in &st.building {
            out.push(StorageFolderInfo {
                id: b.id,
                path: b.path.clone(),
                capacity: b.capacity,
                used: 0,
                available: false,
                progress: b.progress.get(),
                failed_reads: 0,
                failed_writes: 0,
            });
        }
        out.sort_by_key(|f| f.id);
        Ok(out)
    }

    /// Bring a new storage folder online. Writes out both folder files in
    /// full before the folder is journalled and becomes placeable.
    pub fn add_storage_folder(&self, path: &Path, capacity: u32) -> Result<()> {
        let _g = self.cm.tg.add()?;
        check_capacity(capacity)?;

        let path = path.to_path_buf();
        let progress = Arc::new(Progress::default());
        let id = {
            let mut st = self.cm.wal.lock_state();
            if st.folders.len() + st.building.len() >= MAX_STORAGE_FOLDERS {
                return Err(StoreError::TooManyFolders {
                    limit: MAX_STORAGE_FOLDERS,
                });
            }
            if st.folders.values().any(|f| f.path == path)
                || st.building.iter().any(|b| b.path == path)
            {
                return Err(StoreError::FolderPathInUse { path });
            }
            let mut id = 0u16;
            while st.folders.contains_key(&id)
                || st.building.iter().any(|b| b.id == id)
                || st.retiring.iter().any(|(rid, _)| *rid == id)
            {
                id += 1;
            }
            st.building.push(BuildingFolder {
                id,
                path: path.clone(),
                capacity,
                progress: Arc::clone(&progress),
            });
            id
        };

        match self.cm.build_folder(id, &path, capacity, &progress) {
            Ok(folder) => {
                let seq = {
                    let mut st = self.cm.wal.lock_state();
                    st.building.retain(|b| b.id != id);
                    st.folders.insert(id, folder);
                    self.cm.wal.append_txn(
                        &mut st,
                        &[WalEntry::AddFolder {
                            folder: id,
                            capacity,
                            path: path.clone(),
                        }],
                    )
                };
                self.cm.wal.wait_commit(seq)?;
                Ok(())
            }
            Err(e) => {
                self.cm.wal.lock_state().building.retain(|b| b.id != id);
                // Best effort: don't leave partial files on the disk.
                for name in [crate::METADATA_FILE, crate::SECTOR_DATA_FILE] {
                    let _ = self.cm.fs.remove_file(&path.join(name));
                }
                Err(e)
            }
        }
    }

    /// Grow or shrink a folder. Shrinking relocates every sector in the
    /// departing region first and fails without changes if any cannot move.
    pub fn resize_storage_folder(&self, id: u16, new_capacity: u32) -> Result<()> {
        let _g = self.cm.tg.add()?;
        check_capacity(new_capacity)?;

        let folder = self.cm.folder_or_err(id)?;
        let current = folder.usage.lock().unwrap().capacity;
        if new_capacity == current {
            return Ok(());
        }
        if !folder.is_available() {
            return Err(StoreError::FolderUnavailable { folder: id });
        }

        self.cm.claim_busy(id)?;
        let result = if new_capacity > current {
            self.cm.grow_folder(&folder, new_capacity)
        } else {
            self.cm.shrink_folder(&folder, new_capacity, false, false)
        };
        self.cm.release_busy(id);
        let seq = result?;
        self.cm.wal.wait_commit(seq)
    }

    /// Take a folder out of service. Without `force` every resident sector
    /// must relocate; with `force`, sectors that cannot move are dropped.
    pub fn remove_storage_folder(&self, id: u16, force: bool) -> Result<()> {
        let _g = self.cm.tg.add()?;
        let folder = self.cm.folder_or_err(id)?;
        self.cm.claim_busy(id)?;
        let result = self.cm.shrink_folder(&folder, 0, true, force);
        self.cm.release_busy(id);
        let seq = result?;
        self.cm.wal.wait_commit(seq)
    }

    /// Clean shutdown: drain in-flight operations, flush the WAL one last
    /// time, stop the sync loop.
    pub fn close(&self) -> Result<()> {
        self.cm.tg.stop()?;
        info!(path = %self.cm.persist_dir.display(), "contract manager stopped");
        Ok(())
    }
}

fn check_capacity(capacity: u32) -> Result<()> {
    if capacity % SLOT_GRANULARITY != 0 {
        return Err(StoreError::UnalignedCapacity {
            capacity,
            granularity: SLOT_GRANULARITY,
        });
    }
    if !(MIN_FOLDER_SLOTS..=MAX_FOLDER_SLOTS).contains(&capacity) {
        return Err(StoreError::CapacityOutOfRange {
            capacity,
            min: MIN_FOLDER_SLOTS,
            max: MAX_FOLDER_SLOTS,
        });
    }
    Ok(())
}

struct SectorMove {
    id: SectorId,
    old_slot: u32,
    dest_folder: u16,
    dest_slot: u32,
    count: u16,
}

impl Cm {
    fn folder_or_err(&self, id: u16) -> Result<Arc<StorageFolder>> {
        self.wal
            .lock_state()
            .folders
            .get(&id)
            .cloned()
            .ok_or(StoreError::UnknownFolder { id })
    }

    fn claim_busy(&self, id: u16) -> Result<()> {
        if self.wal.lock_state().busy.insert(id) {
            Ok(())
        } else {
            Err(StoreError::FolderBusy { id })
        }
    }

    fn release_busy(&self, id: u16) {
        self.wal.lock_state().busy.remove(&id);
    }

    /// Validate, place, write, and journal one sector; returns the id and
    /// the transaction to wait on. Does not wait for durability itself.
    fn stage_sector(&self, root: &ContentRoot, data: &[u8]) -> Result<(SectorId, u64)> {
        if data.len() != self.sector_size as usize {
            return Err(StoreError::SizeMismatch {
                expected: self.sector_size,
                actual: data.len(),
            });
        }
        let id = SectorId::derive(&self.salt, root);
        let _lock = self.locks.guard(id);

        // Same content already stored: one more reference, no new slot.
        {
            let mut st = self.wal.lock_state();
            if let Some(loc) = st.locations.get(&id).copied() {
                if loc.count == u16::MAX {
                    return Err(StoreError::TooManyReferences);
                }
                st.locations.get_mut(&id).unwrap().count = loc.count + 1;
                let seq = self.wal.append_txn(
                    &mut st,
                    &[WalEntry::AddSector {
                        id,
                        folder: loc.folder,
                        index: loc.index,
                        count: loc.count + 1,
                    }],
                );
                return Ok((id, seq));
            }
        }

        // New physical sector. A folder that fails mid-write drops out of
        // placement, so retrying simply lands on the next disk.
        loop {
            let (fid, slot, folder) = {
                let st = self.wal.lock_state();
                let Some((fid, slot)) = pick_slot(&st.folders, &id) else {
                    return Err(StoreError::StorageFull);
                };
                let folder = st.folders.get(&fid).cloned().expect("placed into known folder");
                folder.usage.lock().unwrap().set(slot);
                (fid, slot, folder)
            };

            match folder.write_sector(slot, data) {
                Ok(()) => {
                    let mut st = self.wal.lock_state();
                    st.locations.insert(
                        id,
                        SectorLocation {
                            folder: fid,
                            index: slot,
                            count: 1,
                        },
                    );
                    st.touched.insert(fid);
                    let seq = self.wal.append_txn(
                        &mut st,
                        &[WalEntry::AddSector {
                            id,
                            folder: fid,
                            index: slot,
                            count: 1,
                        }],
                    );
                    return Ok((id, seq));
                }
                Err(err) => {
                    let st = self.wal.lock_state();
                    if let Some(f) = st.folders.get(&fid) {
                        f.usage.lock().unwrap().clear(slot);
                    }
                    drop(st);
                    warn!(%id, folder = fid, %err, "sector write failed, retrying placement");
                }
            }
        }
    }

    fn build_folder(
        &self,
        id: u16,
        path: &Path,
        capacity: u32,
        progress: &Progress,
    ) -> Result<Arc<StorageFolder>> {
        self.fs.mkdir_all(path)?;
        let needed = capacity as u64 * self.sector_size as u64 + metadata_len(capacity);
        let available = self.fs.free_space(path)?;
        if available < needed {
            return Err(StoreError::InsufficientSpace { needed, available });
        }

        let started = self.clock.now();
        let folder = StorageFolder::create(
            self.fs.as_ref(),
            id,
            path,
            capacity,
            self.sector_size,
            &self.tg.stop_signal(),
            progress,
        )?;
        info!(
            folder = id,
            path = %path.display(),
            capacity,
            elapsed_ms = (self.clock.now() - started).as_millis() as u64,
            "storage folder built"
        );
        Ok(folder)
    }

    fn grow_folder(&self, folder: &Arc<StorageFolder>, new_capacity: u32) -> Result<u64> {
        {
            let _excl = folder.structural.write().unwrap();
            folder.extend_data_file(new_capacity, &self.tg.stop_signal())?;
            folder.rebuild_metadata(self.fs.as_ref(), new_capacity)?;
        }
        let mut st = self.wal.lock_state();
        folder.usage.lock().unwrap().grow_to(new_capacity);
        let seq = self.wal.append_txn(
            &mut st,
            &[WalEntry::GrowFolder {
                folder: folder.id,
                new_capacity,
            }],
        );
        Ok(seq)
    }

    /// Evacuate every sector at or beyond `new_capacity`, then journal the
    /// shrink (or removal) as one transaction. No state changes survive a
    /// failure.
    fn shrink_folder(
        &self,
        folder: &Arc<StorageFolder>,
        new_capacity: u32,
        remove: bool,
        force: bool,
    ) -> Result<u64> {
        let fid = folder.id;
        let stop = self.tg.stop_signal();

        // Reserve every free departing slot so no new sector lands there.
        let mut tombstoned = Vec::new();
        {
            let _st = self.wal.lock_state();
            let mut usage = folder.usage.lock().unwrap();
            for s in new_capacity..usage.capacity {
                if !usage.is_set(s) {
                    usage.set(s);
                    tombstoned.push(s);
                }
            }
        }

        let rollback_tombstones = |extra_dests: &[(u16, u32)]| {
            let st = self.wal.lock_state();
            {
                let mut usage = folder.usage.lock().unwrap();
                for s in &tombstoned {
                    usage.clear(*s);
                }
            }
            for (dfid, dslot) in extra_dests {
                if let Some(f) = st.folders.get(dfid) {
                    f.usage.lock().unwrap().clear(*dslot);
                }
            }
        };

        // Occupied departing slots without an index entry are writes still
        // in flight (or frees awaiting their commit); wait for them to
        // settle so every resident has a known identity.
        let settle_deadline = self.clock.now() + EVACUATION_SETTLE_LIMIT;
        loop {
            let unknown = {
                let st = self.wal.lock_state();
                let usage = folder.usage.lock().unwrap();
                let located: HashSet<u32> = st
                    .locations
                    .values()
                    .filter(|l| l.folder == fid && l.index >= new_capacity)
                    .map(|l| l.index)
                    .collect();
                (new_capacity..usage.capacity)
                    .filter(|s| {
                        usage.is_set(*s)
                            && !tombstoned.contains(s)
                            && !located.contains(s)
                    })
                    .count()
            };
            if unknown == 0 {
                break;
            }
            if stop.is_stopped() {
                rollback_tombstones(&[]);
                return Err(StoreError::Stopped);
            }
            if self.clock.now() >= settle_deadline {
                rollback_tombstones(&[]);
                return Err(StoreError::ShrinkImpossible);
            }
            thread::sleep(Duration::from_millis(20));
        }

        let victims: Vec<(SectorId, u32)> = {
            let st = self.wal.lock_state();
            st.locations
                .iter()
                .filter(|(_, l)| l.folder == fid && l.index >= new_capacity)
                .map(|(id, l)| (*id, l.index))
                .collect()
        };

        let mut guards = Vec::new();
        let mut moves: Vec<SectorMove> = Vec::new();
        let mut dropped: Vec<(SectorId, u32)> = Vec::new();

        for (sid, old_slot) in victims {
            if stop.is_stopped() {
                let dests: Vec<_> = moves.iter().map(|m| (m.dest_folder, m.dest_slot)).collect();
                rollback_tombstones(&dests);
                return Err(StoreError::Stopped);
            }
            let guard = self.locks.guard(sid);

            // Revalidate: the sector may have been removed or already moved
            // while we waited for its lock.
            let count = {
                let st = self.wal.lock_state();
                match st.locations.get(&sid) {
                    Some(l) if l.folder == fid && l.index == old_slot => l.count,
                    _ => continue,
                }
            };

            let payload = match folder.read_sector(old_slot) {
                Ok(p) => p,
                Err(e) => {
                    if remove && force {
                        dropped.push((sid, old_slot));
                        guards.push(guard);
                        continue;
                    }
                    let dests: Vec<_> =
                        moves.iter().map(|m| (m.dest_folder, m.dest_slot)).collect();
                    rollback_tombstones(&dests);
                    return Err(e);
                }
            };

            let mut dest = None;
            loop {
                let picked = {
                    let st = self.wal.lock_state();
                    match pick_slot(&st.folders, &sid) {
                        Some((dfid, dslot)) => {
                            let f = st.folders.get(&dfid).cloned().unwrap();
                            f.usage.lock().unwrap().set(dslot);
                            Some((dfid, dslot, f))
                        }
                        None => None,
                    }
                };
                let Some((dfid, dslot, darc)) = picked else {
                    break;
                };
                match darc.write_sector(dslot, &payload) {
                    Ok(()) => {
                        dest = Some((dfid, dslot));
                        break;
                    }
                    Err(err) => {
                        let st = self.wal.lock_state();
                        if let Some(f) = st.folders.get(&dfid) {
                            f.usage.lock().unwrap().clear(dslot);
                        }
                        drop(st);
                        warn!(%sid, folder = dfid, %err, "relocation write failed, retrying");
                    }
                }
            }

            match dest {
                Some((dfid, dslot)) => {
                    moves.push(SectorMove {
                        id: sid,
                        old_slot,
                        dest_folder: dfid,
                        dest_slot: dslot,
                        count,
                    });
                    guards.push(guard);
                }
                None if remove && force => {
                    dropped.push((sid, old_slot));
                    guards.push(guard);
                }
                None => {
                    let dests: Vec<_> =
                        moves.iter().map(|m| (m.dest_folder, m.dest_slot)).collect();
                    rollback_tombstones(&dests);
                    return Err(StoreError::ShrinkImpossible);
                }
            }
        }

        // One transaction: relocations, drops, then the structural entry.
        // All in-memory effects land under a single lock hold so readers
        // never see a half-shrunk folder.
        let seq = {
            let mut st = self.wal.lock_state();
            let mut entries = Vec::with_capacity(moves.len() * 2 + dropped.len() + 1);
            for m in &moves {
                st.locations.insert(
                    m.id,
                    SectorLocation {
                        folder: m.dest_folder,
                        index: m.dest_slot,
                        count: m.count,
                    },
                );
                st.touched.insert(m.dest_folder);
                entries.push(WalEntry::RemoveSector {
                    id: m.id,
                    folder: fid,
                    index: m.old_slot,
                    count: 0,
                });
                entries.push(WalEntry::AddSector {
                    id: m.id,
                    folder: m.dest_folder,
                    index: m.dest_slot,
                    count: m.count,
                });
            }
            for (sid, old_slot) in &dropped {
                st.locations.remove(sid);
                entries.push(WalEntry::RemoveSector {
                    id: *sid,
                    folder: fid,
                    index: *old_slot,
                    count: 0,
                });
            }
            {
                let mut usage = folder.usage.lock().unwrap();
                for m in &moves {
                    usage.clear(m.old_slot);
                }
                for (_, s) in &dropped {
                    usage.clear(*s);
                }
                for s in &tombstoned {
                    usage.clear(*s);
                }
                if !remove {
                    // Anything still set past the new capacity is a removal
                    // whose commit has not yet materialized; its deferred
                    // clear will land out of range and no-op, so settle it
                    // here before the bitmap loses its tail.
                    for s in new_capacity..usage.capacity {
                        if usage.is_set(s) {
                            usage.clear(s);
                        }
                    }
                    usage.shrink_to(new_capacity);
                }
            }
            if remove {
                st.folders.remove(&fid);
                st.retiring.push((fid, Arc::clone(folder)));
                entries.push(WalEntry::RemoveFolder { folder: fid, force });
                info!(folder = fid, moved = moves.len(), lost = dropped.len(), "folder removed");
            } else {
                entries.push(WalEntry::ShrinkFolder {
                    folder: fid,
                    new_capacity,
                });
                info!(folder = fid, new_capacity, moved = moves.len(), "folder shrunk");
            }
            self.wal.append_txn(&mut st, &entries)
        };
        drop(guards);
        Ok(seq)
    }
}
