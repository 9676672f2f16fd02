//! Storage folder runtime object and its on-disk files.
//!
//! Each folder is a directory on one disk holding two files:
//!
//! - `siahostmetadata.dat`: capacity (u32 LE), the usage bitmap (one bit per
//!   slot, whole 64-bit words), then one 14-byte record per slot
//!   (12-byte sector id + u16 LE reference count). The bitmap is the
//!   occupancy source of truth; the records let startup recover sector
//!   identities.
//! - `siahostdata.dat`: capacity × sector_size bytes of payload slots.
//!
//! The in-memory usage bitmap tracks *visible* state and is mutated only
//! under the WAL mutex. The file copies of the bitmap and the slot records
//! track *committed* state and are written only by the sync loop's apply
//! phase and by recovery, so a crash rolls occupancy back to the last
//! commit. File-level bitmap updates therefore read-modify-write the stored
//! word rather than copying the (possibly ahead) in-memory word.
//!
//! Disk failures on folder files never propagate as panics: the folder is
//! flagged unavailable, health counters tick, and the engine keeps serving
//! from its other folders.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tracing::{info, warn};

use hoststore_fs::{atomic_replace, HostFile, HostFs};

use crate::error::{Result, StoreError};
use crate::index::SectorId;
use crate::thread_group::StopSignal;
use crate::{METADATA_FILE, SECTOR_DATA_FILE, SLOT_GRANULARITY};

/// Bytes per slot record in the metadata file: 12-byte id + u16 count.
pub const SLOT_RECORD_LEN: usize = 14;

/// Slots zeroed per write while building or extending a data file.
const FILL_CHUNK_SLOTS: u32 = 64;

fn bitmap_len(capacity: u32) -> u64 {
    debug_assert_eq!(capacity % SLOT_GRANULARITY, 0);
    capacity as u64 / 8
}

fn bitmap_word_offset(slot: u32) -> u64 {
    4 + (slot as u64 / 64) * 8
}

fn records_offset(capacity: u32) -> u64 {
    4 + bitmap_len(capacity)
}

fn record_offset(capacity: u32, slot: u32) -> u64 {
    records_offset(capacity) + slot as u64 * SLOT_RECORD_LEN as u64
}

/// Total metadata file size for a capacity.
pub fn metadata_len(capacity: u32) -> u64 {
    records_offset(capacity) + capacity as u64 * SLOT_RECORD_LEN as u64
}

/// In-memory usage bitmap plus free-slot accounting.
pub struct FolderUsage {
    pub capacity: u32,
    words: Vec<u64>,
    pub free: u32,
}

impl FolderUsage {
    pub fn empty(capacity: u32) -> Self {
        FolderUsage {
            capacity,
            words: vec![0u64; (capacity / 64) as usize],
            free: capacity,
        }
    }

    pub fn from_bits(capacity: u32, words: Vec<u64>) -> Self {
        let used: u32 = words.iter().map(|w| w.count_ones()).sum();
        FolderUsage {
            capacity,
            words,
            free: capacity - used,
        }
    }

    pub fn is_set(&self, slot: u32) -> bool {
        self.words[(slot / 64) as usize] & (1u64 << (slot % 64)) != 0
    }

    pub fn set(&mut self, slot: u32) {
        debug_assert!(!self.is_set(slot));
        self.words[(slot / 64) as usize] |= 1u64 << (slot % 64);
        self.free -= 1;
    }

    pub fn clear(&mut self, slot: u32) {
        debug_assert!(self.is_set(slot));
        self.words[(slot / 64) as usize] &= !(1u64 << (slot % 64));
        self.free += 1;
    }

    pub fn used(&self) -> u32 {
        self.capacity - self.free
    }

    /// First clear slot at or after `start`, wrapping once around the
    /// bitmap.
    pub fn probe(&self, start: u32) -> Option<u32> {
        if self.free == 0 {
            return None;
        }
        let cap = self.capacity;
        for i in 0..cap {
            let slot = (start + i) % cap;
            if !self.is_set(slot) {
                return Some(slot);
            }
        }
        None
    }

    /// Occupied slots in ascending order.
    pub fn occupied(&self) -> Vec<u32> {
        (0..self.capacity).filter(|&s| self.is_set(s)).collect()
    }

    /// Extend the bitmap with free slots.
    pub fn grow_to(&mut self, new_capacity: u32) {
        debug_assert!(new_capacity >= self.capacity);
        self.words.resize((new_capacity / 64) as usize, 0);
        self.free += new_capacity - self.capacity;
        self.capacity = new_capacity;
    }

    /// Drop the tail of the bitmap. Every departing slot must already be
    /// clear.
    pub fn shrink_to(&mut self, new_capacity: u32) {
        debug_assert!(new_capacity <= self.capacity);
        debug_assert!((new_capacity..self.capacity).all(|s| !self.is_set(s)));
        self.words.truncate((new_capacity / 64) as usize);
        self.free -= self.capacity - new_capacity;
        self.capacity = new_capacity;
    }
}

/// One slot's metadata record as stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRecord {
    pub slot: u32,
    pub id: SectorId,
    pub count: u16,
}

/// Progress of a long-running folder operation, in bytes.
#[derive(Default)]
pub struct Progress {
    pub num: AtomicU64,
    pub den: AtomicU64,
}

impl Progress {
    pub fn get(&self) -> (u64, u64) {
        (
            self.num.load(Ordering::Relaxed),
            self.den.load(Ordering::Relaxed),
        )
    }

    pub fn clear(&self) {
        self.num.store(0, Ordering::Relaxed);
        self.den.store(0, Ordering::Relaxed);
    }
}

pub struct StorageFolder {
    pub id: u16,
    pub path: PathBuf,
    sector_size: u32,
    /// Swapped out when the metadata file is rebuilt (grow/shrink).
    metadata: Mutex<Arc<dyn HostFile>>,
    sectors: Arc<dyn HostFile>,
    /// Shared for slot writes; grow takes it exclusively while extending
    /// the files. Shrink and removal cannot (their relocations may write
    /// into this folder's own retained region under the shared side) and
    /// serialize through the WAL's busy set and slot tombstones instead.
    pub structural: RwLock<()>,
    available: AtomicBool,
    failed_reads: AtomicU64,
    failed_writes: AtomicU64,
    progress: Progress,
    /// Visible occupancy; mutated only under the WAL mutex.
    pub usage: Mutex<FolderUsage>,
}

impl StorageFolder {
    /// Build a brand new folder on disk: a fully zeroed data file (written
    /// chunk by chunk so allocation failures and shutdown are caught early)
    /// and an all-free metadata file, both fsynced.
    pub fn create(
        fs: &dyn HostFs,
        id: u16,
        path: &Path,
        capacity: u32,
        sector_size: u32,
        stop: &StopSignal,
        progress: &Progress,
    ) -> Result<Arc<StorageFolder>> {
        fs.mkdir_all(path)?;
        let data_path = path.join(SECTOR_DATA_FILE);
        let meta_path = path.join(METADATA_FILE);

        let sectors = fs.create(&data_path)?;
        let total_bytes = capacity as u64 * sector_size as u64;
        progress.den.store(total_bytes, Ordering::Relaxed);

        let chunk = vec![0u8; (FILL_CHUNK_SLOTS * sector_size) as usize];
        let mut written = 0u64;
        while written < total_bytes {
            if stop.is_stopped() {
                return Err(StoreError::Stopped);
            }
            let n = chunk.len().min((total_bytes - written) as usize);
            sectors.write_at(&chunk[..n], written)?;
            written += n as u64;
            progress.num.store(written, Ordering::Relaxed);
        }
        sectors.sync_all()?;

        let meta = fs.create(&meta_path)?;
        let mut header = vec![0u8; metadata_len(capacity) as usize];
        header[..4].copy_from_slice(&capacity.to_le_bytes());
        meta.write_at(&header, 0)?;
        meta.sync_all()?;

        info!(
            folder = id,
            path = %path.display(),
            capacity,
            "storage folder created"
        );

        Ok(Arc::new(StorageFolder {
            id,
            path: path.to_path_buf(),
            sector_size,
            metadata: Mutex::new(meta),
            sectors,
            structural: RwLock::new(()),
            available: AtomicBool::new(true),
            failed_reads: AtomicU64::new(0),
            failed_writes: AtomicU64::new(0),
            progress: Progress::default(),
            usage: Mutex::new(FolderUsage::empty(capacity)),
        }))
    }

    /// Open an existing folder. Returns the folder plus the committed slot
    /// records for the startup index rebuild.
    ///
    /// `capacity` comes from the settings document; if the metadata file
    /// disagrees (a crash between a metadata rebuild and the matching WAL
    /// commit), the file is normalized back to the settings capacity,
    /// preserving the overlapping region.
    pub fn open(
        fs: &dyn HostFs,
        id: u16,
        path: &Path,
        capacity: u32,
        sector_size: u32,
    ) -> Result<(Arc<StorageFolder>, Vec<SlotRecord>)> {
        let meta_path = path.join(METADATA_FILE);
        let data_path = path.join(SECTOR_DATA_FILE);

        let meta = fs.open(&meta_path)?;
        let mut cap_bytes = [0u8; 4];
        meta.read_at(&mut cap_bytes, 0)?;
        let file_capacity = u32::from_le_bytes(cap_bytes);

        let meta = if file_capacity != capacity {
            warn!(
                folder = id,
                file_capacity, capacity, "metadata capacity mismatch, normalizing"
            );
            rebuild_metadata_file(fs, &meta_path, &meta, file_capacity, capacity)?
        } else {
            meta
        };

        let sectors = fs.open(&data_path)?;
        let expected = capacity as u64 * sector_size as u64;
        if sectors.len()? < expected {
            // A grow extended metadata but crashed before finishing the data
            // file; pad it back out.
            sectors.set_len(expected)?;
            sectors.sync_all()?;
        }

        // Read the committed bitmap and the records of occupied slots.
        let mut bits = vec![0u8; bitmap_len(capacity) as usize];
        meta.read_at(&mut bits, 4)?;
        let words: Vec<u64> = bits
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
            .collect();
        let usage = FolderUsage::from_bits(capacity, words);

        let mut records = Vec::with_capacity(usage.used() as usize);
        let mut raw = vec![0u8; capacity as usize * SLOT_RECORD_LEN];
        meta.read_at(&mut raw, records_offset(capacity))?;
        for slot in usage.occupied() {
            let off = slot as usize * SLOT_RECORD_LEN;
            let mut idb = [0u8; 12];
            idb.copy_from_slice(&raw[off..off + 12]);
            let count = u16::from_le_bytes([raw[off + 12], raw[off + 13]]);
            records.push(SlotRecord {
                slot,
                id: SectorId(idb),
                count,
            });
        }

        Ok((
            Arc::new(StorageFolder {
                id,
                path: path.to_path_buf(),
                sector_size,
                metadata: Mutex::new(meta),
                sectors,
                structural: RwLock::new(()),
                available: AtomicBool::new(true),
                failed_reads: AtomicU64::new(0),
                failed_writes: AtomicU64::new(0),
                progress: Progress::default(),
                usage: Mutex::new(usage),
            }),
            records,
        ))
    }

    /// Placeholder for a folder whose files could not be opened: it shows up
    /// in snapshots as unavailable and never participates in placement.
    pub fn unavailable(id: u16, path: &Path, capacity: u32, sector_size: u32) -> Arc<StorageFolder> {
        let usage = FolderUsage::empty(capacity);
        Arc::new(StorageFolder {
            id,
            path: path.to_path_buf(),
            sector_size,
            metadata: Mutex::new(Arc::new(DeadFile) as Arc<dyn HostFile>),
            sectors: Arc::new(DeadFile),
            structural: RwLock::new(()),
            available: AtomicBool::new(false),
            failed_reads: AtomicU64::new(0),
            failed_writes: AtomicU64::new(0),
            progress: Progress::default(),
            usage: Mutex::new(usage),
        })
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    pub fn health(&self) -> (u64, u64) {
        (
            self.failed_reads.load(Ordering::Relaxed),
            self.failed_writes.load(Ordering::Relaxed),
        )
    }

    pub fn progress(&self) -> (u64, u64) {
        self.progress.get()
    }

    fn note_read_error(&self, err: &std::io::Error) {
        self.failed_reads.fetch_add(1, Ordering::Relaxed);
        if self.available.swap(false, Ordering::SeqCst) {
            warn!(folder = self.id, %err, "read failed, marking folder unavailable");
        }
    }

    fn note_write_error(&self, err: &std::io::Error) {
        self.failed_writes.fetch_add(1, Ordering::Relaxed);
        if self.available.swap(false, Ordering::SeqCst) {
            warn!(folder = self.id, %err, "write failed, marking folder unavailable");
        }
    }

    /// Read one sector payload. Callers hold the sector lock; no folder lock
    /// is needed.
    pub fn read_sector(&self, slot: u32) -> Result<Vec<u8>> {
        if !self.is_available() {
            return Err(StoreError::FolderUnavailable { folder: self.id });
        }
        let mut buf = vec![0u8; self.sector_size as usize];
        match self
            .sectors
            .read_at(&mut buf, slot as u64 * self.sector_size as u64)
        {
            Ok(()) => Ok(buf),
            Err(e) => {
                self.note_read_error(&e);
                Err(StoreError::DiskError { folder: self.id })
            }
        }
    }

    /// Write one sector payload under the shared structural lock.
    pub fn write_sector(&self, slot: u32, data: &[u8]) -> Result<()> {
        let _shared = self.structural.read().unwrap();
        if !self.is_available() {
            return Err(StoreError::FolderUnavailable { folder: self.id });
        }
        match self
            .sectors
            .write_at(data, slot as u64 * self.sector_size as u64)
        {
            Ok(()) => Ok(()),
            Err(e) => {
                self.note_write_error(&e);
                Err(StoreError::DiskError { folder: self.id })
            }
        }
    }

    /// Flush sector payloads; called by the sync loop before it writes a
    /// commit record covering entries that reference this folder.
    pub fn sync_sectors(&self) -> Result<()> {
        if !self.is_available() {
            return Ok(());
        }
        if let Err(e) = self.sectors.sync_all() {
            self.note_write_error(&e);
            return Err(StoreError::DiskError { folder: self.id });
        }
        Ok(())
    }

    // ---- committed-state (apply phase) file updates ----
    //
    // Offsets are computed from the capacity stored in the file itself, not
    // the in-memory capacity: while a shrink's batch is being applied the
    // file still has its pre-shrink layout, and replay after a crash can see
    // the post-shrink layout. Slots beyond the file's capacity are stale
    // re-applies and are skipped.

    /// Mark `slot` occupied in the metadata file and store its record.
    pub fn apply_set_slot(&self, slot: u32, id: SectorId, count: u16) -> Result<()> {
        let meta = self.metadata.lock().unwrap().clone();
        self.apply_io(|| {
            let capacity = file_capacity(meta.as_ref())?;
            if slot >= capacity {
                return Ok(());
            }
            let mut word = [0u8; 8];
            meta.read_at(&mut word, bitmap_word_offset(slot))?;
            let w = u64::from_le_bytes(word) | 1u64 << (slot % 64);
            meta.write_at(&w.to_le_bytes(), bitmap_word_offset(slot))?;
            let mut rec = [0u8; SLOT_RECORD_LEN];
            rec[..12].copy_from_slice(id.as_bytes());
            rec[12..].copy_from_slice(&count.to_le_bytes());
            meta.write_at(&rec, record_offset(capacity, slot))
        })
    }

    /// Mark `slot` free in the metadata file and zero its record.
    pub fn apply_clear_slot(&self, slot: u32) -> Result<()> {
        let meta = self.metadata.lock().unwrap().clone();
        self.apply_io(|| {
            let capacity = file_capacity(meta.as_ref())?;
            if slot >= capacity {
                return Ok(());
            }
            let mut word = [0u8; 8];
            meta.read_at(&mut word, bitmap_word_offset(slot))?;
            let w = u64::from_le_bytes(word) & !(1u64 << (slot % 64));
            meta.write_at(&w.to_le_bytes(), bitmap_word_offset(slot))?;
            let rec = [0u8; SLOT_RECORD_LEN];
            meta.write_at(&rec, record_offset(capacity, slot))
        })
    }

    fn apply_io(&self, f: impl FnOnce() -> std::io::Result<()>) -> Result<()> {
        f().map_err(|e| {
            self.note_write_error(&e);
            StoreError::DiskError { folder: self.id }
        })
    }

    pub fn sync_metadata(&self) -> Result<()> {
        if !self.is_available() {
            return Ok(());
        }
        let meta = self.metadata.lock().unwrap().clone();
        if let Err(e) = meta.sync_all() {
            self.note_write_error(&e);
            return Err(StoreError::DiskError { folder: self.id });
        }
        Ok(())
    }

    // ---- structural file operations ----

    /// Append zeroed slots to the data file, chunk by chunk, with visible
    /// progress. Cancellable between chunks; a cancelled extension is
    /// truncated back so no partial growth leaks.
    pub fn extend_data_file(&self, new_capacity: u32, stop: &StopSignal) -> Result<()> {
        let old_bytes;
        {
            let usage = self.usage.lock().unwrap();
            old_bytes = usage.capacity as u64 * self.sector_size as u64;
        }
        let new_bytes = new_capacity as u64 * self.sector_size as u64;
        self.progress.den.store(new_bytes - old_bytes, Ordering::Relaxed);

        let chunk = vec![0u8; (FILL_CHUNK_SLOTS * self.sector_size) as usize];
        let mut written = old_bytes;
        while written < new_bytes {
            if stop.is_stopped() {
                let _ = self.sectors.set_len(old_bytes);
                self.progress.clear();
                return Err(StoreError::Stopped);
            }
            let n = chunk.len().min((new_bytes - written) as usize);
            if let Err(e) = self.sectors.write_at(&chunk[..n], written) {
                self.note_write_error(&e);
                let _ = self.sectors.set_len(old_bytes);
                self.progress.clear();
                return Err(StoreError::DiskError { folder: self.id });
            }
            written += n as u64;
            self.progress
                .num
                .store(written - old_bytes, Ordering::Relaxed);
        }
        if let Err(e) = self.sectors.sync_all() {
            self.note_write_error(&e);
            return Err(StoreError::DiskError { folder: self.id });
        }
        self.progress.clear();
        Ok(())
    }

    /// Rebuild the metadata file for a new capacity, preserving the
    /// committed state of the overlapping slot range, and swap in the new
    /// handle. The rebuild goes through an atomic replace, so a crash leaves
    /// either the old or the new file.
    pub fn rebuild_metadata(&self, fs: &dyn HostFs, new_capacity: u32) -> Result<()> {
        let meta_path = self.path.join(METADATA_FILE);
        let old = self.metadata.lock().unwrap().clone();
        let mut cap_bytes = [0u8; 4];
        old.read_at(&mut cap_bytes, 0).map_err(|e| {
            self.note_read_error(&e);
            StoreError::DiskError { folder: self.id }
        })?;
        let old_capacity = u32::from_le_bytes(cap_bytes);
        let new = rebuild_metadata_file(fs, &meta_path, &old, old_capacity, new_capacity)
            .map_err(|e| match e {
                StoreError::Io(ref io) => {
                    self.note_write_error(io);
                    StoreError::DiskError { folder: self.id }
                }
                other => other,
            })?;
        *self.metadata.lock().unwrap() = new;
        Ok(())
    }

    /// Pad the data file out to `capacity` slots if it is shorter. Used
    /// during recovery replay of a grow; the chunked zero fill already ran
    /// once before the entry committed, so a sparse extension suffices here.
    pub fn ensure_data_len(&self, capacity: u32) -> Result<()> {
        let want = capacity as u64 * self.sector_size as u64;
        let have = self.sectors.len().map_err(|e| {
            self.note_read_error(&e);
            StoreError::DiskError { folder: self.id }
        })?;
        if have >= want {
            return Ok(());
        }
        self.sectors
            .set_len(want)
            .and_then(|()| self.sectors.sync_all())
            .map_err(|e| {
                self.note_write_error(&e);
                StoreError::DiskError { folder: self.id }
            })
    }

    /// Truncate the data file after a committed shrink.
    pub fn truncate_data(&self, new_capacity: u32) -> Result<()> {
        let new_bytes = new_capacity as u64 * self.sector_size as u64;
        self.sectors
            .set_len(new_bytes)
            .and_then(|()| self.sectors.sync_all())
            .map_err(|e| {
                self.note_write_error(&e);
                StoreError::DiskError { folder: self.id }
            })
    }

    /// Delete the folder's files after a committed removal.
    pub fn delete_files(&self, fs: &dyn HostFs) {
        for name in [METADATA_FILE, SECTOR_DATA_FILE] {
            let p = self.path.join(name);
            if let Err(e) = fs.remove_file(&p) {
                warn!(folder = self.id, path = %p.display(), err = %e, "could not delete folder file");
            }
        }
    }
}

fn file_capacity(meta: &dyn HostFile) -> std::io::Result<u32> {
    let mut cap_bytes = [0u8; 4];
    meta.read_at(&mut cap_bytes, 0)?;
    Ok(u32::from_le_bytes(cap_bytes))
}

/// A file handle that always fails; used for unavailable placeholders.
struct DeadFile;

impl HostFile for DeadFile {
    fn read_at(&self, _buf: &mut [u8], _offset: u64) -> std::io::Result<()> {
        Err(std::io::Error::other("folder unavailable"))
    }
    fn write_at(&self, _buf: &[u8], _offset: u64) -> std::io::Result<()> {
        Err(std::io::Error::other("folder unavailable"))
    }
    fn set_len(&self, _len: u64) -> std::io::Result<()> {
        Err(std::io::Error::other("folder unavailable"))
    }
    fn sync_all(&self) -> std::io::Result<()> {
        Err(std::io::Error::other("folder unavailable"))
    }
    fn len(&self) -> std::io::Result<u64> {
        Ok(0)
    }
}

/// Copy the committed metadata at `old` into a freshly laid out file of
/// `new_capacity` slots and atomically replace `path` with it. Returns the
/// newly opened handle.
fn rebuild_metadata_file(
    fs: &dyn HostFs,
    path: &Path,
    old: &Arc<dyn HostFile>,
    old_capacity: u32,
    new_capacity: u32,
) -> Result<Arc<dyn HostFile>> {
    let keep = old_capacity.min(new_capacity);

    let mut old_bits = vec![0u8; bitmap_len(old_capacity) as usize];
    old.read_at(&mut old_bits, 4)?;
    let mut old_records = vec![0u8; old_capacity as usize * SLOT_RECORD_LEN];
    old.read_at(&mut old_records, records_offset(old_capacity))?;

    let mut out = vec![0u8; metadata_len(new_capacity) as usize];
    out[..4].copy_from_slice(&new_capacity.to_le_bytes());
    let keep_bitmap_bytes = bitmap_len(keep) as usize;
    out[4..4 + keep_bitmap_bytes].copy_from_slice(&old_bits[..keep_bitmap_bytes]);
    let rec_off = records_offset(new_capacity) as usize;
    let keep_record_bytes = keep as usize * SLOT_RECORD_LEN;
    out[rec_off..rec_off + keep_record_bytes].copy_from_slice(&old_records[..keep_record_bytes]);

    atomic_replace(fs, path, &out)?;
    Ok(fs.open(path)?)
}
