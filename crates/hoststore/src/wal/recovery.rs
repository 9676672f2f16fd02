//! Startup recovery: scan the log, keep the committed prefix, rebuild the
//! index, and normalize folder metadata.
//!
//! Recovery trusts, in order: the settings document (which folders exist),
//! the folder metadata files (committed occupancy and sector identities),
//! and finally the committed WAL records (anything newer than the metadata).
//! The WAL wins every disagreement because entries only commit after the
//! data they describe is durable. Anything after the last valid commit
//! record is an uncommitted tail from a crash and is discarded.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::Result;
use crate::folder::StorageFolder;
use crate::index::{SectorId, SectorLocation};
use crate::settings::Settings;
use crate::wal::entry::{
    check_header, encode_header, WalEntry, TAG_COMMIT, TAG_ENTRY, WAL_HEADER_LEN,
};
use crate::wal::Wal;
use crate::WAL_FILE;

/// Outcome of a raw log scan.
pub struct ScanResult {
    /// Entries of every committed batch, in append order.
    pub entries: Vec<WalEntry>,
    /// Sequence number of the last commit record.
    pub last_seq: u64,
    /// Entry records discarded as uncommitted tail.
    pub discarded: usize,
}

/// Walk the records after the header, validating CRCs, and return the
/// committed prefix. The scan stops at the first torn, unknown, or
/// checksum-failing record; whatever batch was open at that point is the
/// discarded tail.
pub fn scan_records(raw: &[u8]) -> ScanResult {
    let mut pos = WAL_HEADER_LEN as usize;
    let mut entries = Vec::new();
    let mut last_seq = 0u64;
    let mut batch: Vec<&[u8]> = Vec::new();

    while pos < raw.len() {
        match raw[pos] {
            TAG_ENTRY => {
                if pos + 5 > raw.len() {
                    break;
                }
                let len = u32::from_le_bytes(raw[pos + 1..pos + 5].try_into().unwrap()) as usize;
                let payload_start = pos + 5;
                let crc_start = payload_start + len;
                if crc_start + 4 > raw.len() {
                    break;
                }
                let payload = &raw[payload_start..crc_start];
                let stored = u32::from_le_bytes(raw[crc_start..crc_start + 4].try_into().unwrap());
                if crc32fast::hash(payload) != stored {
                    warn!(offset = pos, "entry checksum mismatch, discarding tail");
                    break;
                }
                batch.push(payload);
                pos = crc_start + 4;
            }
            TAG_COMMIT => {
                if pos + 13 > raw.len() {
                    break;
                }
                let seq = u64::from_le_bytes(raw[pos + 1..pos + 9].try_into().unwrap());
                let stored = u32::from_le_bytes(raw[pos + 9..pos + 13].try_into().unwrap());
                let mut hasher = crc32fast::Hasher::new();
                for p in &batch {
                    hasher.update(p);
                }
                if hasher.finalize() != stored {
                    warn!(offset = pos, seq, "commit checksum mismatch, discarding tail");
                    break;
                }
                let mut decoded = Vec::with_capacity(batch.len());
                let mut ok = true;
                for p in &batch {
                    match WalEntry::decode(p) {
                        Ok(e) => decoded.push(e),
                        Err(err) => {
                            warn!(%err, seq, "undecodable committed entry, discarding batch");
                            ok = false;
                            break;
                        }
                    }
                }
                if !ok {
                    break;
                }
                entries.extend(decoded);
                last_seq = seq;
                batch.clear();
                pos += 13;
            }
            other => {
                warn!(offset = pos, tag = other, "unknown record tag, discarding tail");
                break;
            }
        }
    }

    ScanResult {
        entries,
        last_seq,
        discarded: batch.len(),
    }
}

impl Wal {
    /// Bring the WAL and all folder state up from disk. Called once at
    /// startup, before the sync loop exists.
    pub fn load(&self, settings: &Settings) -> Result<()> {
        let wal_path = self.persist_dir.join(WAL_FILE);

        let mut committed = Vec::new();
        let mut last_seq = 0u64;
        if self.fs.exists(&wal_path) {
            let raw = self.fs.read(&wal_path)?;
            if raw.len() >= WAL_HEADER_LEN as usize {
                check_header(&raw, self.sector_size)?;
                let scan = scan_records(&raw);
                info!(
                    committed = scan.entries.len(),
                    discarded = scan.discarded,
                    last_seq = scan.last_seq,
                    "write-ahead log scanned"
                );
                committed = scan.entries;
                last_seq = scan.last_seq;
            }
            // A file shorter than its header is a crash during creation;
            // treat it as empty.
        }

        // Folders named by the settings document.
        let mut folders: HashMap<u16, Arc<StorageFolder>> = HashMap::new();
        let mut locations: HashMap<SectorId, SectorLocation> = HashMap::new();
        for fset in &settings.folders {
            match StorageFolder::open(
                self.fs.as_ref(),
                fset.id,
                &fset.path,
                fset.capacity,
                self.sector_size,
            ) {
                Ok((folder, records)) => {
                    for rec in records {
                        insert_location(
                            &mut locations,
                            rec.id,
                            SectorLocation {
                                folder: fset.id,
                                index: rec.slot,
                                count: rec.count,
                            },
                        );
                    }
                    folders.insert(fset.id, folder);
                }
                Err(err) => {
                    warn!(
                        folder = fset.id,
                        path = %fset.path.display(),
                        %err,
                        "storage folder failed to open, marking unavailable"
                    );
                    folders.insert(
                        fset.id,
                        StorageFolder::unavailable(
                            fset.id,
                            &fset.path,
                            fset.capacity,
                            self.sector_size,
                        ),
                    );
                }
            }
        }

        // Replay newer-than-metadata committed changes.
        let mut settings_changed = false;
        for e in &committed {
            self.replay_entry(e, &mut folders, &mut locations, &mut settings_changed);
        }
        for folder in folders.values() {
            let _ = folder.sync_metadata();
        }
        verify_consistency(&folders, &locations);

        // Persist the folder set before the log that produced it goes away.
        {
            let mut st = self.lock_state();
            st.folders = folders;
            st.locations = locations;
            st.settings_version = settings.version;
            st.next_seq = last_seq + 1;
            st.committed_seq = last_seq;
        }
        if settings_changed {
            self.flush_settings();
        }

        // Fresh, truncated log with a clean header.
        let file = self.fs.create(&wal_path)?;
        file.write_at(&encode_header(self.sector_size), 0)?;
        file.sync_all()?;
        self.fs.sync_dir(&self.persist_dir)?;
        let mut st = self.lock_state();
        st.file = Some(file);
        st.file_len = WAL_HEADER_LEN;
        Ok(())
    }

    fn replay_entry(
        &self,
        e: &WalEntry,
        folders: &mut HashMap<u16, Arc<StorageFolder>>,
        locations: &mut HashMap<SectorId, SectorLocation>,
        settings_changed: &mut bool,
    ) {
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
                let Some(f) = folders.get(folder) else {
                    warn!(%id, folder, "sector entry references missing folder");
                    return;
                };
                {
                    // Bounds guard: a normalized metadata file can be
                    // smaller than the layout this entry was written
                    // against; later entries in the log re-grow it first.
                    let mut usage = f.usage.lock().unwrap();
                    if *index >= usage.capacity {
                        warn!(%id, folder, index, "sector entry past folder capacity");
                        return;
                    }
                    if !usage.is_set(*index) {
                        usage.set(*index);
                    }
                }
                locations.insert(
                    *id,
                    SectorLocation {
                        folder: *folder,
                        index: *index,
                        count: *count,
                    },
                );
                let _ = f.apply_set_slot(*index, *id, *count);
            }
            WalEntry::AddSector { id, .. } => {
                warn!(%id, "add entry with zero reference count ignored");
            }
            WalEntry::RemoveSector {
                id, folder, index, ..
            } => {
                locations.remove(id);
                if let Some(f) = folders.get(folder) {
                    let mut usage = f.usage.lock().unwrap();
                    if *index < usage.capacity && usage.is_set(*index) {
                        usage.clear(*index);
                    }
                    drop(usage);
                    let _ = f.apply_clear_slot(*index);
                }
            }
            WalEntry::AddFolder {
                folder,
                capacity,
                path,
            } => {
                *settings_changed = true;
                if folders.contains_key(folder) {
                    return;
                }
                match StorageFolder::open(
                    self.fs.as_ref(),
                    *folder,
                    path,
                    *capacity,
                    self.sector_size,
                ) {
                    Ok((f, records)) => {
                        for rec in records {
                            insert_location(
                                locations,
                                rec.id,
                                SectorLocation {
                                    folder: *folder,
                                    index: rec.slot,
                                    count: rec.count,
                                },
                            );
                        }
                        folders.insert(*folder, f);
                    }
                    Err(err) => {
                        warn!(folder, %err, "committed folder missing on disk");
                        folders.insert(
                            *folder,
                            StorageFolder::unavailable(*folder, path, *capacity, self.sector_size),
                        );
                    }
                }
            }
            WalEntry::GrowFolder {
                folder,
                new_capacity,
            } => {
                *settings_changed = true;
                let Some(f) = folders.get(folder) else {
                    warn!(folder, "grow entry references missing folder");
                    return;
                };
                let needs_grow = {
                    let mut usage = f.usage.lock().unwrap();
                    let grow = usage.capacity < *new_capacity;
                    if grow {
                        usage.grow_to(*new_capacity);
                    }
                    grow
                };
                if needs_grow {
                    let _ = f.rebuild_metadata(self.fs.as_ref(), *new_capacity);
                    let _ = f.ensure_data_len(*new_capacity);
                }
            }
            WalEntry::ShrinkFolder {
                folder,
                new_capacity,
            } => {
                *settings_changed = true;
                let Some(f) = folders.get(folder) else {
                    warn!(folder, "shrink entry references missing folder");
                    return;
                };
                {
                    let mut usage = f.usage.lock().unwrap();
                    if usage.capacity <= *new_capacity {
                        return;
                    }
                    for slot in *new_capacity..usage.capacity {
                        if usage.is_set(slot) {
                            warn!(folder, slot, "occupied slot in departing region at replay");
                            usage.clear(slot);
                            locations
                                .retain(|_, l| !(l.folder == *folder && l.index == slot));
                        }
                    }
                    usage.shrink_to(*new_capacity);
                }
                let _ = f.rebuild_metadata(self.fs.as_ref(), *new_capacity);
                let _ = f.truncate_data(*new_capacity);
            }
            WalEntry::RemoveFolder { folder, .. } => {
                *settings_changed = true;
                if let Some(f) = folders.remove(folder) {
                    f.delete_files(self.fs.as_ref());
                }
                locations.retain(|_, l| l.folder != *folder);
            }
            WalEntry::UpdateSettings { .. } => {
                *settings_changed = true;
            }
        }
    }
}

fn insert_location(
    locations: &mut HashMap<SectorId, SectorLocation>,
    id: SectorId,
    loc: SectorLocation,
) {
    if let Some(prev) = locations.insert(id, loc) {
        if prev != loc {
            warn!(
                %id,
                prev_folder = prev.folder,
                folder = loc.folder,
                "duplicate sector location, trusting newest"
            );
        }
    }
}

/// Index–bitmap agreement check; disagreements are logged, never fatal.
fn verify_consistency(
    folders: &HashMap<u16, Arc<StorageFolder>>,
    locations: &HashMap<SectorId, SectorLocation>,
) {
    let mut per_folder: HashMap<u16, u32> = HashMap::new();
    for loc in locations.values() {
        *per_folder.entry(loc.folder).or_insert(0) += 1;
    }
    for (id, folder) in folders {
        if !folder.is_available() {
            continue;
        }
        let used = folder.usage.lock().unwrap().used();
        let indexed = per_folder.get(id).copied().unwrap_or(0);
        if used != indexed {
            warn!(
                folder = *id,
                bitmap = used,
                indexed,
                "bitmap and location index disagree"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::entry::{frame_commit, frame_entry};

    fn raw_log(batches: &[&[WalEntry]], corrupt_last_commit: bool) -> Vec<u8> {
        let mut raw = encode_header(4096).to_vec();
        let n = batches.len();
        for (i, batch) in batches.iter().enumerate() {
            let mut hasher = crc32fast::Hasher::new();
            for e in batch.iter() {
                let payload = e.encode();
                hasher.update(&payload);
                raw.extend_from_slice(&frame_entry(&payload));
            }
            let mut crc = hasher.finalize();
            if corrupt_last_commit && i == n - 1 {
                crc ^= 0xDEAD_BEEF;
            }
            raw.extend_from_slice(&frame_commit((i + 1) as u64, crc));
        }
        raw
    }

    fn add(id_byte: u8, index: u32) -> WalEntry {
        WalEntry::AddSector {
            id: SectorId([id_byte; 12]),
            folder: 0,
            index,
            count: 1,
        }
    }

    #[test]
    fn test_scan_empty_log() {
        let raw = encode_header(4096).to_vec();
        let scan = scan_records(&raw);
        assert!(scan.entries.is_empty());
        assert_eq!(scan.last_seq, 0);
    }

    #[test]
    fn test_scan_committed_batches() {
        let raw = raw_log(&[&[add(1, 0), add(2, 1)], &[add(3, 2)]], false);
        let scan = scan_records(&raw);
        assert_eq!(scan.entries.len(), 3);
        assert_eq!(scan.last_seq, 2);
        assert_eq!(scan.discarded, 0);
    }

    #[test]
    fn test_scan_discards_uncommitted_tail() {
        let mut raw = raw_log(&[&[add(1, 0)]], false);
        // Dangling entries with no commit record behind them.
        raw.extend_from_slice(&frame_entry(&add(9, 9).encode()));
        raw.extend_from_slice(&frame_entry(&add(8, 8).encode()));

        let scan = scan_records(&raw);
        assert_eq!(scan.entries.len(), 1);
        assert_eq!(scan.last_seq, 1);
        assert_eq!(scan.discarded, 2);
    }

    #[test]
    fn test_scan_stops_at_bad_commit_crc() {
        let raw = raw_log(&[&[add(1, 0)], &[add(2, 1)]], true);
        let scan = scan_records(&raw);
        assert_eq!(scan.entries.len(), 1);
        assert_eq!(scan.last_seq, 1);
    }

    #[test]
    fn test_scan_stops_at_torn_entry() {
        let mut raw = raw_log(&[&[add(1, 0)]], false);
        let frame = frame_entry(&add(5, 5).encode());
        raw.extend_from_slice(&frame[..frame.len() / 2]);

        let scan = scan_records(&raw);
        assert_eq!(scan.entries.len(), 1);
    }

    #[test]
    fn test_scan_stops_at_corrupt_entry_payload() {
        let mut raw = raw_log(&[&[add(1, 0)]], false);
        let mut frame = frame_entry(&add(5, 5).encode());
        let mid = frame.len() / 2;
        frame[mid] ^= 0xFF;
        raw.extend_from_slice(&frame);
        raw.extend_from_slice(&frame_commit(2, 0));

        let scan = scan_records(&raw);
        assert_eq!(scan.entries.len(), 1);
        assert_eq!(scan.last_seq, 1);
    }
}
