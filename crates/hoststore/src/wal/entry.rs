//! WAL logical entries and the on-disk record framing.
//!
//! File header (16 bytes): magic(8) | version(u16 LE) | sector_size(u32 LE)
//! | 2 reserved bytes. After the header the file is a sequence of records,
//! each introduced by a one-byte tag:
//!
//! - entry record:  `0x01 | len(u32 LE) | payload | crc32(payload)`
//! - commit record: `0xC7 | sequence(u64 LE) | crc32(all entry payloads
//!   since the previous commit record, in order)`
//!
//! Everything after the last valid commit record is an uncommitted tail and
//! is discarded during recovery.

use std::path::PathBuf;

use crate::error::{Result, StoreError};
use crate::index::SectorId;

pub const WAL_MAGIC: [u8; 8] = *b"HOSTWAL\x01";
pub const WAL_VERSION: u16 = 1;
pub const WAL_HEADER_LEN: u64 = 16;

pub const TAG_ENTRY: u8 = 0x01;
pub const TAG_COMMIT: u8 = 0xC7;

/// Length of a commit record including its tag byte.
pub const COMMIT_RECORD_LEN: u64 = 1 + 8 + 4;

const KIND_ADD_SECTOR: u8 = 1;
const KIND_REMOVE_SECTOR: u8 = 2;
const KIND_ADD_FOLDER: u8 = 3;
const KIND_GROW_FOLDER: u8 = 4;
const KIND_SHRINK_FOLDER: u8 = 5;
const KIND_REMOVE_FOLDER: u8 = 6;
const KIND_UPDATE_SETTINGS: u8 = 7;

/// One logical state transition.
///
/// Sector entries carry the reference count *after* the operation, which
/// makes replay idempotent: applying an entry twice writes the same record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalEntry {
    AddSector {
        id: SectorId,
        folder: u16,
        index: u32,
        count: u16,
    },
    RemoveSector {
        id: SectorId,
        folder: u16,
        index: u32,
        /// Remaining references; zero frees the slot.
        count: u16,
    },
    AddFolder {
        folder: u16,
        capacity: u32,
        path: PathBuf,
    },
    GrowFolder {
        folder: u16,
        new_capacity: u32,
    },
    ShrinkFolder {
        folder: u16,
        new_capacity: u32,
    },
    RemoveFolder {
        folder: u16,
        force: bool,
    },
    UpdateSettings {
        version: u64,
    },
}

impl WalEntry {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32);
        match self {
            WalEntry::AddSector {
                id,
                folder,
                index,
                count,
            } => {
                out.push(KIND_ADD_SECTOR);
                out.extend_from_slice(id.as_bytes());
                out.extend_from_slice(&folder.to_le_bytes());
                out.extend_from_slice(&index.to_le_bytes());
                out.extend_from_slice(&count.to_le_bytes());
            }
            WalEntry::RemoveSector {
                id,
                folder,
                index,
                count,
            } => {
                out.push(KIND_REMOVE_SECTOR);
                out.extend_from_slice(id.as_bytes());
                out.extend_from_slice(&folder.to_le_bytes());
                out.extend_from_slice(&index.to_le_bytes());
                out.extend_from_slice(&count.to_le_bytes());
            }
            WalEntry::AddFolder {
                folder,
                capacity,
                path,
            } => {
                out.push(KIND_ADD_FOLDER);
                out.extend_from_slice(&folder.to_le_bytes());
                out.extend_from_slice(&capacity.to_le_bytes());
                let raw = path_bytes(path);
                out.extend_from_slice(&(raw.len() as u16).to_le_bytes());
                out.extend_from_slice(raw);
            }
            WalEntry::GrowFolder {
                folder,
                new_capacity,
            } => {
                out.push(KIND_GROW_FOLDER);
                out.extend_from_slice(&folder.to_le_bytes());
                out.extend_from_slice(&new_capacity.to_le_bytes());
            }
            WalEntry::ShrinkFolder {
                folder,
                new_capacity,
            } => {
                out.push(KIND_SHRINK_FOLDER);
                out.extend_from_slice(&folder.to_le_bytes());
                out.extend_from_slice(&new_capacity.to_le_bytes());
            }
            WalEntry::RemoveFolder { folder, force } => {
                out.push(KIND_REMOVE_FOLDER);
                out.extend_from_slice(&folder.to_le_bytes());
                out.push(u8::from(*force));
            }
            WalEntry::UpdateSettings { version } => {
                out.push(KIND_UPDATE_SETTINGS);
                out.extend_from_slice(&version.to_le_bytes());
            }
        }
        out
    }

    pub fn decode(payload: &[u8]) -> Result<WalEntry> {
        let corrupt = |detail: &str| StoreError::Corrupt {
            what: "wal entry",
            detail: detail.to_string(),
        };
        let kind = *payload.first().ok_or_else(|| corrupt("empty payload"))?;
        let body = &payload[1..];
        match kind {
            KIND_ADD_SECTOR | KIND_REMOVE_SECTOR => {
                if body.len() != 20 {
                    return Err(corrupt("bad sector entry length"));
                }
                let mut idb = [0u8; 12];
                idb.copy_from_slice(&body[..12]);
                let folder = u16::from_le_bytes([body[12], body[13]]);
                let index = u32::from_le_bytes(body[14..18].try_into().unwrap());
                let count = u16::from_le_bytes([body[18], body[19]]);
                let id = SectorId(idb);
                Ok(if kind == KIND_ADD_SECTOR {
                    WalEntry::AddSector {
                        id,
                        folder,
                        index,
                        count,
                    }
                } else {
                    WalEntry::RemoveSector {
                        id,
                        folder,
                        index,
                        count,
                    }
                })
            }
            KIND_ADD_FOLDER => {
                if body.len() < 8 {
                    return Err(corrupt("bad folder entry length"));
                }
                let folder = u16::from_le_bytes([body[0], body[1]]);
                let capacity = u32::from_le_bytes(body[2..6].try_into().unwrap());
                let path_len = u16::from_le_bytes([body[6], body[7]]) as usize;
                if body.len() != 8 + path_len {
                    return Err(corrupt("bad folder path length"));
                }
                Ok(WalEntry::AddFolder {
                    folder,
                    capacity,
                    path: path_from_bytes(&body[8..]),
                })
            }
            KIND_GROW_FOLDER | KIND_SHRINK_FOLDER => {
                if body.len() != 6 {
                    return Err(corrupt("bad resize entry length"));
                }
                let folder = u16::from_le_bytes([body[0], body[1]]);
                let new_capacity = u32::from_le_bytes(body[2..6].try_into().unwrap());
                Ok(if kind == KIND_GROW_FOLDER {
                    WalEntry::GrowFolder {
                        folder,
                        new_capacity,
                    }
                } else {
                    WalEntry::ShrinkFolder {
                        folder,
                        new_capacity,
                    }
                })
            }
            KIND_REMOVE_FOLDER => {
                if body.len() != 3 {
                    return Err(corrupt("bad remove entry length"));
                }
                Ok(WalEntry::RemoveFolder {
                    folder: u16::from_le_bytes([body[0], body[1]]),
                    force: body[2] != 0,
                })
            }
            KIND_UPDATE_SETTINGS => {
                if body.len() != 8 {
                    return Err(corrupt("bad settings entry length"));
                }
                Ok(WalEntry::UpdateSettings {
                    version: u64::from_le_bytes(body.try_into().unwrap()),
                })
            }
            other => Err(StoreError::Corrupt {
                what: "wal entry",
                detail: format!("unknown entry kind {other}"),
            }),
        }
    }
}

#[cfg(unix)]
fn path_bytes(path: &std::path::Path) -> &[u8] {
    use std::os::unix::ffi::OsStrExt;
    path.as_os_str().as_bytes()
}

#[cfg(unix)]
fn path_from_bytes(raw: &[u8]) -> PathBuf {
    use std::os::unix::ffi::OsStringExt;
    PathBuf::from(std::ffi::OsString::from_vec(raw.to_vec()))
}

pub fn encode_header(sector_size: u32) -> [u8; WAL_HEADER_LEN as usize] {
    let mut h = [0u8; WAL_HEADER_LEN as usize];
    h[..8].copy_from_slice(&WAL_MAGIC);
    h[8..10].copy_from_slice(&WAL_VERSION.to_le_bytes());
    h[10..14].copy_from_slice(&sector_size.to_le_bytes());
    h
}

pub fn check_header(raw: &[u8], expected_sector_size: u32) -> Result<()> {
    if raw.len() < WAL_HEADER_LEN as usize || raw[..8] != WAL_MAGIC {
        return Err(StoreError::Corrupt {
            what: "wal",
            detail: "bad magic".to_string(),
        });
    }
    let version = u16::from_le_bytes([raw[8], raw[9]]);
    if version != WAL_VERSION {
        return Err(StoreError::Corrupt {
            what: "wal",
            detail: format!("unsupported version {version}"),
        });
    }
    let sector_size = u32::from_le_bytes(raw[10..14].try_into().unwrap());
    if sector_size != expected_sector_size {
        return Err(StoreError::Corrupt {
            what: "wal",
            detail: format!(
                "wal written with {sector_size}-byte sectors, engine configured for {expected_sector_size}"
            ),
        });
    }
    Ok(())
}

/// Frame an entry payload for appending.
pub fn frame_entry(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 9);
    out.push(TAG_ENTRY);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    out.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    out
}

/// Frame a commit record for appending.
pub fn frame_commit(sequence: u64, batch_crc: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(COMMIT_RECORD_LEN as usize);
    out.push(TAG_COMMIT);
    out.extend_from_slice(&sequence.to_le_bytes());
    out.extend_from_slice(&batch_crc.to_le_bytes());
    out
}
