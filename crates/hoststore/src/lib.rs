//! # hoststore
//!
//! Crash-safe on-disk storage engine for the sector data a storage host
//! keeps on behalf of renters. Sectors are fixed-size blocks addressed by a
//! salted hash of their content Merkle root; they live in operator-managed
//! storage folders, each a pair of files (a metadata/usage file and a
//! contiguous slot-array data file) on one local disk.
//!
//! Durability and atomicity come from a write-ahead log: every mutation is
//! journalled, batched, and committed by a background sync loop before it is
//! materialized into the per-folder metadata files. Unclean shutdown rolls
//! the engine back to the last committed batch; failure of an individual
//! data disk degrades only the folders on it.
//!
//! ## Primary API surface
//!
//! - [`ContractManager`] - the engine façade: sector add/read/remove plus
//!   storage folder add/resize/remove
//! - [`StorageFolderInfo`] - operator-visible folder snapshot with usage and
//!   health counters
//! - [`SectorId`] - 12-byte salted content address
//!
//! ## Example
//!
//! ```no_run
//! use hoststore::ContractManager;
//!
//! let cm = ContractManager::new("/var/lib/host")?;
//! cm.add_storage_folder("/mnt/disk1/host".as_ref(), 1 << 16)?;
//! let root = [0u8; 32]; // Merkle root of the payload
//! let data = vec![0u8; hoststore::SECTOR_SIZE as usize];
//! let id = cm.add_sector(root, &data)?;
//! assert_eq!(cm.read_sector(id)?, data);
//! cm.close()?;
//! # Ok::<(), hoststore::StoreError>(())
//! ```

mod error;
mod folder;
mod index;
mod manager;
mod placement;
mod sector_lock;
mod settings;
mod thread_group;
mod wal;

pub mod logging;

pub use error::{Result, StoreError};
pub use index::{ContentRoot, SectorId, SectorLocation};
pub use manager::{ContractManager, Options, StorageFolderInfo};
pub use thread_group::{StopSignal, ThreadGroup, TgGuard};

/// Size of one sector on a production host.
pub const SECTOR_SIZE: u32 = 1 << 22;

/// Storage folder capacities are multiples of this many slots, so the usage
/// bitmap is always made of whole 64-bit words.
pub const SLOT_GRANULARITY: u32 = 64;

/// Smallest permitted folder capacity, in slots.
pub const MIN_FOLDER_SLOTS: u32 = SLOT_GRANULARITY;

/// Largest permitted folder capacity, in slots.
pub const MAX_FOLDER_SLOTS: u32 = 1 << 24;

/// Upper bound on simultaneously configured storage folders.
pub const MAX_STORAGE_FOLDERS: usize = 256;

/// File names inside the persist directory.
pub const LOG_FILE: &str = "contractmanager.log";
pub const SETTINGS_FILE: &str = "contractmanager.settings";
pub const WAL_FILE: &str = "contractmanager.wal";

/// File names inside each storage folder.
pub const METADATA_FILE: &str = "siahostmetadata.dat";
pub const SECTOR_DATA_FILE: &str = "siahostdata.dat";
