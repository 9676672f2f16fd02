//! Engine error taxonomy.
//!
//! Precondition and capacity errors are surfaced without any state change.
//! Transient disk errors mark the affected folder unavailable and keep the
//! engine running. Errors on the control files (WAL, settings) are fatal and
//! raised as panics by the sync loop; at startup they surface as `Io`/
//! `Corrupt` results instead so a caller can decide what to do with a broken
//! persist directory.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    /// The thread group has been stopped; the engine is shutting down.
    #[error("contract manager has been stopped")]
    Stopped,

    #[error("sector payload is {actual} bytes, expected {expected}")]
    SizeMismatch { expected: u32, actual: usize },

    #[error("unknown sector")]
    UnknownSector,

    #[error("unknown storage folder {id}")]
    UnknownFolder { id: u16 },

    #[error("no free sector slots in any storage folder")]
    StorageFull,

    #[error("sector reference count is at its maximum")]
    TooManyReferences,

    #[error("storage folder path already in use: {path}")]
    FolderPathInUse { path: PathBuf },

    #[error("folder capacity {capacity} is not a multiple of {granularity} slots")]
    UnalignedCapacity { capacity: u32, granularity: u32 },

    #[error("folder capacity {capacity} outside supported range [{min}, {max}]")]
    CapacityOutOfRange { capacity: u32, min: u32, max: u32 },

    #[error("too many storage folders (limit {limit})")]
    TooManyFolders { limit: usize },

    #[error("insufficient space on device: need {needed} bytes, {available} available")]
    InsufficientSpace { needed: u64, available: u64 },

    /// A shrink or removal could not relocate every resident sector.
    #[error("cannot relocate all sectors out of the departing region")]
    ShrinkImpossible,

    /// Another structural operation already runs on this folder.
    #[error("storage folder {id} has a structural operation in progress")]
    FolderBusy { id: u16 },

    /// Read or write on a storage folder's files failed; the folder has been
    /// marked unavailable.
    #[error("disk error on storage folder {folder}")]
    DiskError { folder: u16 },

    #[error("storage folder {folder} is unavailable")]
    FolderUnavailable { folder: u16 },

    /// Persist-directory file is not something this engine wrote.
    #[error("corrupt {what}: {detail}")]
    Corrupt {
        what: &'static str,
        detail: String,
    },

    #[error("settings document error: {0}")]
    SettingsJson(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;
