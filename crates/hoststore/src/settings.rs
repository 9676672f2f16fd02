//! Persistent settings document.
//!
//! `contractmanager.settings` records the host's one-time sector salt, the
//! sector size the persist directory was created with, and the configured
//! storage folders. It is small, JSON, and replaced atomically (tmp → fsync
//! → rename → directory fsync) so a crash never leaves a torn document. The
//! version tag increases by one on every rewrite.
//!
//! Settings are deliberately redundant with the WAL: anything critical that
//! a crash wipes from a freshly written settings file is reconstructed from
//! the committed WAL during recovery.

use std::path::Path;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::debug;

use hoststore_fs::{atomic_replace, HostFs};

use crate::error::{Result, StoreError};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    /// Monotonic rewrite counter.
    pub version: u64,
    /// One-time random salt for sector id derivation. Immutable after first
    /// startup.
    pub sector_salt: [u8; 32],
    /// Sector size this persist directory was initialized with.
    pub sector_size: u32,
    /// Configured storage folders.
    pub folders: Vec<FolderSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FolderSettings {
    pub id: u16,
    pub path: std::path::PathBuf,
    /// Capacity in slots.
    pub capacity: u32,
}

impl Settings {
    /// Fresh settings for a first startup: new random salt, no folders.
    pub fn bootstrap(sector_size: u32) -> Self {
        let mut sector_salt = [0u8; 32];
        OsRng.fill_bytes(&mut sector_salt);
        Settings {
            version: 1,
            sector_salt,
            sector_size,
            folders: Vec::new(),
        }
    }

    /// Load the document at `path`, or `None` if it does not exist yet.
    pub fn load(fs: &dyn HostFs, path: &Path) -> Result<Option<Settings>> {
        if !fs.exists(path) {
            return Ok(None);
        }
        let raw = fs.read(path)?;
        let settings: Settings = serde_json::from_slice(&raw)?;
        debug!(
            version = settings.version,
            folders = settings.folders.len(),
            "loaded settings"
        );
        Ok(Some(settings))
    }

    /// Atomically replace the document at `path` with `self`.
    pub fn save(&self, fs: &dyn HostFs, path: &Path) -> Result<()> {
        let raw = serde_json::to_vec_pretty(self)?;
        atomic_replace(fs, path, &raw)?;
        debug!(version = self.version, "settings saved");
        Ok(())
    }

    pub fn folder(&self, id: u16) -> Option<&FolderSettings> {
        self.folders.iter().find(|f| f.id == id)
    }

    /// Validate a loaded document against the engine this process runs.
    pub fn check(&self, expected_sector_size: u32) -> Result<()> {
        if self.sector_size != expected_sector_size {
            return Err(StoreError::Corrupt {
                what: "settings",
                detail: format!(
                    "persist directory uses {}-byte sectors, engine configured for {}",
                    self.sector_size, expected_sector_size
                ),
            });
        }
        Ok(())
    }
}
