//! Sector identity and the in-memory location index types.
//!
//! A sector id is the first 12 bytes of a keyed blake3 hash of the sector's
//! content Merkle root, keyed with the host's one-time random salt. The salt
//! keeps an adversary who controls uploaded content from predicting which
//! folder (disk) a sector will land on.
//!
//! The location map itself (`HashMap<SectorId, SectorLocation>`) lives
//! inside the WAL's state and is mutated only under the WAL mutex; this
//! module holds the types and the id derivation.

use std::fmt;

/// Content Merkle root of a sector, as handed over by the upload protocol.
pub type ContentRoot = [u8; 32];

/// Salted 12-byte sector address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SectorId(pub [u8; 12]);

impl SectorId {
    pub const LEN: usize = 12;

    /// Derive the id for `root` under `salt`.
    pub fn derive(salt: &[u8; 32], root: &ContentRoot) -> Self {
        let digest = blake3::keyed_hash(salt, root);
        let mut id = [0u8; Self::LEN];
        id.copy_from_slice(&digest.as_bytes()[..Self::LEN]);
        SectorId(id)
    }

    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }

    /// An all-zero id marks a vacant slot record in folder metadata.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 12]
    }
}

impl fmt::Display for SectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for SectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SectorId({self})")
    }
}

/// Where a sector physically lives, plus how many contracts reference it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorLocation {
    /// Owning storage folder.
    pub folder: u16,
    /// Slot index within the folder's data file.
    pub index: u32,
    /// Reference count; the slot is freed when this reaches zero.
    pub count: u16,
}
