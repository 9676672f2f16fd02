//! Deterministic salted slot placement.
//!
//! The sector id is already an adversary-proof random value (keyed hash
//! under the host's secret salt), so placement just folds it: the first
//! eight id bytes pick a folder, weighted by each folder's free-slot count
//! so wear spreads with capacity and full folders are never chosen; the last
//! eight bytes pick the probe start inside the folder, and a linear probe
//! over the usage bitmap finds the first open slot. With a fixed salt and
//! identical folder occupancy the same sector always lands in the same
//! place.

use std::collections::HashMap;
use std::sync::Arc;

use crate::folder::StorageFolder;
use crate::index::SectorId;

/// Choose a folder and slot for a new sector. Callers hold the WAL mutex;
/// the chosen slot is still free when this returns.
pub fn pick_slot(
    folders: &HashMap<u16, Arc<StorageFolder>>,
    id: &SectorId,
) -> Option<(u16, u32)> {
    let mut ordered: Vec<&Arc<StorageFolder>> = folders
        .values()
        .filter(|f| f.is_available())
        .collect();
    ordered.sort_by_key(|f| f.id);

    let mut total_free: u64 = 0;
    let mut frees = Vec::with_capacity(ordered.len());
    for f in &ordered {
        let free = f.usage.lock().unwrap().free as u64;
        frees.push(free);
        total_free += free;
    }
    if total_free == 0 {
        return None;
    }

    let fold = u64::from_le_bytes(id.as_bytes()[..8].try_into().unwrap());
    let mut r = fold % total_free;
    for (f, free) in ordered.iter().zip(frees) {
        if r < free {
            let usage = f.usage.lock().unwrap();
            let start_fold = u64::from_le_bytes(id.as_bytes()[4..12].try_into().unwrap());
            let start = (start_fold % usage.capacity as u64) as u32;
            let slot = usage.probe(start)?;
            return Some((f.id, slot));
        }
        r -= free;
    }
    None
}
