//! Per-sector mutual exclusion.
//!
//! Any interaction with a sector's payload or its location entry happens
//! under that sector's lock. Callers working on different ids never contend;
//! callers on the same id serialize. The table entry carries a waiter count
//! so the last unlocker can drop the entry and keep the map from growing
//! without bound.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};

use crate::index::SectorId;

#[derive(Default)]
struct LockEntry {
    locked: bool,
    waiters: u32,
}

#[derive(Default)]
pub struct SectorLocks {
    table: Mutex<HashMap<SectorId, LockEntry>>,
    cv: Condvar,
}

impl SectorLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the exclusive lock for `id`, blocking while another caller
    /// holds it.
    pub fn lock(&self, id: SectorId) {
        let mut table = self.table.lock().unwrap();
        loop {
            let entry = table.entry(id).or_default();
            if !entry.locked {
                entry.locked = true;
                return;
            }
            entry.waiters += 1;
            table = self.cv.wait(table).unwrap();
            if let Some(entry) = table.get_mut(&id) {
                entry.waiters -= 1;
            }
        }
    }

    /// Release the lock for `id`. The entry is removed once nobody waits on
    /// it.
    pub fn unlock(&self, id: SectorId) {
        let mut table = self.table.lock().unwrap();
        let entry = table
            .get_mut(&id)
            .expect("unlock of sector that was never locked");
        entry.locked = false;
        if entry.waiters == 0 {
            table.remove(&id);
        }
        drop(table);
        self.cv.notify_all();
    }

    /// RAII wrapper around [`lock`](Self::lock)/[`unlock`](Self::unlock).
    pub fn guard(&self, id: SectorId) -> SectorGuard<'_> {
        self.lock(id);
        SectorGuard { locks: self, id }
    }

    #[cfg(test)]
    fn entry_count(&self) -> usize {
        self.table.lock().unwrap().len()
    }
}

pub struct SectorGuard<'a> {
    locks: &'a SectorLocks,
    id: SectorId,
}

impl Drop for SectorGuard<'_> {
    fn drop(&mut self) {
        self.locks.unlock(self.id);
    }
}
