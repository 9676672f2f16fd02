//! Unclean-shutdown tests: the committed prefix of the log survives, the
//! uncommitted tail vanishes, and accounting is never torn.
//!
//! "Crashing" here means abandoning a manager without `close()` while the
//! fault filesystem pins the sync loop (`haltCommit`) and discards held
//! unsynced writes, then reopening the persist directory with a fresh
//! filesystem. Threads left blocking on durability are leaked on purpose;
//! their process would have died.

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tempfile::TempDir;

use hoststore::{ContractManager, Options, StoreError};
use hoststore_fs::fault::FaultFs;
use hoststore_fs::{ProductionFs, SystemClock};

const SECTOR: u32 = 4096;

fn test_options() -> Options {
    Options {
        sector_size: SECTOR,
        sync_interval: Duration::from_millis(25),
    }
}

fn open_with(fs: Arc<dyn hoststore_fs::HostFs>, dir: &Path) -> ContractManager {
    ContractManager::with_options(fs, Arc::new(SystemClock), dir, test_options()).unwrap()
}

fn root(seed: u32) -> [u8; 32] {
    let mut r = [0u8; 32];
    r[..4].copy_from_slice(&seed.to_le_bytes());
    r
}

fn payload(seed: u32) -> Vec<u8> {
    let mut p = vec![0u8; SECTOR as usize];
    for (i, b) in p.iter_mut().enumerate() {
        *b = (seed as usize * 31 + i) as u8;
    }
    p
}

#[test]
fn test_uncommitted_tail_is_discarded_on_restart() {
    let dir = TempDir::new().unwrap();
    let persist = dir.path().join("persist");
    let fault = FaultFs::new();
    fault.hold_unsynced("contractmanager.wal");

    let cm = Arc::new(open_with(Arc::new(fault.clone()), &persist));
    cm.add_storage_folder(&dir.path().join("folder-a"), 64).unwrap();

    // These complete their durability wait, so they must survive.
    for i in 0..20 {
        cm.add_sector(root(i), &payload(i)).unwrap();
    }

    // Pin the sync loop, then stage writes that can never commit.
    fault.set_disrupt("haltCommit", true);
    let mut pending = Vec::new();
    for i in 100..112 {
        let cm = Arc::clone(&cm);
        pending.push(thread::spawn(move || {
            // Blocks forever in the durability wait; leaked like the
            // process it models.
            let _ = cm.add_sector(root(i), &payload(i));
        }));
    }
    thread::sleep(Duration::from_millis(300));

    // Power cut: everything unsynced in the WAL is gone.
    fault.crash();

    let cm2 = open_with(Arc::new(ProductionFs), &persist);
    for i in 0..20 {
        let id = cm2.sector_id(&root(i));
        assert_eq!(cm2.read_sector(id).unwrap(), payload(i), "sector {i}");
    }
    for i in 100..112 {
        let id = cm2.sector_id(&root(i));
        assert!(
            matches!(cm2.read_sector(id), Err(StoreError::UnknownSector)),
            "uncommitted sector {i} resurfaced"
        );
    }
    // Bitmap agrees with the surviving index.
    assert_eq!(cm2.storage_folders().unwrap()[0].used, 20);
    cm2.close().unwrap();
}

#[test]
fn test_every_acknowledged_operation_survives_a_crash() {
    let dir = TempDir::new().unwrap();
    let persist = dir.path().join("persist");
    let fault = FaultFs::new();
    fault.hold_unsynced("contractmanager.wal");

    let cm = open_with(Arc::new(fault.clone()), &persist);
    cm.add_storage_folder(&dir.path().join("folder-a"), 64).unwrap();

    // A mixed acknowledged workload: adds, a refcount bump, removals.
    let keep: Vec<u32> = (0..10).collect();
    for &i in &keep {
        cm.add_sector(root(i), &payload(i)).unwrap();
    }
    cm.add_sector(root(0), &payload(0)).unwrap(); // count -> 2
    cm.remove_sector(cm.sector_id(&root(9))).unwrap();

    // Crash with nothing in flight: an acknowledged operation was durable
    // by definition, so the replayed state must match exactly.
    fault.set_disrupt("haltCommit", true);
    fault.crash();
    drop(cm);

    let cm2 = open_with(Arc::new(ProductionFs), &persist);
    for &i in &keep[..9] {
        let id = cm2.sector_id(&root(i));
        assert_eq!(cm2.read_sector(id).unwrap(), payload(i));
    }
    assert!(matches!(
        cm2.read_sector(cm2.sector_id(&root(9))),
        Err(StoreError::UnknownSector)
    ));
    assert_eq!(cm2.storage_folders().unwrap()[0].used, 9);

    // The refcount bump on sector 0 survived too: one removal keeps it.
    cm2.remove_sector(cm2.sector_id(&root(0))).unwrap();
    assert_eq!(
        cm2.read_sector(cm2.sector_id(&root(0))).unwrap(),
        payload(0)
    );
    cm2.close().unwrap();
}

#[test]
fn test_unclean_shutdown_without_fault_injection() {
    let dir = TempDir::new().unwrap();
    let persist = dir.path().join("persist");
    let fault = FaultFs::new();

    let cm = open_with(Arc::new(fault.clone()), &persist);
    cm.add_storage_folder(&dir.path().join("folder-a"), 64).unwrap();
    for i in 0..8 {
        cm.add_sector(root(i), &payload(i)).unwrap();
    }
    // Freeze the old instance's sync loop instead of closing, then abandon
    // it; its thread stays pinned and inert.
    fault.set_disrupt("haltCommit", true);
    drop(cm);

    let cm2 = open_with(Arc::new(ProductionFs), &persist);
    for i in 0..8 {
        let id = cm2.sector_id(&root(i));
        assert_eq!(cm2.read_sector(id).unwrap(), payload(i));
    }
    cm2.close().unwrap();
}

#[test]
fn test_disrupted_startup_cleans_up() {
    let dir = TempDir::new().unwrap();
    let persist = dir.path().join("persist");
    let fault = FaultFs::new();
    fault.set_disrupt("erroredStartup", true);

    let err = ContractManager::with_options(
        Arc::new(fault.clone()),
        Arc::new(SystemClock),
        &persist,
        test_options(),
    );
    assert!(err.is_err());

    // The aborted startup released everything; a clean open works.
    fault.set_disrupt("erroredStartup", false);
    let cm = open_with(Arc::new(fault), &persist);
    cm.add_storage_folder(&dir.path().join("folder-a"), 64).unwrap();
    let id = cm.add_sector(root(1), &payload(1)).unwrap();
    assert_eq!(cm.read_sector(id).unwrap(), payload(1));
    cm.close().unwrap();
}

#[test]
fn test_repeated_crash_and_recover_cycles_stay_consistent() {
    let dir = TempDir::new().unwrap();
    let persist = dir.path().join("persist");

    let mut expected: Vec<u32> = Vec::new();
    for round in 0..4u32 {
        let fault = FaultFs::new();
        fault.hold_unsynced("contractmanager.wal");
        let cm = open_with(Arc::new(fault.clone()), &persist);
        if round == 0 {
            cm.add_storage_folder(&dir.path().join("folder-a"), 128).unwrap();
        }

        // Verify everything acknowledged so far, then extend the workload.
        for &i in &expected {
            let id = cm.sector_id(&root(i));
            assert_eq!(cm.read_sector(id).unwrap(), payload(i), "round {round}");
        }
        for i in (round * 10)..(round * 10 + 10) {
            cm.add_sector(root(i), &payload(i)).unwrap();
            expected.push(i);
        }
        fault.set_disrupt("haltCommit", true);
        fault.crash();
        drop(cm);
    }

    let cm = open_with(Arc::new(ProductionFs), &persist);
    assert_eq!(cm.storage_folders().unwrap()[0].used, expected.len() as u32);
    for &i in &expected {
        let id = cm.sector_id(&root(i));
        assert_eq!(cm.read_sector(id).unwrap(), payload(i));
    }
    cm.close().unwrap();
}
