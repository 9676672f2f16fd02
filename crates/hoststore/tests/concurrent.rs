//! Parallel-safety tests: many threads mixing adds, reads, and removes
//! serialize cleanly, and a failing disk degrades only its own folder.

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

fn open(dir: &Path) -> ContractManager {
    ContractManager::with_options(
        Arc::new(ProductionFs),
        Arc::new(SystemClock),
        dir,
        test_options(),
    )
    .unwrap()
}

fn root(seed: u32) -> [u8; 32] {
    let mut r = [0u8; 32];
    r[..4].copy_from_slice(&seed.to_le_bytes());
    r
}

fn payload(seed: u32) -> Vec<u8> {
    let mut p = vec![0u8; SECTOR as usize];
    for (i, b) in p.iter_mut().enumerate() {
        *b = (seed as usize).wrapping_mul(17).wrapping_add(i) as u8;
    }
    p
}

#[test]
fn test_parallel_add_read_remove_serializes() {
    let dir = TempDir::new().unwrap();
    let cm = Arc::new(open(&dir.path().join("persist")));
    cm.add_storage_folder(&dir.path().join("folder-a"), 256).unwrap();
    cm.add_storage_folder(&dir.path().join("folder-b"), 256).unwrap();

    const THREADS: u32 = 8;
    const PER_THREAD: u32 = 16;

    let mut handles = Vec::new();
    for t in 0..THREADS {
        let cm = Arc::clone(&cm);
        handles.push(thread::spawn(move || {
            let base = t * 1000;
            let mut kept = Vec::new();
            for i in 0..PER_THREAD {
                let seed = base + i;
                let id = cm.add_sector(root(seed), &payload(seed)).unwrap();
                assert_eq!(cm.read_sector(id).unwrap(), payload(seed));
                if i % 2 == 0 {
                    cm.remove_sector(id).unwrap();
                } else {
                    kept.push((id, seed));
                }
            }
            kept
        }));
    }

    let mut kept = Vec::new();
    for h in handles {
        kept.extend(h.join().unwrap());
    }

    // Exactly the kept sectors remain, each readable with its payload.
    assert_eq!(kept.len(), (THREADS * PER_THREAD / 2) as usize);
    for (id, seed) in &kept {
        assert_eq!(cm.read_sector(*id).unwrap(), payload(*seed));
    }
    for t in 0..THREADS {
        for i in (0..PER_THREAD).step_by(2) {
            let id = cm.sector_id(&root(t * 1000 + i));
            assert!(matches!(cm.read_sector(id), Err(StoreError::UnknownSector)));
        }
    }
    // Freed bits are cleared when their removal materializes, shortly after
    // the durability wait returns.
    let expected = kept.len() as u32;
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let used: u32 = cm
            .storage_folders()
            .unwrap()
            .iter()
            .map(|f| f.used)
            .sum();
        if used == expected {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "used stuck at {used}");
        thread::sleep(Duration::from_millis(10));
    }
    cm.close().unwrap();
}

#[test]
fn test_concurrent_same_content_counts_references() {
    let dir = TempDir::new().unwrap();
    let cm = Arc::new(open(&dir.path().join("persist")));
    cm.add_storage_folder(&dir.path().join("folder-a"), 64).unwrap();

    const WRITERS: usize = 8;
    let mut handles = Vec::new();
    for _ in 0..WRITERS {
        let cm = Arc::clone(&cm);
        handles.push(thread::spawn(move || {
            cm.add_sector(root(42), &payload(42)).unwrap()
        }));
    }
    let ids: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(ids.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(cm.storage_folders().unwrap()[0].used, 1);

    // One removal per writer fully releases the slot, not before.
    for i in 0..WRITERS {
        cm.remove_sector(ids[0]).unwrap();
        if i + 1 < WRITERS {
            assert_eq!(cm.read_sector(ids[0]).unwrap(), payload(42));
        }
    }
    assert!(matches!(
        cm.read_sector(ids[0]),
        Err(StoreError::UnknownSector)
    ));
    cm.close().unwrap();
}

#[test]
fn test_reads_proceed_during_shrink() {
    let dir = TempDir::new().unwrap();
    let cm = Arc::new(open(&dir.path().join("persist")));
    cm.add_storage_folder(&dir.path().join("folder-a"), 128).unwrap();

    let mut stored = Vec::new();
    for i in 0..24 {
        stored.push((cm.add_sector(root(i), &payload(i)).unwrap(), i));
    }
    let fid = cm.storage_folders().unwrap()[0].id;

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let cm = Arc::clone(&cm);
            let stored = stored.clone();
            thread::spawn(move || {
                for _ in 0..50 {
                    for (id, seed) in &stored {
                        assert_eq!(cm.read_sector(*id).unwrap(), payload(*seed));
                    }
                }
            })
        })
        .collect();

    cm.resize_storage_folder(fid, 64).unwrap();
    for r in readers {
        r.join().unwrap();
    }
    assert_eq!(cm.storage_folders().unwrap()[0].capacity, 64);
    cm.close().unwrap();
}

#[test]
fn test_writers_proceed_during_shrink() {
    let dir = TempDir::new().unwrap();
    let cm = Arc::new(open(&dir.path().join("persist")));
    cm.add_storage_folder(&dir.path().join("folder-a"), 128).unwrap();

    // A stable population so the departing region starts occupied.
    let mut stable = Vec::new();
    for i in 0..16 {
        stable.push((cm.add_sector(root(i), &payload(i)).unwrap(), i));
    }
    let fid = cm.storage_folders().unwrap()[0].id;

    // Writers keep adding and removing against the same folder while the
    // shrink evacuates it; shrink serializes against them through the WAL
    // mutex and its tombstone reservations, not the folder lock.
    const WRITERS: u32 = 4;
    const PER_THREAD: u32 = 10;
    let mut handles = Vec::new();
    for t in 0..WRITERS {
        let cm = Arc::clone(&cm);
        handles.push(thread::spawn(move || {
            let base = 1000 + t * 100;
            let mut kept = Vec::new();
            for i in 0..PER_THREAD {
                let seed = base + i;
                let id = cm.add_sector(root(seed), &payload(seed)).unwrap();
                assert_eq!(cm.read_sector(id).unwrap(), payload(seed));
                if i % 2 == 0 {
                    cm.remove_sector(id).unwrap();
                } else {
                    kept.push((id, seed));
                }
            }
            kept
        }));
    }

    thread::sleep(Duration::from_millis(30));
    cm.resize_storage_folder(fid, 64).unwrap();

    let mut kept = Vec::new();
    for h in handles {
        kept.extend(h.join().unwrap());
    }

    // Post-shrink state is exactly the stable set plus what writers kept.
    assert_eq!(cm.storage_folders().unwrap()[0].capacity, 64);
    for (id, seed) in stable.iter().chain(&kept) {
        assert_eq!(cm.read_sector(*id).unwrap(), payload(*seed), "sector {seed}");
    }
    for t in 0..WRITERS {
        for i in (0..PER_THREAD).step_by(2) {
            let id = cm.sector_id(&root(1000 + t * 100 + i));
            assert!(matches!(cm.read_sector(id), Err(StoreError::UnknownSector)));
        }
    }

    // Occupancy settles to exactly the survivors once the last removals
    // materialize, and everything fits inside the shrunk capacity.
    let expected = (stable.len() + kept.len()) as u32;
    assert!(expected <= 64);
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let used: u32 = cm
            .storage_folders()
            .unwrap()
            .iter()
            .map(|f| f.used)
            .sum();
        if used == expected {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "used stuck at {used}");
        thread::sleep(Duration::from_millis(10));
    }
    cm.close().unwrap();
}

#[test]
fn test_read_failure_degrades_only_one_folder() {
    let dir = TempDir::new().unwrap();
    let fault = FaultFs::new();
    let cm = ContractManager::with_options(
        Arc::new(fault.clone()),
        Arc::new(SystemClock),
        &dir.path().join("persist"),
        test_options(),
    )
    .unwrap();
    cm.add_storage_folder(&dir.path().join("folder-a"), 64).unwrap();
    cm.add_storage_folder(&dir.path().join("folder-b"), 64).unwrap();

    // Keep adding until both folders hold sectors; placement is salted, so
    // the split point varies per run.
    let mut by_folder: [Vec<u32>; 2] = [Vec::new(), Vec::new()];
    let mut seed = 0u32;
    while by_folder[0].is_empty() || by_folder[1].is_empty() {
        let before: Vec<u32> = cm
            .storage_folders()
            .unwrap()
            .iter()
            .map(|f| f.used)
            .collect();
        cm.add_sector(root(seed), &payload(seed)).unwrap();
        let after: Vec<u32> = cm
            .storage_folders()
            .unwrap()
            .iter()
            .map(|f| f.used)
            .collect();
        let landed = (0..2).find(|&i| after[i] > before[i]).unwrap();
        by_folder[landed].push(seed);
        seed += 1;
    }

    // Break folder A's data file.
    fault.fail_reads("folder-a/siahostdata.dat");

    let broken = cm.sector_id(&root(by_folder[0][0]));
    assert!(matches!(
        cm.read_sector(broken),
        Err(StoreError::DiskError { .. })
    ));

    let folders = cm.storage_folders().unwrap();
    let a = folders.iter().find(|f| f.path.ends_with("folder-a")).unwrap();
    let b = folders.iter().find(|f| f.path.ends_with("folder-b")).unwrap();
    assert!(!a.available);
    assert!(a.failed_reads >= 1);
    assert!(b.available);

    // Folder B keeps serving reads and takes all new writes.
    let healthy = cm.sector_id(&root(by_folder[1][0]));
    assert_eq!(cm.read_sector(healthy).unwrap(), payload(by_folder[1][0]));
    let b_used = b.used;
    cm.add_sector(root(9000), &payload(9000)).unwrap();
    let folders = cm.storage_folders().unwrap();
    let b = folders.iter().find(|f| f.path.ends_with("folder-b")).unwrap();
    assert_eq!(b.used, b_used + 1);

    // Reads of the broken folder's sectors keep failing fast.
    assert!(matches!(
        cm.read_sector(broken),
        Err(StoreError::DiskError { .. }) | Err(StoreError::FolderUnavailable { .. })
    ));
    cm.close().unwrap();
}

#[test]
fn test_batch_add_from_multiple_threads() {
    let dir = TempDir::new().unwrap();
    let cm = Arc::new(open(&dir.path().join("persist")));
    cm.add_storage_folder(&dir.path().join("folder-a"), 256).unwrap();

    let mut handles = Vec::new();
    for t in 0..4u32 {
        let cm = Arc::clone(&cm);
        handles.push(thread::spawn(move || {
            let items: Vec<([u8; 32], Vec<u8>)> = (0..8)
                .map(|i| {
                    let seed = t * 100 + i;
                    (root(seed), payload(seed))
                })
                .collect();
            let results = cm.add_sector_batch(&items).unwrap();
            assert!(results.iter().all(Result::is_ok));
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    let used: u32 = cm
        .storage_folders()
        .unwrap()
        .iter()
        .map(|f| f.used)
        .sum();
    assert_eq!(used, 32);
    cm.close().unwrap();
}
