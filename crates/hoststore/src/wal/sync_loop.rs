//! The background commit thread.
//!
//! A plain thread, not registered with the thread group: it has to outlive
//! every guarded operation so that the final flush during shutdown covers
//! the last appended transactions. The manager stops it from an after-stop
//! closure, which the thread group runs only once all in-flight operations
//! have drained.
//!
//! The loop wakes on a timer (the durability interval), on pressure
//! notifications from appenders, and on shutdown. The `haltCommit` disrupt
//! tag skips commit passes entirely, which crash tests use to pin the log in
//! its uncommitted state.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::debug;

use crate::wal::{Wal, PRESSURE_ENTRIES};

pub fn spawn(wal: Arc<Wal>, interval: Duration) -> JoinHandle<()> {
    thread::Builder::new()
        .name("hoststore-sync".to_string())
        .spawn(move || run(wal, interval))
        .expect("spawn sync loop thread")
}

fn run(wal: Arc<Wal>, interval: Duration) {
    loop {
        let shutting = {
            let mut st = wal.lock_state();
            if !st.shutdown && st.pending.len() < PRESSURE_ENTRIES {
                let (guard, _timeout) = wal.loop_cv.wait_timeout(st, interval).unwrap();
                st = guard;
            }
            st.shutdown
        };

        if !wal.fs.disrupt("haltCommit") {
            wal.commit();
        }
        if shutting {
            break;
        }
    }
    debug!("sync loop exiting");
    let mut st = wal.lock_state();
    st.loop_exited = true;
    drop(st);
    wal.commit_cv.notify_all();
}

/// Ask the loop to flush once more and exit, then join it.
pub fn shutdown(wal: &Wal, handle: JoinHandle<()>) {
    {
        let mut st = wal.lock_state();
        st.shutdown = true;
    }
    wal.loop_cv.notify_all();
    let _ = handle.join();
}
