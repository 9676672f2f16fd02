//! Lifecycle gate for the engine.
//!
//! Every public entry point registers with the group before touching state
//! and releases its guard on every return path (the guard's `Drop`). Once
//! [`ThreadGroup::stop`] begins, registration fails with `Stopped`; stop
//! waits for all outstanding guards, then runs the registered shutdown
//! closures in reverse registration order. After `stop` returns, no code
//! registered with the group is still executing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::error::{Result, StoreError};

type AfterStopFn = Box<dyn FnOnce() + Send>;

struct TgState {
    stopped: bool,
    running: usize,
    after_stop: Vec<AfterStopFn>,
}

struct TgInner {
    state: Mutex<TgState>,
    cv: Condvar,
    stop_flag: Arc<AtomicBool>,
}

pub struct ThreadGroup {
    inner: Arc<TgInner>,
}

impl Default for ThreadGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadGroup {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TgInner {
                state: Mutex::new(TgState {
                    stopped: false,
                    running: 0,
                    after_stop: Vec::new(),
                }),
                cv: Condvar::new(),
                stop_flag: Arc::new(AtomicBool::new(false)),
            }),
        }
    }

    /// Register one unit of in-flight work. Fails once shutdown has begun.
    pub fn add(&self) -> Result<TgGuard> {
        let mut st = self.inner.state.lock().unwrap();
        if st.stopped {
            return Err(StoreError::Stopped);
        }
        st.running += 1;
        Ok(TgGuard {
            inner: Arc::clone(&self.inner),
        })
    }

    /// Register a closure to run after all in-flight work has drained.
    /// Closures run in reverse registration order.
    pub fn after_stop<F: FnOnce() + Send + 'static>(&self, f: F) {
        let mut st = self.inner.state.lock().unwrap();
        if st.stopped {
            // Too late to defer; run it now so resources still get released.
            drop(st);
            f();
            return;
        }
        st.after_stop.push(Box::new(f));
    }

    /// Cheap flag that long-running loops poll between work chunks.
    pub fn stop_signal(&self) -> StopSignal {
        StopSignal {
            flag: Arc::clone(&self.inner.stop_flag),
        }
    }

    /// Begin shutdown: refuse new work, wait for outstanding guards, then
    /// run after-stop closures LIFO. Idempotent; later calls return
    /// `Stopped`.
    pub fn stop(&self) -> Result<()> {
        let callbacks = {
            let mut st = self.inner.state.lock().unwrap();
            if st.stopped {
                return Err(StoreError::Stopped);
            }
            st.stopped = true;
            self.inner.stop_flag.store(true, Ordering::SeqCst);
            while st.running > 0 {
                st = self.inner.cv.wait(st).unwrap();
            }
            std::mem::take(&mut st.after_stop)
        };
        for f in callbacks.into_iter().rev() {
            f();
        }
        Ok(())
    }
}

/// Outstanding-work token; dropping it releases the registration.
pub struct TgGuard {
    inner: Arc<TgInner>,
}

impl Drop for TgGuard {
    fn drop(&mut self) {
        let mut st = self.inner.state.lock().unwrap();
        st.running -= 1;
        if st.running == 0 {
            self.inner.cv.notify_all();
        }
    }
}

/// Cloneable shutdown flag handed to background loops.
#[derive(Clone)]
pub struct StopSignal {
    flag: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}
