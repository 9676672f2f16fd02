//! Logging setup for hosts embedding the engine.
//!
//! The engine itself only emits `tracing` events; installing a subscriber is
//! the embedder's choice. These helpers cover the two common cases: stderr
//! logging filtered by `RUST_LOG`, and the traditional plain-text
//! `contractmanager.log` inside the persist directory.

use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use crate::LOG_FILE;

/// Install a stderr subscriber; `RUST_LOG` overrides `default_level`.
/// Call once at startup.
pub fn init(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Install a subscriber appending to `<persist_dir>/contractmanager.log`.
/// Call once at startup, before constructing the manager.
pub fn init_file(persist_dir: &Path, default_level: &str) -> io::Result<()> {
    std::fs::create_dir_all(persist_dir)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(persist_dir.join(LOG_FILE))?;
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(Arc::new(file))
        .init();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_init_file_creates_log() {
        let dir = TempDir::new().unwrap();
        // A second global-subscriber install would panic, so only verify the
        // file side effect here.
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            init_file(dir.path(), "info")
        }));
        assert!(dir.path().join(LOG_FILE).exists());
    }
}
