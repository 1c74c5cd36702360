//! Idle detection
//!
//! A background thread sets the idle flag of the root every tick. Any call
//! to [`RootState::is_filtered`] resets it, so a flag that survives a whole
//! timeout means nothing touched the filesystem in that time.

use super::root::RootState;
use crate::error::Result;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info};

const MIN_TICK: Duration = Duration::from_millis(10);

/// Handle on the idle monitor thread; stops the thread when dropped
pub struct IdleMonitor {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl IdleMonitor {
    /// Watch `root` and call `on_idle` once after `timeout` without activity
    ///
    /// The filesystem never counts as idle while files are open.
    pub fn spawn<F>(root: Arc<RootState>, timeout: Duration, on_idle: F) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let tick = (timeout / 10).max(MIN_TICK);
        let ticks_needed = timeout.as_nanos().div_ceil(tick.as_nanos()).max(1);
        let (stop_tx, stop_rx) = bounded::<()>(0);

        let handle = std::thread::Builder::new()
            .name("veilfs-idle".to_string())
            .spawn(move || {
                let mut idle_ticks = 0u128;
                loop {
                    match stop_rx.recv_timeout(tick) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                            debug!("idle monitor stopped");
                            return;
                        }
                    }

                    let was_idle = root.mark_idle();
                    if !was_idle || root.open_file_count() > 0 {
                        idle_ticks = 0;
                        continue;
                    }
                    idle_ticks += 1;
                    if idle_ticks >= ticks_needed {
                        info!("filesystem idle for {:?}", timeout);
                        on_idle();
                        return;
                    }
                }
            })?;

        Ok(IdleMonitor {
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Stop the monitor and wait for its thread
    pub fn stop(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for IdleMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::MasterKey;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;
    use tempfile::tempdir;

    fn root() -> (tempfile::TempDir, Arc<RootState>) {
        let dir = tempdir().unwrap();
        let key = MasterKey::generate();
        let config = crate::fs::init_cipherdir(dir.path(), false, 0, &key).unwrap();
        let root = RootState::new(dir.path(), config, &key).unwrap();
        (dir, Arc::new(root))
    }

    #[test]
    fn test_fires_once_when_idle() {
        let (_dir, root) = root();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let mut monitor = IdleMonitor::spawn(root, Duration::from_millis(100), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        let start = Instant::now();
        while fired.load(Ordering::SeqCst) == 0 && start.elapsed() < Duration::from_secs(5) {
            std::thread::sleep(Duration::from_millis(10));
        }
        std::thread::sleep(Duration::from_millis(300));
        monitor.stop();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_activity_keeps_alive() {
        let (_dir, root) = root();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let mut monitor = IdleMonitor::spawn(Arc::clone(&root), Duration::from_millis(200), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(600) {
            root.is_filtered(Path::new("busy"));
            std::thread::sleep(Duration::from_millis(5));
        }
        monitor.stop();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_open_files_keep_alive() {
        let (_dir, root) = root();
        let (_, file) = root
            .create(Path::new("held"), libc::O_RDWR, 0o600)
            .unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let mut monitor = IdleMonitor::spawn(Arc::clone(&root), Duration::from_millis(50), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        drop(file);

        let start = Instant::now();
        while fired.load(Ordering::SeqCst) == 0 && start.elapsed() < Duration::from_secs(5) {
            std::thread::sleep(Duration::from_millis(10));
        }
        monitor.stop();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stop_is_prompt() {
        let (_dir, root) = root();
        let mut monitor = IdleMonitor::spawn(root, Duration::from_secs(3600), || {}).unwrap();
        let start = Instant::now();
        monitor.stop();
        monitor.stop();
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
