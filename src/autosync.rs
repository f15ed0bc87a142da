use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use crate::index::now_ms;
use crate::settings::SettingsStore;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(2 * 60 * 60);

#[derive(Clone)]
pub struct AutoSyncConfig {
    /// How often the elapsed-time check runs. Drift up to this interval
    /// is acceptable.
    pub poll_interval: Duration,
    /// Minimum time between two sync runs.
    pub sync_interval: Duration,
}

impl Default for AutoSyncConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            sync_interval: DEFAULT_SYNC_INTERVAL,
        }
    }
}

pub type SyncCallback = Box<dyn Fn() -> Result<(), String> + Send>;

enum AutoSyncCommand {
    TriggerNow,
    Shutdown,
}

struct AutoSyncCore {
    config: AutoSyncConfig,
    settings: Arc<SettingsStore>,
    callback: SyncCallback,
    in_progress: Arc<AtomicBool>,
}

impl AutoSyncCore {
    /// Level-triggered check: run when the interval has elapsed since the
    /// persisted last run and no run is active. The timestamp only moves
    /// forward after the callback succeeds, so a failed sync retries on
    /// the next poll.
    fn tick(&self, force: bool) {
        let now = now_ms();
        let last = self.settings.last_sync_at().unwrap_or(0);
        let elapsed = now.saturating_sub(last);
        if !force && elapsed < self.config.sync_interval.as_millis() as i64 {
            return;
        }
        if self.in_progress.swap(true, Ordering::SeqCst) {
            return;
        }
        let result = (self.callback)();
        self.in_progress.store(false, Ordering::SeqCst);
        match result {
            Ok(()) => {
                info!(elapsed_ms = elapsed, "auto-sync completed");
                if let Err(err) = self.settings.set_last_sync_at(now) {
                    warn!(error = %err, "auto-sync finished but timestamp was not persisted");
                }
            }
            Err(err) => {
                warn!(error = %err, "auto-sync failed, will retry on a later poll");
            }
        }
    }
}

/// Recurring background trigger for the product sync. Not a precise
/// scheduler; it polls and fires at most once per elapsed interval.
pub struct AutoSyncScheduler {
    sender: mpsc::Sender<AutoSyncCommand>,
    join_handle: Mutex<Option<thread::JoinHandle<()>>>,
    in_progress: Arc<AtomicBool>,
}

impl AutoSyncScheduler {
    pub fn spawn(
        config: AutoSyncConfig,
        settings: Arc<SettingsStore>,
        callback: SyncCallback,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<AutoSyncCommand>();
        let in_progress = Arc::new(AtomicBool::new(false));
        let core = AutoSyncCore {
            config: config.clone(),
            settings,
            callback,
            in_progress: Arc::clone(&in_progress),
        };
        let handle = thread::Builder::new()
            .name("auto-sync".into())
            .spawn(move || loop {
                match rx.recv_timeout(core.config.poll_interval) {
                    Ok(AutoSyncCommand::TriggerNow) => core.tick(true),
                    Ok(AutoSyncCommand::Shutdown) => break,
                    Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => core.tick(false),
                }
            })
            .expect("spawn auto-sync thread");
        Self {
            sender: tx,
            join_handle: Mutex::new(Some(handle)),
            in_progress,
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Runs the sync now regardless of the elapsed interval.
    pub fn trigger_now(&self) -> Result<(), String> {
        self.sender
            .send(AutoSyncCommand::TriggerNow)
            .map_err(|_| "auto-sync stopped".into())
    }

    /// Stops the poll loop and joins the thread, which also drops the
    /// callback.
    pub fn stop(&self) {
        if self.sender.send(AutoSyncCommand::Shutdown).is_ok() {
            if let Ok(mut guard) = self.join_handle.lock() {
                if let Some(handle) = guard.take() {
                    let _ = handle.join();
                }
            }
        }
    }
}

impl Drop for AutoSyncScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::default_settings_path;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn store(dir: &tempfile::TempDir) -> Arc<SettingsStore> {
        Arc::new(SettingsStore::open(default_settings_path(dir.path())))
    }

    #[test]
    fn fires_once_interval_elapses_and_persists_the_timestamp() {
        let dir = tempfile::tempdir().expect("temp dir");
        let settings = store(&dir);
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_cb = Arc::clone(&runs);

        let scheduler = AutoSyncScheduler::spawn(
            AutoSyncConfig {
                poll_interval: Duration::from_millis(10),
                sync_interval: Duration::from_millis(40),
            },
            Arc::clone(&settings),
            Box::new(move || {
                runs_cb.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        assert!(
            wait_until(Duration::from_secs(2), || runs.load(Ordering::SeqCst) >= 1),
            "first window should fire"
        );
        assert!(
            wait_until(Duration::from_secs(2), || settings.last_sync_at().is_some()),
            "successful sync persists last-sync"
        );
        scheduler.stop();
    }

    #[test]
    fn does_not_fire_inside_a_fresh_window() {
        let dir = tempfile::tempdir().expect("temp dir");
        let settings = store(&dir);
        settings.set_last_sync_at(now_ms()).expect("seed last sync");
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_cb = Arc::clone(&runs);

        let scheduler = AutoSyncScheduler::spawn(
            AutoSyncConfig {
                poll_interval: Duration::from_millis(10),
                sync_interval: Duration::from_secs(3600),
            },
            settings,
            Box::new(move || {
                runs_cb.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        thread::sleep(Duration::from_millis(80));
        assert_eq!(runs.load(Ordering::SeqCst), 0, "interval has not elapsed");
        scheduler.stop();
    }

    #[test]
    fn failed_sync_leaves_the_timestamp_untouched_and_retries() {
        let dir = tempfile::tempdir().expect("temp dir");
        let settings = store(&dir);
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_cb = Arc::clone(&runs);

        let scheduler = AutoSyncScheduler::spawn(
            AutoSyncConfig {
                poll_interval: Duration::from_millis(10),
                sync_interval: Duration::from_millis(20),
            },
            Arc::clone(&settings),
            Box::new(move || {
                runs_cb.fetch_add(1, Ordering::SeqCst);
                Err("backend down".into())
            }),
        );

        assert!(
            wait_until(Duration::from_secs(2), || runs.load(Ordering::SeqCst) >= 2),
            "failed sync keeps retrying on later polls"
        );
        assert_eq!(settings.last_sync_at(), None);
        scheduler.stop();
    }

    #[test]
    fn trigger_now_ignores_the_interval() {
        let dir = tempfile::tempdir().expect("temp dir");
        let settings = store(&dir);
        settings.set_last_sync_at(now_ms()).expect("seed last sync");
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_cb = Arc::clone(&runs);

        let scheduler = AutoSyncScheduler::spawn(
            AutoSyncConfig {
                poll_interval: Duration::from_millis(10),
                sync_interval: Duration::from_secs(3600),
            },
            settings,
            Box::new(move || {
                runs_cb.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        scheduler.trigger_now().expect("trigger");
        assert!(
            wait_until(Duration::from_secs(2), || runs.load(Ordering::SeqCst) >= 1),
            "manual trigger bypasses the window"
        );
        scheduler.stop();
    }
}
