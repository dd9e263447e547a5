//! Background hot reload
//!
//! A [`StoreWatcher`] thread polls a [`ScriptScanner`] and feeds the changes
//! it reports to a [`ChangeObserver`].

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use scriptpool_loader::ScriptScanner;

use crate::observer::ChangeObserver;

const POLL_STEP: Duration = Duration::from_millis(25);

pub struct StoreWatcher {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl StoreWatcher {
    pub fn spawn(mut scanner: ScriptScanner, observer: ChangeObserver) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        tracing::info!(
            target: "loader",
            "Watching store every {:?} ({} file(s) tracked)",
            scanner.scan_interval(),
            scanner.tracked()
        );

        let handle = thread::Builder::new()
            .name("store-watcher".to_string())
            .spawn(move || {
                while !stop_flag.load(Ordering::SeqCst) {
                    if !scanner.should_scan() {
                        thread::sleep(POLL_STEP.min(scanner.scan_interval()));
                        continue;
                    }

                    let result = scanner.scan_changes();
                    if !result.has_changes() {
                        continue;
                    }

                    let events = result.into_events();
                    let failed = observer.on_changes(&events);
                    tracing::info!(
                        target: "loader",
                        "Applied {} store change(s), {} failed",
                        events.len(),
                        failed
                    );
                }
            })
            .context("Failed to spawn store watcher thread")?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stop polling and wait for the current scan to finish
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!(target: "loader", "Store watcher panicked");
            }
        }
    }
}

impl Drop for StoreWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
