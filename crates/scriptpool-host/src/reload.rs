use std::sync::Arc;
use tokio::sync::watch;

use crate::notifier::ChangeNotifier;

/// Reload signal type (empty - just signals that a reload is requested)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReloadSignal;

/// Spawn a SIGUSR2 handler that invalidates every engine's caches
///
/// Must be called from inside a tokio runtime. The returned receiver sees
/// `Some(ReloadSignal)` for a moment after each signal; the handler stops once
/// every receiver is dropped.
#[cfg(unix)]
pub fn setup_reload_signal(notifier: Arc<ChangeNotifier>) -> watch::Receiver<Option<ReloadSignal>> {
    let (reload_tx, reload_rx) = watch::channel(None);

    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigusr2 = match signal(SignalKind::user_defined2()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(target: "scripting", "Failed to register SIGUSR2 handler: {}", e);
                return;
            }
        };

        loop {
            tokio::select! {
                received = sigusr2.recv() => {
                    if received.is_none() {
                        break;
                    }
                }
                _ = reload_tx.closed() => {
                    tracing::info!(target: "scripting", "Reload signal receiver dropped, shutting down SIGUSR2 handler");
                    break;
                }
            }

            tracing::info!(target: "scripting", "Received SIGUSR2 - invalidating all engines");
            notifier.invalidate_all();

            if reload_tx.send(Some(ReloadSignal)).is_err() {
                break;
            }
            // Clear the signal after a moment to allow detection
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            let _ = reload_tx.send(None);
        }
    });

    reload_rx
}

/// Non-Unix platforms have no SIGUSR2; the receiver never fires
#[cfg(not(unix))]
pub fn setup_reload_signal(notifier: Arc<ChangeNotifier>) -> watch::Receiver<Option<ReloadSignal>> {
    let (reload_tx, reload_rx) = watch::channel(None);
    tracing::warn!(target: "scripting", "SIGUSR2 reload not supported on this platform");
    drop(notifier);
    // Keep the sender alive but never send signals
    std::mem::forget(reload_tx);
    reload_rx
}
