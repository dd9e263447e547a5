use std::sync::Arc;

use scriptpool_loader::ScriptLoader;
use scriptpool_types::{ChangeEvent, ChangeKind, ScriptResult};

/// What the observer did with one store event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeAction {
    Deleted,
    Restaged,
    ConfigUpdated,
    Ignored,
}

/// Turns store change events into loader work
///
/// Removals delete every staged file, script changes restage the script right
/// away and dependency manifest changes schedule an install. Anything else is
/// ignored.
pub struct ChangeObserver {
    loader: Arc<ScriptLoader>,
}

impl ChangeObserver {
    pub fn new(loader: Arc<ScriptLoader>) -> Self {
        Self { loader }
    }

    pub fn on_change(&self, event: &ChangeEvent) -> ScriptResult<ChangeAction> {
        let config = self.loader.config();
        let id = &event.id;

        tracing::debug!(target: "loader", "Store reported {:?} for {}", event.kind, id);

        if event.kind == ChangeKind::Removed {
            self.loader.delete(id)?;
            return Ok(ChangeAction::Deleted);
        }

        if id.has_extension(&config.script_extensions) {
            self.loader.refresh(id)?;
            Ok(ChangeAction::Restaged)
        } else if config.is_config_file(id.file_name()) {
            self.loader.update_config(id)?;
            Ok(ChangeAction::ConfigUpdated)
        } else {
            Ok(ChangeAction::Ignored)
        }
    }

    /// Handle a batch; a failing event is logged and does not stop the rest
    pub fn on_changes(&self, events: &[ChangeEvent]) -> usize {
        let mut failed = 0;
        for event in events {
            if let Err(e) = self.on_change(event) {
                failed += 1;
                tracing::error!(
                    target: "loader",
                    "Error processing change event for {}: {}",
                    event.id,
                    e
                );
            }
        }
        failed
    }
}
