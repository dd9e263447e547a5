use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use scriptpool_types::{ChangeListener, ScriptId};

/// One pending cache eviction for an engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
    Script(ScriptId),
    All,
}

/// FIFO of evictions owned by one worker; anyone may push, only the owner drains
#[derive(Debug, Default)]
pub struct InvalidationQueue {
    items: Mutex<VecDeque<Invalidation>>,
}

impl InvalidationQueue {
    pub fn push(&self, item: Invalidation) {
        self.items.lock().push_back(item);
    }

    /// Everything queued so far, oldest first
    pub fn drain(&self) -> Vec<Invalidation> {
        self.items.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

/// Relays "this script changed" to every live engine
///
/// Workers register a queue when they start. The notifier only holds weak
/// references, so a queue disappears with its worker.
#[derive(Debug, Default)]
pub struct ChangeNotifier {
    queues: Mutex<Vec<Weak<InvalidationQueue>>>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// New queue that receives every future invalidation
    pub fn register(&self) -> Arc<InvalidationQueue> {
        let queue = Arc::new(InvalidationQueue::default());
        self.queues.lock().push(Arc::downgrade(&queue));
        queue
    }

    /// Number of queues whose worker is still alive
    pub fn live_queues(&self) -> usize {
        let mut queues = self.queues.lock();
        queues.retain(|queue| queue.strong_count() > 0);
        queues.len()
    }

    pub fn on_source_changed(&self, id: &ScriptId) {
        let reached = self.broadcast(Invalidation::Script(id.clone()));
        tracing::debug!(
            target: "scripting",
            "Queued invalidation of {} for {} engine(s)",
            id,
            reached
        );
    }

    /// Ask every engine to drop all cached scripts and modules
    pub fn invalidate_all(&self) {
        let reached = self.broadcast(Invalidation::All);
        tracing::info!(
            target: "scripting",
            "Queued full invalidation for {} engine(s)",
            reached
        );
    }

    fn broadcast(&self, item: Invalidation) -> usize {
        let mut queues = self.queues.lock();
        let mut reached = 0;
        queues.retain(|queue| match queue.upgrade() {
            Some(queue) => {
                queue.push(item.clone());
                reached += 1;
                true
            }
            None => false,
        });
        reached
    }
}

impl ChangeListener for ChangeNotifier {
    fn on_source_changed(&self, id: &ScriptId) {
        ChangeNotifier::on_source_changed(self, id);
    }
}
