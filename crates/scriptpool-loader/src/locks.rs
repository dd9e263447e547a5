use dashmap::DashMap;
use parking_lot::{lock_api, RawRwLock, RwLock};
use std::sync::Arc;

use scriptpool_types::ScriptId;

pub type ReadGuard = lock_api::ArcRwLockReadGuard<RawRwLock, ()>;
pub type WriteGuard = lock_api::ArcRwLockWriteGuard<RawRwLock, ()>;

/// Reader/writer locks keyed by script identifier
///
/// Locks are created on first use and shared by every caller naming the same
/// identifier. The table itself is a concurrent map, so looking up one id never
/// blocks on another.
#[derive(Debug, Default)]
pub struct LockTable {
    locks: DashMap<ScriptId, Arc<RwLock<()>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &ScriptId) -> Arc<RwLock<()>> {
        if let Some(lock) = self.locks.get(id) {
            return Arc::clone(lock.value());
        }
        Arc::clone(self.locks.entry(id.clone()).or_default().value())
    }

    pub fn read(&self, id: &ScriptId) -> ReadGuard {
        self.get(id).read_arc()
    }

    pub fn write(&self, id: &ScriptId) -> WriteGuard {
        self.get(id).write_arc()
    }

    /// Forget `id` unless a guard or caller still holds its lock
    pub fn remove_if_unused(&self, id: &ScriptId) -> bool {
        self.locks
            .remove_if(id, |_, lock| Arc::strong_count(lock) == 1)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_id_shares_lock() {
        let table = LockTable::new();
        let id = ScriptId::new("/a.rhai").unwrap();

        let first = table.get(&id);
        let second = table.get(&id);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_writer_excludes_readers_of_same_id_only() {
        let table = LockTable::new();
        let a = ScriptId::new("/a.rhai").unwrap();
        let b = ScriptId::new("/b.rhai").unwrap();

        let _write = table.write(&a);
        assert!(table.get(&a).try_read().is_none());
        assert!(table.get(&b).try_read().is_some());
    }

    #[test]
    fn test_downgrade_keeps_readers_out_of_writers() {
        let table = LockTable::new();
        let a = ScriptId::new("/a.rhai").unwrap();

        let write = table.write(&a);
        let read = lock_api::ArcRwLockWriteGuard::downgrade(write);
        assert!(table.get(&a).try_read().is_some());
        assert!(table.get(&a).try_write().is_none());
        drop(read);
        assert!(table.get(&a).try_write().is_some());
    }

    #[test]
    fn test_held_lock_is_not_removed() {
        let table = LockTable::new();
        let a = ScriptId::new("/a.rhai").unwrap();

        let read = table.read(&a);
        assert!(!table.remove_if_unused(&a));
        assert_eq!(table.len(), 1);

        drop(read);
        assert!(table.remove_if_unused(&a));
        assert!(table.is_empty());
        assert!(!table.remove_if_unused(&a));
    }
}
