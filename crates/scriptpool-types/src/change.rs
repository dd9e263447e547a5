use crate::id::ScriptId;

/// Kind of change reported by the artifact store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Added,
    Removed,
    Modified,
}

/// One change reported by the artifact store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub id: ScriptId,
    pub kind: ChangeKind,
}

impl ChangeEvent {
    pub fn new(id: ScriptId, kind: ChangeKind) -> Self {
        Self { id, kind }
    }
}

/// Receives "this script changed" notices
///
/// The loader calls this whenever it replaces or deletes a staged artifact so
/// that every engine can drop what it cached for the identifier.
pub trait ChangeListener: Send + Sync {
    fn on_source_changed(&self, id: &ScriptId);
}

impl<F> ChangeListener for F
where
    F: Fn(&ScriptId) + Send + Sync,
{
    fn on_source_changed(&self, id: &ScriptId) {
        self(id)
    }
}
