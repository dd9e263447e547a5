//! Backing store for script source

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use scriptpool_types::ScriptId;

use crate::scanner::ScriptScanner;

/// Durable holder of script source
///
/// The loader only ever reads through this trait; writes and change events
/// belong to whatever owns the content.
pub trait ArtifactStore: Send + Sync {
    /// Source bytes together with their modification time
    fn read(&self, id: &ScriptId) -> io::Result<(Vec<u8>, SystemTime)>;

    fn modified(&self, id: &ScriptId) -> io::Result<SystemTime>;

    fn exists(&self, id: &ScriptId) -> bool;
}

/// Store backed by a plain directory; `/apps/page.rhai` maps to `<root>/apps/page.rhai`
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, id: &ScriptId) -> PathBuf {
        self.root.join(id.relative_path())
    }

    /// Scanner reporting changes under this store's root
    pub fn scanner(
        &self,
        script_extensions: Vec<String>,
        config_files: Vec<String>,
        interval: Duration,
    ) -> ScriptScanner {
        ScriptScanner::with_interval(self.root.clone(), interval)
            .with_filters(script_extensions, config_files)
    }
}

impl ArtifactStore for FsArtifactStore {
    fn read(&self, id: &ScriptId) -> io::Result<(Vec<u8>, SystemTime)> {
        let path = self.path_for(id);
        let bytes = fs::read(&path)?;
        let modified = fs::metadata(&path)?.modified()?;
        Ok((bytes, modified))
    }

    fn modified(&self, id: &ScriptId) -> io::Result<SystemTime> {
        fs::metadata(self.path_for(id))?.modified()
    }

    fn exists(&self, id: &ScriptId) -> bool {
        self.path_for(id).is_file()
    }
}
