use parking_lot::{lock_api, Mutex, RwLock};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use scriptpool_types::{ChangeListener, ScriptError, ScriptId, ScriptResult};

use crate::build::{self, BuildFailure, BuildStep};
use crate::config::LoaderConfig;
use crate::layout::{self, remove_if_exists, StagingLayout};
use crate::locks::{LockTable, ReadGuard};
use crate::store::ArtifactStore;

/// A staged artifact that stays valid while this guard lives
///
/// Holds the read lock for the identifier, so no writer can replace or delete
/// the file underneath the caller.
#[derive(Debug)]
pub struct StagedScript {
    id: ScriptId,
    path: PathBuf,
    _guard: ReadGuard,
}

impl StagedScript {
    pub fn id(&self) -> &ScriptId {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_source(&self) -> ScriptResult<String> {
        fs::read_to_string(&self.path).map_err(|e| ScriptError::storage(self.id.as_str(), e))
    }
}

/// Maps script identifiers to staged, built files
pub struct ScriptLoader {
    config: LoaderConfig,
    store: Arc<dyn ArtifactStore>,
    layout: StagingLayout,
    builder: Box<dyn BuildStep>,
    locks: LockTable,
    /// Serializes install/build/promote against the shared project directory
    ///
    /// Held from the build through the ready poll, so builds of unrelated ids
    /// run one at a time. Resolving an id that is already staged and current
    /// never takes it.
    pub(crate) build_lock: Mutex<()>,
    install_pending: AtomicBool,
    listener: RwLock<Option<Arc<dyn ChangeListener>>>,
}

impl ScriptLoader {
    /// Create a loader using the build step described by `config`
    ///
    /// Fails when the staging directories cannot be created.
    pub fn new(config: LoaderConfig, store: Arc<dyn ArtifactStore>) -> ScriptResult<Self> {
        let builder = build::from_config(&config.build, &config.script_extensions);
        Self::with_build_step(config, store, builder)
    }

    pub fn with_build_step(
        config: LoaderConfig,
        store: Arc<dyn ArtifactStore>,
        builder: Box<dyn BuildStep>,
    ) -> ScriptResult<Self> {
        let base_dir = config.base_dir();
        let layout = StagingLayout::create(&base_dir)
            .map_err(|e| ScriptError::storage(base_dir.display().to_string(), e))?;

        tracing::info!(
            target: "loader",
            "Staging scripts under {}",
            base_dir.display()
        );

        Ok(Self {
            config,
            store,
            layout,
            builder,
            locks: LockTable::new(),
            build_lock: Mutex::new(()),
            install_pending: AtomicBool::new(false),
            listener: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn layout(&self) -> &StagingLayout {
        &self.layout
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    /// Receive a notice after every rebuild or delete
    pub fn set_change_listener(&self, listener: Arc<dyn ChangeListener>) {
        *self.listener.write() = Some(listener);
    }

    pub fn is_install_pending(&self) -> bool {
        self.install_pending.load(Ordering::SeqCst)
    }

    /// Run the dependency install and a full build once, before any request
    pub fn prepare(&self) -> ScriptResult<()> {
        let _build = self.build_lock.lock();
        let project_dir = self.layout.project_dir();

        self.install_pending.store(false, Ordering::SeqCst);
        self.builder
            .install(project_dir)
            .map_err(|failure| self.build_error(None, failure))?;

        match self.builder.build(project_dir) {
            Ok(()) => Ok(()),
            Err(failure) if failure.failed_sources.is_empty() => {
                Err(self.build_error(None, failure))
            }
            Err(failure) => {
                tracing::warn!(
                    target: "loader",
                    "Startup build left {} source(s) unbuilt: {}",
                    failure.failed_sources.len(),
                    failure.stderr.trim_end()
                );
                Ok(())
            }
        }
    }

    /// Staged artifact for `id`, building it first if it is missing or stale
    pub fn resolve(&self, id: &ScriptId) -> ScriptResult<StagedScript> {
        let lock = self.locks.get(id);

        {
            let guard = lock.read_arc();
            if let Some(path) = self.fresh_generation(id)? {
                return Ok(StagedScript {
                    id: id.clone(),
                    path,
                    _guard: guard,
                });
            }
        }

        // Read lock released above; never wait for the writer while holding it
        let write = lock.write_arc();
        let path = match self.fresh_generation(id)? {
            Some(path) => path,
            None => self.rebuild(id)?,
        };

        Ok(StagedScript {
            id: id.clone(),
            path,
            _guard: lock_api::ArcRwLockWriteGuard::downgrade(write),
        })
    }

    /// Bring the staged artifact for `id` up to date without keeping it
    pub fn refresh(&self, id: &ScriptId) -> ScriptResult<()> {
        self.resolve(id).map(drop)
    }

    /// Newest staged generation without taking the identifier lock
    ///
    /// Polls while only the build placeholder exists and gives up with
    /// [`ScriptError::NotReady`] after the configured number of attempts.
    pub fn find_staged(&self, id: &ScriptId) -> ScriptResult<PathBuf> {
        let attempts = self.config.build.ready_attempts.max(1);

        for attempt in 1..=attempts {
            let newest = self
                .layout
                .newest_generation(id)
                .map_err(|e| ScriptError::storage(id.as_str(), e))?;
            if let Some(generation) = newest {
                return Ok(generation.path);
            }

            if !self.layout.placeholder_path(id).exists() {
                return Err(ScriptError::storage(
                    id.as_str(),
                    io::Error::new(io::ErrorKind::NotFound, "no staged artifact"),
                ));
            }

            if attempt < attempts {
                std::thread::sleep(self.config.build.ready_delay());
            }
        }

        Err(ScriptError::NotReady {
            id: id.clone(),
            attempts,
        })
    }

    /// Number of identifiers with a live entry in the lock table
    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    /// Remove every staged file for `id` and tell the listener
    pub fn delete(&self, id: &ScriptId) -> ScriptResult<()> {
        let write = self.locks.write(id);
        let storage = |e| ScriptError::storage(id.as_str(), e);

        let removed = self
            .layout
            .prune_generations(id, None)
            .map_err(storage)?;
        remove_if_exists(&self.layout.source_path(id)).map_err(storage)?;
        remove_if_exists(&self.layout.output_path(id)).map_err(storage)?;
        remove_if_exists(&self.layout.placeholder_path(id)).map_err(storage)?;
        drop(write);
        self.locks.remove_if_unused(id);

        tracing::info!(
            target: "loader",
            "Deleted {} ({} staged generation(s))",
            id,
            removed
        );

        self.notify(id);
        Ok(())
    }

    /// Copy a changed dependency manifest into the project directory and
    /// schedule an install before the next build
    pub fn update_config(&self, id: &ScriptId) -> ScriptResult<()> {
        let (bytes, _) = self
            .store
            .read(id)
            .map_err(|e| ScriptError::storage(id.as_str(), e))?;

        let _build = self.build_lock.lock();
        let target = self.layout.config_path(id.file_name());
        fs::write(&target, bytes).map_err(|e| ScriptError::storage(id.as_str(), e))?;
        self.install_pending.store(true, Ordering::SeqCst);

        tracing::info!(
            target: "loader",
            "Updated {}, dependency install scheduled",
            target.display()
        );
        Ok(())
    }

    /// Path of the newest generation if it is at least as new as the source
    fn fresh_generation(&self, id: &ScriptId) -> ScriptResult<Option<PathBuf>> {
        let source_modified = self
            .store
            .modified(id)
            .map_err(|e| ScriptError::storage(id.as_str(), e))?;

        let newest = self
            .layout
            .newest_generation(id)
            .map_err(|e| ScriptError::storage(id.as_str(), e))?;

        Ok(newest
            .filter(|generation| generation.modified >= source_modified)
            .map(|generation| generation.path))
    }

    /// Recreate the staged artifact. Caller holds the write lock for `id`.
    fn rebuild(&self, id: &ScriptId) -> ScriptResult<PathBuf> {
        let storage = |e| ScriptError::storage(id.as_str(), e);

        let (bytes, source_modified) = self.store.read(id).map_err(storage)?;

        tracing::info!(target: "loader", "Building {}", id);

        self.layout.prune_generations(id, None).map_err(storage)?;

        let source_path = self.layout.source_path(id);
        if let Some(parent) = source_path.parent() {
            fs::create_dir_all(parent).map_err(storage)?;
        }
        fs::write(&source_path, &bytes).map_err(storage)?;

        let output_path = self.layout.output_path(id);
        remove_if_exists(&output_path).map_err(storage)?;

        let placeholder = self.layout.placeholder(id).map_err(storage)?;

        let generation_path = {
            let _build = self.build_lock.lock();
            self.run_build(id, &source_path)?;
            self.wait_for(id, &output_path)?;

            let generation_path = self
                .layout
                .generation_path(id, &layout::fingerprint(&bytes));
            fs::copy(&output_path, &generation_path).map_err(storage)?;

            // Staged copy must never look older than its source
            let staged_modified = SystemTime::now().max(source_modified);
            fs::File::options()
                .write(true)
                .open(&generation_path)
                .and_then(|file| file.set_modified(staged_modified))
                .map_err(storage)?;

            self.layout
                .prune_generations(id, Some(&generation_path))
                .map_err(storage)?;
            generation_path
        };

        drop(placeholder);

        tracing::info!(
            target: "loader",
            "Staged {} as {}",
            id,
            generation_path.display()
        );

        self.notify(id);
        Ok(generation_path)
    }

    /// Run the pending install and the build. Caller holds `build_lock`.
    fn run_build(&self, id: &ScriptId, source_path: &Path) -> ScriptResult<()> {
        let project_dir = self.layout.project_dir();

        if self.install_pending.swap(false, Ordering::SeqCst) {
            if let Err(failure) = self.builder.install(project_dir) {
                self.install_pending.store(true, Ordering::SeqCst);
                return Err(self.build_error(Some(id), failure));
            }
        }

        match self.builder.build(project_dir) {
            Ok(()) => Ok(()),
            Err(failure) if failure.involves(source_path) => {
                Err(self.build_error(Some(id), failure))
            }
            Err(failure) => {
                tracing::warn!(
                    target: "loader",
                    "Build reported failures unrelated to {}: {}",
                    id,
                    failure.stderr.trim_end()
                );
                Ok(())
            }
        }
    }

    /// Wait for the build step to produce `output_path`
    fn wait_for(&self, id: &ScriptId, output_path: &Path) -> ScriptResult<()> {
        let attempts = self.config.build.ready_attempts.max(1);

        for attempt in 1..=attempts {
            if output_path.exists() {
                return Ok(());
            }
            if attempt < attempts {
                tracing::debug!(
                    target: "loader",
                    "Waiting for {} ({}/{})",
                    output_path.display(),
                    attempt,
                    attempts
                );
                std::thread::sleep(self.config.build.ready_delay());
            }
        }

        Err(ScriptError::NotReady {
            id: id.clone(),
            attempts,
        })
    }

    fn build_error(&self, id: Option<&ScriptId>, failure: BuildFailure) -> ScriptError {
        let id = match id {
            Some(id) => id.to_string(),
            None => self.layout.project_dir().display().to_string(),
        };
        ScriptError::Build {
            id,
            message: failure.to_string(),
            stdout: failure.stdout,
            stderr: failure.stderr,
        }
    }

    fn notify(&self, id: &ScriptId) {
        let listener = self.listener.read().clone();
        if let Some(listener) = listener {
            listener.on_source_changed(id);
        }
    }
}
