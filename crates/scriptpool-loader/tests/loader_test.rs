//! Staging behaviour of the script loader against a directory store

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use scriptpool_loader::{
    BuildFailure, BuildStep, FsArtifactStore, LoaderConfig, NativeBuildStep, ScriptError,
    ScriptId, ScriptLoader,
};
use tempfile::TempDir;

/// Native build step that counts its runs and can be slowed down
struct CountingStep {
    inner: NativeBuildStep,
    builds: Arc<AtomicUsize>,
    installs: Arc<AtomicUsize>,
    active: AtomicUsize,
    peak: Arc<AtomicUsize>,
    delay: Duration,
}

impl BuildStep for CountingStep {
    fn install(&self, project_dir: &Path) -> Result<(), BuildFailure> {
        self.installs.fetch_add(1, Ordering::SeqCst);
        self.inner.install(project_dir)
    }

    fn build(&self, project_dir: &Path) -> Result<(), BuildFailure> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        let running = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        thread::sleep(self.delay);
        let result = self.inner.build(project_dir);
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

struct Fixture {
    _store_dir: TempDir,
    _stage_dir: TempDir,
    store_root: PathBuf,
    loader: Arc<ScriptLoader>,
    builds: Arc<AtomicUsize>,
    installs: Arc<AtomicUsize>,
    peak_builds: Arc<AtomicUsize>,
}

impl Fixture {
    fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    fn with_delay(delay: Duration) -> Self {
        let store_dir = TempDir::new().unwrap();
        let stage_dir = TempDir::new().unwrap();
        let builds = Arc::new(AtomicUsize::new(0));
        let installs = Arc::new(AtomicUsize::new(0));
        let peak_builds = Arc::new(AtomicUsize::new(0));

        let config = LoaderConfig {
            base_dir: Some(stage_dir.path().to_path_buf()),
            ..LoaderConfig::default()
        };
        let store = Arc::new(FsArtifactStore::new(store_dir.path()));
        let step = CountingStep {
            inner: NativeBuildStep::new(config.script_extensions.clone()),
            builds: Arc::clone(&builds),
            installs: Arc::clone(&installs),
            active: AtomicUsize::new(0),
            peak: Arc::clone(&peak_builds),
            delay,
        };
        let loader = ScriptLoader::with_build_step(config, store, Box::new(step)).unwrap();

        Self {
            store_root: store_dir.path().to_path_buf(),
            _store_dir: store_dir,
            _stage_dir: stage_dir,
            loader: Arc::new(loader),
            builds,
            installs,
            peak_builds,
        }
    }

    fn write(&self, id: &str, source: &str) -> ScriptId {
        let id = ScriptId::new(id).unwrap();
        let path = self.store_root.join(id.relative_path());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, source).unwrap();
        id
    }

    fn touch(&self, id: &ScriptId, modified: SystemTime) {
        let path = self.store_root.join(id.relative_path());
        fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(modified)
            .unwrap();
    }

    fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

#[test]
fn test_first_resolve_builds_once() {
    let fixture = Fixture::new();
    let id = fixture.write("/apps/page.rhai", "40 + 2");

    let staged = fixture.loader.resolve(&id).unwrap();
    assert_eq!(staged.id(), &id);
    assert_eq!(staged.read_source().unwrap(), "40 + 2");
    drop(staged);

    let again = fixture.loader.resolve(&id).unwrap();
    assert_eq!(again.read_source().unwrap(), "40 + 2");
    assert_eq!(fixture.builds(), 1);

    let layout = fixture.loader.layout();
    assert!(layout.source_path(&id).exists());
    assert!(layout.output_path(&id).exists());
    assert!(!layout.placeholder_path(&id).exists());
}

#[test]
fn test_newer_source_replaces_old_generation() {
    let fixture = Fixture::new();
    let id = fixture.write("/apps/page.rhai", "1");

    let first = fixture.loader.resolve(&id).unwrap().path().to_path_buf();

    fixture.write("/apps/page.rhai", "2");
    fixture.touch(&id, SystemTime::now() + Duration::from_secs(60));

    let second = fixture.loader.resolve(&id).unwrap();
    assert_ne!(second.path(), first.as_path());
    assert!(!first.exists());
    assert_eq!(second.read_source().unwrap(), "2");
    assert_eq!(fixture.builds(), 2);

    let generations = fixture.loader.layout().generations(&id).unwrap();
    assert_eq!(generations.len(), 1);
    drop(second);

    // Future-dated source must not trigger a rebuild on every request
    fixture.loader.resolve(&id).unwrap();
    assert_eq!(fixture.builds(), 2);
}

#[test]
fn test_missing_source_is_storage_error() {
    let fixture = Fixture::new();
    let id = ScriptId::new("/apps/missing.rhai").unwrap();

    let err = fixture.loader.resolve(&id).unwrap_err();
    assert!(matches!(err, ScriptError::Storage { .. }), "{err:?}");
    assert_eq!(fixture.builds(), 0);
}

#[test]
fn test_broken_script_is_build_error() {
    let fixture = Fixture::new();
    let broken = fixture.write("/apps/broken.rhai", "let = ;");
    let fine = fixture.write("/apps/fine.rhai", "1");

    match fixture.loader.resolve(&broken).unwrap_err() {
        ScriptError::Build { id, stderr, .. } => {
            assert_eq!(id, "/apps/broken.rhai");
            assert!(stderr.contains("broken.rhai"));
        }
        other => panic!("unexpected error: {other:?}"),
    }

    // A broken neighbour does not block other scripts
    let staged = fixture.loader.resolve(&fine).unwrap();
    assert_eq!(staged.read_source().unwrap(), "1");
}

#[test]
fn test_concurrent_resolves_share_one_build() {
    let fixture = Fixture::with_delay(Duration::from_millis(100));
    let id = fixture.write("/apps/page.rhai", "let total = 0; total");
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let loader = Arc::clone(&fixture.loader);
            let barrier = Arc::clone(&barrier);
            let id = id.clone();
            thread::spawn(move || {
                barrier.wait();
                let staged = loader.resolve(&id).unwrap();
                staged.read_source().unwrap()
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap(), "let total = 0; total");
    }
    assert_eq!(fixture.builds(), 1);
}

#[test]
fn test_reader_keeps_writer_out() {
    let fixture = Fixture::new();
    let id = fixture.write("/apps/page.rhai", "1");
    let staged = fixture.loader.resolve(&id).unwrap();

    let deleted = Arc::new(Mutex::new(false));
    let handle = {
        let loader = Arc::clone(&fixture.loader);
        let deleted = Arc::clone(&deleted);
        let id = id.clone();
        thread::spawn(move || {
            loader.delete(&id).unwrap();
            *deleted.lock().unwrap() = true;
        })
    };

    thread::sleep(Duration::from_millis(100));
    assert!(!*deleted.lock().unwrap());
    assert_eq!(staged.read_source().unwrap(), "1");

    drop(staged);
    handle.join().unwrap();
    assert!(*deleted.lock().unwrap());
}

#[test]
fn test_different_ids_do_not_block_each_other() {
    let fixture = Fixture::new();
    let a = fixture.write("/apps/a.rhai", "1");
    let b = fixture.write("/apps/b.rhai", "2");
    fixture.loader.refresh(&b).unwrap();

    // A writer on `a` is parked behind this reader
    let held = fixture.loader.resolve(&a).unwrap();
    let handle = {
        let loader = Arc::clone(&fixture.loader);
        let a = a.clone();
        thread::spawn(move || loader.delete(&a).unwrap())
    };
    thread::sleep(Duration::from_millis(50));

    let start = Instant::now();
    let staged = fixture.loader.resolve(&b).unwrap();
    assert_eq!(staged.read_source().unwrap(), "2");
    assert!(start.elapsed() < Duration::from_secs(1));

    drop(held);
    handle.join().unwrap();
}

#[test]
fn test_builds_of_different_ids_are_serialized() {
    let fixture = Fixture::with_delay(Duration::from_millis(100));
    let ids = [
        fixture.write("/apps/a.rhai", "1"),
        fixture.write("/apps/b.rhai", "2"),
        fixture.write("/apps/c.rhai", "3"),
    ];

    let barrier = Arc::new(Barrier::new(ids.len()));
    let handles: Vec<_> = ids
        .iter()
        .cloned()
        .map(|id| {
            let loader = Arc::clone(&fixture.loader);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                loader.refresh(&id).unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(fixture.builds(), 3);
    assert_eq!(fixture.peak_builds.load(Ordering::SeqCst), 1);
}

#[test]
fn test_staged_id_is_served_during_another_build() {
    let fixture = Fixture::with_delay(Duration::from_millis(1500));
    let ready = fixture.write("/apps/ready.rhai", "1");
    let slow = fixture.write("/apps/slow.rhai", "2");
    fixture.loader.refresh(&ready).unwrap();

    let handle = {
        let loader = Arc::clone(&fixture.loader);
        thread::spawn(move || loader.refresh(&slow).unwrap())
    };
    while fixture.builds() < 2 {
        thread::sleep(Duration::from_millis(5));
    }

    let start = Instant::now();
    let staged = fixture.loader.resolve(&ready).unwrap();
    assert_eq!(staged.read_source().unwrap(), "1");
    assert!(start.elapsed() < Duration::from_secs(1));

    drop(staged);
    handle.join().unwrap();
}

#[test]
fn test_delete_forgets_the_lock() {
    let fixture = Fixture::new();
    let a = fixture.write("/apps/a.rhai", "1");
    let b = fixture.write("/apps/b.rhai", "2");
    fixture.loader.refresh(&a).unwrap();
    fixture.loader.refresh(&b).unwrap();
    assert_eq!(fixture.loader.lock_count(), 2);

    fixture.loader.delete(&a).unwrap();
    assert_eq!(fixture.loader.lock_count(), 1);

    // A reader keeps the entry alive through a delete
    let held = fixture.loader.resolve(&b).unwrap();
    let handle = {
        let loader = Arc::clone(&fixture.loader);
        let b = b.clone();
        thread::spawn(move || loader.delete(&b).unwrap())
    };
    thread::sleep(Duration::from_millis(50));
    drop(held);
    handle.join().unwrap();
    assert_eq!(fixture.loader.lock_count(), 0);
}

#[test]
fn test_delete_removes_staged_files_and_notifies() {
    let fixture = Fixture::new();
    let id = fixture.write("/apps/page.rhai", "1");
    let notified = Arc::new(Mutex::new(Vec::new()));
    {
        let notified = Arc::clone(&notified);
        fixture
            .loader
            .set_change_listener(Arc::new(move |id: &ScriptId| {
                notified.lock().unwrap().push(id.clone());
            }));
    }

    fixture.loader.refresh(&id).unwrap();
    fixture.loader.delete(&id).unwrap();

    let layout = fixture.loader.layout();
    assert!(layout.generations(&id).unwrap().is_empty());
    assert!(!layout.source_path(&id).exists());
    assert!(!layout.output_path(&id).exists());
    assert_eq!(*notified.lock().unwrap(), vec![id.clone(), id]);
}

#[test]
fn test_find_staged_polls_placeholder() {
    let fixture = Fixture::new();
    let id = fixture.write("/apps/page.rhai", "1");
    let layout = fixture.loader.layout();

    assert!(matches!(
        fixture.loader.find_staged(&id),
        Err(ScriptError::Storage { .. })
    ));

    let placeholder = layout.placeholder(&id).unwrap();
    let start = Instant::now();
    match fixture.loader.find_staged(&id).unwrap_err() {
        ScriptError::NotReady { attempts, .. } => assert_eq!(attempts, 30),
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(start.elapsed() >= Duration::from_millis(29 * 100));
    drop(placeholder);

    let staged = fixture.loader.resolve(&id).unwrap().path().to_path_buf();
    assert_eq!(fixture.loader.find_staged(&id).unwrap(), staged);
}

#[test]
fn test_manifest_change_installs_before_next_build() {
    let fixture = Fixture::new();
    let manifest = fixture.write("/package.json", "{}");
    let id = fixture.write("/apps/page.rhai", "1");

    fixture.loader.update_config(&manifest).unwrap();
    assert!(fixture.loader.is_install_pending());
    assert!(fixture.loader.layout().config_path("package.json").exists());

    fixture.loader.refresh(&id).unwrap();
    assert!(!fixture.loader.is_install_pending());
    assert_eq!(fixture.installs.load(Ordering::SeqCst), 1);
}

#[test]
fn test_bundle_is_fingerprinted_and_pruned() {
    let fixture = Fixture::new();
    let main = fixture.write("/apps/main.rhai", "let a = 1;");
    let lib = fixture.write("/apps/lib.rhai", "let b = 2;");

    let first = fixture.loader.bundle(&main, &[lib.clone()]).unwrap();
    assert_eq!(
        fs::read_to_string(&first).unwrap(),
        "let a = 1;\nlet b = 2;\n"
    );
    assert_eq!(fixture.loader.bundle(&main, &[lib.clone()]).unwrap(), first);

    fixture.write("/apps/lib.rhai", "let b = 3;");
    fixture.touch(&lib, SystemTime::now() + Duration::from_secs(60));

    let second = fixture.loader.bundle(&main, &[lib]).unwrap();
    assert_ne!(second, first);
    assert!(!first.exists());
    assert!(second
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with("main.bundle."));
}
