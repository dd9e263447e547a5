//! Change detection for a directory-backed store
//!
//! Walks the store root and compares modification times with the previous
//! walk. Only scripts (by extension) and dependency manifests (by file name)
//! are tracked.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tracing::debug;

use scriptpool_types::{ChangeEvent, ChangeKind, ScriptId};

/// Default scan interval (1000ms = 1Hz)
pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_millis(1000);

/// Result of one scan
#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    pub changed: Vec<ScriptId>,
    pub added: Vec<ScriptId>,
    pub removed: Vec<ScriptId>,
}

impl ScanResult {
    pub fn has_changes(&self) -> bool {
        !self.changed.is_empty() || !self.added.is_empty() || !self.removed.is_empty()
    }

    /// Flatten into change events: removals first, then additions and modifications
    pub fn into_events(self) -> Vec<ChangeEvent> {
        let removed = self
            .removed
            .into_iter()
            .map(|id| ChangeEvent::new(id, ChangeKind::Removed));
        let added = self
            .added
            .into_iter()
            .map(|id| ChangeEvent::new(id, ChangeKind::Added));
        let changed = self
            .changed
            .into_iter()
            .map(|id| ChangeEvent::new(id, ChangeKind::Modified));
        removed.chain(added).chain(changed).collect()
    }
}

pub struct ScriptScanner {
    root: PathBuf,
    scan_interval: Duration,
    last_scan: Option<Instant>,
    script_extensions: Vec<String>,
    config_files: Vec<String>,
    /// State from the last scan: id -> modification time
    cached_state: HashMap<ScriptId, SystemTime>,
}

impl ScriptScanner {
    pub fn new(root: PathBuf) -> Self {
        Self::with_interval(root, DEFAULT_SCAN_INTERVAL)
    }

    pub fn with_interval(root: PathBuf, scan_interval: Duration) -> Self {
        let mut scanner = Self {
            root,
            scan_interval,
            last_scan: None,
            script_extensions: vec!["rhai".to_string()],
            config_files: Vec::new(),
            cached_state: HashMap::new(),
        };
        // Pre-populate so existing files are not reported as "added"
        scanner.cached_state = scanner.current_state();
        scanner
    }

    /// Replace the tracked extensions and manifest names, re-reading the baseline
    pub fn with_filters(mut self, script_extensions: Vec<String>, config_files: Vec<String>) -> Self {
        self.script_extensions = script_extensions;
        self.config_files = config_files;
        self.cached_state = self.current_state();
        self
    }

    pub fn should_scan(&self) -> bool {
        match self.last_scan {
            Some(last) => last.elapsed() >= self.scan_interval,
            None => true,
        }
    }

    pub fn scan_changes(&mut self) -> ScanResult {
        self.last_scan = Some(Instant::now());

        debug!(
            target: "loader",
            "Scanning store for changes: {}",
            self.root.display()
        );

        let current_state = self.current_state();
        let mut result = ScanResult::default();

        for (id, modified_time) in &current_state {
            match self.cached_state.get(id) {
                Some(cached_time) if cached_time != modified_time => {
                    debug!(target: "loader", "Script changed: {}", id);
                    result.changed.push(id.clone());
                }
                Some(_) => {}
                None => {
                    debug!(target: "loader", "Script added: {}", id);
                    result.added.push(id.clone());
                }
            }
        }

        for id in self.cached_state.keys() {
            if !current_state.contains_key(id) {
                debug!(target: "loader", "Script removed: {}", id);
                result.removed.push(id.clone());
            }
        }

        // Stable order keeps event delivery deterministic
        result.changed.sort();
        result.added.sort();
        result.removed.sort();

        self.cached_state = current_state;
        result
    }

    /// Number of tracked files
    pub fn tracked(&self) -> usize {
        self.cached_state.len()
    }

    pub fn scan_interval(&self) -> Duration {
        self.scan_interval
    }

    pub fn set_scan_interval(&mut self, interval: Duration) {
        self.scan_interval = interval;
    }

    fn is_tracked(&self, id: &ScriptId) -> bool {
        id.has_extension(&self.script_extensions)
            || self.config_files.iter().any(|name| name == id.file_name())
    }

    fn current_state(&self) -> HashMap<ScriptId, SystemTime> {
        let mut state = HashMap::new();

        if !self.root.exists() {
            debug!(
                target: "loader",
                "Store directory does not exist: {}",
                self.root.display()
            );
            return state;
        }

        self.walk(&self.root, &mut state);
        state
    }

    fn walk(&self, dir: &Path, state: &mut HashMap<ScriptId, SystemTime>) {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(
                    target: "loader",
                    "Failed to read store directory {}: {}",
                    dir.display(),
                    e
                );
                return;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(e) => {
                    tracing::warn!(
                        target: "loader",
                        "Failed to read metadata for {}: {}",
                        path.display(),
                        e
                    );
                    continue;
                }
            };

            if metadata.is_dir() {
                self.walk(&path, state);
                continue;
            }

            let Some(id) = self.id_for(&path) else {
                continue;
            };
            if !self.is_tracked(&id) {
                continue;
            }

            match metadata.modified() {
                Ok(modified_time) => {
                    state.insert(id, modified_time);
                }
                Err(e) => {
                    tracing::warn!(
                        target: "loader",
                        "Failed to get modification time for {}: {}",
                        path.display(),
                        e
                    );
                }
            }
        }
    }

    fn id_for(&self, path: &Path) -> Option<ScriptId> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let mut raw = String::new();
        for component in relative.components() {
            raw.push('/');
            raw.push_str(component.as_os_str().to_str()?);
        }
        ScriptId::new(raw).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use std::io::Write;
    use tempfile::TempDir;

    fn id(raw: &str) -> ScriptId {
        ScriptId::new(raw).unwrap()
    }

    fn scanner_for(temp_dir: &TempDir) -> ScriptScanner {
        ScriptScanner::new(temp_dir.path().to_path_buf()).with_filters(
            vec!["rhai".to_string()],
            vec!["package.json".to_string()],
        )
    }

    #[test]
    fn test_should_scan_timing() {
        let temp_dir = TempDir::new().unwrap();
        let mut scanner =
            ScriptScanner::with_interval(temp_dir.path().to_path_buf(), Duration::from_millis(50));

        assert!(scanner.should_scan());
        scanner.scan_changes();
        assert!(!scanner.should_scan());

        std::thread::sleep(Duration::from_millis(60));
        assert!(scanner.should_scan());
    }

    #[test]
    fn test_existing_files_are_baseline() {
        let temp_dir = TempDir::new().unwrap();
        File::create(temp_dir.path().join("page.rhai")).unwrap();

        let mut scanner = scanner_for(&temp_dir);
        assert_eq!(scanner.tracked(), 1);
        assert!(!scanner.scan_changes().has_changes());
    }

    #[test]
    fn test_detect_new_nested_script() {
        let temp_dir = TempDir::new().unwrap();
        let mut scanner = scanner_for(&temp_dir);

        fs::create_dir_all(temp_dir.path().join("apps/site")).unwrap();
        let mut file = File::create(temp_dir.path().join("apps/site/page.rhai")).unwrap();
        file.write_all(b"1 + 1").unwrap();

        let result = scanner.scan_changes();
        assert_eq!(result.added, vec![id("/apps/site/page.rhai")]);
        assert!(result.changed.is_empty());
        assert!(result.removed.is_empty());
    }

    #[test]
    fn test_detect_modified_script() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("page.rhai");
        fs::write(&path, "1").unwrap();

        let mut scanner = scanner_for(&temp_dir);

        std::thread::sleep(Duration::from_millis(20));
        fs::write(&path, "2").unwrap();
        let modified = fs::metadata(&path).unwrap().modified().unwrap();
        File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(modified + Duration::from_secs(1))
            .unwrap();

        let events = scanner.scan_changes().into_events();
        assert_eq!(
            events,
            vec![ChangeEvent::new(id("/page.rhai"), ChangeKind::Modified)]
        );
    }

    #[test]
    fn test_detect_removed_script() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("page.rhai");
        File::create(&path).unwrap();

        let mut scanner = scanner_for(&temp_dir);
        fs::remove_file(&path).unwrap();

        let result = scanner.scan_changes();
        assert_eq!(result.removed, vec![id("/page.rhai")]);
    }

    #[test]
    fn test_tracks_scripts_and_manifests_only() {
        let temp_dir = TempDir::new().unwrap();
        let mut scanner = scanner_for(&temp_dir);

        File::create(temp_dir.path().join("page.rhai")).unwrap();
        File::create(temp_dir.path().join("package.json")).unwrap();
        File::create(temp_dir.path().join("notes.txt")).unwrap();
        File::create(temp_dir.path().join("page.js")).unwrap();

        let result = scanner.scan_changes();
        assert_eq!(result.added, vec![id("/package.json"), id("/page.rhai")]);
        assert_eq!(scanner.tracked(), 2);
    }

    #[test]
    fn test_handles_missing_directory() {
        let mut scanner = ScriptScanner::new(PathBuf::from("/tmp/scriptpool_missing_store_12345"));
        assert!(!scanner.scan_changes().has_changes());
        assert_eq!(scanner.tracked(), 0);
    }
}
