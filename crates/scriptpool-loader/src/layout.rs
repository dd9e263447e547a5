//! On-disk layout of the staging area
//!
//! ```text
//! <base>/                          project dir (manifests live here)
//! <base>/src/apps/page.rhai        source copy
//! <base>/out/apps/page.rhai        raw build output
//! <base>/out/apps/page.<fp>.rhai   staged generation
//! <base>/out/apps/page.building    placeholder while a build is running
//! ```

use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use scriptpool_types::ScriptId;

const FINGERPRINT_LEN: usize = 16;
const PLACEHOLDER_EXT: &str = "building";

/// First 16 hex characters of the SHA-256 of `bytes`
pub fn fingerprint(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut hex = String::with_capacity(FINGERPRINT_LEN);
    for byte in digest.iter().take(FINGERPRINT_LEN / 2) {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

fn is_fingerprint(candidate: &str) -> bool {
    candidate.len() == FINGERPRINT_LEN && candidate.chars().all(|c| c.is_ascii_hexdigit())
}

/// One promoted build output for an identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub path: PathBuf,
    pub fingerprint: String,
    pub modified: SystemTime,
}

#[derive(Debug, Clone)]
pub struct StagingLayout {
    base_dir: PathBuf,
}

impl StagingLayout {
    /// Create the base directory with its `src/` and `out/` children
    pub fn create(base_dir: impl Into<PathBuf>) -> io::Result<Self> {
        let layout = Self {
            base_dir: base_dir.into(),
        };
        fs::create_dir_all(layout.src_dir())?;
        fs::create_dir_all(layout.out_dir())?;
        Ok(layout)
    }

    /// Directory the build step runs in
    pub fn project_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn src_dir(&self) -> PathBuf {
        self.base_dir.join("src")
    }

    pub fn out_dir(&self) -> PathBuf {
        self.base_dir.join("out")
    }

    pub fn source_path(&self, id: &ScriptId) -> PathBuf {
        self.src_dir().join(id.relative_path())
    }

    pub fn output_path(&self, id: &ScriptId) -> PathBuf {
        self.out_dir().join(id.relative_path())
    }

    /// Directory holding the generations, placeholder and bundles of `id`
    pub fn generation_dir(&self, id: &ScriptId) -> PathBuf {
        match self.output_path(id).parent() {
            Some(parent) => parent.to_path_buf(),
            None => self.out_dir(),
        }
    }

    pub fn generation_path(&self, id: &ScriptId, fingerprint: &str) -> PathBuf {
        let name = match id.extension() {
            Some(ext) => format!("{}.{}.{}", id.stem(), fingerprint, ext),
            None => format!("{}.{}", id.stem(), fingerprint),
        };
        self.generation_dir(id).join(name)
    }

    pub fn placeholder_path(&self, id: &ScriptId) -> PathBuf {
        self.generation_dir(id)
            .join(format!("{}.{}", id.stem(), PLACEHOLDER_EXT))
    }

    /// Path of a manifest copied into the project directory
    pub fn config_path(&self, file_name: &str) -> PathBuf {
        self.base_dir.join(file_name)
    }

    /// All staged generations of `id`, newest first
    pub fn generations(&self, id: &ScriptId) -> io::Result<Vec<Generation>> {
        let dir = self.generation_dir(id);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let prefix = format!("{}.", id.stem());
        let suffix = id.extension().map(|ext| format!(".{ext}"));

        let mut generations = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Some(rest) = name.strip_prefix(&prefix) else {
                continue;
            };
            let candidate = match &suffix {
                Some(suffix) => match rest.strip_suffix(suffix.as_str()) {
                    Some(candidate) => candidate,
                    None => continue,
                },
                None => rest,
            };
            if !is_fingerprint(candidate) {
                continue;
            }

            let modified = entry.metadata()?.modified()?;
            generations.push(Generation {
                path: entry.path(),
                fingerprint: candidate.to_string(),
                modified,
            });
        }

        generations.sort_by(|a, b| b.modified.cmp(&a.modified));
        Ok(generations)
    }

    /// Newest staged generation of `id`, if any
    pub fn newest_generation(&self, id: &ScriptId) -> io::Result<Option<Generation>> {
        Ok(self.generations(id)?.into_iter().next())
    }

    /// Remove every generation of `id` except `keep`. Returns how many were removed.
    pub fn prune_generations(&self, id: &ScriptId, keep: Option<&Path>) -> io::Result<usize> {
        let mut removed = 0;
        for generation in self.generations(id)? {
            if Some(generation.path.as_path()) == keep {
                continue;
            }
            remove_if_exists(&generation.path)?;
            removed += 1;
        }
        Ok(removed)
    }

    /// Write the placeholder for `id`; it is removed again when the guard drops
    pub fn placeholder(&self, id: &ScriptId) -> io::Result<Placeholder> {
        let path = self.placeholder_path(id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, b"")?;
        Ok(Placeholder { path })
    }
}

/// Marker file present while an artifact is being built
#[derive(Debug)]
pub struct Placeholder {
    path: PathBuf,
}

impl Drop for Placeholder {
    fn drop(&mut self) {
        if let Err(e) = remove_if_exists(&self.path) {
            tracing::warn!(
                target: "loader",
                "Failed to remove placeholder {}: {}",
                self.path.display(),
                e
            );
        }
    }
}

/// `fs::remove_file` that treats a missing file as success
pub(crate) fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
