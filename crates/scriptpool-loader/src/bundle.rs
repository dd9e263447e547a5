//! Fingerprinted bundles of several staged scripts
//!
//! A bundle concatenates the staged artifacts of a main script and its
//! companions into `<stem>.bundle.<hash>.<ext>` next to the main script's
//! generations. Older bundles of the same main script are pruned.

use sha2::{Digest, Sha256};
use std::fs;
use std::path::PathBuf;

use scriptpool_types::{ScriptError, ScriptId, ScriptResult};

use crate::layout::{remove_if_exists, StagingLayout};
use crate::loader::ScriptLoader;

const BUNDLE_SELECTOR: &str = "bundle";

fn bundle_hash(contents: &[u8]) -> String {
    Sha256::digest(contents)
        .iter()
        .take(8)
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

fn bundle_prefix(main: &ScriptId) -> String {
    format!("{}.{}.", main.stem(), BUNDLE_SELECTOR)
}

fn bundle_path(layout: &StagingLayout, main: &ScriptId, hash: &str) -> PathBuf {
    let name = match main.extension() {
        Some(ext) => format!("{}{}.{}", bundle_prefix(main), hash, ext),
        None => format!("{}{}", bundle_prefix(main), hash),
    };
    layout.generation_dir(main).join(name)
}

impl ScriptLoader {
    /// Stage `main` followed by `companions` as one bundle and return its path
    ///
    /// Every part is resolved first, so stale parts are rebuilt. An unchanged
    /// set of parts maps to the same bundle file.
    pub fn bundle(&self, main: &ScriptId, companions: &[ScriptId]) -> ScriptResult<PathBuf> {
        let mut contents = Vec::new();
        for id in std::iter::once(main).chain(companions) {
            let staged = self.resolve(id)?;
            let bytes =
                fs::read(staged.path()).map_err(|e| ScriptError::storage(id.as_str(), e))?;
            contents.extend_from_slice(&bytes);
            if !bytes.ends_with(b"\n") {
                contents.push(b'\n');
            }
        }

        let storage = |e| ScriptError::storage(main.as_str(), e);
        let path = bundle_path(self.layout(), main, &bundle_hash(&contents));

        let _build = self.build_lock.lock();
        if !path.exists() {
            fs::write(&path, &contents).map_err(storage)?;
            tracing::info!(
                target: "loader",
                "Bundled {} script(s) into {}",
                companions.len() + 1,
                path.display()
            );
        }

        let prefix = bundle_prefix(main);
        let entries = fs::read_dir(self.layout().generation_dir(main)).map_err(storage)?;
        for entry in entries.flatten() {
            let is_old_bundle = entry
                .file_name()
                .to_str()
                .map(|name| name.starts_with(&prefix))
                .unwrap_or(false);
            if is_old_bundle && entry.path() != path {
                remove_if_exists(&entry.path()).map_err(storage)?;
            }
        }

        Ok(path)
    }
}
