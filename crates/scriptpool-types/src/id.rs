use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::ScriptError;

/// Path-like key naming one script inside the artifact store
///
/// Identifiers look like absolute paths (`/apps/site/page.rhai`). They are
/// validated on construction so they can be mapped onto the local file
/// system without escaping the base directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ScriptId(String);

impl ScriptId {
    /// Parse and validate an identifier
    pub fn new(raw: impl Into<String>) -> Result<Self, ScriptError> {
        let raw = raw.into();

        if !raw.starts_with('/') || raw.len() == 1 {
            return Err(ScriptError::InvalidId(raw));
        }

        let valid = raw[1..]
            .split('/')
            .all(|segment| !segment.is_empty() && segment != "." && segment != "..");

        if !valid || raw.contains('\\') {
            return Err(ScriptError::InvalidId(raw));
        }

        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path relative to a storage root (leading `/` removed)
    pub fn relative_path(&self) -> PathBuf {
        self.0[1..].split('/').collect()
    }

    /// Last path segment (`page.rhai`)
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// File name without its extension (`page`)
    pub fn stem(&self) -> &str {
        let name = self.file_name();
        match name.rfind('.') {
            Some(0) | None => name,
            Some(pos) => &name[..pos],
        }
    }

    /// Extension without the dot, if any
    pub fn extension(&self) -> Option<&str> {
        let name = self.file_name();
        match name.rfind('.') {
            Some(0) | None => None,
            Some(pos) => Some(&name[pos + 1..]),
        }
    }

    /// Directory part of the identifier (`/apps/site`), `/` for top level ids
    pub fn parent(&self) -> &str {
        match self.0.rfind('/') {
            Some(0) | None => "/",
            Some(pos) => &self.0[..pos],
        }
    }

    /// Whether the file name ends with one of the given extensions
    pub fn has_extension(&self, extensions: &[String]) -> bool {
        self.extension()
            .map(|ext| extensions.iter().any(|e| e.trim_start_matches('.') == ext))
            .unwrap_or(false)
    }
}

impl fmt::Display for ScriptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ScriptId {
    type Err = ScriptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for ScriptId {
    type Error = ScriptError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ScriptId> for String {
    fn from(id: ScriptId) -> Self {
        id.0
    }
}

impl AsRef<str> for ScriptId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
