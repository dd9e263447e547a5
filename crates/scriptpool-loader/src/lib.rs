//! Script artifact staging
//!
//! Maps script identifiers from an [`ArtifactStore`] onto staged files under a
//! local base directory, rebuilding them through a [`BuildStep`] when the
//! source moves ahead of the staged copy. Callers hold a [`StagedScript`]
//! (a read lock on the identifier) while they use the file.

pub mod build;
pub mod bundle;
pub mod config;
pub mod layout;
pub mod loader;
pub mod locks;
pub mod scanner;
pub mod store;

pub use build::{BuildFailure, BuildStep, CommandBuildStep, NativeBuildStep};
pub use config::{BuildConfig, LoaderConfig};
pub use layout::{Generation, StagingLayout};
pub use loader::{ScriptLoader, StagedScript};
pub use locks::LockTable;
pub use scanner::{ScanResult, ScriptScanner};
pub use store::{ArtifactStore, FsArtifactStore};

pub use scriptpool_types::{ChangeEvent, ChangeKind, ChangeListener, ScriptError, ScriptId};
