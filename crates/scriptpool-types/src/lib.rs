//! Types shared between the loader and the engine host.
//!
//! Nothing in here knows about threads, engines or the file system layout;
//! it only names scripts, describes what can go wrong and what changed.

pub mod change;
pub mod error;
pub mod id;

pub use change::{ChangeEvent, ChangeKind, ChangeListener};
pub use error::{ScriptError, ScriptResult};
pub use id::ScriptId;
