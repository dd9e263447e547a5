use std::io;

use crate::id::ScriptId;

pub type ScriptResult<T> = Result<T, ScriptError>;

/// Everything that can fail between a request and a script result
#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("Invalid script identifier '{0}'")]
    InvalidId(String),

    /// The source could not be read from the store, or the staging area could
    /// not be written
    #[error("Storage error for {id}: {source}")]
    Storage {
        id: String,
        #[source]
        source: io::Error,
    },

    /// The external build step failed; captured output is kept for logging
    #[error("Build failed for {id}: {message}")]
    Build {
        id: String,
        message: String,
        stdout: String,
        stderr: String,
    },

    #[error("Artifact for {id} still not ready after {attempts} attempts")]
    NotReady { id: ScriptId, attempts: u32 },

    /// The script raised an error or a task failed while holding an engine
    #[error("Script {id} failed: {message}")]
    Script { id: String, message: String },

    #[error("Script pool is shut down")]
    PoolClosed,

    #[error("No overload of {type_name}.{member} accepts {arity} argument(s) of the given types")]
    NoMatchingOverload {
        type_name: String,
        member: String,
        arity: usize,
    },

    #[error(
        "Maximum of {limit} script objects per evaluation reached. \
         Too many non-primitive values were returned to the script"
    )]
    TooManyScriptObjects { limit: usize },

    /// A host member was found and called but reported a failure
    #[error("Call to {type_name}.{member} failed: {message}")]
    HostCall {
        type_name: String,
        member: String,
        message: String,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl ScriptError {
    pub fn storage(id: impl Into<String>, source: io::Error) -> Self {
        ScriptError::Storage {
            id: id.into(),
            source,
        }
    }

    pub fn script(id: impl Into<String>, message: impl Into<String>) -> Self {
        ScriptError::Script {
            id: id.into(),
            message: message.into(),
        }
    }

    /// Errors raised by the object bridge while a script was calling into the host
    pub fn is_bridge_error(&self) -> bool {
        matches!(
            self,
            ScriptError::NoMatchingOverload { .. }
                | ScriptError::TooManyScriptObjects { .. }
                | ScriptError::HostCall { .. }
        )
    }
}
