//! Object bridge between host objects and scripts
//!
//! Host types describe themselves through [`HostObject`] member tables. During
//! an evaluation every object the script can reach lives in a
//! [`WrapperRegistry`]; the script only ever holds keys into it.

pub mod catalog;
pub mod registry;
pub mod table;
pub mod value;

pub use catalog::{CatalogLease, TypeCatalog};
pub use registry::{WrapperRegistry, DEFAULT_MAX_SCRIPT_OBJECTS};
pub use table::{HostObject, MemberTable, Members, Overload, ParamKind, ADAPT_MEMBER, SELF_MEMBER};
pub use value::{HostValue, Value, WrapperKey};

use scriptpool_types::ScriptError;

/// Failures raised while a script calls into the host
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BridgeError {
    #[error("No overload of {type_name}.{member} accepts {arity} argument(s)")]
    NoMatchingOverload {
        type_name: String,
        member: String,
        arity: usize,
    },

    #[error("Maximum of {limit} script objects reached")]
    TooManyScriptObjects { limit: usize },

    #[error("{type_name}.{member} failed: {message}")]
    HostCall {
        type_name: String,
        member: String,
        message: String,
    },

    #[error("Script object #{0} was released or never existed")]
    UnknownObject(WrapperKey),
}

impl From<BridgeError> for ScriptError {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::NoMatchingOverload {
                type_name,
                member,
                arity,
            } => ScriptError::NoMatchingOverload {
                type_name,
                member,
                arity,
            },
            BridgeError::TooManyScriptObjects { limit } => {
                ScriptError::TooManyScriptObjects { limit }
            }
            BridgeError::HostCall {
                type_name,
                member,
                message,
            } => ScriptError::HostCall {
                type_name,
                member,
                message,
            },
            unknown @ BridgeError::UnknownObject(_) => ScriptError::HostCall {
                type_name: "ScriptObject".to_string(),
                member: String::new(),
                message: unknown.to_string(),
            },
        }
    }
}
