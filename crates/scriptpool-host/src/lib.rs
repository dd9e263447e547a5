//! Host runtime for evaluating Rhai scripts from many threads
//!
//! Rhai engines are single-threaded, so this crate keeps a fixed pool of
//! worker threads, each owning one engine for its whole life. Requests are
//! staged by the loader, queued to a free worker and evaluated there; scripts
//! reach host objects through the [`bridge`].

pub mod bridge;
pub mod config;
pub mod engine;
pub mod host;
pub mod notifier;
pub mod observer;
pub mod pool;
pub mod reload;
pub mod watch;

pub use bridge::{HostObject, HostValue, Members, ParamKind, Value};
pub use config::{ConfigError, HostConfig};
pub use engine::{EngineOptions, ScriptEngine, ScriptLogger};
pub use host::{ScriptHost, ScriptRequest};
pub use notifier::{ChangeNotifier, Invalidation, InvalidationQueue};
pub use observer::{ChangeAction, ChangeObserver};
pub use pool::{EngineFactory, EnginePool, PoolConfig};
pub use reload::{setup_reload_signal, ReloadSignal};
pub use watch::StoreWatcher;

pub use scriptpool_types::{ScriptError, ScriptId, ScriptResult};
