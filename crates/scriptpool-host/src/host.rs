use rhai::Dynamic;
use serde::de::DeserializeOwned;
use std::path::PathBuf;
use std::sync::Arc;

use scriptpool_loader::{build, ArtifactStore, BuildStep, ScriptLoader};
use scriptpool_types::{ScriptError, ScriptId, ScriptResult};

use crate::bridge::{HostObject, HostValue};
use crate::config::HostConfig;
use crate::engine::{ScriptEngine, ScriptObject};
use crate::notifier::ChangeNotifier;
use crate::observer::ChangeObserver;
use crate::pool::{EngineFactory, EnginePool};

type Binding = Box<dyn FnOnce() -> HostValue + Send>;

/// One evaluation: which script, which objects it sees, how it is entered
///
/// Host objects are not `Send`, so a binding is a constructor run on the
/// worker that evaluates the script.
pub struct ScriptRequest {
    id: ScriptId,
    bindings: Vec<(String, Binding)>,
    call_entry: bool,
}

impl ScriptRequest {
    /// Request that runs the top level and then the entry function
    pub fn new(id: ScriptId) -> Self {
        Self {
            id,
            bindings: Vec::new(),
            call_entry: true,
        }
    }

    /// Expose the object built by `make` to the script as `name`
    pub fn bind<T, F>(mut self, name: impl Into<String>, make: F) -> Self
    where
        T: HostObject,
        F: FnOnce() -> T + Send + 'static,
    {
        self.bindings
            .push((name.into(), Box::new(move || HostValue::new(make()))));
        self
    }

    /// Whether to call the entry function after the top level (default: true)
    pub fn call_entry(mut self, call_entry: bool) -> Self {
        self.call_entry = call_entry;
        self
    }

    pub fn id(&self) -> &ScriptId {
        &self.id
    }

    fn into_task<R>(
        self,
        path: PathBuf,
        convert: fn(&ScriptId, Dynamic) -> ScriptResult<R>,
    ) -> impl FnOnce(&mut ScriptEngine) -> ScriptResult<R> + Send + 'static
    where
        R: Send + 'static,
    {
        let ScriptRequest {
            id,
            bindings,
            call_entry,
        } = self;

        move |engine| {
            let bindings = bindings
                .into_iter()
                .map(|(name, make)| (name, make()))
                .collect();
            let value = engine.evaluate(&id, &path, bindings, call_entry)?;

            if value.is::<ScriptObject>() {
                return Err(ScriptError::script(
                    id.as_str(),
                    "a host object cannot be returned from an evaluation",
                ));
            }
            convert(&id, value)
        }
    }
}

fn deserialize<R: DeserializeOwned>(id: &ScriptId, value: Dynamic) -> ScriptResult<R> {
    rhai::serde::from_dynamic::<R>(&value)
        .map_err(|e| ScriptError::script(id.as_str(), format!("unexpected result: {e}")))
}

fn display(_: &ScriptId, value: Dynamic) -> ScriptResult<String> {
    if value.is_unit() {
        return Ok(String::new());
    }
    Ok(value.to_string())
}

/// Loader, engine pool and change plumbing wired together
pub struct ScriptHost {
    config: HostConfig,
    loader: Arc<ScriptLoader>,
    notifier: Arc<ChangeNotifier>,
    pool: EnginePool,
}

impl ScriptHost {
    /// Host using the build step named by the configuration
    pub fn new(config: HostConfig, store: Arc<dyn ArtifactStore>) -> ScriptResult<Self> {
        let builder = build::from_config(&config.loader.build, &config.loader.script_extensions);
        Self::with_build_step(config, store, builder)
    }

    pub fn with_build_step(
        config: HostConfig,
        store: Arc<dyn ArtifactStore>,
        builder: Box<dyn BuildStep>,
    ) -> ScriptResult<Self> {
        config.validate()?;

        let loader = Arc::new(ScriptLoader::with_build_step(
            config.loader.clone(),
            store,
            builder,
        )?);
        let notifier = Arc::new(ChangeNotifier::new());
        loader.set_change_listener(notifier.clone());

        let options = config.engine_options();
        let factory: EngineFactory = {
            let loader = Arc::clone(&loader);
            Arc::new(move |cancel| ScriptEngine::new(Arc::clone(&loader), options.clone(), cancel))
        };
        let pool = EnginePool::new(config.pool_config(), factory, Arc::clone(&notifier))?;

        tracing::info!(
            target: "scripting",
            "Script host ready, staging under {}",
            loader.layout().project_dir().display()
        );

        Ok(Self {
            config,
            loader,
            notifier,
            pool,
        })
    }

    /// Run any pending dependency install and build up front
    pub fn prepare(&self) -> ScriptResult<()> {
        self.loader.prepare()
    }

    /// Stage the script, evaluate it on a free engine and convert the result
    ///
    /// Blocks until the evaluation finishes. The staged artifact stays locked
    /// against rebuilds for that long.
    pub fn evaluate<R>(&self, request: ScriptRequest) -> ScriptResult<R>
    where
        R: DeserializeOwned + Send + 'static,
    {
        self.run(request, deserialize::<R>)
    }

    pub async fn evaluate_async<R>(&self, request: ScriptRequest) -> ScriptResult<R>
    where
        R: DeserializeOwned + Send + 'static,
    {
        self.run_async(request, deserialize::<R>).await
    }

    /// Evaluate and return the result as text; a unit result renders empty
    pub fn render(&self, request: ScriptRequest) -> ScriptResult<String> {
        self.run(request, display)
    }

    pub async fn render_async(&self, request: ScriptRequest) -> ScriptResult<String> {
        self.run_async(request, display).await
    }

    fn run<R: Send + 'static>(
        &self,
        request: ScriptRequest,
        convert: fn(&ScriptId, Dynamic) -> ScriptResult<R>,
    ) -> ScriptResult<R> {
        let staged = self.loader.resolve(request.id())?;
        let task = request.into_task(staged.path().to_path_buf(), convert);
        let result = self.pool.submit(task);
        drop(staged);
        result
    }

    async fn run_async<R: Send + 'static>(
        &self,
        request: ScriptRequest,
        convert: fn(&ScriptId, Dynamic) -> ScriptResult<R>,
    ) -> ScriptResult<R> {
        let loader = Arc::clone(&self.loader);
        let id = request.id().clone();
        // Staging may wait on a build
        let staged = tokio::task::spawn_blocking(move || loader.resolve(&id))
            .await
            .map_err(|e| ScriptError::script(request.id().as_str(), e.to_string()))??;

        let task = request.into_task(staged.path().to_path_buf(), convert);
        let result = self.pool.submit_async(task).await;
        drop(staged);
        result
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn loader(&self) -> &Arc<ScriptLoader> {
        &self.loader
    }

    pub fn notifier(&self) -> &Arc<ChangeNotifier> {
        &self.notifier
    }

    pub fn pool(&self) -> &EnginePool {
        &self.pool
    }

    /// Observer feeding store events into this host's loader
    pub fn observer(&self) -> ChangeObserver {
        ChangeObserver::new(Arc::clone(&self.loader))
    }

    pub fn shutdown(&self) {
        self.pool.shutdown();
    }
}
