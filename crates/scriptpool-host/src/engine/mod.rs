//! One Rhai runtime, pinned to the worker thread that created it
//!
//! A [`ScriptEngine`] is `!Send`. The pool creates it lazily on a worker and
//! drops it when that worker exits; nothing else ever touches it.

mod calls;
pub mod glue;
pub mod logger;
mod resolver;

pub use glue::{ScriptObject, MAX_ARITY};
pub use logger::{ScriptLogger, LOGGER_NAME};

use rhai::{Dynamic, Engine, EvalAltResult, AST};
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use scriptpool_loader::ScriptLoader;
use scriptpool_types::{ScriptError, ScriptId, ScriptResult};

use crate::bridge::{catalog, HostValue, TypeCatalog, WrapperRegistry, ADAPT_MEMBER, SELF_MEMBER};
use glue::BridgeState;
use resolver::{LoaderModuleResolver, ModuleCache};

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// Rhai keyword functions plus the names the bridge registers itself; host
/// members with these names are reachable through `invoke` only
const RESERVED_NAMES: &[&str] = &[
    "invoke", "to_string", "to_debug", "print", "debug", "type_of", "eval", "Fn", "call",
    "curry",
];

/// Per-engine settings
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Bound on wrappers per evaluation
    pub max_script_objects: usize,
    /// Function called after the top level when a request asks for it
    pub entry_function: String,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_script_objects: crate::bridge::DEFAULT_MAX_SCRIPT_OBJECTS,
            entry_function: "render".to_string(),
        }
    }
}

struct CompiledScript {
    path: PathBuf,
    ast: Rc<AST>,
    /// Modules reachable through literal imports
    imports: HashSet<ScriptId>,
}

pub struct ScriptEngine {
    engine: Engine,
    loader: Arc<ScriptLoader>,
    bridge: Rc<BridgeState>,
    modules: ModuleCache,
    scripts: HashMap<ScriptId, CompiledScript>,
    catalog: Option<Arc<TypeCatalog>>,
    catalog_generation: u64,
    registered: HashSet<String>,
    logger: HostValue,
    options: EngineOptions,
    instance_id: u64,
}

impl ScriptEngine {
    /// Create an engine whose imports resolve through `loader`
    ///
    /// Setting `cancel` interrupts a running evaluation at its next
    /// progress check.
    pub fn new(
        loader: Arc<ScriptLoader>,
        options: EngineOptions,
        cancel: Arc<AtomicBool>,
    ) -> ScriptResult<Self> {
        if options.max_script_objects == 0 {
            return Err(ScriptError::Config(
                "max_script_objects must be at least 1".to_string(),
            ));
        }

        let instance_id = NEXT_INSTANCE.fetch_add(1, Ordering::SeqCst);
        let bridge = Rc::new(BridgeState::default());
        let modules: ModuleCache = Rc::new(RefCell::new(HashMap::new()));

        let mut engine = Engine::new();
        engine.set_module_resolver(LoaderModuleResolver::new(
            Arc::clone(&loader),
            Rc::clone(&modules),
        ));

        engine.on_print(|text| {
            tracing::info!(target: "script", "{}", text);
        });
        engine.on_debug(|text, source, pos| match source {
            Some(source) => tracing::debug!(target: "script", "{} @ {}: {}", source, pos, text),
            None => tracing::debug!(target: "script", "{}: {}", pos, text),
        });
        engine.on_progress(move |_| {
            if cancel.load(Ordering::Relaxed) {
                Some(Dynamic::UNIT)
            } else {
                None
            }
        });

        glue::register_object_type(&mut engine, &bridge);
        glue::register_globals(&mut engine, &bridge);

        let mut registered = HashSet::new();
        for name in [SELF_MEMBER, ADAPT_MEMBER] {
            glue::register_member(&mut engine, &bridge, name);
            registered.insert(name.to_string());
        }

        let logger = HostValue::new(ScriptLogger::new(format!("engine-{instance_id}")));

        tracing::debug!(target: "scripting", "Created script engine {}", instance_id);

        Ok(Self {
            engine,
            loader,
            bridge,
            modules,
            scripts: HashMap::new(),
            catalog: None,
            catalog_generation: 0,
            registered,
            logger,
            options,
            instance_id,
        })
    }

    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Run the staged script at `path`
    ///
    /// `bindings` are visible to the script under their names, next to `log`.
    /// With `call_entry` the entry function is called after the top level and
    /// its value returned; otherwise the value of the top level is.
    pub fn evaluate(
        &mut self,
        id: &ScriptId,
        path: &Path,
        bindings: Vec<(String, HostValue)>,
        call_entry: bool,
    ) -> ScriptResult<Dynamic> {
        self.sync_members();
        let ast = self.compiled(id, path)?;

        let mut registry = WrapperRegistry::new(self.options.max_script_objects);
        let mut globals = HashMap::new();
        let mut roots = Vec::with_capacity(bindings.len() + 1);

        let named = std::iter::once((LOGGER_NAME.to_string(), self.logger.clone())).chain(bindings);
        for (name, value) in named {
            let key = registry
                .wrap(value, Some(&name))
                .map_err(ScriptError::from)?;
            if let Some(previous) = globals.insert(name, key) {
                registry.release(previous);
            }
            roots.push(key);
        }

        self.bridge.begin(registry, globals);
        let result = self.run(&ast, call_entry);

        if let Some(mut registry) = self.bridge.finish() {
            for key in roots.into_iter().rev() {
                registry.release(key);
            }
            let leftover = registry.release_all();
            if leftover > 0 {
                tracing::debug!(
                    target: "scripting",
                    "Released {} unattached script object(s) after {}",
                    leftover,
                    id
                );
            }
        }

        result.map_err(|err| match self.bridge.take_fault(&err) {
            Some(fault) => fault,
            None => self.script_error(id, &err),
        })
    }

    /// Drop whatever this engine cached for `id`, including scripts importing it
    pub fn invalidate(&mut self, id: &ScriptId) {
        let module = self.modules.borrow_mut().remove(id).is_some();
        let before = self.scripts.len();
        self.scripts
            .retain(|script_id, script| script_id != id && !script.imports.contains(id));
        let script = self.scripts.len() < before;
        if module || script {
            tracing::debug!(
                target: "scripting",
                "Engine {} dropped cached {}",
                self.instance_id,
                id
            );
        }
    }

    pub fn invalidate_all(&mut self) {
        self.modules.borrow_mut().clear();
        self.scripts.clear();
        tracing::debug!(target: "scripting", "Engine {} dropped all cached scripts", self.instance_id);
    }

    pub fn is_module_cached(&self, id: &ScriptId) -> bool {
        self.modules.borrow().contains_key(id)
    }

    pub fn is_script_cached(&self, id: &ScriptId) -> bool {
        self.scripts.contains_key(id)
    }

    fn run(&self, ast: &AST, call_entry: bool) -> Result<Dynamic, Box<EvalAltResult>> {
        let mut scope = rhai::Scope::new();
        if !call_entry {
            return self.engine.eval_ast_with_scope::<Dynamic>(&mut scope, ast);
        }

        let entry = self.options.entry_function.as_str();
        if !ast.iter_functions().any(|f| f.name == entry) {
            return Err(Box::new(EvalAltResult::ErrorFunctionNotFound(
                format!("{entry} (entry function)"),
                rhai::Position::NONE,
            )));
        }
        // Runs the top level first, then the entry function
        self.engine.call_fn::<Dynamic>(&mut scope, ast, entry, ())
    }

    fn compiled(&mut self, id: &ScriptId, path: &Path) -> ScriptResult<Rc<AST>> {
        if let Some(script) = self.scripts.get(id) {
            if script.path == path {
                return Ok(Rc::clone(&script.ast));
            }
        }

        let source =
            std::fs::read_to_string(path).map_err(|e| ScriptError::storage(id.as_str(), e))?;
        let mut ast = self
            .engine
            .compile(&source)
            .map_err(|e| ScriptError::script(id.as_str(), e.to_string()))?;
        ast.set_source(id.as_str());

        let (names, imports) = self.call_sites(id, &source);
        self.register_names(names);

        let ast = Rc::new(ast);
        self.scripts.insert(
            id.clone(),
            CompiledScript {
                path: path.to_path_buf(),
                ast: Rc::clone(&ast),
                imports,
            },
        );
        Ok(ast)
    }

    /// Names called by `source` and by the modules it imports literally
    ///
    /// Modules that cannot be staged are skipped; the import reports the
    /// failure when it runs.
    fn call_sites(&self, id: &ScriptId, source: &str) -> (BTreeSet<String>, HashSet<ScriptId>) {
        let sites = calls::scan(source);
        let mut names = sites.names;
        let mut imports = HashSet::new();
        let mut pending: VecDeque<(ScriptId, String)> = sites
            .imports
            .into_iter()
            .map(|path| (id.clone(), path))
            .collect();

        while let Some((importer, path)) = pending.pop_front() {
            let Some(module) = LoaderModuleResolver::module_id(Some(importer.as_str()), &path)
            else {
                continue;
            };
            if module == *id || !imports.insert(module.clone()) {
                continue;
            }

            let source = match self.loader.resolve(&module).and_then(|s| s.read_source()) {
                Ok(source) => source,
                Err(e) => {
                    tracing::debug!(
                        target: "scripting",
                        "Not scanning {} imported by {}: {}",
                        module,
                        importer,
                        e
                    );
                    continue;
                }
            };
            let sites = calls::scan(&source);
            names.extend(sites.names);
            pending.extend(sites.imports.into_iter().map(|path| (module.clone(), path)));
        }

        (names, imports)
    }

    fn register_names(&mut self, names: impl IntoIterator<Item = String>) {
        for name in names {
            if RESERVED_NAMES.contains(&name.as_str()) || self.registered.contains(&name) {
                continue;
            }
            glue::register_member(&mut self.engine, &self.bridge, &name);
            self.registered.insert(name);
        }
    }

    /// Register member names added to the catalog since the last evaluation
    fn sync_members(&mut self) {
        let current = catalog::global();
        let generation = current.generation();
        let unchanged = self
            .catalog
            .as_ref()
            .is_some_and(|known| Arc::ptr_eq(known, &current))
            && generation == self.catalog_generation;
        if unchanged {
            return;
        }

        self.register_names(current.member_names());
        self.catalog = Some(current);
        self.catalog_generation = generation;
    }

    fn script_error(&self, id: &ScriptId, err: &EvalAltResult) -> ScriptError {
        if matches!(err, EvalAltResult::ErrorTerminated(..)) {
            return ScriptError::script(id.as_str(), "evaluation cancelled");
        }
        ScriptError::script(id.as_str(), err.to_string())
    }
}

impl Drop for ScriptEngine {
    fn drop(&mut self) {
        tracing::debug!(target: "scripting", "Dropping script engine {}", self.instance_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{HostObject, Members, ParamKind, Value};
    use scriptpool_loader::{FsArtifactStore, LoaderConfig};
    use std::fs;
    use tempfile::TempDir;

    struct Page {
        title: String,
    }

    impl HostObject for Page {
        const TYPE_NAME: &'static str = "EnginePage";

        fn members(members: &mut Members<Self>) {
            members
                .method("title", &[], |page, _| Ok(page.title.clone().into()))
                .method("title", &[ParamKind::Str], |page, args| {
                    Ok(format!("{}{}", args[0].as_str().unwrap_or_default(), page.title).into())
                })
                .method("shout", &[ParamKind::Int], |page, args| {
                    let times = args[0].as_int().unwrap_or(1).max(0) as usize;
                    Ok(Value::Str(page.title.to_uppercase().repeat(times)))
                })
                .method("note", &[], |page, _| {
                    Ok(Value::object(Note {
                        text: format!("note on {}", page.title),
                    }))
                })
                .method("tag", &[], |page, _| {
                    Ok(Value::object(Tag {
                        label: page.title.to_uppercase(),
                    }))
                });
        }
    }

    /// Only ever created by `Page::note`, never registered up front
    struct Note {
        text: String,
    }

    impl HostObject for Note {
        const TYPE_NAME: &'static str = "EngineNote";

        fn members(members: &mut Members<Self>) {
            members.method("text", &[], |note, _| Ok(note.text.clone().into()));
        }
    }

    /// Only ever created by `Page::tag`, never registered up front
    struct Tag {
        label: String,
    }

    impl HostObject for Tag {
        const TYPE_NAME: &'static str = "EngineTag";

        fn members(members: &mut Members<Self>) {
            members.method("label", &[], |tag, _| Ok(tag.label.clone().into()));
        }
    }

    struct Fixture {
        _lease: crate::bridge::CatalogLease,
        _dir: TempDir,
        store_dir: PathBuf,
        loader: Arc<ScriptLoader>,
    }

    impl Fixture {
        fn new() -> Self {
            let lease = catalog::acquire();
            let dir = TempDir::new().unwrap();
            let store_dir = dir.path().join("store");
            fs::create_dir_all(&store_dir).unwrap();

            let config = LoaderConfig {
                base_dir: Some(dir.path().join("stage")),
                ..LoaderConfig::default()
            };
            let store = Arc::new(FsArtifactStore::new(&store_dir));
            let loader = Arc::new(ScriptLoader::new(config, store).unwrap());
            Self {
                _lease: lease,
                _dir: dir,
                store_dir,
                loader,
            }
        }

        fn write(&self, id: &str, source: &str) -> ScriptId {
            let path = self.store_dir.join(id.trim_start_matches('/'));
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, source).unwrap();
            ScriptId::new(id).unwrap()
        }

        fn engine(&self) -> ScriptEngine {
            ScriptEngine::new(
                Arc::clone(&self.loader),
                EngineOptions::default(),
                Arc::new(AtomicBool::new(false)),
            )
            .unwrap()
        }

        fn eval(
            &self,
            engine: &mut ScriptEngine,
            id: &ScriptId,
            bindings: Vec<(String, HostValue)>,
            call_entry: bool,
        ) -> ScriptResult<Dynamic> {
            let staged = self.loader.resolve(id).unwrap();
            engine.evaluate(id, staged.path(), bindings, call_entry)
        }
    }

    fn page(title: &str) -> Vec<(String, HostValue)> {
        vec![(
            "page".to_string(),
            HostValue::new(Page {
                title: title.to_string(),
            }),
        )]
    }

    #[test]
    fn test_top_level_value() {
        let fixture = Fixture::new();
        let id = fixture.write("/a.rhai", "40 + 2");
        let mut engine = fixture.engine();

        let result = fixture.eval(&mut engine, &id, vec![], false).unwrap();
        assert_eq!(result.as_int().unwrap(), 42);
        assert!(engine.is_script_cached(&id));
    }

    #[test]
    fn test_bindings_reach_entry_function() {
        let fixture = Fixture::new();
        let id = fixture.write(
            "/page.rhai",
            r#"
            fn render() {
                log.info("rendering", page.title());
                page.title("Hello, ") + " " + page.shout(2)
            }
            "#,
        );
        let mut engine = fixture.engine();

        let result = fixture.eval(&mut engine, &id, page("home"), true).unwrap();
        assert_eq!(result.into_string().unwrap(), "Hello, home HOMEHOME");
    }

    #[test]
    fn test_script_variables_shadow_bindings() {
        let fixture = Fixture::new();
        let id = fixture.write("/shadow.rhai", "let page = 5; page * 2");
        let mut engine = fixture.engine();

        let result = fixture.eval(&mut engine, &id, page("home"), false).unwrap();
        assert_eq!(result.as_int().unwrap(), 10);
    }

    #[test]
    fn test_missing_entry_function() {
        let fixture = Fixture::new();
        let id = fixture.write("/plain.rhai", "let x = 1;");
        let mut engine = fixture.engine();

        let err = fixture.eval(&mut engine, &id, vec![], true).unwrap_err();
        match err {
            ScriptError::Script { message, .. } => assert!(message.contains("render")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_no_matching_overload_surfaces() {
        let fixture = Fixture::new();
        let id = fixture.write("/bad.rhai", r#"page.shout("loud")"#);
        let mut engine = fixture.engine();

        let err = fixture.eval(&mut engine, &id, page("x"), false).unwrap_err();
        assert!(matches!(
            err,
            ScriptError::NoMatchingOverload { ref member, arity: 1, .. } if member == "shout"
        ));
    }

    #[test]
    fn test_caught_bridge_error_is_not_reported() {
        let fixture = Fixture::new();
        let id = fixture.write(
            "/caught.rhai",
            r#"
            let result = "fallback";
            try { result = page.shout("loud"); } catch { }
            result
            "#,
        );
        let mut engine = fixture.engine();

        let result = fixture.eval(&mut engine, &id, page("x"), false).unwrap();
        assert_eq!(result.into_string().unwrap(), "fallback");
    }

    #[test]
    fn test_syntax_error_is_script_error() {
        let fixture = Fixture::new();
        let id = fixture.write("/ok.rhai", "1");
        let mut engine = fixture.engine();
        let staged = fixture.loader.resolve(&id).unwrap();

        let broken = staged.path().with_file_name("broken.rhai");
        fs::write(&broken, "let = ;").unwrap();
        let err = engine.evaluate(&id, &broken, vec![], false).unwrap_err();
        assert!(matches!(err, ScriptError::Script { .. }));
    }

    #[test]
    fn test_imports_are_cached_until_invalidated() {
        let fixture = Fixture::new();
        let util = fixture.write("/lib/util.rhai", "fn double(x) { x * 2 }");
        let id = fixture.write(
            "/apps/main.rhai",
            r#"import "/lib/util.rhai" as util; util::double(21)"#,
        );
        let mut engine = fixture.engine();

        let result = fixture.eval(&mut engine, &id, vec![], false).unwrap();
        assert_eq!(result.as_int().unwrap(), 42);
        assert!(engine.is_module_cached(&util));

        // The importer is recompiled too, so the new module gets scanned
        engine.invalidate(&util);
        assert!(!engine.is_module_cached(&util));
        assert!(!engine.is_script_cached(&id));

        fixture.eval(&mut engine, &id, vec![], false).unwrap();
        assert!(engine.is_script_cached(&id));
        engine.invalidate_all();
        assert!(!engine.is_script_cached(&id));
        assert!(!engine.is_module_cached(&util));
    }

    #[test]
    fn test_returned_type_is_callable_on_first_evaluation() {
        let fixture = Fixture::new();
        let id = fixture.write("/note.rhai", "fn render() { page.note().text() }");
        let mut engine = fixture.engine();

        let result = fixture.eval(&mut engine, &id, page("home"), true).unwrap();
        assert_eq!(result.into_string().unwrap(), "note on home");
    }

    #[test]
    fn test_calls_in_imported_modules_are_registered() {
        let fixture = Fixture::new();
        fixture.write("/lib/tags.rhai", "fn label_of(p) { p.tag().label() }");
        let id = fixture.write(
            "/apps/tagged.rhai",
            r#"import "/lib/tags.rhai" as tags; tags::label_of(page)"#,
        );
        let mut engine = fixture.engine();

        let result = fixture.eval(&mut engine, &id, page("home"), false).unwrap();
        assert_eq!(result.into_string().unwrap(), "HOME");
    }

    #[test]
    fn test_script_error_after_caught_bridge_error() {
        let fixture = Fixture::new();
        let id = fixture.write(
            "/rethrow.rhai",
            r#"
            let kept = "";
            try { page.shout("loud"); } catch { kept = "caught"; }
            throw "gave up after " + kept;
            "#,
        );
        let mut engine = fixture.engine();

        let err = fixture.eval(&mut engine, &id, page("x"), false).unwrap_err();
        match err {
            ScriptError::Script { message, .. } => {
                assert!(message.contains("gave up after caught"), "{message}")
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_cancel_interrupts_evaluation() {
        let fixture = Fixture::new();
        let id = fixture.write("/spin.rhai", "loop { }");
        let cancel = Arc::new(AtomicBool::new(true));
        let mut engine = ScriptEngine::new(
            Arc::clone(&fixture.loader),
            EngineOptions::default(),
            Arc::clone(&cancel),
        )
        .unwrap();

        let err = fixture.eval(&mut engine, &id, vec![], false).unwrap_err();
        match err {
            ScriptError::Script { message, .. } => assert_eq!(message, "evaluation cancelled"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_zero_object_limit_is_rejected() {
        let fixture = Fixture::new();
        let options = EngineOptions {
            max_script_objects: 0,
            ..EngineOptions::default()
        };
        let result = ScriptEngine::new(
            Arc::clone(&fixture.loader),
            options,
            Arc::new(AtomicBool::new(false)),
        );
        assert!(matches!(result, Err(ScriptError::Config(_))));
    }
}
