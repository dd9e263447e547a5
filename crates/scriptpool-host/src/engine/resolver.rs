use rhai::{Engine, EvalAltResult, Module, ModuleResolver, Position, Scope, Shared};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use scriptpool_loader::ScriptLoader;
use scriptpool_types::ScriptId;

/// Compiled modules of one engine, keyed by identifier
pub(crate) type ModuleCache = Rc<RefCell<HashMap<ScriptId, Shared<Module>>>>;

/// Resolves `import` paths through the loader and caches the result
///
/// Paths are script identifiers. A path without a leading `/` is taken
/// relative to the directory of the importing script.
pub(crate) struct LoaderModuleResolver {
    loader: Arc<ScriptLoader>,
    cache: ModuleCache,
}

impl LoaderModuleResolver {
    pub(crate) fn new(loader: Arc<ScriptLoader>, cache: ModuleCache) -> Self {
        Self { loader, cache }
    }

    pub(crate) fn module_id(source: Option<&str>, path: &str) -> Option<ScriptId> {
        if path.starts_with('/') {
            return ScriptId::new(path).ok();
        }

        let parent = source
            .and_then(|source| ScriptId::new(source).ok())
            .map(|id| id.parent().to_string())
            .unwrap_or_else(|| "/".to_string());

        let mut segments: Vec<&str> = parent.split('/').filter(|s| !s.is_empty()).collect();
        for segment in path.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    segments.pop()?;
                }
                other => segments.push(other),
            }
        }
        ScriptId::new(format!("/{}", segments.join("/"))).ok()
    }
}

impl ModuleResolver for LoaderModuleResolver {
    fn resolve(
        &self,
        engine: &Engine,
        source: Option<&str>,
        path: &str,
        pos: Position,
    ) -> Result<Shared<Module>, Box<EvalAltResult>> {
        let Some(id) = Self::module_id(source, path) else {
            return Err(Box::new(EvalAltResult::ErrorModuleNotFound(
                path.to_string(),
                pos,
            )));
        };

        if let Some(module) = self.cache.borrow().get(&id) {
            return Ok(Shared::clone(module));
        }

        let in_module = |message: String| {
            Box::new(EvalAltResult::ErrorInModule(
                path.to_string(),
                Box::new(EvalAltResult::ErrorRuntime(message.into(), pos)),
                pos,
            ))
        };

        let source_text = {
            let staged = self
                .loader
                .resolve(&id)
                .map_err(|e| in_module(e.to_string()))?;
            staged.read_source().map_err(|e| in_module(e.to_string()))?
        };

        let mut ast = engine
            .compile(&source_text)
            .map_err(|e| in_module(e.to_string()))?;
        ast.set_source(id.as_str());

        // Nested imports resolve through this resolver again; no cache borrow is held here
        let module = Module::eval_ast_as_new(Scope::new(), &ast, engine)
            .map_err(|e| Box::new(EvalAltResult::ErrorInModule(path.to_string(), e, pos)))?;

        let module: Shared<Module> = module.into();
        self.cache
            .borrow_mut()
            .insert(id.clone(), Shared::clone(&module));

        tracing::debug!(target: "scripting", "Cached module {}", id);
        Ok(module)
    }
}
