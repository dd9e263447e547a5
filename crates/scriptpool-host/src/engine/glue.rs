//! Rhai side of the object bridge
//!
//! Scripts see host objects as `ScriptObject` handles. Every member name known
//! to the type catalog is registered as a Rhai function taking a handle plus
//! up to [`MAX_ARITY`] arguments. Names a script calls are registered the same
//! way before it runs, so handles of types first seen mid-run still answer;
//! `invoke(object, name, ...)` reaches anything else.
//!
//! Objects bound for an evaluation are served through the engine's variable
//! resolver, so script functions see them as well as the top level.

use rhai::{Dynamic, Engine, EvalAltResult, ImmutableString, Position};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use scriptpool_types::ScriptError;

use crate::bridge::{Value, WrapperKey, WrapperRegistry};

/// Most arguments a script can pass to one host member
pub const MAX_ARITY: usize = 6;

/// Script-visible handle of a registered host object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptObject {
    key: WrapperKey,
}

impl ScriptObject {
    pub fn new(key: WrapperKey) -> Self {
        Self { key }
    }

    pub fn key(&self) -> WrapperKey {
        self.key
    }
}

/// Registry of the running evaluation plus the last bridge failure
#[derive(Default)]
pub(crate) struct BridgeState {
    registry: RefCell<Option<WrapperRegistry>>,
    globals: RefCell<HashMap<String, WrapperKey>>,
    fault: RefCell<Option<(String, ScriptError)>>,
}

impl BridgeState {
    /// Start an evaluation; `globals` maps script-visible names to keys in `registry`
    pub(crate) fn begin(&self, registry: WrapperRegistry, globals: HashMap<String, WrapperKey>) {
        *self.registry.borrow_mut() = Some(registry);
        *self.globals.borrow_mut() = globals;
        self.fault.borrow_mut().take();
    }

    pub(crate) fn finish(&self) -> Option<WrapperRegistry> {
        self.globals.borrow_mut().clear();
        self.registry.borrow_mut().take()
    }

    fn global(&self, name: &str) -> Option<ScriptObject> {
        self.globals.borrow().get(name).copied().map(ScriptObject::new)
    }

    /// The bridge failure behind `err`, if `err` is that failure propagating
    ///
    /// A failure the script caught and replaced with its own error is dropped.
    pub(crate) fn take_fault(&self, err: &EvalAltResult) -> Option<ScriptError> {
        let (message, fault) = self.fault.borrow_mut().take()?;
        match innermost(err) {
            EvalAltResult::ErrorRuntime(value, _) if value.to_string() == message => Some(fault),
            _ => None,
        }
    }

    fn call(
        &self,
        key: WrapperKey,
        member: &str,
        args: Vec<Dynamic>,
    ) -> Result<Dynamic, Box<EvalAltResult>> {
        let args = args.into_iter().map(to_value).collect();

        let result = {
            let mut registry = self.registry.borrow_mut();
            let Some(registry) = registry.as_mut() else {
                return Err(runtime_error(format!(
                    "{member}: host objects are only usable during an evaluation"
                )));
            };
            registry.invoke(key, member, args)
        };

        match result {
            Ok(value) => Ok(to_dynamic(value)),
            Err(err) => {
                let message = err.to_string();
                *self.fault.borrow_mut() = Some((message.clone(), err.into()));
                Err(runtime_error(message))
            }
        }
    }
}

/// The error a chain of function-call and module frames wraps
fn innermost(err: &EvalAltResult) -> &EvalAltResult {
    match err {
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _)
        | EvalAltResult::ErrorInModule(_, inner, _) => innermost(inner),
        other => other,
    }
}

fn runtime_error(message: String) -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorRuntime(message.into(), Position::NONE))
}

pub fn to_value(value: Dynamic) -> Value {
    if value.is_unit() {
        return Value::Null;
    }
    if value.is::<ScriptObject>() {
        return Value::Handle(value.cast::<ScriptObject>().key);
    }
    if let Ok(b) = value.as_bool() {
        return Value::Bool(b);
    }
    if let Ok(i) = value.as_int() {
        return Value::Int(i);
    }
    if let Ok(f) = value.as_float() {
        return Value::Float(f);
    }
    if let Ok(c) = value.as_char() {
        return Value::Str(c.to_string());
    }
    if value.is_string() {
        return value
            .into_string()
            .map(Value::Str)
            .unwrap_or(Value::Null);
    }
    if value.is_array() {
        return value
            .into_array()
            .map(|items| Value::List(items.into_iter().map(to_value).collect()))
            .unwrap_or(Value::Null);
    }
    if value.is_map() {
        let map = value.cast::<rhai::Map>();
        return Value::Map(
            map.into_iter()
                .map(|(k, v)| (k.to_string(), to_value(v)))
                .collect(),
        );
    }
    Value::Str(value.to_string())
}

pub fn to_dynamic(value: Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => b.into(),
        Value::Int(i) => i.into(),
        Value::Float(f) => f.into(),
        Value::Str(s) => s.into(),
        Value::List(items) => Dynamic::from_array(items.into_iter().map(to_dynamic).collect()),
        Value::Map(map) => Dynamic::from_map(
            map.into_iter()
                .map(|(k, v)| (k.into(), to_dynamic(v)))
                .collect(),
        ),
        Value::Handle(key) => Dynamic::from(ScriptObject { key }),
        // The registry turns objects into handles before they reach a script
        Value::Object(object) => {
            tracing::warn!(
                target: "scripting",
                "Unregistered {} dropped at the script boundary",
                object.type_name()
            );
            Dynamic::UNIT
        }
    }
}

macro_rules! register_dispatch {
    ($engine:expr, $state:expr, $member:expr; $($arg:ident),*) => {{
        let state = Rc::clone($state);
        let name: String = $member.to_string();
        $engine.register_fn(
            $member,
            move |object: ScriptObject $(, $arg: Dynamic)*| -> Result<Dynamic, Box<EvalAltResult>> {
                state.call(object.key, &name, vec![$($arg),*])
            },
        );
    }};
}

macro_rules! register_invoke {
    ($engine:expr, $state:expr; $($arg:ident),*) => {{
        let state = Rc::clone($state);
        $engine.register_fn(
            "invoke",
            move |object: ScriptObject, member: ImmutableString $(, $arg: Dynamic)*| -> Result<Dynamic, Box<EvalAltResult>> {
                state.call(object.key, member.as_str(), vec![$($arg),*])
            },
        );
    }};
}

/// Register the handle type and the generic `invoke` entry point
pub(crate) fn register_object_type(engine: &mut Engine, state: &Rc<BridgeState>) {
    engine
        .register_type_with_name::<ScriptObject>("ScriptObject")
        .register_fn("to_string", |object: ScriptObject| {
            format!("ScriptObject#{}", object.key)
        })
        .register_fn("to_debug", |object: ScriptObject| {
            format!("ScriptObject#{}", object.key)
        })
        .register_fn("==", |a: ScriptObject, b: ScriptObject| a == b)
        .register_fn("!=", |a: ScriptObject, b: ScriptObject| a != b);

    register_invoke!(engine, state;);
    register_invoke!(engine, state; a);
    register_invoke!(engine, state; a, b);
    register_invoke!(engine, state; a, b, c);
    register_invoke!(engine, state; a, b, c, d);
    register_invoke!(engine, state; a, b, c, d, e);
    register_invoke!(engine, state; a, b, c, d, e, f);
}

/// Serve the evaluation's bound objects as variables
///
/// Variables the script declares itself shadow the bound names.
pub(crate) fn register_globals(engine: &mut Engine, state: &Rc<BridgeState>) {
    let state = Rc::clone(state);
    engine.on_var(move |name, _index, context| {
        if context.scope().contains(name) {
            return Ok(None);
        }
        Ok(state.global(name).map(Dynamic::from))
    });
}

/// Register `member` as a method on handles for every supported arity
pub(crate) fn register_member(engine: &mut Engine, state: &Rc<BridgeState>, member: &str) {
    register_dispatch!(engine, state, member;);
    register_dispatch!(engine, state, member; a);
    register_dispatch!(engine, state, member; a, b);
    register_dispatch!(engine, state, member; a, b, c);
    register_dispatch!(engine, state, member; a, b, c, d);
    register_dispatch!(engine, state, member; a, b, c, d, e);
    register_dispatch!(engine, state, member; a, b, c, d, e, f);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitives_round_trip() {
        for value in [
            Value::Null,
            Value::Bool(true),
            Value::Int(42),
            Value::Float(1.5),
            Value::Str("hi".into()),
        ] {
            let back = to_value(to_dynamic(value.clone()));
            assert_eq!(format!("{back:?}"), format!("{value:?}"));
        }
    }

    #[test]
    fn test_nested_values_and_handles() {
        let mut map = std::collections::BTreeMap::new();
        map.insert(
            "items".to_string(),
            Value::List(vec![Value::Int(1), Value::Handle(7)]),
        );

        let back = to_value(to_dynamic(Value::Map(map)));
        let items = back.as_map().unwrap()["items"].as_list().unwrap().to_vec();
        assert_eq!(items[0].as_int(), Some(1));
        assert!(matches!(items[1], Value::Handle(7)));
    }

    #[test]
    fn test_globals_cleared_on_finish() {
        let state = BridgeState::default();
        let mut globals = HashMap::new();
        globals.insert("page".to_string(), 3);

        state.begin(WrapperRegistry::default(), globals);
        assert_eq!(state.global("page"), Some(ScriptObject::new(3)));
        assert!(state.global("other").is_none());

        assert!(state.finish().is_some());
        assert!(state.global("page").is_none());
        assert!(state.finish().is_none());
    }

    #[test]
    fn test_fault_only_reported_for_its_own_error() {
        let state = BridgeState::default();
        let fault = || ScriptError::PoolClosed;

        *state.fault.borrow_mut() = Some(("boom".to_string(), fault()));
        let wrapped = EvalAltResult::ErrorInFunctionCall(
            "render".into(),
            String::new(),
            runtime_error("boom".to_string()),
            Position::NONE,
        );
        assert!(matches!(state.take_fault(&wrapped), Some(ScriptError::PoolClosed)));
        assert!(state.take_fault(&wrapped).is_none());

        *state.fault.borrow_mut() = Some(("boom".to_string(), fault()));
        let own = runtime_error("script gave up".to_string());
        assert!(state.take_fault(&own).is_none());
        assert!(state.fault.borrow().is_none());
    }

    #[test]
    fn test_char_becomes_string() {
        assert_eq!(to_value(Dynamic::from('x')).as_str(), Some("x"));
    }
}
