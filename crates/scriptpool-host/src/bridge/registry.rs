//! Per-evaluation wrapper registry
//!
//! Every host object a script can see during one evaluation is registered
//! here under a key. Objects returned from host members become children of
//! the wrapper that produced them, so releasing a wrapper releases everything
//! it handed out. The registry is bounded; going over the bound fails the
//! call that would have added the extra entry.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use super::catalog;
use super::table::{ADAPT_MEMBER, SELF_MEMBER};
use super::value::{HostValue, Value, WrapperKey};
use super::BridgeError;

/// Default bound on wrappers per evaluation
pub const DEFAULT_MAX_SCRIPT_OBJECTS: usize = 1000;

struct Wrapper {
    name: Option<String>,
    value: HostValue,
    children: Vec<WrapperKey>,
}

pub struct WrapperRegistry {
    wrappers: HashMap<WrapperKey, Wrapper>,
    next_key: WrapperKey,
    max_entries: usize,
    on_release: Option<Box<dyn FnMut(WrapperKey)>>,
}

impl WrapperRegistry {
    pub fn new(max_entries: usize) -> Self {
        Self {
            wrappers: HashMap::new(),
            next_key: 1,
            max_entries,
            on_release: None,
        }
    }

    /// Observe every release
    pub fn set_release_hook(&mut self, hook: impl FnMut(WrapperKey) + 'static) {
        self.on_release = Some(Box::new(hook));
    }

    pub fn len(&self) -> usize {
        self.wrappers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wrappers.is_empty()
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Register a top-level object, optionally under a script-visible name
    pub fn wrap(&mut self, value: HostValue, name: Option<&str>) -> Result<WrapperKey, BridgeError> {
        self.insert(value, name.map(str::to_string), None)
    }

    pub fn get(&self, key: WrapperKey) -> Option<&HostValue> {
        self.wrappers.get(&key).map(|wrapper| &wrapper.value)
    }

    pub fn name(&self, key: WrapperKey) -> Option<&str> {
        self.wrappers.get(&key).and_then(|w| w.name.as_deref())
    }

    pub fn children(&self, key: WrapperKey) -> &[WrapperKey] {
        self.wrappers
            .get(&key)
            .map(|w| w.children.as_slice())
            .unwrap_or(&[])
    }

    /// Call `member` on the object registered under `key`
    ///
    /// Handles among `args` are resolved to their host objects first. Host
    /// objects in the result are registered as children of `key` and come
    /// back as handles.
    pub fn invoke(
        &mut self,
        key: WrapperKey,
        member: &str,
        args: Vec<Value>,
    ) -> Result<Value, BridgeError> {
        let value = self
            .get(key)
            .cloned()
            .ok_or(BridgeError::UnknownObject(key))?;

        if member == SELF_MEMBER && args.is_empty() {
            return Ok(Value::Int(key as i64));
        }

        let args = args
            .into_iter()
            .map(|arg| self.resolve_handles(arg))
            .collect::<Result<Vec<_>, _>>()?;

        let table = value.table();

        if member == ADAPT_MEMBER && table.is_adaptable() && args.len() == 1 {
            let result = self.adapt(&value, &args[0]);
            return self.marshal(key, result);
        }

        let overload =
            table
                .resolve(member, &args)
                .ok_or_else(|| BridgeError::NoMatchingOverload {
                    type_name: table.type_name().to_string(),
                    member: member.to_string(),
                    arity: args.len(),
                })?;

        let result = overload
            .call(value.as_any(), &args)
            .map_err(|message| BridgeError::HostCall {
                type_name: table.type_name().to_string(),
                member: member.to_string(),
                message,
            })?;

        self.marshal(key, result)
    }

    /// Release `key` and, before it, every child it handed out. Releasing an
    /// unknown or already released key does nothing. Returns how many
    /// wrappers were released.
    pub fn release(&mut self, key: WrapperKey) -> usize {
        let Some(wrapper) = self.wrappers.remove(&key) else {
            return 0;
        };

        let mut released = 0;
        for child in wrapper.children {
            released += self.release(child);
        }

        if let Some(hook) = self.on_release.as_mut() {
            hook(key);
        }
        released + 1
    }

    /// Release everything still registered
    pub fn release_all(&mut self) -> usize {
        let mut keys: Vec<_> = self.wrappers.keys().copied().collect();
        keys.sort_unstable();

        keys.into_iter().map(|key| self.release(key)).sum()
    }

    fn insert(
        &mut self,
        value: HostValue,
        name: Option<String>,
        parent: Option<WrapperKey>,
    ) -> Result<WrapperKey, BridgeError> {
        if self.wrappers.len() >= self.max_entries {
            return Err(BridgeError::TooManyScriptObjects {
                limit: self.max_entries,
            });
        }

        let key = self.next_key;
        self.next_key += 1;
        self.wrappers.insert(
            key,
            Wrapper {
                name,
                value,
                children: Vec::new(),
            },
        );

        if let Some(parent) = parent.and_then(|parent| self.wrappers.get_mut(&parent)) {
            parent.children.push(key);
        }
        Ok(key)
    }

    fn resolve_handles(&self, value: Value) -> Result<Value, BridgeError> {
        match value {
            Value::Handle(key) => self
                .get(key)
                .cloned()
                .map(Value::Object)
                .ok_or(BridgeError::UnknownObject(key)),
            Value::List(items) => Ok(Value::List(
                items
                    .into_iter()
                    .map(|item| self.resolve_handles(item))
                    .collect::<Result<_, _>>()?,
            )),
            Value::Map(map) => Ok(Value::Map(
                map.into_iter()
                    .map(|(k, v)| Ok((k, self.resolve_handles(v)?)))
                    .collect::<Result<BTreeMap<_, _>, BridgeError>>()?,
            )),
            other => Ok(other),
        }
    }

    /// Wrap host objects inside `value` as children of `parent`
    fn marshal(&mut self, parent: WrapperKey, value: Value) -> Result<Value, BridgeError> {
        match value {
            Value::Object(object) => Ok(Value::Handle(self.insert(object, None, Some(parent))?)),
            Value::List(items) => Ok(Value::List(
                items
                    .into_iter()
                    .map(|item| self.marshal(parent, item))
                    .collect::<Result<_, _>>()?,
            )),
            Value::Map(map) => {
                let mut marshaled = BTreeMap::new();
                for (k, v) in map {
                    marshaled.insert(k, self.marshal(parent, v)?);
                }
                Ok(Value::Map(marshaled))
            }
            other => Ok(other),
        }
    }

    fn adapt(&self, value: &HostValue, target: &Value) -> Value {
        let Some(type_name) = target.as_str() else {
            tracing::error!(
                target: "scripting",
                "{}.{} expects a type name, got {}",
                value.type_name(),
                ADAPT_MEMBER,
                target.kind()
            );
            return Value::Null;
        };

        let Some(target) = catalog::global().lookup(type_name) else {
            tracing::error!(
                target: "scripting",
                "Unable to load type {} for {}.{}",
                type_name,
                value.type_name(),
                ADAPT_MEMBER
            );
            return Value::Null;
        };

        value
            .table()
            .adapt(value.as_any(), &target)
            .unwrap_or(Value::Null)
    }
}

impl Default for WrapperRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SCRIPT_OBJECTS)
    }
}

impl fmt::Debug for WrapperRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WrapperRegistry")
            .field("len", &self.wrappers.len())
            .field("max_entries", &self.max_entries)
            .finish_non_exhaustive()
    }
}
