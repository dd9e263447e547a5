//! Member tables: what a host type exposes to scripts
//!
//! Each host type lists its members once. A member name maps to an ordered
//! list of overloads; a call picks the first overload whose parameter shapes
//! accept the arguments.

use std::any::{Any, TypeId};
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use super::value::Value;

/// Name of the reserved member returning a wrapper's key
pub const SELF_MEMBER: &str = "self";

/// Name of the reserved adaptation member
pub const ADAPT_MEMBER: &str = "adapt_to";

/// A Rust type that can be handed to scripts
pub trait HostObject: Any {
    /// Name scripts and `adapt_to` use for this type
    const TYPE_NAME: &'static str;

    fn members(members: &mut Members<Self>)
    where
        Self: Sized;
}

/// Structural shape a parameter accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Any,
    Bool,
    Int,
    Float,
    /// Int or float
    Number,
    Str,
    List,
    Map,
    /// Any host object
    Object,
    /// A host object of the named type
    ObjectOf(&'static str),
}

impl ParamKind {
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (ParamKind::Any, _) => true,
            (ParamKind::Bool, Value::Bool(_)) => true,
            (ParamKind::Int, Value::Int(_)) => true,
            (ParamKind::Float, Value::Float(_)) => true,
            (ParamKind::Number, Value::Int(_) | Value::Float(_)) => true,
            // Null stands in for any reference-like parameter
            (
                ParamKind::Str
                | ParamKind::List
                | ParamKind::Map
                | ParamKind::Object
                | ParamKind::ObjectOf(_),
                Value::Null,
            ) => true,
            (ParamKind::Str, Value::Str(_)) => true,
            (ParamKind::List, Value::List(_)) => true,
            (ParamKind::Map, Value::Map(_)) => true,
            (ParamKind::Object, Value::Object(_)) => true,
            (ParamKind::ObjectOf(name), Value::Object(object)) => object.type_name() == *name,
            _ => false,
        }
    }
}

pub(crate) type Thunk = Arc<dyn Fn(&dyn Any, &[Value]) -> Result<Value, String> + Send + Sync>;
pub(crate) type AdaptThunk =
    Arc<dyn Fn(&dyn Any, &MemberTable) -> Option<Value> + Send + Sync>;

/// One callable shape of a member
#[derive(Clone)]
pub struct Overload {
    params: Vec<ParamKind>,
    returns: bool,
    thunk: Thunk,
}

impl Overload {
    pub fn params(&self) -> &[ParamKind] {
        &self.params
    }

    /// Members without a return value hand unit back to the script
    pub fn returns(&self) -> bool {
        self.returns
    }

    pub fn accepts(&self, args: &[Value]) -> bool {
        self.params.len() == args.len()
            && self
                .params
                .iter()
                .zip(args)
                .all(|(param, arg)| param.accepts(arg))
    }

    pub(crate) fn call(&self, object: &dyn Any, args: &[Value]) -> Result<Value, String> {
        let value = (self.thunk)(object, args)?;
        Ok(if self.returns { value } else { Value::Null })
    }
}

impl fmt::Debug for Overload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Overload")
            .field("params", &self.params)
            .field("returns", &self.returns)
            .finish_non_exhaustive()
    }
}

/// Every member of one host type
pub struct MemberTable {
    type_name: &'static str,
    type_id: TypeId,
    members: BTreeMap<String, Vec<Overload>>,
    adapt: Option<AdaptThunk>,
}

impl MemberTable {
    pub(crate) fn build<T: HostObject>() -> Self {
        let mut members = Members::<T> {
            members: BTreeMap::new(),
            adapt: None,
            _type: PhantomData,
        };
        T::members(&mut members);

        Self {
            type_name: T::TYPE_NAME,
            type_id: TypeId::of::<T>(),
            members: members.members,
            adapt: members.adapt,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn is_adaptable(&self) -> bool {
        self.adapt.is_some()
    }

    pub fn member_names(&self) -> impl Iterator<Item = &str> {
        self.members.keys().map(String::as_str)
    }

    pub fn overloads(&self, name: &str) -> &[Overload] {
        self.members.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// First overload of `name` accepting `args`
    pub fn resolve(&self, name: &str, args: &[Value]) -> Option<&Overload> {
        self.overloads(name)
            .iter()
            .find(|overload| overload.accepts(args))
    }

    pub(crate) fn adapt(&self, object: &dyn Any, target: &MemberTable) -> Option<Value> {
        self.adapt.as_ref().and_then(|adapt| adapt(object, target))
    }
}

impl fmt::Debug for MemberTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemberTable")
            .field("type_name", &self.type_name)
            .field("members", &self.members.keys().collect::<Vec<_>>())
            .field("adaptable", &self.is_adaptable())
            .finish()
    }
}

/// Builder passed to [`HostObject::members`]
pub struct Members<T> {
    members: BTreeMap<String, Vec<Overload>>,
    adapt: Option<AdaptThunk>,
    _type: PhantomData<fn(&T)>,
}

impl<T: HostObject> Members<T> {
    /// Member returning a value
    pub fn method<F>(&mut self, name: &str, params: &[ParamKind], f: F) -> &mut Self
    where
        F: Fn(&T, &[Value]) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.push(name, params, true, f)
    }

    /// Fire-and-forget member; scripts always get unit back
    pub fn action<F>(&mut self, name: &str, params: &[ParamKind], f: F) -> &mut Self
    where
        F: Fn(&T, &[Value]) -> Result<(), String> + Send + Sync + 'static,
    {
        self.push(name, params, false, move |this, args| {
            f(this, args).map(|()| Value::Null)
        })
    }

    /// Enable `adapt_to(type_name)`. The closure receives the resolved target
    /// type and returns `None` when this object cannot become one.
    pub fn adaptable<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&T, &MemberTable) -> Option<Value> + Send + Sync + 'static,
    {
        self.adapt = Some(Arc::new(move |object: &dyn Any, target: &MemberTable| {
            object.downcast_ref::<T>().and_then(|this| f(this, target))
        }));
        self
    }

    fn push<F>(&mut self, name: &str, params: &[ParamKind], returns: bool, f: F) -> &mut Self
    where
        F: Fn(&T, &[Value]) -> Result<Value, String> + Send + Sync + 'static,
    {
        let thunk: Thunk = Arc::new(move |object: &dyn Any, args: &[Value]| {
            let this = object
                .downcast_ref::<T>()
                .ok_or_else(|| format!("receiver is not a {}", T::TYPE_NAME))?;
            f(this, args)
        });

        self.members
            .entry(name.to_string())
            .or_default()
            .push(Overload {
                params: params.to_vec(),
                returns,
                thunk,
            });
        self
    }
}
