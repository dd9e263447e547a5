use std::any::{Any, TypeId};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use super::catalog;
use super::table::{HostObject, MemberTable};

/// Key of a wrapper inside one evaluation's registry
pub type WrapperKey = u64;

/// Engine-agnostic value crossing the bridge
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    /// A host object not yet known to the script
    Object(HostValue),
    /// A host object already registered in the current evaluation
    Handle(WrapperKey),
}

impl Value {
    pub fn object<T: HostObject>(object: T) -> Self {
        Value::Object(HostValue::new(object))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Integers widen to floats
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&HostValue> {
        match self {
            Value::Object(object) => Some(object),
            _ => None,
        }
    }

    /// Borrow the host object behind this value if it is a `T`
    pub fn downcast_ref<T: HostObject>(&self) -> Option<&T> {
        self.as_object().and_then(HostValue::downcast_ref)
    }

    /// Short name of the value's shape, used in diagnostics
    pub fn kind(&self) -> &str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Object(object) => object.type_name(),
            Value::Handle(_) => "handle",
        }
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Null
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<usize> for Value {
    fn from(i: usize) -> Self {
        Value::Int(i as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

impl From<HostValue> for Value {
    fn from(object: HostValue) -> Self {
        Value::Object(object)
    }
}

/// A host object paired with the member table of its type
///
/// Cheap to clone. Not `Send`: host values live on the worker thread that
/// created them.
#[derive(Clone)]
pub struct HostValue {
    object: Rc<dyn Any>,
    table: Arc<MemberTable>,
}

impl HostValue {
    pub fn new<T: HostObject>(object: T) -> Self {
        Self {
            object: Rc::new(object),
            table: catalog::global().table_for::<T>(),
        }
    }

    pub fn table(&self) -> &Arc<MemberTable> {
        &self.table
    }

    pub fn type_name(&self) -> &str {
        self.table.type_name()
    }

    pub fn type_id(&self) -> TypeId {
        self.table.type_id()
    }

    pub fn downcast_ref<T: HostObject>(&self) -> Option<&T> {
        self.object.downcast_ref::<T>()
    }

    pub(crate) fn as_any(&self) -> &dyn Any {
        self.object.as_ref()
    }

    /// Whether both values point at the same host object
    pub fn same_object(&self, other: &HostValue) -> bool {
        Rc::ptr_eq(&self.object, &other.object)
    }
}

impl fmt::Debug for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostValue")
            .field("type", &self.type_name())
            .finish_non_exhaustive()
    }
}
