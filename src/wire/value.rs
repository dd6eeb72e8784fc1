//! Dynamic values and closures carried across the process boundary.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{TypeTag, WireError};
use crate::work::WorkError;

/// A dynamically typed value.
///
/// This is what a job returns and what the result envelope is made of.
/// Objects keep their keys sorted so encoding is deterministic.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
    Closure(Closure),
}

impl Value {
    /// Build an object from key/value pairs.
    pub fn object<K, V, I>(fields: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        Value::Object(
            fields
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// The header type tag this value is encoded under.
    pub fn type_tag(&self) -> TypeTag {
        match self {
            Value::Null => TypeTag::Null,
            Value::Bool(_) => TypeTag::Bool,
            Value::Int(_) => TypeTag::Int,
            Value::Double(_) => TypeTag::Double,
            Value::String(_) => TypeTag::String,
            Value::Array(_) => TypeTag::Array,
            Value::Object(_) | Value::Closure(_) => TypeTag::Object,
        }
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

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric view; integers widen to floats.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(d) => Some(*d),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Object(fields) => Some(fields),
            _ => None,
        }
    }

    pub fn as_closure(&self) -> Option<&Closure> {
        match self {
            Value::Closure(c) => Some(c),
            _ => None,
        }
    }

    /// Look up a field of an object value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_object().and_then(|fields| fields.get(key))
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

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(d: f64) -> Self {
        Value::Double(d)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(fields: BTreeMap<String, Value>) -> Self {
        Value::Object(fields)
    }
}

impl From<Closure> for Value {
    fn from(c: Closure) -> Self {
        Value::Closure(c)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map_or(Value::Null, Into::into)
    }
}

/// A serializable closure: the name of a registered function plus the
/// values it captured when it was created.
///
/// Code cannot cross a process boundary, so the receiving side looks the name
/// up in its own [`ClosureRegistry`] and rebinds the captured values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Closure {
    name: String,
    captured: Vec<Value>,
}

impl Closure {
    pub fn new(name: impl Into<String>, captured: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            captured,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn captured(&self) -> &[Value] {
        &self.captured
    }
}

/// Signature of a registered closure body: `(captured, args) -> result`.
pub type ClosureFn = dyn Fn(&[Value], &[Value]) -> Result<Value, WorkError> + Send + Sync;

/// Name-to-function table used to rehydrate [`Closure`] values.
#[derive(Clone, Default)]
pub struct ClosureRegistry {
    functions: HashMap<String, Arc<ClosureFn>>,
}

impl ClosureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `body` under `name`, replacing any earlier registration.
    pub fn register<F>(&mut self, name: impl Into<String>, body: F) -> &mut Self
    where
        F: Fn(&[Value], &[Value]) -> Result<Value, WorkError> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(body));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Bind a closure value to its registered body.
    pub fn bind(&self, closure: &Closure) -> Result<BoundClosure, WireError> {
        let body = self
            .functions
            .get(closure.name())
            .ok_or_else(|| WireError::UnknownClosure(closure.name().to_string()))?;
        Ok(BoundClosure {
            body: Arc::clone(body),
            captured: closure.captured.clone(),
        })
    }
}

impl fmt::Debug for ClosureRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("ClosureRegistry")
            .field("functions", &names)
            .finish()
    }
}

/// A closure whose body has been resolved and can be called.
#[derive(Clone)]
pub struct BoundClosure {
    body: Arc<ClosureFn>,
    captured: Vec<Value>,
}

impl BoundClosure {
    pub fn call(&self, args: &[Value]) -> Result<Value, WorkError> {
        (self.body)(&self.captured, args)
    }
}

impl fmt::Debug for BoundClosure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundClosure")
            .field("captured", &self.captured)
            .finish_non_exhaustive()
    }
}
