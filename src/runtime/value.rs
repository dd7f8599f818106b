//! Host-side values.
//!
//! These model the values living inside the host scripting engine. Objects are
//! reference types: cloning a [`HostObject`] clones the reference, and two
//! objects are the same object only if they share an allocation.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value as Json;

use super::r#async::promise::HostPromise;

/// A host function: `(this, args) -> result`, `Err` carries the thrown value.
pub type HostFunction =
    Arc<dyn Fn(&HostValue, &[HostValue]) -> Result<HostValue, HostValue> + Send + Sync>;

/// A host constructor invoked by `new`.
pub type HostConstructor = Arc<dyn Fn(&[HostValue]) -> Result<HostValue, HostValue> + Send + Sync>;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What an object is beyond its property bag.
pub enum ObjectKind {
    Plain,
    Function(HostFunction),
    Constructor(HostConstructor),
    Promise(HostPromise),
}

struct ObjectInner {
    class: Option<Arc<str>>,
    kind: ObjectKind,
    properties: Mutex<HashMap<String, HostValue>>,
}

/// A reference to a host object.
#[derive(Clone)]
pub struct HostObject(Arc<ObjectInner>);

impl Default for HostObject {
    fn default() -> Self {
        Self::new()
    }
}

impl HostObject {
    fn build(class: Option<&str>, kind: ObjectKind) -> Self {
        Self(Arc::new(ObjectInner {
            class: class.map(Arc::from),
            kind,
            properties: Mutex::new(HashMap::new()),
        }))
    }

    /// An empty plain object.
    pub fn new() -> Self {
        Self::build(None, ObjectKind::Plain)
    }

    /// An empty plain object tagged with a class name.
    pub fn with_class(class: &str) -> Self {
        Self::build(Some(class), ObjectKind::Plain)
    }

    pub fn function<F>(f: F) -> Self
    where
        F: Fn(&HostValue, &[HostValue]) -> Result<HostValue, HostValue> + Send + Sync + 'static,
    {
        Self::build(Some("Function"), ObjectKind::Function(Arc::new(f)))
    }

    pub fn constructor<F>(class: &str, f: F) -> Self
    where
        F: Fn(&[HostValue]) -> Result<HostValue, HostValue> + Send + Sync + 'static,
    {
        Self::build(Some(class), ObjectKind::Constructor(Arc::new(f)))
    }

    pub(crate) fn from_promise(promise: HostPromise) -> Self {
        Self::build(Some("Promise"), ObjectKind::Promise(promise))
    }

    pub fn class(&self) -> Option<&str> {
        self.0.class.as_deref()
    }

    pub fn kind(&self) -> &ObjectKind {
        &self.0.kind
    }

    pub fn as_promise(&self) -> Option<&HostPromise> {
        match &self.0.kind {
            ObjectKind::Promise(p) => Some(p),
            _ => None,
        }
    }

    pub fn is_callable(&self) -> bool {
        matches!(self.0.kind, ObjectKind::Function(_))
    }

    /// Read a property; missing properties read as `undefined`.
    pub fn get(&self, key: &str) -> HostValue {
        lock(&self.0.properties)
            .get(key)
            .cloned()
            .unwrap_or(HostValue::Undefined)
    }

    pub fn set(&self, key: &str, value: impl Into<HostValue>) {
        lock(&self.0.properties).insert(key.to_string(), value.into());
    }

    pub fn has(&self, key: &str) -> bool {
        lock(&self.0.properties).contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = lock(&self.0.properties).keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Call this object as a function.
    pub fn call(&self, this: &HostValue, args: &[HostValue]) -> Result<HostValue, HostValue> {
        match &self.0.kind {
            ObjectKind::Function(f) => f(this, args),
            _ => Err(HostValue::type_error(&format!(
                "{} is not a function",
                self.describe()
            ))),
        }
    }

    /// Invoke this object with `new`.
    pub fn construct(&self, args: &[HostValue]) -> Result<HostValue, HostValue> {
        match &self.0.kind {
            ObjectKind::Constructor(f) => f(args),
            _ => Err(HostValue::type_error(&format!(
                "{} is not a constructor",
                self.describe()
            ))),
        }
    }

    /// Address of the allocation; stable for as long as any clone is alive.
    pub fn identity(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    pub fn ptr_eq(&self, other: &HostObject) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    fn describe(&self) -> String {
        match self.class() {
            Some(class) => format!("[object {}]", class),
            None => "[object Object]".to_string(),
        }
    }
}

impl fmt::Debug for HostObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostObject({} @ {:#x})", self.describe(), self.identity())
    }
}

/// A value inside the host.
#[derive(Clone, Debug, Default)]
pub enum HostValue {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(Arc<str>),
    Object(HostObject),
}

/// Key under which the object space deduplicates a value.
///
/// Objects are keyed by allocation address, never by contents. Primitives are
/// keyed by value, with all NaNs collapsed and `-0` folded into `+0`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum IdentityKey {
    Undefined,
    Null,
    Bool(bool),
    Number(u64),
    String(Arc<str>),
    Object(usize),
}

impl HostValue {
    pub fn string(s: &str) -> Self {
        HostValue::String(Arc::from(s))
    }

    /// An `Error` object carrying `message`.
    pub fn error(message: &str) -> Self {
        let obj = HostObject::with_class("Error");
        obj.set("message", HostValue::string(message));
        HostValue::Object(obj)
    }

    pub fn type_error(message: &str) -> Self {
        let obj = HostObject::with_class("TypeError");
        obj.set("message", HostValue::string(message));
        HostValue::Object(obj)
    }

    pub fn identity(&self) -> IdentityKey {
        match self {
            HostValue::Undefined => IdentityKey::Undefined,
            HostValue::Null => IdentityKey::Null,
            HostValue::Bool(b) => IdentityKey::Bool(*b),
            HostValue::Number(n) => {
                let canonical = if n.is_nan() {
                    f64::NAN
                } else if *n == 0.0 {
                    0.0
                } else {
                    *n
                };
                IdentityKey::Number(canonical.to_bits())
            }
            HostValue::String(s) => IdentityKey::String(s.clone()),
            HostValue::Object(o) => IdentityKey::Object(o.identity()),
        }
    }

    /// Host `typeof`.
    pub fn type_of(&self) -> &'static str {
        match self {
            HostValue::Undefined => "undefined",
            HostValue::Null => "object",
            HostValue::Bool(_) => "boolean",
            HostValue::Number(_) => "number",
            HostValue::String(_) => "string",
            HostValue::Object(o) if o.is_callable() => "function",
            HostValue::Object(_) => "object",
        }
    }

    pub fn as_object(&self) -> Option<&HostObject> {
        match self {
            HostValue::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HostValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            HostValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HostValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Host truthiness.
    pub fn is_truthy(&self) -> bool {
        match self {
            HostValue::Undefined | HostValue::Null => false,
            HostValue::Bool(b) => *b,
            HostValue::Number(n) => !(*n == 0.0 || n.is_nan()),
            HostValue::String(s) => !s.is_empty(),
            HostValue::Object(_) => true,
        }
    }

    /// Strict equality: objects by identity, `NaN` unequal to itself.
    pub fn strict_eq(&self, other: &HostValue) -> bool {
        match (self, other) {
            (HostValue::Undefined, HostValue::Undefined) => true,
            (HostValue::Null, HostValue::Null) => true,
            (HostValue::Bool(a), HostValue::Bool(b)) => a == b,
            (HostValue::Number(a), HostValue::Number(b)) => a == b,
            (HostValue::String(a), HostValue::String(b)) => a == b,
            (HostValue::Object(a), HostValue::Object(b)) => a.ptr_eq(b),
            _ => false,
        }
    }

    /// Build a host value from JSON. Arrays become objects with index keys
    /// and a `length`.
    pub fn from_json(json: &Json) -> Self {
        match json {
            Json::Null => HostValue::Null,
            Json::Bool(b) => HostValue::Bool(*b),
            Json::Number(n) => HostValue::Number(n.as_f64().unwrap_or(f64::NAN)),
            Json::String(s) => HostValue::string(s),
            Json::Array(items) => {
                let obj = HostObject::with_class("Array");
                for (i, item) in items.iter().enumerate() {
                    obj.set(&i.to_string(), HostValue::from_json(item));
                }
                obj.set("length", HostValue::Number(items.len() as f64));
                HostValue::Object(obj)
            }
            Json::Object(map) => {
                let obj = HostObject::new();
                for (key, value) in map {
                    obj.set(key, HostValue::from_json(value));
                }
                HostValue::Object(obj)
            }
        }
    }

    /// Snapshot as JSON. Functions and `undefined` become `null`, non-finite
    /// numbers too.
    pub fn to_json(&self) -> Json {
        match self {
            HostValue::Undefined | HostValue::Null => Json::Null,
            HostValue::Bool(b) => Json::Bool(*b),
            HostValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            HostValue::String(s) => Json::String(s.to_string()),
            HostValue::Object(o) if o.is_callable() => Json::Null,
            HostValue::Object(o) => {
                let mut map = serde_json::Map::new();
                for key in o.keys() {
                    map.insert(key.clone(), o.get(&key).to_json());
                }
                Json::Object(map)
            }
        }
    }
}

impl From<bool> for HostValue {
    fn from(b: bool) -> Self {
        HostValue::Bool(b)
    }
}

impl From<f64> for HostValue {
    fn from(n: f64) -> Self {
        HostValue::Number(n)
    }
}

impl From<&str> for HostValue {
    fn from(s: &str) -> Self {
        HostValue::string(s)
    }
}

impl From<String> for HostValue {
    fn from(s: String) -> Self {
        HostValue::String(Arc::from(s))
    }
}

impl From<HostObject> for HostValue {
    fn from(o: HostObject) -> Self {
        HostValue::Object(o)
    }
}

impl fmt::Display for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HostValue::Undefined => write!(f, "undefined"),
            HostValue::Null => write!(f, "null"),
            HostValue::Bool(b) => write!(f, "{}", b),
            HostValue::Number(n) => write!(f, "{}", n),
            HostValue::String(s) => write!(f, "{}", s),
            HostValue::Object(o) => match o.get("message") {
                HostValue::String(m) if o.class().is_some_and(|c| c.ends_with("Error")) => {
                    write!(f, "{}: {}", o.class().unwrap_or("Error"), m)
                }
                _ => write!(f, "{}", o.describe()),
            },
        }
    }
}
