//! Host values exchanged through the registry.
//!
//! Containers and handles have reference identity: cloning a [`Value::Array`] clones the
//! handle, not the elements, and equality on them is identity, the way `===` behaves.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use super::callable::{Function, Iter};
use super::promise::Promise;
use super::refs::RefToken;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An error as it travels between peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorValue {
    pub name: String,
    pub message: String,
}

impl ErrorValue {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Plain `Error` with the given message.
    pub fn error(message: impl Into<String>) -> Self {
        Self::new("Error", message)
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }
}

impl fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}: {}", self.name, self.message)
        }
    }
}

impl std::error::Error for ErrorValue {}

/// Shared, mutable, ordered list.
#[derive(Clone, Default)]
pub struct Array(Arc<Mutex<Vec<Value>>>);

impl Array {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_vec(items: Vec<Value>) -> Self {
        Self(Arc::new(Mutex::new(items)))
    }

    pub fn len(&self) -> usize {
        lock(&self.0).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.0).is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        lock(&self.0).get(index).cloned()
    }

    pub fn push(&self, value: Value) {
        lock(&self.0).push(value);
    }

    /// Writes `value` at `index`, padding with `undefined` when the array is shorter.
    pub fn set(&self, index: usize, value: Value) {
        let mut items = lock(&self.0);
        if items.len() <= index {
            items.resize(index + 1, Value::Undefined);
        }
        items[index] = value;
    }

    /// Snapshot of the current elements.
    pub fn to_vec(&self) -> Vec<Value> {
        lock(&self.0).clone()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

/// Shared, mutable map that keeps insertion order.
#[derive(Clone, Default)]
pub struct Object(Arc<Mutex<Vec<(String, Value)>>>);

impl Object {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value)>) -> Self {
        let object = Self::new();
        for (key, value) in entries {
            object.insert(key, value);
        }
        object
    }

    pub fn len(&self) -> usize {
        lock(&self.0).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.0).is_empty()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        lock(&self.0)
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    /// Inserts or replaces in place, keeping the original key position.
    pub fn insert(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        let mut entries = lock(&self.0);
        match entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => entries.push((key, value)),
        }
    }

    pub fn keys(&self) -> Vec<String> {
        lock(&self.0).iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn entries(&self) -> Vec<(String, Value)> {
        lock(&self.0).clone()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

/// Opaque byte buffer.
#[derive(Clone)]
pub struct Bytes(Arc<[u8]>);

impl Bytes {
    pub fn new(data: impl Into<Arc<[u8]>>) -> Self {
        Self(data.into())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    /// Milliseconds since the epoch; `None` is an invalid date.
    Date(Option<i64>),
    Bytes(Bytes),
    Error(ErrorValue),
    Array(Array),
    Object(Object),
    Promise(Promise),
    Function(Function),
    Iter(Iter),
    Ref(RefToken),
}

impl Value {
    /// Address used for identity tracking, for values that have one.
    pub(crate) fn identity(&self) -> Option<usize> {
        match self {
            Value::Bytes(b) => Some(b.identity()),
            Value::Array(a) => Some(a.identity()),
            Value::Object(o) => Some(o.identity()),
            Value::Promise(p) => Some(p.identity()),
            Value::Function(f) => Some(f.identity()),
            Value::Iter(i) => Some(i.identity()),
            Value::Ref(r) => Some(r.identity()),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Date(_) => "date",
            Value::Bytes(_) => "bytes",
            Value::Error(_) => "error",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Promise(_) => "promise",
            Value::Function(_) => "function",
            Value::Iter(_) => "iterator",
            Value::Ref(_) => "ref",
        }
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Undefined | Value::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Array> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_promise(&self) -> Option<&Promise> {
        match self {
            Value::Promise(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&Function> {
        match self {
            Value::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_iter(&self) -> Option<&Iter> {
        match self {
            Value::Iter(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_ref_token(&self) -> Option<&RefToken> {
        match self {
            Value::Ref(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<&ErrorValue> {
        match self {
            Value::Error(e) => Some(e),
            _ => None,
        }
    }

    /// Object member or array index lookup. Anything else yields `None`.
    pub fn member(&self, key: &str) -> Option<Value> {
        match self {
            Value::Object(o) => o.get(key),
            Value::Array(a) => key.parse().ok().and_then(|i| a.get(i)),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::Error(a), Value::Error(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a.ptr_eq(b),
            (Value::Array(a), Value::Array(b)) => a.ptr_eq(b),
            (Value::Object(a), Value::Object(b)) => a.ptr_eq(b),
            (Value::Promise(a), Value::Promise(b)) => a.ptr_eq(b),
            (Value::Function(a), Value::Function(b)) => a.ptr_eq(b),
            (Value::Iter(a), Value::Iter(b)) => a.ptr_eq(b),
            (Value::Ref(a), Value::Ref(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

const DEBUG_DEPTH: usize = 4;

struct Shallow<'a>(&'a Value, usize);

impl fmt::Debug for Shallow<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Shallow(value, depth) = *self;
        match value {
            Value::Undefined => f.write_str("undefined"),
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Date(Some(ms)) => write!(f, "Date({ms})"),
            Value::Date(None) => f.write_str("Date(invalid)"),
            Value::Bytes(b) => write!(f, "Bytes(len={})", b.as_slice().len()),
            Value::Error(e) => write!(f, "Error({e})"),
            Value::Array(_) | Value::Object(_) if depth == 0 => f.write_str("[..]"),
            Value::Array(a) => f
                .debug_list()
                .entries(a.to_vec().iter().map(|v| Shallow(v, depth - 1)))
                .finish(),
            Value::Object(o) => {
                let entries = o.entries();
                let mut map = f.debug_map();
                for (k, v) in &entries {
                    map.entry(k, &Shallow(v, depth - 1));
                }
                map.finish()
            }
            Value::Promise(p) => write!(f, "Promise({:?})", p.status()),
            Value::Function(func) => write!(f, "Function({})", func.name()),
            Value::Iter(_) => f.write_str("Iter"),
            Value::Ref(r) => write!(f, "Ref({})", r.id()),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Shallow(self, DEBUG_DEPTH).fmt(f)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => f.write_str(s),
            Value::Error(e) => e.fmt(f),
            other => fmt::Debug::fmt(other, f),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(Array::from_vec(items))
    }
}

impl From<Array> for Value {
    fn from(array: Array) -> Self {
        Value::Array(array)
    }
}

impl From<Object> for Value {
    fn from(object: Object) -> Self {
        Value::Object(object)
    }
}

impl From<ErrorValue> for Value {
    fn from(error: ErrorValue) -> Self {
        Value::Error(error)
    }
}

impl From<Promise> for Value {
    fn from(promise: Promise) -> Self {
        Value::Promise(promise)
    }
}

impl From<Function> for Value {
    fn from(function: Function) -> Self {
        Value::Function(function)
    }
}

impl From<Iter> for Value {
    fn from(iter: Iter) -> Self {
        Value::Iter(iter)
    }
}

impl From<RefToken> for Value {
    fn from(token: RefToken) -> Self {
        Value::Ref(token)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

/// Fresh containers for every array and object in the document.
impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        super::mapping::from_plain(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn containers_compare_by_identity() {
        let a = Array::from_vec(vec![1.into()]);
        let b = Array::from_vec(vec![1.into()]);
        assert_eq!(Value::Array(a.clone()), Value::Array(a.clone()));
        assert_ne!(Value::Array(a), Value::Array(b));
        assert_eq!(Value::from("x"), Value::from("x"));
        assert_ne!(Value::Number(f64::NAN), Value::Number(f64::NAN));
    }

    #[test]
    fn object_insert_keeps_position() {
        let o = Object::from_entries([("a", Value::from(1)), ("b", Value::from(2))]);
        o.insert("a", Value::from(3));
        assert_eq!(o.keys(), vec!["a", "b"]);
        assert_eq!(o.get("a"), Some(Value::from(3)));
    }

    #[test]
    fn array_set_pads_with_undefined() {
        let a = Array::new();
        a.set(2, Value::Null);
        assert_eq!(a.to_vec(), vec![Value::Undefined, Value::Undefined, Value::Null]);
    }

    #[test]
    fn debug_stops_on_cycles() {
        let a = Array::new();
        a.push(Value::Array(a.clone()));
        let text = format!("{:?}", Value::Array(a));
        assert!(text.contains("[..]"));
    }

    #[test]
    fn member_reads_objects_and_arrays() {
        let v = Value::from(vec![Value::from("zero"), Value::from("one")]);
        assert_eq!(v.member("1"), Some(Value::from("one")));
        assert_eq!(v.member("x"), None);
        assert_eq!(Value::Null.member("a"), None);
    }
}
