//! The two non-link mappings: textual JSON and structured channel passthrough.
//!
//! Both only carry plain data. Callables, promises and refs are refused, and so are
//! cycles.

use std::collections::HashSet;

use base64::Engine as _;
use chrono::{DateTime, SecondsFormat, Utc};

use super::error::RegistryError;
use super::value::{Array, ErrorValue, Object, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flavor {
    /// `JSON.stringify` rules: non-finite becomes null, undefined members vanish.
    Json,
    /// Strict: anything the channel cannot carry losslessly is an error.
    Process,
}

pub(crate) fn to_json_text(value: &Value) -> Result<String, RegistryError> {
    let plain = to_plain(value, Flavor::Json)?.unwrap_or(serde_json::Value::Null);
    Ok(serde_json::to_string(&plain)?)
}

pub(crate) fn from_json_text(text: &str) -> Result<Value, RegistryError> {
    Ok(from_plain(serde_json::from_str(text)?))
}

/// `None` means "omit" (undefined under JSON rules).
pub(crate) fn to_plain(
    value: &Value,
    flavor: Flavor,
) -> Result<Option<serde_json::Value>, RegistryError> {
    Plain {
        flavor,
        stack: HashSet::new(),
    }
    .convert(value)
}

struct Plain {
    flavor: Flavor,
    stack: HashSet<usize>,
}

impl Plain {
    fn convert(&mut self, value: &Value) -> Result<Option<serde_json::Value>, RegistryError> {
        use serde_json::Value as Json;
        Ok(Some(match value {
            Value::Undefined => match self.flavor {
                Flavor::Json => return Ok(None),
                Flavor::Process => Json::Null,
            },
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Number(n) => match serde_json::Number::from_f64(*n) {
                Some(n) => Json::Number(n),
                None if self.flavor == Flavor::Json => Json::Null,
                None => {
                    return Err(RegistryError::Serialize(format!(
                        "{n} cannot be carried by the process mapping"
                    )));
                }
            },
            Value::String(s) => Json::String(s.clone()),
            Value::Date(Some(ms)) => match DateTime::<Utc>::from_timestamp_millis(*ms) {
                Some(date) => Json::String(date.to_rfc3339_opts(SecondsFormat::Millis, true)),
                None => Json::Null,
            },
            Value::Date(None) => Json::Null,
            Value::Error(ErrorValue { name, message }) => serde_json::json!({
                "name": name,
                "message": message,
            }),
            Value::Bytes(bytes) => match self.flavor {
                Flavor::Json => Json::Object(
                    bytes
                        .as_slice()
                        .iter()
                        .enumerate()
                        .map(|(i, b)| (i.to_string(), Json::from(*b)))
                        .collect(),
                ),
                Flavor::Process => {
                    Json::String(base64::engine::general_purpose::STANDARD.encode(bytes.as_slice()))
                }
            },
            Value::Array(array) => {
                self.enter(array.identity())?;
                let mut items = Vec::with_capacity(array.len());
                for item in array.to_vec() {
                    items.push(self.convert(&item)?.unwrap_or(Json::Null));
                }
                self.leave(array.identity());
                Json::Array(items)
            }
            Value::Object(object) => {
                self.enter(object.identity())?;
                let mut map = serde_json::Map::new();
                for (key, item) in object.entries() {
                    if let Some(item) = self.convert(&item)? {
                        map.insert(key, item);
                    }
                }
                self.leave(object.identity());
                Json::Object(map)
            }
            Value::Promise(_) | Value::Function(_) | Value::Iter(_) | Value::Ref(_) => {
                return Err(RegistryError::Serialize(format!(
                    "{} could not be cloned",
                    value.type_name()
                )));
            }
        }))
    }

    fn enter(&mut self, identity: usize) -> Result<(), RegistryError> {
        if self.stack.insert(identity) {
            Ok(())
        } else {
            Err(RegistryError::Serialize(
                "converting circular structure".to_owned(),
            ))
        }
    }

    fn leave(&mut self, identity: usize) {
        self.stack.remove(&identity);
    }
}

pub(crate) fn from_plain(plain: serde_json::Value) -> Value {
    use serde_json::Value as Json;
    match plain {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Bool(b),
        Json::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
        Json::String(s) => Value::String(s),
        Json::Array(items) => Value::Array(Array::from_vec(
            items.into_iter().map(from_plain).collect(),
        )),
        Json::Object(map) => Value::Object(Object::from_entries(
            map.into_iter().map(|(k, v)| (k, from_plain(v))),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::callable::Function;

    #[test]
    fn json_text_follows_stringify_rules() {
        let value = Value::Object(Object::from_entries([
            ("n", Value::Number(f64::NAN)),
            ("u", Value::Undefined),
            ("list", Value::from(vec![Value::Undefined, Value::from(1)])),
            ("when", Value::Date(Some(0))),
            ("err", Value::Error(ErrorValue::type_error("bad"))),
        ]));
        insta::assert_snapshot!(to_json_text(&value).unwrap(), @r#"{"err":{"message":"bad","name":"TypeError"},"list":[null,1],"n":null,"when":"1970-01-01T00:00:00.000Z"}"#);
    }

    #[test]
    fn process_refuses_non_finite_numbers() {
        let result = to_plain(&Value::Number(f64::INFINITY), Flavor::Process);
        assert!(matches!(result, Err(RegistryError::Serialize(_))));
    }

    #[test]
    fn callables_cannot_be_cloned() {
        let f = Function::from_fn("f", 0, |_, _| async { Ok(Value::Undefined) });
        let result = to_json_text(&Value::from(vec![Value::Function(f)]));
        assert!(matches!(result, Err(RegistryError::Serialize(m)) if m.contains("function")));
    }

    #[test]
    fn cycles_are_refused() {
        let array = Array::new();
        array.push(Value::Array(array.clone()));
        assert!(to_json_text(&Value::Array(array)).is_err());
    }

    #[test]
    fn shared_but_acyclic_values_are_duplicated() {
        let shared = Value::from(vec![Value::from(1)]);
        let outer = Value::from(vec![shared.clone(), shared]);
        assert_eq!(to_json_text(&outer).unwrap(), "[[1],[1]]");
    }

    #[test]
    fn text_reads_back_as_plain_values() {
        let value = from_json_text(r#"{"a":[1,"x",null,true]}"#).unwrap();
        let list = value.member("a").unwrap();
        assert_eq!(list.member("1"), Some(Value::from("x")));
        assert_eq!(list.member("2"), Some(Value::Null));
    }
}
