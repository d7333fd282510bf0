//! Reference execution host: JSON documents and units backed by the native catalog.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use serde::Deserialize;

use isolet::bridge::protocol::ModulesRequest;
use isolet::registry::{ErrorValue, Function, Value};
use isolet::ExecutionHost;

use crate::catalog;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum UnitDescription {
    Json {
        id: String,
        source: String,
    },
    Native {
        id: String,
        #[serde(default)]
        exports: Vec<String>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum UnitError {
    #[error("invalid unit description: {0}")]
    Invalid(#[source] serde_json::Error),

    #[error("unit {0} is defined more than once")]
    Duplicate(String),

    #[error("unit {id} has invalid json source: {error}")]
    Source {
        id: String,
        #[source]
        error: serde_json::Error,
    },

    #[error("unit {id} exports unknown native function {name}")]
    UnknownExport { id: String, name: String },
}

enum Unit {
    Json(serde_json::Value),
    Native(HashMap<String, Function>),
}

fn build(description: UnitDescription) -> Result<(String, Unit), UnitError> {
    match description {
        UnitDescription::Json { id, source } => match serde_json::from_str(&source) {
            Ok(document) => Ok((id, Unit::Json(document))),
            Err(error) => Err(UnitError::Source { id, error }),
        },
        UnitDescription::Native { id, exports } => {
            let mut functions = HashMap::with_capacity(exports.len());
            for name in exports {
                let Some(function) = catalog::lookup(&name) else {
                    return Err(UnitError::UnknownExport { id, name });
                };
                functions.insert(name, function);
            }
            Ok((id, Unit::Native(functions)))
        }
    }
}

/// Host with `json` and `native` units.
pub struct NativeHost {
    exec_args: Vec<String>,
    units: RwLock<HashMap<String, Unit>>,
}

impl NativeHost {
    pub fn new(exec_args: Vec<String>) -> Self {
        Self {
            exec_args,
            units: RwLock::new(HashMap::new()),
        }
    }

    /// Validates and installs every description, or none of them.
    pub fn load(&self, units: Vec<serde_json::Value>) -> Result<usize, UnitError> {
        let mut loaded = HashMap::with_capacity(units.len());
        for unit in units {
            let description = serde_json::from_value(unit).map_err(UnitError::Invalid)?;
            let (id, unit) = build(description)?;
            if loaded.contains_key(&id) {
                return Err(UnitError::Duplicate(id));
            }
            loaded.insert(id, unit);
        }
        let count = loaded.len();
        self.units
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(loaded);
        Ok(count)
    }
}

fn not_a_function(identifier: &str, method: &str) -> Value {
    Value::Error(ErrorValue::error(format!(
        "exported method {identifier}.{method} is not a function"
    )))
}

/// Export returning a fresh copy of `document` on every call.
fn constant(name: &str, document: serde_json::Value) -> Function {
    Function::from_fn(name, 0, move |_, _| {
        let document = document.clone();
        async move { Ok(Value::from(document)) }
    })
}

#[async_trait]
impl ExecutionHost for NativeHost {
    async fn create_modules(&self, request: ModulesRequest) -> Result<(), String> {
        tracing::debug!(
            context_hooks = ?request.context_hooks,
            exec_args = ?self.exec_args,
            "Creating units"
        );
        self.load(request.units).map(|_| ()).map_err(|e| e.to_string())
    }

    fn resolve(&self, identifier: &str, method: &str) -> Result<Function, Value> {
        let units = self.units.read().unwrap_or_else(PoisonError::into_inner);
        let Some(unit) = units.get(identifier) else {
            return Err(Value::Error(ErrorValue::error(format!(
                "Can not call method of unknown unit: {identifier}"
            ))));
        };
        match unit {
            Unit::Json(document) if method == "default" => Ok(constant(method, document.clone())),
            Unit::Json(document) => match document.get(method) {
                Some(member) if document.is_object() => Ok(constant(method, member.clone())),
                _ => Err(not_a_function(identifier, method)),
            },
            Unit::Native(functions) => functions
                .get(method)
                .cloned()
                .ok_or_else(|| not_a_function(identifier, method)),
        }
    }
}
