use super::value::{ErrorValue, Value};

/// Failures of the registry itself, as opposed to rejections coming from the peer.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("could not serialize value: {0}")]
    Serialize(String),

    #[error("no {kind} with id {id}")]
    UnknownHandle { kind: &'static str, id: u64 },

    #[error("link {0} was never resolved")]
    UnresolvedLink(u32),

    #[error("encode context used after send")]
    EncodeAfterSend,

    #[error("registry closed: {0}")]
    Closed(String),

    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),
}

impl RegistryError {
    pub(crate) fn unknown(kind: &'static str, id: u64) -> Self {
        Self::UnknownHandle { kind, id }
    }

    /// Error value handed to the peer or to a local waiter.
    pub fn to_value(&self) -> Value {
        let name = match self {
            Self::Serialize(_) | Self::EncodeAfterSend => "DataCloneError",
            Self::UnknownHandle { .. } | Self::UnresolvedLink(_) | Self::Json(_) => "ProtocolError",
            Self::Closed(_) => "WorkerClosed",
        };
        Value::Error(ErrorValue::new(name, self.to_string()))
    }
}

/// Outcome of a failed cross-boundary call.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("remote call rejected: {0}")]
    Rejected(Value),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl CallError {
    /// Flattens into the value a local caller would see as a rejection.
    pub fn into_value(self) -> Value {
        match self {
            CallError::Rejected(value) => value,
            CallError::Registry(e) => e.to_value(),
        }
    }
}
