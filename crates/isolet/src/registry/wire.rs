//! Wire shapes for the registry sub-protocol.
//!
//! Every frame travels inside a `remote` control message. Values inside a frame are
//! carried as a [`Payload`], whose `mapping` tag says how the peer has to read it.

use serde::{Deserialize, Serialize};

/// Serialization mode applied to a value at one boundary crossing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mapping {
    /// Textual JSON round trip. Errors are reduced to `{name, message}`.
    Json,
    /// Structured passthrough relying on the channel itself.
    Process,
    /// Full registry pipeline: identity, cycles, promises, callables.
    #[default]
    Link,
}

/// Serialization mode for the answer to a call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseMapping {
    Json,
    Process,
    #[default]
    Link,
    /// Fire and forget: no call id, no result.
    Ignore,
    /// The result stays with its owner; the caller receives an opaque token.
    Ref,
}

impl From<Mapping> for ResponseMapping {
    fn from(mapping: Mapping) -> Self {
        match mapping {
            Mapping::Json => Self::Json,
            Mapping::Process => Self::Process,
            Mapping::Link => Self::Link,
        }
    }
}

/// How arguments and results of one specific callable are (de)serialized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallablePolicy {
    #[serde(default)]
    pub mapping: Mapping,
    #[serde(default)]
    pub response_mapping: ResponseMapping,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub no_this: bool,
}

impl CallablePolicy {
    pub fn new(mapping: Mapping, response_mapping: ResponseMapping) -> Self {
        Self {
            mapping,
            response_mapping,
            no_this: false,
        }
    }

    pub fn with_no_this(mut self, no_this: bool) -> Self {
        self.no_this = no_this;
        self
    }
}

/// A value as it crosses the boundary.
///
/// Primitives are carried as plain JSON; everything else is a tagged [`Node`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EncodedValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Node(Box<Node>),
}

impl EncodedValue {
    pub(crate) fn node(node: Node) -> Self {
        Self::Node(Box::new(node))
    }
}

/// Numbers that plain JSON cannot carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NonFinite {
    #[serde(rename = "NaN")]
    NaN,
    #[serde(rename = "I")]
    Infinity,
    #[serde(rename = "-I")]
    NegInfinity,
}

impl NonFinite {
    pub fn classify(n: f64) -> Option<Self> {
        if n.is_nan() {
            Some(Self::NaN)
        } else if n == f64::INFINITY {
            Some(Self::Infinity)
        } else if n == f64::NEG_INFINITY {
            Some(Self::NegInfinity)
        } else {
            None
        }
    }

    pub fn value(self) -> f64 {
        match self {
            Self::NaN => f64::NAN,
            Self::Infinity => f64::INFINITY,
            Self::NegInfinity => f64::NEG_INFINITY,
        }
    }
}

/// Settlement state of an encoded promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Fulfilled,
    Rejected,
}

/// Opaque host objects passed through as unstructured `value` nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Opaque {
    Error { name: String, message: String },
    /// Base64 of the raw bytes.
    Bytes { data: String },
}

/// Tagged encoded node.
///
/// `id` is only present on nodes that a later `link` refers to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Node {
    Undefined,
    Number {
        value: NonFinite,
    },
    Date {
        value: Option<i64>,
    },
    Array {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u32>,
        value: Vec<EncodedValue>,
    },
    Object {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u32>,
        value: Vec<(String, EncodedValue)>,
    },
    Value {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u32>,
        value: Opaque,
    },
    Link {
        value: u32,
    },
    Promise {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u32>,
        status: NodeStatus,
        /// Owner-assigned handle while pending.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        handle: Option<u64>,
        /// Settled value. A `null` settlement deserializes as `None`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<EncodedValue>,
    },
    Fn {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u32>,
        value: u64,
        mapping: Mapping,
        response_mapping: ResponseMapping,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        no_this: bool,
        #[serde(default)]
        name: String,
        #[serde(default)]
        arity: u32,
    },
    Itr {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u32>,
        value: u64,
        mapping: Mapping,
        response_mapping: ResponseMapping,
    },
    Ref {
        value: Option<u64>,
    },
}

/// A value together with the mapping it was produced under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mapping", content = "value", rename_all = "lowercase")]
pub enum Payload {
    Json(String),
    Process(serde_json::Value),
    Link(EncodedValue),
    Ref(Option<u64>),
}

/// Outcome of a call or a promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Settlement {
    Fulfilled,
    Rejected,
}

impl Settlement {
    pub fn of<T, E>(result: &Result<T, E>) -> Self {
        if result.is_ok() {
            Self::Fulfilled
        } else {
            Self::Rejected
        }
    }
}

/// Operation selected by a `hook` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookAction {
    Call,
    Next,
    Throw,
    Return,
    /// The holder dropped its proxy.
    Clear,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<u64>,
    pub response_mapping: ResponseMapping,
    pub args: Payload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCallResult {
    pub call_id: u64,
    pub status: Settlement,
    pub value: Payload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateStatus {
    Fulfilled,
    Rejected,
    /// The owner gave up on the promise before it settled.
    Clear,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromiseUpdate {
    pub id: u64,
    pub status: UpdateStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Payload>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookRequest {
    pub id: u64,
    pub action: HookAction,
    /// Absent for fire-and-forget calls and for `clear`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_context: Option<Payload>,
    /// For `clear`: how many times the holder received this handle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
}

impl HookRequest {
    pub fn clear(id: u64, count: u64) -> Self {
        Self {
            id,
            action: HookAction::Clear,
            call_id: None,
            call_context: None,
            count: Some(count),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookResult {
    pub id: u64,
    pub call_id: u64,
    pub status: Settlement,
    pub value: Payload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefClear {
    pub id: u64,
    pub count: u64,
}

/// One registry frame, nested inside a `remote` control message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum RemoteFrame {
    RemoteCall(RemoteCall),
    RemoteCallResult(RemoteCallResult),
    PromiseUpdate(PromiseUpdate),
    Hook(HookRequest),
    HookResult(HookResult),
    RefClear(RefClear),
}

impl RemoteFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RemoteCall(_) => "remoteCall",
            Self::RemoteCallResult(_) => "remoteCallResult",
            Self::PromiseUpdate(_) => "promiseUpdate",
            Self::Hook(_) => "hook",
            Self::HookResult(_) => "hookResult",
            Self::RefClear(_) => "refClear",
        }
    }
}
