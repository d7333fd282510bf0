//! Wire protocol types for controller-worker communication.
//!
//! Every message is a `{kind, payload}` envelope. Handshake and liveness messages live at
//! this level; registry traffic travels nested inside `remote`.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::registry::RemoteFrame;

/// Parameters of the `init` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitParams {
    /// Session key every alive report must echo back.
    pub key: String,
    /// Report cadence in milliseconds.
    pub check_alive_period: u64,
    pub check_alive_timeout: u64,
}

/// Payload of `createModules`, handed to the execution host as is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModulesRequest {
    pub units: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context_hooks: Vec<String>,
}

/// CPU time consumed during the last report period, in microseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuUsage {
    pub user: u64,
    pub system: u64,
}

/// Memory readings in bytes. `rss` is always present; workers may add more metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryUsage {
    /// Current resident set size.
    pub rss: u64,
    #[serde(flatten)]
    pub other: BTreeMap<String, u64>,
}

impl MemoryUsage {
    pub fn new(rss: u64) -> Self {
        Self {
            rss,
            other: BTreeMap::new(),
        }
    }

    pub fn with(mut self, metric: impl Into<String>, bytes: u64) -> Self {
        self.other.insert(metric.into(), bytes);
        self
    }

    pub fn get(&self, metric: &str) -> Option<u64> {
        match metric {
            "rss" => Some(self.rss),
            _ => self.other.get(metric).copied(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AliveReport {
    pub key: String,
    pub cpu_usage: CpuUsage,
    pub memory_usage: MemoryUsage,
}

/// Control messages from controller to worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "camelCase")]
pub enum ControlRequest {
    Init(InitParams),
    CreateModules(ModulesRequest),
    Remote(RemoteFrame),
}

/// Control messages from worker to controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "camelCase")]
pub enum ControlResponse {
    /// First message after spawn.
    ProcessReady,
    InitDone,
    /// `None` on success, else why the units could not be created. Travels as `false` or a
    /// string.
    CreateModulesDone(#[serde(with = "modules_outcome")] Option<String>),
    #[serde(rename = "alive-report")]
    AliveReport(AliveReport),
    Remote(RemoteFrame),
}

impl ControlResponse {
    pub fn kind(&self) -> &'static str {
        match self {
            ControlResponse::ProcessReady => "processReady",
            ControlResponse::InitDone => "initDone",
            ControlResponse::CreateModulesDone(_) => "createModulesDone",
            ControlResponse::AliveReport(_) => "alive-report",
            ControlResponse::Remote(_) => "remote",
        }
    }
}

mod modules_outcome {
    use super::*;

    pub fn serialize<S: Serializer>(outcome: &Option<String>, s: S) -> Result<S::Ok, S::Error> {
        match outcome {
            None => s.serialize_bool(false),
            Some(message) => s.serialize_str(message),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        Ok(match serde_json::Value::deserialize(d)? {
            serde_json::Value::Null | serde_json::Value::Bool(false) => None,
            serde_json::Value::String(message) => Some(message),
            other => Some(other.to_string()),
        })
    }
}
