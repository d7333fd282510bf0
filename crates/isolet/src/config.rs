//! Worker configuration and the command line a worker is started with.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bridge::codec::Framing;
use crate::controller::{CommandSpawner, WorkerSpawner};

/// Where the worker's stderr goes. Stdin and stdout always carry the control channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StdioMode {
    #[default]
    Inherit,
    Null,
    /// Captured and re-emitted as tracing events under `isolet::worker`.
    Piped,
}

/// Per-period CPU ceilings in microseconds. Unset metrics are not checked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuLimits {
    pub user: Option<u64>,
    pub system: Option<u64>,
}

/// Memory ceilings in bytes, keyed by the `memoryUsage` metric they apply to.
/// Metrics a report does not carry are not checked.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemoryLimits(BTreeMap<String, u64>);

impl MemoryLimits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, metric: impl Into<String>, bytes: u64) -> Self {
        self.0.insert(metric.into(), bytes);
        self
    }

    pub fn get(&self, metric: &str) -> Option<u64> {
        self.0.get(metric).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(metric, limit)| (metric.as_str(), *limit))
    }
}

/// Ceilings the worker applies to itself at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResourceLimits {
    pub max_young_generation_size_mb: u64,
    pub max_old_generation_size_mb: u64,
    pub stack_size_mb: u64,
    pub code_range_size_mb: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_young_generation_size_mb: 100,
            max_old_generation_size_mb: 100,
            stack_size_mb: 40,
            code_range_size_mb: 100,
        }
    }
}

const MB: u64 = 1024 * 1024;

impl ResourceLimits {
    /// Data segment ceiling: both heap generations plus the code range.
    pub fn heap_bytes(&self) -> u64 {
        (self.max_young_generation_size_mb
            + self.max_old_generation_size_mb
            + self.code_range_size_mb)
            .saturating_mul(MB)
    }

    pub fn stack_bytes(&self) -> u64 {
        self.stack_size_mb.saturating_mul(MB)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Everything `Worker::create` needs besides the unit descriptions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WorkerConfig {
    #[serde(flatten)]
    pub limits: ResourceLimits,
    /// Extra arguments for the worker program, after `--`.
    pub exec_args: Vec<String>,
    pub serialization: Framing,
    pub stderr: StdioMode,
    #[serde(with = "millis")]
    pub check_alive_period: Duration,
    #[serde(with = "millis")]
    pub check_alive_timeout: Duration,
    #[serde(with = "millis")]
    pub handshake_timeout: Duration,
    /// `None` disables CPU checks.
    pub max_cpu_usage: Option<CpuLimits>,
    /// `None` disables memory checks.
    pub max_memory_usage: Option<MemoryLimits>,
    pub context_hooks: Vec<String>,
    #[serde(skip)]
    pub spawner: Arc<dyn WorkerSpawner>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            limits: ResourceLimits::default(),
            exec_args: Vec::new(),
            serialization: Framing::default(),
            stderr: StdioMode::default(),
            check_alive_period: Duration::from_millis(1000),
            check_alive_timeout: Duration::from_millis(200),
            handshake_timeout: Duration::from_millis(1000),
            max_cpu_usage: Some(CpuLimits {
                user: Some(500_000),
                system: Some(300_000),
            }),
            max_memory_usage: Some(MemoryLimits::new().with("rss", 1_000_000_000)),
            context_hooks: Vec::new(),
            spawner: Arc::new(CommandSpawner::default()),
        }
    }
}

impl WorkerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_exec_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.exec_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_serialization(mut self, framing: Framing) -> Self {
        self.serialization = framing;
        self
    }

    pub fn with_stderr(mut self, stderr: StdioMode) -> Self {
        self.stderr = stderr;
        self
    }

    pub fn with_check_alive_period(mut self, period: Duration) -> Self {
        self.check_alive_period = period;
        self
    }

    pub fn with_check_alive_timeout(mut self, timeout: Duration) -> Self {
        self.check_alive_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_max_cpu_usage(mut self, limits: Option<CpuLimits>) -> Self {
        self.max_cpu_usage = limits;
        self
    }

    pub fn with_max_memory_usage(mut self, limits: Option<MemoryLimits>) -> Self {
        self.max_memory_usage = limits;
        self
    }

    pub fn with_context_hooks(mut self, hooks: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.context_hooks = hooks.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    /// Command line for the worker process.
    pub fn worker_args(&self) -> WorkerArgs {
        WorkerArgs {
            limits: self.limits,
            framing: self.serialization,
            exec_args: self.exec_args.clone(),
        }
    }
}

/// Flags the worker binary understands.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerArgs {
    pub limits: ResourceLimits,
    pub framing: Framing,
    pub exec_args: Vec<String>,
}

impl WorkerArgs {
    pub fn to_args(&self) -> Vec<String> {
        let limits = &self.limits;
        let mut args = vec![
            "--max-young-generation-size-mb".to_owned(),
            limits.max_young_generation_size_mb.to_string(),
            "--max-old-generation-size-mb".to_owned(),
            limits.max_old_generation_size_mb.to_string(),
            "--stack-size-mb".to_owned(),
            limits.stack_size_mb.to_string(),
            "--code-range-size-mb".to_owned(),
            limits.code_range_size_mb.to_string(),
            "--serialization".to_owned(),
            self.framing.as_str().to_owned(),
        ];
        if !self.exec_args.is_empty() {
            args.push("--".to_owned());
            args.extend(self.exec_args.iter().cloned());
        }
        args
    }

    /// Parses arguments, skipping argv[0].
    pub fn parse(args: &[String]) -> Result<Self, String> {
        let mut parsed = WorkerArgs::default();

        let mut i = 1;
        while i < args.len() {
            let flag = args[i].as_str();
            let target = match flag {
                "--max-young-generation-size-mb" => {
                    &mut parsed.limits.max_young_generation_size_mb
                }
                "--max-old-generation-size-mb" => &mut parsed.limits.max_old_generation_size_mb,
                "--stack-size-mb" => &mut parsed.limits.stack_size_mb,
                "--code-range-size-mb" => &mut parsed.limits.code_range_size_mb,
                "--serialization" => {
                    i += 1;
                    let value = args.get(i).ok_or("--serialization requires a value")?;
                    parsed.framing = Framing::parse(value)
                        .ok_or_else(|| format!("unknown serialization: {value}"))?;
                    i += 1;
                    continue;
                }
                "--" => {
                    parsed.exec_args = args[i + 1..].to_vec();
                    break;
                }
                arg => return Err(format!("unknown flag: {arg}")),
            };
            i += 1;
            let value = args.get(i).ok_or_else(|| format!("{flag} requires a value"))?;
            *target = value
                .parse()
                .map_err(|_| format!("{flag} expects a number, got {value}"))?;
            i += 1;
        }

        Ok(parsed)
    }
}
