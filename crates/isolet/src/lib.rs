//! isolet: supervised worker processes with a bidirectional remote object bridge.

pub mod bridge;
pub mod config;
pub mod controller;
mod health;
pub mod logging;
pub mod registry;
pub mod resources;
pub mod watchdog;
pub mod worker;

pub use config::{CpuLimits, MemoryLimits, ResourceLimits, StdioMode, WorkerArgs, WorkerConfig};
pub use controller::{
    CommandSpawner, CreateError, InvokeError, SpawnError, Worker, WorkerEvent, WorkerSpawner,
};
pub use health::{ExitKind, ExitLatch, ExitReason};
pub use logging::init_tracing;
pub use registry::{CallError, CallOptions, Registry, RegistryError, RegistryStats, Value};
pub use worker::{ExecutionHost, HostCallback, run_worker, serve};
