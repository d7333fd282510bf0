//! Worker controller: spawns a worker, runs the handshake and owns the invoke surface.
//!
//! After a successful handshake four tasks serve one worker:
//! - **process**: owns the `Child`, reaps it and latches `exitCode` when it goes away
//! - **reader**: routes `remote` frames into the registry and alive reports to the watchdog
//! - **writer**: drains the registry's outbound frames onto the worker's stdin
//! - **watchdog**: see [`crate::watchdog`]
//!
//! A fifth, the exit monitor, waits for the exit latch and then kills the process, closes
//! the registry and emits [`WorkerEvent::Exit`].

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::AsyncBufReadExt;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{
    AliveReport, ControlRequest, ControlResponse, InitParams, ModulesRequest,
};
use crate::config::{StdioMode, WorkerArgs, WorkerConfig};
use crate::health::{ExitLatch, ExitReason};
use crate::registry::{
    CallError, CallOptions, Registry, RegistryError, RegistryStats, RemoteFrame, Value,
};
use crate::watchdog::{Verdict, WatchdogConfig, run_watchdog};

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Extension point for how worker processes are started.
///
/// The returned child must have piped stdin and stdout.
pub trait WorkerSpawner: Send + Sync + fmt::Debug {
    fn spawn(&self, args: &WorkerArgs, stderr: StdioMode) -> Result<Child, SpawnError>;
}

/// Runs a worker program with the worker flags appended.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    program: PathBuf,
    args: Vec<String>,
}

impl Default for CommandSpawner {
    /// `$ISOLET_WORKER`, or `isolet-worker` from `PATH`.
    fn default() -> Self {
        let program = std::env::var_os("ISOLET_WORKER")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("isolet-worker"));
        Self::new(program)
    }
}

impl CommandSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Arguments placed before the worker flags.
    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

pub(crate) fn stdio(mode: StdioMode) -> Stdio {
    match mode {
        StdioMode::Inherit => Stdio::inherit(),
        StdioMode::Null => Stdio::null(),
        StdioMode::Piped => Stdio::piped(),
    }
}

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self, args: &WorkerArgs, stderr: StdioMode) -> Result<Child, SpawnError> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .args(args.to_args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(stdio(stderr))
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CreateError {
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] SpawnError),
    #[error("worker did not send {stage} in time")]
    HandshakeTimeout { stage: &'static str },
    #[error("worker exited while waiting for {stage}")]
    Exited { stage: &'static str },
    #[error("{0}")]
    Modules(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("{0}")]
    WorkerExited(ExitReason),
    #[error("call rejected: {0}")]
    Rejected(Value),
    #[error(transparent)]
    Registry(RegistryError),
}

impl InvokeError {
    /// The rejection as a value, the way a caller on the other side would see it.
    pub fn into_value(self) -> Value {
        match self {
            InvokeError::Rejected(value) => value,
            InvokeError::WorkerExited(reason) => Value::Error(crate::registry::ErrorValue::new(
                "WorkerExited",
                reason.to_string(),
            )),
            InvokeError::Registry(error) => error.to_value(),
        }
    }
}

/// Observation hooks. Receiving them has no effect on the worker.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Exit(ExitReason),
    DataSend(RemoteFrame),
    DataReceive(RemoteFrame),
}

const EVENT_CAPACITY: usize = 256;

type ControlReader = FramedRead<ChildStdout, JsonCodec<ControlResponse>>;
type ControlWriter = FramedWrite<ChildStdin, JsonCodec<ControlRequest>>;

struct Shared {
    pid: Option<u32>,
    registry: Registry,
    exit: ExitLatch,
    events: broadcast::Sender<WorkerEvent>,
    kill: CancellationToken,
    reaped: CancellationToken,
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.exit.set(ExitReason::kill());
        self.kill.cancel();
    }
}

/// Handle to a running worker. Clones share the process; dropping the last one kills it.
#[derive(Clone)]
pub struct Worker {
    shared: Arc<Shared>,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("pid", &self.shared.pid)
            .field("exit", &self.shared.exit.get())
            .finish()
    }
}

impl Worker {
    /// Spawns a worker and runs the handshake. `units` go to the execution host unchanged.
    pub async fn create(
        units: Vec<serde_json::Value>,
        config: WorkerConfig,
    ) -> Result<Worker, CreateError> {
        let key = uuid::Uuid::new_v4().simple().to_string();
        let mut child = config
            .spawner
            .spawn(&config.worker_args(), config.stderr)?;
        let pid = child.id();
        tracing::info!(worker_pid = ?pid, "Spawned worker");

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SpawnError::Other("stdin not captured".to_owned()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SpawnError::Other("stdout not captured".to_owned()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(stderr, pid));
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let exit = ExitLatch::new();
        let kill = CancellationToken::new();
        let reaped = CancellationToken::new();
        let registry = Registry::new(outbound_tx);

        tokio::spawn(supervise(
            child,
            pid,
            exit.clone(),
            kill.clone(),
            reaped.clone(),
        ));
        tokio::spawn(monitor_exit(
            exit.clone(),
            kill.clone(),
            registry.clone(),
            events.clone(),
        ));

        let framing = config.serialization;
        let mut writer = FramedWrite::new(stdin, JsonCodec::<ControlRequest>::with_framing(framing));
        let reader = FramedRead::new(stdout, JsonCodec::<ControlResponse>::with_framing(framing));
        let (report_tx, report_rx) = mpsc::unbounded_channel();

        let mut handshake = Handshake {
            reader,
            exit: exit.clone(),
            reports: report_tx,
            timeout: config.handshake_timeout,
        };
        let handshake_result = async {
            handshake.expect_ready().await?;
            send(
                &mut writer,
                ControlRequest::Init(InitParams {
                    key: key.clone(),
                    check_alive_period: config.check_alive_period.as_millis() as u64,
                    check_alive_timeout: config.check_alive_timeout.as_millis() as u64,
                }),
            )
            .await?;
            handshake.expect_init_done().await?;

            tokio::spawn(watch(
                WatchdogConfig::from_worker(&config, key.clone()),
                report_rx,
                exit.clone(),
                kill.clone(),
            ));

            send(
                &mut writer,
                ControlRequest::CreateModules(ModulesRequest {
                    units,
                    context_hooks: config.context_hooks.clone(),
                }),
            )
            .await?;
            handshake.expect_modules().await
        }
        .await;

        if let Err(error) = handshake_result {
            tracing::warn!(worker_pid = ?pid, %error, "Worker handshake failed");
            let reason = match &error {
                CreateError::HandshakeTimeout { .. } => {
                    ExitReason::timeout(config.handshake_timeout.as_millis() as u64)
                }
                _ => ExitReason::kill(),
            };
            exit.set(reason);
            kill.cancel();
            let _ = tokio::time::timeout(REAP_TIMEOUT, reaped.cancelled()).await;
            return Err(error);
        }

        let Handshake { reader, reports, .. } = handshake;
        tokio::spawn(run_reader(
            reader,
            reports,
            registry.clone(),
            events.clone(),
            kill.clone(),
        ));
        tokio::spawn(run_writer(writer, outbound_rx, events.clone(), kill.clone()));

        tracing::info!(worker_pid = ?pid, "Worker ready");
        Ok(Worker {
            shared: Arc::new(Shared {
                pid,
                registry,
                exit,
                events,
                kill,
                reaped,
            }),
        })
    }

    /// Calls `identifier.method` in the worker.
    pub async fn invoke(
        &self,
        identifier: &str,
        method: &str,
        this: Value,
        args: Vec<Value>,
        params: CallOptions,
    ) -> Result<Value, InvokeError> {
        if let Some(reason) = self.shared.exit.get() {
            return Err(InvokeError::WorkerExited(reason));
        }
        let call = vec![
            Value::from(identifier),
            Value::from(method),
            this,
            Value::from(args),
        ];
        match self.shared.registry.call_remote(call, params).await {
            Ok(value) => Ok(value),
            Err(CallError::Rejected(value)) => Err(InvokeError::Rejected(value)),
            Err(CallError::Registry(RegistryError::Closed(_))) => Err(InvokeError::WorkerExited(
                self.shared
                    .exit
                    .get()
                    .unwrap_or_else(ExitReason::channel_closed),
            )),
            Err(CallError::Registry(error)) => Err(InvokeError::Registry(error)),
        }
    }

    /// Terminates the worker. Only the first exit reason sticks.
    pub fn kill(&self) {
        if self.shared.exit.set(ExitReason::kill()) {
            tracing::info!(worker_pid = ?self.shared.pid, "Killing worker");
        }
        self.shared.kill.cancel();
    }

    /// Waits until the process has been reaped.
    pub async fn wait(&self) -> ExitReason {
        self.shared.reaped.cancelled().await;
        self.shared.exit.wait().await
    }

    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.shared.exit.get()
    }

    pub fn pid(&self) -> Option<u32> {
        self.shared.pid
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.shared.events.subscribe()
    }

    pub fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    pub fn stats(&self) -> RegistryStats {
        self.shared.registry.stats()
    }
}

const REAP_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

struct Handshake {
    reader: ControlReader,
    exit: ExitLatch,
    reports: mpsc::UnboundedSender<AliveReport>,
    /// Applies to each step separately.
    timeout: std::time::Duration,
}

impl Handshake {
    /// Next handshake message, forwarding alive reports that arrive in between.
    async fn next(&mut self, stage: &'static str) -> Result<ControlResponse, CreateError> {
        let timeout = self.timeout;
        let wait = async {
            loop {
                let msg = tokio::select! {
                    biased;

                    _ = self.exit.wait() => return Err(CreateError::Exited { stage }),
                    msg = self.reader.next() => msg,
                };
                match msg {
                    Some(Ok(ControlResponse::AliveReport(report))) => {
                        let _ = self.reports.send(report);
                    }
                    Some(Ok(msg)) => return Ok(msg),
                    Some(Err(e)) => {
                        return Err(CreateError::Protocol(format!("control channel error: {e}")));
                    }
                    None => return Err(CreateError::Exited { stage }),
                }
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(CreateError::HandshakeTimeout { stage }),
        }
    }

    async fn expect_ready(&mut self) -> Result<(), CreateError> {
        match self.next("processReady").await? {
            ControlResponse::ProcessReady => Ok(()),
            other => Err(unexpected("processReady", &other)),
        }
    }

    async fn expect_init_done(&mut self) -> Result<(), CreateError> {
        match self.next("initDone").await? {
            ControlResponse::InitDone => Ok(()),
            other => Err(unexpected("initDone", &other)),
        }
    }

    async fn expect_modules(&mut self) -> Result<(), CreateError> {
        match self.next("createModulesDone").await? {
            ControlResponse::CreateModulesDone(None) => Ok(()),
            ControlResponse::CreateModulesDone(Some(message)) => Err(CreateError::Modules(message)),
            other => Err(unexpected("createModulesDone", &other)),
        }
    }
}

fn unexpected(stage: &str, got: &ControlResponse) -> CreateError {
    CreateError::Protocol(format!("expected {stage}, got {}", got.kind()))
}

async fn send(writer: &mut ControlWriter, request: ControlRequest) -> Result<(), CreateError> {
    writer
        .send(request)
        .await
        .map_err(|e| CreateError::Protocol(format!("failed to write to worker: {e}")))
}

async fn supervise(
    mut child: Child,
    pid: Option<u32>,
    exit: ExitLatch,
    kill: CancellationToken,
    reaped: CancellationToken,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill.cancelled() => {
            if let Err(e) = child.start_kill() {
                tracing::debug!(worker_pid = ?pid, error = %e, "start_kill failed");
            }
            child.wait().await
        }
    };
    match status {
        Ok(status) => {
            tracing::info!(worker_pid = ?pid, %status, "Worker process exited");
            exit.set(ExitReason::exited(status));
        }
        Err(e) => {
            tracing::error!(worker_pid = ?pid, error = %e, "Failed to wait for worker");
            exit.set(ExitReason::channel_closed());
        }
    }
    reaped.cancel();
}

async fn monitor_exit(
    exit: ExitLatch,
    kill: CancellationToken,
    registry: Registry,
    events: broadcast::Sender<WorkerEvent>,
) {
    let reason = exit.wait().await;
    tracing::debug!(reason = %reason.reason, expected = reason.is_expected(), "Worker exit latched");
    kill.cancel();
    registry.close(reason.to_string());
    let _ = events.send(WorkerEvent::Exit(reason));
}

async fn watch(
    config: WatchdogConfig,
    reports: mpsc::UnboundedReceiver<AliveReport>,
    exit: ExitLatch,
    kill: CancellationToken,
) {
    if let Verdict::Violation(reason) = run_watchdog(config, reports, exit.clone()).await {
        exit.set(reason);
        kill.cancel();
    }
}

async fn run_reader(
    mut reader: ControlReader,
    reports: mpsc::UnboundedSender<AliveReport>,
    registry: Registry,
    events: broadcast::Sender<WorkerEvent>,
    kill: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            biased;

            _ = kill.cancelled() => break,
            msg = reader.next() => msg,
        };
        match msg {
            Some(Ok(ControlResponse::Remote(frame))) => {
                let _ = events.send(WorkerEvent::DataReceive(frame.clone()));
                registry.receive(frame);
            }
            Some(Ok(ControlResponse::AliveReport(report))) => {
                let _ = reports.send(report);
            }
            Some(Ok(other)) => {
                tracing::warn!(kind = other.kind(), "Unexpected control message after handshake");
            }
            Some(Err(e)) => {
                tracing::error!(error = %e, "Control channel error");
                break;
            }
            None => {
                tracing::debug!("Control channel closed");
                break;
            }
        }
    }
}

async fn run_writer(
    mut writer: ControlWriter,
    mut outbound: mpsc::UnboundedReceiver<RemoteFrame>,
    events: broadcast::Sender<WorkerEvent>,
    kill: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;

            _ = kill.cancelled() => break,
            frame = outbound.recv() => frame,
        };
        let Some(frame) = frame else {
            break;
        };
        let _ = events.send(WorkerEvent::DataSend(frame.clone()));
        if let Err(e) = writer.send(ControlRequest::Remote(frame)).await {
            tracing::warn!(error = %e, "Failed to write to worker");
            break;
        }
    }
}

async fn forward_stderr(stderr: tokio::process::ChildStderr, pid: Option<u32>) {
    let mut lines = tokio::io::BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => tracing::info!(target: "isolet::worker", worker_pid = ?pid, "{}", line),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(worker_pid = ?pid, error = %e, "stderr read failed");
                break;
            }
        }
    }
}
