//! Child side of the control channel.
//!
//! [`run_worker`] is what a worker binary calls from `main`: it applies the resource limits
//! from its flags and then serves the protocol on stdin/stdout. [`serve`] is the protocol loop
//! itself and works over any AsyncRead/AsyncWrite pair.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::{Framing, JsonCodec};
use crate::bridge::protocol::{
    AliveReport, ControlRequest, ControlResponse, InitParams, ModulesRequest,
};
use crate::config::WorkerArgs;
use crate::registry::{ErrorValue, Function, Invocation, Registry, RemoteCallback, Value};
use crate::resources::{UsageSampler, apply_limits};

/// Loads foreign code units and exposes their exports.
#[async_trait]
pub trait ExecutionHost: Send + Sync {
    /// Creates the units described in `request`. `Err` carries the message reported back
    /// in `createModulesDone`.
    async fn create_modules(&self, request: ModulesRequest) -> Result<(), String>;

    /// Looks up `identifier.method`. A rejection value explains what is missing.
    fn resolve(&self, identifier: &str, method: &str) -> Result<Function, Value>;
}

/// Answers `remoteCall` frames of the shape `[identifier, method, this, args]`.
pub struct HostCallback {
    host: Arc<dyn ExecutionHost>,
}

impl HostCallback {
    pub fn new(host: Arc<dyn ExecutionHost>) -> Self {
        Self { host }
    }
}

fn type_error(message: impl Into<String>) -> Value {
    Value::Error(ErrorValue::type_error(message))
}

#[async_trait]
impl RemoteCallback for HostCallback {
    async fn resolve(&self, args: Vec<Value>) -> Result<Invocation, Value> {
        let mut args = args.into_iter();
        let identifier = args.next().unwrap_or_default();
        let method = args.next().unwrap_or_default();
        let this = args.next().unwrap_or_default();
        let call_args = match args.next() {
            Some(Value::Array(array)) => array.to_vec(),
            None | Some(Value::Undefined) => Vec::new(),
            Some(other) => {
                return Err(type_error(format!(
                    "call arguments must be an array, got {}",
                    other.type_name()
                )));
            }
        };
        let (Some(identifier), Some(method)) = (identifier.as_str(), method.as_str()) else {
            return Err(type_error("unit identifier and method must be strings"));
        };
        tracing::debug!(unit = identifier, method, "Invoking export");
        let function = self.host.resolve(identifier, method)?;
        Ok(async move { function.call(this, call_args).await }.boxed())
    }
}

/// Applies the limits in `args` and serves the protocol on stdin/stdout.
pub async fn run_worker(host: Arc<dyn ExecutionHost>, args: WorkerArgs) -> std::io::Result<()> {
    if let Err(e) = apply_limits(&args.limits) {
        tracing::warn!(error = %e, "Could not apply resource limits");
    }
    serve(host, args.framing, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Runs the worker side of the protocol until the controller closes the channel.
pub async fn serve<R, W>(
    host: Arc<dyn ExecutionHost>,
    framing: Framing,
    input: R,
    output: W,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let shutdown = CancellationToken::new();
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(run_writer(
        FramedWrite::new(output, JsonCodec::<ControlResponse>::with_framing(framing)),
        control_rx,
        shutdown.clone(),
    ));

    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel();
    let registry = Registry::with_callback(frame_tx, Arc::new(HostCallback::new(host.clone())));
    {
        let control_tx = control_tx.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    biased;

                    _ = shutdown.cancelled() => break,
                    frame = frame_rx.recv() => frame,
                };
                let Some(frame) = frame else {
                    break;
                };
                if control_tx.send(ControlResponse::Remote(frame)).is_err() {
                    break;
                }
            }
        });
    }

    let _ = control_tx.send(ControlResponse::ProcessReady);

    let mut reader = FramedRead::new(input, JsonCodec::<ControlRequest>::with_framing(framing));
    let mut initialized = false;
    let result = loop {
        match reader.next().await {
            Some(Ok(ControlRequest::Init(params))) => {
                if initialized {
                    tracing::warn!("Ignoring repeated init");
                    continue;
                }
                initialized = true;
                tracing::debug!(period_ms = params.check_alive_period, "Init received");
                tokio::spawn(report_alive(params, control_tx.clone(), shutdown.clone()));
                let _ = control_tx.send(ControlResponse::InitDone);
            }
            Some(Ok(ControlRequest::CreateModules(request))) => {
                let units = request.units.len();
                let outcome = host.create_modules(request).await.err();
                match &outcome {
                    None => tracing::info!(units, "Units created"),
                    Some(message) => tracing::warn!(%message, "Unit creation failed"),
                }
                let _ = control_tx.send(ControlResponse::CreateModulesDone(outcome));
            }
            Some(Ok(ControlRequest::Remote(frame))) => registry.receive(frame),
            Some(Err(e)) => {
                tracing::error!(error = %e, "Control channel error");
                break Err(e);
            }
            None => {
                tracing::debug!("Control channel closed");
                break Ok(());
            }
        }
    };

    registry.close("control channel closed");
    shutdown.cancel();
    drop(control_tx);
    let _ = writer.await;
    result
}

async fn run_writer<W>(
    mut writer: FramedWrite<W, JsonCodec<ControlResponse>>,
    mut rx: mpsc::UnboundedReceiver<ControlResponse>,
    shutdown: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let msg = tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,
            msg = rx.recv() => msg,
        };
        let Some(msg) = msg else {
            break;
        };
        if let Err(e) = writer.send(msg).await {
            tracing::warn!(error = %e, "Failed to write control message");
            break;
        }
    }
}

async fn report_alive(
    params: InitParams,
    control_tx: mpsc::UnboundedSender<ControlResponse>,
    shutdown: CancellationToken,
) {
    let period = Duration::from_millis(params.check_alive_period.max(1));
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut sampler = UsageSampler::new();
    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        let (cpu_usage, memory_usage) = sampler.sample();
        let report = AliveReport {
            key: params.key.clone(),
            cpu_usage,
            memory_usage,
        };
        if control_tx.send(ControlResponse::AliveReport(report)).is_err() {
            break;
        }
    }
}
