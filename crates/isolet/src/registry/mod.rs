//! Remote object registry.
//!
//! One [`Registry`] lives on each side of the control channel. It turns local values
//! into [`RemoteFrame`]s and back, keeps the tables that give callables, promises and
//! refs a life across the boundary, and matches results to the calls waiting on them.
//!
//! Outgoing frames are pushed into an unbounded channel; whoever owns the transport
//! drains it. Incoming frames are handed to [`Registry::receive`].

mod callable;
mod decode;
mod encode;
mod error;
mod link;
mod mapping;
mod promise;
mod proxy;
mod refs;
mod tables;
mod value;
pub mod wire;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};

pub use callable::{AsyncIter, Callable, Function, Hook, HookMode, Iter, IterStep};
pub use error::{CallError, RegistryError};
pub use promise::{ABANDONED, Promise, PromiseState, PromiseStatus, Resolver};
pub use refs::RefToken;
pub use value::{Array, Bytes, ErrorValue, Object, Value};
pub use wire::{CallablePolicy, Mapping, RemoteFrame, ResponseMapping};

use decode::Decoder;
use encode::EncodeContext;
use link::IdCounter;
use mapping::Flavor;
use tables::{CallableTable, PromiseTable};
use wire::{
    EncodedValue, HookAction, HookRequest, HookResult, Payload, PromiseUpdate, RemoteCall,
    RemoteCallResult, Settlement, UpdateStatus,
};

/// Work produced by a [`RemoteCallback`], run after the callback returns.
pub type Invocation = BoxFuture<'static, Result<Value, Value>>;

/// Answers `remoteCall` frames from the peer.
#[async_trait]
pub trait RemoteCallback: Send + Sync {
    /// Maps decoded call arguments to the work to run.
    async fn resolve(&self, args: Vec<Value>) -> Result<Invocation, Value>;
}

/// Per-call serialization settings.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub mapping: Mapping,
    pub response_mapping: ResponseMapping,
    pub hook_mode: HookMode,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mapping(mut self, mapping: Mapping) -> Self {
        self.mapping = mapping;
        self
    }

    pub fn with_response_mapping(mut self, response_mapping: ResponseMapping) -> Self {
        self.response_mapping = response_mapping;
        self
    }

    pub fn with_hook_mode(mut self, hook_mode: HookMode) -> Self {
        self.hook_mode = hook_mode;
        self
    }
}

/// Table sizes, for diagnostics and leak checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub pending_calls: usize,
    pub owned_callables: usize,
    pub live_proxies: usize,
    pub owned_promises: usize,
    pub live_shadows: usize,
    pub owned_refs: usize,
}

type CallReply = oneshot::Sender<Result<Value, CallError>>;
type HookReply = oneshot::Sender<Result<Value, Value>>;

#[derive(Default)]
pub(crate) struct RegistryState {
    closed: Option<String>,
    call_ids: IdCounter,
    pending_calls: HashMap<u64, CallReply>,
    hook_call_ids: IdCounter,
    hook_calls: HashMap<u64, HookReply>,
    /// Shared by promise handles and callable ids.
    pub(crate) hook_ids: IdCounter,
    pub(crate) promises: PromiseTable,
    pub(crate) callables: CallableTable,
    pub(crate) refs: refs::RefTable,
}

#[derive(Clone)]
enum Encoding {
    Json,
    Process,
    Link(HookMode),
    Ref,
}

impl Encoding {
    fn request(mapping: Mapping, hook_mode: HookMode) -> Self {
        match mapping {
            Mapping::Json => Self::Json,
            Mapping::Process => Self::Process,
            Mapping::Link => Self::Link(hook_mode),
        }
    }

    fn response(mapping: ResponseMapping) -> Option<Self> {
        match mapping {
            ResponseMapping::Json => Some(Self::Json),
            ResponseMapping::Process => Some(Self::Process),
            ResponseMapping::Link => Some(Self::Link(HookMode::default())),
            ResponseMapping::Ref => Some(Self::Ref),
            ResponseMapping::Ignore => None,
        }
    }

    /// Last-resort payload when neither the value nor its error could be encoded.
    fn fallback(&self) -> Payload {
        const MESSAGE: &str = "parse error";
        match self {
            Self::Json => Payload::Json(format!("{MESSAGE:?}")),
            Self::Process => Payload::Process(serde_json::Value::from(MESSAGE)),
            Self::Link(_) | Self::Ref => Payload::Link(EncodedValue::String(MESSAGE.to_owned())),
        }
    }
}

pub(crate) struct RegistryInner {
    outbound: mpsc::UnboundedSender<RemoteFrame>,
    callback: Option<Arc<dyn RemoteCallback>>,
    closed: AtomicBool,
    state: Mutex<RegistryState>,
}

impl RegistryInner {
    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        value::lock(&self.state)
    }

    /// Queues a frame that needs no encoding. Never takes the state lock, so it is safe
    /// from `Drop` impls.
    pub(crate) fn post(&self, frame: RemoteFrame) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if self.outbound.send(frame).is_err() {
            tracing::trace!("outbound channel closed, dropping frame");
        }
    }

    fn dispatch(&self, frame: RemoteFrame) -> Result<(), RegistryError> {
        if self.closed.load(Ordering::Acquire) {
            let reason = self.lock().closed.clone().unwrap_or_default();
            return Err(RegistryError::Closed(reason));
        }
        self.forward(frame)
    }

    /// [`Registry::dispatch`] for callers already holding the state lock.
    fn dispatch_locked(&self, state: &RegistryState, frame: RemoteFrame) -> Result<(), RegistryError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RegistryError::Closed(state.closed.clone().unwrap_or_default()));
        }
        self.forward(frame)
    }

    fn forward(&self, frame: RemoteFrame) -> Result<(), RegistryError> {
        self.outbound
            .send(frame)
            .map_err(|_| RegistryError::Closed("outbound channel closed".to_owned()))
    }

    async fn send<F>(
        self: &Arc<Self>,
        value: &Value,
        encoding: Encoding,
        frame: F,
    ) -> Result<(), RegistryError>
    where
        F: FnOnce(Payload) -> RemoteFrame + Send,
    {
        let payload = match encoding {
            Encoding::Json => Payload::Json(mapping::to_json_text(value)?),
            Encoding::Process => Payload::Process(
                mapping::to_plain(value, Flavor::Process)?.unwrap_or(serde_json::Value::Null),
            ),
            Encoding::Ref => return self.send_ref(value, frame),
            Encoding::Link(hook_mode) => return self.send_linked(value, hook_mode, frame).await,
        };
        self.dispatch(frame(payload))
    }

    fn send_ref<F>(&self, value: &Value, frame: F) -> Result<(), RegistryError>
    where
        F: FnOnce(Payload) -> RemoteFrame,
    {
        let id = {
            let mut state = self.lock();
            let id = state.refs.prepare(value);
            if let Some(id) = id {
                state.refs.commit(id, value.clone());
            }
            id
        };
        let sent = self.dispatch(frame(Payload::Ref(id)));
        if let (Err(_), Some(id)) = (&sent, id) {
            self.lock().refs.clear(id, 1);
        }
        sent
    }

    async fn send_linked<F>(
        self: &Arc<Self>,
        value: &Value,
        hook_mode: HookMode,
        frame: F,
    ) -> Result<(), RegistryError>
    where
        F: FnOnce(Payload) -> RemoteFrame + Send,
    {
        let mut ctx = EncodeContext::new(hook_mode);
        ctx.collect_policies(value);
        let parsed = {
            let mut state = self.lock();
            ctx.encode(&mut state, value)
        };
        let mut encoded = match parsed {
            Ok(encoded) => encoded,
            Err(error) => {
                ctx.rollback(&mut self.lock());
                return Err(error);
            }
        };

        // Promises that settle within the current turn are sent settled.
        tokio::task::yield_now().await;
        ctx.collect_pending_policies();

        // Promise states are checked and the frame queued under one lock, so a
        // `promiseUpdate` for a reused handle can never overtake this frame.
        {
            let mut state = self.lock();
            let sent = match ctx.prepare(&mut state, &mut encoded) {
                Ok(()) => self.dispatch_locked(&state, frame(Payload::Link(encoded))),
                Err(error) => Err(error),
            };
            if let Err(error) = sent {
                ctx.rollback(&mut state);
                return Err(error);
            }
        }
        for (handle, promise) in ctx.commit() {
            self.watch_promise(handle, promise);
        }
        Ok(())
    }

    /// Sends an outcome, degrading to the encode error and then to a fixed message.
    async fn send_outcome<F>(
        self: &Arc<Self>,
        outcome: Result<Value, Value>,
        encoding: Encoding,
        frame: F,
    ) where
        F: Fn(Settlement, Payload) -> RemoteFrame + Send + Sync,
    {
        let status = Settlement::of(&outcome);
        let (value, encoding) = match outcome {
            Ok(value) => (value, encoding),
            // Rejections are never kept behind a ref.
            Err(error) if matches!(encoding, Encoding::Ref) => {
                (error, Encoding::Link(HookMode::default()))
            }
            Err(error) => (error, encoding),
        };

        let error = match self
            .send(&value, encoding.clone(), |payload| frame(status, payload))
            .await
        {
            Ok(()) => return,
            Err(RegistryError::Closed(_)) => return,
            Err(error) => error,
        };
        tracing::warn!(%error, "result could not be encoded, sending the error instead");

        let error = match self
            .send(&error.to_value(), encoding.clone(), |payload| {
                frame(Settlement::Rejected, payload)
            })
            .await
        {
            Ok(()) => return,
            Err(RegistryError::Closed(_)) => return,
            Err(error) => error,
        };
        tracing::error!(%error, "error could not be encoded either");

        let _ = self.dispatch(frame(Settlement::Rejected, encoding.fallback()));
    }

    fn watch_promise(self: &Arc<Self>, handle: u64, promise: Promise) {
        let registry = Arc::downgrade(self);
        tokio::spawn(async move {
            let settled = promise.settled().await;
            let Some(registry) = registry.upgrade() else {
                return;
            };
            registry.lock().promises.disown(&promise);
            let outcome = match settled {
                PromiseState::Fulfilled(value) => Ok(value),
                PromiseState::Rejected(error) => Err(error),
                PromiseState::Abandoned | PromiseState::Pending => {
                    tracing::debug!(handle, "promise abandoned before settling");
                    registry.post(RemoteFrame::PromiseUpdate(PromiseUpdate {
                        id: handle,
                        status: UpdateStatus::Clear,
                        value: None,
                    }));
                    return;
                }
            };
            registry
                .send_outcome(
                    outcome,
                    Encoding::Link(HookMode::default()),
                    |status, payload| {
                        RemoteFrame::PromiseUpdate(PromiseUpdate {
                            id: handle,
                            status: match status {
                                Settlement::Fulfilled => UpdateStatus::Fulfilled,
                                Settlement::Rejected => UpdateStatus::Rejected,
                            },
                            value: Some(payload),
                        })
                    },
                )
                .await;
        });
    }

    fn decode_payload(
        self: &Arc<Self>,
        state: &mut RegistryState,
        payload: Payload,
    ) -> Result<Value, RegistryError> {
        match payload {
            Payload::Json(text) => mapping::from_json_text(&text),
            Payload::Process(plain) => Ok(mapping::from_plain(plain)),
            Payload::Link(encoded) => Decoder::decode(state, &Arc::downgrade(self), encoded),
            Payload::Ref(None) => Ok(Value::Undefined),
            Payload::Ref(Some(id)) => Ok(Value::Ref(state.refs.resolve(id, Arc::downgrade(self)))),
        }
    }

    /// Runs one hook action against the peer-owned callable `id`.
    pub(crate) async fn call_hook(
        self: &Arc<Self>,
        id: u64,
        policy: CallablePolicy,
        action: HookAction,
        this: Value,
        args: Vec<Value>,
    ) -> Result<Value, Value> {
        let mut context = Vec::with_capacity(args.len() + 1);
        context.push(if policy.no_this { Value::Undefined } else { this });
        context.extend(args);

        let (call_id, reply) = {
            let mut state = self.lock();
            if let Some(reason) = &state.closed {
                return Err(RegistryError::Closed(reason.clone()).to_value());
            }
            if policy.response_mapping == ResponseMapping::Ignore {
                (None, None)
            } else {
                let call_id = state.hook_call_ids.next();
                let (tx, rx) = oneshot::channel();
                state.hook_calls.insert(call_id, tx);
                (Some(call_id), Some(rx))
            }
        };

        let sent = self
            .send(
                &Value::from(context),
                Encoding::request(policy.mapping, HookMode::default()),
                |payload| {
                    RemoteFrame::Hook(HookRequest {
                        id,
                        action,
                        call_id,
                        call_context: Some(payload),
                        count: None,
                    })
                },
            )
            .await;
        if let Err(error) = sent {
            if let Some(call_id) = call_id {
                self.lock().hook_calls.remove(&call_id);
            }
            return Err(error.to_value());
        }

        match reply {
            None => Ok(Value::Undefined),
            Some(reply) => reply.await.unwrap_or_else(|_| {
                Err(RegistryError::Closed("hook call dropped".to_owned()).to_value())
            }),
        }
    }

    async fn on_remote_call(self: Arc<Self>, call: RemoteCall) {
        let RemoteCall {
            call_id,
            response_mapping,
            args,
        } = call;
        let decoded = {
            let mut state = self.lock();
            self.decode_payload(&mut state, args)
        };
        let outcome = match decoded {
            Ok(args) => self.invoke_callback(args).await,
            Err(error) => {
                tracing::warn!(%error, "could not decode remote call arguments");
                Err(error.to_value())
            }
        };
        let (Some(call_id), Some(encoding)) = (call_id, Encoding::response(response_mapping))
        else {
            return;
        };
        self.send_outcome(outcome, encoding, |status, value| {
            RemoteFrame::RemoteCallResult(RemoteCallResult {
                call_id,
                status,
                value,
            })
        })
        .await;
    }

    async fn invoke_callback(&self, args: Value) -> Result<Value, Value> {
        let Some(callback) = self.callback.clone() else {
            return Err(Value::Error(ErrorValue::type_error(
                "no remote callback installed",
            )));
        };
        let args = match args {
            Value::Array(array) => array.to_vec(),
            other => vec![other],
        };
        let invocation = callback.resolve(args).await?;
        flatten(invocation.await).await
    }

    fn on_call_result(self: &Arc<Self>, result: RemoteCallResult) {
        let RemoteCallResult {
            call_id,
            status,
            value,
        } = result;
        let delivered = {
            let mut state = self.lock();
            state
                .pending_calls
                .remove(&call_id)
                .map(|tx| (tx, self.decode_payload(&mut state, value)))
        };
        let Some((tx, decoded)) = delivered else {
            tracing::warn!(call_id, "result for unknown call");
            return;
        };
        let outcome = match (decoded, status) {
            (Ok(value), Settlement::Fulfilled) => Ok(value),
            (Ok(error), Settlement::Rejected) => Err(CallError::Rejected(error)),
            (Err(error), _) => Err(CallError::Registry(error)),
        };
        let _ = tx.send(outcome);
    }

    fn on_promise_update(self: &Arc<Self>, update: PromiseUpdate) {
        let PromiseUpdate { id, status, value } = update;
        let (promise, next) = {
            let mut state = self.lock();
            let Some(promise) = state.promises.take_shadow(id) else {
                tracing::debug!(promise_id = id, "update for a promise nobody holds");
                return;
            };
            let decoded = match value {
                Some(payload) => self.decode_payload(&mut state, payload),
                None => Ok(Value::Undefined),
            };
            let next = match (status, decoded) {
                (UpdateStatus::Clear, _) => PromiseState::Abandoned,
                (UpdateStatus::Fulfilled, Ok(value)) => PromiseState::Fulfilled(value),
                (UpdateStatus::Rejected, Ok(error)) => PromiseState::Rejected(error),
                (_, Err(error)) => PromiseState::Rejected(error.to_value()),
            };
            (promise, next)
        };
        promise.settle_with(next);
    }

    fn on_hook(self: &Arc<Self>, request: HookRequest) {
        if request.action == HookAction::Clear {
            self.lock()
                .callables
                .clear(request.id, request.count.unwrap_or(1));
            return;
        }
        let registry = self.clone();
        tokio::spawn(async move { registry.run_hook(request).await });
    }

    async fn run_hook(self: Arc<Self>, request: HookRequest) {
        let HookRequest {
            id,
            action,
            call_id,
            call_context,
            ..
        } = request;
        let resolved = {
            let mut state = self.lock();
            match state.callables.get(id) {
                None => Err(RegistryError::unknown("callable", id)),
                Some((hook, policy)) => {
                    let context = match call_context {
                        Some(payload) => self.decode_payload(&mut state, payload),
                        None => Ok(Value::Undefined),
                    };
                    context.map(|context| (hook, policy, context))
                }
            }
        };
        let (outcome, response_mapping) = match resolved {
            Ok((hook, policy, context)) => (
                run_hook_action(hook, action, context).await,
                policy.response_mapping,
            ),
            Err(error) => {
                tracing::warn!(hook_id = id, %error, "hook request failed");
                (Err(error.to_value()), ResponseMapping::Link)
            }
        };
        let Some(call_id) = call_id else {
            return;
        };
        let encoding =
            Encoding::response(response_mapping).unwrap_or(Encoding::Link(HookMode::default()));
        self.send_outcome(outcome, encoding, |status, value| {
            RemoteFrame::HookResult(HookResult {
                id,
                call_id,
                status,
                value,
            })
        })
        .await;
    }

    fn on_hook_result(self: &Arc<Self>, result: HookResult) {
        let HookResult {
            id,
            call_id,
            status,
            value,
        } = result;
        let delivered = {
            let mut state = self.lock();
            state
                .hook_calls
                .remove(&call_id)
                .map(|tx| (tx, self.decode_payload(&mut state, value)))
        };
        let Some((tx, decoded)) = delivered else {
            tracing::warn!(hook_id = id, call_id, "result for unknown hook call");
            return;
        };
        let outcome = match (decoded, status) {
            (Ok(value), Settlement::Fulfilled) => Ok(value),
            (Ok(error), Settlement::Rejected) => Err(error),
            (Err(error), _) => Err(error.to_value()),
        };
        let _ = tx.send(outcome);
    }
}

/// A promise returned from a call is awaited, never sent as the result itself.
async fn flatten(outcome: Result<Value, Value>) -> Result<Value, Value> {
    match outcome {
        Ok(Value::Promise(promise)) => promise.wait().await,
        other => other,
    }
}

async fn run_hook_action(hook: Hook, action: HookAction, context: Value) -> Result<Value, Value> {
    let mut items = match context {
        Value::Array(array) => array.to_vec().into_iter(),
        _ => Vec::new().into_iter(),
    };
    let this = items.next().unwrap_or_default();
    let args: Vec<Value> = items.collect();
    let first = args.first().cloned().unwrap_or_default();
    match (hook, action) {
        (Hook::Function(function), HookAction::Call) => flatten(function.call(this, args).await).await,
        (Hook::Iter(iter), HookAction::Next) => iter.next(first).await.map(IterStep::into_value),
        (Hook::Iter(iter), HookAction::Throw) => iter.throw(first).await.map(IterStep::into_value),
        (Hook::Iter(iter), HookAction::Return) => {
            iter.return_value(first).await.map(IterStep::into_value)
        }
        (hook, action) => Err(Value::Error(ErrorValue::type_error(format!(
            "{action:?} is not supported on {}",
            match hook {
                Hook::Function(_) => "a function",
                Hook::Iter(_) => "an iterator",
            }
        )))),
    }
}

/// One side of the registry.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Registry {
    /// Registry without a callback: incoming calls are rejected.
    pub fn new(outbound: mpsc::UnboundedSender<RemoteFrame>) -> Self {
        Self::build(outbound, None)
    }

    pub fn with_callback(
        outbound: mpsc::UnboundedSender<RemoteFrame>,
        callback: Arc<dyn RemoteCallback>,
    ) -> Self {
        Self::build(outbound, Some(callback))
    }

    fn build(
        outbound: mpsc::UnboundedSender<RemoteFrame>,
        callback: Option<Arc<dyn RemoteCallback>>,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                outbound,
                callback,
                closed: AtomicBool::new(false),
                state: Mutex::new(RegistryState::default()),
            }),
        }
    }

    /// Calls the peer's callback with `args` and waits for its answer.
    ///
    /// With [`ResponseMapping::Ignore`] this returns `undefined` as soon as the frame is
    /// queued.
    pub async fn call_remote(
        &self,
        args: Vec<Value>,
        options: CallOptions,
    ) -> Result<Value, CallError> {
        let CallOptions {
            mapping,
            response_mapping,
            hook_mode,
        } = options;
        let (call_id, reply) = {
            let mut state = self.inner.lock();
            if let Some(reason) = &state.closed {
                return Err(RegistryError::Closed(reason.clone()).into());
            }
            if response_mapping == ResponseMapping::Ignore {
                (None, None)
            } else {
                let call_id = state.call_ids.next();
                let (tx, rx) = oneshot::channel();
                state.pending_calls.insert(call_id, tx);
                (Some(call_id), Some(rx))
            }
        };

        let sent = self
            .inner
            .send(
                &Value::from(args),
                Encoding::request(mapping, hook_mode),
                |args| {
                    RemoteFrame::RemoteCall(RemoteCall {
                        call_id,
                        response_mapping,
                        args,
                    })
                },
            )
            .await;
        if let Err(error) = sent {
            if let Some(call_id) = call_id {
                self.inner.lock().pending_calls.remove(&call_id);
            }
            return Err(error.into());
        }

        match reply {
            None => Ok(Value::Undefined),
            Some(reply) => reply.await.unwrap_or_else(|_| {
                Err(RegistryError::Closed("call dropped".to_owned()).into())
            }),
        }
    }

    /// Feeds one frame from the peer. Calls are run on spawned tasks.
    pub fn receive(&self, frame: RemoteFrame) {
        tracing::trace!(kind = frame.kind(), "remote frame received");
        match frame {
            RemoteFrame::RemoteCall(call) => {
                let inner = self.inner.clone();
                tokio::spawn(inner.on_remote_call(call));
            }
            RemoteFrame::RemoteCallResult(result) => self.inner.on_call_result(result),
            RemoteFrame::PromiseUpdate(update) => self.inner.on_promise_update(update),
            RemoteFrame::Hook(request) => self.inner.on_hook(request),
            RemoteFrame::HookResult(result) => self.inner.on_hook_result(result),
            RemoteFrame::RefClear(clear) => self.inner.lock().refs.clear(clear.id, clear.count),
        }
    }

    /// Rejects everything still waiting on the peer and refuses further sends.
    pub fn close(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let (calls, hooks, shadows) = {
            let mut state = self.inner.lock();
            if state.closed.is_some() {
                return;
            }
            state.closed = Some(reason.clone());
            self.inner.closed.store(true, Ordering::Release);
            (
                state.pending_calls.drain().map(|(_, tx)| tx).collect::<Vec<_>>(),
                state.hook_calls.drain().map(|(_, tx)| tx).collect::<Vec<_>>(),
                state.promises.drain_shadows(),
            )
        };
        tracing::debug!(
            %reason,
            calls = calls.len(),
            hook_calls = hooks.len(),
            promises = shadows.len(),
            "registry closed"
        );
        let error = RegistryError::Closed(reason.clone());
        for tx in calls {
            let _ = tx.send(Err(RegistryError::Closed(reason.clone()).into()));
        }
        for tx in hooks {
            let _ = tx.send(Err(error.to_value()));
        }
        for promise in shadows {
            promise.settle_with(PromiseState::Rejected(error.to_value()));
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> RegistryStats {
        let state = self.inner.lock();
        RegistryStats {
            pending_calls: state.pending_calls.len() + state.hook_calls.len(),
            owned_callables: state.callables.owned_len(),
            live_proxies: state.callables.proxy_len(),
            owned_promises: state.promises.owned_len(),
            live_shadows: state.promises.shadow_len(),
            owned_refs: state.refs.owned_len(),
        }
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use futures::FutureExt;

    /// Named functions the peer can call as `[name, ...args]`.
    #[derive(Default)]
    struct Catalog(HashMap<&'static str, Function>);

    impl Catalog {
        fn with(mut self, name: &'static str, function: Function) -> Self {
            self.0.insert(name, function);
            self
        }
    }

    #[async_trait]
    impl RemoteCallback for Catalog {
        async fn resolve(&self, args: Vec<Value>) -> Result<Invocation, Value> {
            let mut args = args.into_iter();
            let name = args.next().unwrap_or_default();
            let function = name
                .as_str()
                .and_then(|name| self.0.get(name))
                .cloned()
                .ok_or_else(|| Value::from(format!("unknown function {name}")))?;
            let rest: Vec<Value> = args.collect();
            Ok(async move { function.call(Value::Undefined, rest).await }.boxed())
        }
    }

    /// Moves frames from one registry to the other through their JSON text form.
    fn pump(mut rx: mpsc::UnboundedReceiver<RemoteFrame>, to: Registry) {
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let text = serde_json::to_string(&frame).unwrap();
                to.receive(serde_json::from_str(&text).unwrap());
            }
        });
    }

    fn pair(catalog: Catalog) -> (Registry, Registry) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let a = Registry::new(a_tx);
        let b = Registry::with_callback(b_tx, Arc::new(catalog));
        pump(a_rx, b.clone());
        pump(b_rx, a.clone());
        (a, b)
    }

    async fn eventually(check: impl Fn() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition never became true");
    }

    fn numbers(args: &[Value]) -> f64 {
        args.iter().filter_map(Value::as_f64).sum()
    }

    fn add() -> Function {
        Function::from_fn("add", 2, |_, args| async move { Ok(Value::Number(numbers(&args))) })
    }

    fn name(value: &Value) -> Option<String> {
        value.as_error().map(|e| e.name.clone())
    }

    #[tokio::test]
    async fn calls_reach_the_callback() {
        let (a, _b) = pair(Catalog::default().with("add", add()));
        let result = a
            .call_remote(vec!["add".into(), 2.into(), 3.into()], CallOptions::new())
            .await
            .unwrap();
        assert_eq!(result, Value::Number(5.0));
    }

    #[tokio::test]
    async fn json_mapping_is_lossy() {
        let echo = Function::from_fn("echo", 1, |_, args| async move {
            Ok(args.into_iter().next().unwrap_or_default())
        });
        let (a, _b) = pair(Catalog::default().with("echo", echo));
        let result = a
            .call_remote(
                vec!["echo".into(), Value::Number(f64::NAN)],
                CallOptions::new()
                    .with_mapping(Mapping::Json)
                    .with_response_mapping(ResponseMapping::Json),
            )
            .await
            .unwrap();
        assert_eq!(result, Value::Null);
    }

    #[tokio::test]
    async fn link_mapping_keeps_cycles() {
        let echo = Function::from_fn("echo", 1, |_, args| async move {
            Ok(args.into_iter().next().unwrap_or_default())
        });
        let (a, _b) = pair(Catalog::default().with("echo", echo));
        let object = Object::new();
        object.insert("self", Value::Object(object.clone()));
        let result = a
            .call_remote(vec!["echo".into(), Value::Object(object.clone())], CallOptions::new())
            .await
            .unwrap();
        assert_ne!(result, Value::Object(object));
        assert_eq!(result.member("self"), Some(result.clone()));
    }

    #[tokio::test]
    async fn rejections_come_back_as_errors() {
        let fail = Function::from_fn("fail", 0, |_, _| async {
            Err(Value::Error(ErrorValue::new("RangeError", "too big")))
        });
        let (a, _b) = pair(Catalog::default().with("fail", fail));
        let error = a
            .call_remote(vec!["fail".into()], CallOptions::new())
            .await
            .unwrap_err();
        match error {
            CallError::Rejected(value) => {
                assert_eq!(value, Value::Error(ErrorValue::new("RangeError", "too big")))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_method_rejects() {
        let (a, _b) = pair(Catalog::default());
        let error = a
            .call_remote(vec!["nope".into()], CallOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(error, CallError::Rejected(Value::String(m)) if m.contains("nope")));
    }

    #[tokio::test]
    async fn callbacks_passed_as_arguments_run_locally() {
        let apply = Function::from_fn("apply", 1, |_, args| async move {
            let mut args = args.into_iter();
            let target = args.next().unwrap_or_default();
            let function = target.as_function().cloned().ok_or(Value::Null)?;
            function.call(Value::Undefined, args.collect()).await
        });
        let (a, b) = pair(Catalog::default().with("apply", apply));
        let result = a
            .call_remote(
                vec!["apply".into(), Value::Function(add()), 4.into(), 5.into()],
                CallOptions::new(),
            )
            .await
            .unwrap();
        assert_eq!(result, Value::Number(9.0));
        eventually(|| a.stats().owned_callables == 0).await;
        assert_eq!(b.stats().live_proxies, 0);
    }

    #[tokio::test]
    async fn remote_iterators_step_and_release() {
        let range = Function::from_fn("range", 1, |_, args| async move {
            let n = numbers(&args) as u32;
            Ok(Value::Iter(Iter::from_values((0..n).map(Value::from))))
        });
        let (a, b) = pair(Catalog::default().with("range", range));
        let result = a
            .call_remote(vec!["range".into(), 3.into()], CallOptions::new())
            .await
            .unwrap();
        let iter = result.as_iter().unwrap();
        assert_eq!(
            iter.collect().await.unwrap(),
            vec![Value::from(0), Value::from(1), Value::from(2)]
        );
        eventually(|| b.stats().owned_callables == 0).await;
        assert!(iter.next(Value::Undefined).await.unwrap().done);
    }

    #[tokio::test]
    async fn dropped_proxies_release_the_owner() {
        let make = Function::from_fn("make", 0, |_, _| async { Ok(Value::Function(add())) });
        let (a, b) = pair(Catalog::default().with("make", make));
        let result = a
            .call_remote(vec!["make".into()], CallOptions::new())
            .await
            .unwrap();
        let function = result.as_function().cloned().unwrap();
        assert_eq!(
            function
                .call(Value::Undefined, vec![1.into(), 1.into()])
                .await,
            Ok(Value::Number(2.0))
        );
        assert_eq!(b.stats().owned_callables, 1);
        drop((function, result));
        eventually(|| b.stats().owned_callables == 0).await;
    }

    #[tokio::test]
    async fn explicit_release_is_idempotent() {
        let make = Function::from_fn("make", 0, |_, _| async { Ok(Value::Function(add())) });
        let (a, b) = pair(Catalog::default().with("make", make));
        let result = a
            .call_remote(vec!["make".into()], CallOptions::new())
            .await
            .unwrap();
        let function = result.as_function().unwrap();
        function.release();
        function.release();
        eventually(|| b.stats().owned_callables == 0).await;
        let error = function.call(Value::Undefined, vec![]).await.unwrap_err();
        assert_eq!(name(&error).as_deref(), Some("TypeError"));
    }

    #[tokio::test]
    async fn pending_promises_settle_across_the_boundary() {
        let wait = Function::from_fn("wait", 1, |_, args| async move {
            let promise = args.first().and_then(Value::as_promise).cloned().ok_or(Value::Null)?;
            promise.wait().await
        });
        let (a, b) = pair(Catalog::default().with("wait", wait));
        let (promise, resolver) = Promise::pending();
        let call = {
            let a = a.clone();
            tokio::spawn(async move {
                a.call_remote(vec!["wait".into(), Value::Promise(promise)], CallOptions::new())
                    .await
            })
        };
        eventually(|| b.stats().live_shadows == 1).await;
        assert_eq!(a.stats().owned_promises, 1);
        resolver.resolve("late");
        assert_eq!(call.await.unwrap().unwrap(), Value::from("late"));
        assert_eq!(a.stats().owned_promises, 0);
    }

    #[tokio::test]
    async fn resending_a_promise_that_settled_does_not_hang() {
        let hold = Function::from_fn("hold", 1, |_, _| async { Ok(Value::Undefined) });
        let wait = Function::from_fn("wait", 1, |_, args| async move {
            let promise = args.first().and_then(Value::as_promise).cloned().ok_or(Value::Null)?;
            promise.wait().await
        });
        let (a, _b) = pair(Catalog::default().with("hold", hold).with("wait", wait));
        let (promise, resolver) = Promise::pending();
        a.call_remote(vec!["hold".into(), Value::Promise(promise.clone())], CallOptions::new())
            .await
            .unwrap();
        assert_eq!(a.stats().owned_promises, 1);

        // Settles while still owned; the second send must carry the outcome.
        resolver.resolve("done");
        let call = a.call_remote(vec!["wait".into(), Value::Promise(promise)], CallOptions::new());
        let result = tokio::time::timeout(Duration::from_secs(2), call)
            .await
            .expect("peer never saw the promise settle");
        assert_eq!(result.unwrap(), Value::from("done"));
        eventually(|| a.stats().owned_promises == 0).await;
    }

    #[tokio::test]
    async fn computed_policies_may_use_the_registry() {
        let apply = Function::from_fn("apply", 1, |_, args| async move {
            let mut args = args.into_iter();
            let target = args.next().unwrap_or_default();
            let function = target.as_function().cloned().ok_or(Value::Null)?;
            function.call(Value::Undefined, args.collect()).await
        });
        let (a, _b) = pair(Catalog::default().with("apply", apply));
        let seen = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mode = {
            let a = a.clone();
            let seen = seen.clone();
            HookMode::computed(move |_| {
                seen.store(a.stats().owned_callables + 1, Ordering::SeqCst);
                CallablePolicy::default()
            })
        };
        let call = a.call_remote(
            vec!["apply".into(), Value::Function(add()), 4.into(), 5.into()],
            CallOptions::new().with_hook_mode(mode),
        );
        let result = tokio::time::timeout(Duration::from_secs(2), call)
            .await
            .expect("policy callback blocked the send");
        assert_eq!(result.unwrap(), Value::Number(9.0));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn promises_in_results_become_shadows() {
        let later = Function::from_fn("later", 0, |_, _| async {
            let promise = Promise::spawn(async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(Value::from(42))
            });
            Ok(Value::Object(Object::from_entries([("answer", Value::Promise(promise))])))
        });
        let (a, _b) = pair(Catalog::default().with("later", later));
        let result = a
            .call_remote(vec!["later".into()], CallOptions::new())
            .await
            .unwrap();
        let promise = result.member("answer").and_then(|p| p.as_promise().cloned()).unwrap();
        assert!(promise.is_pending());
        assert_eq!(promise.wait().await, Ok(Value::from(42)));
    }

    #[tokio::test]
    async fn returned_promises_are_awaited() {
        let later = Function::from_fn("later", 0, |_, _| async {
            Ok(Value::Promise(Promise::spawn(async { Ok(Value::from("flat")) })))
        });
        let (a, _b) = pair(Catalog::default().with("later", later));
        let result = a
            .call_remote(vec!["later".into()], CallOptions::new())
            .await
            .unwrap();
        assert_eq!(result, Value::from("flat"));
    }

    #[tokio::test]
    async fn abandoned_promises_reject_the_holder() {
        let abandon = Function::from_fn("abandon", 0, |_, _| async {
            let (promise, resolver) = Promise::pending();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                drop(resolver);
            });
            Ok(Value::from(vec![Value::Promise(promise)]))
        });
        let (a, _b) = pair(Catalog::default().with("abandon", abandon));
        let result = a
            .call_remote(vec!["abandon".into()], CallOptions::new())
            .await
            .unwrap();
        let promise = result.member("0").and_then(|p| p.as_promise().cloned()).unwrap();
        let error = promise.wait().await.unwrap_err();
        assert_eq!(name(&error).as_deref(), Some(ABANDONED));
    }

    #[tokio::test]
    async fn refs_resolve_to_the_original_value() {
        let kept = Object::from_entries([("secret", Value::from(1))]);
        let make = {
            let kept = kept.clone();
            Function::from_fn("make", 0, move |_, _| {
                let kept = kept.clone();
                async move { Ok(Value::Object(kept)) }
            })
        };
        let same = {
            let kept = kept.clone();
            Function::from_fn("same", 1, move |_, args| {
                let kept = Value::Object(kept.clone());
                async move { Ok(Value::Bool(args.first() == Some(&kept))) }
            })
        };
        let (a, b) = pair(Catalog::default().with("make", make).with("same", same));
        let token = a
            .call_remote(
                vec!["make".into()],
                CallOptions::new().with_response_mapping(ResponseMapping::Ref),
            )
            .await
            .unwrap();
        assert!(token.as_ref_token().is_some());
        assert_eq!(b.stats().owned_refs, 1);
        let same = a
            .call_remote(vec!["same".into(), token.clone()], CallOptions::new())
            .await
            .unwrap();
        assert_eq!(same, Value::Bool(true));
        drop(token);
        eventually(|| b.stats().owned_refs == 0).await;
    }

    #[tokio::test]
    async fn ignored_responses_return_immediately() {
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let count = {
            let hits = hits.clone();
            Function::from_fn("count", 0, move |_, _| {
                hits.fetch_add(1, Ordering::SeqCst);
                async { Ok(Value::Undefined) }
            })
        };
        let (a, _b) = pair(Catalog::default().with("count", count));
        let result = a
            .call_remote(
                vec!["count".into()],
                CallOptions::new().with_response_mapping(ResponseMapping::Ignore),
            )
            .await
            .unwrap();
        assert_eq!(result, Value::Undefined);
        eventually(|| hits.load(Ordering::SeqCst) == 1).await;
        assert_eq!(a.stats().pending_calls, 0);
    }

    #[tokio::test]
    async fn close_rejects_waiting_calls() {
        let hang = Function::from_fn("hang", 0, |_, _| futures::future::pending());
        let (a, _b) = pair(Catalog::default().with("hang", hang));
        let call = {
            let a = a.clone();
            tokio::spawn(async move { a.call_remote(vec!["hang".into()], CallOptions::new()).await })
        };
        eventually(|| a.stats().pending_calls == 1).await;
        a.close("worker exited");
        let error = call.await.unwrap().unwrap_err();
        assert!(matches!(error, CallError::Registry(RegistryError::Closed(r)) if r == "worker exited"));
        assert!(matches!(
            a.call_remote(vec![], CallOptions::new()).await,
            Err(CallError::Registry(RegistryError::Closed(_)))
        ));
    }

    #[tokio::test]
    async fn unencodable_results_fall_back_to_the_error() {
        let cyclic = Function::from_fn("cyclic", 0, |_, _| async {
            let array = Array::new();
            array.push(Value::Array(array.clone()));
            Ok(Value::Array(array))
        });
        let (a, _b) = pair(Catalog::default().with("cyclic", cyclic));
        let error = a
            .call_remote(
                vec!["cyclic".into()],
                CallOptions::new().with_response_mapping(ResponseMapping::Json),
            )
            .await
            .unwrap_err();
        let CallError::Rejected(value) = error else {
            panic!("expected a rejection");
        };
        assert_eq!(value.member("name"), Some(Value::from("DataCloneError")));
    }

    #[tokio::test]
    async fn hooks_for_unknown_ids_are_rejected() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let registry = Registry::new(tx);
        registry.receive(RemoteFrame::Hook(HookRequest {
            id: 77,
            action: HookAction::Call,
            call_id: Some(0),
            call_context: None,
            count: None,
        }));
        let Some(RemoteFrame::HookResult(result)) = rx.recv().await else {
            panic!("expected a hook result");
        };
        assert_eq!(result.status, Settlement::Rejected);
        insta::assert_json_snapshot!(result.value, @r#"
        {
          "mapping": "link",
          "value": {
            "type": "value",
            "value": {
              "kind": "error",
              "name": "ProtocolError",
              "message": "no callable with id 77"
            }
          }
        }
        "#);
    }
}
