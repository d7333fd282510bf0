//! Holder-side stand-ins for callables owned by the peer.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;

use super::RegistryInner;
use super::callable::{AsyncIter, Callable, IterStep};
use super::value::{ErrorValue, Value};
use super::wire::{CallablePolicy, HookAction, HookRequest, RemoteFrame, ResponseMapping};

pub(crate) struct ProxyCore {
    pub(crate) id: u64,
    pub(crate) policy: CallablePolicy,
    /// Times this holder decoded the id; reported back on release.
    received: AtomicU64,
    released: AtomicBool,
    registry: Weak<RegistryInner>,
}

impl ProxyCore {
    fn new(id: u64, policy: CallablePolicy, registry: Weak<RegistryInner>) -> Self {
        Self {
            id,
            policy,
            received: AtomicU64::new(1),
            released: AtomicBool::new(false),
            registry,
        }
    }

    pub(crate) fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    pub(crate) fn received_again(&self) {
        self.received.fetch_add(1, Ordering::AcqRel);
    }

    /// Tells the owner this holder is done. Runs once.
    pub(crate) fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.post(RemoteFrame::Hook(HookRequest::clear(
                self.id,
                self.received.load(Ordering::Acquire),
            )));
        }
    }

    async fn invoke(&self, action: HookAction, this: Value, args: Vec<Value>) -> Result<Value, Value> {
        let Some(registry) = self.registry.upgrade() else {
            return Err(Value::Error(ErrorValue::new(
                "WorkerClosed",
                "registry is gone",
            )));
        };
        registry
            .call_hook(self.id, self.policy, action, this, args)
            .await
    }
}

impl Drop for ProxyCore {
    fn drop(&mut self) {
        self.release();
    }
}

pub(crate) struct RemoteFunction {
    pub(crate) core: ProxyCore,
    name: String,
    arity: u32,
}

impl RemoteFunction {
    pub(crate) fn new(
        id: u64,
        policy: CallablePolicy,
        name: String,
        arity: u32,
        registry: Weak<RegistryInner>,
    ) -> Arc<Self> {
        Arc::new(Self {
            core: ProxyCore::new(id, policy, registry),
            name,
            arity,
        })
    }
}

#[async_trait]
impl Callable for RemoteFunction {
    async fn call(&self, this: Value, args: Vec<Value>) -> Result<Value, Value> {
        if self.core.is_released() {
            return Err(Value::Error(ErrorValue::type_error(format!(
                "remote function {} was released",
                self.core.id
            ))));
        }
        self.core.invoke(HookAction::Call, this, args).await
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn arity(&self) -> u32 {
        self.arity
    }

    fn release(&self) {
        self.core.release();
    }
}

pub(crate) struct RemoteIterator {
    pub(crate) core: ProxyCore,
}

impl RemoteIterator {
    pub(crate) fn new(id: u64, mut policy: CallablePolicy, registry: Weak<RegistryInner>) -> Arc<Self> {
        // A step result is always needed.
        if policy.response_mapping == ResponseMapping::Ignore {
            policy.response_mapping = ResponseMapping::Link;
        }
        Arc::new(Self {
            core: ProxyCore::new(id, policy, registry),
        })
    }

    async fn step(&self, action: HookAction, arg: Value) -> Result<IterStep, Value> {
        if self.core.is_released() {
            return Ok(IterStep::done(Value::Undefined));
        }
        match self.core.invoke(action, Value::Undefined, vec![arg]).await {
            Ok(result) => {
                let step = IterStep::from_value(&result);
                if !matches!(step, Ok(IterStep { done: false, .. })) {
                    self.core.release();
                }
                step
            }
            Err(error) => {
                self.core.release();
                Err(error)
            }
        }
    }
}

#[async_trait]
impl AsyncIter for RemoteIterator {
    async fn next(&self, arg: Value) -> Result<IterStep, Value> {
        self.step(HookAction::Next, arg).await
    }

    async fn throw(&self, error: Value) -> Result<IterStep, Value> {
        if self.core.is_released() {
            return Err(error);
        }
        self.step(HookAction::Throw, error).await
    }

    async fn return_value(&self, value: Value) -> Result<IterStep, Value> {
        if self.core.is_released() {
            return Ok(IterStep::done(value));
        }
        self.step(HookAction::Return, value).await
    }

    fn release(&self) {
        self.core.release();
    }
}

/// Entry in the holder's proxy cache.
pub(crate) enum ProxyRef {
    Function(Weak<RemoteFunction>),
    Iter(Weak<RemoteIterator>),
}

impl ProxyRef {
    pub(crate) fn is_alive(&self) -> bool {
        match self {
            ProxyRef::Function(f) => f.strong_count() > 0,
            ProxyRef::Iter(i) => i.strong_count() > 0,
        }
    }
}
