//! Callables and async iterators that can cross the boundary by reference.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};

use super::value::{ErrorValue, Object, Value};
use super::wire::CallablePolicy;

#[async_trait]
pub trait Callable: Send + Sync {
    async fn call(&self, this: Value, args: Vec<Value>) -> Result<Value, Value>;

    fn name(&self) -> &str {
        ""
    }

    fn arity(&self) -> u32 {
        0
    }

    /// Lets go of a handle owned by the peer. No-op for local callables.
    fn release(&self) {}
}

/// One step of an async iterator.
#[derive(Debug, Clone, PartialEq)]
pub struct IterStep {
    pub value: Value,
    pub done: bool,
}

impl IterStep {
    pub fn yielded(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            done: false,
        }
    }

    pub fn done(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            done: true,
        }
    }

    /// `{value, done}` object, the shape iterator results travel in.
    pub fn into_value(self) -> Value {
        Value::Object(Object::from_entries([
            ("value", self.value),
            ("done", Value::Bool(self.done)),
        ]))
    }

    pub fn from_value(value: &Value) -> Result<Self, Value> {
        let object = value.as_object().ok_or_else(|| {
            Value::Error(ErrorValue::type_error(format!(
                "iterator result {} is not an object",
                value.type_name()
            )))
        })?;
        Ok(Self {
            value: object.get("value").unwrap_or_default(),
            done: object
                .get("done")
                .and_then(|d| d.as_bool())
                .unwrap_or(false),
        })
    }
}

#[async_trait]
pub trait AsyncIter: Send + Sync {
    async fn next(&self, arg: Value) -> Result<IterStep, Value>;

    async fn throw(&self, error: Value) -> Result<IterStep, Value> {
        Err(error)
    }

    async fn return_value(&self, value: Value) -> Result<IterStep, Value> {
        Ok(IterStep::done(value))
    }

    fn release(&self) {}
}

/// Shared handle to a [`Callable`].
#[derive(Clone)]
pub struct Function {
    inner: Arc<dyn Callable>,
}

impl Function {
    pub fn new(callable: impl Callable + 'static) -> Self {
        Self {
            inner: Arc::new(callable),
        }
    }

    pub fn from_arc(inner: Arc<dyn Callable>) -> Self {
        Self { inner }
    }

    /// Wraps an async closure taking `(this, args)`.
    pub fn from_fn<F, Fut>(name: impl Into<String>, arity: u32, f: F) -> Self
    where
        F: Fn(Value, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, Value>> + Send + 'static,
    {
        Self::new(ClosureCallable {
            name: name.into(),
            arity,
            f,
        })
    }

    pub async fn call(&self, this: Value, args: Vec<Value>) -> Result<Value, Value> {
        self.inner.call(this, args).await
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn arity(&self) -> u32 {
        self.inner.arity()
    }

    /// Releases a remote function early. Later calls reject; idempotent.
    pub fn release(&self) {
        self.inner.release();
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }

    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function")
            .field("name", &self.name())
            .field("arity", &self.arity())
            .finish()
    }
}

struct ClosureCallable<F> {
    name: String,
    arity: u32,
    f: F,
}

#[async_trait]
impl<F, Fut> Callable for ClosureCallable<F>
where
    F: Fn(Value, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, Value>> + Send + 'static,
{
    async fn call(&self, this: Value, args: Vec<Value>) -> Result<Value, Value> {
        (self.f)(this, args).await
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn arity(&self) -> u32 {
        self.arity
    }
}

/// Shared handle to an [`AsyncIter`].
#[derive(Clone)]
pub struct Iter {
    inner: Arc<dyn AsyncIter>,
}

impl Iter {
    pub fn new(iter: impl AsyncIter + 'static) -> Self {
        Self {
            inner: Arc::new(iter),
        }
    }

    pub fn from_arc(inner: Arc<dyn AsyncIter>) -> Self {
        Self { inner }
    }

    /// Iterator over a fixed sequence.
    pub fn from_values(values: impl IntoIterator<Item = Value>) -> Self {
        let values: Vec<_> = values.into_iter().map(Ok).collect();
        Self::from_stream(stream::iter(values).boxed())
    }

    /// Iterator driven by a stream. An `Err` item rejects the pending `next`.
    pub fn from_stream(stream: BoxStream<'static, Result<Value, Value>>) -> Self {
        Self::new(StreamIter {
            stream: tokio::sync::Mutex::new(Some(stream)),
        })
    }

    pub async fn next(&self, arg: Value) -> Result<IterStep, Value> {
        self.inner.next(arg).await
    }

    pub async fn throw(&self, error: Value) -> Result<IterStep, Value> {
        self.inner.throw(error).await
    }

    pub async fn return_value(&self, value: Value) -> Result<IterStep, Value> {
        self.inner.return_value(value).await
    }

    /// Releases a remote iterator early. Later steps report `done`; idempotent.
    pub fn release(&self) {
        self.inner.release();
    }

    /// Drains the iterator into a vector, stopping at the first `done`.
    pub async fn collect(&self) -> Result<Vec<Value>, Value> {
        let mut items = Vec::new();
        loop {
            let step = self.next(Value::Undefined).await?;
            if step.done {
                return Ok(items);
            }
            items.push(step.value);
        }
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }

    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }
}

impl fmt::Debug for Iter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Iter")
    }
}

struct StreamIter {
    stream: tokio::sync::Mutex<Option<BoxStream<'static, Result<Value, Value>>>>,
}

#[async_trait]
impl AsyncIter for StreamIter {
    async fn next(&self, _arg: Value) -> Result<IterStep, Value> {
        let mut guard = self.stream.lock().await;
        let Some(stream) = guard.as_mut() else {
            return Ok(IterStep::done(Value::Undefined));
        };
        match stream.next().await {
            Some(Ok(value)) => Ok(IterStep::yielded(value)),
            Some(Err(error)) => {
                *guard = None;
                Err(error)
            }
            None => {
                *guard = None;
                Ok(IterStep::done(Value::Undefined))
            }
        }
    }

    async fn throw(&self, error: Value) -> Result<IterStep, Value> {
        self.stream.lock().await.take();
        Err(error)
    }

    async fn return_value(&self, value: Value) -> Result<IterStep, Value> {
        self.stream.lock().await.take();
        Ok(IterStep::done(value))
    }
}

/// Something the owner exposes under a hook id.
#[derive(Clone, Debug)]
pub enum Hook {
    Function(Function),
    Iter(Iter),
}

impl Hook {
    pub(crate) fn identity(&self) -> usize {
        match self {
            Hook::Function(f) => f.identity(),
            Hook::Iter(i) => i.identity(),
        }
    }
}

type PolicyFn = dyn Fn(&Hook) -> CallablePolicy + Send + Sync;

/// Policy applied to callables found while encoding a value.
#[derive(Clone)]
pub enum HookMode {
    Fixed(CallablePolicy),
    Computed(Arc<PolicyFn>),
}

impl HookMode {
    pub fn computed(f: impl Fn(&Hook) -> CallablePolicy + Send + Sync + 'static) -> Self {
        Self::Computed(Arc::new(f))
    }

    pub(crate) fn policy_for(&self, hook: &Hook) -> CallablePolicy {
        match self {
            HookMode::Fixed(policy) => *policy,
            HookMode::Computed(f) => f(hook),
        }
    }
}

impl Default for HookMode {
    fn default() -> Self {
        Self::Fixed(CallablePolicy::default())
    }
}

impl fmt::Debug for HookMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookMode::Fixed(policy) => f.debug_tuple("Fixed").field(policy).finish(),
            HookMode::Computed(_) => f.write_str("Computed"),
        }
    }
}
