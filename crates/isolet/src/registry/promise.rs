//! Write-once settlement cells shared between a producer and any number of waiters.

use std::future::Future;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::Notify;

use super::value::{ErrorValue, Value, lock};

/// Name of the error a promise rejects with when nobody will ever settle it.
pub const ABANDONED: &str = "AbandonedPromise";

#[derive(Debug, Clone)]
pub enum PromiseState {
    Pending,
    Fulfilled(Value),
    Rejected(Value),
    /// The producer went away without settling.
    Abandoned,
}

/// Status without the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseStatus {
    Pending,
    Fulfilled,
    Rejected,
    Abandoned,
}

pub(crate) struct PromiseInner {
    state: Mutex<PromiseState>,
    notify: Notify,
}

impl PromiseInner {
    fn new(state: PromiseState) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state),
            notify: Notify::new(),
        })
    }

    fn settle(&self, next: PromiseState) -> bool {
        {
            let mut state = lock(&self.state);
            if !matches!(*state, PromiseState::Pending) {
                return false;
            }
            *state = next;
        }
        self.notify.notify_waiters();
        true
    }
}

#[derive(Clone)]
pub struct Promise {
    inner: Arc<PromiseInner>,
}

impl Promise {
    /// A pending promise and the handle that settles it.
    pub fn pending() -> (Promise, Resolver) {
        let inner = PromiseInner::new(PromiseState::Pending);
        let resolver = Resolver {
            inner: Some(inner.clone()),
        };
        (Promise { inner }, resolver)
    }

    /// Pending promise settled only through [`Promise::settle_with`].
    pub(crate) fn unresolved() -> Promise {
        Promise {
            inner: PromiseInner::new(PromiseState::Pending),
        }
    }

    pub fn resolved(value: impl Into<Value>) -> Promise {
        Promise {
            inner: PromiseInner::new(PromiseState::Fulfilled(value.into())),
        }
    }

    pub fn rejected(error: impl Into<Value>) -> Promise {
        Promise {
            inner: PromiseInner::new(PromiseState::Rejected(error.into())),
        }
    }

    /// Runs `future` on the current runtime and settles with its output.
    pub fn spawn<F>(future: F) -> Promise
    where
        F: Future<Output = Result<Value, Value>> + Send + 'static,
    {
        let (promise, resolver) = Promise::pending();
        tokio::spawn(async move {
            resolver.settle(future.await);
        });
        promise
    }

    pub fn state(&self) -> PromiseState {
        lock(&self.inner.state).clone()
    }

    pub fn status(&self) -> PromiseStatus {
        match *lock(&self.inner.state) {
            PromiseState::Pending => PromiseStatus::Pending,
            PromiseState::Fulfilled(_) => PromiseStatus::Fulfilled,
            PromiseState::Rejected(_) => PromiseStatus::Rejected,
            PromiseState::Abandoned => PromiseStatus::Abandoned,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status() == PromiseStatus::Pending
    }

    /// Waits until the promise leaves the pending state.
    pub async fn settled(&self) -> PromiseState {
        loop {
            let notified = self.inner.notify.notified();
            let state = self.state();
            if !matches!(state, PromiseState::Pending) {
                return state;
            }
            notified.await;
        }
    }

    /// Waits for the outcome. Abandonment surfaces as a rejection.
    pub async fn wait(&self) -> Result<Value, Value> {
        match self.settled().await {
            PromiseState::Fulfilled(value) => Ok(value),
            PromiseState::Rejected(error) => Err(error),
            PromiseState::Abandoned | PromiseState::Pending => Err(abandoned_error()),
        }
    }

    pub fn ptr_eq(&self, other: &Promise) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }

    pub(crate) fn settle_with(&self, state: PromiseState) -> bool {
        self.inner.settle(state)
    }

    pub(crate) fn downgrade(&self) -> Weak<PromiseInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<PromiseInner>) -> Option<Promise> {
        weak.upgrade().map(|inner| Promise { inner })
    }
}

pub(crate) fn abandoned_error() -> Value {
    Value::Error(ErrorValue::new(
        ABANDONED,
        "promise was dropped before it settled",
    ))
}

/// Settles the paired [`Promise`]. Dropping it unsettled abandons the promise.
pub struct Resolver {
    inner: Option<Arc<PromiseInner>>,
}

impl Resolver {
    pub fn resolve(self, value: impl Into<Value>) {
        self.settle(Ok(value.into()));
    }

    pub fn reject(self, error: impl Into<Value>) {
        self.settle(Err(error.into()));
    }

    pub fn settle(mut self, outcome: Result<Value, Value>) {
        if let Some(inner) = self.inner.take() {
            inner.settle(match outcome {
                Ok(value) => PromiseState::Fulfilled(value),
                Err(error) => PromiseState::Rejected(error),
            });
        }
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.settle(PromiseState::Abandoned);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_once() {
        let (promise, resolver) = Promise::pending();
        assert!(promise.is_pending());
        resolver.resolve(1);
        assert_eq!(promise.wait().await, Ok(Value::from(1)));
        assert!(!promise.settle_with(PromiseState::Rejected(Value::Null)));
        assert_eq!(promise.status(), PromiseStatus::Fulfilled);
    }

    #[tokio::test]
    async fn waiters_wake_on_settlement() {
        let (promise, resolver) = Promise::pending();
        let waiter = {
            let promise = promise.clone();
            tokio::spawn(async move { promise.wait().await })
        };
        tokio::task::yield_now().await;
        resolver.reject("boom");
        assert_eq!(waiter.await.unwrap(), Err(Value::from("boom")));
    }

    #[tokio::test]
    async fn dropped_resolver_abandons() {
        let (promise, resolver) = Promise::pending();
        drop(resolver);
        let error = promise.wait().await.unwrap_err();
        assert_eq!(error.as_error().map(|e| e.name.as_str()), Some(ABANDONED));
    }

    #[tokio::test]
    async fn spawn_settles_from_future() {
        let promise = Promise::spawn(async { Ok(Value::from("done")) });
        assert_eq!(promise.wait().await, Ok(Value::from("done")));
    }
}
