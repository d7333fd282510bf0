//! Link-mode encoding of one outgoing value.
//!
//! Encoding runs in phases. `encode` walks the value and records promises that are
//! still pending. After the caller yields once, `prepare` inlines the promises that
//! settled in the meantime, registers the rest under hook ids and seals link ids.
//! The context is then either committed (frame accepted) or rolled back.
//!
//! A computed [`HookMode`] runs user code, so its policies are gathered by
//! `collect_policies` before the registry lock is taken. A promise whose settled value
//! was never seen by that pass is sent pending and settles through a `promiseUpdate`.

use std::collections::{HashMap, HashSet};

use base64::Engine as _;

use super::RegistryState;
use super::callable::{Hook, HookMode};
use super::error::RegistryError;
use super::link::LinkTable;
use super::promise::{Promise, PromiseState, abandoned_error};
use super::value::Value;
use super::wire::{CallablePolicy, EncodedValue, Node, NodeStatus, NonFinite, Opaque};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Parse,
    Send,
}

enum Resolution {
    Settled(NodeStatus, EncodedValue),
    Pending(u64),
}

pub(crate) struct EncodeContext {
    phase: Phase,
    links: LinkTable,
    hook_mode: HookMode,
    /// Promises seen pending during the walk, by slot.
    pending: Vec<(u32, Promise)>,
    resolutions: HashMap<u32, Resolution>,
    hooks_sent: Vec<u64>,
    watches: Vec<(u64, Promise)>,
    /// Computed policies by hook identity.
    policies: HashMap<usize, CallablePolicy>,
    /// Identities already walked by `collect_policies`.
    walked: HashSet<usize>,
}

impl EncodeContext {
    pub(crate) fn new(hook_mode: HookMode) -> Self {
        Self {
            phase: Phase::Parse,
            links: LinkTable::default(),
            hook_mode,
            pending: Vec::new(),
            resolutions: HashMap::new(),
            hooks_sent: Vec::new(),
            watches: Vec::new(),
            policies: HashMap::new(),
            walked: HashSet::new(),
        }
    }

    /// Evaluates a computed hook mode for every callable reachable from `value`.
    /// Must run without the registry lock held.
    pub(crate) fn collect_policies(&mut self, value: &Value) {
        if matches!(self.hook_mode, HookMode::Fixed(_)) {
            return;
        }
        let mut stack = vec![value.clone()];
        while let Some(value) = stack.pop() {
            let Some(identity) = value.identity() else {
                continue;
            };
            if !self.walked.insert(identity) {
                continue;
            }
            match value {
                Value::Array(array) => stack.extend(array.to_vec()),
                Value::Object(object) => stack.extend(object.entries().into_iter().map(|(_, v)| v)),
                Value::Promise(promise) => match promise.state() {
                    PromiseState::Pending => {
                        self.walked.remove(&identity);
                    }
                    settled => stack.push(settled_parts(settled).1),
                },
                Value::Function(function) => {
                    let policy = self.hook_mode.policy_for(&Hook::Function(function));
                    self.policies.insert(identity, policy);
                }
                Value::Iter(iter) => {
                    let policy = self.hook_mode.policy_for(&Hook::Iter(iter));
                    self.policies.insert(identity, policy);
                }
                _ => {}
            }
        }
    }

    /// [`EncodeContext::collect_policies`] for promises the walk left pending that have
    /// settled since.
    pub(crate) fn collect_pending_policies(&mut self) {
        let promises: Vec<Promise> = self.pending.iter().map(|(_, p)| p.clone()).collect();
        for promise in promises {
            self.collect_policies(&Value::Promise(promise));
        }
    }

    fn policy_for(&self, hook: &Hook) -> CallablePolicy {
        match &self.hook_mode {
            HookMode::Fixed(policy) => *policy,
            HookMode::Computed(_) => match self.policies.get(&hook.identity()) {
                Some(policy) => *policy,
                None => {
                    tracing::debug!("callable added after policies were collected, using defaults");
                    CallablePolicy::default()
                }
            },
        }
    }

    /// State of `promise` as far as this send may inline it.
    fn inlinable_state(&self, promise: &Promise) -> PromiseState {
        let state = promise.state();
        let seen = match self.hook_mode {
            HookMode::Fixed(_) => true,
            HookMode::Computed(_) => self.walked.contains(&promise.identity()),
        };
        if seen { state } else { PromiseState::Pending }
    }

    pub(crate) fn encode(
        &mut self,
        state: &mut RegistryState,
        value: &Value,
    ) -> Result<EncodedValue, RegistryError> {
        if self.phase != Phase::Parse {
            return Err(RegistryError::EncodeAfterSend);
        }
        Ok(match value {
            Value::Undefined => EncodedValue::node(Node::Undefined),
            Value::Null => EncodedValue::Null,
            Value::Bool(b) => EncodedValue::Bool(*b),
            Value::Number(n) => match NonFinite::classify(*n) {
                Some(marker) => EncodedValue::node(Node::Number { value: marker }),
                None => EncodedValue::Number(*n),
            },
            Value::String(s) => EncodedValue::String(s.clone()),
            Value::Date(ms) => EncodedValue::node(Node::Date { value: *ms }),
            Value::Ref(token) => EncodedValue::node(Node::Ref {
                value: Some(token.id()),
            }),
            Value::Error(error) => EncodedValue::node(Node::Value {
                id: None,
                value: Opaque::Error {
                    name: error.name.clone(),
                    message: error.message.clone(),
                },
            }),
            Value::Bytes(bytes) => self.linked(bytes.identity(), |_, _, slot| {
                Ok(EncodedValue::node(Node::Value {
                    id: Some(slot),
                    value: Opaque::Bytes {
                        data: base64::engine::general_purpose::STANDARD.encode(bytes.as_slice()),
                    },
                }))
            }, state)?,
            Value::Promise(promise) => self.linked(promise.identity(), |ctx, state, slot| {
                ctx.encode_promise(state, promise, slot)
            }, state)?,
            Value::Array(array) => self.linked(array.identity(), |ctx, state, slot| {
                let items = array.to_vec();
                let mut encoded = Vec::with_capacity(items.len());
                for item in &items {
                    encoded.push(ctx.encode(state, item)?);
                }
                Ok(EncodedValue::node(Node::Array {
                    id: Some(slot),
                    value: encoded,
                }))
            }, state)?,
            Value::Function(function) => self.linked(function.identity(), |ctx, state, slot| {
                let hook = Hook::Function(function.clone());
                let policy = ctx.policy_for(&hook);
                let id = ctx.register_hook(state, hook, policy);
                Ok(EncodedValue::node(Node::Fn {
                    id: Some(slot),
                    value: id,
                    mapping: policy.mapping,
                    response_mapping: policy.response_mapping,
                    no_this: policy.no_this,
                    name: function.name().to_owned(),
                    arity: function.arity(),
                }))
            }, state)?,
            Value::Iter(iter) => self.linked(iter.identity(), |ctx, state, slot| {
                let hook = Hook::Iter(iter.clone());
                let policy = ctx.policy_for(&hook);
                let id = ctx.register_hook(state, hook, policy);
                Ok(EncodedValue::node(Node::Itr {
                    id: Some(slot),
                    value: id,
                    mapping: policy.mapping,
                    response_mapping: policy.response_mapping,
                }))
            }, state)?,
            Value::Object(object) => self.linked(object.identity(), |ctx, state, slot| {
                let entries = object.entries();
                let mut encoded = Vec::with_capacity(entries.len());
                for (key, item) in &entries {
                    encoded.push((key.clone(), ctx.encode(state, item)?));
                }
                Ok(EncodedValue::node(Node::Object {
                    id: Some(slot),
                    value: encoded,
                }))
            }, state)?,
        })
    }

    /// Emits a link when `identity` was already visited, otherwise runs `f` with a new slot.
    fn linked<F>(
        &mut self,
        identity: usize,
        f: F,
        state: &mut RegistryState,
    ) -> Result<EncodedValue, RegistryError>
    where
        F: FnOnce(&mut Self, &mut RegistryState, u32) -> Result<EncodedValue, RegistryError>,
    {
        if let Some(link) = self.links.resolve(identity) {
            return Ok(link);
        }
        let slot = self.links.save(identity);
        f(self, state, slot)
    }

    fn register_hook(
        &mut self,
        state: &mut RegistryState,
        hook: Hook,
        policy: CallablePolicy,
    ) -> u64 {
        let hook_ids = &mut state.hook_ids;
        let id = state.callables.register(hook, policy, || hook_ids.next());
        self.hooks_sent.push(id);
        id
    }

    fn encode_promise(
        &mut self,
        state: &mut RegistryState,
        promise: &Promise,
        slot: u32,
    ) -> Result<EncodedValue, RegistryError> {
        // An owned handle may belong to a promise that settled since it was announced;
        // `prepare` decides between reusing the handle and inlining the outcome.
        match self.inlinable_state(promise) {
            PromiseState::Pending => {
                self.pending.push((slot, promise.clone()));
                Ok(pending_node(slot, None))
            }
            settled => {
                let (status, value) = settled_parts(settled);
                Ok(EncodedValue::node(Node::Promise {
                    id: Some(slot),
                    status,
                    handle: None,
                    value: Some(self.encode(state, &value)?),
                }))
            }
        }
    }

    /// Resolves what the walk left pending, then fixes up ids in `root`.
    pub(crate) fn prepare(
        &mut self,
        state: &mut RegistryState,
        root: &mut EncodedValue,
    ) -> Result<(), RegistryError> {
        if self.phase != Phase::Parse {
            return Err(RegistryError::EncodeAfterSend);
        }
        // Settled values may contain further pending promises; the list grows as we go.
        let mut next = 0;
        while next < self.pending.len() {
            let (slot, promise) = self.pending[next].clone();
            next += 1;
            let resolution = match self.inlinable_state(&promise) {
                PromiseState::Pending => match state.promises.handle_of(&promise) {
                    Some(handle) => Resolution::Pending(handle),
                    None => {
                        let handle = state.hook_ids.next();
                        state.promises.own(&promise, handle);
                        self.watches.push((handle, promise.clone()));
                        Resolution::Pending(handle)
                    }
                },
                settled => {
                    let (status, value) = settled_parts(settled);
                    Resolution::Settled(status, self.encode(state, &value)?)
                }
            };
            self.resolutions.insert(slot, resolution);
        }
        self.phase = Phase::Send;
        self.links.seal();
        self.finalize(root);
        Ok(())
    }

    fn finalize(&mut self, value: &mut EncodedValue) {
        let EncodedValue::Node(node) = value else {
            return;
        };
        match node.as_mut() {
            Node::Array { id, value } => {
                *id = id.and_then(|slot| self.links.assigned(slot));
                for item in value {
                    self.finalize(item);
                }
            }
            Node::Object { id, value } => {
                *id = id.and_then(|slot| self.links.assigned(slot));
                for (_, item) in value {
                    self.finalize(item);
                }
            }
            Node::Value { id, .. } | Node::Fn { id, .. } | Node::Itr { id, .. } => {
                *id = id.and_then(|slot| self.links.assigned(slot));
            }
            Node::Link { value } => {
                if let Some(id) = self.links.assigned(*value) {
                    *value = id;
                }
            }
            Node::Promise {
                id,
                status,
                handle,
                value,
            } => {
                let slot = *id;
                *id = slot.and_then(|slot| self.links.assigned(slot));
                if *status == NodeStatus::Pending && handle.is_none() {
                    match slot.and_then(|slot| self.resolutions.remove(&slot)) {
                        Some(Resolution::Settled(settled, encoded)) => {
                            *status = settled;
                            *value = Some(encoded);
                        }
                        Some(Resolution::Pending(h)) => *handle = Some(h),
                        None => {}
                    }
                }
                if let Some(inner) = value {
                    self.finalize(inner);
                }
            }
            Node::Undefined | Node::Number { .. } | Node::Date { .. } | Node::Ref { .. } => {}
        }
    }

    /// The frame went out. Returns the promises to watch for a later `promiseUpdate`.
    pub(crate) fn commit(self) -> Vec<(u64, Promise)> {
        self.watches
    }

    /// The frame never went out: undo every registration made on its behalf.
    pub(crate) fn rollback(self, state: &mut RegistryState) {
        for id in self.hooks_sent {
            state.callables.unsend(id);
        }
        for (_, promise) in self.watches {
            state.promises.disown(&promise);
        }
    }
}

fn pending_node(slot: u32, handle: Option<u64>) -> EncodedValue {
    EncodedValue::node(Node::Promise {
        id: Some(slot),
        status: NodeStatus::Pending,
        handle,
        value: None,
    })
}

fn settled_parts(state: PromiseState) -> (NodeStatus, Value) {
    match state {
        PromiseState::Fulfilled(value) => (NodeStatus::Fulfilled, value),
        PromiseState::Rejected(error) => (NodeStatus::Rejected, error),
        PromiseState::Abandoned | PromiseState::Pending => (NodeStatus::Rejected, abandoned_error()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::callable::Function;
    use crate::registry::value::{Array, Object};

    fn encode(value: &Value) -> (EncodedValue, RegistryState, EncodeContext) {
        let mut state = RegistryState::default();
        let mut ctx = EncodeContext::new(HookMode::default());
        let mut encoded = ctx.encode(&mut state, value).unwrap();
        ctx.prepare(&mut state, &mut encoded).unwrap();
        (encoded, state, ctx)
    }

    #[test]
    fn acyclic_values_carry_no_ids() {
        let value = Value::Object(Object::from_entries([
            ("list", Value::from(vec![Value::from(1.5), Value::Undefined])),
            ("nan", Value::Number(f64::NAN)),
        ]));
        let (encoded, _, _) = encode(&value);
        insta::assert_json_snapshot!(encoded, @r#"
        {
          "type": "object",
          "value": [
            [
              "list",
              {
                "type": "array",
                "value": [
                  1.5,
                  {
                    "type": "undefined"
                  }
                ]
              }
            ],
            [
              "nan",
              {
                "type": "number",
                "value": "NaN"
              }
            ]
          ]
        }
        "#);
    }

    #[test]
    fn repeated_identity_becomes_a_link() {
        let shared = Array::from_vec(vec![Value::from("x")]);
        let value = Value::from(vec![Value::Array(shared.clone()), Value::Array(shared)]);
        let (encoded, _, _) = encode(&value);
        assert_eq!(
            serde_json::to_value(&encoded).unwrap(),
            serde_json::json!({
                "type": "array",
                "value": [
                    {"type": "array", "id": 0, "value": ["x"]},
                    {"type": "link", "value": 0}
                ]
            })
        );
    }

    #[test]
    fn self_reference_links_to_the_root() {
        let object = Object::new();
        object.insert("me", Value::Object(object.clone()));
        let (encoded, _, _) = encode(&Value::Object(object));
        assert_eq!(
            serde_json::to_value(&encoded).unwrap(),
            serde_json::json!({
                "type": "object",
                "id": 0,
                "value": [["me", {"type": "link", "value": 0}]]
            })
        );
    }

    #[test]
    fn settled_promises_are_inlined() {
        let (encoded, state, ctx) = encode(&Value::Promise(Promise::resolved(4)));
        assert_eq!(
            serde_json::to_value(&encoded).unwrap(),
            serde_json::json!({"type": "promise", "status": "fulfilled", "value": 4.0})
        );
        assert_eq!(state.promises.owned_len(), 0);
        assert!(ctx.commit().is_empty());
    }

    #[test]
    fn pending_promises_get_a_handle() {
        let (promise, _resolver) = Promise::pending();
        let (encoded, state, ctx) = encode(&Value::Promise(promise.clone()));
        assert_eq!(
            serde_json::to_value(&encoded).unwrap(),
            serde_json::json!({"type": "promise", "status": "pending", "handle": 0})
        );
        assert_eq!(state.promises.handle_of(&promise), Some(0));
        assert_eq!(ctx.commit().len(), 1);
    }

    #[test]
    fn owned_promises_that_settled_are_inlined() {
        let (promise, resolver) = Promise::pending();
        let (_, mut state, _) = encode(&Value::Promise(promise.clone()));
        assert_eq!(state.promises.handle_of(&promise), Some(0));

        // Settled, but the watcher has not disowned it yet.
        resolver.resolve("done");
        let mut ctx = EncodeContext::new(HookMode::default());
        let mut encoded = ctx.encode(&mut state, &Value::Promise(promise)).unwrap();
        ctx.prepare(&mut state, &mut encoded).unwrap();
        assert_eq!(
            serde_json::to_value(&encoded).unwrap(),
            serde_json::json!({"type": "promise", "status": "fulfilled", "value": "done"})
        );
        assert!(ctx.commit().is_empty());
    }

    #[test]
    fn owned_pending_promises_reuse_their_handle() {
        let (promise, _resolver) = Promise::pending();
        let (_, mut state, _) = encode(&Value::Promise(promise.clone()));
        let mut ctx = EncodeContext::new(HookMode::default());
        let mut encoded = ctx.encode(&mut state, &Value::Promise(promise)).unwrap();
        ctx.prepare(&mut state, &mut encoded).unwrap();
        assert_eq!(
            serde_json::to_value(&encoded).unwrap(),
            serde_json::json!({"type": "promise", "status": "pending", "handle": 0})
        );
        // The first send already watches it.
        assert!(ctx.commit().is_empty());
    }

    #[test]
    fn rollback_forgets_registrations() {
        let f = Function::from_fn("f", 1, |_, _| async { Ok(Value::Undefined) });
        let (promise, _resolver) = Promise::pending();
        let value = Value::from(vec![Value::Function(f), Value::Promise(promise.clone())]);
        let (_, mut state, ctx) = encode(&value);
        assert_eq!(state.callables.owned_len(), 1);
        ctx.rollback(&mut state);
        assert_eq!(state.callables.owned_len(), 0);
        assert_eq!(state.promises.handle_of(&promise), None);
    }

    #[test]
    fn callables_carry_their_policy() {
        let f = Function::from_fn("sum", 2, |_, _| async { Ok(Value::Undefined) });
        let mut state = RegistryState::default();
        let policy = CallablePolicy::new(
            crate::registry::wire::Mapping::Json,
            crate::registry::wire::ResponseMapping::Ignore,
        );
        let mut ctx = EncodeContext::new(HookMode::Fixed(policy));
        let mut encoded = ctx.encode(&mut state, &Value::Function(f)).unwrap();
        ctx.prepare(&mut state, &mut encoded).unwrap();
        assert_eq!(
            serde_json::to_value(&encoded).unwrap(),
            serde_json::json!({
                "type": "fn",
                "value": 0,
                "mapping": "json",
                "responseMapping": "ignore",
                "name": "sum",
                "arity": 2
            })
        );
    }

    fn no_this_for_functions() -> HookMode {
        HookMode::computed(|hook| match hook {
            Hook::Function(_) => CallablePolicy::default().with_no_this(true),
            Hook::Iter(_) => CallablePolicy::default(),
        })
    }

    #[test]
    fn computed_policies_reach_settled_values() {
        let f = Function::from_fn("f", 0, |_, _| async { Ok(Value::Undefined) });
        let g = Function::from_fn("g", 0, |_, _| async { Ok(Value::Undefined) });
        let value = Value::from(vec![
            Value::Function(f),
            Value::Promise(Promise::resolved(Value::Function(g))),
        ]);
        let mut state = RegistryState::default();
        let mut ctx = EncodeContext::new(no_this_for_functions());
        ctx.collect_policies(&value);
        let mut encoded = ctx.encode(&mut state, &value).unwrap();
        ctx.prepare(&mut state, &mut encoded).unwrap();
        let json = serde_json::to_value(&encoded).unwrap();
        assert_eq!(json["value"][0]["noThis"], true);
        assert_eq!(json["value"][1]["status"], "fulfilled");
        assert_eq!(json["value"][1]["value"]["noThis"], true);
    }

    #[test]
    fn unseen_settlements_stay_pending_under_computed_policies() {
        let (promise, resolver) = Promise::pending();
        let value = Value::Promise(promise.clone());
        let mut state = RegistryState::default();
        let mut ctx = EncodeContext::new(no_this_for_functions());
        ctx.collect_policies(&value);
        let mut encoded = ctx.encode(&mut state, &value).unwrap();

        resolver.resolve(Value::Function(Function::from_fn("late", 0, |_, _| async {
            Ok(Value::Undefined)
        })));
        ctx.prepare(&mut state, &mut encoded).unwrap();
        assert_eq!(
            serde_json::to_value(&encoded).unwrap(),
            serde_json::json!({"type": "promise", "status": "pending", "handle": 0})
        );
        assert_eq!(state.callables.owned_len(), 0);
        assert_eq!(ctx.commit().len(), 1);
    }

    #[test]
    fn settlements_seen_after_the_yield_are_inlined() {
        let (promise, resolver) = Promise::pending();
        let value = Value::Promise(promise);
        let mut state = RegistryState::default();
        let mut ctx = EncodeContext::new(no_this_for_functions());
        ctx.collect_policies(&value);
        let mut encoded = ctx.encode(&mut state, &value).unwrap();

        resolver.resolve(Value::Function(Function::from_fn("late", 0, |_, _| async {
            Ok(Value::Undefined)
        })));
        ctx.collect_pending_policies();
        ctx.prepare(&mut state, &mut encoded).unwrap();
        let json = serde_json::to_value(&encoded).unwrap();
        assert_eq!(json["status"], "fulfilled");
        assert_eq!(json["value"]["noThis"], true);
    }

    #[test]
    fn encoding_after_prepare_fails() {
        let mut state = RegistryState::default();
        let mut ctx = EncodeContext::new(HookMode::default());
        let mut encoded = ctx.encode(&mut state, &Value::Null).unwrap();
        ctx.prepare(&mut state, &mut encoded).unwrap();
        assert!(matches!(
            ctx.encode(&mut state, &Value::Null),
            Err(RegistryError::EncodeAfterSend)
        ));
    }
}
