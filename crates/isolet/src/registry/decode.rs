//! Link-mode decoding of one incoming value.

use std::sync::{Arc, Weak};

use base64::Engine as _;

use super::callable::{Function, Iter};
use super::error::RegistryError;
use super::link::{DecodeLinks, Fixup};
use super::promise::{Promise, PromiseState};
use super::proxy::{ProxyRef, RemoteFunction, RemoteIterator};
use super::value::{Array, Bytes, ErrorValue, Object, Value};
use super::wire::{CallablePolicy, EncodedValue, Node, NodeStatus, Opaque};
use super::{RegistryInner, RegistryState};

enum Slot {
    Ready(Value),
    /// Forward link to an id not decoded yet.
    Waiting(u32),
}

pub(crate) struct Decoder<'a> {
    state: &'a mut RegistryState,
    registry: &'a Weak<RegistryInner>,
    links: DecodeLinks,
}

impl<'a> Decoder<'a> {
    pub(crate) fn decode(
        state: &'a mut RegistryState,
        registry: &'a Weak<RegistryInner>,
        encoded: EncodedValue,
    ) -> Result<Value, RegistryError> {
        let mut decoder = Decoder {
            state,
            registry,
            links: DecodeLinks::default(),
        };
        let root = match decoder.step(encoded)? {
            Slot::Ready(value) => value,
            Slot::Waiting(id) => return Err(RegistryError::UnresolvedLink(id)),
        };
        decoder.links.finish()?;
        Ok(root)
    }

    fn step(&mut self, encoded: EncodedValue) -> Result<Slot, RegistryError> {
        let node = match encoded {
            EncodedValue::Null => return Ok(Slot::Ready(Value::Null)),
            EncodedValue::Bool(b) => return Ok(Slot::Ready(Value::Bool(b))),
            EncodedValue::Number(n) => return Ok(Slot::Ready(Value::Number(n))),
            EncodedValue::String(s) => return Ok(Slot::Ready(Value::String(s))),
            EncodedValue::Node(node) => *node,
        };
        let value = match node {
            Node::Undefined => Value::Undefined,
            Node::Number { value } => Value::Number(value.value()),
            Node::Date { value } => Value::Date(value),
            Node::Link { value } => {
                return Ok(match self.links.lookup(value) {
                    Some(target) => Slot::Ready(target),
                    None => Slot::Waiting(value),
                });
            }
            Node::Array { id, value: items } => {
                let array = Array::from_vec(Vec::with_capacity(items.len()));
                let value = Value::Array(array.clone());
                self.links.register(id, &value);
                for (index, item) in items.into_iter().enumerate() {
                    match self.step(item)? {
                        Slot::Ready(item) => array.push(item),
                        Slot::Waiting(link) => {
                            array.push(Value::Undefined);
                            self.links.wait(link, Fixup::ArrayItem(array.clone(), index));
                        }
                    }
                }
                value
            }
            Node::Object { id, value: entries } => {
                let object = Object::new();
                let value = Value::Object(object.clone());
                self.links.register(id, &value);
                for (key, item) in entries {
                    match self.step(item)? {
                        Slot::Ready(item) => object.insert(key, item),
                        Slot::Waiting(link) => {
                            object.insert(key.clone(), Value::Undefined);
                            self.links.wait(link, Fixup::ObjectEntry(object.clone(), key));
                        }
                    }
                }
                value
            }
            Node::Value { id, value: opaque } => {
                let value = match opaque {
                    Opaque::Error { name, message } => Value::Error(ErrorValue { name, message }),
                    Opaque::Bytes { data } => {
                        let raw = base64::engine::general_purpose::STANDARD
                            .decode(data)
                            .map_err(|e| RegistryError::Serialize(format!("invalid bytes: {e}")))?;
                        Value::Bytes(Bytes::new(raw))
                    }
                };
                self.links.register(id, &value);
                value
            }
            Node::Promise {
                id,
                status,
                handle,
                value: settled,
            } => {
                let promise = match (status, handle) {
                    (NodeStatus::Pending, Some(handle)) => self.state.promises.shadow(handle),
                    (NodeStatus::Pending, None) => {
                        return Err(RegistryError::Serialize(
                            "pending promise without a handle".to_owned(),
                        ));
                    }
                    _ => Promise::unresolved(),
                };
                let value = Value::Promise(promise.clone());
                self.links.register(id, &value);
                if status != NodeStatus::Pending {
                    let fulfilled = status == NodeStatus::Fulfilled;
                    match self.step(settled.unwrap_or(EncodedValue::Null))? {
                        Slot::Ready(outcome) => {
                            promise.settle_with(if fulfilled {
                                PromiseState::Fulfilled(outcome)
                            } else {
                                PromiseState::Rejected(outcome)
                            });
                        }
                        Slot::Waiting(link) => self.links.wait(link, Fixup::Settle(promise, fulfilled)),
                    }
                }
                value
            }
            Node::Fn {
                id,
                value: hook,
                mapping,
                response_mapping,
                no_this,
                name,
                arity,
            } => {
                let policy = CallablePolicy {
                    mapping,
                    response_mapping,
                    no_this,
                };
                let value = Value::Function(self.function(hook, policy, name, arity));
                self.links.register(id, &value);
                value
            }
            Node::Itr {
                id,
                value: hook,
                mapping,
                response_mapping,
            } => {
                let policy = CallablePolicy::new(mapping, response_mapping);
                let value = Value::Iter(self.iterator(hook, policy));
                self.links.register(id, &value);
                value
            }
            Node::Ref { value: None } => Value::Undefined,
            Node::Ref { value: Some(id) } => self.state.refs.lookup(id)?,
        };
        Ok(Slot::Ready(value))
    }

    fn function(&mut self, id: u64, policy: CallablePolicy, name: String, arity: u32) -> Function {
        let proxies = &mut self.state.callables.proxies;
        if let Some(ProxyRef::Function(weak)) = proxies.get(&id)
            && let Some(proxy) = weak.upgrade()
            && !proxy.core.is_released()
        {
            proxy.core.received_again();
            return Function::from_arc(proxy);
        }
        proxies.retain(|_, proxy| proxy.is_alive());
        let proxy = RemoteFunction::new(id, policy, name, arity, self.registry.clone());
        proxies.insert(id, ProxyRef::Function(Arc::downgrade(&proxy)));
        Function::from_arc(proxy)
    }

    fn iterator(&mut self, id: u64, policy: CallablePolicy) -> Iter {
        let proxies = &mut self.state.callables.proxies;
        if let Some(ProxyRef::Iter(weak)) = proxies.get(&id)
            && let Some(proxy) = weak.upgrade()
            && !proxy.core.is_released()
        {
            proxy.core.received_again();
            return Iter::from_arc(proxy);
        }
        proxies.retain(|_, proxy| proxy.is_alive());
        let proxy = RemoteIterator::new(id, policy, self.registry.clone());
        proxies.insert(id, ProxyRef::Iter(Arc::downgrade(&proxy)));
        Iter::from_arc(proxy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(json: serde_json::Value) -> Result<Value, RegistryError> {
        let encoded: EncodedValue = serde_json::from_value(json)?;
        let mut state = RegistryState::default();
        Decoder::decode(&mut state, &Weak::new(), encoded)
    }

    #[test]
    fn back_links_restore_identity() {
        let value = decode(serde_json::json!({
            "type": "array",
            "value": [
                {"type": "object", "id": 0, "value": []},
                {"type": "link", "value": 0}
            ]
        }))
        .unwrap();
        let (a, b) = (value.member("0").unwrap(), value.member("1").unwrap());
        assert!(a.as_object().is_some());
        assert_eq!(a, b);
    }

    #[test]
    fn forward_links_are_patched_in() {
        let value = decode(serde_json::json!({
            "type": "array",
            "value": [
                {"type": "link", "value": 3},
                {"type": "array", "id": 3, "value": [1]}
            ]
        }))
        .unwrap();
        assert_eq!(value.member("0"), value.member("1"));
    }

    #[test]
    fn cycles_survive_decoding() {
        let value = decode(serde_json::json!({
            "type": "object",
            "id": 0,
            "value": [["me", {"type": "link", "value": 0}]]
        }))
        .unwrap();
        assert_eq!(value.member("me"), Some(value.clone()));
    }

    #[test]
    fn dangling_link_is_an_error() {
        let result = decode(serde_json::json!({
            "type": "array",
            "value": [{"type": "link", "value": 9}]
        }));
        assert!(matches!(result, Err(RegistryError::UnresolvedLink(9))));
    }

    #[test]
    fn markers_decode_to_special_values() {
        let value = decode(serde_json::json!({
            "type": "array",
            "value": [
                {"type": "number", "value": "-I"},
                {"type": "undefined"},
                {"type": "date", "value": null},
                {"type": "value", "value": {"kind": "error", "name": "RangeError", "message": "m"}}
            ]
        }))
        .unwrap();
        assert_eq!(value.member("0"), Some(Value::Number(f64::NEG_INFINITY)));
        assert_eq!(value.member("1"), Some(Value::Undefined));
        assert_eq!(value.member("2"), Some(Value::Date(None)));
        assert_eq!(
            value.member("3"),
            Some(Value::Error(ErrorValue::new("RangeError", "m")))
        );
    }

    #[tokio::test]
    async fn settled_promise_nodes_decode_settled() {
        let value = decode(serde_json::json!({
            "type": "promise", "status": "rejected", "value": "no"
        }))
        .unwrap();
        let promise = value.as_promise().unwrap();
        assert_eq!(promise.wait().await, Err(Value::from("no")));
    }

    #[test]
    fn fulfilled_with_null_is_not_missing() {
        let value = decode(serde_json::json!({
            "type": "promise", "status": "fulfilled", "value": null
        }))
        .unwrap();
        assert!(matches!(
            value.as_promise().unwrap().state(),
            PromiseState::Fulfilled(Value::Null)
        ));
    }

    #[test]
    fn unknown_ref_is_an_error() {
        let result = decode(serde_json::json!({"type": "ref", "value": 4}));
        assert!(matches!(
            result,
            Err(RegistryError::UnknownHandle { kind: "ref", id: 4 })
        ));
    }

    #[test]
    fn same_function_id_decodes_to_one_proxy() {
        let node = serde_json::json!({
            "type": "fn", "value": 2, "mapping": "link", "responseMapping": "link",
            "name": "f", "arity": 1
        });
        let encoded: EncodedValue = serde_json::from_value(node).unwrap();
        let mut state = RegistryState::default();
        let registry = Weak::new();
        let a = Decoder::decode(&mut state, &registry, encoded.clone()).unwrap();
        let b = Decoder::decode(&mut state, &registry, encoded).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_function().unwrap().name(), "f");
    }
}
