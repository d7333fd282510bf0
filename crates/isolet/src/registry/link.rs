//! Identity tracking inside a single message.

use std::collections::HashMap;

use super::error::RegistryError;
use super::value::{Array, Object, Value};
use super::wire::{EncodedValue, Node};
use super::promise::{Promise, PromiseState};

/// Monotonic id source. Each namespace owns one.
#[derive(Debug, Default)]
pub(crate) struct IdCounter {
    next: u64,
}

impl IdCounter {
    pub(crate) fn next(&mut self) -> u64 {
        let id = self.next;
        self.next = self.next.wrapping_add(1);
        id
    }
}

/// Encode side: maps each visited identity to a provisional slot.
///
/// Slots become link ids only when something links back to them. [`LinkTable::seal`]
/// hands out compact ids to those slots, in first-visit order.
#[derive(Debug, Default)]
pub(crate) struct LinkTable {
    slots: HashMap<usize, u32>,
    referenced: Vec<bool>,
    assigned: Vec<Option<u32>>,
}

impl LinkTable {
    /// Returns a link node when `identity` was already visited in this message.
    pub(crate) fn resolve(&mut self, identity: usize) -> Option<EncodedValue> {
        let slot = *self.slots.get(&identity)?;
        self.referenced[slot as usize] = true;
        Some(EncodedValue::node(Node::Link { value: slot }))
    }

    pub(crate) fn save(&mut self, identity: usize) -> u32 {
        let slot = self.referenced.len() as u32;
        self.referenced.push(false);
        self.slots.insert(identity, slot);
        slot
    }

    pub(crate) fn seal(&mut self) {
        let mut next = 0;
        self.assigned = self
            .referenced
            .iter()
            .map(|&referenced| {
                referenced.then(|| {
                    let id = next;
                    next += 1;
                    id
                })
            })
            .collect();
    }

    /// Link id for a slot, if the slot was linked to.
    pub(crate) fn assigned(&self, slot: u32) -> Option<u32> {
        self.assigned.get(slot as usize).copied().flatten()
    }
}

/// Where a forward-referenced value has to be written once it shows up.
pub(crate) enum Fixup {
    ArrayItem(Array, usize),
    ObjectEntry(Object, String),
    Settle(Promise, bool),
}

impl Fixup {
    fn apply(self, value: Value) {
        match self {
            Fixup::ArrayItem(array, index) => array.set(index, value),
            Fixup::ObjectEntry(object, key) => object.insert(key, value),
            Fixup::Settle(promise, fulfilled) => {
                promise.settle_with(if fulfilled {
                    PromiseState::Fulfilled(value)
                } else {
                    PromiseState::Rejected(value)
                });
            }
        }
    }
}

/// Decode side: link ids seen so far and the places waiting for ids not yet seen.
#[derive(Default)]
pub(crate) struct DecodeLinks {
    values: HashMap<u32, Value>,
    waiting: HashMap<u32, Vec<Fixup>>,
}

impl DecodeLinks {
    pub(crate) fn register(&mut self, id: Option<u32>, value: &Value) {
        let Some(id) = id else { return };
        self.values.insert(id, value.clone());
        for fixup in self.waiting.remove(&id).unwrap_or_default() {
            fixup.apply(value.clone());
        }
    }

    pub(crate) fn lookup(&self, id: u32) -> Option<Value> {
        self.values.get(&id).cloned()
    }

    pub(crate) fn wait(&mut self, id: u32, fixup: Fixup) {
        self.waiting.entry(id).or_default().push(fixup);
    }

    /// Fails when a link was never matched by a node carrying its id.
    pub(crate) fn finish(self) -> Result<(), RegistryError> {
        match self.waiting.keys().min() {
            Some(&id) => Err(RegistryError::UnresolvedLink(id)),
            None => Ok(()),
        }
    }
}
