//! Per-side bookkeeping for promises and callables.

use std::collections::HashMap;
use std::sync::Weak;

use super::callable::Hook;
use super::promise::{Promise, PromiseInner};
use super::proxy::ProxyRef;
use super::wire::CallablePolicy;

#[derive(Default)]
pub(crate) struct PromiseTable {
    /// Owner side: pending local promises already announced to the peer.
    owned: HashMap<usize, u64>,
    /// Holder side: shadows waiting for a `promiseUpdate`.
    shadows: HashMap<u64, Weak<PromiseInner>>,
}

impl PromiseTable {
    pub(crate) fn handle_of(&self, promise: &Promise) -> Option<u64> {
        self.owned.get(&promise.identity()).copied()
    }

    pub(crate) fn own(&mut self, promise: &Promise, handle: u64) {
        self.owned.insert(promise.identity(), handle);
    }

    pub(crate) fn disown(&mut self, promise: &Promise) {
        self.owned.remove(&promise.identity());
    }

    /// The live shadow for `handle`, or a fresh one.
    pub(crate) fn shadow(&mut self, handle: u64) -> Promise {
        if let Some(promise) = self.shadows.get(&handle).and_then(Promise::upgrade) {
            return promise;
        }
        self.shadows.retain(|_, weak| weak.strong_count() > 0);
        let promise = Promise::unresolved();
        self.shadows.insert(handle, promise.downgrade());
        promise
    }

    pub(crate) fn take_shadow(&mut self, handle: u64) -> Option<Promise> {
        self.shadows.remove(&handle).and_then(|w| Promise::upgrade(&w))
    }

    pub(crate) fn drain_shadows(&mut self) -> Vec<Promise> {
        self.shadows
            .drain()
            .filter_map(|(_, w)| Promise::upgrade(&w))
            .collect()
    }

    pub(crate) fn owned_len(&self) -> usize {
        self.owned.len()
    }

    pub(crate) fn shadow_len(&self) -> usize {
        self.shadows
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

pub(crate) struct OwnedHook {
    pub(crate) hook: Hook,
    pub(crate) policy: CallablePolicy,
    sent: u64,
}

#[derive(Default)]
pub(crate) struct CallableTable {
    owned: HashMap<u64, OwnedHook>,
    index: HashMap<usize, u64>,
    pub(crate) proxies: HashMap<u64, ProxyRef>,
}

impl CallableTable {
    /// Registers (or re-sends) a local callable and counts the send.
    pub(crate) fn register(
        &mut self,
        hook: Hook,
        policy: CallablePolicy,
        next_id: impl FnOnce() -> u64,
    ) -> u64 {
        let identity = hook.identity();
        if let Some(id) = self.index.get(&identity).copied()
            && let Some(entry) = self.owned.get_mut(&id)
        {
            entry.policy = policy;
            entry.sent += 1;
            return id;
        }
        let id = next_id();
        self.index.insert(identity, id);
        self.owned.insert(
            id,
            OwnedHook {
                hook,
                policy,
                sent: 1,
            },
        );
        id
    }

    /// Undoes one [`CallableTable::register`] after a failed send.
    pub(crate) fn unsend(&mut self, id: u64) {
        self.clear(id, 1);
    }

    pub(crate) fn get(&self, id: u64) -> Option<(Hook, CallablePolicy)> {
        self.owned
            .get(&id)
            .map(|entry| (entry.hook.clone(), entry.policy))
    }

    /// Holder released `count` copies. The entry goes away once every send is matched.
    pub(crate) fn clear(&mut self, id: u64, count: u64) {
        let Some(entry) = self.owned.get_mut(&id) else {
            return;
        };
        entry.sent = entry.sent.saturating_sub(count);
        if entry.sent == 0
            && let Some(removed) = self.owned.remove(&id)
        {
            self.index.remove(&removed.hook.identity());
        }
    }

    pub(crate) fn owned_len(&self) -> usize {
        self.owned.len()
    }

    pub(crate) fn proxy_len(&self) -> usize {
        self.proxies.values().filter(|p| p.is_alive()).count()
    }
}
