//! Values that stay with their owner while the peer holds an opaque token.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use super::RegistryInner;
use super::error::RegistryError;
use super::link::IdCounter;
use super::value::Value;
use super::wire::{RefClear, RemoteFrame};

struct OwnedRef {
    value: Value,
    /// Times the id went out in a successful send.
    sent: u64,
}

/// Owner-side ref table plus the holder-side token cache.
#[derive(Default)]
pub(crate) struct RefTable {
    ids: IdCounter,
    owned: HashMap<u64, OwnedRef>,
    index: HashMap<usize, u64>,
    tokens: HashMap<u64, Weak<TokenInner>>,
}

impl RefTable {
    /// Id the value is (or will be) registered under. Registration itself waits for
    /// [`RefTable::commit`].
    pub(crate) fn prepare(&mut self, value: &Value) -> Option<u64> {
        if value.is_nullish() {
            return None;
        }
        if let Some(id) = value.identity().and_then(|i| self.index.get(&i)) {
            return Some(*id);
        }
        Some(self.ids.next())
    }

    pub(crate) fn commit(&mut self, id: u64, value: Value) {
        let entry = self.owned.entry(id).or_insert_with(|| OwnedRef {
            value: value.clone(),
            sent: 0,
        });
        entry.sent += 1;
        if let Some(identity) = value.identity() {
            self.index.insert(identity, id);
        }
    }

    pub(crate) fn lookup(&self, id: u64) -> Result<Value, RegistryError> {
        self.owned
            .get(&id)
            .map(|r| r.value.clone())
            .ok_or(RegistryError::unknown("ref", id))
    }

    pub(crate) fn clear(&mut self, id: u64, count: u64) {
        let Some(entry) = self.owned.get_mut(&id) else {
            tracing::debug!(ref_id = id, "refClear for unknown ref");
            return;
        };
        entry.sent = entry.sent.saturating_sub(count);
        if entry.sent == 0
            && let Some(removed) = self.owned.remove(&id)
            && let Some(identity) = removed.value.identity()
        {
            self.index.remove(&identity);
        }
    }

    /// Holder side: the token for `id`, reused while any clone of it is alive.
    pub(crate) fn resolve(&mut self, id: u64, registry: Weak<RegistryInner>) -> RefToken {
        if let Some(inner) = self.tokens.get(&id).and_then(Weak::upgrade)
            && !inner.released.load(Ordering::Acquire)
        {
            inner.received.fetch_add(1, Ordering::AcqRel);
            return RefToken { inner };
        }
        self.tokens.retain(|_, token| token.strong_count() > 0);
        let inner = Arc::new(TokenInner {
            id,
            received: AtomicU64::new(1),
            released: AtomicBool::new(false),
            registry,
        });
        self.tokens.insert(id, Arc::downgrade(&inner));
        RefToken { inner }
    }

    pub(crate) fn owned_len(&self) -> usize {
        self.owned.len()
    }
}

struct TokenInner {
    id: u64,
    received: AtomicU64,
    released: AtomicBool,
    registry: Weak<RegistryInner>,
}

impl TokenInner {
    fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.post(RemoteFrame::RefClear(RefClear {
                id: self.id,
                count: self.received.load(Ordering::Acquire),
            }));
        }
    }
}

impl Drop for TokenInner {
    fn drop(&mut self) {
        self.release();
    }
}

/// Opaque handle to a value owned by the peer.
///
/// Passing it back to the owner yields the original value there. Dropping the last
/// clone, or calling [`RefToken::release`], lets the owner forget it.
#[derive(Clone)]
pub struct RefToken {
    inner: Arc<TokenInner>,
}

impl RefToken {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn release(&self) {
        self.inner.release();
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }
}

impl fmt::Debug for RefToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RefToken").field(&self.inner.id).finish()
    }
}
