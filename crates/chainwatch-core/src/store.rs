//! Per-evaluation scratch store.
//!
//! A `Store` lives for exactly one (pipeline, block) evaluation and lets an
//! earlier stage hand data to a later one. Slots are keyed by their type, so
//! the slot type itself is the store identity:
//!
//! ```
//! use chainwatch_core::Store;
//!
//! #[derive(Default)]
//! struct TopHolders(Vec<String>);
//!
//! let store = Store::new();
//! store.access::<TopHolders>().with(|t| t.0.push("alice".into()));
//! assert_eq!(store.access::<TopHolders>().with(|t| t.0.len()), 1);
//! ```

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::sync::lock;

type AnySlot = Arc<dyn Any + Send + Sync>;

/// Mutable key-value scratch space for one pipeline evaluation.
#[derive(Clone, Default)]
pub struct Store {
    slots: Arc<Mutex<HashMap<TypeId, AnySlot>>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the slot for `S`, creating it with `S::default()` on first access.
    ///
    /// Repeated calls return handles to the same slot.
    pub fn access<S>(&self) -> StoreSlot<S>
    where
        S: Default + Send + 'static,
    {
        let mut slots = lock(&self.slots);
        let slot = slots
            .entry(TypeId::of::<S>())
            .or_insert_with(|| Arc::new(Mutex::new(S::default())) as AnySlot)
            .clone();
        drop(slots);

        // The map is keyed by TypeId, so the stored value is always Mutex<S>.
        match slot.downcast::<Mutex<S>>() {
            Ok(inner) => StoreSlot { inner },
            Err(_) => unreachable!("store slot keyed by TypeId holds a foreign type"),
        }
    }

    /// Returns `true` if a slot for `S` was created during this evaluation.
    pub fn contains<S: 'static>(&self) -> bool {
        lock(&self.slots).contains_key(&TypeId::of::<S>())
    }

    pub fn len(&self) -> usize {
        lock(&self.slots).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.slots).is_empty()
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("slots", &self.len()).finish()
    }
}

/// Handle on one store slot.
pub struct StoreSlot<S> {
    inner: Arc<Mutex<S>>,
}

impl<S> StoreSlot<S> {
    /// Run `f` with mutable access to the slot value.
    pub fn with<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        f(&mut lock(&self.inner))
    }

    /// Replace the slot value.
    pub fn set(&self, value: S) {
        *lock(&self.inner) = value;
    }

    /// Returns `true` if both handles point at the same slot.
    pub fn same_slot(&self, other: &StoreSlot<S>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<S: Clone> StoreSlot<S> {
    /// Clone the current slot value out.
    pub fn get(&self) -> S {
        lock(&self.inner).clone()
    }
}

impl<S> Clone for StoreSlot<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Holders(Vec<String>);

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Threshold(u64);

    #[test]
    fn same_type_same_slot() {
        let store = Store::new();
        let a = store.access::<Holders>();
        let b = store.access::<Holders>();
        assert!(a.same_slot(&b));

        a.set(Holders(vec!["alice".into()]));
        assert_eq!(b.get(), Holders(vec!["alice".into()]));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn distinct_types_are_isolated() {
        let store = Store::new();
        store.access::<Threshold>().set(Threshold(1000));
        assert!(store.contains::<Threshold>());
        assert!(!store.contains::<Holders>());
        assert_eq!(store.access::<Holders>().get(), Holders::default());
    }

    #[test]
    fn fresh_store_is_empty() {
        let first = Store::new();
        first.access::<Threshold>().set(Threshold(5));
        let second = Store::new();
        assert!(second.is_empty());
        assert_eq!(second.access::<Threshold>().get(), Threshold(0));
    }

    #[test]
    fn clones_share_slots() {
        let store = Store::new();
        let handle = store.clone();
        handle.access::<Threshold>().with(|t| t.0 += 7);
        assert_eq!(store.access::<Threshold>().get(), Threshold(7));
    }
}
