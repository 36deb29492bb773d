// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Relations: named, typed containers wrapping one lattice value.
//!
//! A [`Relation`] is a cheaply-cloned shared handle; the dataflow instance
//! registers one clone under the relation's name, rules capture clones in
//! their closures, and the embedder keeps clones for seeding and reading.
//! All mutation goes through lattice merges, so sharing read paths is safe:
//! a relation only ever grows within a tick.
//!
//! Three lifecycle variants exist, all carried as flags on the same type:
//! persistent (the default), scratch (reset to ⊥ at every tick start), and
//! channel (scratch + network-routable, with an outbound capture buffer).

use crate::lattice::{
    BoolOr, Lattice, LatticeKind, MapUnion, MaxInt, MaxStr, SetUnion, Tuple, TupleLattice,
};
use log::trace;
use std::any::type_name;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// A set relation over tuples of type `T`.
pub type LSet<T> = Relation<SetUnion<T>>;
/// A max-int relation.
pub type LMax = Relation<MaxInt>;
/// A bool-or relation.
pub type LBool = Relation<BoolOr>;
/// A max-string relation.
pub type LMaxString = Relation<MaxStr>;
/// A map relation from `K` to sub-lattice `V`.
pub type LMap<K, V> = Relation<MapUnion<K, V>>;

struct Inner<L: TupleLattice> {
    name: String,
    value: L,
    scratch: bool,
    channel: bool,
    // Locally-produced channel tuples awaiting transport pickup.
    outbox: Vec<L::Tuple>,
}

/// A shared handle to one named, lattice-valued container.
pub struct Relation<L: TupleLattice> {
    inner: Rc<RefCell<Inner<L>>>,
}

impl<L: TupleLattice> Clone for Relation<L> {
    fn clone(&self) -> Self {
        Relation {
            inner: self.inner.clone(),
        }
    }
}

impl<L: TupleLattice> fmt::Debug for Relation<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Relation")
            .field("name", &inner.name)
            .field("kind", &L::KIND)
            .field("scratch", &inner.scratch)
            .field("channel", &inner.channel)
            .field("value", &inner.value)
            .finish()
    }
}

impl<L: TupleLattice> Relation<L> {
    pub(crate) fn new(name: &str, value: L) -> Self {
        Relation {
            inner: Rc::new(RefCell::new(Inner {
                name: name.to_string(),
                value,
                scratch: false,
                channel: false,
                outbox: Vec::new(),
            })),
        }
    }

    pub fn name(&self) -> String {
        self.inner.borrow().name.clone()
    }

    pub fn kind(&self) -> LatticeKind {
        L::KIND
    }

    /// Diagnostic name of the declared tuple type.
    pub fn tuple_type(&self) -> &'static str {
        type_name::<L::Tuple>()
    }

    /// Mark the relation transient: it resets to ⊥ at the start of each
    /// tick. Purely declarative; takes effect from the next `start_tick`.
    pub fn declare_scratch(&self) {
        self.inner.borrow_mut().scratch = true;
    }

    pub fn is_scratch(&self) -> bool {
        self.inner.borrow().scratch
    }

    pub fn is_channel(&self) -> bool {
        self.inner.borrow().channel
    }

    pub(crate) fn set_channel(&self) {
        self.inner.borrow_mut().channel = true;
    }

    /// Tick-start reset: scratches drop to ⊥.
    pub fn start_tick(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.scratch && !inner.value.is_bottom() {
            trace!("{}: scratch reset", inner.name);
            inner.value = L::bottom();
        }
    }

    /// Discard outbound tuples the transport never collected (delivery is
    /// at-most-once). Runs at the top of each tick, before the deferred
    /// buffer lands this tick's fresh outbound.
    pub(crate) fn clear_outbox(&self) {
        self.inner.borrow_mut().outbox.clear();
    }

    /// Snapshot the current contents as tuples.
    pub fn scan(&self) -> Vec<L::Tuple> {
        self.inner.borrow().value.scan()
    }

    /// Snapshot the whole lattice value.
    pub fn state(&self) -> L {
        self.inner.borrow().value.clone()
    }

    /// Lattice-merge a single tuple. Returns true iff the relation changed.
    /// On channels, tuples that advance the relation are also captured for
    /// outbound transport.
    pub fn direct_add(&self, tuple: L::Tuple) -> bool {
        let mut inner = self.inner.borrow_mut();
        trace!("{}: add {:?}", inner.name, tuple);
        let copy = if inner.channel {
            Some(tuple.clone())
        } else {
            None
        };
        let changed = inner.value.insert(tuple);
        if changed {
            if let Some(t) = copy {
                inner.outbox.push(t);
            }
        }
        changed
    }

    /// Add an inbound tuple delivered by a transport: like `direct_add` but
    /// never re-captured for outbound routing.
    pub(crate) fn apply_inbound(&self, tuple: L::Tuple) -> bool {
        let mut inner = self.inner.borrow_mut();
        trace!("{}: inbound {:?}", inner.name, tuple);
        inner.value.insert(tuple)
    }

    /// Lattice-merge a whole relation of matching type. Self-merge is a
    /// no-op.
    pub fn direct_merge(&self, other: &Relation<L>) -> bool {
        if Rc::ptr_eq(&self.inner, &other.inner) {
            return false;
        }
        let snapshot = other.state();
        if self.is_channel() {
            // Route element-wise so outbound capture sees each new tuple.
            let mut changed = false;
            for t in snapshot.scan() {
                changed |= self.direct_add(t);
            }
            changed
        } else {
            self.merge_value(&snapshot)
        }
    }

    /// Merge a raw lattice value (the flatten-join emission path).
    pub(crate) fn merge_value(&self, value: &L) -> bool {
        let mut inner = self.inner.borrow_mut();
        let changed = inner.value.merge(value);
        if changed {
            trace!("{}: merge advanced the relation", inner.name);
        }
        changed
    }

    pub(crate) fn take_outbox(&self) -> Vec<L::Tuple> {
        std::mem::take(&mut self.inner.borrow_mut().outbox)
    }
}

impl<T: Tuple + Ord> Relation<SetUnion<T>> {
    pub fn size(&self) -> usize {
        self.inner.borrow().value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().value.is_empty()
    }

    pub fn contains(&self, tuple: &T) -> bool {
        self.inner.borrow().value.contains(tuple)
    }
}

impl Relation<MaxInt> {
    pub fn get(&self) -> i64 {
        self.inner.borrow().value.0
    }
}

impl Relation<BoolOr> {
    pub fn get(&self) -> bool {
        self.inner.borrow().value.0
    }
}

impl Relation<MaxStr> {
    pub fn get(&self) -> String {
        self.inner.borrow().value.0.clone()
    }
}

impl<K: Tuple + Ord, V: Lattice> Relation<MapUnion<K, V>> {
    pub fn size(&self) -> usize {
        self.inner.borrow().value.len()
    }

    /// The sub-lattice at `key`, if the key has ever been written.
    pub fn at(&self, key: &K) -> Option<V> {
        self.inner.borrow().value.at(key).cloned()
    }
}

/// Type-erased view of a relation for the instance registry: just enough
/// to drive the tick lifecycle. Typed access goes through the registered
/// handle.
pub(crate) trait AnyRelation {
    fn start_tick(&self);
    fn clear_outbox(&self);
}

impl<L: TupleLattice> AnyRelation for Relation<L> {
    fn start_tick(&self) {
        Relation::start_tick(self)
    }
    fn clear_outbox(&self) {
        Relation::clear_outbox(self)
    }
}
