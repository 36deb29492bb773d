// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

/*!
 * The value model of the runtime: bounded join-semilattices.
 *
 * Every relation in a dataflow wraps exactly one value of a type
 * implementing [`Lattice`]: a type with a least element ([`Lattice::bottom`],
 * written ⊥) and a least-upper-bound operation ([`Lattice::merge`]) that is
 * associative, commutative and idempotent. Those three properties are what
 * make the runtime's evaluation order-insensitive: within a tick, any
 * sequence of merges arrives at the same value.
 *
 * Five kinds are provided, mirroring the classic Bloom^L menu:
 *
 * | kind            | element              | ⊥          | merge              |
 * |-----------------|----------------------|------------|--------------------|
 * | [`BoolOr`]      | `bool`               | `false`    | logical or         |
 * | [`MaxInt`]      | `i64`                | `i64::MIN` | numeric max        |
 * | [`MaxStr`]      | `String`             | `""`       | lexicographic max  |
 * | [`SetUnion`]    | finite set           | `∅`        | union              |
 * | [`MapUnion`]    | map to sub-lattices  | empty map  | per-key merge      |
 *
 * [`TupleLattice`] layers the relational view on top: every lattice kind
 * knows how to present itself as a finite sequence of tuples ([`scan`]) and
 * how to absorb one tuple ([`insert`]). Sets scan their elements, maps scan
 * [`MapEntry`] pairs, and the scalar kinds scan a single element carrying
 * the current value.
 *
 * Note that the derived `Ord` on these types is a *container* order — it
 * exists so lattice values can live inside `OrdSet`s and `OrdMap`s and be
 * compared structurally in tests. The lattice's own partial order is
 * [`Lattice::dominates`].
 *
 * [`scan`]: TupleLattice::scan
 * [`insert`]: TupleLattice::insert
 */

use im::{OrdMap, OrdSet};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// The lattice kind of a relation, for registry diagnostics and the
/// embedder-boundary handle checks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LatticeKind {
    Bool,
    Max,
    MaxString,
    Set,
    Map,
}

/// A bounded join-semilattice value.
pub trait Lattice: Clone + Debug + Default + PartialEq + 'static {
    /// The least element. Equal to `Default::default()` for every kind.
    fn bottom() -> Self {
        Self::default()
    }

    /// Merge `other` into `self` (least upper bound). Returns true iff
    /// `self` changed, i.e. iff `other` was not already ≤ `self`.
    fn merge(&mut self, other: &Self) -> bool;

    /// The lattice partial order: true iff `other` ≤ `self`.
    fn dominates(&self, other: &Self) -> bool {
        let mut probe = self.clone();
        !probe.merge(other)
    }

    fn is_bottom(&self) -> bool {
        *self == Self::bottom()
    }
}

/// Marker bounds for anything stored in, or scanned out of, a relation.
/// Blanket-implemented; tuple equality is structural, via the type's own
/// derived `PartialEq`.
pub trait Tuple: Clone + Debug + 'static {}
impl<T: Clone + Debug + 'static> Tuple for T {}

/// A lattice that can present itself as a relation: a finite sequence of
/// tuples, plus tuple-at-a-time absorption.
pub trait TupleLattice: Lattice {
    type Tuple: Tuple;

    const KIND: LatticeKind;

    /// Snapshot the current contents as tuples. The returned sequence is
    /// stable for the lifetime of the snapshot; callers that need scan
    /// stability across a whole join evaluation take one snapshot up front.
    fn scan(&self) -> Vec<Self::Tuple>;

    /// Absorb one tuple: set insert, map upsert-and-merge, or scalar merge
    /// of the carried value. Returns true iff the lattice advanced.
    fn insert(&mut self, tuple: Self::Tuple) -> bool;
}

/// Boolean-or: once true, stays true.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BoolOr(pub bool);

impl Lattice for BoolOr {
    fn merge(&mut self, other: &Self) -> bool {
        let changed = !self.0 && other.0;
        self.0 |= other.0;
        changed
    }
}

impl TupleLattice for BoolOr {
    type Tuple = bool;
    const KIND: LatticeKind = LatticeKind::Bool;

    fn scan(&self) -> Vec<bool> {
        vec![self.0]
    }
    fn insert(&mut self, tuple: bool) -> bool {
        self.merge(&BoolOr(tuple))
    }
}

/// Max-int: the numeric maximum seen so far. ⊥ is `i64::MIN`, so any
/// observed value advances the lattice.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MaxInt(pub i64);

impl Default for MaxInt {
    fn default() -> Self {
        MaxInt(i64::MIN)
    }
}

impl Lattice for MaxInt {
    fn merge(&mut self, other: &Self) -> bool {
        let changed = other.0 > self.0;
        self.0 = self.0.max(other.0);
        changed
    }
}

impl TupleLattice for MaxInt {
    type Tuple = i64;
    const KIND: LatticeKind = LatticeKind::Max;

    fn scan(&self) -> Vec<i64> {
        vec![self.0]
    }
    fn insert(&mut self, tuple: i64) -> bool {
        self.merge(&MaxInt(tuple))
    }
}

/// Max-string: the lexicographic maximum seen so far. ⊥ is the empty string.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MaxStr(pub String);

impl Lattice for MaxStr {
    fn merge(&mut self, other: &Self) -> bool {
        if other.0 > self.0 {
            self.0 = other.0.clone();
            true
        } else {
            false
        }
    }
}

impl TupleLattice for MaxStr {
    type Tuple = String;
    const KIND: LatticeKind = LatticeKind::MaxString;

    fn scan(&self) -> Vec<String> {
        vec![self.0.clone()]
    }
    fn insert(&mut self, tuple: String) -> bool {
        self.merge(&MaxStr(tuple))
    }
}

/// Set-union over any ordered tuple type.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SetUnion<T: Tuple + Ord>(pub OrdSet<T>);

impl<T: Tuple + Ord> Default for SetUnion<T> {
    fn default() -> Self {
        SetUnion(OrdSet::new())
    }
}

impl<T: Tuple + Ord> SetUnion<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// The singleton set, handy when projecting one tuple into a
    /// set-valued map entry.
    pub fn one(tuple: T) -> Self {
        SetUnion(OrdSet::unit(tuple))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, tuple: &T) -> bool {
        self.0.contains(tuple)
    }
}

impl<T: Tuple + Ord> Lattice for SetUnion<T> {
    fn merge(&mut self, other: &Self) -> bool {
        let before = self.0.len();
        self.0 = self.0.clone().union(other.0.clone());
        self.0.len() != before
    }
}

impl<T: Tuple + Ord> TupleLattice for SetUnion<T> {
    type Tuple = T;
    const KIND: LatticeKind = LatticeKind::Set;

    fn scan(&self) -> Vec<T> {
        self.0.iter().cloned().collect()
    }
    fn insert(&mut self, tuple: T) -> bool {
        self.0.insert(tuple).is_none()
    }
}

/// One entry of a [`MapUnion`], as produced by its scan and consumed by its
/// insert. Adding an entry whose key is present merges `val` into the
/// existing sub-lattice; an absent key is ⊥, so the entry lands whole.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MapEntry<K, V> {
    pub key: K,
    pub val: V,
}

impl<K, V> MapEntry<K, V> {
    pub fn new(key: K, val: V) -> Self {
        MapEntry { key, val }
    }
}

/// Map-with-lattice-values: per-key merge of the value sub-lattice.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MapUnion<K: Tuple + Ord, V: Lattice>(pub OrdMap<K, V>);

impl<K: Tuple + Ord, V: Lattice> Default for MapUnion<K, V> {
    fn default() -> Self {
        MapUnion(OrdMap::new())
    }
}

impl<K: Tuple + Ord, V: Lattice> MapUnion<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn one(key: K, val: V) -> Self {
        MapUnion(OrdMap::unit(key, val))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The sub-lattice at `key`. `None` means the key has never been
    /// written, which is distinct from a key explicitly holding ⊥.
    pub fn at(&self, key: &K) -> Option<&V> {
        self.0.get(key)
    }
}

impl<K: Tuple + Ord, V: Lattice> Lattice for MapUnion<K, V> {
    fn merge(&mut self, other: &Self) -> bool {
        let mut changed = false;
        for (k, v) in other.0.iter() {
            changed |= self.insert(MapEntry::new(k.clone(), v.clone()));
        }
        changed
    }
}

impl<K: Tuple + Ord, V: Lattice> TupleLattice for MapUnion<K, V> {
    type Tuple = MapEntry<K, V>;
    const KIND: LatticeKind = LatticeKind::Map;

    fn scan(&self) -> Vec<MapEntry<K, V>> {
        self.0
            .iter()
            .map(|(k, v)| MapEntry::new(k.clone(), v.clone()))
            .collect()
    }

    fn insert(&mut self, tuple: MapEntry<K, V>) -> bool {
        match self.0.get_mut(&tuple.key) {
            Some(existing) => existing.merge(&tuple.val),
            None => {
                self.0.insert(tuple.key, tuple.val);
                true
            }
        }
    }
}
