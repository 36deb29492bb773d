// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The dataflow instance: one node's complete engine state.
//!
//! A [`Dataflow`] owns the relation registry, the ordered rule list, the
//! tick counter and the change buffers. Construction is an explicit,
//! side-effect-free factory — the engine holds no process-wide state, so an
//! embedder can run any number of instances (one per simulated node, say)
//! in one process.
//!
//! The registry maps names to handles of erased tuple type; typed access
//! back out goes through [`Dataflow::relation`], which re-checks the handle
//! type at the embedder boundary and rejects mismatches with a declared
//! error rather than panicking.

use crate::channel::ChannelPort;
use crate::error::DataflowError;
use crate::join::JoinDecl;
use crate::lattice::{BoolOr, Lattice, MapUnion, MaxInt, MaxStr, SetUnion, Tuple, TupleLattice};
use crate::relation::{AnyRelation, LBool, LMap, LMax, LMaxString, LSet, Relation};
use crate::tick::{Change, TickInput};
use log::debug;
use std::any::{type_name, Any};
use std::collections::BTreeMap;
use std::fmt;

pub(crate) struct Registered {
    pub(crate) erased: Box<dyn AnyRelation>,
    pub(crate) handle: Box<dyn Any>,
    pub(crate) handle_type: &'static str,
}

pub(crate) type TickHook = Box<dyn FnMut(u64, &mut TickInput<'_>)>;

/// One node running the engine.
pub struct Dataflow {
    pub(crate) addr: String,
    pub(crate) relations: BTreeMap<String, Registered>,
    pub(crate) joins: Vec<JoinDecl>,
    pub(crate) ticks: u64,
    pub(crate) immediate: Vec<Change>,
    pub(crate) next: Vec<Change>,
    pub(crate) inbox: Vec<Change>,
    pub(crate) channels: BTreeMap<String, ChannelPort>,
    pub(crate) tick_hook: Option<TickHook>,
}

impl fmt::Debug for Dataflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dataflow")
            .field("addr", &self.addr)
            .field("ticks", &self.ticks)
            .field("relations", &self.relations.keys().collect::<Vec<_>>())
            .field("joins", &self.joins.len())
            .finish()
    }
}

impl Dataflow {
    /// A fresh instance addressed as `addr`. The address is what channel
    /// tuples name in their destination field.
    pub fn new(addr: &str) -> Dataflow {
        Dataflow {
            addr: addr.to_string(),
            relations: BTreeMap::new(),
            joins: Vec::new(),
            ticks: 0,
            immediate: Vec::new(),
            next: Vec::new(),
            inbox: Vec::new(),
            channels: BTreeMap::new(),
            tick_hook: None,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Install a relation under a globally-unique name. Redeclaration of a
    /// taken name is a setup-time error.
    pub fn declare_relation<L: TupleLattice>(
        &mut self,
        name: &str,
        relation: Relation<L>,
    ) -> Result<Relation<L>, DataflowError> {
        if self.relations.contains_key(name) {
            return Err(DataflowError::DuplicateRelation(name.to_string()));
        }
        debug!(
            "{}: declared {:?} relation {} over {}",
            self.addr,
            relation.kind(),
            name,
            relation.tuple_type()
        );
        self.relations.insert(
            name.to_string(),
            Registered {
                erased: Box::new(relation.clone()),
                handle: Box::new(relation.clone()),
                handle_type: type_name::<Relation<L>>(),
            },
        );
        Ok(relation)
    }

    pub fn declare_lset<T: Tuple + Ord>(&mut self, name: &str) -> Result<LSet<T>, DataflowError> {
        self.declare_relation(name, Relation::new(name, SetUnion::new()))
    }

    pub fn declare_lmax(&mut self, name: &str) -> Result<LMax, DataflowError> {
        self.declare_relation(name, Relation::new(name, MaxInt::default()))
    }

    pub fn declare_lmax_string(&mut self, name: &str) -> Result<LMaxString, DataflowError> {
        self.declare_relation(name, Relation::new(name, MaxStr::default()))
    }

    pub fn declare_lbool(&mut self, name: &str) -> Result<LBool, DataflowError> {
        self.declare_relation(name, Relation::new(name, BoolOr::default()))
    }

    pub fn declare_lmap<K: Tuple + Ord, V: Lattice>(
        &mut self,
        name: &str,
    ) -> Result<LMap<K, V>, DataflowError> {
        self.declare_relation(name, Relation::new(name, MapUnion::new()))
    }

    // Concise readability sugar: all three mark the relation scratch.

    pub fn scratch<L: TupleLattice>(&self, relation: &Relation<L>) -> Relation<L> {
        relation.declare_scratch();
        relation.clone()
    }

    pub fn input<L: TupleLattice>(&self, relation: &Relation<L>) -> Relation<L> {
        relation.declare_scratch();
        relation.clone()
    }

    pub fn output<L: TupleLattice>(&self, relation: &Relation<L>) -> Relation<L> {
        relation.declare_scratch();
        relation.clone()
    }

    /// Fetch a registered relation by name, re-typed. `H` must be the exact
    /// handle type the relation was declared with, e.g.
    /// `d.relation::<LSet<Link>>("Link")`.
    pub fn relation<H: Clone + 'static>(&self, name: &str) -> Result<H, DataflowError> {
        let registered = self
            .relations
            .get(name)
            .ok_or_else(|| DataflowError::UnknownRelation(name.to_string()))?;
        registered
            .handle
            .downcast_ref::<H>()
            .cloned()
            .ok_or_else(|| DataflowError::WrongRelationType {
                name: name.to_string(),
                expected: type_name::<H>(),
                found: registered.handle_type,
            })
    }

    /// Names of every registered relation, in order.
    pub fn relation_names(&self) -> Vec<String> {
        self.relations.keys().cloned().collect()
    }

    // Explicit change enqueueing, mirroring the `Ops` surface inside rules.
    // These become visible at the next drain point: for calls between
    // ticks, that is the start of the next tick-core.

    pub fn add<L: TupleLattice>(&mut self, target: &Relation<L>, tuple: L::Tuple) {
        self.immediate.push(Change::add(target, tuple));
    }

    pub fn add_next<L: TupleLattice>(&mut self, target: &Relation<L>, tuple: L::Tuple) {
        self.next.push(Change::add(target, tuple));
    }

    pub fn merge<L: TupleLattice>(&mut self, target: &Relation<L>, source: &Relation<L>) {
        self.immediate.push(Change::merge(target, source));
    }

    pub fn merge_next<L: TupleLattice>(&mut self, target: &Relation<L>, source: &Relation<L>) {
        self.next.push(Change::merge(target, source));
    }

    /// Install the before-tick hook. It runs once per `tick()` after the
    /// deferred buffer is applied, and can only enqueue boundary inputs
    /// (periodic sources, injected deliveries) through [`TickInput`]; those
    /// are applied after the scratch reset so the coming tick sees them.
    pub fn before_tick<F>(&mut self, hook: F)
    where
        F: FnMut(u64, &mut TickInput<'_>) + 'static,
    {
        self.tick_hook = Some(Box::new(hook));
    }

    pub(crate) fn push_join(&mut self, name: Option<String>, exec: crate::join::JoinExec) {
        debug!(
            "{}: registered join #{} ({})",
            self.addr,
            self.joins.len(),
            name.as_deref().unwrap_or("unnamed")
        );
        self.joins.push(JoinDecl { name, exec });
    }
}
