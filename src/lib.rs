// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

/*!
 * This crate is a small declarative dataflow runtime for building
 * distributed protocols — key-value replication, quorum voting,
 * shortest-path computation, a Raft-style consensus skeleton — out of two
 * ingredients:
 *
 *   - _Relations_: named containers whose contents are values in a bounded
 *     join-semilattice (boolean-or, max-int, max-string, set-union, or map
 *     with lattice values). Relations only ever grow: every write is a
 *     lattice merge, so writes are idempotent, commutative and associative,
 *     and most of the usual distributed-systems ordering headaches
 *     dissolve.
 *
 *   - _Join rules_: declarative productions that scan the cartesian product
 *     of some source relations each logical tick and emit tuples (or whole
 *     sub-lattices) into a destination relation, either immediately —
 *     visible to later rules in the same tick — or deferred to the next
 *     tick.
 *
 * The engine drives these through a fixed per-tick pipeline: drain deferred
 * writes, reset scratch relations, evaluate rules in registration order
 * with immediate writes applied between rules, advance the tick counter.
 * Because all writes are monotonic and tuple domains are finite per tick,
 * every tick terminates; programs reach fixed points _across_ ticks by
 * writing idempotent monotonic rules.
 *
 * Nodes exchange tuples through _channel_ relations: scratch sets whose
 * locally-produced tuples are captured for an external transport to route
 * by destination address. Delivery is at-most-once and unordered;
 * protocols built on top must tolerate drops and reordering (and, being
 * lattice programs, usually do so for free). An in-process [`Router`] is
 * provided for simulations and tests.
 *
 * The design follows the "disorderly programming" lineage of Bloom and
 * CALM: monotonic within a tick, coarse-grained across ticks, no locks, no
 * clocks, no global state. The engine is single-threaded per instance;
 * run one [`Dataflow`] per simulated node.
 *
 * ## Name
 *
 * Wikipedia:
 *
 * > A sluice is a water channel controlled at its head by a movable gate.
 * >
 * > ...
 * >
 * > A mill race, leet, flume, penstock or lade is a sluice channelling
 * > water toward a water mill.
 *
 * Tuples flow like water; the tick is the gate.
 */

mod channel;
mod dataflow;
mod error;
mod join;
mod lattice;
mod net;
mod relation;
mod tick;

pub mod kv;
pub mod quorum;
pub mod raft;
pub mod shortest_path;
pub mod tally;

#[cfg(test)]
mod tests;

pub use channel::{Envelope, Route};
pub use dataflow::Dataflow;
pub use error::DataflowError;
pub use join::{Emit, Ops};
pub use lattice::{
    BoolOr, Lattice, LatticeKind, MapEntry, MapUnion, MaxInt, MaxStr, SetUnion, Tuple,
    TupleLattice,
};
pub use net::Router;
pub use relation::{LBool, LMap, LMax, LMaxString, LSet, Relation};
pub use tick::TickInput;
