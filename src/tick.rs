// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The tick scheduler and the change-propagation machinery.
//!
//! A tick is the atomic unit of progress. `tick()` runs a fixed pipeline:
//!
//!   1. discard channel outbound the transport never collected;
//!   2. apply and clear the deferred (`next`) buffer;
//!   3. invoke the before-tick hook, which may enqueue boundary inputs;
//!   4. reset every scratch relation to ⊥;
//!   5. apply boundary inputs (channel deliveries, periodic sources) —
//!      after the reset, so they survive into the tick;
//!   6. evaluate each join in registration order, draining the immediate
//!      buffer after each so later joins observe earlier sync writes;
//!   7. advance the tick counter.
//!
//! There is no intra-tick fixed-point loop beyond step 5's sequential
//! draining: programs reach fixed points across ticks by writing idempotent
//! monotonic rules.

use crate::dataflow::Dataflow;
use crate::join::Ops;
use crate::lattice::TupleLattice;
use crate::relation::Relation;
use log::{debug, trace};

/// Whether a pending write adds one tuple or merges a whole lattice.
#[derive(Clone, Copy, Debug)]
pub(crate) enum ChangeKind {
    Add,
    Merge,
}

/// A pending write to a relation: the target handle and argument are
/// captured in the closure, the kind tag survives for diagnostics. Applying
/// a change that does not advance the target lattice is a no-op.
pub(crate) struct Change {
    kind: ChangeKind,
    op: Box<dyn FnOnce() -> bool>,
}

impl Change {
    pub(crate) fn add<L: TupleLattice>(target: &Relation<L>, tuple: L::Tuple) -> Change {
        let target = target.clone();
        Change {
            kind: ChangeKind::Add,
            op: Box::new(move || target.direct_add(tuple)),
        }
    }

    pub(crate) fn merge<L: TupleLattice>(target: &Relation<L>, source: &Relation<L>) -> Change {
        let target = target.clone();
        let source = source.clone();
        Change {
            kind: ChangeKind::Merge,
            op: Box::new(move || target.direct_merge(&source)),
        }
    }

    /// A flatten-join emission: merge a raw lattice value into the target.
    pub(crate) fn merge_value<L: TupleLattice>(target: &Relation<L>, value: L) -> Change {
        let target = target.clone();
        Change {
            kind: ChangeKind::Merge,
            op: Box::new(move || target.merge_value(&value)),
        }
    }

    /// A transport delivery: adds without outbound re-capture.
    pub(crate) fn inbound<L: TupleLattice>(target: &Relation<L>, tuple: L::Tuple) -> Change {
        let target = target.clone();
        Change {
            kind: ChangeKind::Add,
            op: Box::new(move || target.apply_inbound(tuple)),
        }
    }
}

/// Consume a buffer in FIFO order. Final state is order-independent
/// (lattice merges commute); FIFO is the defined order for diagnostics.
pub(crate) fn apply_changes(changes: Vec<Change>) {
    for change in changes {
        let kind = change.kind;
        let advanced = (change.op)();
        trace!("applied {:?} change, advanced={}", kind, advanced);
    }
}

/// The enqueue-only view handed to the before-tick hook. Writes land in the
/// boundary inbox, which is applied after the scratch reset — this is the
/// one way to populate a scratch relation so that the coming tick's joins
/// can see it.
pub struct TickInput<'a> {
    pub(crate) inbox: &'a mut Vec<Change>,
}

impl<'a> TickInput<'a> {
    pub fn add<L: TupleLattice>(&mut self, target: &Relation<L>, tuple: L::Tuple) {
        self.inbox.push(Change::add(target, tuple));
    }

    pub fn merge<L: TupleLattice>(&mut self, target: &Relation<L>, source: &Relation<L>) {
        self.inbox.push(Change::merge(target, source));
    }
}

impl Dataflow {
    /// Advance one logical step. Not re-entrant: a projection or hook must
    /// never call back into `tick()`.
    pub fn tick(&mut self) {
        debug!("{}: tick {} begin", self.addr, self.ticks);
        self.tick_before();
        self.tick_core();
        self.ticks += 1;
        debug!("{}: tick done, counter now {}", self.addr, self.ticks);
    }

    fn tick_before(&mut self) {
        // Undelivered outbound from the previous tick is dropped before the
        // deferred buffer lands this tick's fresh emissions.
        for registered in self.relations.values() {
            registered.erased.clear_outbox();
        }

        let deferred = std::mem::take(&mut self.next);
        trace!("{}: applying {} deferred changes", self.addr, deferred.len());
        apply_changes(deferred);

        if let Some(mut hook) = self.tick_hook.take() {
            let mut input = TickInput {
                inbox: &mut self.inbox,
            };
            hook(self.ticks, &mut input);
            self.tick_hook = Some(hook);
        }

        for registered in self.relations.values() {
            registered.erased.start_tick();
        }

        let boundary = std::mem::take(&mut self.inbox);
        trace!("{}: applying {} boundary inputs", self.addr, boundary.len());
        apply_changes(boundary);
    }

    fn tick_core(&mut self) {
        // Anything the embedder enqueued between ticks becomes visible
        // before the first join runs.
        let pending = std::mem::take(&mut self.immediate);
        apply_changes(pending);

        for i in 0..self.joins.len() {
            {
                let mut ops = Ops {
                    immediate: &mut self.immediate,
                    next: &mut self.next,
                };
                (self.joins[i].exec)(&mut ops);
            }
            trace!(
                "{}: join #{} ({}) produced {} immediate / {} deferred",
                self.addr,
                i,
                self.joins[i].name.as_deref().unwrap_or("unnamed"),
                self.immediate.len(),
                self.next.len()
            );
            let produced = std::mem::take(&mut self.immediate);
            apply_changes(produced);
        }
    }
}
