// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! An in-process transport for multi-node programs: the [`Router`] owns a
//! set of [`Dataflow`] nodes and moves channel envelopes between them.
//!
//! Each `step()` ticks every node once, collects all outbound envelopes,
//! and delivers each to the node named by its destination address before
//! that node's next tick. Envelopes addressed to unknown nodes are dropped
//! silently, and an optional filter can drop arbitrary envelopes — between
//! them this models the at-most-once, unordered delivery the engine
//! promises, so protocol tests can exercise loss without a real network.

use crate::channel::Envelope;
use crate::dataflow::Dataflow;
use log::{trace, warn};
use std::collections::BTreeMap;

type Filter = Box<dyn FnMut(&Envelope) -> bool>;

#[derive(Default)]
pub struct Router {
    nodes: BTreeMap<String, Dataflow>,
    filter: Option<Filter>,
}

impl Router {
    pub fn new() -> Router {
        Router {
            nodes: BTreeMap::new(),
            filter: None,
        }
    }

    /// Take ownership of a node, keyed by its address.
    pub fn add_node(&mut self, node: Dataflow) {
        self.nodes.insert(node.addr().to_string(), node);
    }

    pub fn node(&self, addr: &str) -> Option<&Dataflow> {
        self.nodes.get(addr)
    }

    pub fn node_mut(&mut self, addr: &str) -> Option<&mut Dataflow> {
        self.nodes.get_mut(addr)
    }

    /// Install a delivery filter: envelopes for which it returns false are
    /// dropped. Lets tests inject message loss.
    pub fn filter<F>(&mut self, f: F)
    where
        F: FnMut(&Envelope) -> bool + 'static,
    {
        self.filter = Some(Box::new(f));
    }

    /// Tick every node once, then route everything they emitted.
    pub fn step(&mut self) {
        let mut outbound = Vec::new();
        for node in self.nodes.values_mut() {
            node.tick();
            outbound.extend(node.take_outbound());
        }
        for envelope in outbound {
            if let Some(f) = &mut self.filter {
                if !f(&envelope) {
                    trace!("filter dropped {:?}", envelope);
                    continue;
                }
            }
            match self.nodes.get_mut(&envelope.to) {
                Some(node) => {
                    trace!("routing {:?}", envelope);
                    if let Err(e) = node.deliver(envelope) {
                        warn!("delivery failed: {}", e);
                    }
                }
                None => trace!("no node for {:?}, dropped", envelope),
            }
        }
    }

    pub fn run(&mut self, steps: usize) {
        for _ in 0..steps {
            self.step();
        }
    }
}
