// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Channel relations: scratch sets used as conduits for inter-node tuples.
//!
//! A channel is declared with [`Dataflow::declare_channel`] and behaves as
//! any other scratch set inside the dataflow. What makes it a channel is
//! the outbound capture: every tuple produced locally into the relation is
//! also copied into an outbox, which a transport collects with
//! [`Dataflow::take_outbound`] after a tick and routes by each tuple's
//! destination address ([`Route::to`]). Inbound tuples enter through
//! [`Dataflow::deliver`] and appear in the relation at the destination's
//! next tick boundary, after its scratch reset.
//!
//! The core defines no wire format. [`Envelope`] payloads are type-erased
//! in-process values; a real transport would serialize the concrete tuple
//! types (they all derive serde) and call `deliver` on the far side.
//! Delivery is at-most-once and unordered: undelivered outboxes are
//! discarded at the next tick, unknown destinations are dropped, and
//! protocols built on top must tolerate both.

use crate::dataflow::Dataflow;
use crate::error::DataflowError;
use crate::lattice::Tuple;
use crate::relation::LSet;
use crate::tick::Change;
use std::any::{type_name, Any};
use std::fmt;

/// Addressing contract for channel tuples: the destination instance's
/// address string.
pub trait Route: Tuple {
    fn to(&self) -> &str;
}

/// One in-flight channel tuple, addressed and type-erased.
pub struct Envelope {
    pub channel: String,
    pub to: String,
    pub(crate) payload: Box<dyn Any>,
    pub(crate) payload_type: &'static str,
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("channel", &self.channel)
            .field("to", &self.to)
            .field("payload_type", &self.payload_type)
            .finish()
    }
}

/// Per-channel erased plumbing kept by the instance: outbox drain on the
/// way out, checked downcast on the way in.
pub(crate) struct ChannelPort {
    pub(crate) drain: Box<dyn Fn() -> Vec<Envelope>>,
    pub(crate) inject: Box<dyn Fn(Box<dyn Any>, &'static str) -> Result<Change, DataflowError>>,
}

impl Dataflow {
    /// Declare a channel: a scratch set of `T`, flagged channel-routable.
    pub fn declare_channel<T: Route + Ord>(
        &mut self,
        name: &str,
    ) -> Result<LSet<T>, DataflowError> {
        let relation = self.declare_lset::<T>(name)?;
        relation.declare_scratch();
        relation.set_channel();

        let drain_name = name.to_string();
        let drain_rel = relation.clone();
        let drain = Box::new(move || {
            drain_rel
                .take_outbox()
                .into_iter()
                .map(|t| Envelope {
                    channel: drain_name.clone(),
                    to: t.to().to_string(),
                    payload_type: type_name::<T>(),
                    payload: Box::new(t) as Box<dyn Any>,
                })
                .collect()
        });

        let inject_name = name.to_string();
        let inject_rel = relation.clone();
        let inject = Box::new(
            move |payload: Box<dyn Any>, payload_type: &'static str| match payload.downcast::<T>()
            {
                Ok(tuple) => Ok(Change::inbound(&inject_rel, *tuple)),
                Err(_) => Err(DataflowError::ChannelTupleMismatch {
                    channel: inject_name.clone(),
                    expected: type_name::<T>(),
                    found: payload_type,
                }),
            },
        );

        self.channels
            .insert(name.to_string(), ChannelPort { drain, inject });
        Ok(relation)
    }

    /// Drain every channel's outbox into addressed envelopes. Transports
    /// call this after `tick()`; whatever they leave behind is discarded at
    /// the next tick boundary.
    pub fn take_outbound(&mut self) -> Vec<Envelope> {
        let mut outbound = Vec::new();
        for port in self.channels.values() {
            outbound.extend((port.drain)());
        }
        outbound
    }

    /// Enqueue an inbound envelope onto the matching local channel. The
    /// tuple becomes visible at the next tick boundary, after the scratch
    /// reset. Payload type is checked against the channel's declaration.
    pub fn deliver(&mut self, envelope: Envelope) -> Result<(), DataflowError> {
        let port = match self.channels.get(&envelope.channel) {
            Some(port) => port,
            None if self.relations.contains_key(&envelope.channel) => {
                return Err(DataflowError::NotAChannel(envelope.channel));
            }
            None => return Err(DataflowError::UnknownChannel(envelope.channel)),
        };
        let change = (port.inject)(envelope.payload, envelope.payload_type)?;
        self.inbox.push(change);
        Ok(())
    }

    /// Typed convenience over [`deliver`](Dataflow::deliver) for embedders
    /// and tests that hold the concrete tuple.
    pub fn deliver_tuple<T: Route + Ord>(
        &mut self,
        channel: &str,
        tuple: T,
    ) -> Result<(), DataflowError> {
        let to = tuple.to().to_string();
        self.deliver(Envelope {
            channel: channel.to_string(),
            to,
            payload_type: type_name::<T>(),
            payload: Box::new(tuple),
        })
    }
}
