// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use thiserror::Error;

/// Errors surfaced while wiring up or feeding a dataflow. All of these are
/// setup-time or boundary-time conditions: once a program's declarations have
/// succeeded, `tick()` itself cannot fail.
///
/// The reflection errors of dynamically-typed dataflow systems (arity
/// mismatches, parameter type mismatches, function-not-last, missing
/// destination) have no representation here: the typed join builder makes
/// them compile errors instead.
#[derive(Debug, Error)]
pub enum DataflowError {
    /// A relation was declared under a name that is already taken.
    #[error("relation redeclared: {0}")]
    DuplicateRelation(String),

    /// Registry lookup for a name nothing was declared under.
    #[error("unknown relation: {0}")]
    UnknownRelation(String),

    /// Registry lookup asked for a handle type other than the one the
    /// relation was declared with.
    #[error("relation {name} is declared as {found}, not {expected}")]
    WrongRelationType {
        name: String,
        expected: &'static str,
        found: &'static str,
    },

    /// Delivery addressed a channel name nothing was declared under.
    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    /// Delivery addressed a relation that is not channel-routable.
    #[error("relation {0} is not a channel")]
    NotAChannel(String),

    /// An inbound envelope carried a payload of the wrong tuple type.
    #[error("channel {channel} carries {expected}, rejected payload of type {found}")]
    ChannelTupleMismatch {
        channel: String,
        expected: &'static str,
        found: &'static str,
    },
}
