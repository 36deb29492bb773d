// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! A key-value store as a dataflow program, in two layers.
//!
//! The local layer maps each key to a max-string register, so concurrent
//! writes to one key deterministically keep the lexicographically greatest
//! value. Embedders that want last-writer-wins in wall-clock terms prefix
//! values with a sortable timestamp.
//!
//! The replicated layer gossips the whole store to every member each tick
//! and merges received snapshots back in with a flatten join — the map
//! lattice does the reconciliation, so replicas converge regardless of
//! delivery order or loss.

use crate::channel::Route;
use crate::error::DataflowError;
use crate::lattice::{MapEntry, MapUnion, MaxStr};
use crate::relation::{LMap, LSet};
use crate::Dataflow;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KVPut {
    pub key: String,
    pub val: String,
}

pub fn kv_init(d: &mut Dataflow, prefix: &str) -> Result<(), DataflowError> {
    let put: LSet<KVPut> = d.declare_lset(&format!("{}KVPut", prefix))?;
    d.input(&put);
    let store: LMap<String, MaxStr> = d.declare_lmap(&format!("{}kvStore", prefix))?;

    d.join(&put)
        .select(|p: &KVPut| MapEntry::new(p.key.clone(), MaxStr(p.val.clone())))
        .into(&store);

    Ok(())
}

pub fn kv_get(d: &Dataflow, prefix: &str, key: &str) -> Option<String> {
    let store: LMap<String, MaxStr> = d.relation(&format!("{}kvStore", prefix)).ok()?;
    store.at(&key.to_string()).map(|v| v.0)
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KVGossip {
    pub to: String,
    pub from: String,
    pub store: MapUnion<String, MaxStr>,
}

impl Route for KVGossip {
    fn to(&self) -> &str {
        &self.to
    }
}

pub fn replicated_kv_init(d: &mut Dataflow, prefix: &str) -> Result<(), DataflowError> {
    kv_init(d, prefix)?;

    let store: LMap<String, MaxStr> = d.relation(&format!("{}kvStore", prefix))?;
    let member: LSet<String> = d.declare_lset(&format!("{}kvMember", prefix))?;
    let gossip: LSet<KVGossip> = d.declare_channel(&format!("{}KVGossip", prefix))?;

    let addr = d.addr().to_string();
    let snapshot = store.clone();
    d.join(&member)
        .name("kv gossip out")
        .select(move |peer: &String| KVGossip {
            to: peer.clone(),
            from: addr.clone(),
            store: snapshot.state(),
        })
        .into_async(&gossip);

    d.join(&gossip)
        .name("kv gossip in")
        .select_flat(|g: &KVGossip| g.store.clone())
        .into(&store);

    Ok(())
}
