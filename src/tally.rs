// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Vote tallying, in two sizes: a single counter and a keyed family of
//! counters for multiple in-flight races. Both are plain dataflow programs
//! over the engine; the raft module instantiates the keyed one twice
//! (leader election, commit quorum) under distinct prefixes.

use crate::error::DataflowError;
use crate::lattice::{BoolOr, MapEntry, SetUnion};
use crate::relation::{LMap, LSet};
use crate::Dataflow;
use serde::{Deserialize, Serialize};

/// Simple vote tally: `TallyDone` flips once the voter set reaches
/// `TallyNeed`.
pub fn tally_init(d: &mut Dataflow, prefix: &str) -> Result<(), DataflowError> {
    let tvote: LSet<String> = d.declare_lset(&format!("{}TallyVote", prefix))?;
    d.input(&tvote);
    let tneed = d.declare_lmax(&format!("{}TallyNeed", prefix))?;
    let tdone = d.declare_lbool(&format!("{}TallyDone", prefix))?;
    d.output(&tdone);

    let ttotal: LSet<String> = d.declare_lset(&format!("{}tallyTotal", prefix))?;

    d.join(&tvote).into(&ttotal);

    let total = ttotal.clone();
    let need = tneed.clone();
    d.join0()
        .select(move || total.size() as i64 >= need.get())
        .into(&tdone);

    Ok(())
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MultiTallyVote {
    pub race: String,
    pub voter: String,
}

/// Multiple tallies keyed by race: `MultiTallyDone` maps each race to
/// whether its voter set has reached `MultiTallyNeed`.
pub fn multi_tally_init(d: &mut Dataflow, prefix: &str) -> Result<(), DataflowError> {
    let tvote: LSet<MultiTallyVote> = d.declare_lset(&format!("{}MultiTallyVote", prefix))?;
    d.input(&tvote);
    let tneed = d.declare_lmax(&format!("{}MultiTallyNeed", prefix))?;
    let tdone: LMap<String, BoolOr> = d.declare_lmap(&format!("{}MultiTallyDone", prefix))?;
    d.output(&tdone);

    // Key: race, val: the voters seen so far.
    let ttotal: LMap<String, SetUnion<String>> =
        d.declare_lmap(&format!("{}multiTallyTotal", prefix))?;

    d.join(&tvote)
        .select(|v: &MultiTallyVote| MapEntry::new(v.race.clone(), SetUnion::one(v.voter.clone())))
        .into(&ttotal);

    let need = tneed.clone();
    d.join(&ttotal)
        .select(move |m: &MapEntry<String, SetUnion<String>>| {
            MapEntry::new(m.key.clone(), BoolOr(m.val.len() as i64 >= need.get()))
        })
        .into(&tdone);

    Ok(())
}

/// The voters recorded for `race`, if any.
pub fn multi_tally_voters(d: &Dataflow, prefix: &str, race: &str) -> Option<SetUnion<String>> {
    let total: LMap<String, SetUnion<String>> = d
        .relation(&format!("{}multiTallyTotal", prefix))
        .ok()?;
    total.at(&race.to_string())
}

pub fn multi_tally_has_vote_from(d: &Dataflow, prefix: &str, race: &str, voter: &str) -> bool {
    match multi_tally_voters(d, prefix, race) {
        Some(voters) => voters.contains(&voter.to_string()),
        None => false,
    }
}
