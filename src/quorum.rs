// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Quorum voting: every node sends its vote to a coordinator each tick;
//! the coordinator accumulates voters into a persistent set and reports
//! completion once the set reaches the threshold. Re-sent votes are
//! absorbed by the set lattice, so loss and re-delivery need no handling.

use crate::channel::Route;
use crate::error::DataflowError;
use crate::relation::{LBool, LSet};
use crate::Dataflow;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QuorumVote {
    pub to: String,
    pub from: String,
}

impl Route for QuorumVote {
    fn to(&self) -> &str {
        &self.to
    }
}

pub fn quorum_init(
    d: &mut Dataflow,
    prefix: &str,
    need: i64,
    coordinator: &str,
) -> Result<(), DataflowError> {
    let vote: LSet<QuorumVote> = d.declare_channel(&format!("{}QuorumVote", prefix))?;
    let voted: LSet<String> = d.declare_lset(&format!("{}quorumVoted", prefix))?;
    let qneed = d.declare_lmax(&format!("{}QuorumNeed", prefix))?;
    let qdone = d.declare_lbool(&format!("{}QuorumDone", prefix))?;
    d.output(&qdone);

    qneed.direct_add(need);

    let addr = d.addr().to_string();
    let coord = coordinator.to_string();
    d.join0()
        .name("send vote")
        .select(move || QuorumVote {
            to: coord.clone(),
            from: addr.clone(),
        })
        .into_async(&vote);

    d.join(&vote)
        .name("record voters")
        .select(|v: &QuorumVote| v.from.clone())
        .into(&voted);

    let voters = voted.clone();
    let threshold = qneed.clone();
    d.join0()
        .name("check quorum")
        .select(move || voters.size() as i64 >= threshold.get())
        .into(&qdone);

    Ok(())
}

pub fn quorum_done(d: &Dataflow, prefix: &str) -> bool {
    d.relation::<LBool>(&format!("{}QuorumDone", prefix))
        .map(|b| b.get())
        .unwrap_or(false)
}
