// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Path discovery over a link relation: each tick extends known paths by
//! one hop, so an n-hop route surfaces after n ticks. Paths accumulate
//! monotonically; "shortest" is a query over the accumulated set (pick the
//! minimum cost between two endpoints), not a deletion discipline.

use crate::error::DataflowError;
use crate::relation::LSet;
use crate::Dataflow;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Link {
    pub from: String,
    pub to: String,
    pub cost: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Path {
    pub from: String,
    pub to: String,
    pub next: String,
    pub cost: i64,
}

pub fn shortest_path_init(d: &mut Dataflow, prefix: &str) -> Result<(), DataflowError> {
    let link: LSet<Link> = d.declare_lset(&format!("{}ShortestPathLink", prefix))?;
    let path: LSet<Path> = d.declare_lset(&format!("{}ShortestPath", prefix))?;

    d.join(&link)
        .name("links are paths")
        .select(|l: &Link| Path {
            from: l.from.clone(),
            to: l.to.clone(),
            next: l.to.clone(),
            cost: l.cost,
        })
        .into(&path);

    d.join2(&link, &path)
        .name("extend paths")
        .select(|l: &Link, p: &Path| {
            if l.to == p.from {
                Some(Path {
                    from: l.from.clone(),
                    to: p.to.clone(),
                    next: l.to.clone(),
                    cost: l.cost + p.cost,
                })
            } else {
                None
            }
        })
        .into(&path);

    Ok(())
}
