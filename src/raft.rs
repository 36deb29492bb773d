// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! A Raft-style consensus skeleton expressed as a dataflow program:
//! terms and role state are max-int lattices, election and commit quorums
//! are keyed tallies, and the four RPC kinds are channels.
//!
//! This is a skeleton, not a finished consensus implementation — the log
//! maintenance sub-module is incomplete (see the TODOs at the rules below),
//! and the timer inputs (`raftAlarm`, `raftAlarmReset`, `raftHeartbeat`)
//! are scratch relations an external periodic driver must populate through
//! the before-tick hook.
//!
//! Role state is encoded in one max-int: the low four bits carry the role
//! kind, the high bits a version that is bumped on step-down, so that
//! "step down" orders above any same-version role under the max lattice.

use crate::channel::Route;
use crate::error::DataflowError;
use crate::lattice::{BoolOr, MapEntry, MaxInt, SetUnion};
use crate::relation::{LMap, LMax, LSet};
use crate::tally::{multi_tally_init, MultiTallyVote};
use crate::Dataflow;
use serde::{Deserialize, Serialize};

/// Invoked by candidates to gather votes.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RaftVoteReq {
    pub to: String,
    /// Candidate requesting the vote.
    pub from: String,
    /// Candidate's term.
    pub term: i64,
    /// Term of the candidate's last log entry.
    pub last_log_term: i64,
    /// Index of the candidate's last log entry.
    pub last_log_index: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RaftVoteRes {
    pub to: String,
    pub from: String,
    /// Current term, for the candidate to update itself.
    pub term: i64,
    /// True means the candidate received the vote.
    pub granted: bool,
}

/// Invoked by leaders to replicate log entries.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RaftAddEntryReq {
    pub to: String,
    /// Leader's address, letting followers redirect clients.
    pub from: String,
    pub term: i64,
    /// Term of the log entry immediately preceding this one.
    pub prev_log_term: i64,
    /// Index of the log entry immediately preceding this one.
    pub prev_log_index: i64,
    /// Log entry to store; empty for a heartbeat.
    pub entry: String,
    /// Last entry known to be committed.
    pub commit_index: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RaftAddEntryRes {
    pub to: String,
    pub from: String,
    /// Current term, for the leader to update itself.
    pub term: i64,
    /// True if we had an entry matching prev_log_index/term.
    pub ok: bool,
    pub index: i64,
}

impl Route for RaftVoteReq {
    fn to(&self) -> &str {
        &self.to
    }
}
impl Route for RaftVoteRes {
    fn to(&self) -> &str {
        &self.to
    }
}
impl Route for RaftAddEntryReq {
    fn to(&self) -> &str {
        &self.to
    }
}
impl Route for RaftAddEntryRes {
    fn to(&self) -> &str {
        &self.to
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RaftVote {
    pub term: i64,
    pub candidate: String,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RaftEntry {
    /// Term when the entry was received by the leader.
    pub term: i64,
    /// Position of the entry in the log.
    pub index: i64,
    /// Command for the state machine.
    pub entry: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RaftLogState {
    pub last_term: i64,
    pub last_index: i64,
    pub last_commit_index: i64,
}

// The role kind lives in the lowest bits.
pub const STATE_FOLLOWER: i64 = 0;
pub const STATE_CANDIDATE: i64 = 1;
pub const STATE_LEADER: i64 = 2;
pub const STATE_STEP_DOWN: i64 = 3; // Must be largest for max-int precedence.

const STATE_KIND_MASK: i64 = 0xf;
const STATE_VERSION_MASK: i64 = !STATE_KIND_MASK; // High bits version for precedence.
const STATE_VERSION_STEP: i64 = 0x10;

pub fn state_kind(s: i64) -> i64 {
    s & STATE_KIND_MASK
}
pub fn state_version(s: i64) -> i64 {
    s & STATE_VERSION_MASK
}
pub fn state_version_next(s: i64) -> i64 {
    state_version(s) + STATE_VERSION_STEP
}

fn term_to_key(term: i64) -> String {
    term.to_string()
}
fn index_to_key(index: i64) -> String {
    index.to_string()
}
fn key_to_index(key: &str) -> i64 {
    key.parse().unwrap_or(-1)
}

fn case_step_down(term: i64, cur_term: i64, cur_state: i64) -> i64 {
    if term > cur_term {
        STATE_STEP_DOWN
    } else {
        state_kind(cur_state)
    }
}

/// The greatest entry recorded at one log index, preferring higher terms.
fn max_raft_entry(entries: &SetUnion<RaftEntry>) -> Option<RaftEntry> {
    entries
        .0
        .iter()
        .max_by(|a, b| (a.term, &a.entry).cmp(&(b.term, &b.entry)))
        .cloned()
}

/// Declare just the four RPC channels, for embedders wiring their own
/// rules around the protocol surface.
pub fn raft_protocol_init(d: &mut Dataflow, prefix: &str) -> Result<(), DataflowError> {
    d.declare_channel::<RaftVoteReq>(&format!("{}RaftVoteReq", prefix))?;
    d.declare_channel::<RaftVoteRes>(&format!("{}RaftVoteRes", prefix))?;
    d.declare_channel::<RaftAddEntryReq>(&format!("{}RaftAddEntryReq", prefix))?;
    d.declare_channel::<RaftAddEntryRes>(&format!("{}RaftAddEntryRes", prefix))?;
    Ok(())
}

pub fn raft_init(d: &mut Dataflow, prefix: &str) -> Result<(), DataflowError> {
    raft_protocol_init(d, prefix)?;

    let rvote: LSet<RaftVoteReq> = d.relation(&format!("{}RaftVoteReq", prefix))?;
    let rvoter: LSet<RaftVoteRes> = d.relation(&format!("{}RaftVoteRes", prefix))?;
    let radd: LSet<RaftAddEntryReq> = d.relation(&format!("{}RaftAddEntryReq", prefix))?;
    let raddr: LSet<RaftAddEntryRes> = d.relation(&format!("{}RaftAddEntryRes", prefix))?;

    let member: LSet<String> = d.declare_lset(&format!("{}raftMember", prefix))?;

    let cur_term = d.declare_lmax(&format!("{}raftCurTerm", prefix))?;
    let cur_state = d.declare_lmax(&format!("{}raftCurState", prefix))?;

    // The version-mask arithmetic assumes terms and states count from zero,
    // not from the max-int lattice bottom.
    cur_term.direct_add(0);
    cur_state.direct_add(STATE_FOLLOWER);

    let next_term = d.declare_lmax(&format!("{}raftNextTerm", prefix))?;
    d.scratch(&next_term);
    let next_state = d.declare_lmax(&format!("{}raftNextState", prefix))?;
    d.scratch(&next_state);

    // Timer inputs, populated by an external periodic driver.
    let alarm = d.declare_lbool(&format!("{}raftAlarm", prefix))?;
    d.scratch(&alarm);
    let alarm_reset = d.declare_lbool(&format!("{}raftAlarmReset", prefix))?;
    d.scratch(&alarm_reset);
    let heartbeat = d.declare_lbool(&format!("{}raftHeartbeat", prefix))?;
    d.scratch(&heartbeat);

    multi_tally_init(d, &format!("{}tallyLeader/", prefix))?;
    let tally_leader_vote: LSet<MultiTallyVote> =
        d.relation(&format!("{}tallyLeader/MultiTallyVote", prefix))?;
    let tally_leader_need: LMax = d.relation(&format!("{}tallyLeader/MultiTallyNeed", prefix))?;
    let tally_leader_done: LMap<String, BoolOr> =
        d.relation(&format!("{}tallyLeader/MultiTallyDone", prefix))?;
    let tally_leader_total: LMap<String, SetUnion<String>> =
        d.relation(&format!("{}tallyLeader/multiTallyTotal", prefix))?;

    let good_candidate: LSet<RaftVoteReq> =
        d.declare_lset(&format!("{}raftGoodCandidate", prefix))?;
    d.scratch(&good_candidate);
    let best_candidate = d.declare_lmax_string(&format!("{}raftBestCandidate", prefix))?;
    d.scratch(&best_candidate);

    // TODO: index votes by term with an LMap of vote sets instead of one
    // flat set.
    let voted_for: LSet<RaftVote> = d.declare_lset(&format!("{}raftVotedFor", prefix))?;
    let voted_for_in_cur_term: LSet<String> =
        d.declare_lset(&format!("{}raftVotedForInCurTerm", prefix))?;
    d.scratch(&voted_for_in_cur_term);

    // Key: entry index as a string, val: the entries seen at that index.
    let log_entry: LMap<String, SetUnion<RaftEntry>> =
        d.declare_lmap(&format!("{}raftEntry", prefix))?;
    let log_state: LSet<RaftLogState> = d.declare_lset(&format!("{}raftLogState", prefix))?; // TODO: sub-module.
    let log_add: LSet<RaftEntry> = d.declare_lset(&format!("{}raftLogAdd", prefix))?; // TODO: sub-module.
    let log_commit = d.declare_lmax(&format!("{}raftLogCommit", prefix))?; // TODO: sub-module.

    // Seed the empty-log row so rules joining on log state are not
    // vacuously empty before the first append.
    log_state.direct_add(RaftLogState::default());

    // Key: member address, val: next index to send that follower.
    let next_index: LMap<String, MaxInt> = d.declare_lmap(&format!("{}raftNextIndex", prefix))?;

    multi_tally_init(d, &format!("{}tallyCommit/", prefix))?;
    let tally_commit_vote: LSet<MultiTallyVote> =
        d.relation(&format!("{}tallyCommit/MultiTallyVote", prefix))?;
    let tally_commit_need: LMax = d.relation(&format!("{}tallyCommit/MultiTallyNeed", prefix))?;
    let tally_commit_done: LMap<String, BoolOr> =
        d.relation(&format!("{}tallyCommit/MultiTallyDone", prefix))?;

    // ------------------------------------------------------------------------

    let m = member.clone();
    d.join0()
        .select(move || m.size() as i64 / 2)
        .into(&tally_leader_need);
    let m = member.clone();
    d.join0()
        .select(move || m.size() as i64 / 2)
        .into(&tally_commit_need);

    // Initialize our scratch next term/state.
    d.join(&cur_term).into(&next_term);
    d.join(&cur_state)
        .select(|s: &i64| state_kind(*s))
        .into(&next_state);

    // Incorporate next term and next state asynchronously.
    d.join(&next_term).into_async(&cur_term);
    d.join2(&next_state, &cur_state)
        .select(|n: &i64, s: &i64| {
            if *n == STATE_STEP_DOWN {
                state_version_next(*s) + STATE_FOLLOWER
            } else {
                state_version(*s) + state_kind(*n)
            }
        })
        .into_async(&cur_state);

    // Any incoming higher terms take precedence.
    d.join(&rvote)
        .select(|r: &RaftVoteReq| r.term)
        .into(&next_term);
    d.join(&rvoter)
        .select(|r: &RaftVoteRes| r.term)
        .into(&next_term);
    d.join(&radd)
        .select(|r: &RaftAddEntryReq| r.term)
        .into(&next_term);
    d.join(&raddr)
        .select(|r: &RaftAddEntryRes| r.term)
        .into(&next_term);

    // Any incoming higher terms can make us step down.
    d.join3(&rvote, &cur_term, &cur_state)
        .select(|r: &RaftVoteReq, t: &i64, s: &i64| case_step_down(r.term, *t, *s))
        .into(&next_state);
    d.join3(&rvoter, &cur_term, &cur_state)
        .select(|r: &RaftVoteRes, t: &i64, s: &i64| case_step_down(r.term, *t, *s))
        .into(&next_state);
    d.join3(&radd, &cur_term, &cur_state)
        .select(|r: &RaftAddEntryReq, t: &i64, s: &i64| case_step_down(r.term, *t, *s))
        .into(&next_state);
    d.join3(&raddr, &cur_term, &cur_state)
        .select(|r: &RaftAddEntryRes, t: &i64, s: &i64| case_step_down(r.term, *t, *s))
        .into(&next_state);

    // Timeout means we should become a candidate.
    let nt = next_term.clone();
    let ns = next_state.clone();
    let tlv = tally_leader_vote.clone();
    let addr = d.addr().to_string();
    d.join3(&alarm, &cur_term, &cur_state)
        .apply(move |ops, alarm: &bool, t: &i64, s: &i64| {
            // Move to candidate state, with a new term, a vote for
            // ourselves, and an alarm reset.
            if *alarm && state_kind(*s) != STATE_LEADER {
                ops.add(&nt, *t + 1);
                ops.add(&ns, STATE_CANDIDATE);
                ops.add(
                    &tlv,
                    MultiTallyVote {
                        race: term_to_key(*t + 1),
                        voter: addr.clone(),
                    },
                );
                // TODO: reset the alarm once the periodic source can be told to.
                // TODO: drop uncommitted log entries when abandoning a term.
            }
        });

    // Send vote requests.
    let addr = d.addr().to_string();
    let tlt = tally_leader_total.clone();
    d.join5(&heartbeat, &member, &cur_term, &cur_state, &log_state)
        .select(
            move |_h: &bool, peer: &String, t: &i64, s: &i64, l: &RaftLogState| {
                let already = tlt
                    .at(&term_to_key(*t))
                    .map(|voters| voters.contains(peer))
                    .unwrap_or(false);
                if state_kind(*s) == STATE_CANDIDATE && !already {
                    Some(RaftVoteReq {
                        to: peer.clone(),
                        from: addr.clone(),
                        term: *t,
                        last_log_term: l.last_term,
                        last_log_index: l.last_index,
                    })
                } else {
                    None
                }
            },
        )
        .into_async(&rvote);

    // Tally votes when we're a candidate.
    d.join3(&cur_term, &cur_state, &rvoter)
        .select(|t: &i64, s: &i64, r: &RaftVoteRes| {
            // Record the granted vote if we're still a candidate in the
            // same term.
            if state_kind(*s) == STATE_CANDIDATE && r.term == *t && r.granted {
                Some(MultiTallyVote {
                    race: term_to_key(r.term),
                    voter: r.from.clone(),
                })
            } else {
                None
            }
        })
        .into(&tally_leader_vote);

    let tld = tally_leader_done.clone();
    d.join2(&cur_term, &cur_state)
        .select(move |t: &i64, s: &i64| {
            // Become leader if we won the race.
            if state_kind(*s) == STATE_CANDIDATE {
                if let Some(won) = tld.at(&term_to_key(*t)) {
                    if won.0 {
                        return STATE_LEADER;
                    }
                }
            }
            state_kind(*s)
        })
        .into(&next_state);

    // Cast votes.
    d.join2(&cur_term, &voted_for)
        .select(|t: &i64, v: &RaftVote| {
            // Remember who we voted for in the current term.
            if *t == v.term {
                Some(v.candidate.clone())
            } else {
                None
            }
        })
        .into(&voted_for_in_cur_term);

    d.join2(&rvote, &log_state)
        .select(|r: &RaftVoteReq, ls: &RaftLogState| {
            // Good candidate only if the candidate's log is at or beyond
            // ours.
            if r.last_log_term > ls.last_term
                || (r.last_log_term == ls.last_term && r.last_log_index >= ls.last_index)
            {
                Some(r.clone())
            } else {
                None
            }
        })
        .into(&good_candidate);

    // Not the greatest best function, but it's stable.
    d.join(&good_candidate)
        .select(|g: &RaftVoteReq| g.from.clone())
        .into(&best_candidate);

    let vfict = voted_for_in_cur_term.clone();
    d.join3(&rvote, &best_candidate, &cur_term)
        .select(move |r: &RaftVoteReq, b: &String, t: &i64| {
            // Grant the vote if we hadn't voted yet or already voted for
            // this candidate.
            let granted =
                r.term >= *t && ((vfict.size() == 0 && r.from == *b) || vfict.contains(&r.from));
            RaftVoteRes {
                to: r.from.clone(),
                from: r.to.clone(),
                term: *t,
                granted,
            }
        })
        .into_async(&rvoter); // TODO: reset the election timer when granting a vote.

    let vfict = voted_for_in_cur_term.clone();
    d.join2(&best_candidate, &cur_term)
        .select(move |b: &String, t: &i64| {
            // Remember our vote if we hadn't voted for anyone yet.
            if vfict.size() == 0 && !b.is_empty() {
                Some(RaftVote {
                    term: *t,
                    candidate: b.clone(),
                })
            } else {
                None
            }
        })
        .into_async(&voted_for);

    // Send heartbeats.
    let addr = d.addr().to_string();
    d.join5(&heartbeat, &member, &cur_term, &cur_state, &log_state)
        .select(
            move |_h: &bool, peer: &String, t: &i64, s: &i64, l: &RaftLogState| {
                if state_kind(*s) != STATE_LEADER {
                    return None;
                }
                Some(RaftAddEntryReq {
                    to: peer.clone(),
                    from: addr.clone(),
                    term: *t,
                    prev_log_term: l.last_term,
                    prev_log_index: l.last_index,
                    entry: String::new(),
                    commit_index: l.last_commit_index,
                })
            },
        )
        .into_async(&radd);

    // Handle add entry requests.
    d.join2(&radd, &cur_term)
        .select(|r: &RaftAddEntryReq, t: &i64| {
            // Reset the alarm if the term is current or our term is stale.
            // TODO: random alarm timeout.
            r.term >= *t
        })
        .into(&alarm_reset);

    d.join3(&radd, &cur_term, &log_state)
        .select(|r: &RaftAddEntryReq, t: &i64, ls: &RaftLogState| {
            // Fail response if the previous entry doesn't exist in our log.
            if r.prev_log_index <= ls.last_index {
                return None;
            }
            Some(RaftAddEntryRes {
                to: r.from.clone(),
                from: r.to.clone(),
                term: *t,
                ok: false,
                index: r.prev_log_index,
            })
        })
        .into_async(&raddr);

    let res_out = raddr.clone();
    let add_out = log_add.clone();
    d.join3(&radd, &cur_state, &log_entry).apply(
        move |ops, r: &RaftAddEntryReq, s: &i64, m: &MapEntry<String, SetUnion<RaftEntry>>| {
            // Send an ok response only if log terms match, and append the
            // entry when they do.
            if r.entry.is_empty()
                || state_kind(*s) == STATE_LEADER
                || key_to_index(&m.key) != r.prev_log_index
            {
                return;
            }
            let e = match max_raft_entry(&m.val) {
                Some(e) => e,
                None => return,
            };
            ops.add(
                &res_out,
                RaftAddEntryRes {
                    to: r.from.clone(),
                    from: r.to.clone(),
                    term: r.term,
                    ok: r.prev_log_term == e.term,
                    index: r.prev_log_index + 1,
                },
            );
            if r.prev_log_term == e.term {
                ops.add(
                    &add_out,
                    RaftEntry {
                        term: r.term,
                        index: r.prev_log_index + 1,
                        entry: r.entry.clone(),
                    },
                );
            }
            // TODO: truncate conflicting later entries on a failed match.
        },
    );

    d.join(&radd)
        .select(|r: &RaftAddEntryReq| r.commit_index)
        .into(&log_commit); // TODO: commit entries before (or at?) this point.

    // Update followers.

    let addr = d.addr().to_string();
    d.join6(
        &heartbeat,
        &cur_term,
        &cur_state,
        &log_entry,
        &log_state,
        &next_index,
    )
    .select(
        move |h: &bool,
              t: &i64,
              s: &i64,
              le: &MapEntry<String, SetUnion<RaftEntry>>,
              ls: &RaftLogState,
              n: &MapEntry<String, MaxInt>| {
            if !*h || state_kind(*s) != STATE_LEADER {
                return None;
            }
            let e = max_raft_entry(&le.val)?;
            if e.index != n.val.0 - 1 {
                return None;
            }
            // TODO: this does not reliably walk a lagging follower forward.
            Some(RaftAddEntryReq {
                to: n.key.clone(),
                from: addr.clone(),
                term: *t,
                prev_log_term: e.term,
                prev_log_index: key_to_index(&le.key),
                entry: e.entry.clone(),
                commit_index: ls.last_commit_index,
            })
        },
    )
    .into_async(&radd);

    d.join(&raddr)
        .select(|r: &RaftAddEntryRes| {
            if r.ok {
                Some(MultiTallyVote {
                    race: index_to_key(r.index),
                    voter: r.from.clone(),
                })
            } else {
                None
            }
        })
        .into(&tally_commit_vote);

    d.join(&tally_commit_done)
        .select(|m: &MapEntry<String, BoolOr>| {
            if m.val.0 {
                key_to_index(&m.key)
            } else {
                0
            }
        })
        .into(&log_commit); // TODO: commit entries before (or at?) this point.

    // TODO: maintain nextIndex from append responses
    //   (ok ⇒ index + 1, failed ⇒ index - 1).
    // TODO: feed committed entries into the embedder's state machine.

    Ok(())
}
