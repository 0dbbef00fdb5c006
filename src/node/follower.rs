use super::{Candidate, Node, NodeID, Options, RawNode, Role, Term, Ticks};
use crate::apply::Instruction;
use crate::error::Result;
use crate::log::{Index, Log};
use crate::message::{AppendResponse, Envelope, Message, VoteResponse};

use ::log::{debug, info};
use std::collections::HashSet;

/// A follower replicates state from a leader, granting votes and appending
/// entries, and campaigns for leadership if the leader goes quiet.
#[derive(Clone, Debug, PartialEq)]
pub struct Follower {
    /// The current leader, or None if we haven't heard from one yet.
    pub(super) leader: Option<NodeID>,
    /// The number of ticks since the last message from the leader.
    pub(super) leader_seen: Ticks,
    /// The randomized election timeout, in ticks.
    pub(super) election_timeout: Ticks,
}

impl Follower {
    /// Creates a new follower role.
    pub(super) fn new(leader: Option<NodeID>, election_timeout: Ticks) -> Self {
        Self { leader, leader_seen: 0, election_timeout }
    }
}

impl Role for Follower {}

impl RawNode<Follower> {
    /// Creates a new node as a leaderless follower.
    pub(super) fn new(
        id: NodeID,
        peers: HashSet<NodeID>,
        log: Log,
        node_tx: crossbeam::channel::Sender<Envelope>,
        applier_tx: crossbeam::channel::Sender<Instruction>,
        opts: Options,
    ) -> Result<Self> {
        let role = Follower::new(None, 0);
        let mut node = Self { id, peers, log, node_tx, applier_tx, applied_index: 0, opts, role };
        node.role.election_timeout = node.gen_election_timeout();
        Ok(node)
    }

    /// Asserts internal invariants.
    fn assert(&mut self) {
        if let Some(leader) = self.role.leader {
            assert_ne!(leader, self.id, "can't follow self");
            assert!(self.peers.contains(&leader), "leader not in peers");
            assert_ne!(self.term(), 0, "followers with leaders can't have term 0");
        }
        assert!(self.role.leader_seen < self.role.election_timeout, "election timeout passed");
    }

    /// Transitions the follower into a candidate, campaigning for leadership
    /// in a new term. A single-node cluster wins immediately.
    fn into_candidate(self) -> Result<Node> {
        let election_timeout = self.gen_election_timeout();
        let mut node = self.into_role(Candidate::new(election_timeout));
        node.campaign()?;
        node.maybe_lead()
    }

    /// Transitions the follower into a follower, either a leaderless
    /// follower in a new term (e.g. if someone holds a new election) or
    /// following a leader in the current term once someone wins the
    /// election.
    pub(super) fn into_follower(
        mut self,
        leader: Option<NodeID>,
        term: Term,
    ) -> Result<RawNode<Follower>> {
        assert!(term >= self.term(), "term regression {} to {}", self.term(), term);

        if let Some(leader) = leader {
            // We found a leader in the current term.
            assert_eq!(self.role.leader, None, "already have leader in term");
            assert_eq!(term, self.term(), "can't follow leader in different term");
            info!("Following leader {leader} in term {term}");
            self.role = Follower::new(Some(leader), self.role.election_timeout);
        } else {
            // We found a new term, but we don't necessarily know who the
            // leader is yet. We'll find out when we step a message from it.
            assert_ne!(term, self.term(), "can't be leaderless follower in current term");
            info!("Discovered new term {term}");
            self.log.set_term(term, None)?;
            self.role = Follower::new(None, self.gen_election_timeout());
        }
        Ok(self)
    }

    /// Processes a message.
    pub(super) fn step(mut self, msg: Envelope) -> Result<Node> {
        self.assert();
        self.assert_step(&msg);

        // Requests from past terms are refused with our current term, and
        // responses from past terms are dropped.
        if msg.message.term() < self.term() {
            self.refuse_stale(msg)?;
            return Ok(self.into());
        }

        // If we receive a message for a future term, become a leaderless
        // follower in it. Requests are then stepped again, following the
        // sender if it is the new leader, while responses carry nothing
        // beyond the term update itself.
        if msg.message.term() > self.term() {
            let node = self.into_follower(None, msg.message.term())?;
            return match msg.message {
                Message::VoteRequest(_) | Message::AppendRequest(_) => node.step(msg),
                Message::VoteResponse(_) | Message::AppendResponse(_) => Ok(node.into()),
            };
        }

        match msg.message {
            // A candidate in this term is requesting our vote.
            Message::VoteRequest(req) => {
                assert_eq!(msg.from, req.candidate_id, "vote request from other node");

                // Don't vote if we already voted for someone else in this
                // term.
                if let (_, Some(vote)) = self.log.get_term() {
                    if req.candidate_id != vote {
                        self.send(
                            msg.from,
                            Message::VoteResponse(VoteResponse {
                                term: self.term(),
                                vote_granted: false,
                            }),
                        )?;
                        return Ok(self.into());
                    }
                }

                // Don't vote if our log is more up-to-date than the
                // candidate's log.
                let (last_index, last_term) = self.log.get_last_index();
                if req.last_log_term < last_term
                    || (req.last_log_term == last_term && req.last_log_index < last_index)
                {
                    self.send(
                        msg.from,
                        Message::VoteResponse(VoteResponse {
                            term: self.term(),
                            vote_granted: false,
                        }),
                    )?;
                    return Ok(self.into());
                }

                // Grant the vote, persisting it before the reply attests to
                // it.
                info!("Voting for {} in term {} election", req.candidate_id, req.term);
                self.log.set_term(req.term, Some(req.candidate_id))?;
                self.send(
                    msg.from,
                    Message::VoteResponse(VoteResponse { term: self.term(), vote_granted: true }),
                )?;
            }

            // The leader is replicating entries, or heartbeating if the
            // entries are empty. Either way, follow it and reset the
            // election timer.
            Message::AppendRequest(req) => {
                assert_eq!(msg.from, req.leader_id, "append request from other node");

                match self.role.leader {
                    Some(leader) => assert_eq!(msg.from, leader, "multiple leaders in term"),
                    None => self = self.into_follower(Some(msg.from), req.term)?,
                }
                self.role.leader_seen = 0;

                // Consistency check: the entry preceding the incoming ones
                // must be in our log, otherwise reject with a conservative
                // retry hint, clamped to >= 1.
                if !self.log.has(req.prev_log_index, req.prev_log_term) {
                    debug!("Rejecting append at base {}", req.prev_log_index);
                    let (commit_index, _) = self.log.get_commit_index();
                    let next_index = std::cmp::max(
                        1,
                        std::cmp::min(commit_index + 1, req.prev_log_index.saturating_sub(1)),
                    );
                    self.send(
                        msg.from,
                        Message::AppendResponse(AppendResponse {
                            term: self.term(),
                            success: false,
                            next_index,
                        }),
                    )?;
                    return Ok(self.into());
                }

                // Merge the entries into the log, then advance the commit
                // index up to the leader's and apply the new entries.
                let verified = req.prev_log_index + req.entries.len() as Index;
                self.log.splice(req.prev_log_index, req.entries)?;
                if req.leader_commit > self.log.get_commit_index().0 {
                    let (last_index, _) = self.log.get_last_index();
                    self.log.commit(std::cmp::min(req.leader_commit, last_index))?;
                    self.maybe_apply()?;
                }

                // Acknowledge only the prefix this request verified; our log
                // may extend further with entries the leader knows nothing
                // about.
                self.send(
                    msg.from,
                    Message::AppendResponse(AppendResponse {
                        term: self.term(),
                        success: true,
                        next_index: verified + 1,
                    }),
                )?;
            }

            // We may receive a vote after we lost an election and followed a
            // different leader, or an append refusal from when we were the
            // leader of an earlier term and just got deposed. Ignore them.
            Message::VoteResponse(_) => {}
            Message::AppendResponse(res) => {
                debug!("Dropping late append response from {}: {:?}", msg.from, res)
            }
        }
        Ok(self.into())
    }

    /// Processes a logical clock tick.
    pub(super) fn tick(mut self) -> Result<Node> {
        self.assert();

        self.role.leader_seen += 1;
        if self.role.leader_seen >= self.role.election_timeout {
            return self.into_candidate();
        }
        Ok(self.into())
    }
}
