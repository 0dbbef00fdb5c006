use super::{Follower, Leader, Node, NodeID, RawNode, Role, Term, Ticks};
use crate::error::Result;
use crate::message::{Envelope, Message, VoteRequest, VoteResponse};

use ::log::info;
use std::collections::HashMap;

/// A candidate is campaigning to become a leader.
#[derive(Clone, Debug, PartialEq)]
pub struct Candidate {
    /// Votes received from each peer, recorded at most once per peer. Our
    /// own vote is included.
    pub(super) votes: HashMap<NodeID, bool>,
    /// Ticks elapsed since election start.
    pub(super) election_duration: Ticks,
    /// Election timeout, in ticks.
    pub(super) election_timeout: Ticks,
}

impl Candidate {
    /// Creates a new candidate role.
    pub(super) fn new(election_timeout: Ticks) -> Self {
        Self { votes: HashMap::new(), election_duration: 0, election_timeout }
    }
}

impl Role for Candidate {}

impl RawNode<Candidate> {
    /// Asserts internal invariants.
    fn assert(&mut self) {
        assert_ne!(self.term(), 0, "candidates can't have term 0");
        assert_eq!(self.role.votes.get(&self.id), Some(&true), "candidate did not vote for self");
        debug_assert_eq!(Some(self.id), self.log.get_term().1, "log vote does not match self");
        assert!(self.role.election_duration < self.role.election_timeout, "election timeout passed");
    }

    /// Transitions the candidate to a follower. We either lost the election
    /// and follow the winner, or we discovered a new term in which case we
    /// step into it as a leaderless follower.
    fn into_follower(mut self, term: Term, leader: Option<NodeID>) -> Result<RawNode<Follower>> {
        assert!(term >= self.term(), "term regression {} to {}", self.term(), term);

        let election_timeout = self.gen_election_timeout();
        if let Some(leader) = leader {
            // We lost the election, follow the winner.
            assert_eq!(term, self.term(), "can't follow leader in different term");
            info!("Lost election, following leader {leader} in term {term}");
            Ok(self.into_role(Follower::new(Some(leader), election_timeout)))
        } else {
            // We found a new term, but we don't necessarily know who the
            // leader is yet. We'll find out when we step a message from it.
            assert_ne!(term, self.term(), "can't be leaderless follower in current term");
            info!("Discovered new term {term}");
            self.log.set_term(term, None)?;
            Ok(self.into_role(Follower::new(None, election_timeout)))
        }
    }

    /// Transitions the candidate to a leader. We won the election. The new
    /// leader immediately broadcasts an empty append to assert leadership
    /// and suppress other elections.
    fn into_leader(self) -> Result<RawNode<Leader>> {
        info!("Won election for term {}, becoming leader", self.term());
        let peers = self.peers.clone();
        let (last_index, _) = self.log.get_last_index();
        let mut node = self.into_role(Leader::new(peers, last_index));
        node.heartbeat()?;
        Ok(node)
    }

    /// Assumes leadership if the votes received so far form a quorum,
    /// otherwise remains a candidate awaiting more votes.
    pub(super) fn maybe_lead(self) -> Result<Node> {
        let granted = self.role.votes.values().filter(|granted| **granted).count();
        if granted >= self.quorum_size() {
            return Ok(self.into_leader()?.into());
        }
        Ok(self.into())
    }

    /// Campaigns for leadership by entering a new term, voting for ourself,
    /// and soliciting votes from all peers.
    pub(super) fn campaign(&mut self) -> Result<()> {
        let term = self.term() + 1;
        info!("Starting new election for term {term}");
        self.role = Candidate::new(self.gen_election_timeout());
        self.role.votes.insert(self.id, true); // vote for ourself
        self.log.set_term(term, Some(self.id))?;

        let (last_log_index, last_log_term) = self.log.get_last_index();
        self.broadcast(Message::VoteRequest(VoteRequest {
            term,
            candidate_id: self.id,
            last_log_index,
            last_log_term,
        }))?;
        Ok(())
    }

    /// Records a vote response from a peer. The first response per peer
    /// wins; repeats and reordered duplicates are ignored.
    fn poll(&mut self, from: NodeID, granted: bool) {
        self.role.votes.entry(from).or_insert(granted);
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
        // beyond the term update itself (e.g. a vote refusal from a peer
        // that has moved on).
        if msg.message.term() > self.term() {
            let node = self.into_follower(msg.message.term(), None)?;
            return match msg.message {
                Message::VoteRequest(_) | Message::AppendRequest(_) => node.step(msg),
                Message::VoteResponse(_) | Message::AppendResponse(_) => Ok(node.into()),
            };
        }

        match msg.message {
            // Don't grant votes for other candidates who also campaign.
            Message::VoteRequest(_) => self.send(
                msg.from,
                Message::VoteResponse(VoteResponse { term: self.term(), vote_granted: false }),
            )?,

            // Record the vote. If the votes give us quorum, assume
            // leadership.
            Message::VoteResponse(res) => {
                self.poll(msg.from, res.vote_granted);
                return self.maybe_lead();
            }

            // If we receive an append in this term, we lost the election and
            // have a new leader. Follow it and step the message.
            Message::AppendRequest(_) => {
                let term = self.term();
                return self.into_follower(term, Some(msg.from))?.step(msg);
            }

            // We're not a leader in this term, so we shouldn't see these.
            Message::AppendResponse(_) => panic!("received unexpected message {msg:?}"),
        }
        Ok(self.into())
    }

    /// Processes a logical clock tick. If the election times out without a
    /// winner, start a fresh election in a new term.
    pub(super) fn tick(mut self) -> Result<Node> {
        self.assert();

        self.role.election_duration += 1;
        if self.role.election_duration >= self.role.election_timeout {
            self.campaign()?;
            return self.maybe_lead();
        }
        Ok(self.into())
    }
}
