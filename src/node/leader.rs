use super::{Follower, Node, NodeID, RawNode, Role, Term, Ticks};
use crate::error::Result;
use crate::log::Index;
use crate::message::{AppendRequest, Envelope, Message, VoteResponse};

use ::log::{debug, info};
use itertools::Itertools as _;
use std::collections::{HashMap, HashSet};

/// Follower replication progress.
#[derive(Clone, Debug, PartialEq)]
pub struct Progress {
    /// The next index to send to the follower.
    pub(super) next_index: Index,
    /// The last index where the follower's log is known to match ours.
    pub(super) match_index: Index,
}

impl Progress {
    /// Attempts to advance a follower's match index, returning true if it
    /// did. next_index is bumped past it if necessary, but is otherwise left
    /// as is to avoid regressing it unnecessarily.
    fn advance(&mut self, match_index: Index) -> bool {
        if match_index <= self.match_index {
            return false;
        }
        self.match_index = match_index;
        self.next_index = std::cmp::max(self.next_index, match_index + 1);
        true
    }

    /// Regresses the next index to the given index, if it's currently
    /// greater. Can't regress below match_index + 1.
    fn regress_next(&mut self, next_index: Index) {
        if next_index >= self.next_index || self.next_index <= self.match_index + 1 {
            return;
        }
        self.next_index = std::cmp::max(next_index, self.match_index + 1);
    }
}

/// A leader replicates the log to followers and advances the commit index.
#[derive(Clone, Debug, PartialEq)]
pub struct Leader {
    /// Follower replication progress.
    pub(super) progress: HashMap<NodeID, Progress>,
    /// Number of ticks since the last periodic heartbeat.
    pub(super) since_heartbeat: Ticks,
}

impl Leader {
    /// Creates a new leader role. next_index starts just past the leader's
    /// last entry, and match_index at 0 until proven otherwise.
    pub(super) fn new(peers: HashSet<NodeID>, last_index: Index) -> Self {
        let next_index = last_index + 1;
        let progress =
            peers.into_iter().map(|p| (p, Progress { next_index, match_index: 0 })).collect();
        Self { progress, since_heartbeat: 0 }
    }
}

impl Role for Leader {}

impl RawNode<Leader> {
    /// Asserts internal invariants.
    fn assert(&mut self) {
        assert_ne!(self.term(), 0, "leaders can't have term 0");
        debug_assert_eq!(Some(self.id), self.log.get_term().1, "log vote does not match self");
    }

    /// Transitions the leader into a follower. This can only happen if we
    /// discover a new term, so we become a leaderless follower.
    fn into_follower(mut self, term: Term) -> Result<RawNode<Follower>> {
        assert!(term > self.term(), "can only become follower in later term");

        info!("Discovered new term {term}");
        self.log.set_term(term, None)?;
        let election_timeout = self.gen_election_timeout();
        Ok(self.into_role(Follower::new(None, election_timeout)))
    }

    /// Returns a mutable borrow of a peer's progress.
    fn progress(&mut self, id: NodeID) -> &mut Progress {
        self.role.progress.get_mut(&id).expect("unknown peer")
    }

    /// Proposes a command for consensus by appending it to our log and
    /// eagerly replicating it to all peers. If successful, it will
    /// eventually be committed and applied.
    pub(super) fn propose(&mut self, command: Vec<u8>) -> Result<Index> {
        let index = self.log.append(command)?;
        self.heartbeat()?;
        // A single-node cluster commits by itself.
        self.maybe_commit_and_apply()?;
        Ok(index)
    }

    /// Broadcasts an append to all peers, each carrying any entries pending
    /// for that peer according to its next_index. An append without entries
    /// acts as a heartbeat, suppressing follower election timeouts.
    pub(super) fn heartbeat(&self) -> Result<()> {
        // Sort for test determinism.
        for peer in self.peers.iter().copied().sorted() {
            self.send_append(peer)?;
        }
        Ok(())
    }

    /// Sends pending log entries to a peer, according to its next_index.
    fn send_append(&self, peer: NodeID) -> Result<()> {
        let (last_index, _) = self.log.get_last_index();
        let (leader_commit, _) = self.log.get_commit_index();
        let progress = self.role.progress.get(&peer).expect("unknown peer");
        assert!(progress.next_index >= 1, "next_index below 1");
        assert!(progress.next_index <= last_index + 1, "next_index beyond log");
        assert!(progress.match_index <= last_index, "match_index beyond log");

        let prev_log_index = progress.next_index - 1;
        let prev_log_term = self.log.get(prev_log_index).expect("missing base entry").term;
        let entries = self.log.entries_from(prev_log_index + 1);
        debug!("Replicating {} entries at base {prev_log_index} to {peer}", entries.len());
        self.send(
            peer,
            Message::AppendRequest(AppendRequest {
                term: self.term(),
                leader_id: self.id,
                leader_commit,
                prev_log_index,
                prev_log_term,
                entries,
            }),
        )
    }

    /// Commits any new entries that have been replicated to a quorum, and
    /// hands them to the apply driver.
    fn maybe_commit_and_apply(&mut self) -> Result<Index> {
        // The quorum index is the replication progress of the cluster's
        // majority, counting our own log.
        let quorum_index = self.quorum_value(
            self.role
                .progress
                .values()
                .map(|p| p.match_index)
                .chain(std::iter::once(self.log.get_last_index().0))
                .collect(),
        );

        // If the commit index doesn't advance, do nothing. We don't assert
        // on this, since the quorum value may regress e.g. following a
        // restart or leader change where followers are initialized with
        // match index 0.
        let (commit_index, _) = self.log.get_commit_index();
        if quorum_index <= commit_index {
            return Ok(commit_index);
        }

        // We can only safely commit an entry from our own term by counting
        // replicas (see section 5.4.2 in the Raft paper).
        match self.log.get(quorum_index) {
            Some(entry) if entry.term == self.term() => {}
            Some(_) => return Ok(commit_index),
            None => panic!("missing quorum index {quorum_index}"),
        }

        self.log.commit(quorum_index)?;
        self.maybe_apply()?;
        Ok(quorum_index)
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
        // follower in it. Requests are then stepped as a follower, while
        // responses carry nothing beyond the term update itself (e.g. a
        // refusal of an append we sent before losing leadership).
        if msg.message.term() > self.term() {
            let node = self.into_follower(msg.message.term())?;
            return match msg.message {
                Message::VoteRequest(_) | Message::AppendRequest(_) => node.step(msg),
                Message::VoteResponse(_) | Message::AppendResponse(_) => Ok(node.into()),
            };
        }

        match msg.message {
            // A follower appended our entries. Record its progress and
            // attempt to commit. Further pending entries go out with the
            // next heartbeat.
            Message::AppendResponse(res) if res.success => {
                assert!(res.next_index >= 1, "success without next index");
                let match_index = res.next_index - 1;
                let (last_index, _) = self.log.get_last_index();
                assert!(match_index <= last_index, "follower matched unknown index");

                if self.progress(msg.from).advance(match_index) {
                    self.maybe_commit_and_apply()?;
                }
            }

            // A follower rejected an append because the base entry didn't
            // match its log. Regress next_index towards its hint and retry
            // on the next heartbeat.
            Message::AppendResponse(res) => {
                debug!("Append rejected by {}, hint {}", msg.from, res.next_index);
                let next_index = std::cmp::max(res.next_index, 1);
                self.progress(msg.from).regress_next(next_index);
            }

            // Don't grant other votes in this term.
            Message::VoteRequest(_) => self.send(
                msg.from,
                Message::VoteResponse(VoteResponse { term: self.term(), vote_granted: false }),
            )?,

            // Votes can come in after we won the election, ignore them.
            Message::VoteResponse(_) => {}

            // There can't be two leaders in the same term.
            Message::AppendRequest(req) => {
                panic!("saw other leader {} in term {}", msg.from, req.term)
            }
        }
        Ok(self.into())
    }

    /// Processes a logical clock tick.
    pub(super) fn tick(mut self) -> Result<Node> {
        self.assert();

        self.role.since_heartbeat += 1;
        if self.role.since_heartbeat >= self.opts.heartbeat_interval {
            self.heartbeat()?;
            self.role.since_heartbeat = 0;
        }
        Ok(self.into())
    }
}
