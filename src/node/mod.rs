mod candidate;
mod follower;
mod leader;

pub use candidate::Candidate;
pub use follower::Follower;
pub use leader::Leader;

use crate::apply::Instruction;
use crate::error::Result;
use crate::log::{Index, Log};
use crate::message::{AppendResponse, Envelope, Message, VoteResponse};

use ::log::debug;
use itertools::Itertools as _;
use rand::Rng as _;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// A node ID: the peer's position in the fixed, ordered roster.
pub type NodeID = u8;

/// A leader term.
pub type Term = u64;

/// A logical clock interval as number of ticks.
pub type Ticks = u8;

/// The default interval between logical clock ticks.
const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// The default number of ticks between leader heartbeats.
const HEARTBEAT_INTERVAL: Ticks = 1;

/// The default base election timeout in ticks. Actual timeouts are drawn
/// uniformly from [timeout, 2 * timeout).
const ELECTION_TIMEOUT: Ticks = 5;

/// Raft node options.
#[derive(Clone, Debug)]
pub struct Options {
    /// The real-time interval of a logical clock tick.
    pub tick_interval: Duration,
    /// The number of ticks between leader heartbeats.
    pub heartbeat_interval: Ticks,
    /// The base election timeout in ticks. Followers and candidates draw a
    /// randomized timeout uniformly from [timeout, 2 * timeout) whenever the
    /// timer resets.
    pub election_timeout: Ticks,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            tick_interval: TICK_INTERVAL,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            election_timeout: ELECTION_TIMEOUT,
        }
    }
}

/// A point-in-time status snapshot of a node.
#[derive(Clone, Debug, PartialEq)]
pub struct Status {
    /// The node which generated this status.
    pub server: NodeID,
    /// The current term.
    pub term: Term,
    /// The best-known current leader, if any.
    pub leader: Option<NodeID>,
    /// The last log index.
    pub last_index: Index,
    /// The commit index.
    pub commit_index: Index,
    /// Follower match indexes, populated on the leader.
    pub match_index: HashMap<NodeID, Index>,
}

/// A Raft node, with a dynamic role. The node is driven synchronously by
/// processing inbound messages via step() or by advancing time via tick().
/// These methods consume the current node, and return a new one with a
/// possibly different role. Outbound messages are sent via the given node_tx
/// channel, and committed entries are handed to the apply driver via
/// applier_tx; neither send blocks, so the caller's tick handler never does.
///
/// This enum wraps the RawNode<Role> types, which implement the actual node
/// logic. It exists for ergonomic use across role transitions, i.e.
/// node = node.step()?.
pub enum Node {
    Candidate(RawNode<Candidate>),
    Follower(RawNode<Follower>),
    Leader(RawNode<Leader>),
}

impl Node {
    /// Creates a new Raft node, starting as a leaderless follower. Any
    /// committed prefix recovered from the log is redelivered to the apply
    /// driver, since the applied index is volatile.
    pub fn new(
        id: NodeID,
        peers: HashSet<NodeID>,
        log: Log,
        node_tx: crossbeam::channel::Sender<Envelope>,
        applier_tx: crossbeam::channel::Sender<Instruction>,
        opts: Options,
    ) -> Result<Self> {
        let mut node = RawNode::new(id, peers, log, node_tx, applier_tx, opts)?;
        node.maybe_apply()?;
        Ok(node.into())
    }

    /// Returns the node ID.
    pub fn id(&self) -> NodeID {
        match self {
            Node::Candidate(n) => n.id,
            Node::Follower(n) => n.id,
            Node::Leader(n) => n.id,
        }
    }

    /// Returns the node term.
    pub fn term(&self) -> Term {
        match self {
            Node::Candidate(n) => n.term(),
            Node::Follower(n) => n.term(),
            Node::Leader(n) => n.term(),
        }
    }

    /// Returns true if the node currently believes it is the leader.
    pub fn is_leader(&self) -> bool {
        matches!(self, Node::Leader(_))
    }

    /// Returns the best-known current leader, if any.
    pub fn leader(&self) -> Option<NodeID> {
        match self {
            Node::Candidate(_) => None,
            Node::Follower(n) => n.role.leader,
            Node::Leader(n) => Some(n.id),
        }
    }

    /// Returns a status snapshot.
    pub fn status(&self) -> Status {
        let (id, log, leader, match_index) = match self {
            Node::Candidate(n) => (n.id, &n.log, None, HashMap::new()),
            Node::Follower(n) => (n.id, &n.log, n.role.leader, HashMap::new()),
            Node::Leader(n) => {
                let match_index = n
                    .role
                    .progress
                    .iter()
                    .map(|(id, p)| (*id, p.match_index))
                    .chain(std::iter::once((n.id, n.log.get_last_index().0)))
                    .collect();
                (n.id, &n.log, Some(n.id), match_index)
            }
        };
        Status {
            server: id,
            term: log.get_term().0,
            leader,
            last_index: log.get_last_index().0,
            commit_index: log.get_commit_index().0,
            match_index,
        }
    }

    /// Proposes a command for consensus, appending it to the leader's log
    /// and replicating it to peers. Returns the entry's index and term, or
    /// None if this node is not the leader and the caller should retry
    /// against another peer.
    pub fn propose(&mut self, command: Vec<u8>) -> Result<Option<(Index, Term)>> {
        match self {
            Node::Leader(n) => {
                let index = n.propose(command)?;
                Ok(Some((index, n.term())))
            }
            Node::Candidate(_) | Node::Follower(_) => Ok(None),
        }
    }

    /// Processes a message from a peer.
    pub fn step(self, msg: Envelope) -> Result<Self> {
        debug!("Stepping {:?}", msg);
        match self {
            Node::Candidate(n) => n.step(msg),
            Node::Follower(n) => n.step(msg),
            Node::Leader(n) => n.step(msg),
        }
    }

    /// Moves time forward by a tick.
    pub fn tick(self) -> Result<Self> {
        match self {
            Node::Candidate(n) => n.tick(),
            Node::Follower(n) => n.tick(),
            Node::Leader(n) => n.tick(),
        }
    }
}

impl From<RawNode<Candidate>> for Node {
    fn from(n: RawNode<Candidate>) -> Self {
        Node::Candidate(n)
    }
}

impl From<RawNode<Follower>> for Node {
    fn from(n: RawNode<Follower>) -> Self {
        Node::Follower(n)
    }
}

impl From<RawNode<Leader>> for Node {
    fn from(n: RawNode<Leader>) -> Self {
        Node::Leader(n)
    }
}

/// A Raft role: leader, follower, or candidate.
pub trait Role {}

/// A Raft node with the concrete role R.
///
/// This implements the typestate pattern, where individual node states
/// (roles) are encoded as RawNode<Role>, so role-specific state only exists
/// where it is meaningful. See: http://cliffle.com/blog/rust-typestate/
pub struct RawNode<R: Role = Follower> {
    id: NodeID,
    peers: HashSet<NodeID>,
    log: Log,
    node_tx: crossbeam::channel::Sender<Envelope>,
    applier_tx: crossbeam::channel::Sender<Instruction>,
    /// The index of the last entry handed to the apply driver. Volatile:
    /// resets to 0 on restart, redelivering the committed prefix.
    applied_index: Index,
    opts: Options,
    role: R,
}

impl<R: Role> RawNode<R> {
    /// Helper for role transitions.
    fn into_role<T: Role>(self, role: T) -> RawNode<T> {
        RawNode {
            id: self.id,
            peers: self.peers,
            log: self.log,
            node_tx: self.node_tx,
            applier_tx: self.applier_tx,
            applied_index: self.applied_index,
            opts: self.opts,
            role,
        }
    }

    /// Returns the node's current term. Convenience wrapper for
    /// Log::get_term().
    fn term(&self) -> Term {
        self.log.get_term().0
    }

    /// Returns the cluster size as number of nodes.
    fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    /// Returns the cluster quorum size (strict majority).
    fn quorum_size(&self) -> usize {
        self.cluster_size() / 2 + 1
    }

    /// Returns the quorum value of the given unsorted vector, in descending
    /// order. The vector must have the same size as the cluster.
    fn quorum_value<T: Ord + Copy>(&self, mut values: Vec<T>) -> T {
        assert_eq!(values.len(), self.cluster_size(), "vector size must match cluster size");
        *values.select_nth_unstable_by(self.quorum_size() - 1, |a, b: &T| a.cmp(b).reverse()).1
    }

    /// Sends a message to a peer.
    fn send(&self, to: NodeID, message: Message) -> Result<()> {
        let msg = Envelope { from: self.id, to, message };
        debug!("Sending {msg:?}");
        Ok(self.node_tx.send(msg)?)
    }

    /// Broadcasts a message to all peers.
    fn broadcast(&self, message: Message) -> Result<()> {
        // Sort for test determinism.
        for id in self.peers.iter().copied().sorted() {
            self.send(id, message.clone())?;
        }
        Ok(())
    }

    /// Hands any committed but not yet applied entries to the apply driver,
    /// in index order.
    fn maybe_apply(&mut self) -> Result<()> {
        let (commit_index, _) = self.log.get_commit_index();
        while self.applied_index < commit_index {
            let entry = self.log.get(self.applied_index + 1).expect("missing committed entry");
            self.applier_tx.send(Instruction::Apply { entry: entry.clone() })?;
            self.applied_index += 1;
        }
        Ok(())
    }

    /// Refuses a request from a past term, replying with our current term so
    /// the stale sender can update itself. Responses from past terms carry
    /// no reply and are simply dropped.
    fn refuse_stale(&self, msg: Envelope) -> Result<()> {
        assert!(msg.message.term() < self.term(), "message term not stale");
        match &msg.message {
            Message::VoteRequest(_) => self.send(
                msg.from,
                Message::VoteResponse(VoteResponse { term: self.term(), vote_granted: false }),
            ),
            Message::AppendRequest(_) => self.send(
                msg.from,
                Message::AppendResponse(AppendResponse {
                    term: self.term(),
                    success: false,
                    next_index: 0,
                }),
            ),
            Message::VoteResponse(_) | Message::AppendResponse(_) => {
                debug!("Dropping stale message {:?}", msg);
                Ok(())
            }
        }
    }

    /// Generates a randomized election timeout.
    fn gen_election_timeout(&self) -> Ticks {
        let timeout = self.opts.election_timeout;
        rand::thread_rng().gen_range(timeout..timeout * 2)
    }

    /// Asserts message invariants when stepping.
    fn assert_step(&self, msg: &Envelope) {
        // Messages must be addressed to the local node.
        assert_eq!(msg.to, self.id, "message to other node");

        // Senders must be known.
        assert!(
            msg.from == self.id || self.peers.contains(&msg.from),
            "unknown sender {}",
            msg.from
        );
    }
}
