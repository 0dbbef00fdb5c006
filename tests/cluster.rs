//! Deterministic multi-node cluster tests. Nodes are driven directly by
//! ticking them and shuttling their messages by hand, so elections,
//! partitions, and message delays are fully controlled by each test.

use toyraft::{persist, Entry, Envelope, Index, Instruction, Log, Node, NodeID, Options, Result};

use crossbeam::channel::Receiver;
use std::collections::{HashMap, HashSet, VecDeque};

/// An in-memory test cluster of nodes with manual message delivery.
struct Cluster {
    ids: Vec<NodeID>,
    nodes: HashMap<NodeID, Node>,
    /// Outbound message queues from each node.
    node_rxs: HashMap<NodeID, Receiver<Envelope>>,
    /// Apply instruction queues from each node.
    applier_rxs: HashMap<NodeID, Receiver<Instruction>>,
    /// Pending inbound messages for each node.
    pending: HashMap<NodeID, VecDeque<Envelope>>,
    /// Nodes partitioned away from the rest of the cluster.
    disconnected: HashSet<NodeID>,
}

impl Cluster {
    /// Creates a cluster with the given number of nodes, with IDs starting
    /// at 0.
    fn new(size: u8) -> Result<Self> {
        let ids: Vec<NodeID> = (0..size).collect();
        let mut cluster = Self {
            ids: ids.clone(),
            nodes: HashMap::new(),
            node_rxs: HashMap::new(),
            applier_rxs: HashMap::new(),
            pending: ids.iter().map(|id| (*id, VecDeque::new())).collect(),
            disconnected: HashSet::new(),
        };
        for id in ids.iter().copied() {
            let peers: HashSet<NodeID> = ids.iter().copied().filter(|p| *p != id).collect();
            let (node_tx, node_rx) = crossbeam::channel::unbounded();
            let (applier_tx, applier_rx) = crossbeam::channel::unbounded();
            let log = Log::new(Box::new(persist::Memory::new()))?;
            let node = Node::new(id, peers, log, node_tx, applier_tx, Options::default())?;
            cluster.nodes.insert(id, node);
            cluster.node_rxs.insert(id, node_rx);
            cluster.applier_rxs.insert(id, applier_rx);
        }
        Ok(cluster)
    }

    /// Ticks a node's logical clock once.
    fn tick(&mut self, id: NodeID) -> Result<()> {
        let node = self.nodes.remove(&id).expect("unknown node");
        self.nodes.insert(id, node.tick()?);
        Ok(())
    }

    /// Moves outbound messages into the recipients' pending queues, dropping
    /// messages across partitions.
    fn transmit(&mut self) {
        for id in &self.ids {
            for envelope in self.node_rxs[id].try_iter() {
                if self.disconnected.contains(&envelope.from)
                    || self.disconnected.contains(&envelope.to)
                {
                    continue;
                }
                self.pending.get_mut(&envelope.to).expect("unknown recipient").push_back(envelope);
            }
        }
    }

    /// Delivers all of a node's pending messages, in order.
    fn deliver(&mut self, id: NodeID) -> Result<()> {
        while let Some(envelope) = self.pending.get_mut(&id).expect("unknown node").pop_front() {
            let node = self.nodes.remove(&id).expect("unknown node");
            self.nodes.insert(id, node.step(envelope)?);
        }
        Ok(())
    }

    /// Transmits and delivers messages until the cluster goes quiet.
    fn settle(&mut self) -> Result<()> {
        loop {
            self.transmit();
            if self.pending.values().all(|queue| queue.is_empty()) {
                return Ok(());
            }
            for id in self.ids.clone() {
                self.deliver(id)?;
            }
        }
    }

    /// Ticks a node until its election timeout fires and it campaigns.
    fn campaign(&mut self, id: NodeID) -> Result<()> {
        for _ in 0..20 {
            if !matches!(self.nodes[&id], Node::Follower(_)) {
                return Ok(());
            }
            self.tick(id)?;
        }
        panic!("node {id} never campaigned");
    }

    /// Elects the given node as leader by firing its election timeout and
    /// settling the resulting traffic.
    fn elect(&mut self, id: NodeID) -> Result<()> {
        self.campaign(id)?;
        self.settle()?;
        assert!(self.nodes[&id].is_leader(), "node {id} did not win the election");
        Ok(())
    }

    /// Fires a heartbeat from the given leader and settles the traffic.
    fn heartbeat(&mut self, id: NodeID) -> Result<()> {
        assert!(self.nodes[&id].is_leader(), "node {id} is not the leader");
        self.tick(id)?;
        self.settle()
    }

    /// Partitions a node away from the rest of the cluster.
    fn disconnect(&mut self, id: NodeID) {
        self.disconnected.insert(id);
    }

    /// Heals a node's partition.
    fn reconnect(&mut self, id: NodeID) {
        self.disconnected.remove(&id);
    }

    /// Drains and returns the entries a node has applied to its host sink.
    fn applied(&self, id: NodeID) -> Vec<Entry> {
        self.applier_rxs[&id]
            .try_iter()
            .map(|instruction| match instruction {
                Instruction::Apply { entry } => entry,
            })
            .collect()
    }

    /// Returns the commit index of a node.
    fn commit_index(&self, id: NodeID) -> Index {
        self.nodes[&id].status().commit_index
    }
}

#[test]
// Scenario: all peers start as followers at term 0, and peer 0's election
// timeout fires first. It must become leader at term 1, and its heartbeat
// must be accepted by peers 1 and 2.
fn happy_path_election() -> Result<()> {
    let mut cluster = Cluster::new(3)?;
    for id in [0, 1, 2] {
        assert!(matches!(cluster.nodes[&id], Node::Follower(_)));
        assert_eq!(cluster.nodes[&id].term(), 0);
    }

    cluster.elect(0)?;
    assert_eq!(cluster.nodes[&0].term(), 1);
    assert!(cluster.nodes[&0].is_leader());

    cluster.heartbeat(0)?;
    for id in [1, 2] {
        assert!(matches!(cluster.nodes[&id], Node::Follower(_)));
        assert_eq!(cluster.nodes[&id].term(), 1);
        assert_eq!(cluster.nodes[&id].leader(), Some(0));
    }
    Ok(())
}

#[test]
// Scenario: a command proposed on the leader is replicated to all peers,
// commits, and is applied to every host sink exactly once.
fn replication_and_commit() -> Result<()> {
    let mut cluster = Cluster::new(3)?;
    cluster.elect(0)?;

    let command = b"command X".to_vec();
    assert_eq!(cluster.nodes.get_mut(&0).unwrap().propose(command.clone())?, Some((1, 1)));
    cluster.settle()?;

    // The quorum of accepts commits on the leader; the next heartbeat
    // propagates the commit index to the followers.
    assert_eq!(cluster.commit_index(0), 1);
    cluster.heartbeat(0)?;

    for id in [0, 1, 2] {
        assert_eq!(cluster.commit_index(id), 1);
        assert_eq!(cluster.applied(id), vec![Entry { term: 1, index: 1, command: command.clone() }]);
        // Exactly once: nothing further is applied by another heartbeat.
    }
    cluster.heartbeat(0)?;
    for id in [0, 1, 2] {
        assert_eq!(cluster.applied(id), vec![]);
    }
    Ok(())
}

#[test]
// Scenario: the leader is partitioned away and accepts a command that never
// commits, while the majority elects a new leader and commits a different
// command at the same index. When the partition heals, the old leader steps
// down, truncates its uncommitted entry, and adopts the new one.
fn leader_isolation() -> Result<()> {
    let mut cluster = Cluster::new(3)?;
    cluster.elect(0)?;
    assert_eq!(cluster.nodes.get_mut(&0).unwrap().propose(b"command X".to_vec())?, Some((1, 1)));
    cluster.settle()?;
    cluster.heartbeat(0)?;
    for id in [0, 1, 2] {
        assert_eq!(cluster.applied(id).len(), 1);
    }

    // The deposed leader accepts Y at index 2, but can't replicate it.
    cluster.disconnect(0);
    assert_eq!(cluster.nodes.get_mut(&0).unwrap().propose(b"command Y".to_vec())?, Some((2, 1)));
    cluster.settle()?;
    assert_eq!(cluster.commit_index(0), 1);
    assert_eq!(cluster.applied(0), vec![]);

    // The majority elects node 1, which commits Z at index 2.
    cluster.elect(1)?;
    assert!(cluster.nodes[&1].term() >= 2);
    let term = cluster.nodes[&1].term();
    assert_eq!(
        cluster.nodes.get_mut(&1).unwrap().propose(b"command Z".to_vec())?,
        Some((2, term))
    );
    cluster.settle()?;
    cluster.heartbeat(1)?;
    for id in [1, 2] {
        assert_eq!(cluster.commit_index(id), 2);
        assert_eq!(
            cluster.applied(id),
            vec![Entry { term, index: 2, command: b"command Z".to_vec() }]
        );
    }

    // When the partition heals, the old leader steps down, truncates Y, and
    // adopts Z.
    cluster.reconnect(0);
    cluster.heartbeat(1)?;
    assert!(matches!(cluster.nodes[&0], Node::Follower(_)));
    assert_eq!(cluster.nodes[&0].term(), term);
    assert_eq!(cluster.commit_index(0), 2);
    assert_eq!(
        cluster.applied(0),
        vec![Entry { term, index: 2, command: b"command Z".to_vec() }]
    );
    assert_eq!(cluster.nodes[&0].status().last_index, 2);
    Ok(())
}

#[test]
// Scenario: two candidates split the electorate evenly and neither reaches
// quorum, but fresh randomized timeouts let exactly one leader emerge
// within a bounded number of rounds.
fn split_vote() -> Result<()> {
    let mut cluster = Cluster::new(4)?;

    // Nodes 0 and 1 campaign simultaneously, and the requests are delivered
    // so that node 2 only hears from 0 and node 3 only hears from 1.
    cluster.campaign(0)?;
    cluster.campaign(1)?;
    cluster.transmit();
    for id in [0, 1, 2, 3] {
        let queue = cluster.pending.get_mut(&id).unwrap();
        queue.retain(|envelope| match id {
            2 => envelope.from == 0,
            3 => envelope.from == 1,
            _ => true,
        });
    }
    for id in [0, 1, 2, 3] {
        cluster.deliver(id)?;
    }
    cluster.settle()?;

    // Two votes each: no quorum, both still candidates.
    assert!(matches!(cluster.nodes[&0], Node::Candidate(_)));
    assert!(matches!(cluster.nodes[&1], Node::Candidate(_)));
    let term = cluster.nodes[&0].term();

    // Both time out again with fresh randomized intervals. Within a bounded
    // number of rounds, exactly one leader emerges at a later term.
    for _ in 0..100 {
        for id in [0, 1] {
            if !cluster.nodes[&id].is_leader() {
                cluster.tick(id)?;
            }
        }
        cluster.settle()?;
        if cluster.ids.iter().any(|id| cluster.nodes[id].is_leader()) {
            break;
        }
    }
    let leaders: Vec<NodeID> =
        cluster.ids.iter().copied().filter(|id| cluster.nodes[id].is_leader()).collect();
    assert_eq!(leaders.len(), 1, "expected exactly one leader");
    assert!(cluster.nodes[&leaders[0]].term() > term);
    Ok(())
}

#[test]
// Scenario: an append from a deposed leader arrives after the term has
// moved on. The receiver refuses it with the current term and an untouched
// log, and the deposed leader steps down on seeing the refusal.
fn stale_append_ignored() -> Result<()> {
    let mut cluster = Cluster::new(3)?;
    cluster.elect(0)?;

    // Leader 0 proposes a command, but the append to node 2 is delayed: we
    // hold all of leader 0's outbound traffic.
    cluster.nodes.get_mut(&0).unwrap().propose(b"command X".to_vec())?;
    let delayed: Vec<Envelope> = cluster.node_rxs[&0].try_iter().collect();
    assert!(!delayed.is_empty());

    // Meanwhile the term advances: node 1 wins an election without 0
    // hearing about it.
    cluster.disconnect(0);
    cluster.elect(1)?;
    let term = cluster.nodes[&1].term();
    cluster.reconnect(0);

    // The delayed append now arrives at node 2, which refuses it without
    // touching its log.
    let last_index = cluster.nodes[&2].status().last_index;
    for envelope in delayed.into_iter().filter(|envelope| envelope.to == 2) {
        let node = cluster.nodes.remove(&2).unwrap();
        cluster.nodes.insert(2, node.step(envelope)?);
    }
    assert_eq!(cluster.nodes[&2].status().last_index, last_index);
    assert_eq!(cluster.nodes[&2].term(), term);

    // The refusal carries term 2, which makes the old leader step down.
    cluster.settle()?;
    assert!(matches!(cluster.nodes[&0], Node::Follower(_)));
    assert_eq!(cluster.nodes[&0].term(), term);
    Ok(())
}

#[test]
// A 5-node cluster keeps committing with a minority of nodes partitioned
// away, and the stragglers catch up when they return.
fn minority_partition() -> Result<()> {
    let mut cluster = Cluster::new(5)?;
    cluster.elect(0)?;

    cluster.disconnect(3);
    cluster.disconnect(4);
    for i in 1..=3u8 {
        cluster.nodes.get_mut(&0).unwrap().propose(vec![i])?;
    }
    cluster.settle()?;
    cluster.heartbeat(0)?;
    assert_eq!(cluster.commit_index(0), 3);
    assert_eq!(cluster.applied(0).len(), 3);
    assert_eq!(cluster.commit_index(3), 0);

    cluster.reconnect(3);
    cluster.reconnect(4);
    cluster.heartbeat(0)?;
    cluster.heartbeat(0)?;
    for id in [3, 4] {
        assert_eq!(cluster.commit_index(id), 3);
        assert_eq!(cluster.applied(id).len(), 3);
    }
    Ok(())
}
