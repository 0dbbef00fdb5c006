use crate::apply::{ApplyMsg, Driver};
use crate::error::{Error, Result};
use crate::log::{Index, Log};
use crate::message::{Envelope, Message, Request, Response};
use crate::node::{Node, NodeID, Options, Status, Term};
use crate::persist::Persister;
use crate::transport::Transport;

use ::log::{debug, error};
use crossbeam::channel::{Receiver, Sender, TrySendError};
use itertools::Itertools as _;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// The capacity of a peer's outbound send queue. If a peer can't keep up,
/// e.g. due to a partition, new requests are dropped and retried on a later
/// heartbeat.
const SEND_QUEUE_CAPACITY: usize = 100;

/// Control requests from the host into the event loop.
enum Control {
    /// Propose a command for consensus, per Server::start().
    Start { command: Vec<u8>, reply_tx: Sender<(Index, Term, bool)> },
    /// Fetch the current term and leadership, per Server::get_state().
    GetState { reply_tx: Sender<(Term, bool)> },
    /// Fetch a status snapshot, per Server::status().
    Status { reply_tx: Sender<Status> },
    /// Shut the peer down.
    Shutdown,
}

/// A Raft peer: drives a Node on a dedicated event loop thread, with
/// per-peer sender workers for outbound RPCs and an apply driver delivering
/// committed entries to the host sink.
///
/// The event loop is the single serialization point: it owns the node and
/// all of its state, and every input (clock ticks, inbound requests,
/// responses funneled back from the senders, host control requests) is
/// processed there in sequence. The node persists durable state before its
/// outbound messages are handed to the senders, so nothing crosses the
/// network that the persisted state doesn't attest to. The event loop
/// itself never blocks on the network or the host sink.
pub struct Server {
    id: NodeID,
    request_tx: Sender<(Request, Sender<Response>)>,
    control_tx: Sender<Control>,
}

impl Server {
    /// Creates a new Raft peer and launches its background threads. Returns
    /// promptly; all long-running work happens on the spawned threads.
    ///
    /// peers is the IDs of all other cluster members (the roster, minus this
    /// peer). The persister pre-loads any durable state from a previous run,
    /// and the sink receives committed commands in log order.
    pub fn new(
        id: NodeID,
        peers: HashSet<NodeID>,
        transport: Arc<dyn Transport>,
        persister: Box<dyn Persister>,
        applied_tx: Sender<ApplyMsg>,
        opts: Options,
    ) -> Result<Self> {
        let log = Log::new(persister)?;
        let (node_tx, node_rx) = crossbeam::channel::unbounded();
        let (applier_tx, applier_rx) = crossbeam::channel::unbounded();
        let (request_tx, request_rx) = crossbeam::channel::unbounded();
        let (control_tx, control_rx) = crossbeam::channel::unbounded();
        let (response_tx, response_rx) = crossbeam::channel::unbounded();

        let tick_interval = opts.tick_interval;
        let node = Node::new(id, peers.clone(), log, node_tx, applier_tx, opts)?;

        // One sender worker per peer, with a bounded queue. Workers funnel
        // responses back into the event loop via response_tx.
        let mut peer_txs = HashMap::new();
        for peer in peers.into_iter().sorted() {
            let (send_tx, send_rx) = crossbeam::channel::bounded(SEND_QUEUE_CAPACITY);
            peer_txs.insert(peer, send_tx);
            let transport = transport.clone();
            let response_tx = response_tx.clone();
            std::thread::spawn(move || Self::sender(id, peer, transport, send_rx, response_tx));
        }

        let driver = Driver::new(applier_rx, applied_tx);
        std::thread::spawn(move || match driver.run() {
            Ok(()) | Err(Error::Abort) => {}
            Err(err) => error!("Apply driver failed: {err}"),
        });

        std::thread::spawn(move || {
            let result = Self::eventloop(
                node,
                node_rx,
                request_rx,
                control_rx,
                response_rx,
                peer_txs,
                tick_interval,
            );
            match result {
                Ok(()) | Err(Error::Abort) => {}
                Err(err) => error!("Event loop failed: {err}"),
            }
        });

        Ok(Self { id, request_tx, control_tx })
    }

    /// Returns the peer's ID.
    pub fn id(&self) -> NodeID {
        self.id
    }

    /// Dispatches an inbound RPC request from the external transport layer
    /// to the event loop, and returns its response.
    pub fn request(&self, request: Request) -> Result<Response> {
        let (reply_tx, reply_rx) = crossbeam::channel::bounded(1);
        self.request_tx.send((request, reply_tx))?;
        Ok(reply_rx.recv()?)
    }

    /// Proposes a command for consensus. If this peer is not the leader it
    /// returns is_leader=false, and the caller should retry against another
    /// peer. Otherwise returns the index and term the command was appended
    /// at; there is no guarantee it will ever commit, since the leader may
    /// fail or lose an election.
    pub fn start(&self, command: Vec<u8>) -> Result<(Index, Term, bool)> {
        let (reply_tx, reply_rx) = crossbeam::channel::bounded(1);
        self.control_tx.send(Control::Start { command, reply_tx })?;
        Ok(reply_rx.recv()?)
    }

    /// Returns the current term and whether this peer believes it is the
    /// leader.
    pub fn get_state(&self) -> Result<(Term, bool)> {
        let (reply_tx, reply_rx) = crossbeam::channel::bounded(1);
        self.control_tx.send(Control::GetState { reply_tx })?;
        Ok(reply_rx.recv()?)
    }

    /// Returns a status snapshot of the peer.
    pub fn status(&self) -> Result<Status> {
        let (reply_tx, reply_rx) = crossbeam::channel::bounded(1);
        self.control_tx.send(Control::Status { reply_tx })?;
        Ok(reply_rx.recv()?)
    }

    /// Shuts the peer down. The event loop exits, which disconnects the
    /// sender workers and the apply driver, stopping them too. Subsequent
    /// calls on this peer return Error::Abort.
    pub fn kill(&self) {
        let _ = self.control_tx.send(Control::Shutdown);
    }

    /// Runs the event loop, which owns the node and serializes all of its
    /// inputs: clock ticks, inbound requests, responses from the sender
    /// workers, and host control requests.
    fn eventloop(
        mut node: Node,
        node_rx: Receiver<Envelope>,
        request_rx: Receiver<(Request, Sender<Response>)>,
        control_rx: Receiver<Control>,
        response_rx: Receiver<Envelope>,
        peer_txs: HashMap<NodeID, Sender<Request>>,
        tick_interval: std::time::Duration,
    ) -> Result<()> {
        let ticker = crossbeam::channel::tick(tick_interval);
        loop {
            crossbeam::select! {
                recv(ticker) -> _ => {
                    node = node.tick()?;
                    Self::route(&node_rx, &peer_txs, None)?;
                }

                recv(request_rx) -> msg => {
                    let Ok((request, reply_tx)) = msg else { return Ok(()) };
                    let from = request.from();
                    let to = node.id();
                    node = node.step(Envelope { from, to, message: request.into() })?;
                    // The response the node emitted for this request is
                    // routed back to the caller.
                    Self::route(&node_rx, &peer_txs, Some((from, reply_tx)))?;
                }

                recv(response_rx) -> msg => {
                    let Ok(envelope) = msg else { return Ok(()) };
                    node = node.step(envelope)?;
                    Self::route(&node_rx, &peer_txs, None)?;
                }

                recv(control_rx) -> msg => {
                    match msg {
                        Ok(Control::Start { command, reply_tx }) => {
                            let outcome = match node.propose(command)? {
                                Some((index, term)) => (index, term, true),
                                None => (0, node.term(), false),
                            };
                            let _ = reply_tx.send(outcome);
                            Self::route(&node_rx, &peer_txs, None)?;
                        }
                        Ok(Control::GetState { reply_tx }) => {
                            let _ = reply_tx.send((node.term(), node.is_leader()));
                        }
                        Ok(Control::Status { reply_tx }) => {
                            let _ = reply_tx.send(node.status());
                        }
                        Ok(Control::Shutdown) | Err(_) => return Ok(()),
                    }
                }
            }
        }
    }

    /// Routes the node's outbound messages: requests go to the matching
    /// sender worker's queue, and a response goes back to the pending
    /// inbound caller, if any. Send queues are bounded and drop requests
    /// when full; the next heartbeat retries.
    fn route(
        node_rx: &Receiver<Envelope>,
        peer_txs: &HashMap<NodeID, Sender<Request>>,
        mut reply: Option<(NodeID, Sender<Response>)>,
    ) -> Result<()> {
        for envelope in node_rx.try_iter() {
            match envelope.message {
                Message::VoteResponse(_) | Message::AppendResponse(_) => match reply.take() {
                    Some((to, reply_tx)) if to == envelope.to => {
                        let response = envelope.message.into_response().expect("not a response");
                        // The caller may have given up on the call.
                        let _ = reply_tx.send(response);
                    }
                    other => {
                        error!("No caller for response {envelope:?}");
                        reply = other;
                    }
                },
                Message::VoteRequest(_) | Message::AppendRequest(_) => {
                    let to = envelope.to;
                    let request = envelope.message.into_request().expect("not a request");
                    let Some(send_tx) = peer_txs.get(&to) else {
                        error!("No sender for peer {to}");
                        continue;
                    };
                    match send_tx.try_send(request) {
                        Ok(()) => {}
                        Err(TrySendError::Full(request)) => {
                            debug!("Full send queue for peer {to}, discarding {}", request.method())
                        }
                        Err(TrySendError::Disconnected(_)) => return Err(Error::Abort),
                    }
                }
            }
        }
        Ok(())
    }

    /// Runs a sender worker: performs the peer's outbound RPCs one at a
    /// time, funneling responses back into the event loop. Failed calls are
    /// dropped; the next heartbeat retries.
    fn sender(
        id: NodeID,
        to: NodeID,
        transport: Arc<dyn Transport>,
        send_rx: Receiver<Request>,
        response_tx: Sender<Envelope>,
    ) {
        while let Ok(request) = send_rx.recv() {
            let method = request.method();
            match transport.call(to, request) {
                Ok(response) => {
                    let envelope = Envelope { from: to, to: id, message: response.into() };
                    if response_tx.send(envelope).is_err() {
                        return; // peer shut down
                    }
                }
                Err(err) => debug!("{method} call to {to} failed: {err}"),
            }
        }
    }
}
