use crate::error::{Error, Result};
use crate::message::{Request, Response};
use crate::node::NodeID;

use crossbeam::channel::{Receiver, Sender};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A transport delivers RPC requests to peers and returns their responses.
/// Delivery is unreliable: an error means the request or its response was
/// dropped somewhere, and the caller should simply drop the call and retry
/// on the next heartbeat.
pub trait Transport: Send + Sync {
    /// Calls the named peer with the given request, blocking until its
    /// response arrives or the call is considered lost.
    fn call(&self, to: NodeID, request: Request) -> Result<Response>;
}

/// How long a local call waits for a response before considering it lost.
const CALL_TIMEOUT: Duration = Duration::from_secs(1);

/// An in-process transport connecting peers via channels, with partition
/// control for tests. Each peer registers an inbox of (request, response)
/// channel pairs; calls to disconnected or unregistered peers are dropped.
#[derive(Clone, Default)]
pub struct Local {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    /// Registered peer inboxes.
    inboxes: HashMap<NodeID, Sender<(Request, Sender<Response>)>>,
    /// Peers currently partitioned away from the rest of the cluster.
    disconnected: HashSet<NodeID>,
}

impl Local {
    /// Creates a new local transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a peer, returning the receiving end of its inbox. The
    /// caller is responsible for serving the inbox, typically by dispatching
    /// each request to its peer and sending the reply back.
    pub fn register(&self, id: NodeID) -> Receiver<(Request, Sender<Response>)> {
        let (inbox_tx, inbox_rx) = crossbeam::channel::unbounded();
        self.inner.lock().expect("lock poisoned").inboxes.insert(id, inbox_tx);
        inbox_rx
    }

    /// Partitions a peer away from the cluster: all calls to and from it are
    /// dropped until it reconnects.
    pub fn disconnect(&self, id: NodeID) {
        self.inner.lock().expect("lock poisoned").disconnected.insert(id);
    }

    /// Heals a peer's partition.
    pub fn reconnect(&self, id: NodeID) {
        self.inner.lock().expect("lock poisoned").disconnected.remove(&id);
    }
}

impl Transport for Local {
    fn call(&self, to: NodeID, request: Request) -> Result<Response> {
        let inbox = {
            let inner = self.inner.lock()?;
            if inner.disconnected.contains(&to) || inner.disconnected.contains(&request.from()) {
                return Err(Error::Abort);
            }
            inner.inboxes.get(&to).cloned().ok_or(Error::Abort)?
        };
        let (response_tx, response_rx) = crossbeam::channel::bounded(1);
        inbox.send((request, response_tx)).map_err(|_| Error::Abort)?;
        Ok(response_rx.recv_timeout(CALL_TIMEOUT)?)
    }
}
