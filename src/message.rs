use crate::log::{Entry, Index};
use crate::node::{NodeID, Term};

use serde::{Deserialize, Serialize};

/// A vote solicitation from a candidate. The serialized field names are part
/// of the wire contract and must remain stable, so they are pinned to their
/// PascalCase form; all fields are serialized, including zero values.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VoteRequest {
    /// The candidate's term.
    pub term: Term,
    /// The candidate soliciting the vote.
    pub candidate_id: NodeID,
    /// The index of the candidate's last log entry.
    pub last_log_index: Index,
    /// The term of the candidate's last log entry.
    pub last_log_term: Term,
}

/// A response to a vote solicitation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VoteResponse {
    /// The responder's current term, for the candidate to update itself.
    pub term: Term,
    /// Whether the responder granted its vote for the term.
    pub vote_granted: bool,
}

/// A log replication request from a leader. An empty entries list acts as a
/// heartbeat: the consistency check and commit index advancement still apply,
/// but the log is unchanged.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AppendRequest {
    /// The leader's term.
    pub term: Term,
    /// The leader sending the entries.
    pub leader_id: NodeID,
    /// The leader's commit index.
    pub leader_commit: Index,
    /// The index of the log entry immediately preceding the entries.
    pub prev_log_index: Index,
    /// The term of the log entry immediately preceding the entries.
    pub prev_log_term: Term,
    /// Log entries to append, starting at prev_log_index + 1.
    pub entries: Vec<Entry>,
}

/// A response to a log replication request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AppendResponse {
    /// The responder's current term, for the leader to update itself.
    pub term: Term,
    /// Whether the entries were appended (the consistency check passed).
    pub success: bool,
    /// The next index the leader should send. On success this covers the
    /// verified prefix; on failure it is a conservative retry hint ≥ 1.
    pub next_index: Index,
}

/// An RPC request dispatched through the transport.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Request {
    RequestVote(VoteRequest),
    AppendEntries(AppendRequest),
}

impl Request {
    /// The wire method name of the request.
    pub fn method(&self) -> &'static str {
        match self {
            Request::RequestVote(_) => "RequestVote",
            Request::AppendEntries(_) => "AppendEntries",
        }
    }

    /// The sending peer, as claimed by the request payload.
    pub fn from(&self) -> NodeID {
        match self {
            Request::RequestVote(req) => req.candidate_id,
            Request::AppendEntries(req) => req.leader_id,
        }
    }
}

/// An RPC response returned through the transport.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Response {
    RequestVote(VoteResponse),
    AppendEntries(AppendResponse),
}

/// A message stepped through the local node: one of the two RPC requests, or
/// a response to a request we sent. Routing responses through the same
/// stepping path as requests ensures the term-update rule applies uniformly.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    VoteRequest(VoteRequest),
    VoteResponse(VoteResponse),
    AppendRequest(AppendRequest),
    AppendResponse(AppendResponse),
}

impl Message {
    /// The sender's term.
    pub fn term(&self) -> Term {
        match self {
            Message::VoteRequest(msg) => msg.term,
            Message::VoteResponse(msg) => msg.term,
            Message::AppendRequest(msg) => msg.term,
            Message::AppendResponse(msg) => msg.term,
        }
    }

    /// Converts an outbound message into a transport request, or None if it
    /// is a response.
    pub fn into_request(self) -> Option<Request> {
        match self {
            Message::VoteRequest(msg) => Some(Request::RequestVote(msg)),
            Message::AppendRequest(msg) => Some(Request::AppendEntries(msg)),
            Message::VoteResponse(_) | Message::AppendResponse(_) => None,
        }
    }

    /// Converts an outbound message into a transport response, or None if it
    /// is a request.
    pub fn into_response(self) -> Option<Response> {
        match self {
            Message::VoteResponse(msg) => Some(Response::RequestVote(msg)),
            Message::AppendResponse(msg) => Some(Response::AppendEntries(msg)),
            Message::VoteRequest(_) | Message::AppendRequest(_) => None,
        }
    }
}

impl From<Request> for Message {
    fn from(request: Request) -> Self {
        match request {
            Request::RequestVote(req) => Message::VoteRequest(req),
            Request::AppendEntries(req) => Message::AppendRequest(req),
        }
    }
}

impl From<Response> for Message {
    fn from(response: Response) -> Self {
        match response {
            Response::RequestVote(res) => Message::VoteResponse(res),
            Response::AppendEntries(res) => Message::AppendResponse(res),
        }
    }
}

/// A message addressed between two peers.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    /// The sender.
    pub from: NodeID,
    /// The recipient.
    pub to: NodeID,
    /// The message payload.
    pub message: Message,
}
