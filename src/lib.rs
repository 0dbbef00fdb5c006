#![warn(clippy::all)]
#![allow(clippy::module_inception)]

mod apply;
mod encoding;
mod error;
mod log;
mod message;
mod node;
pub mod persist;
mod server;
pub mod transport;

pub use apply::{ApplyMsg, Driver, Instruction};
pub use error::{Error, Result};
pub use log::{Entry, Index, Log};
pub use message::{
    AppendRequest, AppendResponse, Envelope, Message, Request, Response, VoteRequest, VoteResponse,
};
pub use node::{Node, NodeID, Options, Status, Term, Ticks};
pub use persist::Persister;
pub use server::Server;
pub use transport::Transport;
