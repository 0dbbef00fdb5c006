use crate::error::Result;
use crate::log::{Entry, Index};

use ::log::debug;
use crossbeam::channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};

/// A message delivered to the host sink for each committed log entry. The
/// snapshot fields are always false/empty, and exist for forward
/// compatibility with log compaction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ApplyMsg {
    /// The index of the applied entry.
    pub index: Index,
    /// The applied command.
    pub command: Vec<u8>,
    /// Whether this message carries a snapshot instead of a command.
    pub use_snapshot: bool,
    /// The snapshot payload, if any.
    pub snapshot: Vec<u8>,
}

impl From<Entry> for ApplyMsg {
    fn from(entry: Entry) -> Self {
        Self { index: entry.index, command: entry.command, use_snapshot: false, snapshot: Vec::new() }
    }
}

/// An instruction from the node to the apply driver.
#[derive(Clone, Debug, PartialEq)]
pub enum Instruction {
    /// Deliver the given committed entry to the host sink.
    Apply { entry: Entry },
}

/// Drives the delivery of committed log entries to the host sink, in index
/// order. Runs on its own thread, so a slow or blocking host never stalls
/// the node's tick handler. The sink receives entries with strictly
/// increasing, gap-free indexes, each exactly once per process lifetime.
pub struct Driver {
    /// Instructions from the node.
    instruction_rx: Receiver<Instruction>,
    /// The host sink.
    applied_tx: Sender<ApplyMsg>,
    /// The index of the last entry delivered to the sink.
    last_applied: Index,
}

impl Driver {
    /// Creates a new apply driver.
    pub fn new(instruction_rx: Receiver<Instruction>, applied_tx: Sender<ApplyMsg>) -> Self {
        Self { instruction_rx, applied_tx, last_applied: 0 }
    }

    /// Runs the driver until the node or the host goes away.
    pub fn run(mut self) -> Result<()> {
        while let Ok(instruction) = self.instruction_rx.recv() {
            match instruction {
                Instruction::Apply { entry } => self.apply(entry)?,
            }
        }
        Ok(())
    }

    /// Delivers a committed entry to the host sink.
    fn apply(&mut self, entry: Entry) -> Result<()> {
        assert_eq!(entry.index, self.last_applied + 1, "applied entries out of order");
        debug!("Applying {:?}", entry);
        self.last_applied = entry.index;
        // This may block until the host drains the sink, which is fine here.
        self.applied_tx.send(entry.into())?;
        Ok(())
    }
}
