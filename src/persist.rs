use crate::error::{Error, Result};

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// A durable store for the peer's persistent state, as a single opaque blob.
/// The peer saves the blob on every change to state that Raft requires
/// persisted, before sending any message that depends on that change, and
/// loads it on construction to recover from a crash.
///
/// Save failures are fatal to the peer: correctness depends on durability.
pub trait Persister: Send {
    /// Saves the blob, replacing any previous one.
    fn save(&mut self, blob: Vec<u8>) -> Result<()>;

    /// Loads the previously saved blob, or None if nothing was saved.
    fn load(&self) -> Result<Option<Vec<u8>>>;
}

/// An in-memory persister. Clones share the same blob, so a restarted peer
/// can be handed a clone to recover its pre-crash state.
#[derive(Clone, Default)]
pub struct Memory {
    blob: Arc<Mutex<Option<Vec<u8>>>>,
}

impl Memory {
    /// Creates a new empty in-memory persister.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Persister for Memory {
    fn save(&mut self, blob: Vec<u8>) -> Result<()> {
        *self.blob.lock()? = Some(blob);
        Ok(())
    }

    fn load(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.blob.lock()?.clone())
    }
}

/// A file-backed persister. Saves write the entire blob to a temporary file
/// and rename it over the target, so a crash mid-save leaves the previous
/// blob intact.
pub struct File {
    path: PathBuf,
}

impl File {
    /// Creates a file persister at the given path. The file is only created
    /// on the first save.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Persister for File {
    fn save(&mut self, blob: Vec<u8>) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, blob)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn load(&self) -> Result<Option<Vec<u8>>> {
        match std::fs::read(&self.path) {
            Ok(blob) => Ok(Some(blob)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(Error::from(err)),
        }
    }
}
