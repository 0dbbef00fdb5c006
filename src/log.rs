use crate::encoding;
use crate::error::{Error, Result};
use crate::node::{NodeID, Term};
use crate::persist::Persister;

use serde::{Deserialize, Serialize};

/// A log index. Entries are 0-indexed, and the entry at index 0 is a
/// synthetic sentinel with term 0 and an empty command, present so that
/// previous-entry lookups always succeed.
pub type Index = u64;

/// A log entry, holding an opaque command from the host.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Entry {
    /// The term in which the entry was added.
    pub term: Term,
    /// The entry's position in the log.
    pub index: Index,
    /// The state machine command. Uninterpreted by Raft.
    pub command: Vec<u8>,
}

/// The durable peer state, saved as a single blob via the persister. Raft
/// requires all of these to be flushed before any reply that attests to
/// them (a vote grant, an append success).
#[derive(Serialize, Deserialize)]
struct DurableState {
    term: Term,
    entries: Vec<Entry>,
    voted_for: Option<NodeID>,
    commit_index: Index,
}

/// The Raft log stores a sequence of arbitrary commands that are replicated
/// across peers and delivered sequentially to the host. Each entry contains
/// an index, a command, and the term in which the leader proposed it.
///
/// In the steady state the log is append-only: the leader appends a command
/// via [`Log::append`] and replicates it to followers, who append it via
/// [`Log::splice`]. When an index has been replicated to a quorum it becomes
/// committed, making the log immutable up to that index. Uncommitted entries
/// can however be replaced: a leader may append entries it is then unable to
/// reach consensus on, and a new leader's conflicting entries will truncate
/// them via the splice conflict check.
///
/// The log has the following invariants:
///
/// * Entry indexes are contiguous starting at 0 (the sentinel).
/// * Entry terms never decrease from the previous entry.
/// * Entry terms are at or below the current term.
/// * Committed entries are never changed or removed.
/// * Entries with the same index/term contain the same command.
/// * If two logs contain a matching index/term, all previous entries
///   are identical (see section 5.3 in the Raft paper).
///
/// The current term, vote, entries, and commit index are persisted on every
/// change, before the caller sends any message depending on the change.
pub struct Log {
    /// The durable blob store.
    persister: Box<dyn Persister>,
    /// The current term.
    term: Term,
    /// Our leader vote in the current term, if any.
    vote: Option<NodeID>,
    /// All log entries, starting with the index 0 sentinel.
    entries: Vec<Entry>,
    /// The index of the last committed entry.
    commit_index: Index,
}

impl Log {
    /// Initializes a log, loading any previously persisted state.
    pub fn new(persister: Box<dyn Persister>) -> Result<Self> {
        let (term, vote, entries, commit_index) = match persister.load()? {
            Some(blob) => {
                let state: DurableState = encoding::deserialize(&blob)?;
                (state.term, state.voted_for, state.entries, state.commit_index)
            }
            None => {
                let sentinel = Entry { term: 0, index: 0, command: Vec::new() };
                (0, None, vec![sentinel], 0)
            }
        };
        for (i, entry) in entries.iter().enumerate() {
            if entry.index != i as Index {
                return Err(Error::InvalidData(format!(
                    "log entry index {} at position {i}",
                    entry.index
                )));
            }
        }
        if commit_index >= entries.len() as Index {
            return Err(Error::InvalidData(format!("commit index {commit_index} beyond log")));
        }
        Ok(Self { persister, term, vote, entries, commit_index })
    }

    /// Returns the current term (0 if none) and vote.
    pub fn get_term(&self) -> (Term, Option<NodeID>) {
        (self.term, self.vote)
    }

    /// Stores the current term and cast vote (if any), and persists them.
    /// Enforces that the term does not regress, and that we only vote for
    /// one node in a term.
    pub fn set_term(&mut self, term: Term, vote: Option<NodeID>) -> Result<()> {
        assert!(term > 0, "can't set term 0");
        assert!(term >= self.term, "term regression {} to {}", self.term, term);
        assert!(term > self.term || self.vote.is_none() || vote == self.vote, "can't change vote");
        if term == self.term && vote == self.vote {
            return Ok(());
        }
        self.term = term;
        self.vote = vote;
        self.save()
    }

    /// Returns the last log index and its term. The sentinel counts, so a
    /// fresh log returns (0, 0).
    pub fn get_last_index(&self) -> (Index, Term) {
        let last = self.entries.last().expect("log without sentinel");
        (last.index, last.term)
    }

    /// Returns the commit index and the term of the committed entry.
    pub fn get_commit_index(&self) -> (Index, Term) {
        let entry = self.get(self.commit_index).expect("missing committed entry");
        (entry.index, entry.term)
    }

    /// Fetches the entry at an index, or None if it does not exist.
    pub fn get(&self, index: Index) -> Option<&Entry> {
        self.entries.get(index as usize)
    }

    /// Checks if the log contains an entry with the given index and term.
    pub fn has(&self, index: Index, term: Term) -> bool {
        self.get(index).map(|e| e.term == term).unwrap_or(false)
    }

    /// Returns a copy of all entries at and after the given index, for
    /// replication. The sentinel is never replicated.
    pub fn entries_from(&self, index: Index) -> Vec<Entry> {
        assert!(index > 0, "can't replicate the sentinel");
        let index = std::cmp::min(index as usize, self.entries.len());
        self.entries[index..].to_vec()
    }

    /// Appends a command to the log at the current term and persists it,
    /// returning its index.
    pub fn append(&mut self, command: Vec<u8>) -> Result<Index> {
        assert!(self.term > 0, "can't append entry in term 0");
        let index = self.get_last_index().0 + 1;
        self.entries.push(Entry { term: self.term, index, command });
        self.save()?;
        Ok(index)
    }

    /// Splices entries received from a leader into the log at base_index and
    /// persists any change. The entries must be contiguous from
    /// base_index + 1, and the base must exist (callers check this via
    /// has()). Entries already in the log with matching terms are ignored;
    /// the first entry with a conflicting term truncates the log from its
    /// index before the remainder is appended. Committed entries are never
    /// truncated. Returns the resulting last index.
    pub fn splice(&mut self, base_index: Index, entries: Vec<Entry>) -> Result<Index> {
        assert!(base_index <= self.get_last_index().0, "splice base beyond log");
        if let Some(first) = entries.first() {
            assert_eq!(first.index, base_index + 1, "splice entries not at base");
            assert!(first.term > 0, "spliced entry has term 0");
        }
        assert!(
            entries.windows(2).all(|w| w[0].index + 1 == w[1].index),
            "spliced entries are not contiguous"
        );
        assert!(
            entries.windows(2).all(|w| w[0].term <= w[1].term),
            "spliced entries have term regression"
        );

        // Find the first entry that isn't already in the log, either because
        // it's beyond the end or because its term conflicts.
        let mut splice_at = None;
        for entry in &entries {
            match self.get(entry.index) {
                Some(existing) if existing.term == entry.term => {
                    debug_assert_eq!(existing.command, entry.command, "command mismatch");
                }
                Some(_) => {
                    assert!(entry.index > self.commit_index, "spliced entries below commit index");
                    splice_at = Some(entry.index);
                    break;
                }
                None => {
                    splice_at = Some(entry.index);
                    break;
                }
            }
        }

        // A conflicting entry removes it and everything after it, including
        // any existing tail beyond the incoming entries.
        if let Some(splice_at) = splice_at {
            self.entries.truncate(splice_at as usize);
            self.entries.extend(entries.into_iter().filter(|e| e.index >= splice_at));
            self.save()?;
        }
        Ok(self.get_last_index().0)
    }

    /// Commits entries up to and including the given index and persists the
    /// commit index. The index must exist and be at or after the current
    /// commit index.
    pub fn commit(&mut self, index: Index) -> Result<Index> {
        assert!(index >= self.commit_index, "commit regression {} to {index}", self.commit_index);
        assert!(self.get(index).is_some(), "commit index {index} does not exist");
        if index == self.commit_index {
            return Ok(index);
        }
        self.commit_index = index;
        self.save()?;
        Ok(index)
    }

    /// Persists the durable state as a single blob.
    fn save(&mut self) -> Result<()> {
        let blob = encoding::serialize(&DurableState {
            term: self.term,
            entries: self.entries.clone(),
            voted_for: self.vote,
            commit_index: self.commit_index,
        })?;
        self.persister.save(blob)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist;

    use pretty_assertions::assert_eq;

    fn entry(index: Index, term: Term, command: u8) -> Entry {
        Entry { term, index, command: vec![command] }
    }

    fn setup() -> Result<(Log, persist::Memory)> {
        let persister = persist::Memory::new();
        let mut log = Log::new(Box::new(persister.clone()))?;
        log.set_term(1, None)?;
        log.append(vec![0x01])?;
        log.append(vec![0x02])?;
        log.set_term(2, Some(1))?;
        log.append(vec![0x03])?;
        log.commit(2)?;
        Ok((log, persister))
    }

    #[test]
    fn new_empty() -> Result<()> {
        let log = Log::new(Box::new(persist::Memory::new()))?;
        assert_eq!(log.get_term(), (0, None));
        assert_eq!(log.get_last_index(), (0, 0));
        assert_eq!(log.get_commit_index(), (0, 0));
        assert_eq!(log.get(0), Some(&Entry { term: 0, index: 0, command: Vec::new() }));
        assert_eq!(log.get(1), None);
        Ok(())
    }

    #[test]
    fn append() -> Result<()> {
        let (mut log, _) = setup()?;
        assert_eq!(log.append(vec![0x04])?, 4);
        assert_eq!(log.get_last_index(), (4, 2));
        assert_eq!(log.get(4), Some(&entry(4, 2, 0x04)));
        Ok(())
    }

    #[test]
    fn has() -> Result<()> {
        let (log, _) = setup()?;
        // The sentinel matches (0, 0), so base index 0 always succeeds.
        assert!(log.has(0, 0));
        assert!(log.has(2, 1));
        assert!(log.has(3, 2));
        assert!(!log.has(3, 1));
        assert!(!log.has(4, 2));
        Ok(())
    }

    #[test]
    fn set_term_resets_vote() -> Result<()> {
        let (mut log, _) = setup()?;
        assert_eq!(log.get_term(), (2, Some(1)));
        log.set_term(3, None)?;
        assert_eq!(log.get_term(), (3, None));
        log.set_term(3, Some(2))?;
        assert_eq!(log.get_term(), (3, Some(2)));
        // Setting the same term and vote again is a noop.
        log.set_term(3, Some(2))?;
        assert_eq!(log.get_term(), (3, Some(2)));
        Ok(())
    }

    #[test]
    #[should_panic(expected = "term regression")]
    fn set_term_regression() {
        let (mut log, _) = setup().unwrap();
        log.set_term(1, None).unwrap();
    }

    #[test]
    #[should_panic(expected = "can't change vote")]
    fn set_term_changes_vote() {
        let (mut log, _) = setup().unwrap();
        log.set_term(2, Some(2)).unwrap();
    }

    #[test]
    fn splice_append() -> Result<()> {
        let (mut log, _) = setup()?;
        assert_eq!(log.splice(3, vec![entry(4, 2, 0x04), entry(5, 2, 0x05)])?, 5);
        assert_eq!(log.get_last_index(), (5, 2));
        assert_eq!(log.get(4), Some(&entry(4, 2, 0x04)));
        assert_eq!(log.get(5), Some(&entry(5, 2, 0x05)));
        Ok(())
    }

    #[test]
    fn splice_overlap_is_noop() -> Result<()> {
        let (mut log, _) = setup()?;
        assert_eq!(log.splice(1, vec![entry(2, 1, 0x02), entry(3, 2, 0x03)])?, 3);
        assert_eq!(log.get_last_index(), (3, 2));
        Ok(())
    }

    #[test]
    fn splice_conflict_truncates() -> Result<()> {
        let (mut log, _) = setup()?;
        // The conflicting entry at index 3 replaces the old one, and the
        // existing tail is dropped.
        log.append(vec![0x04])?;
        assert_eq!(log.splice(2, vec![entry(3, 3, 0x13)])?, 3);
        assert_eq!(log.get_last_index(), (3, 3));
        assert_eq!(log.get(3), Some(&entry(3, 3, 0x13)));
        assert_eq!(log.get(4), None);
        Ok(())
    }

    #[test]
    fn splice_partial_conflict() -> Result<()> {
        let (mut log, _) = setup()?;
        assert_eq!(log.splice(1, vec![entry(2, 1, 0x02), entry(3, 3, 0x13)])?, 3);
        assert_eq!(log.get(2), Some(&entry(2, 1, 0x02)));
        assert_eq!(log.get(3), Some(&entry(3, 3, 0x13)));
        Ok(())
    }

    #[test]
    fn splice_empty_is_heartbeat() -> Result<()> {
        let (mut log, _) = setup()?;
        assert_eq!(log.splice(3, Vec::new())?, 3);
        assert_eq!(log.get_last_index(), (3, 2));
        Ok(())
    }

    #[test]
    #[should_panic(expected = "below commit index")]
    fn splice_below_commit_index() {
        let (mut log, _) = setup().unwrap();
        log.splice(1, vec![entry(2, 3, 0x12)]).unwrap();
    }

    #[test]
    fn commit() -> Result<()> {
        let (mut log, _) = setup()?;
        assert_eq!(log.get_commit_index(), (2, 1));
        assert_eq!(log.commit(3)?, 3);
        assert_eq!(log.get_commit_index(), (3, 2));
        // Recommitting the same index is a noop.
        assert_eq!(log.commit(3)?, 3);
        Ok(())
    }

    #[test]
    #[should_panic(expected = "commit regression")]
    fn commit_regression() {
        let (mut log, _) = setup().unwrap();
        log.commit(1).unwrap();
    }

    #[test]
    fn entries_from() -> Result<()> {
        let (log, _) = setup()?;
        assert_eq!(
            log.entries_from(1),
            vec![entry(1, 1, 0x01), entry(2, 1, 0x02), entry(3, 2, 0x03)]
        );
        assert_eq!(log.entries_from(3), vec![entry(3, 2, 0x03)]);
        assert_eq!(log.entries_from(4), Vec::<Entry>::new());
        Ok(())
    }

    /// Persisting then reloading yields the identical durable tuple.
    #[test]
    fn reload() -> Result<()> {
        let (log, persister) = setup()?;
        let reloaded = Log::new(Box::new(persister))?;
        assert_eq!(reloaded.get_term(), log.get_term());
        assert_eq!(reloaded.get_last_index(), log.get_last_index());
        assert_eq!(reloaded.get_commit_index(), log.get_commit_index());
        assert_eq!(reloaded.entries_from(1), log.entries_from(1));
        Ok(())
    }

    #[test]
    fn reload_corrupt() -> Result<()> {
        let mut persister = persist::Memory::new();
        persister.save(vec![0xff, 0xff, 0xff])?;
        assert!(matches!(Log::new(Box::new(persister)), Err(Error::InvalidData(_))));
        Ok(())
    }
}
