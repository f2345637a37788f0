//! The replicated log: a 1-based, contiguous sequence of entries with a
//! snapshot-truncated prefix.
//!
//! Indices below `last_included_index` live only inside the installed
//! snapshot; `RaftLog` stores just the suffix, so every lookup has to
//! translate a global log index into an offset into `entries`.

use serde::{Deserialize, Serialize};

pub type Term = u64;
pub type LogIndex = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct LogEntry {
    pub term: Term,
    pub index: LogIndex,
    pub command: Vec<u8>,
}

impl LogEntry {
    pub fn new(term: Term, index: LogIndex, command: Vec<u8>) -> Self {
        Self {
            term,
            index,
            command,
        }
    }
}

/// The log proper, plus the `(lastIncludedIndex, lastIncludedTerm)` baseline
/// left behind by the most recently installed snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct RaftLog {
    entries: Vec<LogEntry>,
    last_included_index: LogIndex,
    last_included_term: Term,
}

impl RaftLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_included_index(&self) -> LogIndex {
        self.last_included_index
    }

    pub fn last_included_term(&self) -> Term {
        self.last_included_term
    }

    /// Highest index present, whether in the log suffix or only implied by
    /// the snapshot baseline.
    pub fn last_index(&self) -> LogIndex {
        self.entries
            .last()
            .map(|e| e.index)
            .unwrap_or(self.last_included_index)
    }

    pub fn last_term(&self) -> Term {
        self.entries
            .last()
            .map(|e| e.term)
            .unwrap_or(self.last_included_term)
    }

    fn offset_of(&self, index: LogIndex) -> Option<usize> {
        if index <= self.last_included_index {
            return None;
        }
        let offset = index - self.last_included_index - 1;
        Some(offset as usize)
    }

    /// Term at `index`, including the synthetic entry representing the
    /// snapshot baseline itself (`index == last_included_index`).
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == self.last_included_index {
            return Some(self.last_included_term);
        }
        let offset = self.offset_of(index)?;
        self.entries.get(offset).map(|e| e.term)
    }

    pub fn entry_at(&self, index: LogIndex) -> Option<&LogEntry> {
        let offset = self.offset_of(index)?;
        self.entries.get(offset)
    }

    /// Entries in `[from, last_index]`, inclusive. Empty if `from` is past
    /// the end.
    pub fn entries_from(&self, from: LogIndex) -> &[LogEntry] {
        match self.offset_of(from) {
            Some(offset) if offset <= self.entries.len() => &self.entries[offset..],
            Some(_) => &[],
            None => &self.entries[..],
        }
    }

    /// Leader-side append-only: push a freshly created entry.
    pub fn append(&mut self, entry: LogEntry) {
        debug_assert_eq!(entry.index, self.last_index() + 1);
        self.entries.push(entry);
    }

    /// Follower-side: apply the consistency-checked append. Truncates any
    /// suffix that conflicts in term with an incoming entry, then appends
    /// entries not already present. Returns the index of the last entry
    /// considered (new or pre-existing).
    pub fn append_entries(&mut self, prev_log_index: LogIndex, new_entries: &[LogEntry]) -> LogIndex {
        let mut next_index = prev_log_index;
        for entry in new_entries {
            next_index = entry.index;
            match self.offset_of(entry.index) {
                None => {
                    // Index already subsumed by the snapshot baseline; skip.
                    continue;
                }
                Some(offset) => {
                    if let Some(existing) = self.entries.get(offset) {
                        if existing.term == entry.term {
                            continue;
                        }
                        self.entries.truncate(offset);
                    }
                    debug_assert_eq!(self.entries.len(), offset);
                    self.entries.push(entry.clone());
                }
            }
        }
        next_index.max(prev_log_index)
    }

    /// The conflict hint used for fast backoff on an `AppendEntries`
    /// rejection: `(conflictTerm, firstIndexOfThatTerm)`.
    pub fn conflict_hint(&self, prev_log_index: LogIndex) -> (Option<Term>, LogIndex) {
        match self.term_at(prev_log_index) {
            Some(term) => {
                let mut first = prev_log_index;
                while first > self.last_included_index + 1 {
                    if self.term_at(first - 1) == Some(term) {
                        first -= 1;
                    } else {
                        break;
                    }
                }
                (Some(term), first)
            }
            None => (None, self.last_index() + 1),
        }
    }

    /// Replace the prefix through `last_included_index` with a snapshot
    /// baseline. If the log still holds a suffix starting exactly at
    /// `last_included_index + 1` with a matching term, retain it; otherwise
    /// discard everything.
    pub fn install_snapshot(&mut self, last_included_index: LogIndex, last_included_term: Term) {
        if let Some(offset) = self.offset_of(last_included_index + 1) {
            if offset <= self.entries.len() {
                self.entries.drain(..offset);
            } else {
                self.entries.clear();
            }
        } else {
            self.entries.clear();
        }
        self.last_included_index = last_included_index;
        self.last_included_term = last_included_term;
    }

    /// Truncate the prefix through `through_index` after the state machine
    /// has taken a snapshot covering it (leader-initiated compaction, spec
    /// §4.1 "Snapshot trigger").
    pub fn compact(&mut self, through_index: LogIndex) {
        let term = match self.term_at(through_index) {
            Some(t) => t,
            None => return,
        };
        self.install_snapshot(through_index, term);
    }
}
