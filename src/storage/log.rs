//! The in-memory replicated log: a vector of [`LogEntry`] with a sentinel
//! at index 0, mirroring the durable log kept by [`super::DurableStore`].

/// A single entry in the Raft log. The command is opaque to everything
/// but the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub term: u64,
    pub command: Vec<u8>,
}

impl LogEntry {
    pub fn sentinel() -> LogEntry {
        LogEntry { term: 0, command: Vec::new() }
    }
}

/// The replicated log. Index 0 is always the sentinel `(term=0, command=
/// empty)` so `prevLogIndex = 0` is always a valid lookup; real entries
/// start at index 1.
#[derive(Debug, Default)]
pub struct ReplicatedLog {
    entries: Vec<LogEntry>,
}

impl ReplicatedLog {
    pub fn new() -> ReplicatedLog {
        ReplicatedLog { entries: vec![LogEntry::sentinel()] }
    }

    /// Rebuilds the log from entries loaded off disk (index 1..).
    pub fn from_entries(entries: Vec<LogEntry>) -> ReplicatedLog {
        let mut log = ReplicatedLog::new();
        log.entries.extend(entries);
        log
    }

    pub fn last_index(&self) -> u64 {
        (self.entries.len() - 1) as u64
    }

    pub fn last_term(&self) -> u64 {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        self.entries.get(index as usize)
    }

    pub fn term_at(&self, index: u64) -> Option<u64> {
        self.get(index).map(|e| e.term)
    }

    /// All entries from `from` (inclusive) through the end, used to build
    /// an AppendEntries payload.
    pub fn entries_from(&self, from: u64) -> Vec<LogEntry> {
        self.entries.get(from as usize..).map(|s| s.to_vec()).unwrap_or_default()
    }

    pub fn append(&mut self, entry: LogEntry) -> u64 {
        self.entries.push(entry);
        self.last_index()
    }

    pub fn append_all(&mut self, entries: impl IntoIterator<Item = LogEntry>) {
        self.entries.extend(entries);
    }

    /// Drops every entry at or after `index`. `index == 0` is a no-op: the
    /// sentinel at index 0 is never truncated away, and a conflict index
    /// is always `>= 1` in practice.
    pub fn truncate(&mut self, index: u64) {
        if index == 0 {
            return;
        }
        let index = index as usize;
        if index < self.entries.len() {
            self.entries.truncate(index);
        }
    }

    /// True iff a candidate whose log ends at `(their_term, their_index)`
    /// is at least as up to date as this log, per the RequestVote
    /// freshness rule.
    pub fn is_candidate_log_fresh(&self, their_last_term: u64, their_last_index: u64) -> bool {
        let my_last_term = self.last_term();
        let my_last_index = self.last_index();
        their_last_term > my_last_term
            || (their_last_term == my_last_term && their_last_index >= my_last_index)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_with_sentinel_only() {
        let log = ReplicatedLog::new();
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.last_term(), 0);
    }

    #[test]
    fn append_advances_last_index() {
        let mut log = ReplicatedLog::new();
        let idx = log.append(LogEntry { term: 1, command: b"SET a 1".to_vec() });
        assert_eq!(idx, 1);
        assert_eq!(log.last_index(), 1);
        assert_eq!(log.last_term(), 1);
    }

    #[test]
    fn truncate_drops_tail_but_keeps_sentinel() {
        let mut log = mocks::log_with_entries_at_term(5, 1);
        log.truncate(3);
        assert_eq!(log.last_index(), 2);
        log.truncate(0);
        assert_eq!(log.last_index(), 2, "truncate(0) must never remove the sentinel");
    }

    #[test]
    fn freshness_prefers_higher_term_then_longer_log() {
        let log = mocks::log_with_entries_at_term(3, 2);
        assert!(log.is_candidate_log_fresh(3, 0));
        assert!(log.is_candidate_log_fresh(2, 3));
        assert!(!log.is_candidate_log_fresh(2, 2));
        assert!(!log.is_candidate_log_fresh(1, 10));
    }
}
