use std::collections::BTreeSet;

/// Offsets of one partition that were handed to its processor and not committed yet.
///
/// Records complete in any order. The commit point is the highest completed offset with
/// no tracked offset still pending below it.
#[derive(Debug, Default)]
pub struct UncommittedOffsets {
    pending: BTreeSet<i64>,
    completed: BTreeSet<i64>,
}

impl UncommittedOffsets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, offset: i64) {
        self.pending.insert(offset);
    }

    /// Stop tracking an offset that was never handed to the worker
    pub fn forget(&mut self, offset: i64) {
        self.pending.remove(&offset);
    }

    pub fn complete(&mut self, offset: i64) {
        if self.pending.remove(&offset) {
            self.completed.insert(offset);
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn safe_offset(&self) -> Option<i64> {
        match self.pending.first() {
            Some(&lowest_pending) => self.completed.range(..lowest_pending).next_back().copied(),
            None => self.completed.last().copied(),
        }
    }

    /// Return the commit point and forget everything at or below it
    pub fn take_safe_offset(&mut self) -> Option<i64> {
        let safe = self.safe_offset()?;
        self.completed = self.completed.split_off(&(safe + 1));
        Some(safe)
    }
}
