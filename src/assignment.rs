//! The assignment table and pending queue, sharing a single lock
//! ("commits-lock") since they're mutated together under the commit
//! lifecycle: a commit id lives in at most one of {assignment table,
//! pending queue} at stable points.

use std::collections::{HashMap, HashSet, VecDeque};

use parking_lot::Mutex;

use crate::commit::CommitId;
use crate::registry::RunnerDescriptor;

#[derive(Default)]
struct State {
    assigned: HashMap<CommitId, RunnerDescriptor>,
    pending: VecDeque<CommitId>,
    in_flight: HashSet<CommitId>,
}

/// Dispatcher-local bookkeeping of in-flight commit coordination.
#[derive(Default)]
pub struct Commits {
    state: Mutex<State>,
}

impl Commits {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `commit` is now executing on `runner`, removing it
    /// from the pending queue if it was there.
    pub fn assign(&self, commit: CommitId, runner: RunnerDescriptor) {
        let mut state = self.state.lock();
        state.pending.retain(|c| c != &commit);
        state.in_flight.remove(&commit);
        state.assigned.insert(commit, runner);
    }

    /// Enqueues `commit` for (re)assignment.
    pub fn enqueue_pending(&self, commit: CommitId) {
        self.state.lock().pending.push_back(commit);
    }

    /// Claims `commit` for a newly spawned assignment worker. Returns
    /// `true` if the caller should spawn one, `false` if `commit` is
    /// already assigned or already has a worker in flight (dedups
    /// repeated `dispatch` commands for the same commit).
    pub fn begin_assigning(&self, commit: &CommitId) -> bool {
        let mut state = self.state.lock();
        if state.assigned.contains_key(commit) || state.in_flight.contains(commit) {
            return false;
        }
        state.in_flight.insert(commit.clone());
        true
    }

    /// Removes `commit` from the assignment table, e.g. on result
    /// ingestion. Idempotent: absence is not an error.
    pub fn clear_assignment(&self, commit: &CommitId) {
        self.state.lock().assigned.remove(commit);
    }

    /// Drains the whole pending queue atomically, for the redistributor
    /// to re-dispatch.
    pub fn drain_pending(&self) -> Vec<CommitId> {
        let mut state = self.state.lock();
        state.pending.drain(..).collect()
    }

    /// Evicts every assignment currently held by `runner`, moving those
    /// commits to the pending queue. Used when a runner fails its
    /// health check.
    pub fn evict_runner(&self, runner: &RunnerDescriptor) -> Vec<CommitId> {
        let mut state = self.state.lock();
        let orphaned: Vec<CommitId> = state
            .assigned
            .iter()
            .filter(|(_, r)| *r == runner)
            .map(|(c, _)| c.clone())
            .collect();
        for commit in &orphaned {
            state.assigned.remove(commit);
            state.pending.push_back(commit.clone());
        }
        orphaned
    }

    #[cfg(test)]
    pub fn is_assigned(&self, commit: &CommitId) -> bool {
        self.state.lock().assigned.contains_key(commit)
    }

    #[cfg(test)]
    pub fn is_pending(&self, commit: &CommitId) -> bool {
        self.state.lock().pending.contains(commit)
    }

    #[cfg(test)]
    pub fn assigned_runner(&self, commit: &CommitId) -> Option<RunnerDescriptor> {
        self.state.lock().assigned.get(commit).cloned()
    }
}
