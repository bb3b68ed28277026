// Snapshot reconciliation.
//
// A live event either carries the authoritative draft state with it or it
// does not. With a snapshot the state is replaced in place; without one, a
// significant event means local state is stale and the consumer must fetch
// it out of band. The event log advances either way.

use crate::protocol::{DraftEvent, DraftSnapshot};

/// What reconciling one event did to the canonical state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// The attached snapshot became the canonical state.
    Applied,
    /// No snapshot on a significant event; an authoritative fetch is needed.
    RefreshNeeded,
    /// Nothing to do (informational event without snapshot).
    Unchanged,
}

#[derive(Debug, Clone, Default)]
pub struct Reconciler {
    snapshot: Option<DraftSnapshot>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reconcile(
        &mut self,
        event: &DraftEvent,
        snapshot: Option<DraftSnapshot>,
    ) -> Reconciliation {
        match snapshot {
            Some(snapshot) => {
                self.snapshot = Some(snapshot);
                Reconciliation::Applied
            }
            None if event.is_significant() => Reconciliation::RefreshNeeded,
            None => Reconciliation::Unchanged,
        }
    }

    /// Install a snapshot obtained outside the socket (REST refresh).
    pub fn apply(&mut self, snapshot: DraftSnapshot) {
        self.snapshot = Some(snapshot);
    }

    pub fn snapshot(&self) -> Option<&DraftSnapshot> {
        self.snapshot.as_ref()
    }

    pub fn is_draft_completed(&self) -> bool {
        self.snapshot
            .as_ref()
            .is_some_and(DraftSnapshot::is_pool_exhausted)
    }

    pub fn users_remaining_count(&self) -> usize {
        self.snapshot
            .as_ref()
            .map_or(0, DraftSnapshot::users_remaining_count)
    }

    pub fn reset(&mut self) {
        self.snapshot = None;
    }
}
