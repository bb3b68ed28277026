// Deduplicated, ordered draft event history.
//
// Index 0 is always the most recent event. Event ids are the only ordering
// and idempotence guarantee: a reconnect can replay events the log already
// holds, so arrival order alone is never trusted.

use std::collections::HashSet;

use serde::Deserialize;

use crate::protocol::{DraftEvent, EventId};

/// How the server orders the `initial_events` backfill.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackfillOrder {
    /// Keep the order as delivered (the server sends newest first).
    #[default]
    AsGiven,
    /// The server sends oldest first; reverse so index 0 is newest.
    OldestFirst,
}

/// Outcome of pushing a single event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Appended {
    New,
    Duplicate,
}

#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Vec<DraftEvent>,
    seen: HashSet<EventId>,
    has_new_event: bool,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole log with a backfill. Returns the number of events
    /// kept; repeated ids inside the backfill keep their first occurrence.
    ///
    /// The attention flag is left alone: a backfill is history, not news.
    pub fn replace(&mut self, events: Vec<DraftEvent>, order: BackfillOrder) -> usize {
        self.seen.clear();
        self.events.clear();

        let iter: Box<dyn Iterator<Item = DraftEvent>> = match order {
            BackfillOrder::AsGiven => Box::new(events.into_iter()),
            BackfillOrder::OldestFirst => Box::new(events.into_iter().rev()),
        };
        for event in iter {
            if self.seen.insert(event.id) {
                self.events.push(event);
            }
        }
        self.events.len()
    }

    /// Prepend a single live event unless its id is already known.
    pub fn push(&mut self, event: DraftEvent) -> Appended {
        if !self.seen.insert(event.id) {
            return Appended::Duplicate;
        }
        self.events.insert(0, event);
        self.has_new_event = true;
        Appended::New
    }

    #[cfg(test)]
    fn contains(&self, id: EventId) -> bool {
        self.seen.contains(&id)
    }

    /// Events, most recent first.
    pub fn events(&self) -> &[DraftEvent] {
        &self.events
    }

    #[cfg(test)]
    fn latest(&self) -> Option<&DraftEvent> {
        self.events.first()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.events.len()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn has_new_event(&self) -> bool {
        self.has_new_event
    }

    /// Clear the attention flag; called when the history view is opened.
    pub fn mark_viewed(&mut self) {
        self.has_new_event = false;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
