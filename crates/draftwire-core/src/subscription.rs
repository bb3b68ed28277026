// Observer registry for draft events.
//
// Subscribers are stored by handle id. Dispatch looks up the current
// callbacks at call time, so swapping a closure on a live handle never
// touches the connection that feeds it.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::protocol::{DraftEvent, DraftId, DraftSnapshot};

pub type EventCallback = Arc<dyn Fn(&DraftEvent) + Send + Sync>;
pub type SnapshotCallback = Arc<dyn Fn(&DraftSnapshot) + Send + Sync>;
pub type RefreshCallback = Arc<dyn Fn(&DraftEvent) + Send + Sync>;
pub type NotificationCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// A set of optional callbacks. Build with the chained setters:
///
/// ```
/// # use draftwire_core::subscription::Subscriber;
/// let subscriber = Subscriber::new()
///     .on_event(|event| println!("event {}", event.id))
///     .on_refresh_needed(|_| println!("refetch draft"));
/// ```
#[derive(Clone, Default)]
pub struct Subscriber {
    on_event: Option<EventCallback>,
    on_snapshot: Option<SnapshotCallback>,
    on_refresh_needed: Option<RefreshCallback>,
    on_notification: Option<NotificationCallback>,
}

impl Subscriber {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fired once per new (non-duplicate) live event.
    pub fn on_event(mut self, f: impl Fn(&DraftEvent) + Send + Sync + 'static) -> Self {
        self.on_event = Some(Arc::new(f));
        self
    }

    /// Fired when an event arrived with a snapshot attached.
    pub fn on_snapshot(mut self, f: impl Fn(&DraftSnapshot) + Send + Sync + 'static) -> Self {
        self.on_snapshot = Some(Arc::new(f));
        self
    }

    /// Fired when a significant event arrived without a snapshot.
    pub fn on_refresh_needed(mut self, f: impl Fn(&DraftEvent) + Send + Sync + 'static) -> Self {
        self.on_refresh_needed = Some(Arc::new(f));
        self
    }

    /// Fired with toast text for significant events.
    pub fn on_notification(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_notification = Some(Arc::new(f));
        self
    }
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("on_event", &self.on_event.is_some())
            .field("on_snapshot", &self.on_snapshot.is_some())
            .field("on_refresh_needed", &self.on_refresh_needed.is_some())
            .field("on_notification", &self.on_notification.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

struct Entry {
    draft_id: DraftId,
    subscriber: Subscriber,
}

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    entries: BTreeMap<SubscriberId, Entry>,
}

/// Shared registry of subscribers, keyed by handle id. Clones share state.
#[derive(Clone, Default)]
pub struct SubscriberRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        // Callbacks never run under the lock, so a poisoned guard still holds
        // a consistent map.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self, draft_id: DraftId, subscriber: Subscriber) -> Subscription {
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = SubscriberId(inner.next_id);
        inner.entries.insert(id, Entry { draft_id, subscriber });
        Subscription {
            id,
            draft_id,
            registry: self.clone(),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lock().entries.len()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn count_for(&self, draft_id: DraftId) -> usize {
        self.lock()
            .entries
            .values()
            .filter(|e| e.draft_id == draft_id)
            .count()
    }

    /// Drop every subscriber registered against `draft_id`.
    pub fn clear_draft(&self, draft_id: DraftId) -> usize {
        let mut inner = self.lock();
        let before = inner.entries.len();
        inner.entries.retain(|_, e| e.draft_id != draft_id);
        before - inner.entries.len()
    }

    fn remove(&self, id: SubscriberId) -> bool {
        self.lock().entries.remove(&id).is_some()
    }

    fn contains(&self, id: SubscriberId) -> bool {
        self.lock().entries.contains_key(&id)
    }

    fn update(&self, id: SubscriberId, f: impl FnOnce(&mut Subscriber)) -> bool {
        match self.lock().entries.get_mut(&id) {
            Some(entry) => {
                f(&mut entry.subscriber);
                true
            }
            None => false,
        }
    }

    /// Clone out the callbacks selected by `pick` for one draft, in
    /// registration order, so they can run without holding the lock.
    fn collect<T>(
        &self,
        draft_id: DraftId,
        pick: impl Fn(&Subscriber) -> Option<T>,
    ) -> Vec<T> {
        self.lock()
            .entries
            .values()
            .filter(|e| e.draft_id == draft_id)
            .filter_map(|e| pick(&e.subscriber))
            .collect()
    }

    pub fn dispatch_event(&self, draft_id: DraftId, event: &DraftEvent) {
        for callback in self.collect(draft_id, |s| s.on_event.clone()) {
            callback(event);
        }
    }

    pub fn dispatch_snapshot(&self, draft_id: DraftId, snapshot: &DraftSnapshot) {
        for callback in self.collect(draft_id, |s| s.on_snapshot.clone()) {
            callback(snapshot);
        }
    }

    pub fn dispatch_refresh_needed(&self, draft_id: DraftId, event: &DraftEvent) {
        for callback in self.collect(draft_id, |s| s.on_refresh_needed.clone()) {
            callback(event);
        }
    }

    pub fn dispatch_notification(&self, draft_id: DraftId, text: &str) {
        for callback in self.collect(draft_id, |s| s.on_notification.clone()) {
            callback(text);
        }
    }
}

/// Handle to one registered subscriber. Dropping it unsubscribes.
pub struct Subscription {
    id: SubscriberId,
    draft_id: DraftId,
    registry: SubscriberRegistry,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn draft_id(&self) -> DraftId {
        self.draft_id
    }

    /// False once unsubscribed or cleared by a disconnect.
    pub fn is_active(&self) -> bool {
        self.registry.contains(self.id)
    }

    /// Swap all callbacks at once. Returns false if no longer registered.
    pub fn replace(&self, subscriber: Subscriber) -> bool {
        self.registry.update(self.id, |s| *s = subscriber)
    }

    pub fn set_on_event(&self, f: impl Fn(&DraftEvent) + Send + Sync + 'static) -> bool {
        let callback: EventCallback = Arc::new(f);
        self.registry.update(self.id, |s| s.on_event = Some(callback))
    }

    pub fn set_on_snapshot(&self, f: impl Fn(&DraftSnapshot) + Send + Sync + 'static) -> bool {
        let callback: SnapshotCallback = Arc::new(f);
        self.registry.update(self.id, |s| s.on_snapshot = Some(callback))
    }

    pub fn set_on_refresh_needed(&self, f: impl Fn(&DraftEvent) + Send + Sync + 'static) -> bool {
        let callback: RefreshCallback = Arc::new(f);
        self.registry
            .update(self.id, |s| s.on_refresh_needed = Some(callback))
    }

    pub fn set_on_notification(&self, f: impl Fn(&str) + Send + Sync + 'static) -> bool {
        let callback: NotificationCallback = Arc::new(f);
        self.registry
            .update(self.id, |s| s.on_notification = Some(callback))
    }

    pub fn unsubscribe(self) {
        // Drop does the work.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("draft_id", &self.draft_id)
            .finish()
    }
}
