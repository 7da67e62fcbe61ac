//! Typed publish/subscribe bus connecting data producers (cache, overlay,
//! presenters, sync) to consumers (views, navigator, session hooks).
//!
//! Dispatch is synchronous. Subscribers of one topic are called in the order
//! they subscribed; the subscriber list is snapshotted before dispatch, so a
//! handler that subscribes or unsubscribes only affects later publishes.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::app::navigation::{NavControls, TabId};
use crate::app::presenter::LifecycleEvent;
use crate::cache::CachedRecord;
use crate::core::models::{AnnotationKind, RecordId};

/// Identity of whoever registered a subscription (a presenter, a view, a tab).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    RecordUpdated,
    AnnotationUpdated,
    UnreadCountChanged,
    ConnectivityChanged,
    TabChanged,
    /// Lifecycle events of one presenter instance.
    Presenter(OwnerId),
}

#[derive(Debug, Clone)]
pub enum Event {
    /// Remote-origin fields of a cached record changed.
    RecordUpdated { record: Arc<CachedRecord> },
    AnnotationUpdated {
        id: RecordId,
        kind: AnnotationKind,
        value: bool,
    },
    UnreadCountChanged { unread: usize },
    ConnectivityChanged { online: bool },
    TabChanged {
        tab: TabId,
        record_id: RecordId,
        controls: NavControls,
    },
    Lifecycle {
        presenter: OwnerId,
        event: LifecycleEvent,
    },
}

impl Event {
    pub fn topic(&self) -> Topic {
        match self {
            Event::RecordUpdated { .. } => Topic::RecordUpdated,
            Event::AnnotationUpdated { .. } => Topic::AnnotationUpdated,
            Event::UnreadCountChanged { .. } => Topic::UnreadCountChanged,
            Event::ConnectivityChanged { .. } => Topic::ConnectivityChanged,
            Event::TabChanged { .. } => Topic::TabChanged,
            Event::Lifecycle { presenter, .. } => Topic::Presenter(*presenter),
        }
    }
}

enum Delivery {
    Delivered,
    OwnerGone,
}

type Handler = Box<dyn Fn(&Event) -> Delivery + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    owner: OwnerId,
    handler: Handler,
}

#[derive(Default)]
struct BusInner {
    topics: Mutex<HashMap<Topic, Vec<Arc<Subscription>>>>,
    next_id: AtomicU64,
}

#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriptions", &self.subscription_count())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh owner identity.
    pub fn register_owner(&self) -> OwnerId {
        OwnerId(self.next_id())
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Subscribe a handler that is always invoked.
    pub fn subscribe<F>(&self, owner: OwnerId, topic: Topic, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.insert(
            owner,
            topic,
            Box::new(move |event| {
                handler(event);
                Delivery::Delivered
            }),
        )
    }

    /// Subscribe on behalf of `target`. Once `target` is dropped the handler
    /// silently stops firing and the subscription is pruned.
    pub fn subscribe_safe<T, F>(
        &self,
        owner: OwnerId,
        topic: Topic,
        target: &Arc<T>,
        handler: F,
    ) -> SubscriptionId
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn(&T, &Event) + Send + Sync + 'static,
    {
        let weak: Weak<T> = Arc::downgrade(target);
        self.insert(
            owner,
            topic,
            Box::new(move |event| match weak.upgrade() {
                Some(target) => {
                    handler(&*target, event);
                    Delivery::Delivered
                }
                None => Delivery::OwnerGone,
            }),
        )
    }

    fn insert(&self, owner: OwnerId, topic: Topic, handler: Handler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id());
        self.inner
            .topics
            .lock()
            .entry(topic)
            .or_default()
            .push(Arc::new(Subscription { id, owner, handler }));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut topics = self.inner.topics.lock();
        for subs in topics.values_mut() {
            subs.retain(|s| s.id != id);
        }
        topics.retain(|_, subs| !subs.is_empty());
    }

    /// Drop every subscription registered by `owner`.
    pub fn unsubscribe_all(&self, owner: OwnerId) {
        let mut topics = self.inner.topics.lock();
        let mut removed = 0usize;
        for subs in topics.values_mut() {
            let before = subs.len();
            subs.retain(|s| s.owner != owner);
            removed += before - subs.len();
        }
        topics.retain(|_, subs| !subs.is_empty());
        if removed > 0 {
            log::debug!("Removed {removed} subscriptions of {owner:?}");
        }
    }

    /// Deliver `event` to the current subscribers of its topic.
    pub fn publish(&self, event: Event) {
        let topic = event.topic();
        let snapshot: Vec<Arc<Subscription>> = match self.inner.topics.lock().get(&topic) {
            Some(subs) => subs.clone(),
            None => return,
        };

        let mut gone = Vec::new();
        for sub in &snapshot {
            if let Delivery::OwnerGone = (sub.handler)(&event) {
                gone.push(sub.id);
            }
        }

        if !gone.is_empty() {
            let mut topics = self.inner.topics.lock();
            if let Some(subs) = topics.get_mut(&topic) {
                subs.retain(|s| !gone.contains(&s.id));
            }
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.topics.lock().values().map(Vec::len).sum()
    }

    /// Number of live subscriptions held by one owner.
    pub fn owner_subscription_count(&self, owner: OwnerId) -> usize {
        self.inner
            .topics
            .lock()
            .values()
            .flatten()
            .filter(|s| s.owner == owner)
            .count()
    }
}
