//! Per-resource change notifications.
//!
//! Notifications raised while the cache is in the middle of an operation are
//! queued and handed out by `deliver`, so observers only ever see settled
//! state.

use std::collections::HashMap;

use indexmap::{IndexMap, IndexSet};
use recordcache_core::ids::{HandleAllocator, ResourceKey, SubscriptionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Attributes,
    Relationships,
    Identity,
    Errors,
    State,
    Unload,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Attributes => "attributes",
            Self::Relationships => "relationships",
            Self::Identity => "identity",
            Self::Errors => "errors",
            Self::State => "state",
            Self::Unload => "unload",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Notification {
    pub key: ResourceKey,
    pub kind: ChangeKind,
    pub field: Option<String>,
}

pub type ChangeCallback = Box<dyn FnMut(ResourceKey, ChangeKind, Option<&str>) + Send>;

struct Subscriber {
    key: ResourceKey,
    callback: ChangeCallback,
}

#[derive(Default)]
pub struct NotificationHub {
    handles: HandleAllocator,
    subscribers: IndexMap<SubscriptionId, Subscriber>,
    by_key: HashMap<ResourceKey, IndexSet<SubscriptionId>>,
    queue: IndexSet<Notification>,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, key: ResourceKey, callback: ChangeCallback) -> SubscriptionId {
        let token = self.handles.next_subscription();
        self.subscribers.insert(token, Subscriber { key, callback });
        self.by_key.entry(key).or_default().insert(token);
        token
    }

    /// Allocate a token from the same sequence as resource subscriptions,
    /// for subscriptions held elsewhere.
    pub fn reserve_token(&self) -> SubscriptionId {
        self.handles.next_subscription()
    }

    /// Remove a subscription. Unknown or already-removed tokens are ignored.
    pub fn unsubscribe(&mut self, token: SubscriptionId) -> bool {
        let Some(subscriber) = self.subscribers.shift_remove(&token) else {
            return false;
        };
        if let Some(tokens) = self.by_key.get_mut(&subscriber.key) {
            tokens.shift_remove(&token);
            if tokens.is_empty() {
                self.by_key.remove(&subscriber.key);
            }
        }
        true
    }

    pub fn has_subscribers(&self, key: ResourceKey) -> bool {
        self.by_key.get(&key).is_some_and(|t| !t.is_empty())
    }

    /// Point every subscription on `loser` at `survivor`.
    pub fn rebind(&mut self, loser: ResourceKey, survivor: ResourceKey) {
        let Some(tokens) = self.by_key.remove(&loser) else {
            return;
        };
        for token in &tokens {
            if let Some(subscriber) = self.subscribers.get_mut(token) {
                subscriber.key = survivor;
            }
        }
        self.by_key.entry(survivor).or_default().extend(tokens);

        let pending: Vec<Notification> = self.queue.drain(..).collect();
        self.queue = pending
            .into_iter()
            .map(|mut n| {
                if n.key == loser {
                    n.key = survivor;
                }
                n
            })
            .collect();
    }

    /// Queue a notification. Duplicates within one batch collapse.
    pub fn enqueue(&mut self, key: ResourceKey, kind: ChangeKind, field: Option<&str>) {
        self.queue.insert(Notification {
            key,
            kind,
            field: field.map(str::to_string),
        });
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Hand every queued notification to the subscribers of its key.
    pub fn deliver(&mut self) -> usize {
        let batch: Vec<Notification> = self.queue.drain(..).collect();
        let mut delivered = 0;
        for notification in batch {
            let Some(tokens) = self.by_key.get(&notification.key) else {
                continue;
            };
            let tokens: Vec<SubscriptionId> = tokens.iter().copied().collect();
            for token in tokens {
                if let Some(subscriber) = self.subscribers.get_mut(&token) {
                    (subscriber.callback)(
                        notification.key,
                        notification.kind,
                        notification.field.as_deref(),
                    );
                    delivered += 1;
                }
            }
        }
        if delivered > 0 {
            tracing::trace!(delivered, "delivered change notifications");
        }
        delivered
    }
}
