//! Event bus: scoped publish/subscribe with bounded per-scope history.
//!
//! Subscriptions are keyed by `(event, subscriber route)`. History is kept per
//! `(event, scope)`; the capacity of each history is the largest `persist` ever
//! published for that pair, so a low-persist publish never shrinks what an
//! earlier high-persist publisher asked to keep.
//!
//! The bus does not know about transports. Delivery goes through an
//! `EventDelivery` implementation supplied by the caller (the router delivers by
//! sending an `eventrecv` request to the subscriber's route).

use crate::config::EventConfig;
use crate::error::Result;
use crate::types::{SubscriptionRequest, WaveEvent};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, RwLock};
use tracing::{debug, warn};

/// A live subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub event: String,
    pub scopes: Vec<String>,
    pub all_scopes: bool,
    pub subscriber: String,
}

impl Subscription {
    /// Whether a published event should reach this subscriber.
    ///
    /// Unscoped subscriptions receive unscoped events only.
    pub fn matches(&self, event: &WaveEvent) -> bool {
        if self.event != event.event {
            return false;
        }
        if self.all_scopes {
            return true;
        }
        if self.scopes.is_empty() {
            return event.scopes.is_empty();
        }
        self.scopes.iter().any(|s| event.has_scope(s))
    }
}

/// Delivers one event to one subscriber route.
pub trait EventDelivery: Send + Sync {
    fn deliver(&self, subscriber: &str, event: &WaveEvent) -> Result<()>;
}

/// Outcome of a publish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
struct History {
    capacity: usize,
    events: VecDeque<WaveEvent>,
}

impl History {
    fn push(&mut self, event: WaveEvent, persist: usize) {
        self.capacity = self.capacity.max(persist.min(EventConfig::MAX_PERSIST));
        self.events.push_back(event);
        while self.events.len() > self.capacity {
            self.events.pop_front();
        }
    }
}

/// Subscription registry plus event history.
#[derive(Debug, Default)]
pub struct EventBus {
    /// event name -> subscriber route -> subscription
    subscriptions: RwLock<HashMap<String, HashMap<String, Subscription>>>,
    /// (event, scope) -> retained events
    history: Mutex<HashMap<(String, String), History>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record history and deliver `event` to every matching subscriber.
    ///
    /// A failed delivery is logged and skipped; it never stops delivery to the
    /// remaining subscribers.
    pub fn publish(&self, event: &WaveEvent, delivery: &dyn EventDelivery) -> PublishReport {
        if event.persist > 0 {
            self.record(event);
        }

        let mut report = PublishReport::default();
        for subscriber in self.matching_subscribers(event) {
            match delivery.deliver(&subscriber, event) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(
                        "Failed to deliver event {:?} to {}: {}",
                        event.event, subscriber, e
                    );
                    report.failed += 1;
                }
            }
        }
        debug!(
            "Published {:?} to {} subscriber(s), {} failed",
            event.event, report.delivered, report.failed
        );
        report
    }

    fn record(&self, event: &WaveEvent) {
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        for scope in &event.scopes {
            history
                .entry((event.event.clone(), scope.clone()))
                .or_default()
                .push(event.clone(), event.persist);
        }
    }

    /// Routes of the subscribers that should receive `event`.
    pub fn matching_subscribers(&self, event: &WaveEvent) -> Vec<String> {
        let subscriptions = self.subscriptions.read().unwrap_or_else(|e| e.into_inner());
        subscriptions
            .get(&event.event)
            .map(|subs| {
                subs.values()
                    .filter(|sub| sub.matches(event))
                    .map(|sub| sub.subscriber.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Subscribe `subscriber`, replacing any previous scope set it had for the
    /// same event.
    pub fn subscribe(&self, request: SubscriptionRequest, subscriber: &str) {
        let SubscriptionRequest {
            event,
            mut scopes,
            all_scopes,
        } = request;
        scopes.sort();
        scopes.dedup();

        let sub = Subscription {
            event: event.clone(),
            scopes,
            all_scopes,
            subscriber: subscriber.to_string(),
        };
        self.subscriptions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(event)
            .or_default()
            .insert(subscriber.to_string(), sub);
    }

    /// Remove one subscription; no-op when absent.
    pub fn unsubscribe(&self, event: &str, subscriber: &str) {
        let mut subscriptions = self.subscriptions.write().unwrap_or_else(|e| e.into_inner());
        if let Some(subs) = subscriptions.get_mut(event) {
            subs.remove(subscriber);
            if subs.is_empty() {
                subscriptions.remove(event);
            }
        }
    }

    /// Remove every subscription of `subscriber`.
    pub fn unsubscribe_all(&self, subscriber: &str) {
        let mut subscriptions = self.subscriptions.write().unwrap_or_else(|e| e.into_inner());
        subscriptions.retain(|_, subs| {
            subs.remove(subscriber);
            !subs.is_empty()
        });
    }

    /// Subscriptions currently held by `subscriber`.
    pub fn subscriptions_of(&self, subscriber: &str) -> Vec<Subscription> {
        let subscriptions = self.subscriptions.read().unwrap_or_else(|e| e.into_inner());
        let mut subs: Vec<Subscription> = subscriptions
            .values()
            .filter_map(|subs| subs.get(subscriber).cloned())
            .collect();
        subs.sort_by(|a, b| a.event.cmp(&b.event));
        subs
    }

    /// Up to `max_items` most recent retained events, oldest first.
    pub fn read_history(&self, event: &str, scope: &str, max_items: usize) -> Vec<WaveEvent> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        let Some(h) = history.get(&(event.to_string(), scope.to_string())) else {
            return Vec::new();
        };
        let skip = h.events.len().saturating_sub(max_items);
        h.events.iter().skip(skip).cloned().collect()
    }

    pub(crate) fn clear(&self) {
        self.subscriptions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.history.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}
