//! In-process publish/subscribe for connection and hook events.
//!
//! Status indicators and uptime tracking subscribe by topic; the returned
//! [`Subscription`] unsubscribes when dropped.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use hookwatch_protocol::NotificationRecord;

use crate::transition::ConnectionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    HookReceived,
    ConnectionIdReceived,
    Disconnected,
    StatusChanged,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::HookReceived => "hook-received",
            Topic::ConnectionIdReceived => "connection-id-received",
            Topic::Disconnected => "disconnected",
            Topic::StatusChanged => "status-changed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    HookReceived(NotificationRecord),
    ConnectionIdReceived(String),
    Disconnected,
    StatusChanged(ConnectionState),
}

impl BusEvent {
    pub fn topic(&self) -> Topic {
        match self {
            BusEvent::HookReceived(_) => Topic::HookReceived,
            BusEvent::ConnectionIdReceived(_) => Topic::ConnectionIdReceived,
            BusEvent::Disconnected => Topic::Disconnected,
            BusEvent::StatusChanged(_) => Topic::StatusChanged,
        }
    }
}

type Handler = Arc<dyn Fn(&BusEvent) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    handlers: Vec<(u64, Topic, Handler)>,
}

/// Cheap to Clone; clones share subscribers.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `event` to every handler subscribed to its topic, in
    /// subscription order. Handlers run outside the registry lock, so they
    /// may subscribe or unsubscribe.
    pub fn publish(&self, event: BusEvent) {
        let topic = event.topic();
        let handlers: Vec<Handler> = {
            let registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
            registry
                .handlers
                .iter()
                .filter(|(_, t, _)| *t == topic)
                .map(|(_, _, h)| h.clone())
                .collect()
        };

        for handler in handlers {
            handler(&event);
        }
    }

    pub fn subscribe<F>(&self, topic: Topic, handler: F) -> Subscription
    where
        F: Fn(&BusEvent) + Send + Sync + 'static,
    {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        registry.next_id += 1;
        let id = registry.next_id;
        registry.handlers.push((id, topic, Arc::new(handler)));

        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .handlers
            .iter()
            .filter(|(_, t, _)| *t == topic)
            .count()
    }
}

/// Unsubscribes on drop.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .handlers
                .retain(|(id, _, _)| *id != self.id);
        }
    }
}
