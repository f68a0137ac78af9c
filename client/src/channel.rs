//! Publish/subscribe seam the synchronization core talks through.
//!
//! The core never sees a socket. It publishes JSON payloads on logical
//! [`Topic`]s and receives [`Delivery`] values through handlers. The relay
//! client implements this over a WebSocket, [`MemoryHub`] implements it
//! in-process.

use parking_lot::Mutex;
use serde::Serialize;
use std::{collections::HashMap, sync::Arc};

use crate::error::Result;
use crate::protocol::Topic;

/// Publisher identity the relay uses for messages it originates itself.
pub const SERVER_ORIGIN: &str = "server";

/// A message received on a subscribed topic.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: Topic,
    /// Identity of the publisher, stamped by the channel.
    pub from: String,
    pub payload: serde_json::Value,
}

pub type Handler = Box<dyn Fn(Delivery) + Send + Sync>;

pub trait Channel: Send + Sync {
    fn publish(&self, topic: &Topic, payload: serde_json::Value) -> Result<()>;

    fn subscribe(&self, topic: &Topic, handler: Handler) -> Result<Subscription>;
}

/// Serialize `message` and publish it on `topic`.
pub fn publish_as<T: Serialize>(channel: &dyn Channel, topic: &Topic, message: &T) -> Result<()> {
    let payload = serde_json::to_value(message)?;
    channel.publish(topic, payload)
}

/// Guard for one subscription. Dropping it unsubscribes.
pub struct Subscription {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    pub fn unsubscribe(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release_now();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.release.is_some())
            .finish()
    }
}

/// Topic -> handlers table shared by the channel implementations.
#[derive(Default)]
pub(crate) struct TopicRouter {
    next_id: u64,
    handlers: HashMap<Topic, Vec<(u64, Arc<Handler>)>>,
}

impl TopicRouter {
    /// Register a handler. Returns its id and whether it is the first one on the topic.
    pub(crate) fn add(&mut self, topic: &Topic, handler: Handler) -> (u64, bool) {
        self.next_id += 1;
        let id = self.next_id;
        let entry = self.handlers.entry(topic.clone()).or_default();
        let first = entry.is_empty();
        entry.push((id, Arc::new(handler)));
        (id, first)
    }

    /// Remove a handler. Returns true when the topic has no handlers left.
    pub(crate) fn remove(&mut self, topic: &Topic, id: u64) -> bool {
        let Some(entry) = self.handlers.get_mut(topic) else {
            return false;
        };
        entry.retain(|(handler_id, _)| *handler_id != id);
        if entry.is_empty() {
            self.handlers.remove(topic);
            true
        } else {
            false
        }
    }

    pub(crate) fn handlers(&self, topic: &Topic) -> Vec<Arc<Handler>> {
        self.handlers
            .get(topic)
            .map(|entry| entry.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default()
    }

    pub(crate) fn topics(&self) -> Vec<Topic> {
        self.handlers.keys().cloned().collect()
    }
}

/// In-process broker connecting any number of [`MemoryChannel`]s.
///
/// Delivery is synchronous and ordered per publisher call. Handlers run on
/// the publisher's thread with the routing lock released.
#[derive(Clone, Default)]
pub struct MemoryHub {
    router: Arc<Mutex<TopicRouter>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a client. Everything it publishes is stamped with `client_id`.
    pub fn connect(&self, client_id: impl Into<String>) -> MemoryChannel {
        MemoryChannel {
            hub: self.clone(),
            client_id: client_id.into(),
        }
    }

    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.router.lock().handlers(topic).len()
    }

    /// Publish as the room layer.
    pub fn publish_from(&self, from: &str, topic: &Topic, payload: serde_json::Value) {
        let handlers = self.router.lock().handlers(topic);
        for handler in handlers {
            handler(Delivery {
                topic: topic.clone(),
                from: from.to_string(),
                payload: payload.clone(),
            });
        }
    }
}

#[derive(Clone)]
pub struct MemoryChannel {
    hub: MemoryHub,
    client_id: String,
}

impl Channel for MemoryChannel {
    fn publish(&self, topic: &Topic, payload: serde_json::Value) -> Result<()> {
        self.hub.publish_from(&self.client_id, topic, payload);
        Ok(())
    }

    fn subscribe(&self, topic: &Topic, handler: Handler) -> Result<Subscription> {
        let (id, _) = self.hub.router.lock().add(topic, handler);
        let router = Arc::clone(&self.hub.router);
        let topic = topic.clone();
        Ok(Subscription::new(move || {
            router.lock().remove(&topic, id);
        }))
    }
}
