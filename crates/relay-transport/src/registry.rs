//! Handler lookup tables for a connection.

use dashmap::DashMap;
use relay_protocol::{Encoder, Header};
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

use crate::connection::ConnectionError;
use crate::handler::Handler;

struct PendingReply<E: Encoder> {
    handler: Handler<E>,
    registered: Instant,
}

/// Message handlers keyed by topic plus pending reply handlers keyed by
/// correlation id.
///
/// Both maps are locked independently of the connection's writer, so a
/// lookup never waits on an in-flight send.
pub(crate) struct HandlerRegistry<E: Encoder> {
    messages: DashMap<String, Handler<E>>,
    replies: DashMap<String, PendingReply<E>>,
}

impl<E: Encoder> HandlerRegistry<E> {
    pub(crate) fn new() -> Self {
        Self {
            messages: DashMap::new(),
            replies: DashMap::new(),
        }
    }

    /// Register a message handler, replacing any handler on the same topic.
    pub(crate) fn set_message(&self, handler: Handler<E>) -> Result<(), ConnectionError> {
        if handler.is_reply() {
            return Err(ConnectionError::InvalidHandler(
                "message handler requires a topic".into(),
            ));
        }
        handler.probe()?;

        let topic = handler.topic().to_string();
        if self.messages.insert(topic.clone(), handler).is_some() {
            trace!(topic = %topic, "Replaced message handler");
        }
        Ok(())
    }

    pub(crate) fn remove_message(&self, topic: &str) -> bool {
        self.messages.remove(topic).is_some()
    }

    pub(crate) fn topics(&self) -> Vec<String> {
        self.messages.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Register a single-use reply handler for an outgoing correlation id.
    pub(crate) fn register_reply(&self, id: String, handler: Handler<E>) -> Result<(), ConnectionError> {
        if !handler.is_reply() {
            return Err(ConnectionError::InvalidHandler(format!(
                "reply handler must not have a topic, got '{}'",
                handler.topic()
            )));
        }
        handler.probe()?;

        self.replies.insert(
            id,
            PendingReply {
                handler,
                registered: Instant::now(),
            },
        );
        Ok(())
    }

    pub(crate) fn cancel_reply(&self, id: &str) {
        self.replies.remove(id);
    }

    /// Find the handler for an inbound frame.
    ///
    /// A pending reply matching the correlation id wins and is consumed;
    /// otherwise the message handler for the topic is returned.
    pub(crate) fn find(&self, header: &Header) -> Option<Handler<E>> {
        if let Some((_, pending)) = self.replies.remove(&header.id) {
            return Some(pending.handler);
        }
        self.messages.get(&header.topic).map(|entry| entry.value().clone())
    }

    /// Drop reply handlers older than `ttl`, returning their ids.
    pub(crate) fn expire(&self, ttl: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut expired = Vec::new();
        self.replies.retain(|id, pending| {
            let alive = now.duration_since(pending.registered) < ttl;
            if !alive {
                expired.push(id.clone());
            }
            alive
        });
        expired
    }

    pub(crate) fn clear_messages(&self) {
        self.messages.clear();
    }

    pub(crate) fn clear_replies(&self) -> usize {
        let count = self.replies.len();
        self.replies.clear();
        count
    }

    pub(crate) fn pending_replies(&self) -> usize {
        self.replies.len()
    }
}
