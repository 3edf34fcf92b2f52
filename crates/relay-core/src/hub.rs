//! Room hub.
//!
//! The hub maps room names to their member sessions. Rooms are created by
//! the first join and removed with their last member. Broadcasts are
//! encoded once and spliced into every recipient's frame.

use dashmap::DashMap;
use futures_util::future::join_all;
use relay_protocol::{Encoder, MsgPackEncoder, ProtocolError};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tenvis_relay_transport::Connection;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::adapter::{Adapter, Broadcast};
use crate::room::RoomId;
use crate::session::Session;

/// Hub errors.
#[derive(Debug, Error)]
pub enum HubError {
    /// Invalid room name.
    #[error("Invalid room name: {0}")]
    InvalidRoom(&'static str),

    /// The payload could not be encoded.
    #[error("Encoding error: {0}")]
    Encode(#[from] ProtocolError),

    /// The session's connection is closed.
    #[error("Connection closed")]
    Closed,
}

struct HubInner<E: Encoder> {
    rooms: DashMap<RoomId, HashMap<String, Session<E>>>,
    adapters: Vec<Arc<dyn Adapter>>,
    encoder: E,
}

/// Registry of rooms and their members.
pub struct RoomHub<E: Encoder = MsgPackEncoder> {
    inner: Arc<HubInner<E>>,
}

impl<E: Encoder> Clone for RoomHub<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl RoomHub {
    /// Create a standalone hub using the MessagePack encoder.
    #[must_use]
    pub fn new() -> Self {
        Self::with_adapters(MsgPackEncoder::new(), Vec::new())
    }
}

impl Default for RoomHub {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Encoder> RoomHub<E> {
    /// Create a hub bridged to other hubs through `adapters`.
    ///
    /// The encoder must match the one used by admitted connections.
    /// Adapters may spawn receive tasks, so call this inside a tokio
    /// runtime when `adapters` is not empty.
    #[must_use]
    pub fn with_adapters(encoder: E, adapters: Vec<Arc<dyn Adapter>>) -> Self {
        let inner = Arc::new(HubInner {
            rooms: DashMap::new(),
            adapters,
            encoder,
        });

        for adapter in &inner.adapters {
            let hub = Arc::downgrade(&inner);
            adapter.on_broadcast(Arc::new(move |broadcast| inbound(&hub, broadcast)));
        }

        info!(adapters = inner.adapters.len(), "Room hub created");
        Self { inner }
    }

    /// Turn a connection into a session of this hub.
    ///
    /// The session leaves all its rooms when the connection closes.
    pub fn admit(&self, connection: Connection<E>) -> Session<E> {
        let session = Session::new(connection, self.clone());
        let closing = session.clone();
        session.on_close(move |_| closing.leave_all());

        debug!(session = %session.id(), connection = %session.connection().id(), "Session admitted");
        session
    }

    /// Broadcast to every member of `room`.
    ///
    /// Returns the number of local recipients written to.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Encode`] if the payload cannot be encoded.
    pub async fn broadcast<T>(&self, room: &str, topic: &str, payload: &T) -> Result<usize, HubError>
    where
        T: Serialize + Sync + ?Sized,
    {
        self.broadcast_from("", room, topic, payload).await
    }

    pub(crate) async fn broadcast_from<T>(
        &self,
        origin: &str,
        room: &str,
        topic: &str,
        payload: &T,
    ) -> Result<usize, HubError>
    where
        T: Serialize + Sync + ?Sized,
    {
        let broadcast = Broadcast {
            origin: origin.to_string(),
            room: room.to_string(),
            topic: topic.to_string(),
            payload: self.inner.encoder.encode(payload)?,
        };

        for adapter in &self.inner.adapters {
            if let Err(e) = adapter.publish(&broadcast).await {
                warn!(room = %room, error = %e, "Adapter publish failed");
            }
        }

        Ok(self.inner.fanout(&broadcast).await)
    }

    pub(crate) fn insert(&self, room: &str, session: &Session<E>) -> bool {
        self.inner
            .rooms
            .entry(room.to_string())
            .or_default()
            .insert(session.id().to_string(), session.clone())
            .is_none()
    }

    pub(crate) fn remove(&self, room: &str, session_id: &str) -> bool {
        let mut removed = false;
        let deleted = self
            .inner
            .rooms
            .remove_if_mut(room, |_, members| {
                removed = members.remove(session_id).is_some();
                members.is_empty()
            })
            .is_some();

        if deleted {
            debug!(room = %room, "Deleted empty room");
        }
        removed
    }

    /// Number of rooms with at least one member.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.inner.rooms.len()
    }

    /// Number of members of `room`.
    #[must_use]
    pub fn member_count(&self, room: &str) -> usize {
        self.inner.rooms.get(room).map(|members| members.len()).unwrap_or(0)
    }

    /// Whether `room` currently exists.
    #[must_use]
    pub fn contains_room(&self, room: &str) -> bool {
        self.inner.rooms.contains_key(room)
    }

    /// All room names.
    #[must_use]
    pub fn rooms(&self) -> Vec<RoomId> {
        self.inner.rooms.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Hub statistics.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        HubStats {
            room_count: self.inner.rooms.len(),
            membership_count: self.inner.rooms.iter().map(|entry| entry.len()).sum(),
        }
    }
}

impl<E: Encoder> HubInner<E> {
    async fn fanout(&self, broadcast: &Broadcast) -> usize {
        let recipients: Vec<Session<E>> = match self.rooms.get(&broadcast.room) {
            Some(members) => members
                .iter()
                .filter(|(id, _)| id.as_str() != broadcast.origin)
                .map(|(_, session)| session.clone())
                .collect(),
            None => return 0,
        };

        let writes = recipients.iter().map(|session| async move {
            match session.write_encoded(&broadcast.topic, &broadcast.payload).await {
                Ok(()) => true,
                Err(e) => {
                    debug!(session = %session.id(), room = %broadcast.room, error = %e, "Broadcast write failed");
                    false
                }
            }
        });
        let delivered = join_all(writes).await.into_iter().filter(|ok| *ok).count();

        trace!(room = %broadcast.room, topic = %broadcast.topic, recipients = delivered, "Broadcast");
        delivered
    }
}

/// Fan out a broadcast from another hub. Returns `false` once this hub
/// has been dropped.
fn inbound<E: Encoder>(hub: &Weak<HubInner<E>>, broadcast: Broadcast) -> bool {
    let Some(hub) = hub.upgrade() else {
        return false;
    };
    tokio::spawn(async move {
        hub.fanout(&broadcast).await;
    });
    true
}

/// Hub statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubStats {
    /// Number of rooms.
    pub room_count: usize,
    /// Sum of members over all rooms.
    pub membership_count: usize,
}
