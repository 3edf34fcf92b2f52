//! Sessions: connections admitted into a hub.

use parking_lot::{Mutex, RwLock};
use relay_protocol::{Encoder, MsgPackEncoder};
use serde::Serialize;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use tenvis_relay_transport::Connection;
use tracing::debug;

use crate::hub::{HubError, RoomHub};
use crate::room::{validate_room_name, RoomId};

type Attribute = Box<dyn Any + Send + Sync>;

struct SessionInner<E: Encoder> {
    id: String,
    connection: Connection<E>,
    hub: RoomHub<E>,
    rooms: Mutex<HashSet<RoomId>>,
    attributes: RwLock<HashMap<String, Attribute>>,
}

/// A connection with an identity, room memberships and attributes.
///
/// Dereferences to its [`Connection`]. Cheap to clone.
pub struct Session<E: Encoder = MsgPackEncoder> {
    inner: Arc<SessionInner<E>>,
}

impl<E: Encoder> Clone for Session<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: Encoder> Deref for Session<E> {
    type Target = Connection<E>;

    fn deref(&self) -> &Self::Target {
        &self.inner.connection
    }
}

impl<E: Encoder> fmt::Debug for Session<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("connection", self.inner.connection.id())
            .field("rooms", &*self.inner.rooms.lock())
            .finish()
    }
}

impl<E: Encoder> Session<E> {
    pub(crate) fn new(connection: Connection<E>, hub: RoomHub<E>) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id: uuid::Uuid::new_v4().to_string(),
                connection,
                hub,
                rooms: Mutex::new(HashSet::new()),
                attributes: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Session ID (UUID v4).
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// The underlying connection.
    #[must_use]
    pub fn connection(&self) -> &Connection<E> {
        &self.inner.connection
    }

    /// The hub this session belongs to.
    #[must_use]
    pub fn hub(&self) -> &RoomHub<E> {
        &self.inner.hub
    }

    /// Store an attribute, replacing any previous value under `key`.
    pub fn set<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.inner.attributes.write().insert(key.into(), Box::new(value));
    }

    /// Read an attribute. Returns `None` if it is missing or of another type.
    #[must_use]
    pub fn get<T: Any + Clone>(&self, key: &str) -> Option<T> {
        self.inner
            .attributes
            .read()
            .get(key)
            .and_then(|value| value.downcast_ref::<T>())
            .cloned()
    }

    /// Remove an attribute.
    pub fn remove(&self, key: &str) -> bool {
        self.inner.attributes.write().remove(key).is_some()
    }

    /// Rooms this session is a member of.
    #[must_use]
    pub fn rooms(&self) -> Vec<RoomId> {
        self.inner.rooms.lock().iter().cloned().collect()
    }

    /// Whether this session is a member of `room`.
    #[must_use]
    pub fn in_room(&self, room: &str) -> bool {
        self.inner.rooms.lock().contains(room)
    }

    /// Join a room, creating it if needed.
    ///
    /// Returns `false` if the session was already a member.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::InvalidRoom`] for an invalid name and
    /// [`HubError::Closed`] if the connection is closed.
    pub fn join(&self, room: &str) -> Result<bool, HubError> {
        validate_room_name(room).map_err(HubError::InvalidRoom)?;
        if self.is_closed() {
            return Err(HubError::Closed);
        }

        // The room set lock is held across the hub update so concurrent
        // joins and leaves apply to both in the same order.
        let joined = {
            let mut rooms = self.inner.rooms.lock();
            let joined = self.inner.hub.insert(room, self);
            rooms.insert(room.to_string());
            joined
        };
        if joined {
            debug!(session = %self.inner.id, room = %room, "Joined room");
        }

        // Teardown may have run leave_all between the check and the insert.
        if self.is_closed() {
            self.leave(room);
            return Err(HubError::Closed);
        }
        Ok(joined)
    }

    /// Leave a room. Returns `false` if the session was not a member.
    pub fn leave(&self, room: &str) -> bool {
        let left = {
            let mut rooms = self.inner.rooms.lock();
            rooms.remove(room);
            self.inner.hub.remove(room, &self.inner.id)
        };
        if left {
            debug!(session = %self.inner.id, room = %room, "Left room");
        }
        left
    }

    /// Leave every room.
    pub fn leave_all(&self) {
        let mut rooms = self.inner.rooms.lock();
        for room in rooms.drain() {
            self.inner.hub.remove(&room, &self.inner.id);
        }
        drop(rooms);
        debug!(session = %self.inner.id, "Left all rooms");
    }

    /// Send `payload` on `topic` to every other member of `room`, here and
    /// on every hub reachable through the adapters.
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
        self.inner
            .hub
            .broadcast_from(&self.inner.id, room, topic, payload)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tenvis_relay_transport::{memory, ConnectionConfig, ConnectionMeta};

    fn session() -> (Session, Connection) {
        let ((sink, stream), (peer_sink, peer_stream)) = memory::pair();
        let conn = Connection::open(sink, stream, ConnectionMeta::default(), ConnectionConfig::default());
        let peer = Connection::open(peer_sink, peer_stream, ConnectionMeta::default(), ConnectionConfig::default());
        (RoomHub::new().admit(conn), peer)
    }

    #[derive(Debug, Clone, PartialEq)]
    struct User {
        name: String,
    }

    #[tokio::test]
    async fn test_attributes() {
        let (session, _peer) = session();

        session.set("user", User { name: "alice".into() });
        session.set("visits", 3u32);

        assert_eq!(session.get::<User>("user").unwrap().name, "alice");
        assert_eq!(session.get::<u32>("visits"), Some(3));
        assert_eq!(session.get::<String>("visits"), None);
        assert_eq!(session.get::<u32>("missing"), None);

        assert!(session.remove("visits"));
        assert!(!session.remove("visits"));
        assert_eq!(session.get::<u32>("visits"), None);
    }

    #[tokio::test]
    async fn test_join_is_idempotent() {
        let (session, _peer) = session();

        assert!(session.join("lobby").unwrap());
        assert!(!session.join("lobby").unwrap());
        assert!(session.in_room("lobby"));
        assert_eq!(session.rooms(), vec!["lobby".to_string()]);
        assert_eq!(session.hub().member_count("lobby"), 1);

        assert!(session.leave("lobby"));
        assert!(!session.leave("lobby"));
        assert!(!session.hub().contains_room("lobby"));
    }

    #[tokio::test]
    async fn test_join_rejects_bad_names() {
        let (session, _peer) = session();

        assert!(matches!(session.join(""), Err(HubError::InvalidRoom(_))));
        assert!(matches!(session.join("$internal"), Err(HubError::InvalidRoom(_))));
        assert!(session.rooms().is_empty());
        assert_eq!(session.hub().room_count(), 0);
    }

    #[tokio::test]
    async fn test_join_after_close() {
        let (session, _peer) = session();
        session.close().await;

        assert!(matches!(session.join("lobby"), Err(HubError::Closed)));
        assert_eq!(session.hub().room_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_join_leave_stays_consistent() {
        let (session, _peer) = session();

        for _ in 0..2_000 {
            let joiner = {
                let session = session.clone();
                tokio::spawn(async move { session.join("lobby").unwrap() })
            };
            let leaver = {
                let session = session.clone();
                tokio::spawn(async move { session.leave("lobby") })
            };
            joiner.await.unwrap();
            leaver.await.unwrap();

            let in_hub = session.hub().member_count("lobby") == 1;
            assert_eq!(session.in_room("lobby"), in_hub);
        }
    }

    #[tokio::test]
    async fn test_session_ids_are_unique() {
        let (a, _pa) = session();
        let (b, _pb) = session();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id().len(), 36);
    }
}
