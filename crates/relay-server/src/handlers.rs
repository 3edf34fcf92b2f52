//! Room chat handlers for the relay server.
//!
//! Every accepted connection is admitted into a shared [`RoomHub`] and
//! gets the handlers below. Clients request on these topics and receive
//! room traffic on [`topics::MESSAGE`].

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{extract::State, response::IntoResponse, routing::get, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Display;
use std::net::SocketAddr;
use tenvis_relay_core::{RoomHub, Session};
use tenvis_relay_transport::{Connection, Handler, Server};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Topic names.
pub mod topics {
    pub const JOIN: &str = "room:join";
    pub const LEAVE: &str = "room:leave";
    pub const BROADCAST: &str = "room:broadcast";
    pub const MESSAGE: &str = "room:message";
    pub const NAME: &str = "user:name";
    pub const ECHO: &str = "echo";
}

/// Session attribute holding the display name.
const NAME_KEY: &str = "name";

const MAX_NAME_LENGTH: usize = 64;

/// Join or leave request.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct RoomRequest {
    pub room: String,
}

/// Message for every other member of a room.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct BroadcastRequest {
    pub room: String,
    pub message: Value,
}

/// Display name change.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct NameRequest {
    pub name: String,
}

/// Answer to a room request.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomReply {
    pub room: String,
    pub ok: bool,
    /// Room size after a join or leave; recipients for a broadcast.
    pub count: usize,
    pub error: Option<String>,
}

impl RoomReply {
    fn ok(room: &str, count: usize) -> Self {
        Self {
            room: room.to_string(),
            ok: true,
            count,
            error: None,
        }
    }

    fn failed(room: &str, error: impl Display) -> Self {
        Self {
            room: room.to_string(),
            ok: false,
            count: 0,
            error: Some(error.to_string()),
        }
    }
}

/// A room message as delivered to members.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomMessage {
    pub room: String,
    /// Sender session id.
    pub from: String,
    pub name: Option<String>,
    pub message: Value,
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let app = build_app(&config, RoomHub::new());
    let listener = TcpListener::bind(addr).await?;

    info!("Relay server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;

    Ok(())
}

/// Build the HTTP router: WebSocket endpoint, health and room stats.
pub fn build_app(config: &Config, hub: RoomHub) -> Router {
    build_server(config, &hub)
        .router::<RoomHub>(&config.transport.websocket_path)
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .with_state(hub)
}

/// Build a connection server that admits every connection into `hub`.
pub fn build_server(config: &Config, hub: &RoomHub) -> Server {
    let server = Server::new(config.connection_config());

    let hub = hub.clone();
    server.on_connection(move |conn| start_session(&hub, conn.clone()));
    server.on_error(|e| {
        warn!(error = %e, "WebSocket upgrade failed");
        metrics::record_error("upgrade");
    });

    server
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn stats_handler(State(hub): State<RoomHub>) -> impl IntoResponse {
    let stats = hub.stats();
    axum::Json(serde_json::json!({
        "rooms": stats.room_count,
        "memberships": stats.membership_count,
    }))
}

fn start_session(hub: &RoomHub, connection: Connection) {
    let guard = ConnectionMetricsGuard::new();
    let session = hub.admit(connection);

    info!(
        session = %session.id(),
        connection = %session.connection().id(),
        remote = ?session.meta().remote_addr,
        "Session started"
    );

    session.on_error(|e| {
        debug!(error = %e, "Connection error");
        metrics::record_error("connection");
    });
    session.on_fatal(|fatal| {
        error!(
            topic = %fatal.topic,
            id = %fatal.correlation_id,
            panic = %fatal.message,
            "Handler panicked"
        );
        metrics::record_error("panic");
    });

    {
        let hub = hub.clone();
        let conn = session.connection().clone();
        let id = session.id().to_string();
        session.on_close(move |reason| {
            metrics::record_bytes(conn.bytes_sent(), conn.bytes_received());
            metrics::set_active_rooms(hub.room_count());
            match reason {
                Some(e) => info!(session = %id, error = %e, "Session ended"),
                None => info!(session = %id, "Session ended"),
            }
            drop(guard);
        });
    }

    if let Err(e) = session.set_message_handlers(session_handlers(&session)) {
        error!(session = %session.id(), error = %e, "Failed to register handlers");
        metrics::record_error("handler");
    }
}

fn session_handlers(session: &Session) -> Vec<Handler> {
    let join = {
        let session = session.clone();
        Handler::message(topics::JOIN, RoomRequest::default, move |req: RoomRequest, _ctx| {
            let session = session.clone();
            async move {
                metrics::record_message(topics::JOIN);
                Some(join_room(&session, &req.room))
            }
        })
    };

    let leave = {
        let session = session.clone();
        Handler::message(topics::LEAVE, RoomRequest::default, move |req: RoomRequest, _ctx| {
            let session = session.clone();
            async move {
                metrics::record_message(topics::LEAVE);
                Some(leave_room(&session, &req.room))
            }
        })
    };

    let broadcast = {
        let session = session.clone();
        Handler::message(
            topics::BROADCAST,
            BroadcastRequest::default,
            move |req: BroadcastRequest, _ctx| {
                let session = session.clone();
                async move {
                    metrics::record_message(topics::BROADCAST);
                    Some(broadcast_to_room(&session, req).await)
                }
            },
        )
    };

    let name = {
        let session = session.clone();
        Handler::message(topics::NAME, NameRequest::default, move |req: NameRequest, _ctx| {
            let session = session.clone();
            async move {
                metrics::record_message(topics::NAME);
                let name = req.name.trim();
                if name.is_empty() || name.len() > MAX_NAME_LENGTH {
                    return Some(false);
                }
                session.set(NAME_KEY, name.to_string());
                Some(true)
            }
        })
    };

    let echo = Handler::message(topics::ECHO, || Value::Null, |value: Value, _ctx| async move {
        metrics::record_message(topics::ECHO);
        Some(value)
    });

    vec![join, leave, broadcast, name, echo]
}

fn join_room(session: &Session, room: &str) -> RoomReply {
    match session.join(room) {
        Ok(_) => {
            metrics::set_active_rooms(session.hub().room_count());
            RoomReply::ok(room, session.hub().member_count(room))
        }
        Err(e) => RoomReply::failed(room, e),
    }
}

fn leave_room(session: &Session, room: &str) -> RoomReply {
    if !session.leave(room) {
        return RoomReply::failed(room, "Not a member");
    }
    metrics::set_active_rooms(session.hub().room_count());
    RoomReply::ok(room, session.hub().member_count(room))
}

async fn broadcast_to_room(session: &Session, req: BroadcastRequest) -> RoomReply {
    if !session.in_room(&req.room) {
        return RoomReply::failed(&req.room, "Not a member");
    }

    let message = RoomMessage {
        room: req.room.clone(),
        from: session.id().to_string(),
        name: session.get::<String>(NAME_KEY),
        message: req.message,
    };

    match session.broadcast(&req.room, topics::MESSAGE, &message).await {
        Ok(delivered) => {
            metrics::record_broadcast();
            debug!(session = %session.id(), room = %req.room, delivered, "Broadcast");
            RoomReply::ok(&req.room, delivered)
        }
        Err(e) => RoomReply::failed(&req.room, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::de::DeserializeOwned;
    use std::time::Duration;
    use tenvis_relay_transport::{memory, ConnectionConfig, ConnectionMeta};
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn client(server: &Server) -> Connection {
        let ((sink, stream), (peer_sink, peer_stream)) = memory::pair();
        server.attach(peer_sink, peer_stream, ConnectionMeta::default());
        let conn = Connection::open(sink, stream, ConnectionMeta::default(), ConnectionConfig::default());
        conn.accept();
        conn
    }

    async fn request<T, R>(conn: &Connection, topic: &str, data: &T, factory: fn() -> R) -> R
    where
        T: Serialize + Sync,
        R: DeserializeOwned + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let reply: Handler = Handler::reply(factory, move |value: R, _| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(value);
            }
        });
        conn.request(topic, data, reply).await.unwrap();
        timeout(WAIT, rx.recv()).await.unwrap().unwrap()
    }

    fn room(name: &str) -> RoomRequest {
        RoomRequest { room: name.into() }
    }

    #[tokio::test]
    async fn test_join_and_leave() {
        let hub = RoomHub::new();
        let server = build_server(&Config::default(), &hub);
        let alice = client(&server);
        let bob = client(&server);

        let reply = request(&alice, topics::JOIN, &room("lobby"), RoomReply::default).await;
        assert_eq!(reply, RoomReply::ok("lobby", 1));
        let reply = request(&bob, topics::JOIN, &room("lobby"), RoomReply::default).await;
        assert_eq!(reply, RoomReply::ok("lobby", 2));

        let reply = request(&alice, topics::LEAVE, &room("lobby"), RoomReply::default).await;
        assert_eq!(reply, RoomReply::ok("lobby", 1));
        let reply = request(&alice, topics::LEAVE, &room("lobby"), RoomReply::default).await;
        assert!(!reply.ok);

        assert_eq!(hub.member_count("lobby"), 1);
    }

    #[tokio::test]
    async fn test_join_invalid_room() {
        let hub = RoomHub::new();
        let server = build_server(&Config::default(), &hub);
        let alice = client(&server);

        let reply = request(&alice, topics::JOIN, &room("$system"), RoomReply::default).await;
        assert!(!reply.ok);
        assert!(reply.error.is_some());
        assert_eq!(hub.room_count(), 0);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_other_members() {
        let hub = RoomHub::new();
        let server = build_server(&Config::default(), &hub);
        let alice = client(&server);
        let bob = client(&server);

        let (tx, mut rx) = mpsc::unbounded_channel();
        bob.set_message_handler(Handler::oneway(
            topics::MESSAGE,
            RoomMessage::default,
            move |msg: RoomMessage, _| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(msg);
                }
            },
        ))
        .unwrap();

        request(&alice, topics::JOIN, &room("lobby"), RoomReply::default).await;
        request(&bob, topics::JOIN, &room("lobby"), RoomReply::default).await;
        let named = request(
            &alice,
            topics::NAME,
            &NameRequest { name: " alice ".into() },
            bool::default,
        )
        .await;
        assert!(named);

        let req = BroadcastRequest {
            room: "lobby".into(),
            message: serde_json::json!({"text": "hi"}),
        };
        let reply = request(&alice, topics::BROADCAST, &req, RoomReply::default).await;
        assert_eq!(reply, RoomReply::ok("lobby", 1));

        let msg = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(msg.room, "lobby");
        assert_eq!(msg.name.as_deref(), Some("alice"));
        assert_eq!(msg.message, serde_json::json!({"text": "hi"}));
        assert_eq!(msg.from.len(), 36);
    }

    #[tokio::test]
    async fn test_broadcast_requires_membership() {
        let hub = RoomHub::new();
        let server = build_server(&Config::default(), &hub);
        let alice = client(&server);

        let req = BroadcastRequest {
            room: "lobby".into(),
            message: Value::Null,
        };
        let reply = request(&alice, topics::BROADCAST, &req, RoomReply::default).await;
        assert!(!reply.ok);
    }

    #[tokio::test]
    async fn test_echo() {
        let server = build_server(&Config::default(), &RoomHub::new());
        let alice = client(&server);

        let value = serde_json::json!({"n": 1, "tags": ["a", "b"]});
        let echoed = request(&alice, topics::ECHO, &value, || Value::Null).await;
        assert_eq!(echoed, value);
    }

    #[tokio::test]
    async fn test_disconnect_leaves_rooms() {
        let hub = RoomHub::new();
        let server = build_server(&Config::default(), &hub);
        let alice = client(&server);

        request(&alice, topics::JOIN, &room("lobby"), RoomReply::default).await;
        assert_eq!(hub.member_count("lobby"), 1);

        alice.close().await;
        timeout(WAIT, async {
            while hub.contains_room("lobby") {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }
}
