//! Server-side connection setup.
//!
//! A [`Server`] turns upgraded sockets into accepted connections. It does
//! not own a listener: [`Server::router`] plugs into an axum application,
//! and [`Server::attach`] accepts sockets from any other source.

use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use parking_lot::RwLock;
use relay_protocol::{Encoder, MsgPackEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::connection::{Connection, ConnectionConfig};
use crate::traits::{ConnectionMeta, SocketSink, SocketStream};
use crate::websocket::from_axum;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The request could not be upgraded to a WebSocket.
    #[error("WebSocket upgrade failed: {0}")]
    Upgrade(String),
}

type ConnectCallback<E> = Arc<dyn Fn(&Connection<E>) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&ServerError) + Send + Sync>;

struct ServerInner<E: Encoder> {
    config: ConnectionConfig,
    encoder: E,
    on_connection: RwLock<Vec<ConnectCallback<E>>>,
    on_error: RwLock<Vec<ErrorCallback>>,
}

/// Accepts connections and hands them to the application.
pub struct Server<E: Encoder = MsgPackEncoder> {
    inner: Arc<ServerInner<E>>,
}

impl<E: Encoder> Clone for Server<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Server {
    /// Create a server using the MessagePack encoder.
    #[must_use]
    pub fn new(config: ConnectionConfig) -> Self {
        Self::with_encoder(config, MsgPackEncoder::new())
    }
}

impl<E: Encoder> Server<E> {
    /// Create a server whose connections use `encoder`.
    #[must_use]
    pub fn with_encoder(config: ConnectionConfig, encoder: E) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                config,
                encoder,
                on_connection: RwLock::new(Vec::new()),
                on_error: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Register a new-connection callback.
    ///
    /// Callbacks run in registration order before the connection's read
    /// loop starts, so handlers registered here see every frame.
    pub fn on_connection(&self, callback: impl Fn(&Connection<E>) + Send + Sync + 'static) {
        self.inner.on_connection.write().push(Arc::new(callback));
    }

    /// Register a callback for failed upgrades.
    pub fn on_error(&self, callback: impl Fn(&ServerError) + Send + Sync + 'static) {
        self.inner.on_error.write().push(Arc::new(callback));
    }

    /// Accept a socket: wrap it, run the new-connection callbacks, start it.
    pub fn attach(&self, sink: SocketSink, stream: SocketStream, meta: ConnectionMeta) -> Connection<E> {
        let conn = Connection::with_encoder(
            sink,
            stream,
            meta,
            self.inner.config.clone(),
            self.inner.encoder.clone(),
        );
        debug!(connection = %conn.id(), remote = ?conn.meta().remote_addr, "New connection");

        let callbacks = self.inner.on_connection.read().clone();
        for callback in callbacks {
            callback(&conn);
        }
        conn.accept();
        conn
    }

    /// An axum router serving WebSocket upgrades on `path`.
    ///
    /// Serve it with `into_make_service_with_connect_info::<SocketAddr>()`
    /// to record peer addresses.
    pub fn router<S>(&self, path: &str) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        Router::new()
            .route(path, get(upgrade::<E>))
            .with_state(self.clone())
    }

    fn report(&self, err: &ServerError) {
        let callbacks = self.inner.on_error.read().clone();
        if callbacks.is_empty() {
            warn!(error = %err, "Unhandled server error");
            return;
        }
        for callback in callbacks {
            callback(err);
        }
    }
}

async fn upgrade<E: Encoder>(
    State(server): State<Server<E>>,
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            server.report(&ServerError::Upgrade(rejection.body_text()));
            return rejection.into_response();
        }
    };

    let mut meta = ConnectionMeta::new(headers);
    if let Some(ConnectInfo(addr)) = peer {
        meta = meta.with_remote_addr(addr);
    }

    let failed = server.clone();
    ws.max_message_size(server.inner.config.max_message_size)
        .on_failed_upgrade(move |e: axum::Error| failed.report(&ServerError::Upgrade(e.to_string())))
        .on_upgrade(move |socket| async move {
            let (sink, stream) = from_axum(socket);
            server.attach(sink, stream, meta);
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Handler;
    use crate::memory;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_attach_runs_callbacks_in_order() {
        let server = Server::new(ConnectionConfig::default());
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        for n in 0..3 {
            let order = Arc::clone(&order);
            server.on_connection(move |_| order.lock().push(n));
        }

        let ((sink, stream), _peer) = memory::pair();
        server.attach(sink, stream, ConnectionMeta::default());
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_handlers_from_callback_see_first_frame() {
        let server = Server::new(ConnectionConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        server.on_connection(move |conn| {
            let tx = tx.clone();
            conn.set_message_handler(Handler::oneway("hello", String::new, move |text, _| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(text);
                }
            }))
            .unwrap();
        });

        let ((sink, stream), (peer_sink, peer_stream)) = memory::pair();
        let peer = Connection::open(peer_sink, peer_stream, ConnectionMeta::default(), ConnectionConfig::default());
        peer.accept();
        // Sent before the server side exists.
        peer.write("hello", "early").await.unwrap();

        server.attach(sink, stream, ConnectionMeta::default());
        assert_eq!(rx.recv().await.unwrap(), "early");
    }

    #[test]
    fn test_error_callbacks() {
        let server = Server::new(ConnectionConfig::default());
        let errors = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&errors);
        server.on_error(move |e| {
            assert!(matches!(e, ServerError::Upgrade(_)));
            seen.fetch_add(1, Ordering::SeqCst);
        });

        server.report(&ServerError::Upgrade("bad handshake".into()));
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }
}
