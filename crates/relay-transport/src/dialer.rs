//! Client-side connection setup.

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use relay_protocol::{Encoder, MsgPackEncoder};
use std::time::Duration;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::MaybeTlsStream;
use tracing::{debug, info};

use crate::connection::{Connection, ConnectionConfig, ConnectionError};
use crate::handler::Handler;
use crate::traits::{ConnectionMeta, TransportError};
use crate::websocket::from_tungstenite;

/// Handshake timeout for outbound connections.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Builder for outbound connections.
///
/// ```rust,ignore
/// let conn = Dialer::new("ws://127.0.0.1:9001/ws")
///     .header(HeaderName::from_static("x-user"), HeaderValue::from_static("alice"))
///     .handler(Handler::oneway("notice", String::new, |text, _| async move {
///         println!("{text}");
///     }))
///     .dial()
///     .await?;
/// ```
pub struct Dialer<E: Encoder = MsgPackEncoder> {
    url: String,
    headers: HeaderMap,
    handlers: Vec<Handler<E>>,
    config: ConnectionConfig,
    encoder: E,
}

impl Dialer {
    /// Dial `url` with the MessagePack encoder.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_encoder(url, MsgPackEncoder::new())
    }
}

impl<E: Encoder> Dialer<E> {
    /// Dial `url` with a specific encoder.
    #[must_use]
    pub fn with_encoder(url: impl Into<String>, encoder: E) -> Self {
        Self {
            url: url.into(),
            headers: HeaderMap::new(),
            handlers: Vec::new(),
            config: ConnectionConfig::default(),
            encoder,
        }
    }

    /// Add a request header.
    #[must_use]
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Register a message handler before the read loop starts.
    #[must_use]
    pub fn handler(mut self, handler: Handler<E>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Settings for the dialed connection.
    #[must_use]
    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Connect, register handlers and start the connection.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the handshake fails or times out, or
    /// the registration error of the first invalid handler.
    pub async fn dial(self) -> Result<Connection<E>, ConnectionError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        request.headers_mut().extend(self.headers.clone());

        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(self.config.max_message_size);

        debug!(url = %self.url, "Dialing");
        let (socket, _response) = timeout(
            HANDSHAKE_TIMEOUT,
            tokio_tungstenite::connect_async_with_config(request, Some(ws_config), false),
        )
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(|e| TransportError::Handshake(e.to_string()))?;

        let mut meta = ConnectionMeta::new(self.headers);
        if let MaybeTlsStream::Plain(tcp) = socket.get_ref() {
            if let Ok(addr) = tcp.peer_addr() {
                meta = meta.with_remote_addr(addr);
            }
        }

        let (sink, stream) = from_tungstenite(socket);
        let conn = Connection::with_encoder(sink, stream, meta, self.config, self.encoder);
        if let Err(e) = conn.set_message_handlers(self.handlers) {
            conn.close().await;
            return Err(e);
        }
        conn.accept();

        info!(connection = %conn.id(), url = %self.url, "Connected");
        Ok(conn)
    }
}
