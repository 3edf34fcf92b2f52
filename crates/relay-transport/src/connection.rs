//! Multiplexed connections.
//!
//! A [`Connection`] carries many logical messages over one socket. Every
//! frame is a `(correlation id, topic, payload)` triple; inbound frames
//! are routed to a pending reply handler by id, or to a message handler
//! by topic, and each dispatch runs on its own task.
//!
//! Two background tasks run per connection once [`Connection::accept`]
//! is called: the read loop, which owns the inbound half and drives
//! teardown, and the keepalive task, which pings the peer and expires
//! unanswered reply handlers.

use bytes::Bytes;
use futures_util::{FutureExt, SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use relay_protocol::{frames, Encoder, Header, MsgPackEncoder, ProtocolError, MAX_FRAME_SIZE};
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, trace, warn};

use crate::counters::IoCounters;
use crate::handler::{Context, Dispatch, Handler};
use crate::registry::HandlerRegistry;
use crate::traits::{
    generate_correlation_id, ConnectionId, ConnectionMeta, RawFrame, SocketSink, SocketStream,
    TransportError,
};

/// Keepalive settings.
#[derive(Debug, Clone)]
pub struct KeepaliveConfig {
    /// Idle time before a ping is sent.
    pub ping_interval: Duration,
    /// How long to wait for any frame after a ping.
    pub pong_timeout: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(10),
            pong_timeout: Duration::from_secs(4),
        }
    }
}

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Keepalive settings.
    pub keepalive: KeepaliveConfig,
    /// Lifetime of an unanswered reply handler. `None` keeps them until close.
    pub reply_timeout: Option<Duration>,
    /// Largest inbound data frame accepted.
    pub max_message_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            keepalive: KeepaliveConfig::default(),
            reply_timeout: Some(Duration::from_secs(30)),
            max_message_size: MAX_FRAME_SIZE,
        }
    }
}

/// Connection errors.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// A handler was used in the wrong role.
    #[error("Invalid handler: {0}")]
    InvalidHandler(String),

    /// A handler's model factory cannot produce a decode target.
    #[error("Invalid model for topic '{0}'")]
    InvalidModel(String),

    /// No reply or message handler matched an inbound frame.
    #[error("No handler for topic '{topic}' (id {id})")]
    Unroutable {
        /// Correlation id of the frame.
        id: String,
        /// Topic of the frame.
        topic: String,
    },

    /// A reply handler was never answered.
    #[error("Reply {0} expired")]
    ReplyExpired(String),

    /// The connection is closed.
    #[error("Connection closed")]
    Closed,

    /// Encoding or decoding failed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The socket failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// A handler panic.
#[derive(Debug, Clone)]
pub struct Fatal {
    /// Topic of the frame being served.
    pub topic: String,
    /// Correlation id of the frame being served.
    pub correlation_id: String,
    /// The raw frame.
    pub frame: Bytes,
    /// Panic payload, if it was a string.
    pub message: String,
}

type CloseCallback = Box<dyn FnOnce(Option<&ConnectionError>) + Send>;
type ErrorCallback = Arc<dyn Fn(&ConnectionError) + Send + Sync>;
type FatalCallback = Arc<dyn Fn(&Fatal) + Send + Sync>;

struct Writer<E> {
    sink: Option<SocketSink>,
    encoder: E,
}

struct Inner<E: Encoder> {
    id: ConnectionId,
    meta: ConnectionMeta,
    config: ConnectionConfig,
    counters: IoCounters,
    writer: tokio::sync::Mutex<Writer<E>>,
    pending: Mutex<Option<(SocketStream, E)>>,
    registry: HandlerRegistry<E>,
    on_close: Mutex<Vec<CloseCallback>>,
    on_error: RwLock<Vec<ErrorCallback>>,
    on_fatal: RwLock<Option<FatalCallback>>,
    deadline: watch::Sender<Option<Instant>>,
    activity: Notify,
    shutdown: watch::Sender<bool>,
    closing: AtomicBool,
    closed: AtomicBool,
}

/// A multiplexed connection.
///
/// Cheap to clone; all clones share the same socket.
pub struct Connection<E: Encoder = MsgPackEncoder> {
    inner: Arc<Inner<E>>,
}

impl<E: Encoder> Clone for Connection<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: Encoder> fmt::Debug for Connection<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("remote_addr", &self.inner.meta.remote_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    /// Wrap a socket using the MessagePack encoder.
    ///
    /// Handlers may be registered immediately; nothing is read from the
    /// socket until [`accept`](Self::accept) is called.
    #[must_use]
    pub fn open(sink: SocketSink, stream: SocketStream, meta: ConnectionMeta, config: ConnectionConfig) -> Self {
        Self::with_encoder(sink, stream, meta, config, MsgPackEncoder::new())
    }
}

impl<E: Encoder> Connection<E> {
    /// Wrap a socket using `encoder` for every frame in both directions.
    #[must_use]
    pub fn with_encoder(
        sink: SocketSink,
        stream: SocketStream,
        meta: ConnectionMeta,
        config: ConnectionConfig,
        encoder: E,
    ) -> Self {
        let reader = encoder.clone();
        let (deadline, _) = watch::channel(None);
        let (shutdown, _) = watch::channel(false);

        let inner = Inner {
            id: ConnectionId::generate(),
            meta,
            config,
            counters: IoCounters::new(),
            writer: tokio::sync::Mutex::new(Writer {
                sink: Some(sink),
                encoder,
            }),
            pending: Mutex::new(Some((stream, reader))),
            registry: HandlerRegistry::new(),
            on_close: Mutex::new(Vec::new()),
            on_error: RwLock::new(Vec::new()),
            on_fatal: RwLock::new(None),
            deadline,
            activity: Notify::new(),
            shutdown,
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    /// Start the read loop and the keepalive task.
    ///
    /// Only the first call has an effect. Must be called from within a
    /// tokio runtime.
    pub fn accept(&self) {
        let Some((stream, encoder)) = self.inner.pending.lock().take() else {
            return;
        };

        debug!(connection = %self.inner.id, encoder = encoder.name(), "Connection accepted");
        tokio::spawn(read_loop(self.clone(), stream, encoder));
        tokio::spawn(keepalive(self.clone()));
    }

    /// Connection ID.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.inner.id
    }

    /// Metadata captured when the connection was established.
    #[must_use]
    pub fn meta(&self) -> &ConnectionMeta {
        &self.inner.meta
    }

    /// Settings this connection was opened with.
    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Whether teardown has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Number of reply handlers waiting for an answer.
    #[must_use]
    pub fn pending_replies(&self) -> usize {
        self.inner.registry.pending_replies()
    }

    /// Encoded bytes written to the socket.
    #[must_use]
    pub fn bytes_sent(&self) -> u64 {
        self.inner.counters.sent()
    }

    /// Encoded bytes read from the socket.
    #[must_use]
    pub fn bytes_received(&self) -> u64 {
        self.inner.counters.received()
    }

    /// Register a message handler. A later handler on the same topic
    /// replaces the earlier one.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::InvalidHandler`] for a reply handler and
    /// [`ConnectionError::InvalidModel`] if the model factory panics.
    pub fn set_message_handler(&self, handler: Handler<E>) -> Result<(), ConnectionError> {
        self.inner.registry.set_message(handler)
    }

    /// Register several message handlers, stopping at the first invalid one.
    ///
    /// # Errors
    ///
    /// See [`set_message_handler`](Self::set_message_handler).
    pub fn set_message_handlers(
        &self,
        handlers: impl IntoIterator<Item = Handler<E>>,
    ) -> Result<(), ConnectionError> {
        handlers
            .into_iter()
            .try_for_each(|handler| self.set_message_handler(handler))
    }

    /// Remove the message handler for `topic`.
    pub fn remove_message_handler(&self, topic: &str) -> bool {
        self.inner.registry.remove_message(topic)
    }

    /// Topics with a registered message handler.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        self.inner.registry.topics()
    }

    /// Register a close callback.
    ///
    /// Callbacks run once, in registration order, with the error that
    /// closed the connection or `None` for a graceful close. A callback
    /// registered after close runs immediately with `None`.
    pub fn on_close(&self, callback: impl FnOnce(Option<&ConnectionError>) + Send + 'static) {
        {
            let mut callbacks = self.inner.on_close.lock();
            if !self.is_closed() {
                callbacks.push(Box::new(callback));
                return;
            }
        }
        callback(None);
    }

    /// Register an error callback for non-fatal errors.
    pub fn on_error(&self, callback: impl Fn(&ConnectionError) + Send + Sync + 'static) {
        self.inner.on_error.write().push(Arc::new(callback));
    }

    /// Set the callback for handler panics, replacing any previous one.
    pub fn on_fatal(&self, callback: impl Fn(&Fatal) + Send + Sync + 'static) {
        *self.inner.on_fatal.write() = Some(Arc::new(callback));
    }

    /// Send a message on `topic`.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Closed`] on a closed connection, or the
    /// encode or transport error that stopped the send.
    pub async fn write<T>(&self, topic: &str, data: &T) -> Result<(), ConnectionError>
    where
        T: Serialize + Sync + ?Sized,
    {
        self.write_with_replies(topic, data, Vec::new()).await
    }

    /// Send a message on `topic` and wait for an answer with `reply`.
    ///
    /// # Errors
    ///
    /// See [`write_with_replies`](Self::write_with_replies).
    pub async fn request<T>(&self, topic: &str, data: &T, reply: Handler<E>) -> Result<(), ConnectionError>
    where
        T: Serialize + Sync + ?Sized,
    {
        self.write_with_replies(topic, data, vec![reply]).await
    }

    /// Send a message with at most one reply handler.
    ///
    /// The reply handler is registered before the frame goes out and is
    /// removed again if the send fails.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::InvalidHandler`] if more than one handler
    /// is given or the handler has a topic; nothing is sent in that case.
    pub async fn write_with_replies<T>(
        &self,
        topic: &str,
        data: &T,
        replies: Vec<Handler<E>>,
    ) -> Result<(), ConnectionError>
    where
        T: Serialize + Sync + ?Sized,
    {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        if replies.len() > 1 {
            return Err(ConnectionError::InvalidHandler(format!(
                "at most one reply handler per write, got {}",
                replies.len()
            )));
        }

        let id = generate_correlation_id();
        let awaiting = match replies.into_iter().next() {
            Some(reply) => {
                self.inner.registry.register_reply(id.clone(), reply)?;
                true
            }
            None => false,
        };

        let result = self.write_frame(&id, topic, |encoder| encoder.write_data(data)).await;
        if result.is_err() && awaiting {
            self.inner.registry.cancel_reply(&id);
        }
        result
    }

    /// Send a payload already produced by this connection's encoder
    /// (see [`Encoder::encode`]) under a fresh correlation id.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Closed`] on a closed connection, or the
    /// error that stopped the send.
    pub async fn write_encoded(&self, topic: &str, payload: &[u8]) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        let id = generate_correlation_id();
        self.write_frame(&id, topic, |encoder| encoder.write_encoded(payload))
            .await
    }

    /// Close the connection.
    ///
    /// Sends a close frame, then lets the read loop tear down. Idempotent.
    ///
    /// Waits at most `pong_timeout` for the close frame; a write stuck on
    /// an unresponsive peer is then cancelled by the teardown.
    pub async fn close(&self) {
        if self.inner.closing.swap(true, Ordering::AcqRel) {
            return;
        }

        let close_frame = async {
            let mut writer = self.inner.writer.lock().await;
            match writer.sink.as_mut() {
                Some(sink) => self.send(sink, RawFrame::Close).await,
                None => Ok(()),
            }
        };
        match time::timeout(self.inner.config.keepalive.pong_timeout, close_frame).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(connection = %self.inner.id, error = %e, "Close frame not sent"),
            Err(_) => debug!(connection = %self.inner.id, "Close frame timed out"),
        }

        let accepted = self.inner.pending.lock().is_none();
        if accepted {
            self.inner.shutdown.send_replace(true);
        } else {
            self.teardown(None).await;
        }
    }

    async fn write_frame<F>(&self, id: &str, topic: &str, body: F) -> Result<(), ConnectionError>
    where
        F: FnOnce(&mut E) -> Result<(), ProtocolError>,
    {
        let mut writer = self.inner.writer.lock().await;
        let Writer { sink, encoder } = &mut *writer;
        let sink = sink.as_mut().ok_or(ConnectionError::Closed)?;

        let frame = frames::write_frame(encoder, &Header::new(id, topic), body)?;
        let len = frame.len();
        self.send(sink, RawFrame::Data(frame)).await?;
        self.inner.counters.record_sent(len);

        trace!(connection = %self.inner.id, topic = %topic, bytes = len, "Frame sent");
        Ok(())
    }

    /// Send one frame, giving up with `Closed` once teardown has begun.
    async fn send(&self, sink: &mut SocketSink, frame: RawFrame) -> Result<(), ConnectionError> {
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::select! {
            sent = sink.send(frame) => sent.map_err(ConnectionError::from),
            () = shutting_down(&mut shutdown) => Err(ConnectionError::Closed),
        }
    }

    fn report(&self, err: &ConnectionError) {
        let callbacks: Vec<ErrorCallback> = self.inner.on_error.read().clone();
        if callbacks.is_empty() {
            warn!(connection = %self.inner.id, error = %err, "Unhandled connection error");
            return;
        }
        for callback in callbacks {
            callback(err);
        }
    }

    fn fatal(&self, fatal: Fatal) {
        let callback = self.inner.on_fatal.read().clone();
        match callback {
            Some(callback) => callback(&fatal),
            None => error!(
                connection = %self.inner.id,
                topic = %fatal.topic,
                id = %fatal.correlation_id,
                panic = %fatal.message,
                "Handler panicked"
            ),
        }
    }

    fn receive(&self, frame: RawFrame, encoder: &mut E) {
        self.inner.deadline.send_if_modified(|deadline| deadline.take().is_some());
        self.inner.activity.notify_one();

        let RawFrame::Data(bytes) = frame else {
            return;
        };
        self.inner.counters.record_received(bytes.len());

        if bytes.len() > self.inner.config.max_message_size {
            self.report(&ProtocolError::FrameTooLarge(bytes.len()).into());
            return;
        }
        self.route(bytes, encoder);
    }

    fn route(&self, frame: Bytes, encoder: &mut E) {
        let header = match frames::read_header(encoder, frame.clone()) {
            Ok(header) => header,
            Err(e) => {
                self.report(&e.into());
                return;
            }
        };
        trace!(connection = %self.inner.id, topic = %header.topic, "Frame received");

        let Some(handler) = self.inner.registry.find(&header) else {
            self.report(&ConnectionError::Unroutable {
                id: header.id,
                topic: header.topic,
            });
            return;
        };

        let ctx = Context::new(self.clone(), header.topic.clone(), header.id.clone());
        match handler.decode(encoder, ctx) {
            Ok(dispatch) => self.dispatch(dispatch, header, frame, handler.is_reply()),
            Err(e) => self.report(&e),
        }
    }

    fn dispatch(&self, dispatch: Dispatch<E>, header: Header, frame: Bytes, is_reply: bool) {
        let conn = self.clone();
        tokio::spawn(async move {
            match AssertUnwindSafe(dispatch).catch_unwind().await {
                Ok(Some(reply)) if !is_reply => {
                    let sent = conn
                        .write_frame(&header.id, &header.topic, move |encoder| reply.encode(encoder))
                        .await;
                    match sent {
                        Ok(()) | Err(ConnectionError::Closed) => {}
                        Err(e) => conn.report(&e),
                    }
                }
                Ok(_) => {}
                Err(panic) => conn.fatal(Fatal {
                    topic: header.topic,
                    correlation_id: header.id,
                    frame,
                    message: panic_message(panic.as_ref()),
                }),
            }
        });
    }

    async fn ping(&self) {
        let pong_timeout = self.inner.config.keepalive.pong_timeout;
        self.inner.deadline.send_if_modified(|deadline| {
            if deadline.is_some() {
                return false;
            }
            *deadline = Some(Instant::now() + pong_timeout);
            true
        });

        let mut writer = self.inner.writer.lock().await;
        if let Some(sink) = writer.sink.as_mut() {
            match self.send(sink, RawFrame::Ping(Bytes::new())).await {
                Ok(()) => trace!(connection = %self.inner.id, "Ping sent"),
                Err(e) => debug!(connection = %self.inner.id, error = %e, "Ping failed"),
            }
        }
    }

    fn expire_replies(&self) {
        let Some(ttl) = self.inner.config.reply_timeout else {
            return;
        };
        for id in self.inner.registry.expire(ttl) {
            self.report(&ConnectionError::ReplyExpired(id));
        }
    }

    async fn teardown(&self, reason: Option<ConnectionError>) {
        let callbacks = {
            let mut callbacks = self.inner.on_close.lock();
            if self.inner.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut *callbacks)
        };
        self.inner.closing.store(true, Ordering::Release);
        self.inner.shutdown.send_replace(true);
        self.inner.pending.lock().take();
        self.inner.deadline.send_replace(None);

        match &reason {
            Some(e) => debug!(connection = %self.inner.id, error = %e, "Connection closed"),
            None => debug!(connection = %self.inner.id, "Connection closed"),
        }

        for callback in callbacks {
            callback(reason.as_ref());
        }

        let sink = self.inner.writer.lock().await.sink.take();
        drop(sink);

        // Handlers may hold clones of this connection.
        self.inner.registry.clear_messages();
        let dropped = self.inner.registry.clear_replies();
        if dropped > 0 {
            debug!(connection = %self.inner.id, dropped, "Dropped pending replies");
        }
    }
}

async fn read_loop<E: Encoder>(conn: Connection<E>, mut stream: SocketStream, mut encoder: E) {
    let mut shutdown = conn.inner.shutdown.subscribe();
    let mut deadline = conn.inner.deadline.subscribe();

    let reason = loop {
        let expires_at = *deadline.borrow_and_update();

        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(RawFrame::Close)) | None => break None,
                Some(Ok(frame)) => conn.receive(frame, &mut encoder),
                Some(Err(e)) => break Some(ConnectionError::Transport(e)),
            },
            () = shutting_down(&mut shutdown) => break None,
            () = expire(expires_at) => break Some(ConnectionError::Transport(TransportError::Timeout)),
            _ = deadline.changed() => {}
        }
    };

    drop(stream);
    conn.teardown(reason).await;
}

async fn shutting_down(shutdown: &mut watch::Receiver<bool>) {
    // The sender lives in `Inner`, so an error means the connection is gone.
    let _ = shutdown.wait_for(|closing| *closing).await;
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn keepalive<E: Encoder>(conn: Connection<E>) {
    let interval = conn.inner.config.keepalive.ping_interval;
    let mut shutdown = conn.inner.shutdown.subscribe();
    let mut sweep = time::interval(interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut next_ping = Instant::now() + interval;

    loop {
        tokio::select! {
            () = shutting_down(&mut shutdown) => break,
            () = conn.inner.activity.notified() => next_ping = Instant::now() + interval,
            _ = sweep.tick() => conn.expire_replies(),
            () = time::sleep_until(next_ping) => {
                conn.ping().await;
                next_ping = Instant::now() + interval;
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
