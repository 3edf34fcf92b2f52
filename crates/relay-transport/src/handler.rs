//! Message and reply handlers.
//!
//! A [`Handler`] couples a topic with a model factory and a serve
//! function. The factory produces a fresh decode target for every
//! inbound frame, so concurrent dispatches never share a model.
//!
//! Handlers with an empty topic are reply handlers: they are passed to
//! [`Connection::write_with_replies`](crate::Connection::write_with_replies),
//! fire at most once, and never produce a further reply.

use futures_util::future::BoxFuture;
use relay_protocol::{Encoder, MsgPackEncoder, ProtocolError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::connection::{Connection, ConnectionError};

/// Per-dispatch context handed to every serve function.
#[derive(Clone)]
pub struct Context<E: Encoder = MsgPackEncoder> {
    connection: Connection<E>,
    topic: String,
    correlation_id: String,
}

impl<E: Encoder> Context<E> {
    pub(crate) fn new(connection: Connection<E>, topic: String, correlation_id: String) -> Self {
        Self {
            connection,
            topic,
            correlation_id,
        }
    }

    /// The connection the message arrived on.
    #[must_use]
    pub fn connection(&self) -> &Connection<E> {
        &self.connection
    }

    /// Topic of the inbound frame.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Correlation id of the inbound frame.
    #[must_use]
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }
}

impl<E: Encoder> fmt::Debug for Context<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("connection", self.connection.id())
            .field("topic", &self.topic)
            .field("correlation_id", &self.correlation_id)
            .finish()
    }
}

/// A reply value waiting to be encoded by the connection's encoder.
pub(crate) trait EncodeReply<E>: Send {
    fn encode(&self, encoder: &mut E) -> Result<(), ProtocolError>;
}

impl<E: Encoder, T: Serialize + Send> EncodeReply<E> for T {
    fn encode(&self, encoder: &mut E) -> Result<(), ProtocolError> {
        encoder.write_data(self)
    }
}

pub(crate) type Reply<E> = Box<dyn EncodeReply<E>>;

/// A decoded message bound to its serve function, ready to run.
pub(crate) type Dispatch<E> = BoxFuture<'static, Option<Reply<E>>>;

type Factory<T> = Arc<dyn Fn() -> T + Send + Sync>;
type ServeFn<T, E> = Arc<dyn Fn(T, Context<E>) -> Dispatch<E> + Send + Sync>;

trait ErasedHandler<E: Encoder>: Send + Sync {
    fn probe(&self) -> bool;

    fn decode(&self, encoder: &mut E, ctx: Context<E>) -> Result<Dispatch<E>, ConnectionError>;
}

struct TypedHandler<T, E: Encoder> {
    factory: Factory<T>,
    serve: ServeFn<T, E>,
}

impl<T, E> ErasedHandler<E> for TypedHandler<T, E>
where
    T: DeserializeOwned + Send + 'static,
    E: Encoder,
{
    fn probe(&self) -> bool {
        catch_unwind(AssertUnwindSafe(|| drop((self.factory)()))).is_ok()
    }

    fn decode(&self, encoder: &mut E, ctx: Context<E>) -> Result<Dispatch<E>, ConnectionError> {
        let mut model = catch_unwind(AssertUnwindSafe(|| (self.factory)()))
            .map_err(|_| ConnectionError::InvalidModel(ctx.topic().to_string()))?;
        encoder.read_data(&mut model)?;
        Ok((self.serve)(model, ctx))
    }
}

/// Handler for inbound messages on a topic, or for a single reply.
pub struct Handler<E: Encoder = MsgPackEncoder> {
    topic: String,
    inner: Arc<dyn ErasedHandler<E>>,
}

impl<E: Encoder> Clone for Handler<E> {
    fn clone(&self) -> Self {
        Self {
            topic: self.topic.clone(),
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: Encoder> fmt::Debug for Handler<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler").field("topic", &self.topic).finish()
    }
}

impl<E: Encoder> Handler<E> {
    fn from_parts<T>(topic: String, factory: Factory<T>, serve: ServeFn<T, E>) -> Self
    where
        T: DeserializeOwned + Send + 'static,
    {
        Self {
            topic,
            inner: Arc::new(TypedHandler { factory, serve }),
        }
    }

    /// Create a message handler whose serve function may answer.
    ///
    /// Returning `Some(reply)` writes `reply` back under the inbound
    /// correlation id, which fires the sender's reply handler.
    pub fn message<T, R, F, Fut>(
        topic: impl Into<String>,
        factory: impl Fn() -> T + Send + Sync + 'static,
        serve: F,
    ) -> Self
    where
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(T, Context<E>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<R>> + Send + 'static,
    {
        let serve: ServeFn<T, E> = Arc::new(move |data, ctx| {
            let fut = serve(data, ctx);
            Box::pin(async move { fut.await.map(|reply| Box::new(reply) as Reply<E>) })
        });
        Self::from_parts(topic.into(), Arc::new(factory), serve)
    }

    /// Create a message handler that never answers.
    pub fn oneway<T, F, Fut>(
        topic: impl Into<String>,
        factory: impl Fn() -> T + Send + Sync + 'static,
        serve: F,
    ) -> Self
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T, Context<E>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let serve: ServeFn<T, E> = Arc::new(move |data, ctx| {
            let fut = serve(data, ctx);
            Box::pin(async move {
                fut.await;
                None
            })
        });
        Self::from_parts(topic.into(), Arc::new(factory), serve)
    }

    /// Create a reply handler.
    pub fn reply<T, F, Fut>(factory: impl Fn() -> T + Send + Sync + 'static, serve: F) -> Self
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T, Context<E>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::oneway(String::new(), factory, serve)
    }

    /// Start building a chain of synchronous steps for `topic`.
    pub fn chain<T, R>(
        topic: impl Into<String>,
        factory: impl Fn() -> T + Send + Sync + 'static,
    ) -> Chain<T, R, E>
    where
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
    {
        Chain {
            topic: topic.into(),
            factory: Arc::new(factory),
            steps: Vec::new(),
            finally: None,
        }
    }

    /// Topic this handler listens on; empty for reply handlers.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Whether this is a reply handler.
    #[must_use]
    pub fn is_reply(&self) -> bool {
        self.topic.is_empty()
    }

    /// Check that the model factory can produce a target.
    pub(crate) fn probe(&self) -> Result<(), ConnectionError> {
        if self.inner.probe() {
            Ok(())
        } else {
            Err(ConnectionError::InvalidModel(self.topic.clone()))
        }
    }

    /// Decode the payload the encoder is positioned at and bind it to
    /// the serve function.
    pub(crate) fn decode(&self, encoder: &mut E, ctx: Context<E>) -> Result<Dispatch<E>, ConnectionError> {
        self.inner.decode(encoder, ctx)
    }
}

type Step<T, R, E> = Box<dyn Fn(&T, &Context<E>) -> Option<R> + Send + Sync>;
type Finally<R, E> = Box<dyn Fn(&R, &Context<E>) + Send + Sync>;

/// Builder for handlers made of ordered synchronous steps.
///
/// Steps run in registration order. The first step that returns a reply
/// stops the chain and that reply is sent back. A `finally` step, if
/// set, observes the reply before it is sent. Useful for guard steps
/// (authorization, validation) in front of the real work.
pub struct Chain<T, R, E: Encoder = MsgPackEncoder> {
    topic: String,
    factory: Factory<T>,
    steps: Vec<Step<T, R, E>>,
    finally: Option<Finally<R, E>>,
}

impl<T, R, E> Chain<T, R, E>
where
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    E: Encoder,
{
    /// Append a step.
    #[must_use]
    pub fn step(mut self, step: impl Fn(&T, &Context<E>) -> Option<R> + Send + Sync + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    /// Observe the reply that stopped the chain.
    #[must_use]
    pub fn finally(mut self, finally: impl Fn(&R, &Context<E>) + Send + Sync + 'static) -> Self {
        self.finally = Some(Box::new(finally));
        self
    }

    /// Finish the chain.
    #[must_use]
    pub fn build(self) -> Handler<E> {
        let steps = Arc::new(self.steps);
        let finally: Option<Arc<Finally<R, E>>> = self.finally.map(Arc::new);

        let serve: ServeFn<T, E> = Arc::new(move |data, ctx| {
            let steps = Arc::clone(&steps);
            let finally = finally.clone();
            Box::pin(async move {
                let reply = steps.iter().find_map(|step| step(&data, &ctx))?;
                if let Some(finally) = &finally {
                    finally(&reply, &ctx);
                }
                Some(Box::new(reply) as Reply<E>)
            })
        });

        Handler::from_parts(self.topic, self.factory, serve)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory;
    use crate::ConnectionConfig;
    use bytes::Bytes;
    use relay_protocol::{frames, Header};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn context() -> Context {
        let ((sink, stream), _peer) = memory::pair();
        let conn = Connection::open(sink, stream, Default::default(), ConnectionConfig::default());
        Context::new(conn, "topic".into(), "id".into())
    }

    fn encoded<T: Serialize>(value: &T) -> MsgPackEncoder {
        let mut encoder = MsgPackEncoder::new();
        let frame = frames::write_frame(&mut encoder, &Header::new("id", "topic"), |e| e.write_data(value))
            .unwrap();
        frames::read_header(&mut encoder, frame).unwrap();
        encoder
    }

    fn reply_bytes(reply: Reply<MsgPackEncoder>) -> Bytes {
        let mut encoder = MsgPackEncoder::new();
        encoder.reset_writer();
        reply.encode(&mut encoder).unwrap();
        encoder.flush().unwrap()
    }

    #[tokio::test]
    async fn test_message_handler_replies() {
        let handler: Handler = Handler::message("double", || 0u32, |n, _ctx| async move { Some(n * 2) });
        assert_eq!(handler.topic(), "double");
        assert!(!handler.is_reply());

        let mut encoder = encoded(&21u32);
        let reply = handler.decode(&mut encoder, context()).unwrap().await.unwrap();

        let expected = MsgPackEncoder::new();
        assert_eq!(reply_bytes(reply), expected.encode(&42u32).unwrap());
    }

    #[tokio::test]
    async fn test_reply_handler_never_answers() {
        let served = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&served);
        let handler: Handler = Handler::reply(String::new, move |_text, _ctx| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert!(handler.is_reply());

        let mut encoder = encoded(&"pong");
        assert!(handler.decode(&mut encoder, context()).unwrap().await.is_none());
        assert_eq!(served.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_chain_stops_at_first_reply() {
        let finals = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&finals);

        let handler: Handler = Handler::chain("guarded", || 0i64)
            .step(|n: &i64, _| if *n < 0 { Some("negative".to_string()) } else { None })
            .step(|n: &i64, _| Some(format!("ok:{n}")))
            .step(|_, _| panic!("unreachable step"))
            .finally(move |_reply: &String, _| {
                observed.fetch_add(1, Ordering::SeqCst);
            })
            .build();

        let mut encoder = encoded(&-5i64);
        let reply = handler.decode(&mut encoder, context()).unwrap().await.unwrap();
        assert_eq!(reply_bytes(reply), MsgPackEncoder::new().encode("negative").unwrap());

        let mut encoder = encoded(&5i64);
        let reply = handler.decode(&mut encoder, context()).unwrap().await.unwrap();
        assert_eq!(reply_bytes(reply), MsgPackEncoder::new().encode("ok:5").unwrap());

        assert_eq!(finals.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_chain_without_reply() {
        let handler: Handler = Handler::chain::<u8, String>("quiet", || 0u8)
            .step(|_, _| None)
            .build();

        let mut encoder = encoded(&1u8);
        assert!(handler.decode(&mut encoder, context()).unwrap().await.is_none());
    }

    #[tokio::test]
    async fn test_probe_detects_broken_factory() {
        let broken: Handler = Handler::oneway("broken", || -> String { panic!("no model") }, |_, _| async {});
        assert!(matches!(broken.probe(), Err(ConnectionError::InvalidModel(topic)) if topic == "broken"));

        let fine: Handler = Handler::oneway("fine", String::new, |_, _| async {});
        assert!(fine.probe().is_ok());
    }

    #[tokio::test]
    async fn test_decode_mismatch() {
        let handler: Handler = Handler::oneway("numbers", || 0u32, |_, _| async {});
        let mut encoder = encoded(&"not a number");
        assert!(matches!(
            handler.decode(&mut encoder, context()),
            Err(ConnectionError::Protocol(_))
        ));
    }
}
