//! # tenvis-relay-transport
//!
//! Multiplexed request/reply connections for Relay.
//!
//! Many logical messages share one socket. Each frame carries a
//! correlation id and a topic; the receiving [`Connection`] routes it to a
//! pending reply handler (by id) or a message handler (by topic) and runs
//! the handler on its own task.
//!
//! - [`Connection`] - one socket, many messages
//! - [`Handler`] - typed handlers with model factories
//! - [`Server`] - accepts WebSocket upgrades through axum
//! - [`Dialer`] - opens outbound WebSocket connections
//! - [`memory::pair`] - in-process sockets
//!
//! ## Example
//!
//! ```rust,ignore
//! use tenvis_relay_transport::{ConnectionConfig, Handler, Server};
//!
//! let server = Server::new(ConnectionConfig::default());
//! server.on_connection(|conn| {
//!     conn.set_message_handler(Handler::message("echo", String::new, |text, _ctx| async move {
//!         Some(text)
//!     }))
//!     .ok();
//! });
//!
//! let app = server.router("/ws");
//! ```

pub mod connection;
pub mod counters;
pub mod handler;
pub mod memory;
mod registry;
pub mod server;
pub mod traits;
pub mod websocket;

#[cfg(feature = "client")]
pub mod dialer;

pub use connection::{Connection, ConnectionConfig, ConnectionError, Fatal, KeepaliveConfig};
pub use handler::{Chain, Context, Handler};
pub use server::{Server, ServerError};
pub use traits::{
    generate_correlation_id, ConnectionId, ConnectionMeta, RawFrame, SocketSink, SocketStream,
    TransportError,
};

#[cfg(feature = "client")]
pub use dialer::Dialer;
