//! # relay-protocol
//!
//! Wire protocol definitions for the Relay messaging transport.
//!
//! A Relay frame is an ordered triple `(correlation id, topic, payload)`
//! carried in one binary WebSocket message. This crate defines the
//! [`Encoder`] capability that turns the triple into bytes, plus two
//! implementations:
//!
//! - [`MsgPackEncoder`] - compact binary, the default
//! - [`JsonEncoder`] - line-delimited JSON, for debugging
//!
//! ## Example
//!
//! ```rust
//! use relay_protocol::{frames, Encoder, Header, MsgPackEncoder};
//!
//! let mut encoder = MsgPackEncoder::new();
//! let header = Header::new("6f1c", "chat:send");
//! let frame = frames::write_frame(&mut encoder, &header, |e| e.write_data("hi")).unwrap();
//!
//! let decoded = frames::read_header(&mut encoder, frame).unwrap();
//! let mut text = String::new();
//! encoder.read_data(&mut text).unwrap();
//! assert_eq!(decoded.topic, "chat:send");
//! assert_eq!(text, "hi");
//! ```

pub mod codec;
pub mod frames;
pub mod json;
pub mod msgpack;

pub use codec::{Encoder, ProtocolError, MAX_FRAME_SIZE};
pub use frames::Header;
pub use json::JsonEncoder;
pub use msgpack::MsgPackEncoder;
