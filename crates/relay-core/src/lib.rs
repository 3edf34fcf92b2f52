//! # tenvis-relay-core
//!
//! Sessions and rooms on top of Relay connections.
//!
//! - **Session** - a connection with an id, attributes and room memberships
//! - **RoomHub** - room registry with encode-once broadcast fanout
//! - **Adapter** - bridge that shares broadcasts between hubs
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Connection │────▶│   Session   │────▶│   RoomHub   │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                                                │
//!                                                ▼
//!                                         ┌─────────────┐
//!                                         │   Adapter   │
//!                                         └─────────────┘
//! ```

pub mod adapter;
pub mod hub;
pub mod room;
pub mod session;

pub use adapter::{Adapter, AdapterError, Broadcast, BroadcastHandler, MemoryAdapter, MemoryBus};
pub use hub::{HubError, HubStats, RoomHub};
pub use room::{validate_room_name, RoomId, MAX_ROOM_NAME_LENGTH};
pub use session::Session;
