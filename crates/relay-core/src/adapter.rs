//! Cross-hub broadcast adapters.
//!
//! An [`Adapter`] shares a hub's broadcasts with other hubs, typically in
//! other processes. Every broadcast is handed to each adapter before it
//! is fanned out locally; broadcasts arriving from an adapter go through
//! the same local fanout.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Default capacity of a [`MemoryBus`].
const DEFAULT_BUS_CAPACITY: usize = 1024;

/// A broadcast as seen by adapters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Broadcast {
    /// Session id of the sender; empty for hub-originated broadcasts.
    pub origin: String,
    /// Target room.
    pub room: String,
    /// Topic written to recipients.
    pub topic: String,
    /// Payload, already encoded with the hub's encoder.
    pub payload: Bytes,
}

/// Adapter errors.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// The underlying bus is gone.
    #[error("Adapter closed")]
    Closed,

    /// Any other failure.
    #[error("Adapter error: {0}")]
    Other(String),
}

/// Callback for broadcasts received from other hubs.
///
/// Returns `false` once the receiving hub is gone; adapters stop
/// delivering after that.
pub type BroadcastHandler = Arc<dyn Fn(Broadcast) -> bool + Send + Sync>;

/// Bridge between hubs.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Share a local broadcast with other hubs.
    async fn publish(&self, broadcast: &Broadcast) -> Result<(), AdapterError>;

    /// Install the callback for broadcasts from other hubs.
    ///
    /// Called once by the hub at construction.
    fn on_broadcast(&self, handler: BroadcastHandler);
}

#[derive(Debug, Clone)]
struct Envelope {
    source: u64,
    broadcast: Broadcast,
}

/// In-process bus connecting several hubs.
#[derive(Debug, Clone)]
pub struct MemoryBus {
    sender: broadcast::Sender<Arc<Envelope>>,
    next_id: Arc<AtomicU64>,
}

impl MemoryBus {
    /// Create a bus buffering up to `capacity` broadcasts per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Create an adapter attached to this bus.
    #[must_use]
    pub fn adapter(&self) -> MemoryAdapter {
        MemoryAdapter {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            sender: self.sender.clone(),
            receiver: Mutex::new(Some(self.sender.subscribe())),
        }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

/// A hub's connection to a [`MemoryBus`].
///
/// Never re-delivers its own publications.
pub struct MemoryAdapter {
    id: u64,
    sender: broadcast::Sender<Arc<Envelope>>,
    receiver: Mutex<Option<broadcast::Receiver<Arc<Envelope>>>>,
}

#[async_trait]
impl Adapter for MemoryAdapter {
    async fn publish(&self, broadcast: &Broadcast) -> Result<(), AdapterError> {
        let envelope = Envelope {
            source: self.id,
            broadcast: broadcast.clone(),
        };
        // Our own receiver keeps the channel open, so this only fails
        // after the receiver task has stopped.
        self.sender
            .send(Arc::new(envelope))
            .map(|_| ())
            .map_err(|_| AdapterError::Closed)
    }

    fn on_broadcast(&self, handler: BroadcastHandler) {
        let Some(mut receiver) = self.receiver.lock().take() else {
            warn!(adapter = self.id, "Broadcast handler already installed");
            return;
        };
        let id = self.id;

        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(envelope) if envelope.source == id => {}
                    Ok(envelope) => {
                        if !handler(envelope.broadcast.clone()) {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(adapter = id, skipped, "Memory bus lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!(adapter = id, "Memory bus receiver stopped");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn sample(origin: &str) -> Broadcast {
        Broadcast {
            origin: origin.into(),
            room: "lobby".into(),
            topic: "room:message".into(),
            payload: Bytes::from_static(b"\xa2hi"),
        }
    }

    #[tokio::test]
    async fn test_bus_skips_own_publications() {
        let bus = MemoryBus::default();
        let first = bus.adapter();
        let second = bus.adapter();

        let (tx_first, mut rx_first) = mpsc::unbounded_channel();
        first.on_broadcast(Arc::new(move |b| tx_first.send(b).is_ok()));
        let (tx_second, mut rx_second) = mpsc::unbounded_channel();
        second.on_broadcast(Arc::new(move |b| tx_second.send(b).is_ok()));

        first.publish(&sample("a")).await.unwrap();
        second.publish(&sample("b")).await.unwrap();

        assert_eq!(rx_second.recv().await.unwrap(), sample("a"));
        assert_eq!(rx_first.recv().await.unwrap(), sample("b"));
        assert!(rx_first.try_recv().is_err());
        assert!(rx_second.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_receiver_stops_when_handler_declines() {
        let bus = MemoryBus::default();
        let first = bus.adapter();
        let second = bus.adapter();

        let calls = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&calls);
        first.on_broadcast(Arc::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            false
        }));
        assert_eq!(bus.sender.receiver_count(), 2);

        second.publish(&sample("b")).await.unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while bus.sender.receiver_count() > 1 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        second.publish(&sample("b")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_broadcast_is_serializable() {
        let json = serde_json::to_string(&sample("s1")).unwrap();
        let back: Broadcast = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sample("s1"));
    }
}
