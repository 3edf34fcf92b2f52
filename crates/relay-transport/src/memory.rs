//! In-process transport.
//!
//! [`pair`] returns two connected socket ends backed by unbounded tokio
//! channels. Each end answers pings it receives with a pong, like a
//! WebSocket peer would, so keepalive works across a pair without a
//! network.

use futures_util::{sink, stream};
use tokio::sync::mpsc;

use crate::traits::{RawFrame, SocketSink, SocketStream, TransportError};

/// One end of an in-memory socket.
pub type MemorySocket = (SocketSink, SocketStream);

/// Create two connected in-memory sockets.
#[must_use]
pub fn pair() -> (MemorySocket, MemorySocket) {
    let (left_tx, left_rx) = mpsc::unbounded_channel();
    let (right_tx, right_rx) = mpsc::unbounded_channel();

    let left = socket(left_tx.clone(), right_rx, left_tx);
    let right = socket(right_tx.clone(), left_rx, right_tx);
    (left, right)
}

fn socket(
    outbound: mpsc::UnboundedSender<RawFrame>,
    inbound: mpsc::UnboundedReceiver<RawFrame>,
    pong: mpsc::UnboundedSender<RawFrame>,
) -> MemorySocket {
    let sink = sink::unfold(outbound, |outbound, frame: RawFrame| async move {
        outbound
            .send(frame)
            .map_err(|_| TransportError::ConnectionClosed)?;
        Ok::<_, TransportError>(outbound)
    });

    let stream = stream::unfold((inbound, pong), |(mut inbound, pong)| async move {
        let frame = inbound.recv().await?;
        if let RawFrame::Ping(payload) = &frame {
            // Peer may already be gone; the ping still counts as activity.
            let _ = pong.send(RawFrame::Pong(payload.clone()));
        }
        Some((Ok(frame), (inbound, pong)))
    });

    (Box::pin(sink), Box::pin(stream))
}
