//! WebSocket socket adapters.
//!
//! Both the server side (axum) and the client side (tokio-tungstenite)
//! are split into a [`SocketSink`] / [`SocketStream`] pair. Text messages
//! are treated as binary; raw tungstenite frames are ignored.

use axum::extract::ws::{Message as AxumMessage, WebSocket};
use bytes::Bytes;
use futures_util::{future, SinkExt, StreamExt};

use crate::traits::{RawFrame, SocketSink, SocketStream, TransportError};

/// Split an upgraded axum socket.
#[must_use]
pub fn from_axum(socket: WebSocket) -> (SocketSink, SocketStream) {
    let (sink, stream) = socket.split();

    let sink = sink
        .sink_map_err(|e| TransportError::SendFailed(e.to_string()))
        .with(|frame: RawFrame| future::ready(Ok::<_, TransportError>(axum_message(frame))));

    let stream = stream.filter_map(|message| {
        future::ready(match message {
            Ok(message) => axum_frame(message).map(Ok),
            Err(e) => Some(Err(TransportError::ReceiveFailed(e.to_string()))),
        })
    });

    (Box::pin(sink), Box::pin(stream))
}

fn axum_message(frame: RawFrame) -> AxumMessage {
    match frame {
        RawFrame::Data(data) => AxumMessage::Binary(data.to_vec()),
        RawFrame::Ping(data) => AxumMessage::Ping(data.to_vec()),
        RawFrame::Pong(data) => AxumMessage::Pong(data.to_vec()),
        RawFrame::Close => AxumMessage::Close(None),
    }
}

fn axum_frame(message: AxumMessage) -> Option<RawFrame> {
    Some(match message {
        AxumMessage::Binary(data) => RawFrame::Data(Bytes::from(data)),
        AxumMessage::Text(text) => RawFrame::Data(Bytes::from(text)),
        AxumMessage::Ping(data) => RawFrame::Ping(Bytes::from(data)),
        AxumMessage::Pong(data) => RawFrame::Pong(Bytes::from(data)),
        AxumMessage::Close(_) => RawFrame::Close,
    })
}

#[cfg(feature = "client")]
pub use client::from_tungstenite;

#[cfg(feature = "client")]
mod client {
    use super::*;
    use tokio::io::{AsyncRead, AsyncWrite};
    use tokio_tungstenite::tungstenite::{Error as WsError, Message};
    use tokio_tungstenite::WebSocketStream;

    /// Split a tokio-tungstenite socket.
    pub fn from_tungstenite<S>(socket: WebSocketStream<S>) -> (SocketSink, SocketStream)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = socket.split();

        let sink = sink
            .sink_map_err(|e| TransportError::SendFailed(e.to_string()))
            .with(|frame: RawFrame| future::ready(Ok::<_, TransportError>(message(frame))));

        let stream = stream
            .take_while(|message| future::ready(!matches!(message, Err(WsError::ConnectionClosed))))
            .filter_map(|message| {
                future::ready(match message {
                    Ok(message) => raw_frame(message).map(Ok),
                    Err(e) => Some(Err(TransportError::ReceiveFailed(e.to_string()))),
                })
            });

        (Box::pin(sink), Box::pin(stream))
    }

    fn message(frame: RawFrame) -> Message {
        match frame {
            RawFrame::Data(data) => Message::Binary(data.to_vec()),
            RawFrame::Ping(data) => Message::Ping(data.to_vec()),
            RawFrame::Pong(data) => Message::Pong(data.to_vec()),
            RawFrame::Close => Message::Close(None),
        }
    }

    fn raw_frame(message: Message) -> Option<RawFrame> {
        match message {
            Message::Binary(data) => Some(RawFrame::Data(Bytes::from(data))),
            Message::Text(text) => Some(RawFrame::Data(Bytes::from(text))),
            Message::Ping(data) => Some(RawFrame::Ping(Bytes::from(data))),
            Message::Pong(data) => Some(RawFrame::Pong(Bytes::from(data))),
            Message::Close(_) => Some(RawFrame::Close),
            Message::Frame(_) => None,
        }
    }

}
