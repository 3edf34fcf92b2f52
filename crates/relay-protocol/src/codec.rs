//! Encoder capability used by Relay connections.
//!
//! A connection never knows the byte format of its frames. It drives an
//! [`Encoder`] field by field: two strings (correlation id and topic)
//! followed by one payload value. Any format that can write and read
//! those three fields in sequence can carry Relay traffic.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Maximum frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid frame data.
    #[error("Invalid frame: {0}")]
    Invalid(String),
}

/// Field-level encoder for Relay frames.
///
/// Both ends of a connection must use the same encoder. An encoder keeps
/// one read cursor and one write buffer; a connection gives its read task
/// and its writer separate clones, so implementations never need interior
/// locking.
pub trait Encoder: Clone + Send + Sync + 'static {
    /// Short format name, used in logs.
    fn name(&self) -> &'static str;

    /// Point the decoder at a freshly received frame.
    fn reset_reader(&mut self, frame: Bytes);

    /// Discard any partially written frame and start a new one.
    fn reset_writer(&mut self);

    /// Finish the current outgoing frame and hand back its bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::FrameTooLarge`] if the frame exceeds
    /// [`MAX_FRAME_SIZE`].
    fn flush(&mut self) -> Result<Bytes, ProtocolError>;

    /// Read the next string field.
    ///
    /// # Errors
    ///
    /// Returns an error if the next field is missing or not a string.
    fn read_string(&mut self) -> Result<String, ProtocolError>;

    /// Decode the next payload value into `target`.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload does not match the target type.
    fn read_data<T: DeserializeOwned>(&mut self, target: &mut T) -> Result<(), ProtocolError>;

    /// Append a string field to the current frame.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    fn write_string(&mut self, value: &str) -> Result<(), ProtocolError>;

    /// Append a payload value to the current frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be encoded.
    fn write_data<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), ProtocolError>;

    /// Append a payload value previously produced by [`Encoder::encode`].
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes cannot be spliced into the frame.
    fn write_encoded(&mut self, encoded: &[u8]) -> Result<(), ProtocolError>;

    /// Encode a standalone payload value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be encoded.
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes, ProtocolError>;
}

pub(crate) fn check_frame_size(len: usize) -> Result<(), ProtocolError> {
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    Ok(())
}
