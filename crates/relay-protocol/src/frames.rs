//! Logical frame layout.
//!
//! Every data frame carries exactly three fields, in order:
//!
//! 1. correlation id (string)
//! 2. topic (string)
//! 3. payload (one encoded value)
//!
//! A reply reuses the correlation id of the frame it answers.

use bytes::Bytes;

use crate::codec::{Encoder, ProtocolError};

/// The routing part of a frame: everything except the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Correlation id.
    pub id: String,
    /// Routing topic.
    pub topic: String,
}

impl Header {
    /// Create a new header.
    #[must_use]
    pub fn new(id: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            topic: topic.into(),
        }
    }
}

/// Encode a complete frame.
///
/// `body` writes the payload field; it receives the encoder after the
/// header has been written.
///
/// # Errors
///
/// Returns an error if any field fails to encode or the frame is too large.
pub fn write_frame<E, F>(encoder: &mut E, header: &Header, body: F) -> Result<Bytes, ProtocolError>
where
    E: Encoder,
    F: FnOnce(&mut E) -> Result<(), ProtocolError>,
{
    encoder.reset_writer();
    encoder.write_string(&header.id)?;
    encoder.write_string(&header.topic)?;
    body(encoder)?;
    encoder.flush()
}

/// Start decoding a frame and read its header.
///
/// On success the encoder is positioned at the payload, ready for
/// [`Encoder::read_data`].
///
/// # Errors
///
/// Returns an error if the header fields cannot be decoded.
pub fn read_header<E: Encoder>(encoder: &mut E, frame: Bytes) -> Result<Header, ProtocolError> {
    encoder.reset_reader(frame);
    let id = encoder.read_string()?;
    let topic = encoder.read_string()?;
    Ok(Header { id, topic })
}
