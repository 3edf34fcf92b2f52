//! Line-delimited JSON encoder.
//!
//! Each field is one compact JSON document terminated by `\n`. Compact
//! JSON never contains a raw newline, so fields can be split without a
//! streaming parser. Handy when inspecting traffic with browser tools.

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::{check_frame_size, Encoder, ProtocolError};

const FIELD_SEPARATOR: u8 = b'\n';

/// JSON encoder.
#[derive(Debug, Clone, Default)]
pub struct JsonEncoder {
    frame: Bytes,
    position: usize,
    writer: BytesMut,
}

impl JsonEncoder {
    /// Create a new encoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn next_field(&mut self) -> Result<Bytes, ProtocolError> {
        let rest = &self.frame[self.position..];
        if rest.is_empty() {
            return Err(ProtocolError::Invalid("unexpected end of frame".into()));
        }

        let len = rest
            .iter()
            .position(|b| *b == FIELD_SEPARATOR)
            .unwrap_or(rest.len());
        let field = self.frame.slice(self.position..self.position + len);
        self.position = (self.position + len + 1).min(self.frame.len());
        Ok(field)
    }
}

impl Encoder for JsonEncoder {
    fn name(&self) -> &'static str {
        "json"
    }

    fn reset_reader(&mut self, frame: Bytes) {
        self.frame = frame;
        self.position = 0;
    }

    fn reset_writer(&mut self) {
        self.writer.clear();
    }

    fn flush(&mut self) -> Result<Bytes, ProtocolError> {
        check_frame_size(self.writer.len())?;
        Ok(self.writer.split().freeze())
    }

    fn read_string(&mut self) -> Result<String, ProtocolError> {
        let field = self.next_field()?;
        Ok(serde_json::from_slice(&field)?)
    }

    fn read_data<T: DeserializeOwned>(&mut self, target: &mut T) -> Result<(), ProtocolError> {
        let field = self.next_field()?;
        *target = serde_json::from_slice(&field)?;
        Ok(())
    }

    fn write_string(&mut self, value: &str) -> Result<(), ProtocolError> {
        self.write_data(value)
    }

    fn write_data<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), ProtocolError> {
        serde_json::to_writer((&mut self.writer).writer(), value)?;
        self.writer.put_u8(FIELD_SEPARATOR);
        Ok(())
    }

    fn write_encoded(&mut self, encoded: &[u8]) -> Result<(), ProtocolError> {
        if encoded.contains(&FIELD_SEPARATOR) {
            return Err(ProtocolError::Invalid(
                "encoded JSON value contains a field separator".into(),
            ));
        }
        self.writer.extend_from_slice(encoded);
        self.writer.put_u8(FIELD_SEPARATOR);
        Ok(())
    }

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes, ProtocolError> {
        let data = serde_json::to_vec(value)?;
        check_frame_size(data.len())?;
        Ok(Bytes::from(data))
    }
}
