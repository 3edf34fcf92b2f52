//! MessagePack encoder, the default wire format.

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Cursor;

use crate::codec::{check_frame_size, Encoder, ProtocolError};

/// Initial write buffer capacity.
const WRITE_BUFFER_CAPACITY: usize = 4096;

/// MessagePack encoder.
///
/// Fields are written back to back as MessagePack values. Payload structs
/// are encoded as maps with field names, so both sides can evolve their
/// models independently as long as they agree on names.
#[derive(Debug, Clone, Default)]
pub struct MsgPackEncoder {
    reader: Cursor<Bytes>,
    writer: BytesMut,
}

impl MsgPackEncoder {
    /// Create a new encoder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            reader: Cursor::new(Bytes::new()),
            writer: BytesMut::with_capacity(WRITE_BUFFER_CAPACITY),
        }
    }
}

impl Encoder for MsgPackEncoder {
    fn name(&self) -> &'static str {
        "msgpack"
    }

    fn reset_reader(&mut self, frame: Bytes) {
        self.reader = Cursor::new(frame);
    }

    fn reset_writer(&mut self) {
        self.writer.clear();
    }

    fn flush(&mut self) -> Result<Bytes, ProtocolError> {
        check_frame_size(self.writer.len())?;
        Ok(self.writer.split().freeze())
    }

    fn read_string(&mut self) -> Result<String, ProtocolError> {
        Ok(rmp_serde::from_read(&mut self.reader)?)
    }

    fn read_data<T: DeserializeOwned>(&mut self, target: &mut T) -> Result<(), ProtocolError> {
        *target = rmp_serde::from_read(&mut self.reader)?;
        Ok(())
    }

    fn write_string(&mut self, value: &str) -> Result<(), ProtocolError> {
        let mut out = (&mut self.writer).writer();
        rmp_serde::encode::write(&mut out, value)?;
        Ok(())
    }

    fn write_data<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), ProtocolError> {
        let mut out = (&mut self.writer).writer();
        rmp_serde::encode::write_named(&mut out, value)?;
        Ok(())
    }

    fn write_encoded(&mut self, encoded: &[u8]) -> Result<(), ProtocolError> {
        self.writer.extend_from_slice(encoded);
        Ok(())
    }

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes, ProtocolError> {
        let data = rmp_serde::to_vec_named(value)?;
        check_frame_size(data.len())?;
        Ok(Bytes::from(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Chat {
        room: String,
        text: String,
        seq: u32,
    }

    #[test]
    fn test_fields_in_order() {
        let mut enc = MsgPackEncoder::new();
        let chat = Chat {
            room: "lobby".into(),
            text: "hello".into(),
            seq: 7,
        };

        enc.reset_writer();
        enc.write_string("id-1").unwrap();
        enc.write_string("chat:send").unwrap();
        enc.write_data(&chat).unwrap();
        let frame = enc.flush().unwrap();

        enc.reset_reader(frame);
        assert_eq!(enc.read_string().unwrap(), "id-1");
        assert_eq!(enc.read_string().unwrap(), "chat:send");

        let mut decoded = Chat::default();
        enc.read_data(&mut decoded).unwrap();
        assert_eq!(decoded, chat);
    }

    #[test]
    fn test_flush_resets_buffer() {
        let mut enc = MsgPackEncoder::new();
        enc.write_string("first").unwrap();
        let first = enc.flush().unwrap();

        enc.reset_writer();
        enc.write_string("second").unwrap();
        let second = enc.flush().unwrap();

        enc.reset_reader(second);
        assert_eq!(enc.read_string().unwrap(), "second");
        enc.reset_reader(first);
        assert_eq!(enc.read_string().unwrap(), "first");
    }

    #[test]
    fn test_encoded_splice() {
        let mut enc = MsgPackEncoder::new();
        let payload = enc.encode(&vec![1u8, 2, 3]).unwrap();

        enc.write_string("topic").unwrap();
        enc.write_encoded(&payload).unwrap();
        let frame = enc.flush().unwrap();

        enc.reset_reader(frame);
        assert_eq!(enc.read_string().unwrap(), "topic");
        let mut data: Vec<u8> = Vec::new();
        enc.read_data(&mut data).unwrap();
        assert_eq!(data, vec![1, 2, 3]);
    }

    #[test]
    fn test_read_past_end() {
        let mut enc = MsgPackEncoder::new();
        enc.write_string("only").unwrap();
        let frame = enc.flush().unwrap();

        enc.reset_reader(frame);
        enc.read_string().unwrap();
        assert!(matches!(enc.read_string(), Err(ProtocolError::Decode(_))));
    }

    #[test]
    fn test_type_mismatch() {
        let mut enc = MsgPackEncoder::new();
        enc.write_data(&42u64).unwrap();
        let frame = enc.flush().unwrap();

        enc.reset_reader(frame);
        let mut chat = Chat::default();
        assert!(enc.read_data(&mut chat).is_err());
    }
}
