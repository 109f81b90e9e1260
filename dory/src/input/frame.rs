use thiserror::Error;

use crate::msg::Routing;
use crate::wire::{self, WireError};

/// Client wire format: a length-prefixed record with an API key selecting
/// the routing flavor. All integers are big-endian.
///
/// ```text
/// total_size:i32  api_key:i16  api_version:i16  body
/// ```
///
/// Version-0 AnyPartition body:
/// `flags:u16 timestamp:i64 topic_size:i16 topic key_size:i32 key
/// value_size:i32 value`. The PartitionKey body inserts `partition_key:i32`
/// after `flags`.
pub const ANY_PARTITION_API_KEY: i16 = 256;
pub const PARTITION_KEY_API_KEY: i16 = 257;
pub const API_VERSION: i16 = 0;

/// Bytes before the version-specific body.
pub const FRAME_HEADER_SIZE: usize = 8;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InputError {
    #[error("truncated frame")]
    Truncated,
    #[error("frame size field {declared} does not match frame length {actual}")]
    SizeMismatch { declared: i32, actual: usize },
    #[error("bad frame size {0}")]
    BadSize(i32),
    #[error("unsupported API key {0}")]
    UnsupportedApiKey(i16),
    #[error("unsupported version {version} for API key {api_key}")]
    UnsupportedApiVersion { api_key: i16, version: i16 },
    #[error("bad topic size {0}")]
    BadTopicSize(i16),
    #[error("topic is not valid UTF-8")]
    TopicNotUtf8,
    #[error("bad key size {0}")]
    BadKeySize(i32),
    #[error("bad value size {0}")]
    BadValueSize(i32),
    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),
}

impl From<WireError> for InputError {
    fn from(_: WireError) -> InputError {
        InputError::Truncated
    }
}

/// A decoded client frame, borrowing from the receive buffer.
#[derive(Debug, PartialEq, Eq)]
pub struct InputFrame<'a> {
    pub routing: Routing,
    pub flags: u16,
    pub timestamp: i64,
    pub topic: &'a str,
    pub key: &'a [u8],
    pub value: &'a [u8],
}

/// Reads the leading size field of a frame, for stream reassembly.
pub fn declared_size(head: &[u8]) -> Result<usize, InputError> {
    let mut cursor = head;
    let size = wire::get_i32(&mut cursor)?;
    if size < FRAME_HEADER_SIZE as i32 {
        return Err(InputError::BadSize(size));
    }
    Ok(size as usize)
}

/// Decodes one complete frame. `frame` must span exactly the bytes the
/// size field declares; for datagram inputs that is the whole datagram.
pub fn decode(frame: &[u8]) -> Result<InputFrame<'_>, InputError> {
    let mut cursor = frame;

    let declared = wire::get_i32(&mut cursor)?;
    if declared < FRAME_HEADER_SIZE as i32 {
        return Err(InputError::BadSize(declared));
    }
    if declared as usize != frame.len() {
        return Err(InputError::SizeMismatch {
            declared,
            actual: frame.len(),
        });
    }

    let api_key = wire::get_i16(&mut cursor)?;
    if api_key != ANY_PARTITION_API_KEY && api_key != PARTITION_KEY_API_KEY {
        return Err(InputError::UnsupportedApiKey(api_key));
    }

    let version = wire::get_i16(&mut cursor)?;
    if version != API_VERSION {
        return Err(InputError::UnsupportedApiVersion { api_key, version });
    }

    let flags = wire::get_u16(&mut cursor)?;

    let routing = if api_key == PARTITION_KEY_API_KEY {
        Routing::PartitionKey(wire::get_i32(&mut cursor)?)
    } else {
        Routing::AnyPartition
    };

    let timestamp = wire::get_i64(&mut cursor)?;

    let topic_size = wire::get_i16(&mut cursor)?;
    if topic_size <= 0 {
        return Err(InputError::BadTopicSize(topic_size));
    }
    let topic_bytes = wire::take(&mut cursor, topic_size as usize)?;
    let topic = std::str::from_utf8(topic_bytes).map_err(|_| InputError::TopicNotUtf8)?;

    let key_size = wire::get_i32(&mut cursor)?;
    if key_size < 0 {
        return Err(InputError::BadKeySize(key_size));
    }
    let key = wire::take(&mut cursor, key_size as usize)?;

    let value_size = wire::get_i32(&mut cursor)?;
    if value_size < 0 {
        return Err(InputError::BadValueSize(value_size));
    }
    let value = wire::take(&mut cursor, value_size as usize)?;

    if !cursor.is_empty() {
        return Err(InputError::TrailingBytes(cursor.len()));
    }

    Ok(InputFrame {
        routing,
        flags,
        timestamp,
        topic,
        key,
        value,
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use bytes::BufMut;

    use super::*;

    /// Builds a well-formed frame; tests corrupt copies of it.
    pub fn encode(
        routing: Routing,
        timestamp: i64,
        topic: &str,
        key: &[u8],
        value: &[u8],
    ) -> Vec<u8> {
        let mut out = Vec::new();
        out.put_i32(0); // patched below
        match routing {
            Routing::AnyPartition => {
                out.put_i16(ANY_PARTITION_API_KEY);
                out.put_i16(API_VERSION);
                out.put_u16(0);
            }
            Routing::PartitionKey(partition_key) => {
                out.put_i16(PARTITION_KEY_API_KEY);
                out.put_i16(API_VERSION);
                out.put_u16(0);
                out.put_i32(partition_key);
            }
        }
        out.put_i64(timestamp);
        out.put_i16(topic.len() as i16);
        out.put_slice(topic.as_bytes());
        out.put_i32(key.len() as i32);
        out.put_slice(key);
        out.put_i32(value.len() as i32);
        out.put_slice(value);

        let size = out.len() as i32;
        out[0..4].copy_from_slice(&size.to_be_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::encode;
    use super::*;

    #[test]
    fn decodes_any_partition_frame() {
        let frame = encode(Routing::AnyPartition, 1_700_000_000_000, "t1", b"", b"hello");
        let decoded = decode(&frame).unwrap();
        assert_eq!(decoded.routing, Routing::AnyPartition);
        assert_eq!(decoded.timestamp, 1_700_000_000_000);
        assert_eq!(decoded.topic, "t1");
        assert_eq!(decoded.key, b"");
        assert_eq!(decoded.value, b"hello");
    }

    #[test]
    fn decodes_partition_key_frame() {
        let frame = encode(Routing::PartitionKey(42), 5, "t2", b"k", b"v");
        let decoded = decode(&frame).unwrap();
        assert_eq!(decoded.routing, Routing::PartitionKey(42));
        assert_eq!(decoded.key, b"k");
        assert_eq!(decoded.value, b"v");
    }

    #[test]
    fn rejects_bad_api_key_and_version() {
        let mut frame = encode(Routing::AnyPartition, 0, "t", b"", b"v");
        frame[4..6].copy_from_slice(&300i16.to_be_bytes());
        assert_eq!(decode(&frame), Err(InputError::UnsupportedApiKey(300)));

        let mut frame = encode(Routing::AnyPartition, 0, "t", b"", b"v");
        frame[6..8].copy_from_slice(&7i16.to_be_bytes());
        assert_eq!(
            decode(&frame),
            Err(InputError::UnsupportedApiVersion {
                api_key: ANY_PARTITION_API_KEY,
                version: 7
            })
        );
    }

    #[test]
    fn rejects_size_mismatch_and_truncation() {
        let frame = encode(Routing::AnyPartition, 0, "t", b"", b"value");
        assert_eq!(
            decode(&frame[..frame.len() - 1]),
            Err(InputError::SizeMismatch {
                declared: frame.len() as i32,
                actual: frame.len() - 1
            })
        );

        let mut oversized = frame.clone();
        let bogus = (frame.len() as i32) + 10;
        oversized[0..4].copy_from_slice(&bogus.to_be_bytes());
        assert!(matches!(
            decode(&oversized),
            Err(InputError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn rejects_empty_topic_and_trailing_bytes() {
        let mut frame = encode(Routing::AnyPartition, 0, "t", b"", b"v");
        // Zero out the topic size in place.
        let topic_size_at = 4 + 2 + 2 + 2 + 8;
        frame[topic_size_at..topic_size_at + 2].copy_from_slice(&0i16.to_be_bytes());
        assert!(matches!(decode(&frame), Err(InputError::BadTopicSize(0))));

        let mut padded = encode(Routing::AnyPartition, 0, "t", b"", b"v");
        padded.push(0xff);
        let size = padded.len() as i32;
        padded[0..4].copy_from_slice(&size.to_be_bytes());
        assert_eq!(decode(&padded), Err(InputError::TrailingBytes(1)));
    }

    #[test]
    fn declared_size_reads_prefix() {
        let frame = encode(Routing::AnyPartition, 0, "t", b"", b"v");
        assert_eq!(declared_size(&frame[..4]).unwrap(), frame.len());
        assert_eq!(declared_size(&[0, 0, 0, 2]), Err(InputError::BadSize(2)));
        assert_eq!(declared_size(&[0, 0]), Err(InputError::Truncated));
    }
}
