use bytes::{BufMut, BytesMut};
use thiserror::Error;

use crate::compress::{codec, CompressionError, CompressionType};
use crate::msg::Msg;
use crate::wire::{self, WireError};

/// Kafka produce API, version 0.
///
/// Requests are framed `size:i32 api_key:i16 api_version:i16
/// correlation_id:i32 client_id:str16` followed by topic, partition and
/// message-set segments. A v0 message-set entry is
/// `offset:i64 msg_size:i32 crc:u32 magic:i8 attributes:i8 key:bytes32
/// value:bytes32` with the CRC covering magic through value. A compressed
/// set is one wrapper entry whose value is the compressed inner set and
/// whose attributes byte names the codec.
pub const API_KEY_PRODUCE: i16 = 0;
pub const API_VERSION: i16 = 0;

/// crc + magic + attributes + key length + value length.
const MIN_MSG_SIZE: usize = 4 + 1 + 1 + 4 + 4;

/// Bytes one message adds to a message set beyond its key and value:
/// offset, size field, and `MIN_MSG_SIZE`. The batchers account bytes with
/// this so their caps track on-the-wire cost exactly.
pub const SINGLE_MSG_OVERHEAD: usize = 8 + 4 + MIN_MSG_SIZE;

#[derive(Debug, Error)]
pub enum ProduceEncodeError {
    #[error("failed to compress message set: {0}")]
    Compression(#[from] CompressionError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProduceDecodeError {
    #[error("truncated data")]
    Truncated,
    #[error("bad string size {0}")]
    BadStringSize(i16),
    #[error("string is not valid UTF-8")]
    StringNotUtf8,
    #[error("bad topic count {0}")]
    BadTopicCount(i32),
    #[error("bad partition count {0}")]
    BadPartitionCount(i32),
    #[error("bad message set size {0}")]
    BadMsgSetSize(i32),
    #[error("bad message size {0}")]
    BadMsgSize(i32),
    #[error("bad key size {0}")]
    BadKeySize(i32),
    #[error("bad value size {0}")]
    BadValueSize(i32),
    #[error("bad magic byte {0}")]
    BadMagic(i8),
    #[error("unknown compression attribute {0}")]
    UnknownCompression(u8),
    #[error("message CRC mismatch (stored {stored:#010x}, computed {computed:#010x})")]
    CrcMismatch { stored: u32, computed: u32 },
    #[error("failed to decompress message set: {0}")]
    Decompression(String),
    #[error("{0} trailing bytes")]
    TrailingBytes(usize),
}

impl From<WireError> for ProduceDecodeError {
    fn from(_: WireError) -> ProduceDecodeError {
        ProduceDecodeError::Truncated
    }
}

/// One produce request, borrowing the batches being sent.
pub struct ProduceRequest<'a> {
    pub correlation_id: i32,
    pub client_id: &'a str,
    pub required_acks: i16,
    pub replication_timeout_ms: i32,
    pub topics: Vec<TopicData<'a>>,
}

pub struct TopicData<'a> {
    pub topic: &'a str,
    pub partitions: Vec<PartitionData<'a>>,
}

pub struct PartitionData<'a> {
    pub partition: i32,
    pub compression: CompressionType,
    pub compression_level: Option<i32>,
    pub msgs: &'a [Msg],
}

/// One per-partition result from a produce response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionAck {
    pub topic: String,
    pub partition: i32,
    pub error_code: i16,
    pub offset: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProduceResponse {
    pub correlation_id: i32,
    pub acks: Vec<PartitionAck>,
}

/// Version-selected produce codec (design: one trait, versioned leaves,
/// chosen once at startup).
pub trait ProduceProtocol: Send + Sync {
    fn single_msg_overhead(&self) -> usize;

    /// Serializes a complete, length-prefixed produce request.
    fn encode_request(
        &self,
        request: &ProduceRequest<'_>,
        out: &mut BytesMut,
    ) -> Result<(), ProduceEncodeError>;

    /// Parses a response payload (the bytes after the length prefix).
    fn decode_response(&self, payload: &[u8]) -> Result<ProduceResponse, ProduceDecodeError>;
}

pub struct ProduceProtocolV0;

impl ProduceProtocol for ProduceProtocolV0 {
    fn single_msg_overhead(&self) -> usize {
        SINGLE_MSG_OVERHEAD
    }

    fn encode_request(
        &self,
        request: &ProduceRequest<'_>,
        out: &mut BytesMut,
    ) -> Result<(), ProduceEncodeError> {
        let size_at = out.len();
        out.put_i32(0); // patched once the request is fully written

        out.put_i16(API_KEY_PRODUCE);
        out.put_i16(API_VERSION);
        out.put_i32(request.correlation_id);
        put_string(out, request.client_id);
        out.put_i16(request.required_acks);
        out.put_i32(request.replication_timeout_ms);

        out.put_i32(request.topics.len() as i32);
        for topic in &request.topics {
            put_string(out, topic.topic);
            out.put_i32(topic.partitions.len() as i32);
            for partition in &topic.partitions {
                out.put_i32(partition.partition);
                write_message_set(out, partition)?;
            }
        }

        patch_i32(out, size_at, (out.len() - size_at - 4) as i32);
        Ok(())
    }

    fn decode_response(&self, payload: &[u8]) -> Result<ProduceResponse, ProduceDecodeError> {
        let mut cursor = payload;
        let correlation_id = wire::get_i32(&mut cursor)?;

        let topic_count = wire::get_i32(&mut cursor)?;
        if topic_count < 0 {
            return Err(ProduceDecodeError::BadTopicCount(topic_count));
        }

        let mut acks = Vec::new();
        for _ in 0..topic_count {
            let topic = get_string(&mut cursor)?;
            let partition_count = wire::get_i32(&mut cursor)?;
            if partition_count < 0 {
                return Err(ProduceDecodeError::BadPartitionCount(partition_count));
            }
            for _ in 0..partition_count {
                let partition = wire::get_i32(&mut cursor)?;
                let error_code = wire::get_i16(&mut cursor)?;
                let offset = wire::get_i64(&mut cursor)?;
                acks.push(PartitionAck {
                    topic: topic.clone(),
                    partition,
                    error_code,
                    offset,
                });
            }
        }

        if !cursor.is_empty() {
            return Err(ProduceDecodeError::TrailingBytes(cursor.len()));
        }

        Ok(ProduceResponse {
            correlation_id,
            acks,
        })
    }
}

fn write_message_set(
    out: &mut BytesMut,
    partition: &PartitionData<'_>,
) -> Result<(), ProduceEncodeError> {
    let set_size_at = out.len();
    out.put_i32(0); // patched below

    match codec(partition.compression) {
        None => {
            for msg in partition.msgs {
                write_msg_entry(out, msg);
            }
        }
        Some(codec) => {
            let mut inner = BytesMut::new();
            for msg in partition.msgs {
                write_msg_entry(&mut inner, msg);
            }

            let mut compressed = Vec::with_capacity(codec.max_compressed_size(inner.len()));
            codec.compress(&inner, &mut compressed, partition.compression_level)?;

            write_entry(
                out,
                partition.compression.attribute(),
                None,
                &[compressed.as_slice()],
            );
        }
    }

    patch_i32(out, set_size_at, (out.len() - set_size_at - 4) as i32);
    Ok(())
}

fn write_msg_entry(out: &mut BytesMut, msg: &Msg) {
    let key_parts: Vec<&[u8]> = msg.key_chunks().collect();
    let value_parts: Vec<&[u8]> = msg.value_chunks().collect();
    let key = if msg.key_size() == 0 {
        None
    } else {
        Some(key_parts.as_slice())
    };
    write_entry(out, 0, key, &value_parts);
}

/// Writes one message-set entry. `key` of `None` encodes the null key.
fn write_entry(out: &mut BytesMut, attributes: u8, key: Option<&[&[u8]]>, value: &[&[u8]]) {
    let key_len: usize = key.iter().flat_map(|parts| parts.iter()).map(|p| p.len()).sum();
    let value_len: usize = value.iter().map(|p| p.len()).sum();
    let msg_size = MIN_MSG_SIZE + key_len + value_len;

    let key_len_field: i32 = match key {
        None => -1,
        Some(_) => key_len as i32,
    };

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&[0u8]); // magic
    hasher.update(&[attributes]);
    hasher.update(&key_len_field.to_be_bytes());
    if let Some(parts) = key {
        for part in parts {
            hasher.update(part);
        }
    }
    hasher.update(&(value_len as i32).to_be_bytes());
    for part in value {
        hasher.update(part);
    }

    out.put_i64(0); // offset, ignored by brokers on produce
    out.put_i32(msg_size as i32);
    out.put_u32(hasher.finalize());
    out.put_i8(0); // magic
    out.put_u8(attributes);
    out.put_i32(key_len_field);
    if let Some(parts) = key {
        for part in parts {
            out.put_slice(part);
        }
    }
    out.put_i32(value_len as i32);
    for part in value {
        out.put_slice(part);
    }
}

/// One decoded message-set entry; compressed wrappers are expanded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgSetEntry {
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
}

/// A produce request parsed back into its tuples. Exercised by tests and
/// the scripted broker; the daemon itself only writes requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRequest {
    pub correlation_id: i32,
    pub client_id: String,
    pub required_acks: i16,
    pub replication_timeout_ms: i32,
    pub topics: Vec<DecodedTopic>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedTopic {
    pub topic: String,
    pub partitions: Vec<DecodedPartition>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPartition {
    pub partition: i32,
    pub entries: Vec<MsgSetEntry>,
}

/// Parses a produce request payload (after the length prefix).
pub fn decode_request_v0(payload: &[u8]) -> Result<DecodedRequest, ProduceDecodeError> {
    let mut cursor = payload;

    let _api_key = wire::get_i16(&mut cursor)?;
    let _api_version = wire::get_i16(&mut cursor)?;
    let correlation_id = wire::get_i32(&mut cursor)?;
    let client_id = get_string(&mut cursor)?;
    let required_acks = wire::get_i16(&mut cursor)?;
    let replication_timeout_ms = wire::get_i32(&mut cursor)?;

    let topic_count = wire::get_i32(&mut cursor)?;
    if topic_count < 0 {
        return Err(ProduceDecodeError::BadTopicCount(topic_count));
    }

    let mut topics = Vec::with_capacity(topic_count as usize);
    for _ in 0..topic_count {
        let topic = get_string(&mut cursor)?;
        let partition_count = wire::get_i32(&mut cursor)?;
        if partition_count < 0 {
            return Err(ProduceDecodeError::BadPartitionCount(partition_count));
        }

        let mut partitions = Vec::with_capacity(partition_count as usize);
        for _ in 0..partition_count {
            let partition = wire::get_i32(&mut cursor)?;
            let set_size = wire::get_i32(&mut cursor)?;
            if set_size < 0 {
                return Err(ProduceDecodeError::BadMsgSetSize(set_size));
            }
            let set = wire::take(&mut cursor, set_size as usize)?;
            partitions.push(DecodedPartition {
                partition,
                entries: decode_message_set(set)?,
            });
        }
        topics.push(DecodedTopic { topic, partitions });
    }

    if !cursor.is_empty() {
        return Err(ProduceDecodeError::TrailingBytes(cursor.len()));
    }

    Ok(DecodedRequest {
        correlation_id,
        client_id,
        required_acks,
        replication_timeout_ms,
        topics,
    })
}

/// Walks a message set, validating CRCs and expanding one level of
/// compression wrapper.
pub fn decode_message_set(data: &[u8]) -> Result<Vec<MsgSetEntry>, ProduceDecodeError> {
    let mut cursor = data;
    let mut entries = Vec::new();

    while !cursor.is_empty() {
        let offset = wire::get_i64(&mut cursor)?;
        let msg_size = wire::get_i32(&mut cursor)?;
        if msg_size < MIN_MSG_SIZE as i32 {
            return Err(ProduceDecodeError::BadMsgSize(msg_size));
        }
        let mut body = wire::take(&mut cursor, msg_size as usize)?;

        let stored_crc = wire::get_u32(&mut body)?;
        let computed = crc32fast::hash(body);
        if stored_crc != computed {
            return Err(ProduceDecodeError::CrcMismatch {
                stored: stored_crc,
                computed,
            });
        }

        let magic = wire::get_i8(&mut body)?;
        if magic != 0 {
            return Err(ProduceDecodeError::BadMagic(magic));
        }
        let attributes = wire::get_i8(&mut body)? as u8;
        let compression = CompressionType::from_attribute(attributes)
            .ok_or(ProduceDecodeError::UnknownCompression(attributes))?;

        let key_size = wire::get_i32(&mut body)?;
        let key = match key_size {
            -1 => None,
            n if n < 0 => return Err(ProduceDecodeError::BadKeySize(n)),
            n => Some(wire::take(&mut body, n as usize)?.to_vec()),
        };

        let value_size = wire::get_i32(&mut body)?;
        if value_size < 0 {
            return Err(ProduceDecodeError::BadValueSize(value_size));
        }
        let value = wire::take(&mut body, value_size as usize)?.to_vec();
        if !body.is_empty() {
            return Err(ProduceDecodeError::TrailingBytes(body.len()));
        }

        match compression {
            CompressionType::None => entries.push(MsgSetEntry { offset, key, value }),
            other => {
                let codec = codec(other).expect("non-None compression has a codec");
                let mut inner = Vec::new();
                codec
                    .decompress(&value, &mut inner)
                    .map_err(|e| ProduceDecodeError::Decompression(e.to_string()))?;
                entries.extend(decode_message_set(&inner)?);
            }
        }
    }

    Ok(entries)
}

/// Serializes a length-prefixed produce response (the scripted broker's
/// side of the conversation).
pub fn encode_response_v0(response: &ProduceResponse, out: &mut BytesMut) {
    let size_at = out.len();
    out.put_i32(0); // patched below
    out.put_i32(response.correlation_id);

    let mut by_topic: Vec<(&str, Vec<&PartitionAck>)> = Vec::new();
    for ack in &response.acks {
        match by_topic.iter_mut().find(|(t, _)| *t == ack.topic) {
            Some((_, list)) => list.push(ack),
            None => by_topic.push((&ack.topic, vec![ack])),
        }
    }

    out.put_i32(by_topic.len() as i32);
    for (topic, acks) in by_topic {
        put_string(out, topic);
        out.put_i32(acks.len() as i32);
        for ack in acks {
            out.put_i32(ack.partition);
            out.put_i16(ack.error_code);
            out.put_i64(ack.offset);
        }
    }

    patch_i32(out, size_at, (out.len() - size_at - 4) as i32);
}

pub(crate) fn put_string(out: &mut BytesMut, s: &str) {
    out.put_i16(s.len() as i16);
    out.put_slice(s.as_bytes());
}

pub(crate) fn get_string(cursor: &mut &[u8]) -> Result<String, ProduceDecodeError> {
    let size = wire::get_i16(cursor)?;
    if size < 0 {
        return Err(ProduceDecodeError::BadStringSize(size));
    }
    let bytes = wire::take(cursor, size as usize)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| ProduceDecodeError::StringNotUtf8)
}

pub(crate) fn patch_i32(out: &mut BytesMut, at: usize, value: i32) {
    out[at..at + 4].copy_from_slice(&value.to_be_bytes());
}
