use bytes::{BufMut, BytesMut};
use thiserror::Error;

use super::produce::{get_string, patch_i32, put_string, ProduceDecodeError};
use crate::wire::{self, WireError};

/// Kafka metadata API, version 0. An empty topic list requests every
/// topic; a single-topic request against a cluster with auto-create
/// enabled doubles as the topic creation call.
pub const API_KEY_METADATA: i16 = 3;
pub const API_VERSION: i16 = 0;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MetadataDecodeError {
    #[error("truncated data")]
    Truncated,
    #[error("bad string size")]
    BadString,
    #[error("bad broker count {0}")]
    BadBrokerCount(i32),
    #[error("bad topic count {0}")]
    BadTopicCount(i32),
    #[error("bad partition count {0}")]
    BadPartitionCount(i32),
    #[error("bad replica count {0}")]
    BadReplicaCount(i32),
    #[error("bad port {0}")]
    BadPort(i32),
    #[error("{0} trailing bytes")]
    TrailingBytes(usize),
}

impl From<WireError> for MetadataDecodeError {
    fn from(_: WireError) -> MetadataDecodeError {
        MetadataDecodeError::Truncated
    }
}

impl From<ProduceDecodeError> for MetadataDecodeError {
    fn from(err: ProduceDecodeError) -> MetadataDecodeError {
        match err {
            ProduceDecodeError::Truncated => MetadataDecodeError::Truncated,
            _ => MetadataDecodeError::BadString,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMeta {
    pub node_id: i32,
    pub host: String,
    pub port: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionMeta {
    pub error_code: i16,
    pub id: i32,
    pub leader: i32,
    pub replicas: Vec<i32>,
    pub isr: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMeta {
    pub error_code: i16,
    pub name: String,
    pub partitions: Vec<PartitionMeta>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataResponse {
    pub correlation_id: i32,
    pub brokers: Vec<BrokerMeta>,
    pub topics: Vec<TopicMeta>,
}

/// Version-selected metadata codec.
pub trait MetadataProtocol: Send + Sync {
    /// Serializes a length-prefixed metadata request. An empty `topics`
    /// slice asks for all topics.
    fn encode_request(&self, correlation_id: i32, client_id: &str, topics: &[&str], out: &mut BytesMut);

    /// Parses a response payload (the bytes after the length prefix).
    fn decode_response(&self, payload: &[u8]) -> Result<MetadataResponse, MetadataDecodeError>;
}

pub struct MetadataProtocolV0;

impl MetadataProtocol for MetadataProtocolV0 {
    fn encode_request(
        &self,
        correlation_id: i32,
        client_id: &str,
        topics: &[&str],
        out: &mut BytesMut,
    ) {
        let size_at = out.len();
        out.put_i32(0); // patched below
        out.put_i16(API_KEY_METADATA);
        out.put_i16(API_VERSION);
        out.put_i32(correlation_id);
        put_string(out, client_id);
        out.put_i32(topics.len() as i32);
        for topic in topics {
            put_string(out, topic);
        }
        patch_i32(out, size_at, (out.len() - size_at - 4) as i32);
    }

    fn decode_response(&self, payload: &[u8]) -> Result<MetadataResponse, MetadataDecodeError> {
        let mut cursor = payload;
        let correlation_id = wire::get_i32(&mut cursor)?;

        let broker_count = wire::get_i32(&mut cursor)?;
        if broker_count < 0 {
            return Err(MetadataDecodeError::BadBrokerCount(broker_count));
        }
        let mut brokers = Vec::with_capacity(broker_count as usize);
        for _ in 0..broker_count {
            let node_id = wire::get_i32(&mut cursor)?;
            let host = get_string(&mut cursor)?;
            let port = wire::get_i32(&mut cursor)?;
            if !(0..=i32::from(u16::MAX)).contains(&port) {
                return Err(MetadataDecodeError::BadPort(port));
            }
            brokers.push(BrokerMeta {
                node_id,
                host,
                port,
            });
        }

        let topic_count = wire::get_i32(&mut cursor)?;
        if topic_count < 0 {
            return Err(MetadataDecodeError::BadTopicCount(topic_count));
        }
        let mut topics = Vec::with_capacity(topic_count as usize);
        for _ in 0..topic_count {
            let error_code = wire::get_i16(&mut cursor)?;
            let name = get_string(&mut cursor)?;
            let partition_count = wire::get_i32(&mut cursor)?;
            if partition_count < 0 {
                return Err(MetadataDecodeError::BadPartitionCount(partition_count));
            }
            let mut partitions = Vec::with_capacity(partition_count as usize);
            for _ in 0..partition_count {
                let partition_error = wire::get_i16(&mut cursor)?;
                let id = wire::get_i32(&mut cursor)?;
                let leader = wire::get_i32(&mut cursor)?;
                let replicas = get_i32_array(&mut cursor)?;
                let isr = get_i32_array(&mut cursor)?;
                partitions.push(PartitionMeta {
                    error_code: partition_error,
                    id,
                    leader,
                    replicas,
                    isr,
                });
            }
            topics.push(TopicMeta {
                error_code,
                name,
                partitions,
            });
        }

        if !cursor.is_empty() {
            return Err(MetadataDecodeError::TrailingBytes(cursor.len()));
        }

        Ok(MetadataResponse {
            correlation_id,
            brokers,
            topics,
        })
    }
}

fn get_i32_array(cursor: &mut &[u8]) -> Result<Vec<i32>, MetadataDecodeError> {
    let count = wire::get_i32(cursor)?;
    if count < 0 {
        return Err(MetadataDecodeError::BadReplicaCount(count));
    }
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        out.push(wire::get_i32(cursor)?);
    }
    Ok(out)
}

/// The request fields the scripted broker needs to answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedMetadataRequest {
    pub correlation_id: i32,
    pub client_id: String,
    pub topics: Vec<String>,
}

pub fn decode_request_v0(payload: &[u8]) -> Result<DecodedMetadataRequest, MetadataDecodeError> {
    let mut cursor = payload;
    let _api_key = wire::get_i16(&mut cursor)?;
    let _api_version = wire::get_i16(&mut cursor)?;
    let correlation_id = wire::get_i32(&mut cursor)?;
    let client_id = get_string(&mut cursor)?;
    let topic_count = wire::get_i32(&mut cursor)?;
    if topic_count < 0 {
        return Err(MetadataDecodeError::BadTopicCount(topic_count));
    }
    let mut topics = Vec::with_capacity(topic_count as usize);
    for _ in 0..topic_count {
        topics.push(get_string(&mut cursor)?);
    }
    Ok(DecodedMetadataRequest {
        correlation_id,
        client_id,
        topics,
    })
}

/// Serializes a length-prefixed metadata response (test-broker side).
pub fn encode_response_v0(response: &MetadataResponse, out: &mut BytesMut) {
    let size_at = out.len();
    out.put_i32(0); // patched below
    out.put_i32(response.correlation_id);

    out.put_i32(response.brokers.len() as i32);
    for broker in &response.brokers {
        out.put_i32(broker.node_id);
        put_string(out, &broker.host);
        out.put_i32(broker.port);
    }

    out.put_i32(response.topics.len() as i32);
    for topic in &response.topics {
        out.put_i16(topic.error_code);
        put_string(out, &topic.name);
        out.put_i32(topic.partitions.len() as i32);
        for partition in &topic.partitions {
            out.put_i16(partition.error_code);
            out.put_i32(partition.id);
            out.put_i32(partition.leader);
            out.put_i32(partition.replicas.len() as i32);
            for replica in &partition.replicas {
                out.put_i32(*replica);
            }
            out.put_i32(partition.isr.len() as i32);
            for isr in &partition.isr {
                out.put_i32(*isr);
            }
        }
    }

    patch_i32(out, size_at, (out.len() - size_at - 4) as i32);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_response() -> MetadataResponse {
        MetadataResponse {
            correlation_id: 12,
            brokers: vec![
                BrokerMeta {
                    node_id: 1,
                    host: "kafka-1".into(),
                    port: 9092,
                },
                BrokerMeta {
                    node_id: 2,
                    host: "kafka-2".into(),
                    port: 9092,
                },
            ],
            topics: vec![TopicMeta {
                error_code: 0,
                name: "events".into(),
                partitions: vec![
                    PartitionMeta {
                        error_code: 0,
                        id: 0,
                        leader: 1,
                        replicas: vec![1, 2],
                        isr: vec![1],
                    },
                    PartitionMeta {
                        error_code: 0,
                        id: 1,
                        leader: 2,
                        replicas: vec![2, 1],
                        isr: vec![2, 1],
                    },
                ],
            }],
        }
    }

    #[test]
    fn response_round_trip() {
        let response = sample_response();
        let mut out = BytesMut::new();
        encode_response_v0(&response, &mut out);

        let declared = i32::from_be_bytes(out[0..4].try_into().unwrap()) as usize;
        assert_eq!(declared, out.len() - 4);

        let decoded = MetadataProtocolV0.decode_response(&out[4..]).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn request_round_trip() {
        let mut out = BytesMut::new();
        MetadataProtocolV0.encode_request(5, "dory", &["one", "two"], &mut out);

        let decoded = decode_request_v0(&out[4..]).unwrap();
        assert_eq!(decoded.correlation_id, 5);
        assert_eq!(decoded.client_id, "dory");
        assert_eq!(decoded.topics, vec!["one", "two"]);

        let mut all = BytesMut::new();
        MetadataProtocolV0.encode_request(6, "dory", &[], &mut all);
        assert!(decode_request_v0(&all[4..]).unwrap().topics.is_empty());
    }

    #[test]
    fn truncated_response_is_rejected() {
        let mut out = BytesMut::new();
        encode_response_v0(&sample_response(), &mut out);
        assert_eq!(
            MetadataProtocolV0.decode_response(&out[4..out.len() - 3]),
            Err(MetadataDecodeError::Truncated)
        );
    }
}
