//! A scripted in-process broker speaking just enough metadata v0 and
//! produce v0 to exercise the daemon end to end.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use dory::kafka::metadata::{
    self as kafka_metadata, BrokerMeta, MetadataResponse, PartitionMeta, TopicMeta,
};
use dory::kafka::produce::{self, PartitionAck, ProduceResponse};

/// Client-side framing, the words a real Dory client library would put
/// on the wire.
pub fn any_partition_frame(timestamp: i64, topic: &str, key: &[u8], value: &[u8]) -> Vec<u8> {
    client_frame(256, None, timestamp, topic, key, value)
}

pub fn partition_key_frame(
    partition_key: i32,
    timestamp: i64,
    topic: &str,
    key: &[u8],
    value: &[u8],
) -> Vec<u8> {
    client_frame(257, Some(partition_key), timestamp, topic, key, value)
}

fn client_frame(
    api_key: i16,
    partition_key: Option<i32>,
    timestamp: i64,
    topic: &str,
    key: &[u8],
    value: &[u8],
) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&0i32.to_be_bytes());
    out.extend_from_slice(&api_key.to_be_bytes());
    out.extend_from_slice(&0i16.to_be_bytes()); // version
    out.extend_from_slice(&0u16.to_be_bytes()); // flags
    if let Some(partition_key) = partition_key {
        out.extend_from_slice(&partition_key.to_be_bytes());
    }
    out.extend_from_slice(&timestamp.to_be_bytes());
    out.extend_from_slice(&(topic.len() as i16).to_be_bytes());
    out.extend_from_slice(topic.as_bytes());
    out.extend_from_slice(&(key.len() as i32).to_be_bytes());
    out.extend_from_slice(key);
    out.extend_from_slice(&(value.len() as i32).to_be_bytes());
    out.extend_from_slice(value);

    let size = out.len() as i32;
    out[0..4].copy_from_slice(&size.to_be_bytes());
    out
}

/// Cluster topology the brokers serve: broker (id, host, port) triples
/// and per-topic (partition, leader id) lists. Shared and mutable so a
/// test can move leadership mid-flight.
#[derive(Clone)]
pub struct Topology {
    pub brokers: Vec<(i32, String, u16)>,
    pub topics: Vec<(String, Vec<(i32, i32)>)>,
}

impl Topology {
    fn to_response(&self, correlation_id: i32) -> MetadataResponse {
        MetadataResponse {
            correlation_id,
            brokers: self
                .brokers
                .iter()
                .map(|(node_id, host, port)| BrokerMeta {
                    node_id: *node_id,
                    host: host.clone(),
                    port: i32::from(*port),
                })
                .collect(),
            topics: self
                .topics
                .iter()
                .map(|(name, partitions)| TopicMeta {
                    error_code: 0,
                    name: name.clone(),
                    partitions: partitions
                        .iter()
                        .map(|(id, leader)| PartitionMeta {
                            error_code: 0,
                            id: *id,
                            leader: *leader,
                            replicas: vec![*leader],
                            isr: vec![*leader],
                        })
                        .collect(),
                })
                .collect(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivered {
    pub topic: String,
    pub partition: i32,
    pub value: Vec<u8>,
}

pub struct BrokerScript {
    pub topology: Mutex<Topology>,
    /// Error codes injected into upcoming produce responses, one per
    /// request, applied to every partition in it. Empty means ack clean.
    pub produce_errors: Mutex<VecDeque<i16>>,
    /// Runs after each produce request this broker answers.
    #[allow(clippy::type_complexity)]
    pub on_produce: Mutex<Option<Box<dyn FnMut() + Send>>>,
}

/// One fake broker. Accepts any number of connections; each connection
/// serves metadata and produce requests against the shared script.
pub struct MockBroker {
    pub port: u16,
    pub script: Arc<BrokerScript>,
    delivered: Arc<Mutex<Vec<Delivered>>>,
    produce_requests: Arc<Mutex<usize>>,
}

impl MockBroker {
    pub async fn start(topology: Topology) -> MockBroker {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let script = Arc::new(BrokerScript {
            topology: Mutex::new(topology),
            produce_errors: Mutex::new(VecDeque::new()),
            on_produce: Mutex::new(None),
        });
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let produce_requests = Arc::new(Mutex::new(0));

        {
            let script = Arc::clone(&script);
            let delivered = Arc::clone(&delivered);
            let produce_requests = Arc::clone(&produce_requests);
            tokio::spawn(async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        return;
                    };
                    tokio::spawn(serve_conn(
                        stream,
                        Arc::clone(&script),
                        Arc::clone(&delivered),
                        Arc::clone(&produce_requests),
                    ));
                }
            });
        }

        MockBroker {
            port,
            script,
            delivered,
            produce_requests,
        }
    }

    pub fn delivered(&self) -> Vec<Delivered> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn produce_request_count(&self) -> usize {
        *self.produce_requests.lock().unwrap()
    }

    pub fn inject_produce_errors(&self, codes: &[i16]) {
        self.script
            .produce_errors
            .lock()
            .unwrap()
            .extend(codes.iter().copied());
    }
}

async fn serve_conn(
    mut stream: TcpStream,
    script: Arc<BrokerScript>,
    delivered: Arc<Mutex<Vec<Delivered>>>,
    produce_requests: Arc<Mutex<usize>>,
) {
    loop {
        let mut head = [0u8; 4];
        if stream.read_exact(&mut head).await.is_err() {
            return;
        }
        let size = i32::from_be_bytes(head);
        if size <= 0 {
            return;
        }
        let mut payload = vec![0u8; size as usize];
        if stream.read_exact(&mut payload).await.is_err() {
            return;
        }

        let api_key = i16::from_be_bytes([payload[0], payload[1]]);
        let mut reply = BytesMut::new();
        match api_key {
            kafka_metadata::API_KEY_METADATA => {
                let request = kafka_metadata::decode_request_v0(&payload).unwrap();
                let response = {
                    let mut topology = script.topology.lock().unwrap();
                    // A single-topic metadata request auto-creates the
                    // topic, like a broker with auto.create.topics.enable.
                    for name in &request.topics {
                        if !topology.topics.iter().any(|(t, _)| t == name) {
                            let leader = topology.brokers[0].0;
                            topology.topics.push((name.clone(), vec![(0, leader)]));
                        }
                    }
                    topology.to_response(request.correlation_id)
                };
                kafka_metadata::encode_response_v0(&response, &mut reply);
            }
            produce::API_KEY_PRODUCE => {
                let request = produce::decode_request_v0(&payload).unwrap();
                *produce_requests.lock().unwrap() += 1;
                let error_code = script
                    .produce_errors
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or(0);

                let mut acks = Vec::new();
                for topic in &request.topics {
                    for partition in &topic.partitions {
                        if error_code == 0 {
                            let mut delivered = delivered.lock().unwrap();
                            for entry in &partition.entries {
                                delivered.push(Delivered {
                                    topic: topic.topic.clone(),
                                    partition: partition.partition,
                                    value: entry.value.clone(),
                                });
                            }
                        }
                        acks.push(PartitionAck {
                            topic: topic.topic.clone(),
                            partition: partition.partition,
                            error_code,
                            offset: if error_code == 0 { 1 } else { -1 },
                        });
                    }
                }
                produce::encode_response_v0(
                    &ProduceResponse {
                        correlation_id: request.correlation_id,
                        acks,
                    },
                    &mut reply,
                );
                if let Some(hook) = script.on_produce.lock().unwrap().as_mut() {
                    hook();
                }
            }
            other => panic!("mock broker got unexpected api key {other}"),
        }

        if stream.write_all(&reply).await.is_err() {
            return;
        }
    }
}
