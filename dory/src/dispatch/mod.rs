use std::sync::Arc;
use std::time::Duration;

use crate::batch::BatchingConfig;
use crate::compress::CompressionPolicy;
use crate::kafka::produce::ProduceProtocol;

mod connector;
mod dispatcher;

pub use connector::{ConnectorCommand, ConnectorReport, ConnectorState, ConnectorStatusBoard};
pub use dispatcher::{Dispatcher, DispatcherEvent, PauseReason};

/// Everything the produce path needs, fixed at startup and shared by the
/// dispatcher and every connector it spawns.
pub struct ProducerSettings {
    pub client_id: String,
    pub required_acks: i16,
    pub replication_timeout_ms: i32,
    pub message_max_bytes: usize,
    /// Batching target for folding multiple ready batches into one
    /// produce request. A single batch over the limit is still sent
    /// whole.
    pub produce_request_data_limit: usize,
    pub socket_timeout: Duration,
    pub max_failed_deliveries: u32,
    pub batching: BatchingConfig,
    pub compression: CompressionPolicy,
    pub protocol: Arc<dyn ProduceProtocol>,
}
