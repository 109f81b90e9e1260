use std::collections::HashMap;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use envconfig::Envconfig;
use tracing::Level;

use crate::batch::{BatchConfig, BatchingConfig, TopicFilter};
use crate::compress::{CompressionPolicy, CompressionType, TopicCompression};
use crate::dispatch::ProducerSettings;
use crate::kafka::metadata::{MetadataProtocol, MetadataProtocolV0};
use crate::kafka::produce::{ProduceProtocol, ProduceProtocolV0};
use crate::limiters::{TopicRateLimiter, TopicRateSpec};
use crate::metadata_fetcher::RefresherConfig;
use crate::router::RouterConfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    /// UNIX datagram socket path clients send to.
    pub receive_socket_name: Option<String>,
    /// UNIX stream socket path.
    pub receive_stream_socket_name: Option<String>,
    /// Loopback TCP input port.
    pub input_port: Option<u16>,

    #[envconfig(default = "65536")]
    pub max_input_msg_size: usize,

    /// Raises the datagram cap to the kernel's usual ceiling so clients
    /// can send datagrams larger than `max_input_msg_size`.
    #[envconfig(default = "false")]
    pub allow_large_unix_datagrams: bool,

    /// Total buffer space for message bodies, in kilobytes. When it is
    /// gone, new messages are discarded until deliveries free blocks.
    #[envconfig(default = "65536")]
    pub msg_buffer_max_kb: usize,

    #[envconfig(default = "4096")]
    pub pool_block_size: usize,

    #[envconfig(default = "127.0.0.1:9090")]
    pub status_address: SocketAddr,

    #[envconfig(default = "true")]
    pub export_prometheus: bool,

    #[envconfig(default = "info")]
    pub log_level: Level,

    /// Anomaly-tracker reporting interval.
    #[envconfig(default = "30")]
    pub discard_report_interval_secs: u64,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub batch: BatchEnv,

    #[envconfig(nested = true)]
    pub compression: CompressionEnv,

    #[envconfig(nested = true)]
    pub topic_rate: TopicRateEnv,
}

#[derive(Envconfig, Clone)]
pub struct KafkaConfig {
    /// Bootstrap brokers, "host:port,host:port".
    pub kafka_hosts: String,

    #[envconfig(default = "dory")]
    pub kafka_client_id: String,

    #[envconfig(default = "-1")]
    pub kafka_required_acks: i16,

    #[envconfig(default = "10000")]
    pub kafka_replication_timeout_ms: i32,

    #[envconfig(default = "1000000")]
    pub kafka_message_max_bytes: usize,

    /// Batching target for folding ready batches into one produce
    /// request; a single larger batch still goes out whole.
    #[envconfig(default = "1048576")]
    pub kafka_produce_request_data_limit: usize,

    #[envconfig(default = "0")]
    pub kafka_produce_protocol_version: u8,

    #[envconfig(default = "0")]
    pub kafka_metadata_protocol_version: u8,

    #[envconfig(default = "900000")]
    pub kafka_metadata_refresh_interval_ms: u64,

    #[envconfig(default = "60000")]
    pub kafka_socket_timeout_ms: u64,

    #[envconfig(default = "true")]
    pub kafka_topic_autocreate: bool,

    #[envconfig(default = "5")]
    pub kafka_max_failed_delivery_attempts: u32,

    #[envconfig(default = "30000")]
    pub kafka_shutdown_max_delay_ms: u64,

    #[envconfig(default = "10000")]
    pub kafka_min_pause_delay_ms: u64,

    #[envconfig(default = "5000")]
    pub kafka_pause_rate_limit_initial_ms: u64,

    #[envconfig(default = "4")]
    pub kafka_pause_rate_limit_max_double: u32,
}

#[derive(Envconfig, Clone)]
pub struct BatchEnv {
    /// Default per-topic limit triple "time_ms:count:bytes"; a zero
    /// member is disabled, "disable" turns default batching off.
    #[envconfig(default = "1000:0:262144")]
    pub batch_default_topic: String,

    /// Per-topic overrides, "topic=time_ms:count:bytes,...".
    pub batch_topic_overrides_csv: Option<String>,

    #[envconfig(default = "false")]
    pub batch_combined_topics: bool,

    #[envconfig(default = "1000:0:262144")]
    pub batch_combined_config: String,

    /// Topics kept out of the combined batcher.
    pub batch_combined_exclude_csv: Option<String>,
}

#[derive(Envconfig, Clone)]
pub struct CompressionEnv {
    /// Default codec, "none", "gzip[:level]", "snappy", "lz4".
    #[envconfig(default = "none")]
    pub compression_default_topic: String,

    /// Per-topic overrides, "topic=codec[:level],...".
    pub compression_topic_overrides_csv: Option<String>,

    #[envconfig(default = "75")]
    pub compression_size_threshold_percent: u32,
}

#[derive(Envconfig, Clone)]
pub struct TopicRateEnv {
    /// Default rate "interval_ms:max_count", or "unlimited".
    #[envconfig(default = "unlimited")]
    pub topic_rate_default: String,

    /// Per-topic overrides, "topic=interval_ms:max_count,...".
    pub topic_rate_topic_overrides_csv: Option<String>,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.receive_socket_name.is_none()
            && self.receive_stream_socket_name.is_none()
            && self.input_port.is_none()
        {
            anyhow::bail!("no input sources configured");
        }
        if self.kafka.kafka_produce_protocol_version != 0 {
            anyhow::bail!(
                "unsupported produce protocol version {}",
                self.kafka.kafka_produce_protocol_version
            );
        }
        if self.kafka.kafka_metadata_protocol_version != 0 {
            anyhow::bail!(
                "unsupported metadata protocol version {}",
                self.kafka.kafka_metadata_protocol_version
            );
        }
        self.brokers()?;
        self.batching()?;
        self.compression_policy()?;
        self.topic_rate_specs()?;
        Ok(())
    }

    pub fn brokers(&self) -> anyhow::Result<Vec<(String, u16)>> {
        let mut brokers = Vec::new();
        for entry in self.kafka.kafka_hosts.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let (host, port) = match entry.rsplit_once(':') {
                Some((host, port)) => (
                    host.to_owned(),
                    port.parse::<u16>()
                        .map_err(|_| anyhow::anyhow!("bad broker port in {entry:?}"))?,
                ),
                None => (entry.to_owned(), 9092),
            };
            brokers.push((host, port));
        }
        if brokers.is_empty() {
            anyhow::bail!("no initial brokers configured");
        }
        Ok(brokers)
    }

    pub fn pool_block_count(&self) -> usize {
        (self.msg_buffer_max_kb * 1024) / self.pool_block_size.max(1)
    }

    pub fn batching(&self) -> anyhow::Result<BatchingConfig> {
        let default_topic = parse_batch_triple(&self.batch.batch_default_topic)?;

        let mut per_topic = HashMap::new();
        for (topic, value) in parse_overrides(self.batch.batch_topic_overrides_csv.as_deref()) {
            per_topic.insert(
                topic.to_owned(),
                parse_batch_triple(value)?.unwrap_or_default(),
            );
        }

        let combined = if self.batch.batch_combined_topics {
            parse_batch_triple(&self.batch.batch_combined_config)?
        } else {
            None
        };
        let combined_filter = match &self.batch.batch_combined_exclude_csv {
            Some(csv) => TopicFilter::exclude(
                csv.split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_owned),
            ),
            None => TopicFilter::all(),
        };

        Ok(BatchingConfig {
            per_topic,
            default_topic,
            combined,
            combined_filter,
        })
    }

    pub fn compression_policy(&self) -> anyhow::Result<CompressionPolicy> {
        if self.compression.compression_size_threshold_percent > 100 {
            anyhow::bail!("compression size threshold must be a percentage");
        }
        let default = parse_compression(&self.compression.compression_default_topic)?;
        let mut overrides = HashMap::new();
        for (topic, value) in
            parse_overrides(self.compression.compression_topic_overrides_csv.as_deref())
        {
            overrides.insert(topic.to_owned(), parse_compression(value)?);
        }
        Ok(CompressionPolicy {
            default,
            overrides,
            size_threshold_percent: self.compression.compression_size_threshold_percent,
        })
    }

    pub fn topic_rate_specs(
        &self,
    ) -> anyhow::Result<(TopicRateSpec, HashMap<String, TopicRateSpec>)> {
        let default = parse_rate(&self.topic_rate.topic_rate_default)?;
        let mut overrides = HashMap::new();
        for (topic, value) in
            parse_overrides(self.topic_rate.topic_rate_topic_overrides_csv.as_deref())
        {
            overrides.insert(topic.to_owned(), parse_rate(value)?);
        }
        Ok((default, overrides))
    }

    pub fn topic_rate_limiter(&self) -> anyhow::Result<TopicRateLimiter> {
        let (default, overrides) = self.topic_rate_specs()?;
        Ok(TopicRateLimiter::new(default, overrides))
    }

    pub fn produce_protocol(&self) -> Arc<dyn ProduceProtocol> {
        // Only v0 exists today; validate() already rejected the rest.
        Arc::new(ProduceProtocolV0)
    }

    pub fn metadata_protocol(&self) -> Arc<dyn MetadataProtocol> {
        Arc::new(MetadataProtocolV0)
    }

    pub fn producer_settings(&self) -> anyhow::Result<ProducerSettings> {
        Ok(ProducerSettings {
            client_id: self.kafka.kafka_client_id.clone(),
            required_acks: self.kafka.kafka_required_acks,
            replication_timeout_ms: self.kafka.kafka_replication_timeout_ms,
            message_max_bytes: self.kafka.kafka_message_max_bytes,
            produce_request_data_limit: self.kafka.kafka_produce_request_data_limit,
            socket_timeout: Duration::from_millis(self.kafka.kafka_socket_timeout_ms),
            max_failed_deliveries: self.kafka.kafka_max_failed_delivery_attempts,
            batching: self.batching()?,
            compression: self.compression_policy()?,
            protocol: self.produce_protocol(),
        })
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            topic_autocreate: self.kafka.kafka_topic_autocreate,
            message_max_bytes: self.kafka.kafka_message_max_bytes,
            min_pause_delay: Duration::from_millis(self.kafka.kafka_min_pause_delay_ms),
            pause_backoff_initial: Duration::from_millis(
                self.kafka.kafka_pause_rate_limit_initial_ms,
            ),
            pause_backoff_max_doublings: self.kafka.kafka_pause_rate_limit_max_double,
        }
    }

    pub fn refresher_config(&self) -> anyhow::Result<RefresherConfig> {
        Ok(RefresherConfig {
            client_id: self.kafka.kafka_client_id.clone(),
            refresh_interval: Duration::from_millis(self.kafka.kafka_metadata_refresh_interval_ms),
            socket_timeout: Duration::from_millis(self.kafka.kafka_socket_timeout_ms),
            retry_backoff_initial: Duration::from_millis(
                self.kafka.kafka_pause_rate_limit_initial_ms,
            ),
            retry_backoff_max_doublings: self.kafka.kafka_pause_rate_limit_max_double,
            initial_brokers: self.brokers()?,
        })
    }
}

/// "time_ms:count:bytes" with zero members disabled; "disable" turns
/// batching off entirely.
fn parse_batch_triple(value: &str) -> anyhow::Result<Option<BatchConfig>> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("disable") {
        return Ok(None);
    }
    let parts: Vec<&str> = value.split(':').collect();
    if parts.len() != 3 {
        anyhow::bail!("expected time:count:bytes, got {value:?}");
    }
    let time_ms: u64 = parts[0].trim().parse()?;
    let count: usize = parts[1].trim().parse()?;
    let bytes: usize = parts[2].trim().parse()?;

    let config = BatchConfig {
        time_limit: (time_ms > 0).then(|| Duration::from_millis(time_ms)),
        max_count: (count > 0).then_some(count),
        max_bytes: (bytes > 0).then_some(bytes),
    };
    if !config.is_enabled() {
        anyhow::bail!("batch config {value:?} disables all limits; use \"disable\" instead");
    }
    Ok(Some(config))
}

/// "codec" or "codec:level".
fn parse_compression(value: &str) -> anyhow::Result<TopicCompression> {
    let (codec, level) = match value.split_once(':') {
        Some((codec, level)) => (codec, Some(level.trim().parse::<i32>()?)),
        None => (value, None),
    };
    let codec: CompressionType = codec
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;
    if let (Some(level), Some(codec_impl)) = (level, crate::compress::codec(codec)) {
        codec_impl
            .real_level(Some(level))
            .map_err(|e| anyhow::anyhow!("{e}"))?;
    }
    Ok(TopicCompression { codec, level })
}

/// "interval_ms:max_count" or "unlimited".
fn parse_rate(value: &str) -> anyhow::Result<TopicRateSpec> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("unlimited") {
        return Ok(TopicRateSpec::unlimited());
    }
    let (interval, max_count) = value
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("expected interval_ms:max_count, got {value:?}"))?;
    let interval_ms: u64 = interval.trim().parse()?;
    let max_count: u32 = max_count.trim().parse()?;
    if interval_ms == 0 {
        anyhow::bail!("rate interval must be nonzero");
    }
    let max_count =
        NonZeroU32::new(max_count).ok_or_else(|| anyhow::anyhow!("rate max_count must be nonzero"))?;
    Ok(TopicRateSpec {
        interval: Duration::from_millis(interval_ms),
        max_count: Some(max_count),
    })
}

/// Splits "key=value,key=value" override CSVs, skipping empty entries.
fn parse_overrides(csv: Option<&str>) -> impl Iterator<Item = (&str, &str)> {
    csv.unwrap_or("")
        .split(',')
        .filter_map(|entry| entry.trim().split_once('='))
        .map(|(k, v)| (k.trim(), v.trim()))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// A config for tests, bypassing the environment.
    pub fn config(kafka_hosts: &str) -> Config {
        let vars: HashMap<String, String> =
            HashMap::from([("KAFKA_HOSTS".to_owned(), kafka_hosts.to_owned())]);
        let mut config = Config::init_from_hashmap(&vars).expect("default config is valid");
        config.receive_socket_name = Some("/tmp/dory.sock".to_owned());
        config
    }
}
