use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;

mod gzip;
mod lz4;
mod snappy;

pub use gzip::GzipCodec;
pub use lz4::Lz4Codec;
pub use snappy::SnappyCodec;

/// Which codec a batch is (configured to be) compressed with. The wire
/// attribute values are fixed by the Kafka message format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CompressionType {
    None,
    Gzip,
    Snappy,
    Lz4,
}

impl CompressionType {
    pub fn as_str(self) -> &'static str {
        match self {
            CompressionType::None => "none",
            CompressionType::Gzip => "gzip",
            CompressionType::Snappy => "snappy",
            CompressionType::Lz4 => "lz4",
        }
    }

    /// Compression bits of the message attributes byte.
    pub fn attribute(self) -> u8 {
        match self {
            CompressionType::None => 0,
            CompressionType::Gzip => 1,
            CompressionType::Snappy => 2,
            CompressionType::Lz4 => 3,
        }
    }

    pub fn from_attribute(attr: u8) -> Option<CompressionType> {
        match attr & 0x07 {
            0 => Some(CompressionType::None),
            1 => Some(CompressionType::Gzip),
            2 => Some(CompressionType::Snappy),
            3 => Some(CompressionType::Lz4),
            _ => None,
        }
    }
}

impl FromStr for CompressionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "none" => Ok(CompressionType::None),
            "gzip" => Ok(CompressionType::Gzip),
            "snappy" => Ok(CompressionType::Snappy),
            "lz4" => Ok(CompressionType::Lz4),
            _ => Err(format!("unknown compression type: {s}")),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompressionError {
    #[error("compression level {0} is not valid for this codec")]
    BadLevel(i32),
    #[error("failed to compress: {0}")]
    CompressFailed(String),
    #[error("failed to decompress: {0}")]
    DecompressFailed(String),
    #[error("compressed input is malformed")]
    MalformedInput,
}

/// A compression codec leaf. Implementations are stateless singletons
/// chosen at startup from the configured `CompressionType`.
pub trait CompressionCodec: Send + Sync {
    /// Maps a requested level to what the codec will actually use.
    /// `None` means the codec default; codecs without levels return `None`.
    fn real_level(&self, requested: Option<i32>) -> Result<Option<i32>, CompressionError>;

    /// Upper bound on compressed output, for buffer preallocation.
    fn max_compressed_size(&self, uncompressed_size: usize) -> usize;

    /// Compresses `input`, appending to `output`. Returns bytes written.
    fn compress(
        &self,
        input: &[u8],
        output: &mut Vec<u8>,
        level: Option<i32>,
    ) -> Result<usize, CompressionError>;

    /// Upper bound on decompressed size for `input`.
    fn max_uncompressed_size(&self, input: &[u8]) -> Result<usize, CompressionError>;

    /// Decompresses `input`, appending to `output`. Returns bytes written.
    fn decompress(&self, input: &[u8], output: &mut Vec<u8>) -> Result<usize, CompressionError>;
}

/// Returns the singleton codec for a type, or `None` for uncompressed.
pub fn codec(compression_type: CompressionType) -> Option<&'static dyn CompressionCodec> {
    static GZIP: GzipCodec = GzipCodec;
    static SNAPPY: SnappyCodec = SnappyCodec;
    static LZ4: Lz4Codec = Lz4Codec;

    match compression_type {
        CompressionType::None => None,
        CompressionType::Gzip => Some(&GZIP),
        CompressionType::Snappy => Some(&SNAPPY),
        CompressionType::Lz4 => Some(&LZ4),
    }
}

/// Compressing small batches wastes CPU for no wire savings. A batch is
/// only compressed when its uncompressed size reaches the configured
/// percentage of `message_max_bytes`.
pub fn should_compress(
    uncompressed_size: usize,
    message_max_bytes: usize,
    size_threshold_percent: u32,
) -> bool {
    let threshold = (message_max_bytes as u64)
        .saturating_mul(u64::from(size_threshold_percent))
        / 100;
    uncompressed_size as u64 >= threshold
}

/// Codec and level for one topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopicCompression {
    pub codec: CompressionType,
    pub level: Option<i32>,
}

impl TopicCompression {
    pub fn none() -> TopicCompression {
        TopicCompression {
            codec: CompressionType::None,
            level: None,
        }
    }
}

/// Per-topic compression selection plus the size-threshold rule.
#[derive(Debug, Clone)]
pub struct CompressionPolicy {
    pub default: TopicCompression,
    pub overrides: std::collections::HashMap<String, TopicCompression>,
    pub size_threshold_percent: u32,
}

impl Default for CompressionPolicy {
    fn default() -> CompressionPolicy {
        CompressionPolicy {
            default: TopicCompression::none(),
            overrides: std::collections::HashMap::new(),
            size_threshold_percent: 75,
        }
    }
}

impl CompressionPolicy {
    /// What to do with one batch, given its uncompressed wire size.
    pub fn for_batch(
        &self,
        topic: &str,
        uncompressed_size: usize,
        message_max_bytes: usize,
    ) -> TopicCompression {
        let configured = self.overrides.get(topic).unwrap_or(&self.default);
        if configured.codec == CompressionType::None
            || !should_compress(
                uncompressed_size,
                message_max_bytes,
                self.size_threshold_percent,
            )
        {
            return TopicCompression::none();
        }
        *configured
    }
}
