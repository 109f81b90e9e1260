use std::io::{Read, Write};

use lz4_flex::frame::{FrameDecoder, FrameEncoder};

use super::{CompressionCodec, CompressionError};

/// LZ4 frame format, the encoding Kafka's message attribute 3 names.
pub struct Lz4Codec;

impl CompressionCodec for Lz4Codec {
    fn real_level(&self, _requested: Option<i32>) -> Result<Option<i32>, CompressionError> {
        // lz4_flex exposes a single compression mode.
        Ok(None)
    }

    fn max_compressed_size(&self, uncompressed_size: usize) -> usize {
        // LZ4 block worst case plus frame header/footer slack.
        uncompressed_size + uncompressed_size / 255 + 64
    }

    fn compress(
        &self,
        input: &[u8],
        output: &mut Vec<u8>,
        _level: Option<i32>,
    ) -> Result<usize, CompressionError> {
        let before = output.len();
        let mut encoder = FrameEncoder::new(&mut *output);
        encoder
            .write_all(input)
            .map_err(|e| CompressionError::CompressFailed(e.to_string()))?;
        encoder
            .finish()
            .map_err(|e| CompressionError::CompressFailed(e.to_string()))?;
        Ok(output.len() - before)
    }

    fn max_uncompressed_size(&self, input: &[u8]) -> Result<usize, CompressionError> {
        // The frame format does not require a content-size field; fall back
        // to the format's worst-case expansion ratio.
        Ok(input.len().saturating_mul(255))
    }

    fn decompress(&self, input: &[u8], output: &mut Vec<u8>) -> Result<usize, CompressionError> {
        let before = output.len();
        FrameDecoder::new(input)
            .read_to_end(output)
            .map_err(|e| CompressionError::DecompressFailed(e.to_string()))?;
        Ok(output.len() - before)
    }
}
