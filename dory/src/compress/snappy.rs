use super::{CompressionCodec, CompressionError};

/// Raw (unframed) Snappy, the encoding Kafka's message attribute 2 names.
pub struct SnappyCodec;

impl CompressionCodec for SnappyCodec {
    fn real_level(&self, _requested: Option<i32>) -> Result<Option<i32>, CompressionError> {
        // Snappy has no compression levels; a requested level is ignored.
        Ok(None)
    }

    fn max_compressed_size(&self, uncompressed_size: usize) -> usize {
        snap::raw::max_compress_len(uncompressed_size)
    }

    fn compress(
        &self,
        input: &[u8],
        output: &mut Vec<u8>,
        _level: Option<i32>,
    ) -> Result<usize, CompressionError> {
        let before = output.len();
        output.resize(before + snap::raw::max_compress_len(input.len()), 0);
        let written = snap::raw::Encoder::new()
            .compress(input, &mut output[before..])
            .map_err(|e| CompressionError::CompressFailed(e.to_string()))?;
        output.truncate(before + written);
        Ok(written)
    }

    fn max_uncompressed_size(&self, input: &[u8]) -> Result<usize, CompressionError> {
        snap::raw::decompress_len(input).map_err(|_| CompressionError::MalformedInput)
    }

    fn decompress(&self, input: &[u8], output: &mut Vec<u8>) -> Result<usize, CompressionError> {
        let len = self.max_uncompressed_size(input)?;
        let before = output.len();
        output.resize(before + len, 0);
        let written = snap::raw::Decoder::new()
            .decompress(input, &mut output[before..])
            .map_err(|e| CompressionError::DecompressFailed(e.to_string()))?;
        output.truncate(before + written);
        Ok(written)
    }
}
