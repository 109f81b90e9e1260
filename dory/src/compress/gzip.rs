use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use super::{CompressionCodec, CompressionError};

/// Gzip via flate2. Levels 0..=9, default 6 when unspecified.
pub struct GzipCodec;

impl CompressionCodec for GzipCodec {
    fn real_level(&self, requested: Option<i32>) -> Result<Option<i32>, CompressionError> {
        match requested {
            None => Ok(None),
            Some(level @ 0..=9) => Ok(Some(level)),
            Some(level) => Err(CompressionError::BadLevel(level)),
        }
    }

    fn max_compressed_size(&self, uncompressed_size: usize) -> usize {
        // deflate worst case plus gzip header and trailer
        uncompressed_size + uncompressed_size / 1000 + 32
    }

    fn compress(
        &self,
        input: &[u8],
        output: &mut Vec<u8>,
        level: Option<i32>,
    ) -> Result<usize, CompressionError> {
        let level = match self.real_level(level)? {
            Some(level) => Compression::new(level as u32),
            None => Compression::default(),
        };

        let before = output.len();
        let mut encoder = GzEncoder::new(&mut *output, level);
        encoder
            .write_all(input)
            .map_err(|e| CompressionError::CompressFailed(e.to_string()))?;
        encoder
            .finish()
            .map_err(|e| CompressionError::CompressFailed(e.to_string()))?;
        Ok(output.len() - before)
    }

    fn max_uncompressed_size(&self, input: &[u8]) -> Result<usize, CompressionError> {
        // The gzip trailer stores the uncompressed length mod 2^32.
        if input.len() < 4 {
            return Err(CompressionError::MalformedInput);
        }
        let isize_bytes: [u8; 4] = input[input.len() - 4..]
            .try_into()
            .expect("slice is 4 bytes");
        Ok(u32::from_le_bytes(isize_bytes) as usize)
    }

    fn decompress(&self, input: &[u8], output: &mut Vec<u8>) -> Result<usize, CompressionError> {
        let before = output.len();
        GzDecoder::new(input)
            .read_to_end(output)
            .map_err(|e| CompressionError::DecompressFailed(e.to_string()))?;
        Ok(output.len() - before)
    }
}
