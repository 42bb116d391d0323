//! zlib chunk codec

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};

use super::ArrayError;

/// Compresses raw little-endian chunk buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkCodec {
    level: u32,
}

impl ChunkCodec {
    pub fn new(level: u32) -> Self {
        Self {
            level: level.min(9),
        }
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn encode(&self, raw: &[u8]) -> Result<Vec<u8>, ArrayError> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(self.level));
        encoder
            .write_all(raw)
            .map_err(|e| ArrayError::Codec(format!("compress failed: {}", e)))?;
        encoder
            .finish()
            .map_err(|e| ArrayError::Codec(format!("compress failed: {}", e)))
    }

    /// Decompress a chunk, requiring exactly `expected_len` bytes of output
    pub fn decode(&self, encoded: &[u8], expected_len: usize) -> Result<Vec<u8>, ArrayError> {
        let mut raw = Vec::with_capacity(expected_len);
        ZlibDecoder::new(encoded)
            .read_to_end(&mut raw)
            .map_err(|e| ArrayError::Codec(format!("decompress failed: {}", e)))?;

        if raw.len() != expected_len {
            return Err(ArrayError::Codec(format!(
                "decoded chunk has {} bytes, expected {}",
                raw.len(),
                expected_len
            )));
        }
        Ok(raw)
    }
}

impl Default for ChunkCodec {
    fn default() -> Self {
        Self::new(6)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode() {
        let codec = ChunkCodec::default();
        let raw: Vec<u8> = (0..4096u32).flat_map(|v| v.to_le_bytes()).collect();
        let encoded = codec.encode(&raw).unwrap();
        assert!(encoded.len() < raw.len());
        assert_eq!(codec.decode(&encoded, raw.len()).unwrap(), raw);
    }

    #[test]
    fn test_truncated_blob_fails() {
        let codec = ChunkCodec::default();
        let encoded = codec.encode(&[7u8; 1024]).unwrap();
        let torn = &encoded[..encoded.len() / 2];
        assert!(codec.decode(torn, 1024).is_err());
    }

    #[test]
    fn test_wrong_length_fails() {
        let codec = ChunkCodec::new(1);
        let encoded = codec.encode(&[1u8; 100]).unwrap();
        assert!(matches!(
            codec.decode(&encoded, 200),
            Err(ArrayError::Codec(_))
        ));
    }
}
