// src/compression.rs - Pluggable compression codecs for at-rest and in-flight payloads

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompressionError {
    #[error("Unsupported compression algorithm: {name}")]
    UnsupportedAlgorithm { name: String },
    #[error("Compression failed ({algorithm}): {reason}")]
    CompressFailed { algorithm: String, reason: String },
    #[error("Decompression failed ({algorithm}): {reason}")]
    DecompressFailed { algorithm: String, reason: String },
}

/// Compress/decompress for one named algorithm. Implementations carry no
/// knowledge of models or storage; malformed input is a typed error, never
/// a panic.
pub trait CompressionCodec: Send + Sync {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError>;
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError>;
    fn name(&self) -> &str;
    fn is_available(&self) -> bool {
        true
    }
}

impl std::fmt::Debug for dyn CompressionCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressionCodec")
            .field("name", &self.name())
            .finish()
    }
}

/// Identity codec. Always available, the guaranteed fallback when no real
/// algorithm is usable on the current build.
pub struct NoneCodec;

impl CompressionCodec for NoneCodec {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        Ok(data.to_vec())
    }

    fn name(&self) -> &str {
        "none"
    }
}

pub struct GzipCodec {
    level: u32,
}

impl GzipCodec {
    pub fn new() -> Self {
        Self { level: 6 }
    }
}

impl Default for GzipCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl CompressionCodec for GzipCodec {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        use flate2::read::GzEncoder;
        use flate2::Compression;

        let mut encoder = GzEncoder::new(data, Compression::new(self.level));
        let mut out = Vec::new();
        encoder
            .read_to_end(&mut out)
            .map_err(|e| CompressionError::CompressFailed {
                algorithm: "gzip".to_string(),
                reason: e.to_string(),
            })?;
        Ok(out)
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        use flate2::read::GzDecoder;

        let mut decoder = GzDecoder::new(data);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| CompressionError::DecompressFailed {
                algorithm: "gzip".to_string(),
                reason: e.to_string(),
            })?;
        Ok(out)
    }

    fn name(&self) -> &str {
        "gzip"
    }
}

pub struct ZstdCodec {
    level: i32,
}

impl ZstdCodec {
    pub fn new() -> Self {
        Self { level: 3 }
    }

    pub fn with_level(level: i32) -> Self {
        Self { level }
    }
}

impl Default for ZstdCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl CompressionCodec for ZstdCodec {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        zstd::stream::encode_all(data, self.level).map_err(|e| {
            CompressionError::CompressFailed {
                algorithm: "zstd".to_string(),
                reason: e.to_string(),
            }
        })
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        zstd::stream::decode_all(data).map_err(|e| CompressionError::DecompressFailed {
            algorithm: "zstd".to_string(),
            reason: e.to_string(),
        })
    }

    fn name(&self) -> &str {
        "zstd"
    }
}

/// Registry of codecs keyed by algorithm name. Lookups for unknown or
/// unavailable algorithms fail before any I/O is attempted.
pub struct CodecRegistry {
    codecs: HashMap<String, Arc<dyn CompressionCodec>>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self {
            codecs: HashMap::new(),
        }
    }

    /// Registry with the standard codec set: none, gzip, zstd.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(NoneCodec));
        registry.register(Arc::new(GzipCodec::new()));
        registry.register(Arc::new(ZstdCodec::new()));
        registry
    }

    pub fn register(&mut self, codec: Arc<dyn CompressionCodec>) {
        self.codecs.insert(codec.name().to_string(), codec);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn CompressionCodec>, CompressionError> {
        match self.codecs.get(name) {
            Some(codec) if codec.is_available() => Ok(codec.clone()),
            _ => Err(CompressionError::UnsupportedAlgorithm {
                name: name.to_string(),
            }),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.codecs
            .get(name)
            .map(|c| c.is_available())
            .unwrap_or(false)
    }

    pub fn names(&self) -> Vec<String> {
        self.codecs
            .values()
            .filter(|c| c.is_available())
            .map(|c| c.name().to_string())
            .collect()
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
