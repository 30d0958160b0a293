//! Compression and decompression for chunk payloads

use crate::error::{IngestError, Result};
use crate::types::DataType;
use flate2::read::{DeflateDecoder, DeflateEncoder};
use flate2::Compression as FlateCompression;
use serde::{Deserialize, Serialize};
use std::io::Read;

/// Compression methods available to the chunk writer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum CompressionMethod {
    /// No compression
    None = 0,
    /// Deflate/ZIP compression
    Deflate = 1,
    /// Run-length encoding
    Rle = 2,
    /// Zstandard compression
    Zstd = 3,
    /// Lossy fixed-tolerance quantization followed by Zstandard
    Quantized = 4,
}

impl CompressionMethod {
    /// Whether decoded data is bit-identical to the input
    pub fn is_lossless(&self) -> bool {
        !matches!(self, CompressionMethod::Quantized)
    }

    /// Stable codec identifier written to the store descriptor
    pub fn id(&self) -> &'static str {
        match self {
            CompressionMethod::None => "none",
            CompressionMethod::Deflate => "deflate",
            CompressionMethod::Rle => "rle",
            CompressionMethod::Zstd => "zstd",
            CompressionMethod::Quantized => "quantized",
        }
    }
}

/// Compression level (0-9, where 0 is no compression and 9 is maximum)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionLevel(u8);

impl CompressionLevel {
    pub fn new(level: u8) -> Self {
        Self(level.min(9))
    }

    pub fn none() -> Self {
        Self(0)
    }

    pub fn fast() -> Self {
        Self(1)
    }

    pub fn best() -> Self {
        Self(9)
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl Default for CompressionLevel {
    fn default() -> Self {
        Self(6)
    }
}

/// Codec selection for one named array, as configured and as persisted
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CodecSpec {
    pub method: CompressionMethod,
    #[serde(default)]
    pub level: CompressionLevel,
    /// Absolute reconstruction tolerance, only used by lossy methods
    #[serde(default)]
    pub tolerance: f64,
}

impl CodecSpec {
    pub fn lossless(method: CompressionMethod) -> Self {
        Self {
            method,
            level: CompressionLevel::default(),
            tolerance: 0.0,
        }
    }

    pub fn quantized(tolerance: f64) -> Self {
        Self {
            method: CompressionMethod::Quantized,
            level: CompressionLevel::default(),
            tolerance,
        }
    }

    pub fn with_level(mut self, level: CompressionLevel) -> Self {
        self.level = level;
        self
    }

    /// Check the codec settings are usable for samples of `data_type`
    pub fn validate(&self, data_type: DataType) -> Result<()> {
        if self.method == CompressionMethod::Quantized {
            if !data_type.is_float() {
                return Err(IngestError::Configuration(format!(
                    "quantized codec requires floating point samples, got {}",
                    data_type
                )));
            }
            if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
                return Err(IngestError::Configuration(format!(
                    "quantized codec requires a positive tolerance, got {}",
                    self.tolerance
                )));
            }
        }
        Ok(())
    }

    /// Check the codec can store `fill_value` at absent cells
    pub fn validate_fill(&self, fill_value: f64) -> Result<()> {
        if self.method == CompressionMethod::Quantized {
            let scaled = (fill_value / self.tolerance).round();
            if !scaled.is_finite() || scaled.abs() >= i64::MAX as f64 {
                return Err(IngestError::Configuration(format!(
                    "fill value {} cannot be quantized at tolerance {}",
                    fill_value, self.tolerance
                )));
            }
        }
        Ok(())
    }

    /// Runtime parameters for samples of `data_type`
    pub fn params(&self, data_type: DataType) -> CodecParams {
        CodecParams {
            level: self.level,
            tolerance: self.tolerance,
            data_type,
        }
    }
}

impl Default for CodecSpec {
    fn default() -> Self {
        Self::lossless(CompressionMethod::Zstd)
    }
}

/// Parameters handed to a compressor for one buffer
#[derive(Debug, Clone, Copy)]
pub struct CodecParams {
    pub level: CompressionLevel,
    pub tolerance: f64,
    pub data_type: DataType,
}

/// Trait for compression/decompression operations
pub trait Compressor: Send + Sync {
    /// Compress data
    fn compress(&self, data: &[u8], params: &CodecParams) -> Result<Vec<u8>>;

    /// Decompress data
    fn decompress(&self, data: &[u8], params: &CodecParams) -> Result<Vec<u8>>;

    /// Get the compression method
    fn method(&self) -> CompressionMethod;
}

/// No compression
#[derive(Debug, Default)]
pub struct NoneCompressor;

impl Compressor for NoneCompressor {
    fn compress(&self, data: &[u8], _params: &CodecParams) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8], _params: &CodecParams) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn method(&self) -> CompressionMethod {
        CompressionMethod::None
    }
}

/// Deflate compression
#[derive(Debug, Default)]
pub struct DeflateCompressor;

impl Compressor for DeflateCompressor {
    fn compress(&self, data: &[u8], params: &CodecParams) -> Result<Vec<u8>> {
        let mut encoder =
            DeflateEncoder::new(data, FlateCompression::new(params.level.value() as u32));
        let mut compressed = Vec::new();
        encoder
            .read_to_end(&mut compressed)
            .map_err(|e| IngestError::Compression(e.to_string()))?;
        Ok(compressed)
    }

    fn decompress(&self, data: &[u8], _params: &CodecParams) -> Result<Vec<u8>> {
        let mut decoder = DeflateDecoder::new(data);
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| IngestError::Decompression(e.to_string()))?;
        Ok(decompressed)
    }

    fn method(&self) -> CompressionMethod {
        CompressionMethod::Deflate
    }
}

/// Zstandard compression
#[derive(Debug, Default)]
pub struct ZstdCompressor;

impl Compressor for ZstdCompressor {
    fn compress(&self, data: &[u8], params: &CodecParams) -> Result<Vec<u8>> {
        zstd::encode_all(data, params.level.value() as i32)
            .map_err(|e| IngestError::Compression(e.to_string()))
    }

    fn decompress(&self, data: &[u8], _params: &CodecParams) -> Result<Vec<u8>> {
        zstd::decode_all(data).map_err(|e| IngestError::Decompression(e.to_string()))
    }

    fn method(&self) -> CompressionMethod {
        CompressionMethod::Zstd
    }
}

/// Run-length encoding compressor
#[derive(Debug, Default)]
pub struct RleCompressor;

impl RleCompressor {
    fn compress_internal(data: &[u8]) -> Vec<u8> {
        if data.is_empty() {
            return Vec::new();
        }

        let mut compressed = Vec::new();
        let mut i = 0;

        while i < data.len() {
            let byte = data[i];
            let mut count = 1usize;

            while i + count < data.len() && data[i + count] == byte && count < 255 {
                count += 1;
            }

            // count (1 byte) + value (1 byte)
            compressed.push(count as u8);
            compressed.push(byte);

            i += count;
        }

        compressed
    }

    fn decompress_internal(data: &[u8]) -> Result<Vec<u8>> {
        if data.len() % 2 != 0 {
            return Err(IngestError::Decompression(
                "RLE data must have even length".to_string(),
            ));
        }

        let mut decompressed = Vec::new();

        for pair in data.chunks_exact(2) {
            let count = pair[0] as usize;
            let value = pair[1];
            decompressed.extend(std::iter::repeat(value).take(count));
        }

        Ok(decompressed)
    }
}

impl Compressor for RleCompressor {
    fn compress(&self, data: &[u8], _params: &CodecParams) -> Result<Vec<u8>> {
        Ok(Self::compress_internal(data))
    }

    fn decompress(&self, data: &[u8], _params: &CodecParams) -> Result<Vec<u8>> {
        Self::decompress_internal(data)
    }

    fn method(&self) -> CompressionMethod {
        CompressionMethod::Rle
    }
}

/// Lossy compressor: quantizes floats to multiples of the tolerance, delta
/// encodes the integers as zigzag varints and zstd-compresses the result.
///
/// Every reconstructed value lies within `tolerance / 2` of the input (plus
/// the rounding of the storage type).
#[derive(Debug, Default)]
pub struct QuantizedCompressor;

impl QuantizedCompressor {
    fn check(params: &CodecParams) -> Result<()> {
        if !params.data_type.is_float() {
            return Err(IngestError::Compression(format!(
                "quantized codec cannot encode {} samples",
                params.data_type
            )));
        }
        if !(params.tolerance.is_finite() && params.tolerance > 0.0) {
            return Err(IngestError::Compression(format!(
                "invalid quantization tolerance {}",
                params.tolerance
            )));
        }
        Ok(())
    }
}

fn zigzag(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

fn unzigzag(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

fn write_varint(mut v: u64, out: &mut Vec<u8>) {
    while v >= 0x80 {
        out.push((v as u8) | 0x80);
        v >>= 7;
    }
    out.push(v as u8);
}

fn read_varint(data: &[u8], pos: &mut usize) -> Result<u64> {
    let mut value = 0u64;
    let mut shift = 0;
    loop {
        let byte = *data
            .get(*pos)
            .ok_or_else(|| IngestError::Decompression("truncated varint".to_string()))?;
        *pos += 1;
        if shift >= 64 {
            return Err(IngestError::Decompression("varint overflow".to_string()));
        }
        value |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

impl Compressor for QuantizedCompressor {
    fn compress(&self, data: &[u8], params: &CodecParams) -> Result<Vec<u8>> {
        Self::check(params)?;
        let width = params.data_type.size_in_bytes();
        if data.len() % width != 0 {
            return Err(IngestError::Compression(
                "buffer length is not a multiple of the sample size".to_string(),
            ));
        }

        let mut encoded = Vec::with_capacity(data.len() / 2);
        let mut previous = 0i64;
        for element in data.chunks_exact(width) {
            let value = params.data_type.decode_f64(element);
            let scaled = (value / params.tolerance).round();
            if !scaled.is_finite() || scaled.abs() >= i64::MAX as f64 {
                return Err(IngestError::Compression(format!(
                    "sample {} cannot be quantized at tolerance {}",
                    value, params.tolerance
                )));
            }
            let q = scaled as i64;
            write_varint(zigzag(q.wrapping_sub(previous)), &mut encoded);
            previous = q;
        }

        zstd::encode_all(&encoded[..], params.level.value() as i32)
            .map_err(|e| IngestError::Compression(e.to_string()))
    }

    fn decompress(&self, data: &[u8], params: &CodecParams) -> Result<Vec<u8>> {
        Self::check(params).map_err(|e| IngestError::Decompression(e.to_string()))?;
        let encoded =
            zstd::decode_all(data).map_err(|e| IngestError::Decompression(e.to_string()))?;

        let mut out = Vec::with_capacity(encoded.len() * params.data_type.size_in_bytes());
        let mut pos = 0;
        let mut previous = 0i64;
        while pos < encoded.len() {
            let q = previous.wrapping_add(unzigzag(read_varint(&encoded, &mut pos)?));
            previous = q;
            let value = q as f64 * params.tolerance;
            let bytes = params
                .data_type
                .encode_f64(value)
                .map_err(|e| IngestError::Decompression(e.to_string()))?;
            out.extend_from_slice(&bytes);
        }
        Ok(out)
    }

    fn method(&self) -> CompressionMethod {
        CompressionMethod::Quantized
    }
}

/// Get a compressor for a given method
pub fn get_compressor(method: CompressionMethod) -> Box<dyn Compressor> {
    match method {
        CompressionMethod::None => Box::new(NoneCompressor),
        CompressionMethod::Deflate => Box::new(DeflateCompressor),
        CompressionMethod::Rle => Box::new(RleCompressor),
        CompressionMethod::Zstd => Box::new(ZstdCompressor),
        CompressionMethod::Quantized => Box::new(QuantizedCompressor),
    }
}

/// Compress on the blocking pool
pub async fn compress_blocking(spec: CodecSpec, data_type: DataType, data: Vec<u8>) -> Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || {
        get_compressor(spec.method).compress(&data, &spec.params(data_type))
    })
    .await
    .map_err(|e| IngestError::Compression(format!("compression task failed: {}", e)))?
}

/// Decompress on the blocking pool
pub async fn decompress_blocking(
    spec: CodecSpec,
    data_type: DataType,
    data: Vec<u8>,
) -> Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || {
        get_compressor(spec.method).decompress(&data, &spec.params(data_type))
    })
    .await
    .map_err(|e| IngestError::Decompression(format!("decompression task failed: {}", e)))?
}
