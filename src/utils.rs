//! Utility functions

use crc32fast::Hasher;

/// Calculate checksum (CRC32) for data
pub fn calculate_checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Format byte size in human-readable form
pub fn format_bytes(bytes: usize) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];

    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

/// Store key of a chunk: `<array>/c/<i>/<j>/.../<sample block>`
pub fn chunk_key(array: &str, coord: &[usize], sample_block: usize) -> String {
    let mut key = format!("{}/c", array);
    for c in coord.iter().chain(std::iter::once(&sample_block)) {
        key.push('/');
        key.push_str(&c.to_string());
    }
    key
}

/// Ceiling division
pub fn div_ceil(value: usize, divisor: usize) -> usize {
    debug_assert!(divisor > 0);
    (value + divisor - 1) / divisor
}

/// Pack booleans into bytes, least significant bit first
pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut packed = vec![0u8; div_ceil(bits.len(), 8)];
    for (i, &bit) in bits.iter().enumerate() {
        if bit {
            packed[i / 8] |= 1 << (i % 8);
        }
    }
    packed
}

/// Unpack `len` booleans packed by [`pack_bits`]
pub fn unpack_bits(packed: &[u8], len: usize) -> Option<Vec<bool>> {
    if packed.len() != div_ceil(len, 8) {
        return None;
    }
    Some(
        (0..len)
            .map(|i| packed[i / 8] & (1 << (i % 8)) != 0)
            .collect(),
    )
}

/// Row-major strides for a shape
pub fn row_major_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}
