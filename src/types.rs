//! Core data types for trace ingestion

use crate::error::{IngestError, Result};
use bytes::Bytes;
use num_traits::{NumCast, ToPrimitive};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Data types supported for trace samples
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DataType {
    /// Unsigned 8-bit integer
    U8 = 1,
    /// Unsigned 16-bit integer
    U16 = 2,
    /// Unsigned 32-bit integer
    U32 = 3,
    /// Unsigned 64-bit integer
    U64 = 4,
    /// Signed 8-bit integer
    I8 = 5,
    /// Signed 16-bit integer
    I16 = 6,
    /// Signed 32-bit integer
    I32 = 7,
    /// Signed 64-bit integer
    I64 = 8,
    /// 32-bit floating point
    F32 = 9,
    /// 64-bit floating point
    F64 = 10,
}

impl DataType {
    /// Size in bytes of this data type
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DataType::U8 | DataType::I8 => 1,
            DataType::U16 | DataType::I16 => 2,
            DataType::U32 | DataType::I32 | DataType::F32 => 4,
            DataType::U64 | DataType::I64 | DataType::F64 => 8,
        }
    }

    /// Check if this is a floating point type
    pub fn is_float(&self) -> bool {
        matches!(self, DataType::F32 | DataType::F64)
    }

    /// Decode one little-endian element as `f64`.
    ///
    /// `bytes` must hold at least [`DataType::size_in_bytes`] bytes.
    pub fn decode_f64(&self, bytes: &[u8]) -> f64 {
        let value = match self {
            DataType::U8 => u8::read_le(bytes).to_f64(),
            DataType::U16 => u16::read_le(bytes).to_f64(),
            DataType::U32 => u32::read_le(bytes).to_f64(),
            DataType::U64 => u64::read_le(bytes).to_f64(),
            DataType::I8 => i8::read_le(bytes).to_f64(),
            DataType::I16 => i16::read_le(bytes).to_f64(),
            DataType::I32 => i32::read_le(bytes).to_f64(),
            DataType::I64 => i64::read_le(bytes).to_f64(),
            DataType::F32 => f32::read_le(bytes).to_f64(),
            DataType::F64 => Some(f64::read_le(bytes)),
        };
        value.unwrap_or(f64::NAN)
    }

    /// Encode a value as one little-endian element, failing if it does not fit.
    ///
    /// Integer types only accept integral values.
    pub fn encode_f64(&self, value: f64) -> Result<Vec<u8>> {
        if !self.is_float() && value.fract() != 0.0 {
            return Err(IngestError::Configuration(format!(
                "value {} is not an integer and cannot be stored as {}",
                value, self
            )));
        }

        fn cast<T: Sample>(value: f64) -> Result<Vec<u8>> {
            let typed: T = <T as NumCast>::from(value).ok_or_else(|| {
                IngestError::Configuration(format!(
                    "value {} is not representable as {}",
                    value,
                    T::DATA_TYPE
                ))
            })?;
            let mut out = Vec::with_capacity(T::DATA_TYPE.size_in_bytes());
            typed.write_le(&mut out);
            Ok(out)
        }

        match self {
            DataType::U8 => cast::<u8>(value),
            DataType::U16 => cast::<u16>(value),
            DataType::U32 => cast::<u32>(value),
            DataType::U64 => cast::<u64>(value),
            DataType::I8 => cast::<i8>(value),
            DataType::I16 => cast::<i16>(value),
            DataType::I32 => cast::<i32>(value),
            DataType::I64 => cast::<i64>(value),
            DataType::F32 => cast::<f32>(value),
            DataType::F64 => cast::<f64>(value),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Primitive sample element with a fixed little-endian layout
pub trait Sample: Copy + Send + Sync + ToPrimitive + NumCast + 'static {
    const DATA_TYPE: DataType;

    fn write_le(self, out: &mut Vec<u8>);

    /// Reads from the first `size_of::<Self>()` bytes of `bytes`.
    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! impl_sample {
    ($($ty:ty => $dt:ident),* $(,)?) => {
        $(
            impl Sample for $ty {
                const DATA_TYPE: DataType = DataType::$dt;

                fn write_le(self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }

                fn read_le(bytes: &[u8]) -> Self {
                    let mut buf = [0u8; std::mem::size_of::<$ty>()];
                    buf.copy_from_slice(&bytes[..std::mem::size_of::<$ty>()]);
                    <$ty>::from_le_bytes(buf)
                }
            }
        )*
    };
}

impl_sample!(
    u8 => U8, u16 => U16, u32 => U32, u64 => U64,
    i8 => I8, i16 => I16, i32 => I32, i64 => I64,
    f32 => F32, f64 => F64,
);

/// A fixed-length 1-D sample array in little-endian layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleBuffer {
    data_type: DataType,
    bytes: Bytes,
}

impl SampleBuffer {
    /// Wrap raw little-endian bytes
    pub fn from_bytes(data_type: DataType, bytes: impl Into<Bytes>) -> Result<Self> {
        let bytes = bytes.into();
        if bytes.len() % data_type.size_in_bytes() != 0 {
            return Err(IngestError::InvalidDimensions(format!(
                "{} bytes is not a whole number of {} samples",
                bytes.len(),
                data_type
            )));
        }
        Ok(Self { data_type, bytes })
    }

    /// Encode typed samples
    pub fn from_samples<T: Sample>(samples: &[T]) -> Self {
        let mut bytes = Vec::with_capacity(samples.len() * T::DATA_TYPE.size_in_bytes());
        for &s in samples {
            s.write_le(&mut bytes);
        }
        Self {
            data_type: T::DATA_TYPE,
            bytes: Bytes::from(bytes),
        }
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Number of samples
    pub fn len(&self) -> usize {
        self.bytes.len() / self.data_type.size_in_bytes()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Decode into typed samples; the element type must match
    pub fn to_vec<T: Sample>(&self) -> Result<Vec<T>> {
        if T::DATA_TYPE != self.data_type {
            return Err(IngestError::InvalidDimensions(format!(
                "buffer holds {} samples, requested {}",
                self.data_type,
                T::DATA_TYPE
            )));
        }
        Ok(self
            .bytes
            .chunks_exact(self.data_type.size_in_bytes())
            .map(T::read_le)
            .collect())
    }

    /// Decode every sample as `f64`
    pub fn to_f64_vec(&self) -> Vec<f64> {
        self.bytes
            .chunks_exact(self.data_type.size_in_bytes())
            .map(|b| self.data_type.decode_f64(b))
            .collect()
    }
}

/// One named grid dimension with its ordered, distinct header key values
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Axis {
    /// Name of the axis (e.g., "inline", "crossline")
    pub name: String,
    /// Unit of measurement (e.g., "trace", "m")
    pub unit: String,
    /// Key values in rank order
    pub values: Vec<i64>,
}

impl Axis {
    pub fn new(name: impl Into<String>, unit: impl Into<String>, values: Vec<i64>) -> Self {
        Self {
            name: name.into(),
            unit: unit.into(),
            values,
        }
    }

    /// Number of ranks along this axis
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Rank of a key value (linear scan; use the resolver's lookup on hot paths)
    pub fn rank_of(&self, value: i64) -> Option<usize> {
        self.values.iter().position(|&v| v == value)
    }

    /// Smallest and largest key value on this axis
    pub fn key_range(&self) -> Option<(i64, i64)> {
        let min = self.values.iter().min()?;
        let max = self.values.iter().max()?;
        Some((*min, *max))
    }
}

/// The trailing sample (time/depth) axis shared by every trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleAxis {
    /// Name of the axis (e.g., "sample", "time", "depth")
    pub name: String,
    /// Unit of measurement (e.g., "ms", "m")
    pub unit: String,
    /// Number of samples per trace
    pub count: usize,
    /// Coordinate of the first sample
    pub start: f64,
    /// Spacing between samples
    pub interval: f64,
}

impl SampleAxis {
    pub fn new(
        name: impl Into<String>,
        unit: impl Into<String>,
        count: usize,
        start: f64,
        interval: f64,
    ) -> Self {
        Self {
            name: name.into(),
            unit: unit.into(),
            count,
            start,
            interval,
        }
    }

    /// Convert sample index to coordinate
    pub fn index_to_coord(&self, index: usize) -> f64 {
        self.start + index as f64 * self.interval
    }

    /// Coordinate of the last sample
    pub fn end(&self) -> f64 {
        if self.count == 0 {
            self.start
        } else {
            self.index_to_coord(self.count - 1)
        }
    }
}

impl Default for SampleAxis {
    fn default() -> Self {
        Self::new("sample", "ms", 0, 0.0, 1.0)
    }
}

/// Value range
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

impl ValueRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }
}
