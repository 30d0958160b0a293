//! Ingestion configuration

use crate::compression::{CodecSpec, CompressionMethod};
use crate::coordinator::CoordinatorConfig;
use crate::error::{IngestError, Result};
use crate::grid::{AxisOrdering, CollisionPolicy, GridResolver};
use crate::io::StorageBackend;
use crate::overrides::GridOverride;
use crate::types::{DataType, SampleAxis};
use crate::writer::WriterSettings;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Everything needed to run one ingestion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Store location (`file://...`, `memory://` or a plain path)
    pub output_url: String,
    pub array_name: String,

    /// Header keys forming the grid, slowest axis first
    pub axis_keys: Vec<String>,
    pub axis_units: BTreeMap<String, String>,
    pub axis_ordering: BTreeMap<String, AxisOrdering>,
    /// Name, unit, start and interval of the sample axis; the count comes from the source
    pub sample_axis: SampleAxis,

    /// Chunk length per grid axis; defaults depend on the grid rank
    pub chunk_shape: Option<Vec<usize>>,
    /// Samples per chunk; whole traces when unset
    pub sample_chunk: Option<usize>,

    /// Expected sample type; checked against the source when set
    pub data_type: Option<DataType>,
    pub fill_value: f64,
    pub codec: CodecSpec,

    pub density_warn_threshold: f64,
    pub collision_policy: CollisionPolicy,
    pub grid_overrides: Vec<GridOverride>,

    pub best_effort: bool,
    pub read_concurrency: usize,
    pub max_in_flight: usize,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub chunk_timeout_ms: Option<u64>,

    /// Skip chunks already in the store
    pub resume: bool,
    /// Persist the header index and reuse it on the next run
    pub header_checkpoint: bool,

    /// Copied into the descriptor's custom metadata
    pub custom_attributes: BTreeMap<String, String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            output_url: "memory://".to_string(),
            array_name: "seismic".to_string(),
            axis_keys: vec!["inline".to_string(), "crossline".to_string()],
            axis_units: BTreeMap::new(),
            axis_ordering: BTreeMap::new(),
            sample_axis: SampleAxis::default(),
            chunk_shape: None,
            sample_chunk: None,
            data_type: None,
            fill_value: 0.0,
            codec: CodecSpec::default(),
            density_warn_threshold: 0.5,
            collision_policy: CollisionPolicy::Fail,
            grid_overrides: Vec::new(),
            best_effort: false,
            read_concurrency: 16,
            max_in_flight: 8,
            max_retries: 3,
            retry_backoff_ms: 100,
            max_backoff_ms: 5_000,
            chunk_timeout_ms: None,
            resume: false,
            header_checkpoint: false,
            custom_attributes: BTreeMap::new(),
        }
    }
}

impl IngestConfig {
    pub fn new(output_url: impl Into<String>) -> Self {
        Self {
            output_url: output_url.into(),
            ..Default::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| IngestError::Configuration(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&json)
    }

    pub fn with_axes<S: Into<String>>(mut self, keys: impl IntoIterator<Item = S>) -> Self {
        self.axis_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_axis_unit(mut self, axis: impl Into<String>, unit: impl Into<String>) -> Self {
        self.axis_units.insert(axis.into(), unit.into());
        self
    }

    pub fn with_axis_ordering(mut self, axis: impl Into<String>, ordering: AxisOrdering) -> Self {
        self.axis_ordering.insert(axis.into(), ordering);
        self
    }

    pub fn with_sample_axis(mut self, sample_axis: SampleAxis) -> Self {
        self.sample_axis = sample_axis;
        self
    }

    pub fn with_chunk_shape(mut self, shape: Vec<usize>) -> Self {
        self.chunk_shape = Some(shape);
        self
    }

    pub fn with_sample_chunk(mut self, samples: usize) -> Self {
        self.sample_chunk = Some(samples);
        self
    }

    pub fn with_data_type(mut self, data_type: DataType) -> Self {
        self.data_type = Some(data_type);
        self
    }

    pub fn with_fill_value(mut self, fill_value: f64) -> Self {
        self.fill_value = fill_value;
        self
    }

    pub fn with_codec(mut self, codec: CodecSpec) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_collision_policy(mut self, policy: CollisionPolicy) -> Self {
        self.collision_policy = policy;
        self
    }

    pub fn with_grid_override(mut self, command: GridOverride) -> Self {
        self.grid_overrides.push(command);
        self
    }

    pub fn with_best_effort(mut self, best_effort: bool) -> Self {
        self.best_effort = best_effort;
        self
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, backoff_ms: u64) -> Self {
        self.max_retries = max_retries;
        self.retry_backoff_ms = backoff_ms;
        self
    }

    pub fn with_chunk_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.chunk_timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    pub fn with_header_checkpoint(mut self, enabled: bool) -> Self {
        self.header_checkpoint = enabled;
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_attributes.insert(key.into(), value.into());
        self
    }

    /// Reject configurations that cannot run
    pub fn validate(&self) -> Result<()> {
        StorageBackend::from_url(&self.output_url)?;

        if self.array_name.is_empty() || self.array_name.contains('/') {
            return Err(IngestError::Configuration(format!(
                "invalid array name '{}'",
                self.array_name
            )));
        }
        if self.axis_keys.is_empty() {
            return Err(IngestError::Configuration(
                "at least one axis key is required".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = self.axis_keys.iter().find(|k| !seen.insert(k.as_str())) {
            return Err(IngestError::Configuration(format!("axis '{}' listed twice", dup)));
        }
        for name in self.axis_ordering.keys().chain(self.axis_units.keys()) {
            if !self.axis_keys.contains(name) {
                return Err(IngestError::Configuration(format!(
                    "'{}' is not one of the axis keys",
                    name
                )));
            }
        }

        if let Some(shape) = &self.chunk_shape {
            if shape.len() != self.axis_keys.len() {
                return Err(IngestError::Configuration(format!(
                    "chunk shape {:?} does not match {} axis keys",
                    shape,
                    self.axis_keys.len()
                )));
            }
            if shape.contains(&0) {
                return Err(IngestError::Configuration(
                    "chunk lengths must be positive".to_string(),
                ));
            }
        }
        if self.sample_chunk == Some(0) {
            return Err(IngestError::Configuration(
                "sample chunk must be positive".to_string(),
            ));
        }

        self.codec.validate_fill(self.fill_value)?;
        match self.data_type {
            Some(data_type) => {
                self.codec.validate(data_type)?;
                data_type.encode_f64(self.fill_value)?;
            }
            None if self.codec.method == CompressionMethod::Quantized => {
                self.codec.validate(DataType::F64)?;
            }
            None => {}
        }

        if !(0.0..=1.0).contains(&self.density_warn_threshold) {
            return Err(IngestError::Configuration(format!(
                "density threshold {} outside [0, 1]",
                self.density_warn_threshold
            )));
        }
        if self.max_in_flight == 0 || self.read_concurrency == 0 {
            return Err(IngestError::Configuration(
                "concurrency limits must be positive".to_string(),
            ));
        }
        if self.chunk_timeout_ms == Some(0) {
            return Err(IngestError::Configuration(
                "chunk timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn resolver(&self) -> GridResolver {
        let mut resolver = GridResolver::new()
            .with_collision_policy(self.collision_policy)
            .with_density_warn_threshold(self.density_warn_threshold);
        for (axis, ordering) in &self.axis_ordering {
            resolver = resolver.with_ordering(axis.clone(), ordering.clone());
        }
        for (axis, unit) in &self.axis_units {
            resolver = resolver.with_unit(axis.clone(), unit.clone());
        }
        resolver
    }

    pub fn writer_settings(&self) -> WriterSettings {
        WriterSettings {
            array_name: self.array_name.clone(),
            codec: self.codec,
            fill_value: self.fill_value,
            best_effort: self.best_effort,
            read_concurrency: self.read_concurrency,
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            max_in_flight: self.max_in_flight,
            max_retries: self.max_retries,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            chunk_timeout: self.chunk_timeout_ms.map(Duration::from_millis),
            resume: self.resume,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = IngestConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.collision_policy, CollisionPolicy::Fail);
        assert_eq!(config.coordinator_config(), CoordinatorConfig::default());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = IngestConfig::from_json_str(
            r#"{
                "output_url": "file:///tmp/survey",
                "axis_keys": ["inline", "crossline", "offset"],
                "chunk_shape": [16, 16, 8],
                "codec": { "method": "quantized", "tolerance": 0.01 },
                "collision_policy": "keep_last",
                "grid_overrides": [{ "type": "non_binned", "chunk": 4 }]
            }"#,
        )
        .unwrap();
        assert_eq!(config.array_name, "seismic");
        assert_eq!(config.max_in_flight, 8);
        assert_eq!(config.codec.method, CompressionMethod::Quantized);
        assert_eq!(config.collision_policy, CollisionPolicy::KeepLast);
        assert_eq!(config.grid_overrides, vec![GridOverride::NonBinned { chunk: 4 }]);
    }

    #[test]
    fn test_invalid_configs() {
        let base = IngestConfig::default();
        assert!(base.clone().with_axes(Vec::<String>::new()).validate().is_err());
        assert!(base.clone().with_axes(["inline", "inline"]).validate().is_err());
        assert!(base.clone().with_chunk_shape(vec![4]).validate().is_err());
        assert!(base.clone().with_chunk_shape(vec![4, 0]).validate().is_err());
        assert!(base.clone().with_sample_chunk(0).validate().is_err());
        assert!(base.clone().with_max_in_flight(0).validate().is_err());
        assert!(base.clone().with_codec(CodecSpec::quantized(-1.0)).validate().is_err());
        assert!(base
            .clone()
            .with_data_type(DataType::I16)
            .with_codec(CodecSpec::quantized(0.5))
            .validate()
            .is_err());
        assert!(base
            .clone()
            .with_axis_ordering("offset", AxisOrdering::Descending)
            .validate()
            .is_err());
        assert!(IngestConfig::new("ftp://host/x").validate().is_err());
        assert!(IngestConfig::from_json_str("{ \"max_in_flight\": \"many\" }").is_err());
    }

    #[test]
    fn test_fill_value_must_be_storable() {
        let base = IngestConfig::default();
        assert!(base
            .clone()
            .with_fill_value(f64::NAN)
            .with_codec(CodecSpec::quantized(0.01))
            .validate()
            .is_err());
        assert!(base
            .clone()
            .with_fill_value(f64::NAN)
            .with_codec(CodecSpec::lossless(CompressionMethod::Zstd))
            .validate()
            .is_ok());
        assert!(base
            .clone()
            .with_fill_value(-1.0)
            .with_codec(CodecSpec::quantized(0.01))
            .validate()
            .is_ok());
        assert!(base
            .clone()
            .with_data_type(DataType::I16)
            .with_fill_value(1.5)
            .validate()
            .is_err());
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ingest.json");
        std::fs::write(&path, r#"{ "fill_value": -999.0, "resume": true }"#).unwrap();
        let config = IngestConfig::from_json_file(&path).unwrap();
        assert_eq!(config.fill_value, -999.0);
        assert!(config.resume);
    }
}
