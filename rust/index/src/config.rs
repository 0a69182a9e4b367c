use std::path::Path;

use figment::providers::{Env, Format, Serialized, Yaml};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::{Validate, ValidationError};
use vecindex_error::{ErrorCodes, VecIndexError};

pub const DEFAULT_CONFIG_PATH: &str = "./vecindex_config.yaml";

pub fn default_min_partition_size() -> usize {
    16
}

pub fn default_max_partition_size() -> usize {
    128
}

pub fn default_quality_samples() -> usize {
    16
}

pub fn default_base_beam_size() -> usize {
    8
}

pub fn default_fixup_workers() -> usize {
    1
}

pub fn default_max_extra_results_factor() -> usize {
    2
}

/// How vectors are transformed before quantization.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RandomizeKind {
    /// Random orthogonal rotation seeded by the index seed.
    #[default]
    Orthogonal,
    /// Vectors are quantized as given.
    None,
}

/// Tuning knobs of a [`crate::VectorIndex`].
#[derive(Clone, Debug, Serialize, Deserialize, Validate, PartialEq)]
#[serde(deny_unknown_fields)]
#[validate(schema(function = "validate_partition_sizes"))]
pub struct VectorIndexOptions {
    /// Non-root partitions smaller than this are merged away.
    #[serde(default = "default_min_partition_size")]
    #[validate(range(min = 1))]
    pub min_partition_size: usize,
    /// Partitions larger than this are split in two.
    #[serde(default = "default_max_partition_size")]
    #[validate(range(min = 2))]
    pub max_partition_size: usize,
    /// Number of top candidates inspected to decide whether the beam is too
    /// narrow for the quality of the estimates.
    #[serde(default = "default_quality_samples")]
    #[validate(range(min = 1, max = 1024))]
    pub quality_samples: usize,
    /// Partitions kept per level during search.
    #[serde(default = "default_base_beam_size")]
    #[validate(range(min = 1, max = 1024))]
    pub base_beam_size: usize,
    /// Seed split clustering from the index seed so that serial runs are
    /// reproducible.
    #[serde(default)]
    pub is_deterministic: bool,
    /// Background tasks draining the fixup queue. Zero leaves all fixups to
    /// `process_fixups`.
    #[serde(default = "default_fixup_workers")]
    #[validate(range(max = 64))]
    pub fixup_workers: usize,
    /// Extra candidates per requested result that are kept for reranking.
    #[serde(default = "default_max_extra_results_factor")]
    #[validate(range(max = 16))]
    pub max_extra_results_factor: usize,
    #[serde(default)]
    pub randomize: RandomizeKind,
}

fn validate_partition_sizes(options: &VectorIndexOptions) -> Result<(), ValidationError> {
    if options.max_partition_size < 2 * options.min_partition_size {
        let mut err = ValidationError::new("partition_sizes");
        err.message =
            Some("max_partition_size must be at least twice min_partition_size".into());
        return Err(err);
    }
    Ok(())
}

impl Default for VectorIndexOptions {
    fn default() -> Self {
        VectorIndexOptions {
            min_partition_size: default_min_partition_size(),
            max_partition_size: default_max_partition_size(),
            quality_samples: default_quality_samples(),
            base_beam_size: default_base_beam_size(),
            is_deterministic: false,
            fixup_workers: default_fixup_workers(),
            max_extra_results_factor: default_max_extra_results_factor(),
            randomize: RandomizeKind::default(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Error loading config: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("Invalid options: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

impl VecIndexError for ConfigError {
    fn code(&self) -> ErrorCodes {
        ErrorCodes::InvalidArgument
    }
}

impl VectorIndexOptions {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path(DEFAULT_CONFIG_PATH)
    }

    /// Layers defaults, the YAML file at `path` (when it exists) and
    /// `VECINDEX_` environment variables, then validates the result.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        // Nested keys are separated by a double underscore in the environment.
        let mut f = figment::Figment::from(Serialized::defaults(VectorIndexOptions::default()));
        if path.as_ref().exists() {
            f = f.merge(Yaml::file(path.as_ref()));
        }
        f = f.merge(Env::prefixed("VECINDEX_").map(|k| k.as_str().replace("__", ".").into()));
        let options: VectorIndexOptions = f.extract().map_err(Box::new)?;
        options.validate()?;
        Ok(options)
    }
}
