//! TTFS-QAT - Q1.7 quantization-aware fine-tuning for time-to-first-spike networks
//!
//! This library fine-tunes a pretrained time-to-first-spike spiking network so that its
//! weights live on the Q1.7 fixed-point lattice. Every training batch runs the optimizer,
//! projects the weights back onto the lattice and then re-derives each spiking layer's
//! firing window from the spike times it just observed.

#![warn(missing_docs)]
#![warn(unused_extern_crates)]

pub mod data;
pub mod neural;
pub mod quant;
pub mod temporal;
pub mod training;

use std::path::PathBuf;

// Re-export commonly used items for easier access
pub use data::{DataConfig, Dataset, FeatureStore};
pub use neural::{ArchitectureConfig, ModelState, SnnModel, SpikeRecord};
pub use quant::{apply_weight_quantization, quantize_q1_7};
pub use temporal::{TemporalSchedule, TemporalWindow};
pub use training::{FinetuneConfig, FinetuneSummary, evaluate, finetune_step, run_finetune};

/// Main configuration structure for a fine-tuning run
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct QatConfig {
    /// Network shape and input time window
    pub architecture: ArchitectureConfig,
    /// Optimizer, schedule and epoch settings
    pub finetune: FinetuneConfig,
    /// Feature store location and split settings
    pub data: DataConfig,
}

impl Default for QatConfig {
    fn default() -> Self {
        QatConfig {
            architecture: ArchitectureConfig::default(),
            finetune: FinetuneConfig::default(),
            data: DataConfig::default(),
        }
    }
}

impl QatConfig {
    /// Parse a configuration from a YAML document
    pub fn from_yaml_str(yaml: &str) -> QatResult<Self> {
        let config: QatConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as YAML
    pub fn to_yaml(&self) -> QatResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Check every section for values the run cannot work with
    pub fn validate(&self) -> QatResult<()> {
        self.architecture.validate()?;
        self.finetune.validate()?;
        self.data.validate()
    }
}

/// Convenient `Result` alias used across the crate
pub type QatResult<T> = Result<T, QatError>;

/// Fine-tuning error types
#[derive(Debug, thiserror::Error)]
pub enum QatError {
    /// The feature file does not exist
    #[error("Data file not found: {}", .0.display())]
    MissingFeatureFile(PathBuf),
    /// The feature file exists but its content is unusable
    #[error("Feature store error: {0}")]
    FeatureFormat(String),
    /// The checkpoint could not be read, written or matched against the architecture
    #[error(
        "Checkpoint error ({}): {message}. Ensure the architecture configuration matches the checkpoint.",
        path.display()
    )]
    Checkpoint {
        /// Checkpoint file involved
        path: PathBuf,
        /// What went wrong
        message: String,
    },
    /// A training or evaluation batch failed validation
    #[error("Invalid batch: {0}")]
    InvalidBatch(String),
    /// A configuration value is out of range
    #[error("Configuration error: {0}")]
    Config(String),
    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// YAML (de)serialization failure
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
