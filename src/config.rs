//! TOML run configuration for both pipelines.
//!
//! Every field has a default matching the reference experiments, so a config
//! file only needs to name the inputs it changes.
use crate::activations::ActivationKind;
use crate::error::{NetError, Result};
use crate::loss::GeneratorLoss;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub merger: MergerConfig,
    pub gan: GanConfig,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.merger.validate()?;
        config.gan.validate()?;
        Ok(config)
    }
}

/// Feature merger: inputs, architecture and training schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergerConfig {
    pub train_path: PathBuf,
    pub test_path: Option<PathBuf>,
    pub schema_path: PathBuf,
    pub label_column: String,
    /// Columns removed before feature extraction (the attack category).
    pub drop_columns: Vec<String>,
    pub hidden_width: usize,
    pub wide_width: usize,
    pub batch_size: usize,
    pub epochs: usize,
    pub learning_rate: f64,
    pub seed: u64,
    pub model_path: Option<PathBuf>,
}

impl Default for MergerConfig {
    fn default() -> Self {
        Self {
            train_path: PathBuf::from("UNSW/UNSW_NB15_training-set.csv"),
            test_path: Some(PathBuf::from("UNSW/UNSW_NB15_testing-set.csv")),
            schema_path: PathBuf::from("UNSW/feature_schema.csv"),
            label_column: "label".to_string(),
            drop_columns: vec!["attack_cat".to_string()],
            hidden_width: 400,
            wide_width: 1024,
            batch_size: 40,
            epochs: 1,
            learning_rate: 1e-3,
            seed: 42,
            model_path: Some(PathBuf::from("models/kmerger.nlm")),
        }
    }
}

impl MergerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 || self.hidden_width == 0 || self.wide_width == 0 {
            return Err(NetError::Config("merger widths and batch_size must be positive".into()));
        }
        if !(self.learning_rate > 0.0) {
            return Err(NetError::Config("merger learning_rate must be positive".into()));
        }
        Ok(())
    }
}

/// Where the GAN reads its real samples from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format", content = "path", rename_all = "snake_case")]
pub enum GanData {
    /// Gzipped IDX3 image file.
    Mnist(PathBuf),
    /// Headerless numeric CSV, values expected in [0, 1].
    Csv(PathBuf),
}

/// Vanilla GAN: dimensions, schedule and output location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GanConfig {
    pub data: GanData,
    pub noise_dim: usize,
    pub input_dim: usize,
    pub g_hidden: usize,
    pub d_hidden: usize,
    pub activation: ActivationKind,
    pub generator_loss: GeneratorLoss,
    pub batch_size: usize,
    pub num_steps: usize,
    pub learning_rate: f64,
    pub seed: u64,
    pub name: String,
    pub output_dir: PathBuf,
}

impl Default for GanConfig {
    fn default() -> Self {
        Self {
            data: GanData::Mnist(PathBuf::from("MNIST_data/train-images-idx3-ubyte.gz")),
            noise_dim: 100,
            input_dim: 784,
            g_hidden: 128,
            d_hidden: 128,
            activation: ActivationKind::Relu,
            generator_loss: GeneratorLoss::Saturating,
            batch_size: 128,
            num_steps: 100_000,
            learning_rate: 1e-3,
            seed: 42,
            name: "VanillaGAN".to_string(),
            output_dir: PathBuf::from("."),
        }
    }
}

impl GanConfig {
    pub fn validate(&self) -> Result<()> {
        if self.noise_dim == 0 || self.input_dim == 0 || self.g_hidden == 0 || self.d_hidden == 0 {
            return Err(NetError::Config("gan dimensions must be positive".into()));
        }
        if self.batch_size == 0 {
            return Err(NetError::Config("gan batch_size must be positive".into()));
        }
        if !(self.learning_rate > 0.0) {
            return Err(NetError::Config("gan learning_rate must be positive".into()));
        }
        Ok(())
    }
}
