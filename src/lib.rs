//! Neural network building blocks for tabular intrusion data and adversarial
//! sample generation, written on plain `Vec<Vec<f64>>` matrices.
//!
//! - Feature planning: per-column embedding widths, encoders and scalers
//! - Feature merger classifier: embeddings + dense/batch-norm binary head
//! - Vanilla GAN with alternating Adam updates
//! - CSV, schema and MNIST (IDX) loaders, metric sinks and sample grids

pub mod activations;
pub mod config;
pub mod datasets;
pub mod error;
pub mod features;
pub mod gan;
pub mod layers;
pub mod loss;
pub mod merger;
pub mod metrics;
pub mod optim;
pub mod visualize;

pub use activations::{Activation, ActivationKind};
pub use config::{Config, GanConfig, GanData, MergerConfig};
pub use datasets::{load_csv_matrix, load_mnist_images, load_schema, load_table, next_batch, resolve_schema, Table};
pub use error::{NetError, Result};
pub use features::{FeatureDescriptor, FeatureKind, FeaturePlan, FittedPlan};
pub use gan::{TrainSchedule, VanillaGan};
pub use layers::Matrix;
pub use merger::FeatureMerger;
pub use metrics::{CsvSink, FanoutSink, LogSink, MetricSink, TrainingHistory};
pub use visualize::RunDir;
