//! Embedding classifier over the merged feature vector.
//!
//! Each embedded column owns a lookup table; scaled columns pass through as a
//! single value. The concatenation feeds
//! `dense(relu) -> batch-norm -> dense(sigmoid) -> dense(1, sigmoid)`
//! trained with binary cross-entropy and Adam.
use crate::activations::ActivationKind;
use crate::config::MergerConfig;
use crate::error::{NetError, Result};
use crate::features::{ColumnRole, EncodedColumn, EncodedTable, FittedPlan};
use crate::layers::{BatchNorm, BatchNormCache, DenseGrads, DenseLayer, Embedding, Matrix};
use crate::loss::{binary_cross_entropy, binary_cross_entropy_logit_grad};
use crate::metrics::{binary_accuracy, EpochStats};
use crate::optim::Adam;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use tracing::{debug, info};

/// Rows scored per forward pass at inference time.
const PREDICT_CHUNK: usize = 1024;

/// Feature merger network
#[derive(Debug)]
pub struct FeatureMerger {
    plan: FittedPlan,
    /// One entry per plan column; `None` for scaled columns.
    embeddings: Vec<Option<Embedding>>,
    hidden: DenseLayer,
    norm: BatchNorm,
    wide: DenseLayer,
    output: DenseLayer,
    optimizer: Adam,
    batch_size: usize,
    epochs: usize,
    rng: StdRng,
}

/// Intermediates kept from a training forward pass.
struct ForwardCache {
    merged: Matrix,
    z_hidden: Matrix,
    bn: BatchNormCache,
    normed: Matrix,
    z_wide: Matrix,
    a_wide: Matrix,
    z_out: Matrix,
    probs: Vec<f64>,
}

impl FeatureMerger {
    pub fn new(plan: FittedPlan, config: &MergerConfig) -> Result<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let embeddings = plan
            .plan
            .descriptors
            .iter()
            .map(|d| match d.role() {
                ColumnRole::Embedded { vocabulary, width } => Some(Embedding::new(&mut rng, vocabulary, width)),
                ColumnRole::Scaled => None,
            })
            .collect();
        let merged_width = plan.plan.merged_width();
        info!("merged input width for this dataset = {}", merged_width);
        let hidden = DenseLayer::new(&mut rng, merged_width, config.hidden_width, ActivationKind::Relu);
        let norm = BatchNorm::new(config.hidden_width);
        let wide = DenseLayer::new(&mut rng, config.hidden_width, config.wide_width, ActivationKind::Sigmoid);
        let output = DenseLayer::new(&mut rng, config.wide_width, 1, ActivationKind::Sigmoid);
        Ok(Self {
            plan,
            embeddings,
            hidden,
            norm,
            wide,
            output,
            optimizer: Adam::new(config.learning_rate),
            batch_size: config.batch_size,
            epochs: config.epochs,
            rng,
        })
    }

    pub fn plan(&self) -> &FittedPlan {
        &self.plan
    }

    pub fn merged_width(&self) -> usize {
        self.hidden.input_size()
    }

    /// Concatenate every column's embedding or scaled value into one row each.
    pub fn merge(&self, batch: &EncodedTable) -> Result<Matrix> {
        if batch.columns.len() != self.embeddings.len() {
            return Err(NetError::shape("encoded columns", self.embeddings.len(), batch.columns.len()));
        }
        let mut merged: Matrix = vec![Vec::with_capacity(self.merged_width()); batch.rows];
        for ((column, embedding), descriptor) in batch
            .columns
            .iter()
            .zip(&self.embeddings)
            .zip(&self.plan.plan.descriptors)
        {
            match (column, embedding) {
                (EncodedColumn::Indices(idx), Some(emb)) => {
                    if let Some(&bad) = idx.iter().find(|&&i| i >= emb.vocabulary()) {
                        return Err(NetError::UnknownCategory {
                            column: descriptor.name.clone(),
                            value: bad.to_string(),
                        });
                    }
                    for (row, vector) in merged.iter_mut().zip(emb.forward(idx)) {
                        row.extend(vector);
                    }
                }
                (EncodedColumn::Scaled(values), None) => {
                    for (row, &v) in merged.iter_mut().zip(values) {
                        row.push(v);
                    }
                }
                _ => {
                    return Err(NetError::Schema(format!(
                        "column `{}` encoding does not match its feature kind",
                        descriptor.name
                    )))
                }
            }
        }
        Ok(merged)
    }

    fn forward_train(&mut self, batch: &EncodedTable) -> Result<ForwardCache> {
        let merged = self.merge(batch)?;
        let (z_hidden, a_hidden) = self.hidden.forward(&merged);
        let (normed, bn) = self.norm.forward_train(&a_hidden);
        let (z_wide, a_wide) = self.wide.forward(&normed);
        let (z_out, a_out) = self.output.forward(&a_wide);
        let probs = a_out.into_iter().map(|r| r[0]).collect();
        Ok(ForwardCache {
            merged,
            z_hidden,
            bn,
            normed,
            z_wide,
            a_wide,
            z_out,
            probs,
        })
    }

    /// Probability of the positive class for every row (inference mode).
    pub fn predict(&self, encoded: &EncodedTable) -> Result<Vec<f64>> {
        let mut probs = Vec::with_capacity(encoded.rows);
        let rows: Vec<usize> = (0..encoded.rows).collect();
        for chunk in rows.chunks(PREDICT_CHUNK) {
            let merged = self.merge(&encoded.select(chunk))?;
            let (_, a_hidden) = self.hidden.forward(&merged);
            let normed = self.norm.forward_eval(&a_hidden);
            let (_, a_wide) = self.wide.forward(&normed);
            let (_, a_out) = self.output.forward(&a_wide);
            probs.extend(a_out.into_iter().map(|r| r[0]));
        }
        Ok(probs)
    }

    pub fn evaluate(&self, encoded: &EncodedTable, labels: &[f64]) -> Result<f64> {
        check_labels(encoded, labels)?;
        Ok(binary_accuracy(&self.predict(encoded)?, labels))
    }

    /// One optimizer step on a mini-batch; returns `(loss, accuracy)`.
    pub fn train_batch(&mut self, batch: &EncodedTable, labels: &[f64]) -> Result<(f64, f64)> {
        check_labels(batch, labels)?;
        let cache = self.forward_train(batch)?;
        let loss = binary_cross_entropy(&cache.probs, labels);
        let accuracy = binary_accuracy(&cache.probs, labels);

        let d_out: Matrix = binary_cross_entropy_logit_grad(&cache.probs, labels)
            .into_iter()
            .map(|g| vec![g])
            .collect();
        let (g_out, d_wide) = self.output.backward(&cache.a_wide, &cache.z_out, &d_out, true);
        let (g_wide, d_normed) = self.wide.backward(&cache.normed, &cache.z_wide, &d_wide, false);
        let (d_gamma, d_beta, d_hidden) = self.norm.backward(&cache.bn, &d_normed);
        let (g_hidden, d_merged) = self.hidden.backward(&cache.merged, &cache.z_hidden, &d_hidden, false);
        let embedding_grads = self.embedding_grads(batch, &d_merged);

        self.apply(&embedding_grads, &g_hidden, &d_gamma, &d_beta, &g_wide, &g_out)?;
        Ok((loss, accuracy))
    }

    /// Split `dL/d(merged)` back into per-table gradients.
    fn embedding_grads(&self, batch: &EncodedTable, d_merged: &Matrix) -> Vec<Option<Matrix>> {
        let mut offset = 0;
        self.embeddings
            .iter()
            .zip(&batch.columns)
            .map(|(embedding, column)| match (embedding, column) {
                (Some(emb), EncodedColumn::Indices(idx)) => {
                    let width = emb.width();
                    let slice: Matrix = d_merged.iter().map(|r| r[offset..offset + width].to_vec()).collect();
                    offset += width;
                    Some(emb.backward(idx, &slice))
                }
                _ => {
                    offset += 1;
                    None
                }
            })
            .collect()
    }

    fn apply(
        &mut self,
        embedding_grads: &[Option<Matrix>],
        g_hidden: &DenseGrads,
        d_gamma: &[f64],
        d_beta: &[f64],
        g_wide: &DenseGrads,
        g_out: &DenseGrads,
    ) -> Result<()> {
        let Self {
            embeddings,
            hidden,
            norm,
            wide,
            output,
            optimizer,
            ..
        } = self;
        let mut params: Vec<&mut [f64]> = Vec::new();
        let mut grads: Vec<&[f64]> = Vec::new();
        for (emb, grad) in embeddings.iter_mut().zip(embedding_grads) {
            if let (Some(emb), Some(grad)) = (emb.as_mut(), grad.as_ref()) {
                params.extend(emb.table.iter_mut().map(Vec::as_mut_slice));
                grads.extend(grad.iter().map(Vec::as_slice));
            }
        }
        params.extend(hidden.params_mut());
        grads.extend(g_hidden.slices());
        params.push(norm.gamma.as_mut_slice());
        grads.push(d_gamma);
        params.push(norm.beta.as_mut_slice());
        grads.push(d_beta);
        params.extend(wide.params_mut());
        grads.extend(g_wide.slices());
        params.extend(output.params_mut());
        grads.extend(g_out.slices());
        optimizer.step(params, grads)
    }

    /// Shuffled mini-batch training for the configured number of epochs.
    pub fn train(&mut self, encoded: &EncodedTable, labels: &[f64]) -> Result<Vec<EpochStats>> {
        check_labels(encoded, labels)?;
        if encoded.rows == 0 {
            return Err(NetError::EmptyDataset("no training rows".to_string()));
        }
        let mut history = Vec::with_capacity(self.epochs);
        for epoch in 0..self.epochs {
            let mut indices: Vec<usize> = (0..encoded.rows).collect();
            indices.shuffle(&mut self.rng);
            let mut total_loss = 0.0;
            let mut total_correct = 0.0;
            for (i, chunk) in indices.chunks(self.batch_size).enumerate() {
                let batch = encoded.select(chunk);
                let batch_labels: Vec<f64> = chunk.iter().map(|&r| labels[r]).collect();
                let (loss, acc) = self.train_batch(&batch, &batch_labels)?;
                total_loss += loss * chunk.len() as f64;
                total_correct += acc * chunk.len() as f64;
                debug!(epoch = epoch + 1, batch = i, loss, "merger batch");
            }
            let stats = EpochStats {
                epoch: epoch + 1,
                loss: total_loss / encoded.rows as f64,
                accuracy: total_correct / encoded.rows as f64,
            };
            info!(
                "Epoch {}/{}: loss = {:.6}, acc = {:.4}",
                stats.epoch, self.epochs, stats.loss, stats.accuracy
            );
            history.push(stats);
        }
        Ok(history)
    }

    pub fn num_params(&self) -> usize {
        let embedded: usize = self
            .embeddings
            .iter()
            .flatten()
            .map(|e| e.vocabulary() * e.width())
            .sum();
        embedded + self.hidden.num_params() + 4 * self.norm.width() + self.wide.num_params() + self.output.num_params()
    }

    /// Save model to a gzipped JSON blob.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        for (d, emb) in self.plan.plan.descriptors.iter().zip(&self.embeddings) {
            if let Some(emb) = emb {
                ensure_finite(&format!("embed_{}", d.name), emb.table.iter().flatten())?;
            }
        }
        let norm = &self.norm;
        ensure_finite(
            "unified_x",
            norm.gamma.iter().chain(&norm.beta).chain(&norm.running_mean).chain(&norm.running_var),
        )?;
        let dto = MergerDto {
            plan: self.plan.clone(),
            embeddings: self.embeddings.clone(),
            hidden: LayerDto::from_layer("hidden1", &self.hidden)?,
            norm: self.norm.clone(),
            wide: LayerDto::from_layer("hidden_all", &self.wide)?,
            output: LayerDto::from_layer("output", &self.output)?,
            learning_rate: self.optimizer.lr,
            batch_size: self.batch_size,
            epochs: self.epochs,
        };
        let json = serde_json::to_vec(&dto)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut enc = GzEncoder::new(File::create(path)?, Compression::default());
        enc.write_all(&json)?;
        enc.finish()?;
        Ok(())
    }

    /// Load a model written by [`FeatureMerger::save`]; optimizer state starts fresh.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut buf = Vec::new();
        GzDecoder::new(File::open(path)?).read_to_end(&mut buf)?;
        let mut dto: MergerDto = serde_json::from_slice(&buf)?;
        dto.check_shapes()?;
        dto.plan.rebuild();
        Ok(Self {
            plan: dto.plan,
            embeddings: dto.embeddings,
            hidden: dto.hidden.into_layer(),
            norm: dto.norm,
            wide: dto.wide.into_layer(),
            output: dto.output.into_layer(),
            optimizer: Adam::new(dto.learning_rate),
            batch_size: dto.batch_size,
            epochs: dto.epochs,
            rng: StdRng::seed_from_u64(0),
        })
    }
}

fn check_labels(encoded: &EncodedTable, labels: &[f64]) -> Result<()> {
    if encoded.rows != labels.len() {
        return Err(NetError::shape("label rows", encoded.rows, labels.len()));
    }
    Ok(())
}

impl fmt::Display for FeatureMerger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:<24} {:>14} {:>10}", "Layer", "Output", "Params")?;
        for (d, emb) in self.plan.plan.descriptors.iter().zip(&self.embeddings) {
            if let Some(emb) = emb {
                writeln!(
                    f,
                    "{:<24} {:>14} {:>10}",
                    format!("embed_{}", d.name),
                    emb.width(),
                    emb.vocabulary() * emb.width()
                )?;
            }
        }
        writeln!(f, "{:<24} {:>14} {:>10}", "merge_features", self.merged_width(), 0)?;
        writeln!(f, "{:<24} {:>14} {:>10}", "hidden1", self.hidden.output_size(), self.hidden.num_params())?;
        writeln!(f, "{:<24} {:>14} {:>10}", "unified_x", self.norm.width(), 4 * self.norm.width())?;
        writeln!(f, "{:<24} {:>14} {:>10}", "hidden_all", self.wide.output_size(), self.wide.num_params())?;
        writeln!(f, "{:<24} {:>14} {:>10}", "output", self.output.output_size(), self.output.num_params())?;
        write!(f, "Total params: {}", self.num_params())
    }
}

// ============ Persistence DTOs ============

#[derive(Debug, Serialize, Deserialize)]
struct LayerDto {
    weights: Vec<Vec<f64>>, // [output_size][input_size]
    bias: Vec<f64>,
    activation: ActivationKind,
}

fn ensure_finite<'a>(name: &str, values: impl IntoIterator<Item = &'a f64>) -> Result<()> {
    if values.into_iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(NetError::NonFiniteParameter(name.to_string()))
    }
}

fn check_len(context: &str, expected: usize, actual: usize) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(NetError::shape(context, expected, actual))
    }
}

impl LayerDto {
    fn from_layer(name: &str, layer: &DenseLayer) -> Result<Self> {
        ensure_finite(name, layer.weights.iter().flatten().chain(&layer.bias))?;
        Ok(Self {
            weights: layer.weights.clone(),
            bias: layer.bias.clone(),
            activation: layer.activation.kind(),
        })
    }

    fn check(&self, name: &str, input: usize, output: usize) -> Result<()> {
        check_len(&format!("{name} rows"), output, self.weights.len())?;
        check_len(&format!("{name} bias"), output, self.bias.len())?;
        for row in &self.weights {
            check_len(&format!("{name} row width"), input, row.len())?;
        }
        Ok(())
    }

    fn into_layer(self) -> DenseLayer {
        DenseLayer {
            weights: self.weights,
            bias: self.bias,
            activation: self.activation.to_arc(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct MergerDto {
    plan: FittedPlan,
    embeddings: Vec<Option<Embedding>>,
    hidden: LayerDto,
    norm: BatchNorm,
    wide: LayerDto,
    output: LayerDto,
    learning_rate: f64,
    batch_size: usize,
    epochs: usize,
}

impl MergerDto {
    /// Layer sizes chain from the plan's merged width down to one output.
    fn check_shapes(&self) -> Result<()> {
        let descriptors = &self.plan.plan.descriptors;
        check_len("encoders", descriptors.len(), self.plan.encoders.len())?;
        check_len("embeddings", descriptors.len(), self.embeddings.len())?;
        for (d, emb) in descriptors.iter().zip(&self.embeddings) {
            match (d.role(), emb) {
                (ColumnRole::Embedded { vocabulary, width }, Some(emb)) => {
                    check_len(&format!("embed_{} rows", d.name), vocabulary, emb.table.len())?;
                    for row in &emb.table {
                        check_len(&format!("embed_{} width", d.name), width, row.len())?;
                    }
                }
                (ColumnRole::Scaled, None) => {}
                _ => return Err(NetError::Schema(format!("feature `{}` does not match its stored layer", d.name))),
            }
        }
        let hidden = self.hidden.weights.len();
        self.hidden.check("hidden1", self.plan.plan.merged_width(), hidden)?;
        for v in [&self.norm.gamma, &self.norm.beta, &self.norm.running_mean, &self.norm.running_var] {
            check_len("unified_x", hidden, v.len())?;
        }
        let wide = self.wide.weights.len();
        self.wide.check("hidden_all", hidden, wide)?;
        self.output.check("output", wide, 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasets::Table;
    use crate::features::{FeatureDescriptor, FeaturePlan};

    fn toy() -> (FittedPlan, EncodedTable, Vec<f64>) {
        let n = 64;
        let proto: Vec<String> = (0..n).map(|i| if i % 2 == 0 { "tcp" } else { "udp" }.to_string()).collect();
        let ttl: Vec<String> = (0..n).map(|i| (i % 4).to_string()).collect();
        let dur: Vec<String> = (0..n).map(|i| format!("{}", i as f64 * 0.5)).collect();
        let labels: Vec<f64> = (0..n).map(|i| (i % 2) as f64).collect();
        let table = Table::from_columns(vec![("proto", proto), ("ttl", ttl), ("dur", dur)]).unwrap();
        let plan = FeaturePlan::new(vec![
            FeatureDescriptor::symbolic("proto", ["tcp", "udp"]),
            FeatureDescriptor::integer("ttl", 0, 3),
            FeatureDescriptor::continuous("dur"),
        ])
        .unwrap();
        let fitted = plan.fit(&table).unwrap();
        let encoded = fitted.encode(&table).unwrap();
        (fitted, encoded, labels)
    }

    fn small_config() -> MergerConfig {
        MergerConfig {
            hidden_width: 16,
            wide_width: 8,
            batch_size: 16,
            epochs: 30,
            learning_rate: 0.01,
            ..MergerConfig::default()
        }
    }

    #[test]
    fn test_merged_rows_have_plan_width() {
        let (fitted, encoded, _) = toy();
        let model = FeatureMerger::new(fitted, &small_config()).unwrap();
        let merged = model.merge(&encoded).unwrap();
        assert_eq!(model.merged_width(), 1 + 2 + 1);
        assert!(merged.iter().all(|r| r.len() == 4));
    }

    #[test]
    fn test_training_learns_separable_labels() {
        let (fitted, encoded, labels) = toy();
        let mut model = FeatureMerger::new(fitted, &small_config()).unwrap();
        // let the running statistics settle within a short run
        model.norm.momentum = 0.9;
        let history = model.train(&encoded, &labels).unwrap();
        assert_eq!(history.len(), 30);
        assert!(history.last().unwrap().loss < history[0].loss);
        assert!(history.last().unwrap().accuracy > 0.9);
        assert!(model.evaluate(&encoded, &labels).unwrap() > 0.9);
    }

    #[test]
    fn test_label_mismatch_is_shape_error() {
        let (fitted, encoded, _) = toy();
        let mut model = FeatureMerger::new(fitted, &small_config()).unwrap();
        assert!(matches!(model.train(&encoded, &[1.0]), Err(NetError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_zero_batch_size_is_rejected_at_construction() {
        let (fitted, _, _) = toy();
        let config = MergerConfig {
            batch_size: 0,
            ..small_config()
        };
        assert!(matches!(FeatureMerger::new(fitted, &config), Err(NetError::Config(_))));
    }

    #[test]
    fn test_save_refuses_non_finite_weights() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("merger.nlm");
        let (fitted, _, _) = toy();
        let mut model = FeatureMerger::new(fitted, &small_config()).unwrap();
        model.wide.weights[0][0] = f64::NAN;
        match model.save(&path) {
            Err(NetError::NonFiniteParameter(name)) => assert_eq!(name, "hidden_all"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!path.exists());

        let (fitted, _, _) = toy();
        let mut model = FeatureMerger::new(fitted, &small_config()).unwrap();
        model.embeddings[0].as_mut().unwrap().table[1][0] = f64::INFINITY;
        assert!(matches!(model.save(&path), Err(NetError::NonFiniteParameter(_))));
    }

    #[test]
    fn test_load_rejects_inconsistent_layers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("merger.nlm");
        let (fitted, _, _) = toy();
        let mut model = FeatureMerger::new(fitted, &small_config()).unwrap();
        model.output.bias.push(0.0);
        model.save(&path).unwrap();
        assert!(matches!(FeatureMerger::load(&path), Err(NetError::ShapeMismatch { .. })));

        let (fitted, _, _) = toy();
        let mut model = FeatureMerger::new(fitted, &small_config()).unwrap();
        model.norm.running_var.pop();
        model.save(&path).unwrap();
        assert!(matches!(FeatureMerger::load(&path), Err(NetError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_save_and_load_preserve_predictions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("merger.nlm");
        let (fitted, encoded, _) = toy();
        let model = FeatureMerger::new(fitted, &small_config()).unwrap();
        model.save(&path).unwrap();
        let loaded = FeatureMerger::load(&path).unwrap();
        let before = model.predict(&encoded).unwrap();
        let after = loaded.predict(&encoded).unwrap();
        for (a, b) in before.iter().zip(&after) {
            assert!((a - b).abs() < 1e-9);
        }
        assert!(loaded.plan().encoders.len() == 3);
        assert!(format!("{loaded}").contains("embed_proto"));
    }
}
