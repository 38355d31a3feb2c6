//! Dense, embedding and batch-normalization layers with explicit backward passes.
//!
//! All batched tensors are row-major `Matrix` values with one row per sample.
//! Dense weights are stored `[output][input]`, so a layer computes
//! `z[n] = W · x[n] + b` for every row `n`.
use crate::activations::{Activation, ActivationKind};
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Matrix type
pub type Matrix = Vec<Vec<f64>>;

/// Weight matrix `[output_size][input_size]` drawn from a normal truncated at
/// two standard deviations, `stddev = sqrt(2 / input_size)`.
pub fn xavier_init<R: Rng>(rng: &mut R, input_size: usize, output_size: usize) -> Matrix {
    let stddev = (2.0 / input_size.max(1) as f64).sqrt();
    (0..output_size)
        .map(|_| {
            (0..input_size)
                .map(|_| loop {
                    let n: f64 = rng.sample(StandardNormal);
                    if n.abs() <= 2.0 {
                        break n * stddev;
                    }
                })
                .collect()
        })
        .collect()
}

/// `z = x · Wᵀ + b` for a batch `x` of shape `[n][input]`.
pub fn linear_forward(x: &Matrix, w: &Matrix, b: &[f64]) -> Matrix {
    x.iter()
        .map(|row| {
            w.iter()
                .zip(b)
                .map(|(w_row, &bias)| w_row.iter().zip(row).map(|(&wi, &xi)| wi * xi).sum::<f64>() + bias)
                .collect()
        })
        .collect()
}

/// Gradients of a linear map given `dL/dz`: returns `(dW, db, dL/dx)`.
pub fn linear_backward(x: &Matrix, w: &Matrix, dz: &Matrix) -> (Matrix, Vec<f64>, Matrix) {
    let out = w.len();
    let inp = w.first().map_or(0, Vec::len);
    let mut d_w = vec![vec![0.0; inp]; out];
    let mut d_b = vec![0.0; out];
    let mut d_x = vec![vec![0.0; inp]; x.len()];
    for ((x_row, dz_row), dx_row) in x.iter().zip(dz).zip(d_x.iter_mut()) {
        for (o, &g) in dz_row.iter().enumerate() {
            if g == 0.0 {
                continue;
            }
            d_b[o] += g;
            for ((dw, &xi), (dx, &wi)) in d_w[o].iter_mut().zip(x_row).zip(dx_row.iter_mut().zip(&w[o])) {
                *dw += g * xi;
                *dx += g * wi;
            }
        }
    }
    (d_w, d_b, d_x)
}

/// Apply an activation element-wise to every entry of a batch.
pub fn map_batch(z: &Matrix, act: &dyn Activation) -> Matrix {
    z.iter().map(|row| act.apply_vec(row)).collect()
}

/// Gradients for one dense layer.
#[derive(Debug, Clone)]
pub struct DenseGrads {
    pub d_w: Matrix,
    pub d_b: Vec<f64>,
}

/// A fully-connected (dense) layer with weights, bias, and an activation function.
#[derive(Debug, Clone)]
pub struct DenseLayer {
    pub weights: Matrix,
    pub bias: Vec<f64>,
    pub activation: Arc<dyn Activation + Send + Sync>,
}

impl DenseLayer {
    /// Xavier-initialised weights and zero bias.
    pub fn new<R: Rng>(
        rng: &mut R,
        input_size: usize,
        output_size: usize,
        activation: ActivationKind,
    ) -> Self {
        Self {
            weights: xavier_init(rng, input_size, output_size),
            bias: vec![0.0; output_size],
            activation: activation.to_arc(),
        }
    }

    pub fn input_size(&self) -> usize {
        self.weights.first().map_or(0, Vec::len)
    }

    pub fn output_size(&self) -> usize {
        self.bias.len()
    }

    pub fn num_params(&self) -> usize {
        self.output_size() * (self.input_size() + 1)
    }

    /// Forward pass: returns pre-activations `z` and activations `a`.
    pub fn forward(&self, input: &Matrix) -> (Matrix, Matrix) {
        let z = linear_forward(input, &self.weights, &self.bias);
        let a = map_batch(&z, self.activation.as_ref());
        (z, a)
    }

    /// Backward pass from `dL/da`. When `dz_given` is set the incoming
    /// gradient is already w.r.t. `z` (fused sigmoid + cross-entropy).
    pub fn backward(&self, input: &Matrix, z: &Matrix, upstream: &Matrix, dz_given: bool) -> (DenseGrads, Matrix) {
        let dz: Matrix = if dz_given {
            upstream.clone()
        } else {
            upstream
                .iter()
                .zip(z)
                .map(|(d_row, z_row)| {
                    d_row
                        .iter()
                        .zip(z_row)
                        .map(|(&d, &val)| d * self.activation.derivative(val))
                        .collect()
                })
                .collect()
        };
        let (d_w, d_b, d_x) = linear_backward(input, &self.weights, &dz);
        (DenseGrads { d_w, d_b }, d_x)
    }

    /// Mutable parameter slices in a fixed order (weight rows, then bias).
    pub fn params_mut(&mut self) -> Vec<&mut [f64]> {
        let mut out: Vec<&mut [f64]> = self.weights.iter_mut().map(Vec::as_mut_slice).collect();
        out.push(self.bias.as_mut_slice());
        out
    }
}

impl DenseGrads {
    /// Gradient slices in the same order as [`DenseLayer::params_mut`].
    pub fn slices(&self) -> Vec<&[f64]> {
        let mut out: Vec<&[f64]> = self.d_w.iter().map(Vec::as_slice).collect();
        out.push(self.d_b.as_slice());
        out
    }
}

/// Lookup table mapping a discrete index to a trainable dense vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    /// `[vocabulary][width]`
    pub table: Matrix,
}

impl Embedding {
    /// Uniform(-0.05, 0.05) initialisation.
    pub fn new<R: Rng>(rng: &mut R, vocabulary: usize, width: usize) -> Self {
        let table = (0..vocabulary)
            .map(|_| (0..width).map(|_| rng.gen_range(-0.05..0.05)).collect())
            .collect();
        Self { table }
    }

    pub fn vocabulary(&self) -> usize {
        self.table.len()
    }

    pub fn width(&self) -> usize {
        self.table.first().map_or(0, Vec::len)
    }

    /// Indices must be `< vocabulary`; encoders guarantee this.
    pub fn forward(&self, indices: &[usize]) -> Matrix {
        indices.iter().map(|&i| self.table[i].clone()).collect()
    }

    /// Dense gradient of the table given `dL/dout` rows aligned with `indices`.
    pub fn backward(&self, indices: &[usize], d_out: &Matrix) -> Matrix {
        let mut grad = vec![vec![0.0; self.width()]; self.vocabulary()];
        for (&i, row) in indices.iter().zip(d_out) {
            for (g, &d) in grad[i].iter_mut().zip(row) {
                *g += d;
            }
        }
        grad
    }
}

/// Cached intermediates of a training-mode batch-norm forward pass.
#[derive(Debug, Clone)]
pub struct BatchNormCache {
    x_hat: Matrix,
    inv_std: Vec<f64>,
}

/// Batch normalization over the feature axis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchNorm {
    pub gamma: Vec<f64>,
    pub beta: Vec<f64>,
    pub running_mean: Vec<f64>,
    pub running_var: Vec<f64>,
    pub momentum: f64,
    pub epsilon: f64,
}

impl BatchNorm {
    pub fn new(width: usize) -> Self {
        Self {
            gamma: vec![1.0; width],
            beta: vec![0.0; width],
            running_mean: vec![0.0; width],
            running_var: vec![1.0; width],
            momentum: 0.99,
            epsilon: 1e-3,
        }
    }

    pub fn width(&self) -> usize {
        self.gamma.len()
    }

    /// Normalise with batch statistics and update the running averages.
    pub fn forward_train(&mut self, x: &Matrix) -> (Matrix, BatchNormCache) {
        let n = x.len().max(1) as f64;
        let d = self.width();
        let mut mean = vec![0.0; d];
        for row in x {
            for (m, &v) in mean.iter_mut().zip(row) {
                *m += v / n;
            }
        }
        let mut var = vec![0.0; d];
        for row in x {
            for ((s, &v), &m) in var.iter_mut().zip(row).zip(&mean) {
                *s += (v - m) * (v - m) / n;
            }
        }
        let inv_std: Vec<f64> = var.iter().map(|&v| 1.0 / (v + self.epsilon).sqrt()).collect();
        let x_hat: Matrix = x
            .iter()
            .map(|row| {
                row.iter()
                    .zip(&mean)
                    .zip(&inv_std)
                    .map(|((&v, &m), &s)| (v - m) * s)
                    .collect()
            })
            .collect();
        let y = self.scale_shift(&x_hat);
        for j in 0..d {
            self.running_mean[j] = self.momentum * self.running_mean[j] + (1.0 - self.momentum) * mean[j];
            self.running_var[j] = self.momentum * self.running_var[j] + (1.0 - self.momentum) * var[j];
        }
        (y, BatchNormCache { x_hat, inv_std })
    }

    /// Normalise with the running statistics.
    pub fn forward_eval(&self, x: &Matrix) -> Matrix {
        let x_hat: Matrix = x
            .iter()
            .map(|row| {
                row.iter()
                    .zip(&self.running_mean)
                    .zip(&self.running_var)
                    .map(|((&v, &m), &var)| (v - m) / (var + self.epsilon).sqrt())
                    .collect()
            })
            .collect();
        self.scale_shift(&x_hat)
    }

    fn scale_shift(&self, x_hat: &Matrix) -> Matrix {
        x_hat
            .iter()
            .map(|row| {
                row.iter()
                    .zip(&self.gamma)
                    .zip(&self.beta)
                    .map(|((&v, &g), &b)| g * v + b)
                    .collect()
            })
            .collect()
    }

    /// Returns `(d_gamma, d_beta, dL/dx)`.
    pub fn backward(&self, cache: &BatchNormCache, d_y: &Matrix) -> (Vec<f64>, Vec<f64>, Matrix) {
        let n = d_y.len().max(1) as f64;
        let d = self.width();
        let mut d_gamma = vec![0.0; d];
        let mut d_beta = vec![0.0; d];
        for (dy_row, xh_row) in d_y.iter().zip(&cache.x_hat) {
            for j in 0..d {
                d_gamma[j] += dy_row[j] * xh_row[j];
                d_beta[j] += dy_row[j];
            }
        }
        let d_x = d_y
            .iter()
            .zip(&cache.x_hat)
            .map(|(dy_row, xh_row)| {
                (0..d)
                    .map(|j| {
                        self.gamma[j] * cache.inv_std[j] / n
                            * (n * dy_row[j] - d_beta[j] - xh_row[j] * d_gamma[j])
                    })
                    .collect()
            })
            .collect();
        (d_gamma, d_beta, d_x)
    }
}
