//! Vanilla GAN: two-layer generator and discriminator trained on the minimax
//! objective with alternating Adam steps.
//!
//! All state lives in [`VanillaGan`]. The generator and discriminator
//! parameters are separate typed structs, each updated only by its own
//! optimizer; one training iteration runs the discriminator step to
//! completion before the generator step starts.
use crate::activations::{sigmoid, Activation};
use crate::config::GanConfig;
use crate::datasets::next_batch;
use crate::error::{NetError, Result};
use crate::layers::{linear_backward, linear_forward, map_batch, xavier_init, Matrix};
use crate::loss::{discriminator_logit_grads, fake_term, real_term, GeneratorLoss};
use crate::metrics::{MetricSink, TrainingHistory};
use crate::optim::Adam;
use crate::visualize::{save_sample_grid, RunDir, GRID_SIDE};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Marker for generator parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generator {}
/// Marker for discriminator parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discriminator {}

/// `out = W2 · act(W1 · x + b1) + b2`, weights stored `[output][input]`.
///
/// The marker type keeps generator and discriminator parameters from being
/// mixed up at compile time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct TwoLayerParams<N> {
    pub w1: Matrix,
    pub b1: Vec<f64>,
    pub w2: Matrix,
    pub b2: Vec<f64>,
    #[serde(skip)]
    net: PhantomData<N>,
}

pub type GeneratorParams = TwoLayerParams<Generator>;
pub type DiscriminatorParams = TwoLayerParams<Discriminator>;

/// Gradients matching [`TwoLayerParams`] field for field.
#[derive(Debug, Clone)]
pub struct TwoLayerGrads {
    pub d_w1: Matrix,
    pub d_b1: Vec<f64>,
    pub d_w2: Matrix,
    pub d_b2: Vec<f64>,
}

/// Forward intermediates needed for backprop.
struct Pass {
    z1: Matrix,
    h1: Matrix,
    logit: Matrix,
}

impl<N> TwoLayerParams<N> {
    fn new<R: Rng>(rng: &mut R, input: usize, hidden: usize, output: usize) -> Self {
        Self {
            w1: xavier_init(rng, input, hidden),
            b1: vec![0.0; hidden],
            w2: xavier_init(rng, hidden, output),
            b2: vec![0.0; output],
            net: PhantomData,
        }
    }

    pub fn input_size(&self) -> usize {
        self.w1.first().map_or(0, Vec::len)
    }

    pub fn output_size(&self) -> usize {
        self.b2.len()
    }

    /// Every matrix and bias agrees with an `input -> hidden -> output` net.
    fn check_shape(&self, context: &str, input: usize, hidden: usize, output: usize) -> Result<()> {
        let rows = |m: &Matrix, width: usize, what: &str| -> Result<()> {
            match m.iter().find(|r| r.len() != width) {
                Some(r) => Err(NetError::shape(format!("{context} {what} row width"), width, r.len())),
                None => Ok(()),
            }
        };
        let len = |actual: usize, expected: usize, what: &str| -> Result<()> {
            if actual == expected {
                Ok(())
            } else {
                Err(NetError::shape(format!("{context} {what}"), expected, actual))
            }
        };
        len(self.w1.len(), hidden, "w1 rows")?;
        rows(&self.w1, input, "w1")?;
        len(self.b1.len(), hidden, "b1")?;
        len(self.w2.len(), output, "w2 rows")?;
        rows(&self.w2, hidden, "w2")?;
        len(self.b2.len(), output, "b2")
    }

    fn forward(&self, x: &Matrix, act: &dyn Activation) -> Pass {
        let z1 = linear_forward(x, &self.w1, &self.b1);
        let h1 = map_batch(&z1, act);
        let logit = linear_forward(&h1, &self.w2, &self.b2);
        Pass { z1, h1, logit }
    }

    /// Backprop `dL/dlogit`; returns parameter gradients and `dL/dx`.
    fn backward(&self, x: &Matrix, pass: &Pass, d_logit: &Matrix, act: &dyn Activation) -> (TwoLayerGrads, Matrix) {
        let (d_w2, d_b2, d_h1) = linear_backward(&pass.h1, &self.w2, d_logit);
        let d_z1: Matrix = d_h1
            .iter()
            .zip(&pass.z1)
            .map(|(dh, z)| dh.iter().zip(z).map(|(&d, &v)| d * act.derivative(v)).collect())
            .collect();
        let (d_w1, d_b1, d_x) = linear_backward(x, &self.w1, &d_z1);
        (TwoLayerGrads { d_w1, d_b1, d_w2, d_b2 }, d_x)
    }

    fn params_mut(&mut self) -> Vec<&mut [f64]> {
        let mut out: Vec<&mut [f64]> = self.w1.iter_mut().map(Vec::as_mut_slice).collect();
        out.push(self.b1.as_mut_slice());
        out.extend(self.w2.iter_mut().map(Vec::as_mut_slice));
        out.push(self.b2.as_mut_slice());
        out
    }
}

impl TwoLayerGrads {
    fn slices(&self) -> Vec<&[f64]> {
        let mut out: Vec<&[f64]> = self.d_w1.iter().map(Vec::as_slice).collect();
        out.push(self.d_b1.as_slice());
        out.extend(self.d_w2.iter().map(Vec::as_slice));
        out.push(self.d_b2.as_slice());
        out
    }

    fn accumulate(&mut self, other: &TwoLayerGrads) {
        fn add_matrix(a: &mut Matrix, b: &Matrix) {
            for (ra, rb) in a.iter_mut().zip(b) {
                add_vec(ra, rb);
            }
        }
        fn add_vec(a: &mut [f64], b: &[f64]) {
            for (x, &y) in a.iter_mut().zip(b) {
                *x += y;
            }
        }
        add_matrix(&mut self.d_w1, &other.d_w1);
        add_vec(&mut self.d_b1, &other.d_b1);
        add_matrix(&mut self.d_w2, &other.d_w2);
        add_vec(&mut self.d_b2, &other.d_b2);
    }
}

/// Batch-mean value terms of the adversarial objective.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValueTerms {
    /// `-E[log D(x)]`
    pub d_real_neg: f64,
    /// `-E[log(1 - D(G(z)))]`
    pub d_fake_neg: f64,
    /// Generator objective on the same noise.
    pub g_value: f64,
}

impl ValueTerms {
    /// `V(D) = E[log D(x)] + E[log(1 - D(G(z)))]`
    pub fn d_value(&self) -> f64 {
        -(self.d_real_neg + self.d_fake_neg)
    }

    fn emit(&self, sink: &mut dyn MetricSink, step: usize) -> Result<()> {
        sink.scalar("DV_real", -self.d_real_neg, step)?;
        sink.scalar("DV_fake", -self.d_fake_neg, step)?;
        sink.scalar("DV", self.d_value(), step)?;
        sink.scalar("GV", self.g_value, step)
    }
}

/// Step schedule for [`VanillaGan::train`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainSchedule {
    pub batch_size: usize,
    pub num_steps: usize,
    pub learning_rate: f64,
}

impl From<&GanConfig> for TrainSchedule {
    fn from(config: &GanConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            num_steps: config.num_steps,
            learning_rate: config.learning_rate,
        }
    }
}

/// What a finished run reports back.
#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub history: TrainingHistory,
    pub final_d_value: f64,
    pub final_g_value: f64,
    pub figures: usize,
}

/// Generator, discriminator, their optimizers and the run's RNG.
#[derive(Debug)]
pub struct VanillaGan {
    noise_dim: usize,
    input_dim: usize,
    g_hidden: usize,
    d_hidden: usize,
    activation: Arc<dyn Activation + Send + Sync>,
    generator_loss: GeneratorLoss,
    theta_g: GeneratorParams,
    theta_d: DiscriminatorParams,
    g_solver: Adam,
    d_solver: Adam,
    rng: StdRng,
}

impl VanillaGan {
    pub fn new(config: &GanConfig) -> Result<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let theta_g = GeneratorParams::new(&mut rng, config.noise_dim, config.g_hidden, config.input_dim);
        let theta_d = DiscriminatorParams::new(&mut rng, config.input_dim, config.d_hidden, 1);
        if config.generator_loss == GeneratorLoss::NonSaturating {
            warn!("generator uses the non-saturating objective -E[log D(G(z))] instead of the minimax form");
        }
        info!(
            noise_dim = config.noise_dim,
            input_dim = config.input_dim,
            g_hidden = config.g_hidden,
            d_hidden = config.d_hidden,
            "VanillaGAN built and initialized"
        );
        Ok(Self {
            noise_dim: config.noise_dim,
            input_dim: config.input_dim,
            g_hidden: config.g_hidden,
            d_hidden: config.d_hidden,
            activation: config.activation.to_arc(),
            generator_loss: config.generator_loss,
            theta_g,
            theta_d,
            g_solver: Adam::new(config.learning_rate),
            d_solver: Adam::new(config.learning_rate),
            rng,
        })
    }

    pub fn generator(&self) -> &GeneratorParams {
        &self.theta_g
    }

    pub fn discriminator(&self) -> &DiscriminatorParams {
        &self.theta_d
    }

    pub fn noise_dim(&self) -> usize {
        self.noise_dim
    }

    /// Uniform [0, 1) noise, `rows x noise_dim`.
    pub fn sample_noise(&mut self, rows: usize) -> Matrix {
        let dim = self.noise_dim;
        (0..rows)
            .map(|_| (0..dim).map(|_| self.rng.gen::<f64>()).collect())
            .collect()
    }

    fn check_width(data: &Matrix, expected: usize, context: &str) -> Result<()> {
        match data.iter().find(|row| row.len() != expected) {
            Some(row) => Err(NetError::shape(context, expected, row.len())),
            None => Ok(()),
        }
    }

    fn generate_pass(&self, noise: &Matrix) -> (Pass, Matrix) {
        let pass = self.theta_g.forward(noise, self.activation.as_ref());
        let samples = pass.logit.iter().map(|r| r.iter().map(|&v| sigmoid(v)).collect()).collect();
        (pass, samples)
    }

    fn discriminate_pass(&self, x: &Matrix) -> (Pass, Vec<f64>) {
        let pass = self.theta_d.forward(x, self.activation.as_ref());
        let probs = pass.logit.iter().map(|r| sigmoid(r[0])).collect();
        (pass, probs)
    }

    /// Synthetic samples for a batch of noise vectors.
    pub fn generate(&self, noise: &Matrix) -> Result<Matrix> {
        Self::check_width(noise, self.noise_dim, "noise width")?;
        Ok(self.generate_pass(noise).1)
    }

    /// `(probability, logit)` per row.
    pub fn discriminate(&self, samples: &Matrix) -> Result<(Vec<f64>, Vec<f64>)> {
        Self::check_width(samples, self.input_dim, "sample width")?;
        let (pass, probs) = self.discriminate_pass(samples);
        Ok((probs, pass.logit.into_iter().map(|r| r[0]).collect()))
    }

    /// Value terms on `real` and `noise` with the current parameters, no update.
    pub fn value_terms(&self, real: &Matrix, noise: &Matrix) -> Result<ValueTerms> {
        let fake = self.generate(noise)?;
        let (d_real, _) = self.discriminate(real)?;
        let (d_fake, _) = self.discriminate(&fake)?;
        Ok(ValueTerms {
            d_real_neg: real_term(&d_real),
            d_fake_neg: fake_term(&d_fake),
            g_value: self.generator_loss.value(&d_fake),
        })
    }

    /// One discriminator update on `real` and `noise` with θ_G held fixed.
    /// Returns the discriminator loss before the update.
    pub fn discriminator_step(&mut self, real: &Matrix, noise: &Matrix) -> Result<f64> {
        Self::check_width(real, self.input_dim, "real batch width")?;
        let fake = self.generate(noise)?;
        let act = self.activation.as_ref();
        let (real_pass, d_real) = self.discriminate_pass(real);
        let (fake_pass, d_fake) = self.discriminate_pass(&fake);
        let loss = real_term(&d_real) + fake_term(&d_fake);

        let (g_real, g_fake) = discriminator_logit_grads(&d_real, &d_fake);
        let to_col = |g: Vec<f64>| -> Matrix { g.into_iter().map(|v| vec![v]).collect() };
        let (mut grads, _) = self.theta_d.backward(real, &real_pass, &to_col(g_real), act);
        let (fake_grads, _) = self.theta_d.backward(&fake, &fake_pass, &to_col(g_fake), act);
        grads.accumulate(&fake_grads);

        self.d_solver.step(self.theta_d.params_mut(), grads.slices())?;
        Ok(loss)
    }

    /// One generator update on `noise` with θ_D held fixed. Returns the
    /// generator objective before the update.
    pub fn generator_step(&mut self, noise: &Matrix) -> Result<f64> {
        Self::check_width(noise, self.noise_dim, "noise width")?;
        let act = self.activation.as_ref();
        let (g_pass, fake) = self.generate_pass(noise);
        let (d_pass, d_fake) = self.discriminate_pass(&fake);
        let value = self.generator_loss.value(&d_fake);

        let d_logit: Matrix = self.generator_loss.logit_grad(&d_fake).into_iter().map(|v| vec![v]).collect();
        // gradient flows through D into its input; D's own grads are discarded
        let (_, d_samples) = self.theta_d.backward(&fake, &d_pass, &d_logit, act);
        let d_g_logit: Matrix = d_samples
            .iter()
            .zip(&fake)
            .map(|(d, s)| d.iter().zip(s).map(|(&g, &p)| g * p * (1.0 - p)).collect())
            .collect();
        let (grads, _) = self.theta_g.backward(noise, &g_pass, &d_g_logit, act);

        self.g_solver.step(self.theta_g.params_mut(), grads.slices())?;
        Ok(value)
    }

    fn emit_run_scalars(&self, sink: &mut dyn MetricSink) -> Result<()> {
        sink.scalar("data dimension", self.input_dim as f64, 0)?;
        sink.scalar("noise prior dimension", self.noise_dim as f64, 0)?;
        sink.scalar("generator hidden size", self.g_hidden as f64, 0)?;
        sink.scalar("discriminator hidden size", self.d_hidden as f64, 0)
    }

    /// Alternate discriminator and generator steps over `dataset`.
    ///
    /// Every `num_steps / 10` steps a sample grid from a fixed noise batch is
    /// written to `run`; every `num_steps / 100` steps V(D) and V(G) are
    /// appended to the history and emitted to `sink`.
    pub fn train(
        &mut self,
        dataset: &Matrix,
        schedule: TrainSchedule,
        run: &RunDir,
        sink: &mut dyn MetricSink,
    ) -> Result<TrainingReport> {
        if dataset.is_empty() {
            return Err(NetError::EmptyDataset("GAN training set".to_string()));
        }
        Self::check_width(dataset, self.input_dim, "training sample width")?;
        if schedule.batch_size == 0 {
            return Err(NetError::Config("batch_size must be positive".to_string()));
        }
        self.d_solver.lr = schedule.learning_rate;
        self.g_solver.lr = schedule.learning_rate;

        let num_steps = schedule.num_steps;
        let display_step = (num_steps / 10).max(1);
        let summary_step = (num_steps / 100).max(1);

        let mut perm: Vec<usize> = (0..dataset.len()).collect();
        perm.shuffle(&mut self.rng);
        let x: Matrix = perm.iter().map(|&i| dataset[i].clone()).collect();
        let display_z = self.sample_noise(GRID_SIDE * GRID_SIDE);

        self.emit_run_scalars(sink)?;
        info!("Training GAN for {} steps", num_steps);
        let mut history = TrainingHistory::new();
        let mut figures = 0;

        for step in 0..num_steps {
            let batch_x = next_batch(&x, step, schedule.batch_size);
            let batch_z_d = self.sample_noise(schedule.batch_size);
            let d_loss = self.discriminator_step(&batch_x, &batch_z_d)?;

            let batch_z_g = self.sample_noise(schedule.batch_size);
            let g_value = self.generator_step(&batch_z_g)?;

            if !d_loss.is_finite() || !g_value.is_finite() {
                return Err(NetError::NonFinite { step });
            }
            debug!(step, d_value = -d_loss, g_value, "gan step");

            if step % display_step == 0 {
                info!("Batch({} cases) value function at step {}", batch_x.len(), step);
                info!("V(D) = {:.6}, V(G) = {:.6}", -d_loss, g_value);
                let samples = self.generate(&display_z)?;
                save_sample_grid(run.join(&format!("sample_{figures}.png")), &samples)?;
                figures += 1;
            }

            if step % summary_step == 0 {
                history.record(step, -d_loss, g_value);
                self.value_terms(&batch_x, &batch_z_g)?.emit(sink, step)?;
            }
        }

        let z_d = self.sample_noise(x.len());
        let z_g = self.sample_noise(x.len());
        let final_d = self.value_terms(&x, &z_d)?;
        let final_terms = self.value_terms(&x, &z_g)?;
        let final_d_value = final_d.d_value();
        let final_g_value = final_terms.g_value;
        if !final_d_value.is_finite() || !final_g_value.is_finite() {
            return Err(NetError::NonFinite { step: num_steps });
        }
        info!("Finish training\nV(D) = {:.6}, V(G) = {:.6}", final_d_value, final_g_value);
        final_terms.emit(sink, num_steps)?;
        sink.flush()?;

        let samples = self.generate(&display_z)?;
        save_sample_grid(run.join(&format!("sample_{figures}.png")), &samples)?;
        figures += 1;
        history.save_csv(run.join("history.csv"))?;

        Ok(TrainingReport {
            history,
            final_d_value,
            final_g_value,
            figures,
        })
    }

    /// Write both parameter sets as gzipped JSON.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let snapshot = GanSnapshot {
            theta_g: self.theta_g.clone(),
            theta_d: self.theta_d.clone(),
        };
        let json = serde_json::to_vec(&snapshot)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut enc = GzEncoder::new(File::create(path)?, Compression::default());
        enc.write_all(&json)?;
        enc.finish()?;
        Ok(())
    }

    /// Replace both parameter sets with a saved snapshot of matching shape.
    /// Optimizer moments start fresh.
    pub fn load_params<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let mut buf = Vec::new();
        GzDecoder::new(File::open(path)?).read_to_end(&mut buf)?;
        let snapshot: GanSnapshot = serde_json::from_slice(&buf)?;
        snapshot
            .theta_g
            .check_shape("generator", self.noise_dim, self.g_hidden, self.input_dim)?;
        snapshot
            .theta_d
            .check_shape("discriminator", self.input_dim, self.d_hidden, 1)?;
        self.theta_g = snapshot.theta_g;
        self.theta_d = snapshot.theta_d;
        self.g_solver = Adam::new(self.g_solver.lr);
        self.d_solver = Adam::new(self.d_solver.lr);
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct GanSnapshot {
    theta_g: GeneratorParams,
    theta_d: DiscriminatorParams,
}
