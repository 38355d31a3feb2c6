//! Loss and value functions for the classifier and the adversarial pair.
//!
//! Every function that takes a log first clamps probabilities into
//! `[PROB_EPS, 1 - PROB_EPS]`, so a saturated sigmoid never produces
//! `-inf`/NaN. Gradients are taken w.r.t. the pre-sigmoid logit, where the
//! log-sigmoid derivative is exact and needs no clamping.
use serde::{Deserialize, Serialize};

/// Probabilities are kept this far away from 0 and 1 before taking logs.
pub const PROB_EPS: f64 = 1e-7;

/// NaN passes through so callers can detect diverged parameters.
pub fn clamp_prob(p: f64) -> f64 {
    p.clamp(PROB_EPS, 1.0 - PROB_EPS)
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 { 0.0 } else { sum / n as f64 }
}

/// Mean binary cross-entropy of predicted probabilities against 0/1 targets.
pub fn binary_cross_entropy(pred: &[f64], target: &[f64]) -> f64 {
    mean(pred.iter().zip(target).map(|(&p, &t)| {
        let p = clamp_prob(p);
        -(t * p.ln() + (1.0 - t) * (1.0 - p).ln())
    }))
}

/// d(mean BCE)/d(logit) for a sigmoid output: `(p - t) / n`.
pub fn binary_cross_entropy_logit_grad(pred: &[f64], target: &[f64]) -> Vec<f64> {
    let n = pred.len().max(1) as f64;
    pred.iter().zip(target).map(|(&p, &t)| (p - t) / n).collect()
}

/// `-E[log D(x)]` over a batch of real-sample probabilities.
pub fn real_term(d_real: &[f64]) -> f64 {
    mean(d_real.iter().map(|&p| -clamp_prob(p).ln()))
}

/// `-E[log(1 - D(G(z)))]` over a batch of generated-sample probabilities.
pub fn fake_term(d_fake: &[f64]) -> f64 {
    mean(d_fake.iter().map(|&p| -(1.0 - clamp_prob(p)).ln()))
}

/// Discriminator loss `-E[log D(x)] - E[log(1 - D(G(z)))]`.
pub fn discriminator_loss(d_real: &[f64], d_fake: &[f64]) -> f64 {
    real_term(d_real) + fake_term(d_fake)
}

/// Logit gradients of [`discriminator_loss`] for the real and fake halves.
pub fn discriminator_logit_grads(d_real: &[f64], d_fake: &[f64]) -> (Vec<f64>, Vec<f64>) {
    let nr = d_real.len().max(1) as f64;
    let nf = d_fake.len().max(1) as f64;
    (
        d_real.iter().map(|&p| (p - 1.0) / nr).collect(),
        d_fake.iter().map(|&p| p / nf).collect(),
    )
}

/// Generator objective.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum GeneratorLoss {
    /// Minimise `E[log(1 - D(G(z)))]`, the literal minimax objective.
    #[default]
    Saturating,
    /// Minimise `-E[log D(G(z))]`.
    NonSaturating,
}

impl GeneratorLoss {
    pub fn value(self, d_fake: &[f64]) -> f64 {
        match self {
            GeneratorLoss::Saturating => mean(d_fake.iter().map(|&p| (1.0 - clamp_prob(p)).ln())),
            GeneratorLoss::NonSaturating => real_term(d_fake),
        }
    }

    /// Gradient of [`GeneratorLoss::value`] w.r.t. the discriminator logits.
    pub fn logit_grad(self, d_fake: &[f64]) -> Vec<f64> {
        let n = d_fake.len().max(1) as f64;
        match self {
            GeneratorLoss::Saturating => d_fake.iter().map(|&p| -p / n).collect(),
            GeneratorLoss::NonSaturating => d_fake.iter().map(|&p| (p - 1.0) / n).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_terms_stay_finite_at_saturation() {
        assert!(real_term(&[0.0, 0.0]).is_finite());
        assert!(fake_term(&[1.0]).is_finite());
        assert!(GeneratorLoss::Saturating.value(&[1.0]).is_finite());
        assert!(binary_cross_entropy(&[0.0, 1.0], &[1.0, 0.0]).is_finite());
    }

    #[test]
    fn test_nan_probability_is_not_hidden() {
        assert!(clamp_prob(f64::NAN).is_nan());
        assert!(discriminator_loss(&[0.9, f64::NAN], &[0.1]).is_nan());
        assert!(GeneratorLoss::Saturating.value(&[f64::NAN]).is_nan());
        assert_eq!(clamp_prob(1.0), 1.0 - PROB_EPS);
    }

    #[test]
    fn test_discriminator_loss_at_chance() {
        let loss = discriminator_loss(&[0.5, 0.5], &[0.5]);
        assert!((loss - 2.0 * std::f64::consts::LN_2).abs() < 1e-12);
    }

    #[test]
    fn test_saturating_generator_value_is_negative() {
        let v = GeneratorLoss::Saturating.value(&[0.2, 0.4]);
        let expected = ((0.8f64).ln() + (0.6f64).ln()) / 2.0;
        assert!((v - expected).abs() < 1e-12);
    }

    #[test]
    fn test_logit_grads_match_finite_difference() {
        use crate::activations::sigmoid;
        let logit = 0.3;
        let h = 1e-6;
        let f = |l: f64| GeneratorLoss::Saturating.value(&[sigmoid(l)]);
        let numeric = (f(logit + h) - f(logit - h)) / (2.0 * h);
        let analytic = GeneratorLoss::Saturating.logit_grad(&[sigmoid(logit)])[0];
        assert!((numeric - analytic).abs() < 1e-6);

        let g = |l: f64| discriminator_loss(&[sigmoid(l)], &[]);
        let numeric = (g(logit + h) - g(logit - h)) / (2.0 * h);
        let (real, _) = discriminator_logit_grads(&[sigmoid(logit)], &[]);
        assert!((numeric - real[0]).abs() < 1e-6);
    }

    #[test]
    fn test_bce_grad_sign() {
        let g = binary_cross_entropy_logit_grad(&[0.9, 0.1], &[0.0, 1.0]);
        assert!(g[0] > 0.0 && g[1] < 0.0);
    }
}
