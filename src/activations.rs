//! Element-wise activation functions used by the dense layers of both pipelines.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Element-wise activation with its derivative w.r.t. the pre-activation.
pub trait Activation: fmt::Debug + Send + Sync {
    fn kind(&self) -> ActivationKind;
    fn apply(&self, x: f64) -> f64;
    fn derivative(&self, x: f64) -> f64;
    fn apply_vec(&self, x: &[f64]) -> Vec<f64> {
        x.iter().map(|&xi| self.apply(xi)).collect()
    }
}

/// ReLU: max(0, x)
#[derive(Debug, Clone, Default)]
pub struct ReLU;

impl Activation for ReLU {
    fn kind(&self) -> ActivationKind {
        ActivationKind::Relu
    }
    fn apply(&self, x: f64) -> f64 {
        x.max(0.0)
    }
    fn derivative(&self, x: f64) -> f64 {
        (x > 0.0) as u8 as f64
    }
}

/// Sigmoid: 1 / (1 + exp(-x))
#[derive(Debug, Clone, Default)]
pub struct Sigmoid;

impl Activation for Sigmoid {
    fn kind(&self) -> ActivationKind {
        ActivationKind::Sigmoid
    }
    fn apply(&self, x: f64) -> f64 {
        sigmoid(x)
    }
    fn derivative(&self, x: f64) -> f64 {
        let s = sigmoid(x);
        s * (1.0 - s)
    }
}

/// Tanh
#[derive(Debug, Clone, Default)]
pub struct Tanh;

impl Activation for Tanh {
    fn kind(&self) -> ActivationKind {
        ActivationKind::Tanh
    }
    fn apply(&self, x: f64) -> f64 {
        x.tanh()
    }
    fn derivative(&self, x: f64) -> f64 {
        let t = x.tanh();
        1.0 - t * t
    }
}

/// LeakyReLU: x if x > 0 else alpha * x (alpha=0.01 default)
#[derive(Debug, Clone)]
pub struct LeakyReLU {
    pub alpha: f64,
}

impl Default for LeakyReLU {
    fn default() -> Self {
        Self { alpha: 0.01 }
    }
}

impl Activation for LeakyReLU {
    fn kind(&self) -> ActivationKind {
        ActivationKind::LeakyRelu
    }
    fn apply(&self, x: f64) -> f64 {
        if x > 0.0 { x } else { self.alpha * x }
    }
    fn derivative(&self, x: f64) -> f64 {
        if x > 0.0 { 1.0 } else { self.alpha }
    }
}

/// Linear: identity
#[derive(Debug, Clone, Default)]
pub struct Linear;

impl Activation for Linear {
    fn kind(&self) -> ActivationKind {
        ActivationKind::Linear
    }
    fn apply(&self, x: f64) -> f64 {
        x
    }
    fn derivative(&self, _x: f64) -> f64 {
        1.0
    }
}

/// Numerically stable logistic function.
pub fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// Serializable activation kinds, used in configs and model blobs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActivationKind {
    #[default]
    Relu,
    Sigmoid,
    Tanh,
    LeakyRelu,
    Linear,
}

impl ActivationKind {
    pub fn to_arc(self) -> Arc<dyn Activation + Send + Sync> {
        match self {
            ActivationKind::Relu => Arc::new(ReLU),
            ActivationKind::Sigmoid => Arc::new(Sigmoid),
            ActivationKind::Tanh => Arc::new(Tanh),
            ActivationKind::LeakyRelu => Arc::new(LeakyReLU::default()),
            ActivationKind::Linear => Arc::new(Linear),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sigmoid_is_stable_for_large_inputs() {
        assert!(sigmoid(-800.0).is_finite());
        assert!((sigmoid(800.0) - 1.0).abs() < 1e-12);
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_kind_roundtrip_through_trait_object() {
        for kind in [
            ActivationKind::Relu,
            ActivationKind::Sigmoid,
            ActivationKind::Tanh,
            ActivationKind::LeakyRelu,
            ActivationKind::Linear,
        ] {
            let arc = kind.to_arc();
            assert_eq!(arc.kind(), kind);
        }
    }

    #[test]
    fn test_relu_derivative() {
        assert_eq!(ReLU.derivative(2.0), 1.0);
        assert_eq!(ReLU.derivative(-2.0), 0.0);
    }
}
