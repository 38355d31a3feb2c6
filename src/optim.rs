//! Adam optimizer over flat parameter slices.
use crate::error::{NetError, Result};
use serde::{Deserialize, Serialize};

/// Adam with bias correction.
///
/// One instance is bound to one parameter set: callers pass the parameter
/// slices and their gradients in the same fixed order every step, and the
/// moment buffers are keyed by position in that order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Adam {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    t: u64,
    m: Vec<Vec<f64>>,
    v: Vec<Vec<f64>>,
}

impl Adam {
    pub fn new(lr: f64) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            t: 0,
            m: Vec::new(),
            v: Vec::new(),
        }
    }

    pub fn step_count(&self) -> u64 {
        self.t
    }

    /// Apply one update: `p -= lr * m_hat / (sqrt(v_hat) + eps)`.
    pub fn step(&mut self, params: Vec<&mut [f64]>, grads: Vec<&[f64]>) -> Result<()> {
        if params.len() != grads.len() {
            return Err(NetError::shape("adam parameter slots", params.len(), grads.len()));
        }
        if self.m.is_empty() {
            self.m = grads.iter().map(|g| vec![0.0; g.len()]).collect();
            self.v = grads.iter().map(|g| vec![0.0; g.len()]).collect();
        } else if self.m.len() != grads.len() {
            return Err(NetError::shape("adam parameter slots", self.m.len(), grads.len()));
        }
        self.t += 1;
        let t = self.t as i32;
        let bc1 = 1.0 - self.beta1.powi(t);
        let bc2 = 1.0 - self.beta2.powi(t);

        for (slot, (param, grad)) in params.into_iter().zip(grads).enumerate() {
            if param.len() != grad.len() || self.m[slot].len() != grad.len() {
                return Err(NetError::shape(format!("adam slot {slot}"), param.len(), grad.len()));
            }
            let m = &mut self.m[slot];
            let v = &mut self.v[slot];
            for i in 0..grad.len() {
                let g = grad[i];
                m[i] = self.beta1 * m[i] + (1.0 - self.beta1) * g;
                v[i] = self.beta2 * v[i] + (1.0 - self.beta2) * g * g;
                let m_hat = m[i] / bc1;
                let v_hat = v[i] / bc2;
                param[i] -= self.lr * m_hat / (v_hat.sqrt() + self.epsilon);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_step_moves_by_learning_rate() {
        let mut adam = Adam::new(0.1);
        let mut p = vec![1.0, -1.0];
        adam.step(vec![p.as_mut_slice()], vec![&[2.0, -3.0][..]]).unwrap();
        // bias-corrected first step is lr * sign(g)
        assert!((p[0] - 0.9).abs() < 1e-6);
        assert!((p[1] + 0.9).abs() < 1e-6);
        assert_eq!(adam.step_count(), 1);
    }

    #[test]
    fn test_slot_mismatch_is_rejected() {
        let mut adam = Adam::new(0.1);
        let mut p = vec![0.0; 2];
        let err = adam.step(vec![p.as_mut_slice()], vec![&[1.0][..]]).unwrap_err();
        assert!(matches!(err, NetError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_minimises_quadratic() {
        let mut adam = Adam::new(0.05);
        let mut x = vec![3.0];
        for _ in 0..500 {
            let g = vec![2.0 * (x[0] - 1.0)];
            adam.step(vec![x.as_mut_slice()], vec![g.as_slice()]).unwrap();
        }
        assert!((x[0] - 1.0).abs() < 1e-2);
    }
}
