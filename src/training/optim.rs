//! Optimizer trait, Adam and global-norm gradient clipping

use nalgebra::DMatrix;

use crate::neural::{Gradients, ParamStore};

/// Trait for optimization algorithms
#[cfg_attr(test, mockall::automock)]
pub trait Optimizer {
    /// Apply one update to every trainable parameter that received a gradient
    fn step(&mut self, params: &mut ParamStore, grads: &Gradients);

    /// Get learning rate
    fn lr(&self) -> f32;

    /// Set learning rate
    fn set_lr(&mut self, lr: f32);
}

/// Adam with bias correction and no weight decay
///
/// m_t = β1·m + (1-β1)·g, v_t = β2·v + (1-β2)·g²,
/// θ -= lr · m̂ / (√v̂ + ε) with m̂ = m_t/(1-β1^t), v̂ = v_t/(1-β2^t)
#[derive(Debug, Clone)]
pub struct Adam {
    lr: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    t: u64,
    m: Vec<Option<DMatrix<f32>>>, // First moment
    v: Vec<Option<DMatrix<f32>>>, // Second moment
}

impl Adam {
    /// Create a new Adam optimizer
    pub fn new(lr: f32, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Self { lr, beta1, beta2, epsilon, t: 0, m: Vec::new(), v: Vec::new() }
    }

    /// Adam with β = (0.9, 0.999), ε = 1e-8
    pub fn default_params(lr: f32) -> Self {
        Self::new(lr, 0.9, 0.999, 1e-8)
    }

    /// Number of steps taken
    pub fn step_count(&self) -> u64 {
        self.t
    }
}

impl Optimizer for Adam {
    fn step(&mut self, params: &mut ParamStore, grads: &Gradients) {
        if self.m.len() != params.len() {
            self.m = vec![None; params.len()];
            self.v = vec![None; params.len()];
        }
        self.t += 1;

        let (b1, b2, eps, lr) = (self.beta1, self.beta2, self.epsilon, self.lr);
        let bias1 = 1.0 - b1.powi(self.t as i32);
        let bias2 = 1.0 - b2.powi(self.t as i32);

        let slots = self.m.iter_mut().zip(self.v.iter_mut());
        for ((param, grad), (m, v)) in params.iter_mut().zip(grads.iter()).zip(slots) {
            let Some(grad) = grad else { continue };
            if !param.is_trainable() {
                continue;
            }
            let (rows, cols) = grad.shape();
            let m = m.get_or_insert_with(|| DMatrix::zeros(rows, cols));
            let v = v.get_or_insert_with(|| DMatrix::zeros(rows, cols));

            let values = param.value_mut().iter_mut();
            for (((p, &g), m), v) in values.zip(grad.iter()).zip(m.iter_mut()).zip(v.iter_mut()) {
                *m = b1 * *m + (1.0 - b1) * g;
                *v = b2 * *v + (1.0 - b2) * g * g;
                let m_hat = *m / bias1;
                let v_hat = *v / bias2;
                *p -= lr * m_hat / (v_hat.sqrt() + eps);
            }
        }
    }

    fn lr(&self) -> f32 {
        self.lr
    }

    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }
}

/// Clip gradients by global norm
///
/// global_norm = sqrt(sum of all squared gradient elements). When it exceeds `max_norm`
/// every gradient is scaled by `max_norm / (global_norm + 1e-6)`.
///
/// # Returns
/// The global norm before clipping
pub fn clip_grad_norm(grads: &mut Gradients, max_norm: f32) -> f32 {
    let global_norm = grads.global_norm();
    let clip_coef = max_norm / (global_norm + 1e-6);
    if clip_coef < 1.0 {
        grads.scale(clip_coef);
    }
    global_norm
}
