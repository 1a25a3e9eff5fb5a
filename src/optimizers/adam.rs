//! Adam (Adaptive Moment Estimation) optimizer implementation
//!
//! This module provides the Adam optimizer, which combines momentum and
//! adaptive learning rates with bias correction for improved convergence.

use crate::optimizers::Optimizer;
use std::collections::HashMap;

/// Moment estimates and step counter of one parameter tensor.
#[derive(Debug, Clone, Default)]
struct SlotState {
    m: Vec<f32>,
    v: Vec<f32>,
    t: i32,
}

/// Adam (Adaptive Moment Estimation) optimizer.
///
/// The update rule is:
///
/// ```text
/// m_t = β1 * m_{t-1} + (1 - β1) * gradient
/// v_t = β2 * v_{t-1} + (1 - β2) * gradient²
/// m_hat = m_t / (1 - β1^t)
/// v_hat = v_t / (1 - β2^t)
/// parameter = parameter - α * m_hat / (√v_hat + ε)
/// ```
///
/// `m`, `v` and `t` are tracked separately for every slot.
///
/// # Example
///
/// ```
/// use neural_toolkit::optimizers::{Adam, Optimizer};
///
/// let mut optimizer = Adam::new(0.001, 0.9, 0.999, 1e-8);
/// let mut weights = vec![1.0, 2.0, 3.0];
/// optimizer.update(0, &mut weights, &[0.1, 0.2, 0.3]);
/// assert!(weights[0] < 1.0);
/// ```
///
/// # Reference
///
/// Kingma, D. P., & Ba, J. (2014). Adam: A method for stochastic optimization.
/// arXiv preprint arXiv:1412.6980.
#[derive(Debug, Clone)]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    slots: HashMap<usize, SlotState>,
}

impl Adam {
    /// Creates a new Adam optimizer.
    ///
    /// The original paper recommends `learning_rate = 0.001`, `beta1 = 0.9`,
    /// `beta2 = 0.999` and `epsilon = 1e-8`.
    pub fn new(learning_rate: f32, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Self {
            learning_rate,
            beta1,
            beta2,
            epsilon,
            slots: HashMap::new(),
        }
    }

    /// Number of updates applied to `slot` since creation or the last reset.
    pub fn steps(&self, slot: usize) -> usize {
        self.slots.get(&slot).map_or(0, |s| s.t as usize)
    }
}

impl Optimizer for Adam {
    fn update(&mut self, slot: usize, parameters: &mut [f32], gradients: &[f32]) {
        assert_eq!(
            parameters.len(),
            gradients.len(),
            "Parameters and gradients must have the same length"
        );

        let state = self.slots.entry(slot).or_default();
        // A slot whose tensor changed size starts over.
        if state.m.len() != parameters.len() {
            *state = SlotState {
                m: vec![0.0; parameters.len()],
                v: vec![0.0; parameters.len()],
                t: 0,
            };
        }

        state.t += 1;
        let bias_correction1 = 1.0 - self.beta1.powi(state.t);
        let bias_correction2 = 1.0 - self.beta2.powi(state.t);

        for (i, (param, &grad)) in parameters.iter_mut().zip(gradients).enumerate() {
            state.m[i] = self.beta1 * state.m[i] + (1.0 - self.beta1) * grad;
            state.v[i] = self.beta2 * state.v[i] + (1.0 - self.beta2) * grad * grad;

            let m_hat = state.m[i] / bias_correction1;
            let v_hat = state.v[i] / bias_correction2;
            *param -= self.learning_rate * m_hat / (v_hat.sqrt() + self.epsilon);
        }
    }

    fn reset(&mut self) {
        self.slots.clear();
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f32) {
        self.learning_rate = lr;
    }
}
