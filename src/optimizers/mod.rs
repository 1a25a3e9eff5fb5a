//! Optimizer abstractions for neural network parameter updates
//!
//! Optimizers turn the gradients produced by [`Layer::gradient`](crate::layers::Layer::gradient)
//! into parameter updates. The basic gradient descent update is
//! `weight = weight - learning_rate * gradient`; Adam adds momentum and per-parameter
//! adaptive step sizes.
//!
//! # Slots
//!
//! A network updates many parameter tensors with one optimizer. Each tensor is identified
//! by a `slot` number (the network uses `2 * layer_index` for weights and
//! `2 * layer_index + 1` for biases), and stateful optimizers keep their moment estimates
//! per slot so tensors of different sizes never share state.
//!
//! # Available Optimizers
//!
//! - [`Sgd`]: vanilla stochastic gradient descent
//! - [`Adam`]: adaptive moment estimation with bias correction
//!
//! # Example
//!
//! ```
//! use neural_toolkit::optimizers::{Optimizer, Sgd};
//!
//! let mut optimizer = Sgd::new(0.1);
//! let mut weights = vec![1.0, 2.0];
//! optimizer.update(0, &mut weights, &[1.0, -1.0]);
//! assert!((weights[0] - 0.9).abs() < 1e-6);
//! ```

pub mod adam;
pub mod sgd;

pub use adam::Adam;
pub use sgd::Sgd;

use crate::config::{OptimizerKind, TrainingConfig};

/// Core trait for neural network optimizers.
pub trait Optimizer: Send {
    /// Applies one update to the tensor registered under `slot`.
    ///
    /// # Panics
    ///
    /// Panics if `parameters` and `gradients` have different lengths.
    fn update(&mut self, slot: usize, parameters: &mut [f32], gradients: &[f32]);

    /// Clears any accumulated state (moments, step counters) for every slot.
    fn reset(&mut self);

    fn learning_rate(&self) -> f32;

    fn set_learning_rate(&mut self, lr: f32);
}

/// Builds the optimizer selected by `config`.
pub fn from_config(config: &TrainingConfig) -> Box<dyn Optimizer> {
    match config.optimizer {
        OptimizerKind::Sgd => Box::new(Sgd::new(config.learning_rate)),
        OptimizerKind::Adam => Box::new(Adam::new(
            config.learning_rate,
            config.beta1,
            config.beta2,
            config.epsilon,
        )),
    }
}
