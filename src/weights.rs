//! Parameter initialization
//!
//! [`WeightsProvider`] allocates the trainable tensors of every weighted layer. Weight
//! schemes scale with the fan-in/fan-out of the layer; bias schemes are independent of
//! the layer geometry. The provider owns a seeded [`StdRng`], so two providers built from
//! the same seed produce identical networks.

use crate::layers::NormalizationMode;
use crate::tensor::{Shape, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

/// Standard deviation of the `Gaussian` bias scheme.
const GAUSSIAN_BIAS_STD: f32 = 0.01;

/// Initialization scheme for weights and convolution kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightsInitializationMode {
    /// Uniform in `±sqrt(3 / fan_in)`.
    LeCunUniform,
    /// Uniform in `±sqrt(6 / (fan_in + fan_out))`.
    #[default]
    GlorotUniform,
    /// Normal with `std = sqrt(2 / (fan_in + fan_out))`.
    GlorotNormal,
    /// Uniform in `±sqrt(6 / fan_in)`.
    HeEtAlUniform,
    /// Normal with `std = sqrt(2 / fan_in)`.
    HeEtAlNormal,
}

/// Initialization scheme for biases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BiasInitializationMode {
    #[default]
    Zero,
    Gaussian,
}

/// Seeded source of initial layer parameters.
///
/// # Example
///
/// ```
/// use neural_toolkit::weights::WeightsProvider;
/// let mut provider = WeightsProvider::new(42);
/// let w = provider.new_fully_connected_weights(784, 128);
/// assert_eq!(w.dims(), [784, 128, 1, 1]);
/// ```
#[derive(Debug, Clone)]
pub struct WeightsProvider {
    rng: StdRng,
    weights_mode: WeightsInitializationMode,
    bias_mode: BiasInitializationMode,
}

impl WeightsProvider {
    /// Provider with the default schemes (Glorot uniform weights, zero biases).
    pub fn new(seed: u64) -> Self {
        Self::with_modes(
            seed,
            WeightsInitializationMode::default(),
            BiasInitializationMode::default(),
        )
    }

    pub fn with_modes(
        seed: u64,
        weights_mode: WeightsInitializationMode,
        bias_mode: BiasInitializationMode,
    ) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            weights_mode,
            bias_mode,
        }
    }

    pub fn weights_mode(&self) -> WeightsInitializationMode {
        self.weights_mode
    }

    pub fn bias_mode(&self) -> BiasInitializationMode {
        self.bias_mode
    }

    /// Weights of a fully connected layer: `inputs` entities of shape `(outputs, 1, 1)`.
    pub fn new_fully_connected_weights(&mut self, inputs: usize, outputs: usize) -> Tensor {
        let mut weights = Tensor::zeros(inputs, Shape::flat(outputs));
        self.fill_weights(weights.as_mut_slice(), inputs, outputs);
        weights
    }

    /// `kernels` convolution kernels of shape `(in_channels, size, size)`.
    pub fn new_convolutional_kernels(
        &mut self,
        kernels: usize,
        in_channels: usize,
        size: usize,
    ) -> Tensor {
        let mut weights = Tensor::zeros(kernels, Shape::new(in_channels, size, size));
        let receptive = size * size;
        self.fill_weights(
            weights.as_mut_slice(),
            in_channels * receptive,
            kernels * receptive,
        );
        weights
    }

    /// A single entity of `count` biases.
    pub fn new_biases(&mut self, count: usize) -> Tensor {
        let mut biases = Tensor::zeros(1, Shape::flat(count));
        if self.bias_mode == BiasInitializationMode::Gaussian {
            for b in biases.as_mut_slice() {
                let z: f32 = self.rng.sample(StandardNormal);
                *b = z * GAUSSIAN_BIAS_STD;
            }
        }
        biases
    }

    /// Batch normalization scale, all ones, laid out for `mode`.
    pub fn new_gamma_parameters(&mut self, shape: Shape, mode: NormalizationMode) -> Tensor {
        Tensor::filled(1, mode.parameter_shape(shape), 1.0)
    }

    /// Batch normalization shift, all zeros, laid out for `mode`.
    pub fn new_beta_parameters(&mut self, shape: Shape, mode: NormalizationMode) -> Tensor {
        Tensor::zeros(1, mode.parameter_shape(shape))
    }

    fn fill_weights(&mut self, values: &mut [f32], fan_in: usize, fan_out: usize) {
        let fan_in = fan_in.max(1) as f32;
        let fan_out = fan_out.max(1) as f32;
        match self.weights_mode {
            WeightsInitializationMode::LeCunUniform => {
                self.fill_uniform(values, (3.0 / fan_in).sqrt())
            }
            WeightsInitializationMode::GlorotUniform => {
                self.fill_uniform(values, (6.0 / (fan_in + fan_out)).sqrt())
            }
            WeightsInitializationMode::GlorotNormal => {
                self.fill_normal(values, (2.0 / (fan_in + fan_out)).sqrt())
            }
            WeightsInitializationMode::HeEtAlUniform => {
                self.fill_uniform(values, (6.0 / fan_in).sqrt())
            }
            WeightsInitializationMode::HeEtAlNormal => {
                self.fill_normal(values, (2.0 / fan_in).sqrt())
            }
        }
    }

    fn fill_uniform(&mut self, values: &mut [f32], limit: f32) {
        for v in values {
            *v = self.rng.random_range(-limit..limit);
        }
    }

    fn fill_normal(&mut self, values: &mut [f32], std: f32) {
        for v in values {
            let z: f32 = self.rng.sample(StandardNormal);
            *v = z * std;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glorot_uniform_bounds() {
        let mut provider = WeightsProvider::new(7);
        let w = provider.new_fully_connected_weights(10, 20);
        let limit = (6.0f32 / 30.0).sqrt();
        assert_eq!(w.dims(), [10, 20, 1, 1]);
        assert!(w.as_slice().iter().all(|v| v.abs() <= limit));
        assert!(w.as_slice().iter().any(|&v| v != 0.0));
    }

    #[test]
    fn test_same_seed_same_weights() {
        let a = WeightsProvider::new(3).new_convolutional_kernels(4, 2, 3);
        let b = WeightsProvider::new(3).new_convolutional_kernels(4, 2, 3);
        assert!(a.bit_eq(&b));
        assert_eq!(a.dims(), [4, 2, 3, 3]);
    }

    #[test]
    fn test_he_normal_is_centered() {
        let mut provider = WeightsProvider::with_modes(
            11,
            WeightsInitializationMode::HeEtAlNormal,
            BiasInitializationMode::Zero,
        );
        let w = provider.new_fully_connected_weights(100, 100);
        let mean: f32 = w.as_slice().iter().sum::<f32>() / w.len() as f32;
        assert!(mean.abs() < 0.02);
    }

    #[test]
    fn test_bias_modes() {
        let mut zero = WeightsProvider::new(1);
        assert!(zero.new_biases(5).as_slice().iter().all(|&b| b == 0.0));

        let mut gaussian = WeightsProvider::with_modes(
            1,
            WeightsInitializationMode::GlorotUniform,
            BiasInitializationMode::Gaussian,
        );
        let b = gaussian.new_biases(5);
        assert!(b.as_slice().iter().any(|&v| v != 0.0));
        assert!(b.as_slice().iter().all(|v| v.abs() < 0.1));
    }

    #[test]
    fn test_gamma_beta_layouts() {
        let mut provider = WeightsProvider::new(0);
        let shape = Shape::new(3, 4, 4);
        let gamma = provider.new_gamma_parameters(shape, NormalizationMode::Spatial);
        let beta = provider.new_beta_parameters(shape, NormalizationMode::PerActivation);
        assert_eq!(gamma.dims(), [1, 3, 1, 1]);
        assert!(gamma.as_slice().iter().all(|&g| g == 1.0));
        assert_eq!(beta.dims(), [1, 3, 4, 4]);
        assert!(beta.as_slice().iter().all(|&b| b == 0.0));
    }
}
