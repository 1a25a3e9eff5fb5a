//! Batch normalization layer implementation
//!
//! Normalizes activations with per-channel (`Spatial`) or per-position (`PerActivation`)
//! statistics, then applies the learnable scale `γ` (the layer's weights) and shift `β`
//! (the layer's biases):
//!
//! 1. Normalize: `x̂ = (x - μ) / sqrt(σ² + ε)`
//! 2. Scale and shift: `y = γ·x̂ + β`
//!
//! # Training and inference
//!
//! The two passes are separate calls:
//!
//! - [`Layer::forward_training`] folds the statistics of the current batch into the running
//!   `mu`/`sigma2` by a cumulative moving average and normalizes with the blended result.
//!   The blend factor of the call is `1 / (1 + iteration)`, so the first batch replaces the
//!   initial statistics outright and every later batch carries less weight. The iteration
//!   counter increments once per successful call.
//! - [`Layer::forward`] normalizes with the frozen running statistics and leaves the layer
//!   untouched.
//!
//! [`Layer::backward`] differentiates the most recent training pass: the running statistics
//! it left behind depend on that batch with weight
//! [`BatchNormalizationLayer::last_blend_factor`]. Before any training pass the statistics
//! are constants.
//!
//! The running-statistics update is all or nothing: the kernel fills scratch copies and the
//! layer swaps them in only after the kernel reports success.
//!
//! # References
//!
//! Ioffe, S., & Szegedy, C. (2015). Batch Normalization: Accelerating Deep Network Training
//! by Reducing Internal Covariate Shift. ICML.

use super::{
    check_backward, check_forward, check_gradient, check_parameter, content_hash, Layer,
    LayerKind, ParameterGradients,
};
use crate::backend;
use crate::error::{Error, Result};
use crate::tensor::{Shape, Tensor};
use crate::weights::WeightsProvider;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::str::FromStr;

/// How normalization statistics are shared across a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum NormalizationMode {
    /// One mean/variance per channel, shared by every spatial position.
    Spatial = 0,
    /// One mean/variance per activation position.
    PerActivation = 1,
}

impl NormalizationMode {
    /// Shape of gamma, beta, mu and sigma2 for inputs of `shape`.
    ///
    /// # Examples
    ///
    /// ```
    /// use neural_toolkit::layers::NormalizationMode;
    /// use neural_toolkit::tensor::Shape;
    /// let shape = Shape::new(8, 5, 5);
    /// assert_eq!(NormalizationMode::Spatial.parameter_shape(shape), Shape::flat(8));
    /// assert_eq!(NormalizationMode::PerActivation.parameter_shape(shape), shape);
    /// ```
    pub fn parameter_shape(self, shape: Shape) -> Shape {
        match self {
            NormalizationMode::Spatial => Shape::flat(shape.channels()),
            NormalizationMode::PerActivation => shape,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NormalizationMode::Spatial => "spatial",
            NormalizationMode::PerActivation => "per_activation",
        }
    }
}

impl TryFrom<u8> for NormalizationMode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Spatial),
            1 => Ok(Self::PerActivation),
            other => Err(Error::InvalidMode(format!(
                "unknown normalization mode discriminator {}",
                other
            ))),
        }
    }
}

impl FromStr for NormalizationMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "spatial" => Ok(Self::Spatial),
            "per_activation" | "peractivation" => Ok(Self::PerActivation),
            other => Err(Error::InvalidMode(format!(
                "unknown normalization mode '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for NormalizationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted form of a [`BatchNormalizationLayer`].
///
/// [`BatchNormalizationLayer::from_state`] accepts exactly what
/// [`BatchNormalizationLayer::state`] produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchNormalizationState {
    pub shape: Shape,
    pub mode: NormalizationMode,
    pub iteration: u64,
    pub weights: Tensor,
    pub biases: Tensor,
    pub mu: Tensor,
    pub sigma2: Tensor,
}

/// Batch normalization layer with learnable scale and shift parameters.
///
/// # Fields
///
/// * `shape` - Per-sample input shape; the output shape is identical
/// * `mode` - Statistics layout, see [`NormalizationMode`]
/// * `weights` - Scale `γ`, one entity of `mode.parameter_shape(shape)`
/// * `biases` - Shift `β`, same layout as `weights`
/// * `mu` - Running mean, same layout as `weights`
/// * `sigma2` - Running variance, same layout as `weights`
/// * `iteration` - Number of completed training passes
///
/// # Example
///
/// ```
/// use neural_toolkit::layers::{BatchNormalizationLayer, Layer, NormalizationMode};
/// use neural_toolkit::tensor::{Shape, Tensor};
/// use neural_toolkit::weights::WeightsProvider;
///
/// let mut provider = WeightsProvider::new(42);
/// let shape = Shape::new(2, 2, 2);
/// let mut layer = BatchNormalizationLayer::new(shape, NormalizationMode::Spatial, &mut provider);
/// let x = Tensor::filled(4, shape, 1.0);
/// let _y = layer.forward_training(&x).unwrap();
/// assert_eq!(layer.iteration(), 1);
/// ```
#[derive(Debug)]
pub struct BatchNormalizationLayer {
    shape: Shape,
    mode: NormalizationMode,
    weights: Tensor,
    biases: Tensor,
    mu: Tensor,
    sigma2: Tensor,
    iteration: u64,
}

impl BatchNormalizationLayer {
    /// Creates a fresh layer: `γ` and `β` from `provider`, `mu = 0`, `sigma2 = 1`,
    /// `iteration = 0`.
    pub fn new(shape: Shape, mode: NormalizationMode, provider: &mut WeightsProvider) -> Self {
        let parameter_shape = mode.parameter_shape(shape);
        Self::from_parts(
            shape,
            mode,
            provider.new_gamma_parameters(shape, mode),
            provider.new_beta_parameters(shape, mode),
            Tensor::zeros(1, parameter_shape),
            Tensor::filled(1, parameter_shape, 1.0),
            0,
        )
    }

    /// Rebuilds a layer from previously saved parameters and statistics.
    ///
    /// The tensors are adopted as they are. Only `weights` and `biases` are checked against
    /// the layout `mode` implies for `shape`; `mu` and `sigma2` are trusted, and a mismatch
    /// there surfaces as a backend error on the first pass that reads them.
    pub fn restore(
        shape: Shape,
        mode: NormalizationMode,
        weights: Tensor,
        biases: Tensor,
        mu: Tensor,
        sigma2: Tensor,
        iteration: u64,
    ) -> Result<Self> {
        let parameter_shape = mode.parameter_shape(shape);
        check_parameter("batch normalization weights", &weights, 1, parameter_shape)?;
        check_parameter("batch normalization biases", &biases, 1, parameter_shape)?;
        Ok(Self::from_parts(
            shape, mode, weights, biases, mu, sigma2, iteration,
        ))
    }

    /// Snapshot of everything needed to [`restore`](Self::restore) this layer.
    pub fn state(&self) -> BatchNormalizationState {
        BatchNormalizationState {
            shape: self.shape,
            mode: self.mode,
            iteration: self.iteration,
            weights: self.weights.clone(),
            biases: self.biases.clone(),
            mu: self.mu.clone(),
            sigma2: self.sigma2.clone(),
        }
    }

    pub fn from_state(state: BatchNormalizationState) -> Result<Self> {
        Self::restore(
            state.shape,
            state.mode,
            state.weights,
            state.biases,
            state.mu,
            state.sigma2,
            state.iteration,
        )
    }

    fn from_parts(
        shape: Shape,
        mode: NormalizationMode,
        weights: Tensor,
        biases: Tensor,
        mu: Tensor,
        sigma2: Tensor,
        iteration: u64,
    ) -> Self {
        Self {
            shape,
            mode,
            weights,
            biases,
            mu,
            sigma2,
            iteration,
        }
    }

    pub fn mode(&self) -> NormalizationMode {
        self.mode
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn mu(&self) -> &Tensor {
        &self.mu
    }

    pub fn sigma2(&self) -> &Tensor {
        &self.sigma2
    }

    /// Weight the next training pass gives to its batch statistics.
    pub fn blend_factor(&self) -> f32 {
        (1.0 / (1.0 + self.iteration as f64)) as f32
    }

    /// Blend factor of the training pass that produced the current statistics, or 0 before
    /// any training pass.
    pub fn last_blend_factor(&self) -> f32 {
        match self.iteration {
            0 => 0.0,
            n => (1.0 / n as f64) as f32,
        }
    }
}

impl Clone for BatchNormalizationLayer {
    fn clone(&self) -> Self {
        Self::from_parts(
            self.shape,
            self.mode,
            self.weights.clone(),
            self.biases.clone(),
            self.mu.clone(),
            self.sigma2.clone(),
            self.iteration,
        )
    }
}

impl Layer for BatchNormalizationLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::BatchNormalization
    }

    fn input_shape(&self) -> Shape {
        self.shape
    }

    fn output_shape(&self) -> Shape {
        self.shape
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        check_forward(x, self.shape)?;
        let mut y = Tensor::like(x);
        backend::current()?.batch_normalization_forward_inference(
            self.mode,
            x,
            &self.weights,
            &self.biases,
            &self.mu,
            &self.sigma2,
            &mut y,
        )?;
        Ok(y)
    }

    fn forward_training(&mut self, x: &Tensor) -> Result<Tensor> {
        check_forward(x, self.shape)?;
        let factor = self.blend_factor();
        let mut y = Tensor::like(x);
        let mut mu = self.mu.clone();
        let mut sigma2 = self.sigma2.clone();
        backend::current()?.batch_normalization_forward_training(
            self.mode,
            factor,
            x,
            &self.weights,
            &self.biases,
            &mut mu,
            &mut sigma2,
            &mut y,
        )?;

        self.mu = mu;
        self.sigma2 = sigma2;
        self.iteration += 1;
        log::trace!(
            "batch normalization {} ({}) iteration {} blended with factor {}",
            self.shape,
            self.mode,
            self.iteration,
            factor
        );
        Ok(y)
    }

    fn backward(&self, x: &Tensor, y: &Tensor, dy: &Tensor) -> Result<Tensor> {
        check_backward(x, y, dy, self.shape, self.shape)?;
        let mut dx = Tensor::like(x);
        backend::current()?.batch_normalization_backward_data(
            self.mode,
            self.last_blend_factor(),
            x,
            &self.weights,
            &self.mu,
            &self.sigma2,
            dy,
            &mut dx,
        )?;
        Ok(dx)
    }

    fn gradient(&self, x: &Tensor, dy: &Tensor) -> Result<Option<ParameterGradients>> {
        check_gradient(x, dy, self.shape, self.shape)?;
        let backend = backend::current()?;
        let mut weights = Tensor::like(&self.weights);
        let mut biases = Tensor::like(&self.biases);
        backend.batch_normalization_backward_gamma(
            self.mode,
            x,
            &self.mu,
            &self.sigma2,
            dy,
            &mut weights,
        )?;
        backend.batch_normalization_backward_beta(self.mode, dy, &mut biases)?;
        Ok(Some(ParameterGradients { weights, biases }))
    }

    fn parameters(&self) -> Option<(&Tensor, &Tensor)> {
        Some((&self.weights, &self.biases))
    }

    fn parameters_mut(&mut self) -> Option<(&mut Tensor, &mut Tensor)> {
        Some((&mut self.weights, &mut self.biases))
    }

    fn equals(&self, other: &dyn Layer) -> bool {
        other
            .as_any()
            .downcast_ref::<BatchNormalizationLayer>()
            .is_some_and(|o| {
                o.shape == self.shape
                    && o.mode == self.mode
                    && o.iteration == self.iteration
                    && o.weights.bit_eq(&self.weights)
                    && o.biases.bit_eq(&self.biases)
                    && o.mu.bit_eq(&self.mu)
                    && o.sigma2.bit_eq(&self.sigma2)
            })
    }

    fn clone_layer(&self) -> Box<dyn Layer> {
        Box::new(self.clone())
    }

    fn hash(&self) -> String {
        content_hash(
            self.kind(),
            &[self.shape],
            &[self.mode as u8],
            &[&self.weights, &self.biases, &self.mu, &self.sigma2],
        )
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(shape: Shape, mode: NormalizationMode) -> BatchNormalizationLayer {
        BatchNormalizationLayer::new(shape, mode, &mut WeightsProvider::new(0))
    }

    #[test]
    fn test_fresh_state() {
        for mode in [NormalizationMode::Spatial, NormalizationMode::PerActivation] {
            let layer = layer(Shape::new(3, 2, 2), mode);
            assert!(layer.mu().as_slice().iter().all(|&m| m == 0.0));
            assert!(layer.sigma2().as_slice().iter().all(|&s| s == 1.0));
            assert_eq!(layer.iteration(), 0);
            assert_eq!(layer.mu().shape(), mode.parameter_shape(Shape::new(3, 2, 2)));
        }
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!(
            "spatial".parse::<NormalizationMode>().unwrap(),
            NormalizationMode::Spatial
        );
        assert_eq!(
            "per_activation".parse::<NormalizationMode>().unwrap(),
            NormalizationMode::PerActivation
        );
        assert!(matches!(
            "instance".parse::<NormalizationMode>(),
            Err(Error::InvalidMode(_))
        ));
        assert!(matches!(NormalizationMode::try_from(2), Err(Error::InvalidMode(_))));
        assert_eq!(
            NormalizationMode::try_from(1).unwrap(),
            NormalizationMode::PerActivation
        );
    }

    #[test]
    fn test_blend_factor_sequence() {
        let shape = Shape::new(1, 1, 2);
        let mut layer = layer(shape, NormalizationMode::Spatial);
        let x = Tensor::from_vec(1, shape, vec![1.0, 3.0]).unwrap();
        let expected = [1.0f32, 0.5, 1.0 / 3.0];
        for (k, &factor) in expected.iter().enumerate() {
            assert!((layer.blend_factor() - factor).abs() < 1e-7);
            layer.forward_training(&x).unwrap();
            assert_eq!(layer.iteration(), k as u64 + 1);
        }
    }

    #[test]
    fn test_restore_rejects_bad_weights() {
        let shape = Shape::new(2, 2, 2);
        let good = Tensor::zeros(1, Shape::flat(2));
        let bad = Tensor::zeros(1, Shape::flat(3));
        let result = BatchNormalizationLayer::restore(
            shape,
            NormalizationMode::Spatial,
            bad,
            good.clone(),
            good.clone(),
            good,
            0,
        );
        assert!(matches!(result, Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn test_state_serde() {
        let original = layer(Shape::new(2, 1, 1), NormalizationMode::PerActivation);
        let json = serde_json::to_string(&original.state()).unwrap();
        let state: BatchNormalizationState = serde_json::from_str(&json).unwrap();
        let restored = BatchNormalizationLayer::from_state(state).unwrap();
        assert!(restored.equals(&original));
    }
}
