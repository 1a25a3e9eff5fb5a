//! Layer abstractions for neural networks
//!
//! This module provides the [`Layer`] trait and its concrete variants. Every layer exposes
//! the same protocol:
//!
//! - `forward`: pure inference pass
//! - `forward_training`: training pass, the only call allowed to update internal state
//! - `backward`: gradient with respect to the input
//! - `gradient`: gradients with respect to the layer's own weights and biases
//! - `equals`, `clone_layer`, `hash`: structural equality, deep copy and content digest

mod activation;
pub mod batchnorm;
mod convolutional;
mod fully_connected;
mod pooling;
mod softmax;

pub use activation::{ActivationLayer, ActivationType};
pub use batchnorm::{BatchNormalizationLayer, BatchNormalizationState, NormalizationMode};
pub use convolutional::ConvolutionalLayer;
pub use fully_connected::FullyConnectedLayer;
pub use pooling::{PoolingLayer, DEFAULT_POOL_SIZE};
pub use softmax::SoftmaxLayer;

use crate::error::{Error, Result};
use crate::tensor::{Shape, Tensor};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::any::Any;
use std::fmt;

/// Closed set of layer variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    FullyConnected,
    Convolutional,
    Pooling,
    Softmax,
    Activation,
    BatchNormalization,
}

impl LayerKind {
    /// Stable discriminator mixed into content hashes.
    fn tag(self) -> u8 {
        match self {
            LayerKind::FullyConnected => 0,
            LayerKind::Convolutional => 1,
            LayerKind::Pooling => 2,
            LayerKind::Softmax => 3,
            LayerKind::Activation => 4,
            LayerKind::BatchNormalization => 5,
        }
    }
}

/// Gradients of the loss with respect to a weighted layer's parameters.
///
/// Both tensors have exactly the layout of the layer's weights and biases.
#[derive(Debug, Clone)]
pub struct ParameterGradients {
    pub weights: Tensor,
    pub biases: Tensor,
}

/// Core trait for neural network layers.
///
/// All layer types implement this trait so a network can hold them as `Box<dyn Layer>`.
/// Layers own their parameter tensors exclusively; nothing here hands out shared mutable
/// storage.
///
/// # Example
///
/// ```ignore
/// let y = layer.forward_training(&x)?;
/// let dx = layer.backward(&x, &y, &dy)?;
/// if let Some(grads) = layer.gradient(&x, &dy)? {
///     optimizer.update(slot, weights, &grads.weights);
/// }
/// ```
pub trait Layer: fmt::Debug + Send + Sync {
    fn kind(&self) -> LayerKind;

    /// Per-sample shape accepted by `forward`.
    fn input_shape(&self) -> Shape;

    /// Per-sample shape produced by `forward`.
    fn output_shape(&self) -> Shape;

    /// Inference pass.
    ///
    /// Never mutates the layer or `x`. Fails with [`Error::ShapeMismatch`] when the sample
    /// shape of `x` differs from [`Layer::input_shape`].
    fn forward(&self, x: &Tensor) -> Result<Tensor>;

    /// Training pass.
    ///
    /// Stateless layers behave exactly like [`Layer::forward`]. Stateful layers (batch
    /// normalization) accumulate their running statistics here and nowhere else.
    fn forward_training(&mut self, x: &Tensor) -> Result<Tensor> {
        self.forward(x)
    }

    /// Gradient with respect to the input.
    ///
    /// `x` and `y` are the input and output of the matching forward call, `dy` the gradient
    /// flowing back from downstream. None of them are mutated; the result is shaped like `x`.
    fn backward(&self, x: &Tensor, y: &Tensor, dy: &Tensor) -> Result<Tensor>;

    /// Gradients with respect to weights and biases, or `None` for parameterless layers.
    fn gradient(&self, _x: &Tensor, _dy: &Tensor) -> Result<Option<ParameterGradients>> {
        Ok(None)
    }

    /// Read access to `(weights, biases)` of weighted layers.
    fn parameters(&self) -> Option<(&Tensor, &Tensor)> {
        None
    }

    /// Write access to `(weights, biases)`, used by optimizers.
    fn parameters_mut(&mut self) -> Option<(&mut Tensor, &mut Tensor)> {
        None
    }

    /// Number of trainable values (weights plus biases).
    fn parameter_count(&self) -> usize {
        self.parameters().map_or(0, |(w, b)| w.len() + b.len())
    }

    /// Structural equality: same variant, same shapes, bit-equal parameters and state.
    fn equals(&self, other: &dyn Layer) -> bool;

    /// Deep copy sharing no storage with `self`.
    fn clone_layer(&self) -> Box<dyn Layer>;

    /// Lowercase hex SHA-256 digest of the layer's variant, shapes and tensor contents.
    fn hash(&self) -> String;

    fn as_any(&self) -> &dyn Any;
}

impl Clone for Box<dyn Layer> {
    fn clone(&self) -> Self {
        self.clone_layer()
    }
}

impl PartialEq for dyn Layer {
    fn eq(&self, other: &Self) -> bool {
        self.equals(other)
    }
}

/// Checks the input of a forward pass against the declared input shape.
pub(crate) fn check_forward(x: &Tensor, input_shape: Shape) -> Result<()> {
    x.expect_shape("forward input", input_shape)
}

/// Checks the `(x, y, dy)` triple of a backward pass.
pub(crate) fn check_backward(
    x: &Tensor,
    y: &Tensor,
    dy: &Tensor,
    input_shape: Shape,
    output_shape: Shape,
) -> Result<()> {
    x.expect_shape("backward input", input_shape)?;
    y.expect_shape("backward output", output_shape)?;
    dy.expect_layout("backward output gradient", y)?;
    if x.entities() != y.entities() {
        return Err(Error::shape_mismatch(
            "backward batch size",
            vec![x.entities()],
            vec![y.entities()],
        ));
    }
    Ok(())
}

/// Checks the `(x, dy)` pair of a parameter gradient computation.
pub(crate) fn check_gradient(
    x: &Tensor,
    dy: &Tensor,
    input_shape: Shape,
    output_shape: Shape,
) -> Result<()> {
    x.expect_shape("gradient input", input_shape)?;
    dy.expect_shape("gradient output gradient", output_shape)?;
    if x.entities() != dy.entities() {
        return Err(Error::shape_mismatch(
            "gradient batch size",
            vec![x.entities()],
            vec![dy.entities()],
        ));
    }
    Ok(())
}

/// Checks that a parameter tensor has the layout a layer declares for it.
pub(crate) fn check_parameter(
    context: &'static str,
    tensor: &Tensor,
    entities: usize,
    shape: Shape,
) -> Result<()> {
    if tensor.entities() != entities || tensor.shape() != shape {
        let [c, h, w] = shape.dims();
        return Err(Error::shape_mismatch(
            context,
            vec![entities, c, h, w],
            tensor.dims().to_vec(),
        ));
    }
    Ok(())
}

/// SHA-256 over the variant tag, the shapes, any extra settings bytes and the raw tensors.
pub(crate) fn content_hash(
    kind: LayerKind,
    shapes: &[Shape],
    settings: &[u8],
    tensors: &[&Tensor],
) -> String {
    let mut hasher = Sha256::new();
    hasher.update([kind.tag()]);
    for shape in shapes {
        for dim in shape.dims() {
            hasher.update((dim as u64).to_le_bytes());
        }
    }
    hasher.update(settings);
    for tensor in tensors {
        let bytes: Vec<u8> = tensor.le_bytes().collect();
        hasher.update(&bytes);
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_is_deterministic() {
        let t = Tensor::filled(1, Shape::flat(4), 0.25);
        let a = content_hash(LayerKind::Softmax, &[Shape::flat(4)], &[], &[&t]);
        let b = content_hash(LayerKind::Softmax, &[Shape::flat(4)], &[], &[&t]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_content_hash_depends_on_content() {
        let t = Tensor::filled(1, Shape::flat(4), 0.25);
        let mut u = t.clone();
        u.as_mut_slice()[3] = 0.5;
        let a = content_hash(LayerKind::Softmax, &[Shape::flat(4)], &[], &[&t]);
        let b = content_hash(LayerKind::Softmax, &[Shape::flat(4)], &[], &[&u]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_content_hash_depends_on_kind() {
        let a = content_hash(LayerKind::Softmax, &[Shape::flat(4)], &[], &[]);
        let b = content_hash(LayerKind::Pooling, &[Shape::flat(4)], &[], &[]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_check_backward_rejects_batch_mismatch() {
        let x = Tensor::zeros(2, Shape::flat(3));
        let y = Tensor::zeros(3, Shape::flat(3));
        let dy = Tensor::zeros(3, Shape::flat(3));
        let result = check_backward(&x, &y, &dy, Shape::flat(3), Shape::flat(3));
        assert!(matches!(result, Err(Error::ShapeMismatch { .. })));
    }
}
