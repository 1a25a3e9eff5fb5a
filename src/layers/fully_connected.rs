//! Fully connected layer implementation
//!
//! Performs the linear transformation `y = x·W + b` on each flattened sample. The weight
//! matrix is stored row-major as `inputs × outputs`, i.e. `inputs` entities of shape
//! `(outputs, 1, 1)`, so row `i` holds the outgoing weights of input `i`.

use super::{
    check_backward, check_forward, check_gradient, check_parameter, content_hash, Layer,
    LayerKind, ParameterGradients,
};
use crate::backend;
use crate::error::Result;
use crate::tensor::{Shape, Tensor};
use crate::weights::WeightsProvider;
use std::any::Any;

/// Fully connected layer with weights and biases.
///
/// The input shape may be any `(C, H, W)`; it is read as a flat vector of `C·H·W` values.
///
/// # Example
///
/// ```
/// use neural_toolkit::layers::{FullyConnectedLayer, Layer};
/// use neural_toolkit::tensor::Shape;
/// use neural_toolkit::weights::WeightsProvider;
///
/// let layer = FullyConnectedLayer::new(Shape::flat(784), 128, &mut WeightsProvider::new(42));
/// assert_eq!(layer.output_shape(), Shape::flat(128));
/// assert_eq!(layer.parameter_count(), 784 * 128 + 128);
/// ```
#[derive(Debug, Clone)]
pub struct FullyConnectedLayer {
    input_shape: Shape,
    outputs: usize,
    weights: Tensor,
    biases: Tensor,
}

impl FullyConnectedLayer {
    /// Create a new layer with weights and biases drawn from `provider`.
    pub fn new(input_shape: Shape, outputs: usize, provider: &mut WeightsProvider) -> Self {
        let weights = provider.new_fully_connected_weights(input_shape.size(), outputs);
        let biases = provider.new_biases(outputs);
        Self {
            input_shape,
            outputs,
            weights,
            biases,
        }
    }

    /// Rebuild a layer from saved parameters.
    pub fn restore(input_shape: Shape, weights: Tensor, biases: Tensor) -> Result<Self> {
        let outputs = weights.shape().size();
        check_parameter(
            "fully connected weights",
            &weights,
            input_shape.size(),
            Shape::flat(outputs),
        )?;
        check_parameter("fully connected biases", &biases, 1, Shape::flat(outputs))?;
        Ok(Self {
            input_shape,
            outputs,
            weights,
            biases,
        })
    }

    pub fn outputs(&self) -> usize {
        self.outputs
    }
}

impl Layer for FullyConnectedLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::FullyConnected
    }

    fn input_shape(&self) -> Shape {
        self.input_shape
    }

    fn output_shape(&self) -> Shape {
        Shape::flat(self.outputs)
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        check_forward(x, self.input_shape)?;
        let mut y = Tensor::zeros(x.entities(), self.output_shape());
        backend::current()?.fully_connected_forward(x, &self.weights, &self.biases, &mut y)?;
        Ok(y)
    }

    fn backward(&self, x: &Tensor, y: &Tensor, dy: &Tensor) -> Result<Tensor> {
        check_backward(x, y, dy, self.input_shape, self.output_shape())?;
        let mut dx = Tensor::like(x);
        backend::current()?.fully_connected_backward_data(&self.weights, dy, &mut dx)?;
        Ok(dx)
    }

    fn gradient(&self, x: &Tensor, dy: &Tensor) -> Result<Option<ParameterGradients>> {
        check_gradient(x, dy, self.input_shape, self.output_shape())?;
        let mut weights = Tensor::like(&self.weights);
        let mut biases = Tensor::like(&self.biases);
        backend::current()?.fully_connected_backward_filter(x, dy, &mut weights, &mut biases)?;
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
            .downcast_ref::<FullyConnectedLayer>()
            .is_some_and(|o| {
                o.input_shape == self.input_shape
                    && o.outputs == self.outputs
                    && o.weights.bit_eq(&self.weights)
                    && o.biases.bit_eq(&self.biases)
            })
    }

    fn clone_layer(&self) -> Box<dyn Layer> {
        Box::new(self.clone())
    }

    fn hash(&self) -> String {
        content_hash(
            self.kind(),
            &[self.input_shape, self.output_shape()],
            &[],
            &[&self.weights, &self.biases],
        )
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
