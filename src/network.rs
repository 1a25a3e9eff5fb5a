//! Sequential networks
//!
//! A [`Network`] owns an ordered list of layers whose shapes chain: the output shape of each
//! layer is the input shape of the next. Inference threads a batch through every
//! [`Layer::forward`]; a training step runs [`Layer::forward_training`], evaluates the cost,
//! walks the layers in reverse computing input and parameter gradients, and hands the
//! parameter gradients to an [`Optimizer`].

use crate::cost::CostFunction;
use crate::error::{Error, Result};
use crate::layers::{Layer, ParameterGradients};
use crate::optimizers::Optimizer;
use crate::tensor::{Shape, Tensor};
use sha2::{Digest, Sha256};

/// Outputs recorded by a training forward pass.
///
/// `activations[0]` is the network input and `activations[i + 1]` the output of layer `i`.
#[derive(Debug, Clone)]
pub struct ForwardTrace {
    pub activations: Vec<Tensor>,
}

impl ForwardTrace {
    /// Output of the last layer.
    pub fn output(&self) -> &Tensor {
        // Never empty: the input is always recorded.
        &self.activations[self.activations.len() - 1]
    }
}

/// Result of a backward pass.
#[derive(Debug, Clone)]
pub struct BackwardPass {
    /// Gradient with respect to the network input.
    pub input_gradient: Tensor,
    /// Parameter gradients per layer, `None` for parameterless layers.
    pub gradients: Vec<Option<ParameterGradients>>,
}

/// Feed-forward network of boxed layers.
///
/// # Example
///
/// ```
/// use neural_toolkit::layers::{FullyConnectedLayer, Layer, SoftmaxLayer};
/// use neural_toolkit::network::Network;
/// use neural_toolkit::tensor::{Shape, Tensor};
/// use neural_toolkit::weights::WeightsProvider;
///
/// let mut provider = WeightsProvider::new(1);
/// let layers: Vec<Box<dyn Layer>> = vec![
///     Box::new(FullyConnectedLayer::new(Shape::flat(4), 3, &mut provider)),
///     Box::new(SoftmaxLayer::new(Shape::flat(3))),
/// ];
/// let network = Network::new(layers).unwrap();
/// let y = network.forward(&Tensor::zeros(2, Shape::flat(4))).unwrap();
/// assert_eq!(y.dims(), [2, 3, 1, 1]);
/// ```
#[derive(Debug, Clone)]
pub struct Network {
    layers: Vec<Box<dyn Layer>>,
}

impl Network {
    /// Fails with [`Error::Config`] for an empty list and [`Error::ShapeMismatch`] when two
    /// neighbouring layers do not chain.
    pub fn new(layers: Vec<Box<dyn Layer>>) -> Result<Self> {
        if layers.is_empty() {
            return Err(Error::Config("network needs at least one layer".to_string()));
        }
        for pair in layers.windows(2) {
            let (out, next) = (pair[0].output_shape(), pair[1].input_shape());
            if out != next {
                return Err(Error::shape_mismatch(
                    "layer chain",
                    next.dims().to_vec(),
                    out.dims().to_vec(),
                ));
            }
        }

        let network = Self { layers };
        log::info!(
            "network built: {} layers, {} -> {}, {} parameters",
            network.layers.len(),
            network.input_shape(),
            network.output_shape(),
            network.parameter_count()
        );
        for (i, layer) in network.layers.iter().enumerate() {
            log::debug!(
                "  layer {}: {:?} {} -> {}",
                i,
                layer.kind(),
                layer.input_shape(),
                layer.output_shape()
            );
        }
        Ok(network)
    }

    pub fn layers(&self) -> &[Box<dyn Layer>] {
        &self.layers
    }

    pub fn layers_mut(&mut self) -> &mut [Box<dyn Layer>] {
        &mut self.layers
    }

    pub fn input_shape(&self) -> Shape {
        self.layers[0].input_shape()
    }

    pub fn output_shape(&self) -> Shape {
        self.layers[self.layers.len() - 1].output_shape()
    }

    pub fn parameter_count(&self) -> usize {
        self.layers.iter().map(|l| l.parameter_count()).sum()
    }

    /// Inference pass. Leaves every layer untouched.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut layers = self.layers.iter();
        let Some(first) = layers.next() else {
            return Ok(x.clone());
        };
        let mut y = first.forward(x)?;
        for layer in layers {
            y = layer.forward(&y)?;
        }
        Ok(y)
    }

    /// Training pass: stateful layers update their statistics. Records every activation for
    /// the backward pass.
    pub fn forward_training(&mut self, x: &Tensor) -> Result<ForwardTrace> {
        let mut activations = Vec::with_capacity(self.layers.len() + 1);
        activations.push(x.clone());
        for layer in &mut self.layers {
            let y = layer.forward_training(&activations[activations.len() - 1])?;
            activations.push(y);
        }
        Ok(ForwardTrace { activations })
    }

    /// Propagates `dy` (gradient with respect to the network output) back through `trace`.
    pub fn backward(&self, trace: &ForwardTrace, dy: Tensor) -> Result<BackwardPass> {
        if trace.activations.len() != self.layers.len() + 1 {
            return Err(Error::shape_mismatch(
                "forward trace length",
                vec![self.layers.len() + 1],
                vec![trace.activations.len()],
            ));
        }

        let mut gradients = vec![None; self.layers.len()];
        let mut dy = dy;
        for (i, layer) in self.layers.iter().enumerate().rev() {
            let x = &trace.activations[i];
            let y = &trace.activations[i + 1];
            gradients[i] = layer.gradient(x, &dy)?;
            dy = layer.backward(x, y, &dy)?;
        }
        Ok(BackwardPass {
            input_gradient: dy,
            gradients,
        })
    }

    /// Hands every parameter gradient to `optimizer`. Layer `i` uses slots `2i` (weights)
    /// and `2i + 1` (biases).
    pub fn apply_gradients(
        &mut self,
        gradients: &[Option<ParameterGradients>],
        optimizer: &mut dyn Optimizer,
    ) -> Result<()> {
        for (i, (layer, grads)) in self.layers.iter_mut().zip(gradients).enumerate() {
            let (Some(grads), Some((weights, biases))) = (grads, layer.parameters_mut()) else {
                continue;
            };
            grads.weights.expect_layout("weight gradient", weights)?;
            grads.biases.expect_layout("bias gradient", biases)?;
            optimizer.update(2 * i, weights.as_mut_slice(), grads.weights.as_slice());
            optimizer.update(2 * i + 1, biases.as_mut_slice(), grads.biases.as_slice());
        }
        Ok(())
    }

    /// One optimization step on a single batch. Returns the batch loss measured before the
    /// update.
    pub fn train_batch(
        &mut self,
        x: &Tensor,
        target: &Tensor,
        cost: CostFunction,
        optimizer: &mut dyn Optimizer,
    ) -> Result<f32> {
        let trace = self.forward_training(x)?;
        let loss = cost.loss(trace.output(), target)?;
        let dy = cost.gradient(trace.output(), target)?;
        let pass = self.backward(&trace, dy)?;
        self.apply_gradients(&pass.gradients, optimizer)?;
        log::debug!("batch of {} trained, loss {:.6}", x.entities(), loss);
        Ok(loss)
    }

    /// Layer-wise structural equality.
    pub fn equals(&self, other: &Network) -> bool {
        self.layers.len() == other.layers.len()
            && self
                .layers
                .iter()
                .zip(&other.layers)
                .all(|(a, b)| a.equals(b.as_ref()))
    }

    /// SHA-256 over the ordered layer digests.
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        for layer in &self.layers {
            hasher.update(layer.hash().as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

impl PartialEq for Network {
    fn eq(&self, other: &Self) -> bool {
        self.equals(other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{ActivationLayer, ActivationType, FullyConnectedLayer};
    use crate::weights::WeightsProvider;

    fn small_network() -> Network {
        let mut provider = WeightsProvider::new(5);
        Network::new(vec![
            Box::new(FullyConnectedLayer::new(Shape::flat(2), 3, &mut provider)),
            Box::new(ActivationLayer::new(Shape::flat(3), ActivationType::Tanh)),
            Box::new(FullyConnectedLayer::new(Shape::flat(3), 1, &mut provider)),
        ])
        .unwrap()
    }

    #[test]
    fn test_rejects_broken_chain() {
        let mut provider = WeightsProvider::new(0);
        let result = Network::new(vec![
            Box::new(FullyConnectedLayer::new(Shape::flat(2), 3, &mut provider)),
            Box::new(FullyConnectedLayer::new(Shape::flat(4), 1, &mut provider)),
        ]);
        assert!(matches!(result, Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn test_rejects_empty() {
        assert!(matches!(Network::new(Vec::new()), Err(Error::Config(_))));
    }

    #[test]
    fn test_trace_records_every_activation() {
        let mut network = small_network();
        let x = Tensor::zeros(4, Shape::flat(2));
        let trace = network.forward_training(&x).unwrap();
        assert_eq!(trace.activations.len(), 4);
        assert_eq!(trace.output().dims(), [4, 1, 1, 1]);
    }

    #[test]
    fn test_backward_gradient_layout() {
        let mut network = small_network();
        let x = Tensor::filled(2, Shape::flat(2), 0.5);
        let trace = network.forward_training(&x).unwrap();
        let pass = network
            .backward(&trace, Tensor::filled(2, Shape::flat(1), 1.0))
            .unwrap();
        assert_eq!(pass.input_gradient.dims(), x.dims());
        assert!(pass.gradients[0].is_some());
        assert!(pass.gradients[1].is_none());
        assert!(pass.gradients[2].is_some());
    }

    #[test]
    fn test_clone_equals_and_hash() {
        let network = small_network();
        let copy = network.clone();
        assert!(network.equals(&copy));
        assert_eq!(network.hash(), copy.hash());
        assert_eq!(network.hash().len(), 64);
    }
}
