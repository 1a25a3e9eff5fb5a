//! Element-wise activation functions and the layer that applies them
//!
//! Activations are kept out of the weighted layers, so the gradient a weighted layer
//! receives is always the gradient with respect to its own linear output.

use super::{check_backward, check_forward, content_hash, Layer, LayerKind};
use crate::backend;
use crate::error::Result;
use crate::tensor::{Shape, Tensor};
use serde::{Deserialize, Serialize};
use std::any::Any;

/// Supported activation functions.
///
/// # Examples
///
/// ```
/// use neural_toolkit::layers::ActivationType;
/// assert_eq!(ActivationType::Relu.apply(-2.0), 0.0);
/// assert_eq!(ActivationType::LeakyRelu { alpha: 0.1 }.apply(-2.0), -0.2);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActivationType {
    Identity,
    Sigmoid,
    Tanh,
    Relu,
    LeakyRelu { alpha: f32 },
}

impl ActivationType {
    pub fn apply(self, x: f32) -> f32 {
        match self {
            ActivationType::Identity => x,
            ActivationType::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            ActivationType::Tanh => x.tanh(),
            ActivationType::Relu => x.max(0.0),
            ActivationType::LeakyRelu { alpha } => {
                if x > 0.0 {
                    x
                } else {
                    alpha * x
                }
            }
        }
    }

    /// Derivative evaluated at the pre-activation value `x`.
    pub fn derivative(self, x: f32) -> f32 {
        match self {
            ActivationType::Identity => 1.0,
            ActivationType::Sigmoid => {
                let s = 1.0 / (1.0 + (-x).exp());
                s * (1.0 - s)
            }
            ActivationType::Tanh => {
                let t = x.tanh();
                1.0 - t * t
            }
            ActivationType::Relu => {
                if x > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            ActivationType::LeakyRelu { alpha } => {
                if x > 0.0 {
                    1.0
                } else {
                    alpha
                }
            }
        }
    }

    fn settings_bytes(self) -> [u8; 5] {
        let (tag, alpha) = match self {
            ActivationType::Identity => (0u8, 0.0f32),
            ActivationType::Sigmoid => (1, 0.0),
            ActivationType::Tanh => (2, 0.0),
            ActivationType::Relu => (3, 0.0),
            ActivationType::LeakyRelu { alpha } => (4, alpha),
        };
        let a = alpha.to_le_bytes();
        [tag, a[0], a[1], a[2], a[3]]
    }
}

/// Applies an [`ActivationType`] to every element. Input and output shapes are equal.
#[derive(Debug, Clone)]
pub struct ActivationLayer {
    shape: Shape,
    activation: ActivationType,
}

impl ActivationLayer {
    pub fn new(shape: Shape, activation: ActivationType) -> Self {
        Self { shape, activation }
    }

    pub fn activation(&self) -> ActivationType {
        self.activation
    }
}

impl Layer for ActivationLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Activation
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
        backend::current()?.activation_forward(self.activation, x, &mut y)?;
        Ok(y)
    }

    fn backward(&self, x: &Tensor, y: &Tensor, dy: &Tensor) -> Result<Tensor> {
        check_backward(x, y, dy, self.shape, self.shape)?;
        let mut dx = Tensor::like(x);
        backend::current()?.activation_backward(self.activation, x, dy, &mut dx)?;
        Ok(dx)
    }

    fn equals(&self, other: &dyn Layer) -> bool {
        other
            .as_any()
            .downcast_ref::<ActivationLayer>()
            .is_some_and(|o| {
                o.shape == self.shape
                    && o.activation.settings_bytes() == self.activation.settings_bytes()
            })
    }

    fn clone_layer(&self) -> Box<dyn Layer> {
        Box::new(self.clone())
    }

    fn hash(&self) -> String {
        content_hash(
            self.kind(),
            &[self.shape],
            &self.activation.settings_bytes(),
            &[],
        )
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sigmoid_values() {
        let s = ActivationType::Sigmoid;
        assert!((s.apply(0.0) - 0.5).abs() < 1e-7);
        assert!((s.derivative(0.0) - 0.25).abs() < 1e-7);
        assert!(s.apply(2.0) > 0.5 && s.apply(-2.0) < 0.5);
    }

    #[test]
    fn test_relu_values() {
        let r = ActivationType::Relu;
        assert_eq!(r.apply(-1.0), 0.0);
        assert_eq!(r.apply(3.0), 3.0);
        assert_eq!(r.derivative(-1.0), 0.0);
        assert_eq!(r.derivative(3.0), 1.0);
    }

    #[test]
    fn test_tanh_derivative_at_zero() {
        assert!((ActivationType::Tanh.derivative(0.0) - 1.0).abs() < 1e-7);
    }

    #[test]
    fn test_activation_layer_forward_backward() {
        let layer = ActivationLayer::new(Shape::flat(4), ActivationType::Relu);
        let x = Tensor::from_vec(1, Shape::flat(4), vec![-1.0, 0.5, -0.5, 2.0]).unwrap();
        let y = layer.forward(&x).unwrap();
        assert_eq!(y.as_slice(), &[0.0, 0.5, 0.0, 2.0]);

        let dy = Tensor::filled(1, Shape::flat(4), 1.0);
        let dx = layer.backward(&x, &y, &dy).unwrap();
        assert_eq!(dx.as_slice(), &[0.0, 1.0, 0.0, 1.0]);
    }

    #[test]
    fn test_activation_layer_equality() {
        let a = ActivationLayer::new(Shape::flat(4), ActivationType::LeakyRelu { alpha: 0.1 });
        let b = ActivationLayer::new(Shape::flat(4), ActivationType::LeakyRelu { alpha: 0.2 });
        assert!(a.equals(&a.clone()));
        assert!(!a.equals(&b));
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn test_activation_type_serde() {
        let json = r#"{"type":"leaky_relu","alpha":0.01}"#;
        let parsed: ActivationType = serde_json::from_str(json).unwrap();
        assert_eq!(parsed, ActivationType::LeakyRelu { alpha: 0.01 });
    }
}
