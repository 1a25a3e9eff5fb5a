//! Softmax output layer
//!
//! Maps each sample to a probability distribution over its `C·H·W` values. The maximum is
//! subtracted before exponentiation for numerical stability.

use super::{check_backward, check_forward, content_hash, Layer, LayerKind};
use crate::backend;
use crate::error::Result;
use crate::tensor::{Shape, Tensor};
use std::any::Any;

#[derive(Debug, Clone)]
pub struct SoftmaxLayer {
    shape: Shape,
}

impl SoftmaxLayer {
    pub fn new(shape: Shape) -> Self {
        Self { shape }
    }
}

impl Layer for SoftmaxLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Softmax
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
        backend::current()?.softmax_forward(x, &mut y)?;
        Ok(y)
    }

    /// `dx_i = y_i · (dy_i - Σ_j dy_j · y_j)`
    fn backward(&self, x: &Tensor, y: &Tensor, dy: &Tensor) -> Result<Tensor> {
        check_backward(x, y, dy, self.shape, self.shape)?;
        let mut dx = Tensor::like(x);
        backend::current()?.softmax_backward(y, dy, &mut dx)?;
        Ok(dx)
    }

    fn equals(&self, other: &dyn Layer) -> bool {
        other
            .as_any()
            .downcast_ref::<SoftmaxLayer>()
            .is_some_and(|o| o.shape == self.shape)
    }

    fn clone_layer(&self) -> Box<dyn Layer> {
        Box::new(self.clone())
    }

    fn hash(&self) -> String {
        content_hash(self.kind(), &[self.shape], &[], &[])
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
