//! Max pooling layer
//!
//! Non-overlapping `size × size` windows (stride equals the window size). Borders that do not
//! fill a whole window form a smaller window of their own, so the output is
//! `(C, ceil(H / size), ceil(W / size))`.

use super::{check_backward, check_forward, content_hash, Layer, LayerKind};
use crate::backend;
use crate::error::Result;
use crate::tensor::{Shape, Tensor};
use std::any::Any;

pub const DEFAULT_POOL_SIZE: usize = 2;

#[derive(Debug, Clone)]
pub struct PoolingLayer {
    input_shape: Shape,
    size: usize,
}

impl PoolingLayer {
    /// # Panics
    ///
    /// Panics if `size` is zero.
    pub fn new(input_shape: Shape, size: usize) -> Self {
        assert!(size > 0, "pool size must be positive");
        Self { input_shape, size }
    }

    /// 2×2 pooling.
    pub fn with_default_size(input_shape: Shape) -> Self {
        Self::new(input_shape, DEFAULT_POOL_SIZE)
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl Layer for PoolingLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Pooling
    }

    fn input_shape(&self) -> Shape {
        self.input_shape
    }

    fn output_shape(&self) -> Shape {
        Shape::new(
            self.input_shape.channels(),
            self.input_shape.height().div_ceil(self.size),
            self.input_shape.width().div_ceil(self.size),
        )
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        check_forward(x, self.input_shape)?;
        let mut y = Tensor::zeros(x.entities(), self.output_shape());
        backend::current()?.pooling_forward(self.size, x, &mut y)?;
        Ok(y)
    }

    fn backward(&self, x: &Tensor, y: &Tensor, dy: &Tensor) -> Result<Tensor> {
        check_backward(x, y, dy, self.input_shape, self.output_shape())?;
        let mut dx = Tensor::like(x);
        backend::current()?.pooling_backward(self.size, x, y, dy, &mut dx)?;
        Ok(dx)
    }

    fn equals(&self, other: &dyn Layer) -> bool {
        other
            .as_any()
            .downcast_ref::<PoolingLayer>()
            .is_some_and(|o| o.input_shape == self.input_shape && o.size == self.size)
    }

    fn clone_layer(&self) -> Box<dyn Layer> {
        Box::new(self.clone())
    }

    fn hash(&self) -> String {
        content_hash(
            self.kind(),
            &[self.input_shape, self.output_shape()],
            &(self.size as u64).to_le_bytes(),
            &[],
        )
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
