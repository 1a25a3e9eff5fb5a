//! 2D convolutional layer implementation
//!
//! Cross-correlates each sample with `kernels` square filters of size `k × k`, with a
//! configurable stride and zero padding. For an input `(C, H, W)` the output is
//! `(kernels, (H + 2p - k) / s + 1, (W + 2p - k) / s + 1)`.

use super::{
    check_backward, check_forward, check_gradient, check_parameter, content_hash, Layer,
    LayerKind, ParameterGradients,
};
use crate::backend::{self, ConvolutionInfo};
use crate::error::{Error, Result};
use crate::tensor::{Shape, Tensor};
use crate::weights::WeightsProvider;
use std::any::Any;

/// 2D convolutional layer with one bias per kernel.
///
/// # Example
///
/// ```
/// use neural_toolkit::backend::ConvolutionInfo;
/// use neural_toolkit::layers::{ConvolutionalLayer, Layer};
/// use neural_toolkit::tensor::Shape;
/// use neural_toolkit::weights::WeightsProvider;
///
/// let info = ConvolutionInfo { kernel_size: 3, stride: 1, padding: 1 };
/// let layer =
///     ConvolutionalLayer::new(Shape::new(1, 28, 28), 8, info, &mut WeightsProvider::new(1))
///         .unwrap();
/// assert_eq!(layer.output_shape(), Shape::new(8, 28, 28));
/// ```
#[derive(Debug, Clone)]
pub struct ConvolutionalLayer {
    input_shape: Shape,
    output_shape: Shape,
    info: ConvolutionInfo,
    weights: Tensor,
    biases: Tensor,
}

fn output_shape_for(input_shape: Shape, kernels: usize, info: &ConvolutionInfo) -> Result<Shape> {
    let (out_h, out_w) = info
        .output_dims(input_shape.height(), input_shape.width())
        .ok_or_else(|| {
            Error::shape_mismatch(
                "convolution geometry",
                vec![info.kernel_size, info.kernel_size],
                vec![
                    input_shape.height() + 2 * info.padding,
                    input_shape.width() + 2 * info.padding,
                ],
            )
        })?;
    if kernels == 0 {
        return Err(Error::shape_mismatch("convolution kernel count", vec![1], vec![0]));
    }
    Ok(Shape::new(kernels, out_h, out_w))
}

impl ConvolutionalLayer {
    /// Create a layer with `kernels` filters drawn from `provider`.
    ///
    /// Fails with [`Error::ShapeMismatch`] if the kernel does not fit the padded input or
    /// the stride is zero.
    pub fn new(
        input_shape: Shape,
        kernels: usize,
        info: ConvolutionInfo,
        provider: &mut WeightsProvider,
    ) -> Result<Self> {
        let output_shape = output_shape_for(input_shape, kernels, &info)?;
        let weights =
            provider.new_convolutional_kernels(kernels, input_shape.channels(), info.kernel_size);
        let biases = provider.new_biases(kernels);
        Ok(Self {
            input_shape,
            output_shape,
            info,
            weights,
            biases,
        })
    }

    /// Rebuild a layer from saved kernels and biases.
    pub fn restore(
        input_shape: Shape,
        info: ConvolutionInfo,
        weights: Tensor,
        biases: Tensor,
    ) -> Result<Self> {
        let kernels = weights.entities();
        let output_shape = output_shape_for(input_shape, kernels, &info)?;
        let k = info.kernel_size;
        check_parameter(
            "convolution kernels",
            &weights,
            kernels,
            Shape::new(input_shape.channels(), k, k),
        )?;
        check_parameter("convolution biases", &biases, 1, Shape::flat(kernels))?;
        Ok(Self {
            input_shape,
            output_shape,
            info,
            weights,
            biases,
        })
    }

    pub fn info(&self) -> ConvolutionInfo {
        self.info
    }

    pub fn kernels(&self) -> usize {
        self.weights.entities()
    }

    fn settings_bytes(&self) -> Vec<u8> {
        [self.info.kernel_size, self.info.stride, self.info.padding]
            .iter()
            .flat_map(|v| (*v as u64).to_le_bytes())
            .collect()
    }
}

impl Layer for ConvolutionalLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Convolutional
    }

    fn input_shape(&self) -> Shape {
        self.input_shape
    }

    fn output_shape(&self) -> Shape {
        self.output_shape
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        check_forward(x, self.input_shape)?;
        let mut y = Tensor::zeros(x.entities(), self.output_shape);
        backend::current()?.convolution_forward(
            &self.info,
            x,
            &self.weights,
            &self.biases,
            &mut y,
        )?;
        Ok(y)
    }

    fn backward(&self, x: &Tensor, y: &Tensor, dy: &Tensor) -> Result<Tensor> {
        check_backward(x, y, dy, self.input_shape, self.output_shape)?;
        let mut dx = Tensor::like(x);
        backend::current()?.convolution_backward_data(&self.info, &self.weights, dy, &mut dx)?;
        Ok(dx)
    }

    fn gradient(&self, x: &Tensor, dy: &Tensor) -> Result<Option<ParameterGradients>> {
        check_gradient(x, dy, self.input_shape, self.output_shape)?;
        let mut weights = Tensor::like(&self.weights);
        let mut biases = Tensor::like(&self.biases);
        backend::current()?.convolution_backward_filter(
            &self.info,
            x,
            dy,
            &mut weights,
            &mut biases,
        )?;
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
            .downcast_ref::<ConvolutionalLayer>()
            .is_some_and(|o| {
                o.input_shape == self.input_shape
                    && o.output_shape == self.output_shape
                    && o.info == self.info
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
            &[self.input_shape, self.output_shape],
            &self.settings_bytes(),
            &[&self.weights, &self.biases],
        )
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
