// Numerical gradient checks using central finite differences.
// For every layer variant the analytical input gradient (backward) and parameter
// gradients (gradient) are compared against perturbations of L = Σ y·dy.

use approx::assert_relative_eq;
use neural_toolkit::backend::ConvolutionInfo;
use neural_toolkit::layers::{
    ActivationLayer, ActivationType, ConvolutionalLayer, FullyConnectedLayer, Layer, PoolingLayer,
    SoftmaxLayer,
};
use neural_toolkit::tensor::{Shape, Tensor};
use neural_toolkit::weights::WeightsProvider;

const STEP: f32 = 1e-2;

fn wave(entities: usize, shape: Shape, phase: f32) -> Tensor {
    let data = (0..entities * shape.size())
        .map(|i| ((i as f32) * 0.53 + phase).sin())
        .collect();
    Tensor::from_vec(entities, shape, data).unwrap()
}

fn loss(layer: &dyn Layer, x: &Tensor, dy: &Tensor) -> f64 {
    let y = layer.forward(x).unwrap();
    y.as_slice()
        .iter()
        .zip(dy.as_slice())
        .map(|(a, b)| *a as f64 * *b as f64)
        .sum()
}

fn check_input_gradient(layer: &dyn Layer, x: &Tensor, dy: &Tensor) {
    let y = layer.forward(x).unwrap();
    let dx = layer.backward(x, &y, dy).unwrap();
    assert_eq!(dx.dims(), x.dims());

    for i in 0..x.len() {
        let mut plus = x.clone();
        plus.as_mut_slice()[i] += STEP;
        let mut minus = x.clone();
        minus.as_mut_slice()[i] -= STEP;
        let numerical = (loss(layer, &plus, dy) - loss(layer, &minus, dy)) / (2.0 * STEP as f64);
        assert_relative_eq!(
            numerical as f32,
            dx.as_slice()[i],
            epsilon = 1e-3,
            max_relative = 1e-2
        );
    }
}

fn check_parameter_gradients(layer: &dyn Layer, x: &Tensor, dy: &Tensor) {
    let grads = layer.gradient(x, dy).unwrap().unwrap();
    let (weights, biases) = layer.parameters().unwrap();
    assert_eq!(grads.weights.dims(), weights.dims());
    assert_eq!(grads.biases.dims(), biases.dims());

    let perturbed = |slot: usize, index: usize, delta: f32| {
        let mut probe = layer.clone_layer();
        let (w, b) = probe.parameters_mut().unwrap();
        let target = if slot == 0 { w } else { b };
        target.as_mut_slice()[index] += delta;
        loss(probe.as_ref(), x, dy)
    };

    for (slot, analytical) in [(0, &grads.weights), (1, &grads.biases)] {
        for index in 0..analytical.len() {
            let numerical = (perturbed(slot, index, STEP) - perturbed(slot, index, -STEP))
                / (2.0 * STEP as f64);
            assert_relative_eq!(
                numerical as f32,
                analytical.as_slice()[index],
                epsilon = 1e-3,
                max_relative = 1e-2
            );
        }
    }
}

#[test]
fn test_fully_connected_gradients() {
    let layer = FullyConnectedLayer::new(Shape::flat(5), 3, &mut WeightsProvider::new(3));
    let x = wave(4, Shape::flat(5), 0.0);
    let dy = wave(4, Shape::flat(3), 1.0);
    check_input_gradient(&layer, &x, &dy);
    check_parameter_gradients(&layer, &x, &dy);
}

#[test]
fn test_fully_connected_accepts_spatial_input() {
    let layer = FullyConnectedLayer::new(Shape::new(2, 2, 2), 3, &mut WeightsProvider::new(4));
    let x = wave(2, Shape::new(2, 2, 2), 0.5);
    let dy = wave(2, Shape::flat(3), 2.0);
    check_input_gradient(&layer, &x, &dy);
    check_parameter_gradients(&layer, &x, &dy);
}

#[test]
fn test_convolutional_gradients() {
    let info = ConvolutionInfo {
        kernel_size: 3,
        stride: 1,
        padding: 1,
    };
    let layer =
        ConvolutionalLayer::new(Shape::new(2, 4, 4), 3, info, &mut WeightsProvider::new(5))
            .unwrap();
    let x = wave(2, Shape::new(2, 4, 4), 0.3);
    let dy = wave(2, layer.output_shape(), 1.7);
    check_input_gradient(&layer, &x, &dy);
    check_parameter_gradients(&layer, &x, &dy);
}

#[test]
fn test_strided_convolution_gradients() {
    let info = ConvolutionInfo {
        kernel_size: 2,
        stride: 2,
        padding: 0,
    };
    let layer =
        ConvolutionalLayer::new(Shape::new(1, 5, 5), 2, info, &mut WeightsProvider::new(6))
            .unwrap();
    assert_eq!(layer.output_shape(), Shape::new(2, 2, 2));
    let x = wave(3, Shape::new(1, 5, 5), 0.1);
    let dy = wave(3, layer.output_shape(), 0.9);
    check_input_gradient(&layer, &x, &dy);
    check_parameter_gradients(&layer, &x, &dy);
}

#[test]
fn test_softmax_gradient() {
    let layer = SoftmaxLayer::new(Shape::flat(4));
    let x = wave(3, Shape::flat(4), 0.2);
    let dy = wave(3, Shape::flat(4), 2.2);
    check_input_gradient(&layer, &x, &dy);
    assert!(layer.gradient(&x, &dy).unwrap().is_none());
}

#[test]
fn test_activation_gradients() {
    // Offset keeps inputs away from the ReLU kink at zero.
    let shape = Shape::flat(6);
    let x = Tensor::from_vec(
        1,
        shape,
        vec![-1.2, -0.4, 0.3, 0.8, 1.5, -2.0],
    )
    .unwrap();
    let dy = wave(1, shape, 0.4);
    for activation in [
        ActivationType::Identity,
        ActivationType::Sigmoid,
        ActivationType::Tanh,
        ActivationType::Relu,
        ActivationType::LeakyRelu { alpha: 0.1 },
    ] {
        let layer = ActivationLayer::new(shape, activation);
        check_input_gradient(&layer, &x, &dy);
    }
}

#[test]
fn test_pooling_gradient() {
    // Distinct values so every window has a unique maximum.
    let shape = Shape::new(1, 4, 4);
    let data = (0..16).map(|i| ((i * 7) % 16) as f32 * 0.25).collect();
    let x = Tensor::from_vec(1, shape, data).unwrap();
    let layer = PoolingLayer::with_default_size(shape);
    let dy = wave(1, layer.output_shape(), 0.0);
    check_input_gradient(&layer, &x, &dy);
}
