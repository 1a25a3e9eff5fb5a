//! CPU kernels
//!
//! Straightforward loop implementations of every [`ComputeBackend`] kernel. Work is split
//! across samples (or across filters for gradient reductions) with `rayon`; reductions over
//! the batch that feed shared per-channel statistics are accumulated serially in `f64` so
//! the result does not depend on the thread count.

use super::{ComputeBackend, ConvolutionInfo, BATCH_NORMALIZATION_EPSILON};
use crate::error::{Error, Result};
use crate::layers::{ActivationType, NormalizationMode};
use crate::tensor::{Shape, Tensor};
use rayon::prelude::*;

/// Pure Rust backend, always available.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuBackend;

fn ensure(condition: bool, message: impl FnOnce() -> String) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(Error::BackendFailure(message()))
    }
}

fn ensure_layout(kernel: &str, name: &str, tensor: &Tensor, reference: &Tensor) -> Result<()> {
    ensure(tensor.same_layout(reference), || {
        format!(
            "{}: {} has layout {:?}, expected {:?}",
            kernel,
            name,
            tensor.dims(),
            reference.dims()
        )
    })
}

fn ensure_single(kernel: &str, name: &str, tensor: &Tensor, shape: Shape) -> Result<()> {
    ensure(tensor.entities() == 1 && tensor.shape() == shape, || {
        format!(
            "{}: {} has layout {:?}, expected [1, {}, {}, {}]",
            kernel,
            name,
            tensor.dims(),
            shape.channels(),
            shape.height(),
            shape.width()
        )
    })
}

/// Maps an output coordinate plus kernel offset back to an input coordinate, if in bounds.
#[inline]
fn source_index(
    out: usize,
    offset: usize,
    stride: usize,
    padding: usize,
    limit: usize,
) -> Option<usize> {
    let position = out * stride + offset;
    if position < padding || position - padding >= limit {
        None
    } else {
        Some(position - padding)
    }
}

/// Visits every `(input index, kernel index)` pair read by output position `(oy, ox)` of one
/// sample and one kernel. Taps that land in the zero padding are skipped.
#[inline]
fn for_each_tap(
    info: &ConvolutionInfo,
    in_channels: usize,
    (height, width): (usize, usize),
    (oy, ox): (usize, usize),
    mut visit: impl FnMut(usize, usize),
) {
    let k = info.kernel_size;
    for ky in 0..k {
        let Some(iy) = source_index(oy, ky, info.stride, info.padding, height) else {
            continue;
        };
        for kx in 0..k {
            let Some(ix) = source_index(ox, kx, info.stride, info.padding, width) else {
                continue;
            };
            for c in 0..in_channels {
                visit((c * height + iy) * width + ix, (c * k + ky) * k + kx);
            }
        }
    }
}

/// Index of the normalization parameter that owns element `position` of a sample.
#[inline]
fn parameter_index(mode: NormalizationMode, position: usize, spatial: usize) -> usize {
    match mode {
        NormalizationMode::Spatial => position / spatial,
        NormalizationMode::PerActivation => position,
    }
}

/// Number of values reduced into each normalization parameter.
fn reduction_count(mode: NormalizationMode, x: &Tensor) -> usize {
    match mode {
        NormalizationMode::Spatial => x.entities() * x.shape().spatial_size(),
        NormalizationMode::PerActivation => x.entities(),
    }
}

/// Per-parameter batch mean and biased variance.
fn batch_statistics(mode: NormalizationMode, x: &Tensor) -> (Vec<f64>, Vec<f64>) {
    let shape = x.shape();
    let spatial = shape.spatial_size();
    let count = reduction_count(mode, x) as f64;
    let mut mean = vec![0.0f64; mode.parameter_shape(shape).size()];
    let mut var = vec![0.0f64; mean.len()];

    for n in 0..x.entities() {
        for (p, &v) in x.sample(n).iter().enumerate() {
            mean[parameter_index(mode, p, spatial)] += v as f64;
        }
    }
    for m in &mut mean {
        *m /= count;
    }

    for n in 0..x.entities() {
        for (p, &v) in x.sample(n).iter().enumerate() {
            let k = parameter_index(mode, p, spatial);
            let diff = v as f64 - mean[k];
            var[k] += diff * diff;
        }
    }
    for v in &mut var {
        *v /= count;
    }

    (mean, var)
}

fn inverse_std(variance: impl Iterator<Item = f64>) -> Vec<f64> {
    variance
        .map(|v| 1.0 / (v + BATCH_NORMALIZATION_EPSILON as f64).sqrt())
        .collect()
}

/// `y = γ·(x - mean)·inv_std + β`, parallel over samples.
fn normalize(
    mode: NormalizationMode,
    x: &Tensor,
    gamma: &Tensor,
    beta: &Tensor,
    mean: &[f64],
    inv_std: &[f64],
    y: &mut Tensor,
) {
    let size = x.shape().size();
    let spatial = x.shape().spatial_size();
    let gamma = gamma.as_slice();
    let beta = beta.as_slice();

    y.as_mut_slice()
        .par_chunks_mut(size)
        .zip(x.as_slice().par_chunks(size))
        .for_each(|(out, input)| {
            for (p, (o, &v)) in out.iter_mut().zip(input).enumerate() {
                let k = parameter_index(mode, p, spatial);
                let x_hat = (v as f64 - mean[k]) * inv_std[k];
                *o = (gamma[k] as f64 * x_hat + beta[k] as f64) as f32;
            }
        });
}

fn check_normalization_parameters(
    kernel: &str,
    mode: NormalizationMode,
    x: &Tensor,
    parameters: &[(&str, &Tensor)],
) -> Result<()> {
    let expected = mode.parameter_shape(x.shape());
    for (name, tensor) in parameters {
        ensure_single(kernel, name, tensor, expected)?;
    }
    Ok(())
}

impl ComputeBackend for CpuBackend {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn fully_connected_forward(
        &self,
        x: &Tensor,
        w: &Tensor,
        b: &Tensor,
        y: &mut Tensor,
    ) -> Result<()> {
        let inputs = x.shape().size();
        let outputs = y.shape().size();
        ensure(w.entities() == inputs && w.shape() == Shape::flat(outputs), || {
            format!(
                "fully_connected_forward: weights {:?} incompatible with {} inputs and {} outputs",
                w.dims(),
                inputs,
                outputs
            )
        })?;
        ensure_single("fully_connected_forward", "biases", b, Shape::flat(outputs))?;
        ensure(y.entities() == x.entities(), || {
            "fully_connected_forward: output batch size differs from input".to_string()
        })?;

        let weights = w.as_slice();
        let biases = b.as_slice();
        y.as_mut_slice()
            .par_chunks_mut(outputs)
            .zip(x.as_slice().par_chunks(inputs))
            .for_each(|(out, input)| {
                out.copy_from_slice(biases);
                for (i, &xi) in input.iter().enumerate() {
                    if xi == 0.0 {
                        continue;
                    }
                    let row = &weights[i * outputs..(i + 1) * outputs];
                    for (o, &wij) in out.iter_mut().zip(row) {
                        *o += xi * wij;
                    }
                }
            });
        Ok(())
    }

    fn fully_connected_backward_data(
        &self,
        w: &Tensor,
        dy: &Tensor,
        dx: &mut Tensor,
    ) -> Result<()> {
        let inputs = dx.shape().size();
        let outputs = dy.shape().size();
        ensure(w.entities() == inputs && w.shape() == Shape::flat(outputs), || {
            format!(
                "fully_connected_backward_data: weights {:?} incompatible with {} inputs and {} \
                 outputs",
                w.dims(),
                inputs,
                outputs
            )
        })?;
        ensure(dy.entities() == dx.entities(), || {
            "fully_connected_backward_data: gradient batch sizes differ".to_string()
        })?;

        let weights = w.as_slice();
        dx.as_mut_slice()
            .par_chunks_mut(inputs)
            .zip(dy.as_slice().par_chunks(outputs))
            .for_each(|(grad_in, grad_out)| {
                for (i, g) in grad_in.iter_mut().enumerate() {
                    let row = &weights[i * outputs..(i + 1) * outputs];
                    *g = row.iter().zip(grad_out).map(|(w, d)| w * d).sum();
                }
            });
        Ok(())
    }

    fn fully_connected_backward_filter(
        &self,
        x: &Tensor,
        dy: &Tensor,
        dw: &mut Tensor,
        db: &mut Tensor,
    ) -> Result<()> {
        let inputs = x.shape().size();
        let outputs = dy.shape().size();
        ensure(dw.entities() == inputs && dw.shape() == Shape::flat(outputs), || {
            format!(
                "fully_connected_backward_filter: weight gradient {:?} incompatible with {} \
                 inputs and {} outputs",
                dw.dims(),
                inputs,
                outputs
            )
        })?;
        ensure_single(
            "fully_connected_backward_filter",
            "bias gradient",
            db,
            Shape::flat(outputs),
        )?;
        ensure(x.entities() == dy.entities(), || {
            "fully_connected_backward_filter: input and gradient batch sizes differ".to_string()
        })?;

        let batch = x.entities();
        let x_data = x.as_slice();
        let dy_data = dy.as_slice();
        dw.as_mut_slice()
            .par_chunks_mut(outputs)
            .enumerate()
            .for_each(|(i, row)| {
                row.iter_mut().for_each(|g| *g = 0.0);
                for n in 0..batch {
                    let xi = x_data[n * inputs + i];
                    let grad_out = &dy_data[n * outputs..(n + 1) * outputs];
                    for (g, &d) in row.iter_mut().zip(grad_out) {
                        *g += xi * d;
                    }
                }
            });

        let bias_grad = db.as_mut_slice();
        bias_grad.iter_mut().for_each(|g| *g = 0.0);
        for grad_out in dy_data.chunks(outputs) {
            for (g, &d) in bias_grad.iter_mut().zip(grad_out) {
                *g += d;
            }
        }
        Ok(())
    }

    fn convolution_forward(
        &self,
        info: &ConvolutionInfo,
        x: &Tensor,
        w: &Tensor,
        b: &Tensor,
        y: &mut Tensor,
    ) -> Result<()> {
        let [_, in_channels, height, width] = x.dims();
        let k = info.kernel_size;
        let kernels = w.entities();
        let (out_h, out_w) = info.output_dims(height, width).ok_or_else(|| {
            Error::BackendFailure(format!(
                "convolution_forward: kernel {} does not fit input {}x{}",
                k, height, width
            ))
        })?;
        ensure(w.shape() == Shape::new(in_channels, k, k), || {
            format!(
                "convolution_forward: kernels {:?} incompatible with {} input channels",
                w.dims(),
                in_channels
            )
        })?;
        ensure_single("convolution_forward", "biases", b, Shape::flat(kernels))?;
        ensure(
            y.entities() == x.entities() && y.shape() == Shape::new(kernels, out_h, out_w),
            || format!("convolution_forward: output layout {:?} is wrong", y.dims()),
        )?;

        let weights = w.as_slice();
        let biases = b.as_slice();
        let kernel_len = in_channels * k * k;
        let plane = height * width;
        y.as_mut_slice()
            .par_chunks_mut(kernels * out_h * out_w)
            .zip(x.as_slice().par_chunks(in_channels * plane))
            .for_each(|(out, input)| {
                for kk in 0..kernels {
                    let filter = &weights[kk * kernel_len..(kk + 1) * kernel_len];
                    for oy in 0..out_h {
                        for ox in 0..out_w {
                            let mut acc = biases[kk];
                            for_each_tap(info, in_channels, (height, width), (oy, ox), |i, f| {
                                acc += input[i] * filter[f];
                            });
                            out[(kk * out_h + oy) * out_w + ox] = acc;
                        }
                    }
                }
            });
        Ok(())
    }

    fn convolution_backward_data(
        &self,
        info: &ConvolutionInfo,
        w: &Tensor,
        dy: &Tensor,
        dx: &mut Tensor,
    ) -> Result<()> {
        let [_, in_channels, height, width] = dx.dims();
        let k = info.kernel_size;
        let kernels = w.entities();
        let (out_h, out_w) = info.output_dims(height, width).ok_or_else(|| {
            Error::BackendFailure(format!(
                "convolution_backward_data: kernel {} does not fit input {}x{}",
                k, height, width
            ))
        })?;
        ensure(w.shape() == Shape::new(in_channels, k, k), || {
            format!(
                "convolution_backward_data: kernels {:?} incompatible with {} input channels",
                w.dims(),
                in_channels
            )
        })?;
        ensure(
            dy.entities() == dx.entities() && dy.shape() == Shape::new(kernels, out_h, out_w),
            || format!("convolution_backward_data: gradient layout {:?} is wrong", dy.dims()),
        )?;

        let weights = w.as_slice();
        let kernel_len = in_channels * k * k;
        let plane = height * width;
        dx.as_mut_slice()
            .par_chunks_mut(in_channels * plane)
            .zip(dy.as_slice().par_chunks(kernels * out_h * out_w))
            .for_each(|(grad_in, grad_out)| {
                grad_in.iter_mut().for_each(|g| *g = 0.0);
                for kk in 0..kernels {
                    let filter = &weights[kk * kernel_len..(kk + 1) * kernel_len];
                    for oy in 0..out_h {
                        for ox in 0..out_w {
                            let g = grad_out[(kk * out_h + oy) * out_w + ox];
                            if g == 0.0 {
                                continue;
                            }
                            for_each_tap(info, in_channels, (height, width), (oy, ox), |i, f| {
                                grad_in[i] += g * filter[f];
                            });
                        }
                    }
                }
            });
        Ok(())
    }

    fn convolution_backward_filter(
        &self,
        info: &ConvolutionInfo,
        x: &Tensor,
        dy: &Tensor,
        dw: &mut Tensor,
        db: &mut Tensor,
    ) -> Result<()> {
        let [batch, in_channels, height, width] = x.dims();
        let k = info.kernel_size;
        let kernels = dw.entities();
        let (out_h, out_w) = info.output_dims(height, width).ok_or_else(|| {
            Error::BackendFailure(format!(
                "convolution_backward_filter: kernel {} does not fit input {}x{}",
                k, height, width
            ))
        })?;
        ensure(dw.shape() == Shape::new(in_channels, k, k), || {
            format!(
                "convolution_backward_filter: kernel gradient {:?} incompatible with {} input \
                 channels",
                dw.dims(),
                in_channels
            )
        })?;
        ensure_single(
            "convolution_backward_filter",
            "bias gradient",
            db,
            Shape::flat(kernels),
        )?;
        ensure(
            dy.entities() == batch && dy.shape() == Shape::new(kernels, out_h, out_w),
            || format!("convolution_backward_filter: gradient layout {:?} is wrong", dy.dims()),
        )?;

        let x_data = x.as_slice();
        let dy_data = dy.as_slice();
        let plane = height * width;
        let sample_in = in_channels * plane;
        let out_plane = out_h * out_w;
        let sample_out = kernels * out_plane;

        dw.as_mut_slice()
            .par_chunks_mut(in_channels * k * k)
            .enumerate()
            .for_each(|(kk, filter_grad)| {
                filter_grad.iter_mut().for_each(|g| *g = 0.0);
                for n in 0..batch {
                    let input = &x_data[n * sample_in..(n + 1) * sample_in];
                    let start = n * sample_out + kk * out_plane;
                    let grad_out = &dy_data[start..start + out_plane];
                    for oy in 0..out_h {
                        for ox in 0..out_w {
                            let g = grad_out[oy * out_w + ox];
                            if g == 0.0 {
                                continue;
                            }
                            for_each_tap(info, in_channels, (height, width), (oy, ox), |i, f| {
                                filter_grad[f] += g * input[i];
                            });
                        }
                    }
                }
            });

        let bias_grad = db.as_mut_slice();
        for (kk, g) in bias_grad.iter_mut().enumerate() {
            *g = (0..batch)
                .map(|n| {
                    let start = n * sample_out + kk * out_plane;
                    dy_data[start..start + out_plane].iter().sum::<f32>()
                })
                .sum();
        }
        Ok(())
    }

    fn pooling_forward(&self, size: usize, x: &Tensor, y: &mut Tensor) -> Result<()> {
        let [_, channels, height, width] = x.dims();
        ensure(size > 0, || "pooling_forward: window size must be positive".to_string())?;
        let (out_h, out_w) = (height.div_ceil(size), width.div_ceil(size));
        ensure(
            y.entities() == x.entities() && y.shape() == Shape::new(channels, out_h, out_w),
            || format!("pooling_forward: output layout {:?} is wrong", y.dims()),
        )?;

        y.as_mut_slice()
            .par_chunks_mut(channels * out_h * out_w)
            .zip(x.as_slice().par_chunks(channels * height * width))
            .for_each(|(out, input)| {
                for c in 0..channels {
                    let plane = &input[c * height * width..(c + 1) * height * width];
                    for oy in 0..out_h {
                        for ox in 0..out_w {
                            let mut max = f32::NEG_INFINITY;
                            for iy in oy * size..((oy + 1) * size).min(height) {
                                for ix in ox * size..((ox + 1) * size).min(width) {
                                    max = max.max(plane[iy * width + ix]);
                                }
                            }
                            out[(c * out_h + oy) * out_w + ox] = max;
                        }
                    }
                }
            });
        Ok(())
    }

    fn pooling_backward(
        &self,
        size: usize,
        x: &Tensor,
        y: &Tensor,
        dy: &Tensor,
        dx: &mut Tensor,
    ) -> Result<()> {
        let [_, channels, height, width] = x.dims();
        ensure(size > 0, || "pooling_backward: window size must be positive".to_string())?;
        let (out_h, out_w) = (height.div_ceil(size), width.div_ceil(size));
        ensure(
            y.entities() == x.entities() && y.shape() == Shape::new(channels, out_h, out_w),
            || format!("pooling_backward: output layout {:?} is wrong", y.dims()),
        )?;
        ensure_layout("pooling_backward", "output gradient", dy, y)?;
        ensure_layout("pooling_backward", "input gradient", dx, x)?;

        let sample_out = channels * out_h * out_w;
        dx.as_mut_slice()
            .par_chunks_mut(channels * height * width)
            .zip(x.as_slice().par_chunks(channels * height * width))
            .zip(y.as_slice().par_chunks(sample_out))
            .zip(dy.as_slice().par_chunks(sample_out))
            .for_each(|(((grad_in, input), output), grad_out)| {
                grad_in.iter_mut().for_each(|g| *g = 0.0);
                for c in 0..channels {
                    let offset = c * height * width;
                    for oy in 0..out_h {
                        for ox in 0..out_w {
                            let out_index = (c * out_h + oy) * out_w + ox;
                            let max = output[out_index];
                            // First position holding the maximum receives the gradient.
                            'window: for iy in oy * size..((oy + 1) * size).min(height) {
                                for ix in ox * size..((ox + 1) * size).min(width) {
                                    let index = offset + iy * width + ix;
                                    if input[index] == max {
                                        grad_in[index] = grad_out[out_index];
                                        break 'window;
                                    }
                                }
                            }
                        }
                    }
                }
            });
        Ok(())
    }

    fn softmax_forward(&self, x: &Tensor, y: &mut Tensor) -> Result<()> {
        ensure_layout("softmax_forward", "output", y, x)?;
        let size = x.shape().size();
        y.as_mut_slice()
            .par_chunks_mut(size)
            .zip(x.as_slice().par_chunks(size))
            .for_each(|(out, input)| {
                let max = input.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let mut sum = 0.0f32;
                for (o, &v) in out.iter_mut().zip(input) {
                    *o = (v - max).exp();
                    sum += *o;
                }
                let inv_sum = 1.0 / sum;
                out.iter_mut().for_each(|o| *o *= inv_sum);
            });
        Ok(())
    }

    fn softmax_backward(&self, y: &Tensor, dy: &Tensor, dx: &mut Tensor) -> Result<()> {
        ensure_layout("softmax_backward", "output gradient", dy, y)?;
        ensure_layout("softmax_backward", "input gradient", dx, y)?;
        let size = y.shape().size();
        dx.as_mut_slice()
            .par_chunks_mut(size)
            .zip(y.as_slice().par_chunks(size))
            .zip(dy.as_slice().par_chunks(size))
            .for_each(|((grad_in, output), grad_out)| {
                let dot: f32 = output.iter().zip(grad_out).map(|(y, d)| y * d).sum();
                for ((g, &yi), &di) in grad_in.iter_mut().zip(output).zip(grad_out) {
                    *g = yi * (di - dot);
                }
            });
        Ok(())
    }

    fn activation_forward(
        &self,
        activation: ActivationType,
        x: &Tensor,
        y: &mut Tensor,
    ) -> Result<()> {
        ensure_layout("activation_forward", "output", y, x)?;
        y.as_mut_slice()
            .par_iter_mut()
            .zip(x.as_slice().par_iter())
            .for_each(|(o, &v)| *o = activation.apply(v));
        Ok(())
    }

    fn activation_backward(
        &self,
        activation: ActivationType,
        x: &Tensor,
        dy: &Tensor,
        dx: &mut Tensor,
    ) -> Result<()> {
        ensure_layout("activation_backward", "output gradient", dy, x)?;
        ensure_layout("activation_backward", "input gradient", dx, x)?;
        dx.as_mut_slice()
            .par_iter_mut()
            .zip(x.as_slice().par_iter().zip(dy.as_slice().par_iter()))
            .for_each(|(g, (&v, &d))| *g = d * activation.derivative(v));
        Ok(())
    }

    fn batch_normalization_forward_training(
        &self,
        mode: NormalizationMode,
        factor: f32,
        x: &Tensor,
        gamma: &Tensor,
        beta: &Tensor,
        mu: &mut Tensor,
        sigma2: &mut Tensor,
        y: &mut Tensor,
    ) -> Result<()> {
        const KERNEL: &str = "batch_normalization_forward_training";
        ensure(factor.is_finite() && factor > 0.0 && factor <= 1.0, || {
            format!("{}: blend factor {} outside (0, 1]", KERNEL, factor)
        })?;
        ensure_layout(KERNEL, "output", y, x)?;
        check_normalization_parameters(
            KERNEL,
            mode,
            x,
            &[("gamma", gamma), ("beta", beta), ("mu", &*mu), ("sigma2", &*sigma2)],
        )?;

        let (mean, var) = batch_statistics(mode, x);
        let factor = factor as f64;
        for (running, &batch) in mu.as_mut_slice().iter_mut().zip(&mean) {
            *running = ((1.0 - factor) * *running as f64 + factor * batch) as f32;
        }
        for (running, &batch) in sigma2.as_mut_slice().iter_mut().zip(&var) {
            *running = ((1.0 - factor) * *running as f64 + factor * batch) as f32;
        }

        // Normalize with the blended statistics exactly as stored, so backward and
        // inference read the same values this pass used.
        let blended: Vec<f64> = mu.as_slice().iter().map(|&m| m as f64).collect();
        let inv_std = inverse_std(sigma2.as_slice().iter().map(|&v| v as f64));
        normalize(mode, x, gamma, beta, &blended, &inv_std, y);
        Ok(())
    }

    fn batch_normalization_forward_inference(
        &self,
        mode: NormalizationMode,
        x: &Tensor,
        gamma: &Tensor,
        beta: &Tensor,
        mu: &Tensor,
        sigma2: &Tensor,
        y: &mut Tensor,
    ) -> Result<()> {
        const KERNEL: &str = "batch_normalization_forward_inference";
        ensure_layout(KERNEL, "output", y, x)?;
        check_normalization_parameters(
            KERNEL,
            mode,
            x,
            &[("gamma", gamma), ("beta", beta), ("mu", mu), ("sigma2", sigma2)],
        )?;

        let mean: Vec<f64> = mu.as_slice().iter().map(|&m| m as f64).collect();
        let inv_std = inverse_std(sigma2.as_slice().iter().map(|&v| v as f64));
        normalize(mode, x, gamma, beta, &mean, &inv_std, y);
        Ok(())
    }

    fn batch_normalization_backward_data(
        &self,
        mode: NormalizationMode,
        factor: f32,
        x: &Tensor,
        gamma: &Tensor,
        mu: &Tensor,
        sigma2: &Tensor,
        dy: &Tensor,
        dx: &mut Tensor,
    ) -> Result<()> {
        const KERNEL: &str = "batch_normalization_backward_data";
        ensure(factor.is_finite() && (0.0..=1.0).contains(&factor), || {
            format!("{}: blend factor {} outside [0, 1]", KERNEL, factor)
        })?;
        ensure_layout(KERNEL, "output gradient", dy, x)?;
        ensure_layout(KERNEL, "input gradient", dx, x)?;
        check_normalization_parameters(
            KERNEL,
            mode,
            x,
            &[("gamma", gamma), ("mu", mu), ("sigma2", sigma2)],
        )?;

        let shape = x.shape();
        let size = shape.size();
        let spatial = shape.spatial_size();
        let mean: Vec<f64> = mu.as_slice().iter().map(|&m| m as f64).collect();
        let inv_std = inverse_std(sigma2.as_slice().iter().map(|&v| v as f64));

        let mut sum_dy = vec![0.0f64; mean.len()];
        let mut sum_dy_x_hat = vec![0.0f64; mean.len()];
        for n in 0..x.entities() {
            for (p, (&v, &d)) in x.sample(n).iter().zip(dy.sample(n)).enumerate() {
                let k = parameter_index(mode, p, spatial);
                let x_hat = (v as f64 - mean[k]) * inv_std[k];
                sum_dy[k] += d as f64;
                sum_dy_x_hat[k] += d as f64 * x_hat;
            }
        }

        // mu and sigma2 depend on x only through the factor-weighted batch mean and
        // variance; with factor 0 they are constants.
        let (batch_mean, _) = batch_statistics(mode, x);
        let weight = factor as f64 / reduction_count(mode, x) as f64;
        let gamma = gamma.as_slice();
        dx.as_mut_slice()
            .par_chunks_mut(size)
            .zip(x.as_slice().par_chunks(size))
            .zip(dy.as_slice().par_chunks(size))
            .for_each(|((grad_in, input), grad_out)| {
                let values = grad_in.iter_mut().zip(input).zip(grad_out);
                for (p, ((g, &v), &d)) in values.enumerate() {
                    let k = parameter_index(mode, p, spatial);
                    let centered = (v as f64 - batch_mean[k]) * inv_std[k];
                    let through_statistics = weight * (sum_dy[k] + centered * sum_dy_x_hat[k]);
                    *g = (gamma[k] as f64 * inv_std[k] * (d as f64 - through_statistics)) as f32;
                }
            });
        Ok(())
    }

    fn batch_normalization_backward_gamma(
        &self,
        mode: NormalizationMode,
        x: &Tensor,
        mu: &Tensor,
        sigma2: &Tensor,
        dy: &Tensor,
        dgamma: &mut Tensor,
    ) -> Result<()> {
        const KERNEL: &str = "batch_normalization_backward_gamma";
        ensure_layout(KERNEL, "output gradient", dy, x)?;
        check_normalization_parameters(
            KERNEL,
            mode,
            x,
            &[("mu", mu), ("sigma2", sigma2), ("gamma gradient", &*dgamma)],
        )?;

        let spatial = x.shape().spatial_size();
        let mean: Vec<f64> = mu.as_slice().iter().map(|&m| m as f64).collect();
        let inv_std = inverse_std(sigma2.as_slice().iter().map(|&v| v as f64));
        let mut acc = vec![0.0f64; mean.len()];
        for n in 0..x.entities() {
            for (p, (&v, &d)) in x.sample(n).iter().zip(dy.sample(n)).enumerate() {
                let k = parameter_index(mode, p, spatial);
                acc[k] += d as f64 * (v as f64 - mean[k]) * inv_std[k];
            }
        }
        for (g, a) in dgamma.as_mut_slice().iter_mut().zip(acc) {
            *g = a as f32;
        }
        Ok(())
    }

    fn batch_normalization_backward_beta(
        &self,
        mode: NormalizationMode,
        dy: &Tensor,
        dbeta: &mut Tensor,
    ) -> Result<()> {
        const KERNEL: &str = "batch_normalization_backward_beta";
        check_normalization_parameters(KERNEL, mode, dy, &[("beta gradient", &*dbeta)])?;

        let spatial = dy.shape().spatial_size();
        let mut acc = vec![0.0f64; dbeta.len()];
        for n in 0..dy.entities() {
            for (p, &d) in dy.sample(n).iter().enumerate() {
                acc[parameter_index(mode, p, spatial)] += d as f64;
            }
        }
        for (g, a) in dbeta.as_mut_slice().iter_mut().zip(acc) {
            *g = a as f32;
        }
        Ok(())
    }
}
