//! Compute backends
//!
//! Layers never touch raw buffers of other components directly: every numeric kernel goes
//! through the [`ComputeBackend`] trait. The active backend is selected globally with
//! [`set_backend`] and resolved with [`current`] at the start of each layer call.
//!
//! # Supported Backends
//!
//! - `Cpu`: pure Rust kernels parallelized with `rayon` (default).
//! - `Gpu`: selectable, but this crate ships no device kernels; resolving it fails with
//!   [`Error::BackendFailure`] so callers can fall back explicitly.
//!
//! Every kernel receives pre-allocated output tensors and fills them. Kernels reject
//! incompatible buffers with [`Error::BackendFailure`] before writing anything.

pub mod cpu;

pub use cpu::CpuBackend;

use crate::error::{Error, Result};
use crate::layers::{ActivationType, NormalizationMode};
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};

/// Variance offset used by every batch normalization kernel.
pub const BATCH_NORMALIZATION_EPSILON: f32 = 1e-5;

/// Geometry of a square-kernel convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvolutionInfo {
    pub kernel_size: usize,
    pub stride: usize,
    pub padding: usize,
}

impl ConvolutionInfo {
    /// Output height and width for an input of `height × width`, or `None` when the kernel
    /// does not fit the padded input.
    pub fn output_dims(&self, height: usize, width: usize) -> Option<(usize, usize)> {
        if self.stride == 0 || self.kernel_size == 0 {
            return None;
        }
        let padded_h = height + 2 * self.padding;
        let padded_w = width + 2 * self.padding;
        if self.kernel_size > padded_h || self.kernel_size > padded_w {
            return None;
        }
        Some((
            (padded_h - self.kernel_size) / self.stride + 1,
            (padded_w - self.kernel_size) / self.stride + 1,
        ))
    }
}

/// Numeric kernels consumed by the layers.
///
/// Implementations may parallelize internally; calls are blocking and run to completion.
pub trait ComputeBackend: Send + Sync {
    /// Human readable backend name, used in log output.
    fn name(&self) -> &'static str;

    /// `y = x·W + b`, with `W` stored as `inputs` entities of `(outputs, 1, 1)`.
    fn fully_connected_forward(&self, x: &Tensor, w: &Tensor, b: &Tensor, y: &mut Tensor)
        -> Result<()>;

    /// `dx = dy·Wᵀ`
    fn fully_connected_backward_data(&self, w: &Tensor, dy: &Tensor, dx: &mut Tensor)
        -> Result<()>;

    /// `dW = xᵀ·dy`, `db = Σ dy`
    fn fully_connected_backward_filter(
        &self,
        x: &Tensor,
        dy: &Tensor,
        dw: &mut Tensor,
        db: &mut Tensor,
    ) -> Result<()>;

    fn convolution_forward(
        &self,
        info: &ConvolutionInfo,
        x: &Tensor,
        w: &Tensor,
        b: &Tensor,
        y: &mut Tensor,
    ) -> Result<()>;

    fn convolution_backward_data(
        &self,
        info: &ConvolutionInfo,
        w: &Tensor,
        dy: &Tensor,
        dx: &mut Tensor,
    ) -> Result<()>;

    fn convolution_backward_filter(
        &self,
        info: &ConvolutionInfo,
        x: &Tensor,
        dy: &Tensor,
        dw: &mut Tensor,
        db: &mut Tensor,
    ) -> Result<()>;

    /// Non-overlapping max pooling with a `size × size` window.
    fn pooling_forward(&self, size: usize, x: &Tensor, y: &mut Tensor) -> Result<()>;

    fn pooling_backward(
        &self,
        size: usize,
        x: &Tensor,
        y: &Tensor,
        dy: &Tensor,
        dx: &mut Tensor,
    ) -> Result<()>;

    /// Softmax over each whole sample.
    fn softmax_forward(&self, x: &Tensor, y: &mut Tensor) -> Result<()>;

    fn softmax_backward(&self, y: &Tensor, dy: &Tensor, dx: &mut Tensor) -> Result<()>;

    fn activation_forward(&self, activation: ActivationType, x: &Tensor, y: &mut Tensor)
        -> Result<()>;

    fn activation_backward(
        &self,
        activation: ActivationType,
        x: &Tensor,
        dy: &Tensor,
        dx: &mut Tensor,
    ) -> Result<()>;

    /// Blends the batch statistics of `x` into `mu`/`sigma2` with
    /// `running ← (1 - factor)·running + factor·batch`, then normalizes `x` with the blended
    /// values.
    ///
    /// `factor` is the cumulative-moving-average weight `1 / (1 + iteration)` chosen by the
    /// layer. It takes the place of a fixed smoothing (momentum) constant, so the kernel takes
    /// no separate momentum argument. Factors outside `(0, 1]` fail with `BackendFailure`.
    #[allow(clippy::too_many_arguments)]
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
    ) -> Result<()>;

    /// Normalizes `x` with the frozen `mu`/`sigma2`.
    #[allow(clippy::too_many_arguments)]
    fn batch_normalization_forward_inference(
        &self,
        mode: NormalizationMode,
        x: &Tensor,
        gamma: &Tensor,
        beta: &Tensor,
        mu: &Tensor,
        sigma2: &Tensor,
        y: &mut Tensor,
    ) -> Result<()>;

    /// Input gradient of [`batch_normalization_forward_training`] for the pass that blended
    /// with `factor` and left `mu`/`sigma2` behind. A factor of 0 differentiates
    /// normalization with constant statistics, as in inference.
    ///
    /// [`batch_normalization_forward_training`]: ComputeBackend::batch_normalization_forward_training
    #[allow(clippy::too_many_arguments)]
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
    ) -> Result<()>;

    fn batch_normalization_backward_gamma(
        &self,
        mode: NormalizationMode,
        x: &Tensor,
        mu: &Tensor,
        sigma2: &Tensor,
        dy: &Tensor,
        dgamma: &mut Tensor,
    ) -> Result<()>;

    fn batch_normalization_backward_beta(
        &self,
        mode: NormalizationMode,
        dy: &Tensor,
        dbeta: &mut Tensor,
    ) -> Result<()>;
}

/// Enumeration of selectable backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum BackendKind {
    #[default]
    Cpu = 0,
    Gpu = 1,
}

impl TryFrom<u8> for BackendKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Cpu),
            1 => Ok(Self::Gpu),
            other => Err(Error::BackendFailure(format!(
                "unknown backend discriminator {}",
                other
            ))),
        }
    }
}

// Backend changes are rare and never happen mid-kernel, so acquire/release is enough.
static ACTIVE_BACKEND: AtomicU8 = AtomicU8::new(BackendKind::Cpu as u8);

static CPU_BACKEND: CpuBackend = CpuBackend;

/// Sets the backend used by subsequent layer calls.
pub fn set_backend(kind: BackendKind) {
    log::info!("compute backend set to {:?}", kind);
    ACTIVE_BACKEND.store(kind as u8, Ordering::Release);
}

/// Returns the selected backend kind, defaulting to [`BackendKind::Cpu`].
pub fn get_backend() -> BackendKind {
    BackendKind::try_from(ACTIVE_BACKEND.load(Ordering::Acquire)).unwrap_or_default()
}

/// Resolves a backend kind to its kernels.
pub fn resolve(kind: BackendKind) -> Result<&'static dyn ComputeBackend> {
    match kind {
        BackendKind::Cpu => Ok(&CPU_BACKEND),
        BackendKind::Gpu => {
            log::warn!("GPU backend requested but no device kernels are available");
            Err(Error::BackendFailure(
                "no GPU device kernels are available in this build".to_string(),
            ))
        }
    }
}

/// Kernels of the currently selected backend.
pub fn current() -> Result<&'static dyn ComputeBackend> {
    resolve(get_backend())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_from_u8() {
        assert_eq!(BackendKind::try_from(0).unwrap(), BackendKind::Cpu);
        assert_eq!(BackendKind::try_from(1).unwrap(), BackendKind::Gpu);
        assert!(BackendKind::try_from(7).is_err());
    }

    #[test]
    fn test_resolve_cpu() {
        let backend = resolve(BackendKind::Cpu).unwrap();
        assert_eq!(backend.name(), "cpu");
    }

    #[test]
    fn test_resolve_gpu_fails() {
        let err = resolve(BackendKind::Gpu).err().unwrap();
        assert!(matches!(err, Error::BackendFailure(_)));
    }

    #[test]
    fn test_convolution_output_dims() {
        let info = ConvolutionInfo {
            kernel_size: 3,
            stride: 1,
            padding: 1,
        };
        assert_eq!(info.output_dims(28, 28), Some((28, 28)));

        let info = ConvolutionInfo {
            kernel_size: 3,
            stride: 2,
            padding: 0,
        };
        assert_eq!(info.output_dims(7, 7), Some((3, 3)));

        let info = ConvolutionInfo {
            kernel_size: 5,
            stride: 1,
            padding: 0,
        };
        assert_eq!(info.output_dims(3, 3), None);
    }
}
