//! Architecture configuration structures
//!
//! Networks can be described in JSON and built without code changes. An architecture names
//! the per-sample input shape once; every layer's input shape is then derived from the
//! output shape of the layer before it.
//!
//! # Example
//!
//! ```json
//! {
//!   "input": { "channels": 1, "height": 28, "width": 28 },
//!   "layers": [
//!     { "layer_type": "convolutional", "kernels": 8, "kernel_size": 3, "padding": 1 },
//!     { "layer_type": "batch_normalization", "mode": "spatial" },
//!     { "layer_type": "activation", "activation": { "type": "relu" } },
//!     { "layer_type": "pooling", "size": 2 },
//!     { "layer_type": "fully_connected", "outputs": 10 },
//!     { "layer_type": "softmax" }
//!   ]
//! }
//! ```

use crate::backend::ConvolutionInfo;
use crate::error::{Error, Result};
use crate::layers::{
    ActivationLayer, ActivationType, BatchNormalizationLayer, ConvolutionalLayer,
    FullyConnectedLayer, Layer, NormalizationMode, PoolingLayer, SoftmaxLayer, DEFAULT_POOL_SIZE,
};
use crate::network::Network;
use crate::tensor::Shape;
use crate::weights::WeightsProvider;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

fn default_stride() -> usize {
    1
}

fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}

fn default_mode() -> String {
    NormalizationMode::Spatial.as_str().to_string()
}

/// Configuration for a single layer, tagged by `layer_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "layer_type", rename_all = "snake_case")]
pub enum LayerConfig {
    FullyConnected {
        outputs: usize,
    },
    Convolutional {
        kernels: usize,
        kernel_size: usize,
        #[serde(default = "default_stride")]
        stride: usize,
        #[serde(default)]
        padding: usize,
    },
    Pooling {
        #[serde(default = "default_pool_size")]
        size: usize,
    },
    Softmax,
    Activation {
        activation: ActivationType,
    },
    BatchNormalization {
        /// `"spatial"` or `"per_activation"`
        #[serde(default = "default_mode")]
        mode: String,
    },
}

/// Configuration for the entire network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchitectureConfig {
    /// Per-sample input shape of the first layer
    pub input: Shape,
    /// Layers in application order
    pub layers: Vec<LayerConfig>,
}

/// Loads and validates an architecture from a JSON file.
///
/// ```no_run
/// use neural_toolkit::architecture::load_architecture;
///
/// let arch = load_architecture("config/architectures/cnn_bn.json").unwrap();
/// assert!(!arch.layers.is_empty());
/// ```
pub fn load_architecture(path: impl AsRef<Path>) -> Result<ArchitectureConfig> {
    let contents = fs::read_to_string(path.as_ref())?;
    let config: ArchitectureConfig = serde_json::from_str(&contents)?;
    validate_architecture(&config)?;
    Ok(config)
}

fn positive(value: usize, what: &str, index: usize) -> Result<()> {
    if value == 0 {
        return Err(Error::Config(format!(
            "layer {}: {} must be positive",
            index, what
        )));
    }
    Ok(())
}

/// Checks every value that would otherwise panic or fail late during construction.
pub fn validate_architecture(config: &ArchitectureConfig) -> Result<()> {
    if config.layers.is_empty() {
        return Err(Error::Config("architecture has no layers".to_string()));
    }
    for (index, layer) in config.layers.iter().enumerate() {
        match layer {
            LayerConfig::FullyConnected { outputs } => positive(*outputs, "outputs", index)?,
            LayerConfig::Convolutional {
                kernels,
                kernel_size,
                stride,
                ..
            } => {
                positive(*kernels, "kernels", index)?;
                positive(*kernel_size, "kernel_size", index)?;
                positive(*stride, "stride", index)?;
            }
            LayerConfig::Pooling { size } => positive(*size, "size", index)?,
            LayerConfig::Activation {
                activation: ActivationType::LeakyRelu { alpha },
            } if !(alpha.is_finite() && *alpha >= 0.0) => {
                return Err(Error::Config(format!(
                    "layer {}: leaky relu alpha must be non-negative, got {}",
                    index, alpha
                )));
            }
            LayerConfig::BatchNormalization { mode } => {
                mode.parse::<NormalizationMode>()?;
            }
            _ => {}
        }
    }
    Ok(())
}

/// Builds a network from `config`, drawing parameters from `provider`.
///
/// Shapes are chained from `config.input`; a convolution that does not fit its input fails
/// with [`Error::ShapeMismatch`].
pub fn build_network(
    config: &ArchitectureConfig,
    provider: &mut WeightsProvider,
) -> Result<Network> {
    validate_architecture(config)?;

    let mut shape = config.input;
    let mut layers: Vec<Box<dyn Layer>> = Vec::with_capacity(config.layers.len());
    for layer in &config.layers {
        let built: Box<dyn Layer> = match layer {
            LayerConfig::FullyConnected { outputs } => {
                Box::new(FullyConnectedLayer::new(shape, *outputs, provider))
            }
            LayerConfig::Convolutional {
                kernels,
                kernel_size,
                stride,
                padding,
            } => {
                let info = ConvolutionInfo {
                    kernel_size: *kernel_size,
                    stride: *stride,
                    padding: *padding,
                };
                Box::new(ConvolutionalLayer::new(shape, *kernels, info, provider)?)
            }
            LayerConfig::Pooling { size } => Box::new(PoolingLayer::new(shape, *size)),
            LayerConfig::Softmax => Box::new(SoftmaxLayer::new(shape)),
            LayerConfig::Activation { activation } => {
                Box::new(ActivationLayer::new(shape, *activation))
            }
            LayerConfig::BatchNormalization { mode } => {
                let mode: NormalizationMode = mode.parse()?;
                Box::new(BatchNormalizationLayer::new(shape, mode, provider))
            }
        };
        shape = built.output_shape();
        layers.push(built);
    }

    Network::new(layers)
}
