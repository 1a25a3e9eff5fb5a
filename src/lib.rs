//! Neural Network Toolkit
//!
//! Layers with an explicit forward/backward/gradient contract, pluggable compute backends and
//! a stateful batch normalization layer whose running statistics stay consistent between
//! training and inference.
//!
//! # Modules
//!
//! - `tensor`: shapes and owned numeric buffers
//! - `backend`: the compute kernel trait, the CPU backend and backend selection
//! - `layers`: the `Layer` trait and its variants (fully connected, convolutional, pooling,
//!   softmax, activation, batch normalization)
//! - `weights`: seeded parameter initialization
//! - `optimizers`: optimizer trait and implementations (SGD, Adam)
//! - `cost`: cost functions and their output gradients
//! - `network`: sequential networks and the single-batch training step
//! - `config`: training configuration
//! - `architecture`: architecture configuration and network building
//!
//! # Logging
//!
//! The crate reports through the `log` facade and never installs a logger itself.

pub mod architecture;
pub mod backend;
pub mod config;
pub mod cost;
pub mod error;
pub mod layers;
pub mod network;
pub mod optimizers;
pub mod tensor;
pub mod weights;

pub use error::{Error, Result};
