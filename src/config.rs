//! Configuration structures for training
//!
//! A [`TrainingConfig`] selects the optimizer and its hyperparameters, the cost function, the
//! compute backend and the parameter initialization of a run. Every field has a default, so a
//! JSON file only needs to name what differs.

use crate::backend::BackendKind;
use crate::cost::CostFunction;
use crate::error::{Error, Result};
use crate::weights::{BiasInitializationMode, WeightsInitializationMode, WeightsProvider};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    Sgd,
    #[default]
    Adam,
}

/// Configuration for a training run.
///
/// # Example
///
/// ```json
/// {
///   "optimizer": "sgd",
///   "learning_rate": 0.05,
///   "cost": "quadratic",
///   "backend": "cpu",
///   "seed": 7,
///   "weights_initialization": "he_et_al_normal"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainingConfig {
    pub optimizer: OptimizerKind,
    pub learning_rate: f32,
    /// Adam first moment decay
    pub beta1: f32,
    /// Adam second moment decay
    pub beta2: f32,
    pub epsilon: f32,
    pub cost: CostFunction,
    pub backend: BackendKind,
    /// Seed of the weights provider
    pub seed: u64,
    pub weights_initialization: WeightsInitializationMode,
    pub bias_initialization: BiasInitializationMode,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            optimizer: OptimizerKind::Adam,
            learning_rate: 0.001,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            cost: CostFunction::CrossEntropy,
            backend: BackendKind::Cpu,
            seed: 42,
            weights_initialization: WeightsInitializationMode::GlorotUniform,
            bias_initialization: BiasInitializationMode::Zero,
        }
    }
}

impl TrainingConfig {
    /// Checks value ranges that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(Error::Config(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        for (name, value) in [("beta1", self.beta1), ("beta2", self.beta2)] {
            if !(0.0..1.0).contains(&value) {
                return Err(Error::Config(format!(
                    "{} must be in [0, 1), got {}",
                    name, value
                )));
            }
        }
        if !(self.epsilon.is_finite() && self.epsilon > 0.0) {
            return Err(Error::Config(format!(
                "epsilon must be positive, got {}",
                self.epsilon
            )));
        }
        Ok(())
    }

    /// Makes `backend` the process-wide compute backend.
    pub fn select_backend(&self) {
        crate::backend::set_backend(self.backend);
    }

    /// Weights provider seeded and configured from this run.
    pub fn weights_provider(&self) -> WeightsProvider {
        WeightsProvider::with_modes(
            self.seed,
            self.weights_initialization,
            self.bias_initialization,
        )
    }
}

/// Loads and validates a training configuration from a JSON file.
///
/// # Examples
///
/// ```no_run
/// use neural_toolkit::config::load_config;
///
/// let cfg = load_config("config/mnist_cnn.json").unwrap();
/// println!("learning rate {}", cfg.learning_rate);
/// ```
pub fn load_config(path: impl AsRef<Path>) -> Result<TrainingConfig> {
    let contents = fs::read_to_string(path.as_ref())?;
    let config: TrainingConfig = serde_json::from_str(&contents)?;
    config.validate()?;
    log::debug!("loaded training config from {}", path.as_ref().display());
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(TrainingConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: TrainingConfig =
            serde_json::from_str(r#"{"optimizer":"sgd","learning_rate":0.1}"#).unwrap();
        assert_eq!(config.optimizer, OptimizerKind::Sgd);
        assert_eq!(config.learning_rate, 0.1);
        assert_eq!(config.seed, 42);
        assert_eq!(config.backend, BackendKind::Cpu);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = TrainingConfig::default();
        config.learning_rate = 0.0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = TrainingConfig::default();
        config.beta2 = 1.0;
        assert!(config.validate().is_err());

        let mut config = TrainingConfig::default();
        config.epsilon = f32::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result = serde_json::from_str::<TrainingConfig>(r#"{"momentum":0.5}"#);
        assert!(result.is_err());
    }
}
