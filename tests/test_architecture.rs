//! Tests for architecture parsing and network building
//!
//! - Loading valid JSON architecture files
//! - Building networks whose shapes chain from the declared input
//! - Rejecting invalid values, unknown modes, broken geometry and unreadable files

use neural_toolkit::architecture::{build_network, load_architecture, LayerConfig};
use neural_toolkit::layers::{BatchNormalizationLayer, LayerKind, NormalizationMode};
use neural_toolkit::tensor::{Shape, Tensor};
use neural_toolkit::weights::WeightsProvider;
use neural_toolkit::Error;
use std::io::Write;
use tempfile::NamedTempFile;

fn write_temp_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("failed to create temp file");
    file.write_all(contents.as_bytes())
        .expect("failed to write temp config");
    file
}

const CNN_WITH_BATCH_NORMALIZATION: &str = r#"{
  "input": { "channels": 1, "height": 8, "width": 8 },
  "layers": [
    { "layer_type": "convolutional", "kernels": 4, "kernel_size": 3, "padding": 1 },
    { "layer_type": "batch_normalization", "mode": "spatial" },
    { "layer_type": "activation", "activation": { "type": "relu" } },
    { "layer_type": "pooling", "size": 2 },
    { "layer_type": "fully_connected", "outputs": 16 },
    { "layer_type": "batch_normalization", "mode": "per_activation" },
    { "layer_type": "activation", "activation": { "type": "leaky_relu", "alpha": 0.01 } },
    { "layer_type": "fully_connected", "outputs": 10 },
    { "layer_type": "softmax" }
  ]
}"#;

mod valid_architecture_tests {
    use super::*;

    #[test]
    fn test_load_cnn() {
        let file = write_temp_config(CNN_WITH_BATCH_NORMALIZATION);
        let config = load_architecture(file.path()).unwrap();
        assert_eq!(config.input, Shape::new(1, 8, 8));
        assert_eq!(config.layers.len(), 9);
        assert_eq!(
            config.layers[0],
            LayerConfig::Convolutional {
                kernels: 4,
                kernel_size: 3,
                stride: 1,
                padding: 1
            }
        );
        assert_eq!(config.layers[8], LayerConfig::Softmax);
    }

    #[test]
    fn test_build_cnn_shapes() {
        let file = write_temp_config(CNN_WITH_BATCH_NORMALIZATION);
        let config = load_architecture(file.path()).unwrap();
        let network = build_network(&config, &mut WeightsProvider::new(1)).unwrap();

        let shapes: Vec<Shape> = network.layers().iter().map(|l| l.output_shape()).collect();
        assert_eq!(shapes[0], Shape::new(4, 8, 8));
        assert_eq!(shapes[3], Shape::new(4, 4, 4));
        assert_eq!(shapes[4], Shape::flat(16));
        assert_eq!(network.output_shape(), Shape::flat(10));

        let y = network.forward(&Tensor::filled(2, Shape::new(1, 8, 8), 0.5)).unwrap();
        assert_eq!(y.dims(), [2, 10, 1, 1]);
        for n in 0..2 {
            let sum: f32 = y.sample(n).iter().sum();
            assert!((sum - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_batch_normalization_modes_are_applied() {
        let file = write_temp_config(CNN_WITH_BATCH_NORMALIZATION);
        let config = load_architecture(file.path()).unwrap();
        let network = build_network(&config, &mut WeightsProvider::new(1)).unwrap();

        let modes: Vec<NormalizationMode> = network
            .layers()
            .iter()
            .filter(|l| l.kind() == LayerKind::BatchNormalization)
            .filter_map(|l| l.as_any().downcast_ref::<BatchNormalizationLayer>())
            .map(|bn| bn.mode())
            .collect();
        assert_eq!(
            modes,
            vec![NormalizationMode::Spatial, NormalizationMode::PerActivation]
        );
    }

    #[test]
    fn test_same_seed_builds_equal_networks() {
        let file = write_temp_config(CNN_WITH_BATCH_NORMALIZATION);
        let config = load_architecture(file.path()).unwrap();
        let a = build_network(&config, &mut WeightsProvider::new(9)).unwrap();
        let b = build_network(&config, &mut WeightsProvider::new(9)).unwrap();
        let c = build_network(&config, &mut WeightsProvider::new(10)).unwrap();
        assert!(a.equals(&b));
        assert_eq!(a.hash(), b.hash());
        assert!(!a.equals(&c));
    }

    #[test]
    fn test_defaults_for_optional_fields() {
        let file = write_temp_config(
            r#"{
  "input": { "channels": 2, "height": 5, "width": 5 },
  "layers": [
    { "layer_type": "batch_normalization" },
    { "layer_type": "pooling" }
  ]
}"#,
        );
        let config = load_architecture(file.path()).unwrap();
        let network = build_network(&config, &mut WeightsProvider::new(0)).unwrap();
        assert_eq!(network.output_shape(), Shape::new(2, 3, 3));
    }
}

mod invalid_architecture_tests {
    use super::*;

    #[test]
    fn test_missing_file() {
        let result = load_architecture("/nonexistent/architecture.json");
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[test]
    fn test_malformed_json() {
        let file = write_temp_config(r#"{ "input": { "channels": 1 "#);
        assert!(matches!(load_architecture(file.path()), Err(Error::Json(_))));
    }

    #[test]
    fn test_unknown_layer_type() {
        let file = write_temp_config(
            r#"{
  "input": { "channels": 1, "height": 1, "width": 4 },
  "layers": [ { "layer_type": "dropout", "rate": 0.5 } ]
}"#,
        );
        assert!(matches!(load_architecture(file.path()), Err(Error::Json(_))));
    }

    #[test]
    fn test_zero_input_dimension() {
        let file = write_temp_config(
            r#"{
  "input": { "channels": 0, "height": 1, "width": 4 },
  "layers": [ { "layer_type": "softmax" } ]
}"#,
        );
        assert!(matches!(load_architecture(file.path()), Err(Error::Json(_))));
    }

    #[test]
    fn test_empty_layers() {
        let file = write_temp_config(
            r#"{ "input": { "channels": 1, "height": 1, "width": 1 }, "layers": [] }"#,
        );
        assert!(matches!(load_architecture(file.path()), Err(Error::Config(_))));
    }

    #[test]
    fn test_unknown_normalization_mode() {
        let file = write_temp_config(
            r#"{
  "input": { "channels": 3, "height": 1, "width": 1 },
  "layers": [ { "layer_type": "batch_normalization", "mode": "group" } ]
}"#,
        );
        assert!(matches!(load_architecture(file.path()), Err(Error::InvalidMode(_))));
    }

    #[test]
    fn test_kernel_larger_than_input() {
        let file = write_temp_config(
            r#"{
  "input": { "channels": 1, "height": 3, "width": 3 },
  "layers": [ { "layer_type": "convolutional", "kernels": 2, "kernel_size": 5 } ]
}"#,
        );
        let config = load_architecture(file.path()).unwrap();
        let result = build_network(&config, &mut WeightsProvider::new(0));
        assert!(matches!(result, Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn test_negative_leaky_alpha() {
        let file = write_temp_config(
            r#"{
  "input": { "channels": 4, "height": 1, "width": 1 },
  "layers": [
    { "layer_type": "activation", "activation": { "type": "leaky_relu", "alpha": -0.5 } }
  ]
}"#,
        );
        assert!(matches!(load_architecture(file.path()), Err(Error::Config(_))));
    }
}
