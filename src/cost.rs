//! Cost functions
//!
//! Both costs are averaged over the entities of a batch, and so are their gradients, which
//! keeps the learning rate independent of the batch size.

use crate::error::Result;
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};

/// Lower bound applied to predicted probabilities before taking their logarithm.
const PROBABILITY_FLOOR: f32 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostFunction {
    /// `-Σ t·ln(y)`, meant to follow a softmax layer.
    #[default]
    CrossEntropy,
    /// `½·Σ (y - t)²`
    Quadratic,
}

impl CostFunction {
    /// Mean cost of predictions `y` against `target` over the batch.
    pub fn loss(self, y: &Tensor, target: &Tensor) -> Result<f32> {
        target.expect_layout("cost target", y)?;
        let total: f64 = match self {
            CostFunction::CrossEntropy => y
                .as_slice()
                .iter()
                .zip(target.as_slice())
                .filter(|&(_, &t)| t != 0.0)
                .map(|(&p, &t)| -(t as f64) * (p.max(PROBABILITY_FLOOR) as f64).ln())
                .sum(),
            CostFunction::Quadratic => y
                .as_slice()
                .iter()
                .zip(target.as_slice())
                .map(|(&p, &t)| 0.5 * ((p - t) as f64).powi(2))
                .sum(),
        };
        Ok((total / y.entities() as f64) as f32)
    }

    /// Gradient of [`loss`](Self::loss) with respect to `y`.
    pub fn gradient(self, y: &Tensor, target: &Tensor) -> Result<Tensor> {
        target.expect_layout("cost target", y)?;
        let scale = 1.0 / y.entities() as f32;
        let mut dy = Tensor::like(y);
        let values = dy
            .as_mut_slice()
            .iter_mut()
            .zip(y.as_slice().iter().zip(target.as_slice()));
        match self {
            CostFunction::CrossEntropy => {
                for (g, (&p, &t)) in values {
                    *g = -t / p.max(PROBABILITY_FLOOR) * scale;
                }
            }
            CostFunction::Quadratic => {
                for (g, (&p, &t)) in values {
                    *g = (p - t) * scale;
                }
            }
        }
        Ok(dy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::tensor::Shape;

    #[test]
    fn test_cross_entropy_of_confident_prediction() {
        let y = Tensor::from_vec(1, Shape::flat(3), vec![0.7, 0.2, 0.1]).unwrap();
        let t = Tensor::from_vec(1, Shape::flat(3), vec![1.0, 0.0, 0.0]).unwrap();
        let loss = CostFunction::CrossEntropy.loss(&y, &t).unwrap();
        assert!((loss - (-(0.7f32).ln())).abs() < 1e-6);
    }

    #[test]
    fn test_quadratic_is_batch_mean() {
        let y = Tensor::from_vec(2, Shape::flat(1), vec![1.0, 3.0]).unwrap();
        let t = Tensor::from_vec(2, Shape::flat(1), vec![0.0, 0.0]).unwrap();
        let loss = CostFunction::Quadratic.loss(&y, &t).unwrap();
        assert!((loss - 2.5).abs() < 1e-6);
        let dy = CostFunction::Quadratic.gradient(&y, &t).unwrap();
        assert_eq!(dy.as_slice(), &[0.5, 1.5]);
    }

    #[test]
    fn test_cost_rejects_mismatched_target() {
        let y = Tensor::zeros(1, Shape::flat(3));
        let t = Tensor::zeros(1, Shape::flat(2));
        assert!(matches!(
            CostFunction::Quadratic.loss(&y, &t),
            Err(Error::ShapeMismatch { .. })
        ));
    }
}
