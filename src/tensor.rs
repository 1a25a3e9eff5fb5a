//! Shapes and tensors
//!
//! A [`Shape`] describes a single sample as (channels, height, width). A [`Tensor`] is a
//! batch of `entities` samples of that shape, stored contiguously in row-major order:
//! entity, then channel, then row, then column.
//!
//! Tensors own their buffer exclusively. `Clone` is a deep copy, so two tensors never share
//! mutable storage.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-sample dimensions of a tensor.
///
/// Flattened vectors of length `n` are represented as `(n, 1, 1)`.
///
/// # Examples
///
/// ```
/// use neural_toolkit::tensor::Shape;
/// let shape = Shape::new(3, 28, 28);
/// assert_eq!(shape.size(), 3 * 28 * 28);
/// assert_eq!(shape.spatial_size(), 28 * 28);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawShape")]
pub struct Shape {
    channels: usize,
    height: usize,
    width: usize,
}

#[derive(Deserialize)]
struct RawShape {
    channels: usize,
    height: usize,
    width: usize,
}

impl TryFrom<RawShape> for Shape {
    type Error = Error;

    fn try_from(raw: RawShape) -> Result<Self> {
        Shape::try_new(raw.channels, raw.height, raw.width)
    }
}

impl Shape {
    /// Creates a new shape.
    ///
    /// # Panics
    ///
    /// Panics if any dimension is zero.
    pub fn new(channels: usize, height: usize, width: usize) -> Self {
        assert!(
            channels > 0 && height > 0 && width > 0,
            "shape dimensions must be positive"
        );
        Self {
            channels,
            height,
            width,
        }
    }

    /// Fallible variant of [`Shape::new`] for dimensions coming from untrusted input.
    pub fn try_new(channels: usize, height: usize, width: usize) -> Result<Self> {
        if channels == 0 || height == 0 || width == 0 {
            return Err(Error::Config(format!(
                "shape dimensions must be positive, got ({}, {}, {})",
                channels, height, width
            )));
        }
        Ok(Self {
            channels,
            height,
            width,
        })
    }

    /// A flat vector shape `(size, 1, 1)`.
    pub fn flat(size: usize) -> Self {
        Self::new(size, 1, 1)
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Number of positions per channel (height × width).
    pub fn spatial_size(&self) -> usize {
        self.height * self.width
    }

    /// Total element count of one sample.
    pub fn size(&self) -> usize {
        self.channels * self.height * self.width
    }

    pub fn dims(&self) -> [usize; 3] {
        [self.channels, self.height, self.width]
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.channels, self.height, self.width)
    }
}

/// A batch of `entities` samples sharing one [`Shape`].
///
/// # Examples
///
/// ```
/// use neural_toolkit::tensor::{Shape, Tensor};
/// let mut t = Tensor::zeros(2, Shape::flat(3));
/// t.as_mut_slice()[4] = 1.5;
/// assert_eq!(t.sample(1), &[0.0, 1.5, 0.0]);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawTensor")]
pub struct Tensor {
    entities: usize,
    shape: Shape,
    data: Vec<f32>,
}

#[derive(Deserialize)]
struct RawTensor {
    entities: usize,
    shape: Shape,
    data: Vec<f32>,
}

impl TryFrom<RawTensor> for Tensor {
    type Error = Error;

    fn try_from(raw: RawTensor) -> Result<Self> {
        Tensor::from_vec(raw.entities, raw.shape, raw.data)
    }
}

impl Tensor {
    /// Allocates a zero-filled tensor.
    ///
    /// # Panics
    ///
    /// Panics if `entities` is zero.
    pub fn zeros(entities: usize, shape: Shape) -> Self {
        Self::filled(entities, shape, 0.0)
    }

    /// Allocates a tensor with every element set to `value`.
    pub fn filled(entities: usize, shape: Shape, value: f32) -> Self {
        assert!(entities > 0, "tensor must hold at least one entity");
        Self {
            entities,
            shape,
            data: vec![value; entities * shape.size()],
        }
    }

    /// Wraps an existing buffer, checking its length against `entities × shape`.
    pub fn from_vec(entities: usize, shape: Shape, data: Vec<f32>) -> Result<Self> {
        let expected = entities * shape.size();
        if entities == 0 || data.len() != expected {
            return Err(Error::shape_mismatch(
                "tensor buffer",
                vec![expected],
                vec![data.len()],
            ));
        }
        Ok(Self {
            entities,
            shape,
            data,
        })
    }

    /// A zero-filled tensor with the same entity count and shape as `other`.
    pub fn like(other: &Tensor) -> Self {
        Self::zeros(other.entities, other.shape)
    }

    pub fn entities(&self) -> usize {
        self.entities
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    /// `[entities, channels, height, width]`
    pub fn dims(&self) -> [usize; 4] {
        let [c, h, w] = self.shape.dims();
        [self.entities, c, h, w]
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Values of the `index`-th entity.
    pub fn sample(&self, index: usize) -> &[f32] {
        let size = self.shape.size();
        &self.data[index * size..(index + 1) * size]
    }

    pub fn sample_mut(&mut self, index: usize) -> &mut [f32] {
        let size = self.shape.size();
        &mut self.data[index * size..(index + 1) * size]
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    /// True when both tensors have the same entity count and shape.
    pub fn same_layout(&self, other: &Tensor) -> bool {
        self.entities == other.entities && self.shape == other.shape
    }

    /// Bitwise content equality (layout included). `NaN` payloads compare by bits.
    pub fn bit_eq(&self, other: &Tensor) -> bool {
        self.same_layout(other)
            && self
                .data
                .iter()
                .zip(other.data.iter())
                .all(|(a, b)| a.to_bits() == b.to_bits())
    }

    /// Raw little-endian bytes of the buffer, used for content hashing.
    pub fn le_bytes(&self) -> impl Iterator<Item = u8> + '_ {
        self.data.iter().flat_map(|v| v.to_le_bytes())
    }

    /// Fails with [`Error::ShapeMismatch`] unless the per-sample shape equals `expected`.
    pub fn expect_shape(&self, context: &'static str, expected: Shape) -> Result<()> {
        if self.shape != expected {
            return Err(Error::shape_mismatch(
                context,
                expected.dims().to_vec(),
                self.shape.dims().to_vec(),
            ));
        }
        Ok(())
    }

    /// Fails with [`Error::ShapeMismatch`] unless both tensors have identical layout.
    pub fn expect_layout(&self, context: &'static str, other: &Tensor) -> Result<()> {
        if !self.same_layout(other) {
            return Err(Error::shape_mismatch(
                context,
                other.dims().to_vec(),
                self.dims().to_vec(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_sizes() {
        let shape = Shape::new(2, 3, 4);
        assert_eq!(shape.size(), 24);
        assert_eq!(shape.spatial_size(), 12);
        assert_eq!(shape.dims(), [2, 3, 4]);
        assert_eq!(Shape::flat(10).dims(), [10, 1, 1]);
    }

    #[test]
    #[should_panic(expected = "shape dimensions must be positive")]
    fn test_shape_zero_dimension() {
        let _shape = Shape::new(0, 3, 3);
    }

    #[test]
    fn test_shape_try_new_rejects_zero() {
        assert!(Shape::try_new(1, 0, 1).is_err());
        assert!(Shape::try_new(1, 1, 1).is_ok());
    }

    #[test]
    fn test_tensor_from_vec_length_check() {
        let shape = Shape::new(1, 2, 2);
        assert!(Tensor::from_vec(1, shape, vec![0.0; 4]).is_ok());
        let err = Tensor::from_vec(2, shape, vec![0.0; 4]).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }

    #[test]
    fn test_tensor_clone_is_deep() {
        let original = Tensor::filled(1, Shape::flat(3), 1.0);
        let mut copy = original.clone();
        copy.as_mut_slice()[0] = 5.0;
        assert_eq!(original.as_slice(), &[1.0, 1.0, 1.0]);
        assert!(!original.bit_eq(&copy));
    }

    #[test]
    fn test_tensor_samples() {
        let t = Tensor::from_vec(2, Shape::flat(2), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(t.sample(0), &[1.0, 2.0]);
        assert_eq!(t.sample(1), &[3.0, 4.0]);
        assert_eq!(t.dims(), [2, 2, 1, 1]);
    }

    #[test]
    fn test_expect_shape() {
        let t = Tensor::zeros(1, Shape::new(2, 2, 2));
        assert!(t.expect_shape("test", Shape::new(2, 2, 2)).is_ok());
        assert!(t.expect_shape("test", Shape::new(1, 2, 2)).is_err());
    }

    #[test]
    fn test_tensor_serde_rejects_bad_length() {
        let json = r#"{"entities":1,"shape":{"channels":2,"height":1,"width":1},"data":[1.0]}"#;
        assert!(serde_json::from_str::<Tensor>(json).is_err());

        let json = r#"{"entities":1,"shape":{"channels":2,"height":1,"width":1},"data":[1.0,2.0]}"#;
        let t: Tensor = serde_json::from_str(json).unwrap();
        assert_eq!(t.as_slice(), &[1.0, 2.0]);
    }
}
