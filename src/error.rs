//! Error types for the toolkit

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Shape mismatch in {context}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        context: &'static str,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Invalid normalization mode: {0}")]
    InvalidMode(String),

    #[error("Backend failure: {0}")]
    BackendFailure(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for a [`Error::ShapeMismatch`] between two dimension lists.
    pub fn shape_mismatch(
        context: &'static str,
        expected: impl Into<Vec<usize>>,
        got: impl Into<Vec<usize>>,
    ) -> Self {
        Error::ShapeMismatch {
            context,
            expected: expected.into(),
            got: got.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
