// error.rs
// Description: Error taxonomy shared by tensor ops, layers and stacks.
//              Every fallible call returns EngineResult and fails before
//              writing any output or committing any gradient.
// History:
// - 2026-10-16: EngineError taxonomy with shape-mismatch context.

use thiserror::Error;

/// Failure reported synchronously by the operation that detected it.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// A required tensor, mask or cache is absent.
    #[error("missing required input: {context}")]
    NullInput { context: &'static str },

    /// Dimension count or extent disagreement between operands.
    #[error("shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// A buffer of the requested size could not be obtained.
    #[error("allocation of {elements} elements failed")]
    AllocationFailure { elements: usize },

    /// Token id outside `[0, vocab_size)`.
    #[error("token id {token_id} outside vocabulary of size {vocab_size}")]
    InvalidTokenId { token_id: i64, vocab_size: usize },

    /// Rejected configuration value (dimensions, dropout probability, eps).
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl EngineError {
    pub fn shape(context: &'static str, expected: &[usize], actual: &[usize]) -> Self {
        EngineError::ShapeMismatch {
            context,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}

impl From<ndarray::ShapeError> for EngineError {
    fn from(_: ndarray::ShapeError) -> Self {
        EngineError::ShapeMismatch {
            context: "ndarray_view",
            expected: Vec::new(),
            actual: Vec::new(),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
