//! Result type aliases for Graphvec.

use crate::GraphvecError;

/// A specialized `Result` type for Graphvec operations.
pub type GraphvecResult<T> = Result<T, GraphvecError>;
