//! # Graphvec Core
//!
//! Core types shared by every Graphvec crate: the unified error type, the
//! structural error taxonomy used for retry decisions, and logging setup.

pub mod error;
pub mod result;
pub mod telemetry;

pub use error::*;
pub use result::*;
pub use telemetry::*;
