//! Error types for the audit pipeline.
//!
//! Provides a unified error handling system using thiserror.

mod types;

pub use types::*;
