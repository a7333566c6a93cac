//! Common utilities and types for Fastpath
//!
//! This crate provides shared functionality used across the compiled execution
//! pipeline, including the error taxonomy, tensor shape and dtype descriptions,
//! and small formatting helpers.

pub mod error;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use error::{Error, IncompatibilityReason, Result};
pub use types::*;
