//! Core data models for astack.
//!
//! - `DType`/`Value`: what an array holds and how values are coerced into it
//! - `FunctionSpec`: one per-item computation and its output array
//! - `Config`: the CLI configuration file
//! - `AstackError`: the error taxonomy

mod config;
mod dtype;
mod error;
mod function;

pub use config::*;
pub use dtype::*;
pub use error::*;
pub use function::*;
