//! Pipeline module - batch applicator and built-in item functions.

mod apply;
mod builtins;

pub use apply::*;
pub use builtins::*;
