//! astack - resumable element-wise function application into typed arrays.
//!
//! ## Architecture
//!
//! - **Array Store**: named, resizable, typed arrays, each carrying a
//!   `processed` watermark (`MemoryStore`, `DirStore`)
//! - **Array Handle**: one array, written element first and certified by
//!   the watermark second
//! - **Applicator**: provisions one array per function spec, then runs every
//!   spec over the sequence starting at the lowest watermark
//!
//! ## Resume semantics
//!
//! - Each array resumes independently from its own watermark
//! - `append = false` recreates every array from scratch
//! - The first failing item aborts the run without advancing its watermark

pub mod models;
pub mod pipeline;
pub mod store;

// Re-exports for convenience
pub use models::{AstackError, Config, DType, FunctionError, FunctionSpec, Kwargs, Result, Value};
pub use pipeline::{ApplyOptions, ApplyStats, Applicator, FunctionRegistry, apply};
pub use store::{ArrayHandle, ArrayInfo, ArrayLayout, ArrayStore, DirStore, MemoryStore};
