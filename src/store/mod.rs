//! Array store: named, resizable, typed arrays with a `processed` watermark.
//!
//! Provides:
//! - `ArrayStore`: the storage contract used by the applicator
//! - `ArrayHandle`: one array, with write-then-watermark ordering
//! - `MemoryStore`: in-memory backend
//! - `DirStore`: on-disk backend (one directory per array)

mod dir;
mod handle;
mod memory;

pub use dir::*;
pub use handle::*;
pub use memory::*;

use crate::models::{AstackError, DType, Result, Value};
use serde::{Deserialize, Serialize};

/// Shape and type of a new array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayLayout {
    /// Element type
    pub dtype: DType,
    /// Trailing dimensions of one element
    #[serde(default)]
    pub item_shape: Vec<usize>,
    /// Initial length along the growth axis
    pub len: u64,
    /// Growth bound (None = unbounded)
    #[serde(default)]
    pub max_len: Option<u64>,
    /// Chunk length hint along the growth axis
    pub chunk_len: u64,
}

impl ArrayLayout {
    /// Unbounded layout with the default chunk hint.
    pub fn new(dtype: DType, item_shape: Vec<usize>, len: u64) -> Self {
        Self {
            dtype,
            item_shape,
            len,
            max_len: None,
            chunk_len: DEFAULT_CHUNK_LEN,
        }
    }
}

/// Chunk length used when the caller does not pick one.
pub const DEFAULT_CHUNK_LEN: u64 = 1024;

/// Snapshot of an array's shape and watermark.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayInfo {
    pub name: String,
    pub dtype: DType,
    pub item_shape: Vec<usize>,
    pub len: u64,
    pub max_len: Option<u64>,
    pub chunk_len: u64,
    /// Index of the last item written (0 when fresh)
    pub processed: u64,
}

/// Keyed collection of resizable typed arrays.
///
/// Implementations must make `write` durable before a later
/// `set_processed` for the same array becomes visible.
pub trait ArrayStore {
    /// Whether an array with this name exists.
    fn contains(&self, name: &str) -> Result<bool>;

    /// Create a zero-filled array with `processed = 0`.
    fn create(&mut self, name: &str, layout: &ArrayLayout) -> Result<()>;

    /// Current shape and watermark of an array.
    fn info(&self, name: &str) -> Result<ArrayInfo>;

    /// Resize along the growth axis.
    fn resize(&mut self, name: &str, len: u64) -> Result<()>;

    /// Read one element.
    fn read(&self, name: &str, index: u64) -> Result<Value>;

    /// Coerce `value` into the array's dtype and write it at `index`.
    fn write(&mut self, name: &str, index: u64, value: &Value) -> Result<()>;

    /// Stored `processed` attribute.
    fn processed(&self, name: &str) -> Result<u64> {
        Ok(self.info(name)?.processed)
    }

    /// Overwrite the `processed` attribute.
    fn set_processed(&mut self, name: &str, index: u64) -> Result<()>;

    /// Delete an array and its metadata.
    fn delete(&mut self, name: &str) -> Result<()>;

    /// Names of all arrays, sorted.
    fn names(&self) -> Result<Vec<String>>;

    /// Flush buffered state.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Open a handle on an existing array.
    fn array(&mut self, name: &str) -> Result<ArrayHandle<'_, Self>>
    where
        Self: Sized,
    {
        ArrayHandle::open(self, name)
    }
}

/// Array names double as directory names, so keep them portable.
pub fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(AstackError::InvalidArrayName(name.to_string()))
    }
}

/// Byte length of `len` elements, rejecting layouts too large to address.
pub(crate) fn data_len(name: &str, dtype: DType, item_shape: &[usize], len: u64) -> Result<u64> {
    dtype
        .item_size(item_shape)
        .and_then(|size| u64::try_from(size).ok())
        .and_then(|size| size.checked_mul(len))
        .ok_or_else(|| {
            AstackError::InvalidInput(format!(
                "array '{name}' of {len} x {dtype}{item_shape:?} is too large"
            ))
        })
}

/// Bounds shared by every backend's `resize`.
pub(crate) fn check_resize(info: &ArrayInfo, len: u64) -> Result<()> {
    if let Some(max) = info.max_len {
        if len > max {
            return Err(AstackError::ResizeExceedsBound {
                name: info.name.clone(),
                requested: len,
                max,
            });
        }
    }
    if len < info.processed {
        return Err(AstackError::ShrinkBelowWatermark {
            name: info.name.clone(),
            requested: len,
            processed: info.processed,
        });
    }
    Ok(())
}

/// `processed` may never point past the end of the array.
pub(crate) fn check_watermark(info: &ArrayInfo, index: u64) -> Result<()> {
    if index > info.len {
        return Err(AstackError::IndexOutOfBounds {
            name: info.name.clone(),
            index,
            len: info.len,
        });
    }
    Ok(())
}

pub(crate) fn check_index(info: &ArrayInfo, index: u64) -> Result<()> {
    if index >= info.len {
        return Err(AstackError::IndexOutOfBounds {
            name: info.name.clone(),
            index,
            len: info.len,
        });
    }
    Ok(())
}
