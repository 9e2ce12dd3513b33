//! Handle on a single named array.

use super::{ArrayInfo, ArrayStore};
use crate::models::{AstackError, DType, Result, Value};
use tracing::debug;

/// A named array inside a store.
///
/// The handle keeps a snapshot of the array's shape and watermark and
/// refreshes it on every mutation it performs. Callers write an element
/// with `set` and only then certify it with `commit_watermark`.
pub struct ArrayHandle<'s, S: ArrayStore + ?Sized> {
    store: &'s mut S,
    info: ArrayInfo,
}

impl<'s, S: ArrayStore + ?Sized> ArrayHandle<'s, S> {
    /// Open an existing array.
    pub fn open(store: &'s mut S, name: &str) -> Result<Self> {
        let info = store.info(name)?;
        Ok(Self { store, info })
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn dtype(&self) -> DType {
        self.info.dtype
    }

    pub fn item_shape(&self) -> &[usize] {
        &self.info.item_shape
    }

    pub fn len(&self) -> u64 {
        self.info.len
    }

    pub fn is_empty(&self) -> bool {
        self.info.len == 0
    }

    /// Index of the last item written (0 when fresh).
    pub fn processed(&self) -> u64 {
        self.info.processed
    }

    pub fn info(&self) -> &ArrayInfo {
        &self.info
    }

    /// Whether `index` is already certified by the watermark.
    ///
    /// The item at the watermark itself is not considered done, so it is
    /// recomputed on resume.
    pub fn is_done(&self, index: u64) -> bool {
        self.info.processed > index
    }

    /// Read one element.
    pub fn get(&self, index: u64) -> Result<Value> {
        self.store.read(&self.info.name, index)
    }

    /// Write one element. Does not touch the watermark.
    pub fn set(&mut self, index: u64, value: &Value) -> Result<()> {
        self.store.write(&self.info.name, index, value)
    }

    /// Resize along the growth axis.
    pub fn resize(&mut self, len: u64) -> Result<()> {
        self.store.resize(&self.info.name, len)?;
        self.info = self.store.info(&self.info.name)?;
        debug!(array = %self.info.name, len, "Resized array");
        Ok(())
    }

    /// Advance the watermark to `index` after the element there was written.
    pub fn commit_watermark(&mut self, index: u64) -> Result<()> {
        if index < self.info.processed {
            return Err(AstackError::WatermarkRegression {
                name: self.info.name.clone(),
                current: self.info.processed,
                requested: index,
            });
        }
        if index >= self.info.len {
            return Err(AstackError::IndexOutOfBounds {
                name: self.info.name.clone(),
                index,
                len: self.info.len,
            });
        }
        self.store.set_processed(&self.info.name, index)?;
        self.info.processed = index;
        Ok(())
    }
}
