//! In-memory array store.

use super::{
    ArrayInfo, ArrayLayout, ArrayStore, check_index, check_resize, check_watermark, data_len,
    validate_name,
};
use crate::models::{AstackError, Result, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
struct MemoryArray {
    info: ArrayInfo,
    data: Vec<Value>,
}

/// Array store backed by a map. Nothing survives the process.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    arrays: BTreeMap<String, MemoryArray>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All elements of an array, in order.
    pub fn values(&self, name: &str) -> Result<Vec<Value>> {
        Ok(self.get(name)?.data.clone())
    }

    fn get(&self, name: &str) -> Result<&MemoryArray> {
        self.arrays
            .get(name)
            .ok_or_else(|| AstackError::ArrayNotFound(name.to_string()))
    }

    fn get_mut(&mut self, name: &str) -> Result<&mut MemoryArray> {
        self.arrays
            .get_mut(name)
            .ok_or_else(|| AstackError::ArrayNotFound(name.to_string()))
    }
}

impl ArrayStore for MemoryStore {
    fn contains(&self, name: &str) -> Result<bool> {
        Ok(self.arrays.contains_key(name))
    }

    fn create(&mut self, name: &str, layout: &ArrayLayout) -> Result<()> {
        validate_name(name)?;
        if self.arrays.contains_key(name) {
            return Err(AstackError::ArrayExists(name.to_string()));
        }
        data_len(name, layout.dtype, &layout.item_shape, layout.len)?;
        let zero = layout.dtype.zero(&layout.item_shape);
        let array = MemoryArray {
            info: ArrayInfo {
                name: name.to_string(),
                dtype: layout.dtype,
                item_shape: layout.item_shape.clone(),
                len: layout.len,
                max_len: layout.max_len,
                chunk_len: layout.chunk_len,
                processed: 0,
            },
            data: vec![zero; layout.len as usize],
        };
        self.arrays.insert(name.to_string(), array);
        Ok(())
    }

    fn info(&self, name: &str) -> Result<ArrayInfo> {
        Ok(self.get(name)?.info.clone())
    }

    fn resize(&mut self, name: &str, len: u64) -> Result<()> {
        let array = self.get_mut(name)?;
        check_resize(&array.info, len)?;
        data_len(name, array.info.dtype, &array.info.item_shape, len)?;
        let zero = array.info.dtype.zero(&array.info.item_shape);
        array.data.resize(len as usize, zero);
        array.info.len = len;
        Ok(())
    }

    fn read(&self, name: &str, index: u64) -> Result<Value> {
        let array = self.get(name)?;
        check_index(&array.info, index)?;
        Ok(array.data[index as usize].clone())
    }

    fn write(&mut self, name: &str, index: u64, value: &Value) -> Result<()> {
        let array = self.get_mut(name)?;
        check_index(&array.info, index)?;
        let value = array
            .info
            .dtype
            .coerce_element(&array.info.item_shape, value)?;
        array.data[index as usize] = value;
        Ok(())
    }

    fn set_processed(&mut self, name: &str, index: u64) -> Result<()> {
        let array = self.get_mut(name)?;
        check_watermark(&array.info, index)?;
        array.info.processed = index;
        Ok(())
    }

    fn delete(&mut self, name: &str) -> Result<()> {
        self.arrays
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| AstackError::ArrayNotFound(name.to_string()))
    }

    fn names(&self) -> Result<Vec<String>> {
        Ok(self.arrays.keys().cloned().collect())
    }
}
