//! Function specs: one per-item computation and the array it writes to.

use super::{DType, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Fixed keyword arguments passed to an item function on every call.
pub type Kwargs = BTreeMap<String, serde_json::Value>;

/// Error returned by an item function. Carried unchanged to the caller.
pub type FunctionError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Boxed item function.
pub type ItemFn<T> = Box<dyn Fn(&T, &Kwargs) -> Result<Value, FunctionError>>;

/// A declared (function, output-name, element-type, kwargs) unit.
pub struct FunctionSpec<T> {
    /// Name of the output array
    pub name: String,
    /// Element type of the output array
    pub dtype: DType,
    /// Trailing dimensions of one output element (empty for scalars)
    pub item_shape: Vec<usize>,
    /// Fixed keyword arguments
    pub kwargs: Kwargs,
    func: ItemFn<T>,
}

impl<T> FunctionSpec<T> {
    /// Create a spec writing scalar elements of `dtype` into array `name`.
    pub fn new<F>(name: impl Into<String>, dtype: DType, func: F) -> Self
    where
        F: Fn(&T, &Kwargs) -> Result<Value, FunctionError> + 'static,
    {
        Self {
            name: name.into(),
            dtype,
            item_shape: Vec::new(),
            kwargs: Kwargs::new(),
            func: Box::new(func),
        }
    }

    /// Set the item shape of each output element.
    pub fn with_shape(mut self, shape: impl Into<Vec<usize>>) -> Self {
        self.item_shape = shape.into();
        self
    }

    /// Replace the keyword arguments.
    pub fn with_kwargs(mut self, kwargs: Kwargs) -> Self {
        self.kwargs = kwargs;
        self
    }

    /// Add a single keyword argument.
    pub fn with_kwarg(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    /// Invoke the function on one item with the spec's kwargs.
    pub fn call(&self, item: &T) -> Result<Value, FunctionError> {
        (self.func)(item, &self.kwargs)
    }
}

impl<T> fmt::Debug for FunctionSpec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionSpec")
            .field("name", &self.name)
            .field("dtype", &self.dtype)
            .field("item_shape", &self.item_shape)
            .field("kwargs", &self.kwargs)
            .finish_non_exhaustive()
    }
}
