use std::collections::BTreeMap;
use std::path::Path;

use thiserror::Error;

use crate::ir::{fixed_shape, DataType, Tensor};
use crate::runtime::TensorData;

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid format: {0}")]
    InvalidFormat(String),
    #[error("Unsupported data type {dtype} for weight '{name}'")]
    UnsupportedDataType { name: String, dtype: String },
    #[error("Weight '{0}' is defined twice")]
    DuplicateWeight(String),
    #[error("Weight '{name}' has {actual} values, shape {shape:?} needs {expected}")]
    ShapeMismatch {
        name: String,
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },
}

/// Loads a [`WeightStore`] from some on-disk representation.
pub trait WeightLoader {
    fn load<P: AsRef<Path>>(path: P) -> Result<WeightStore, LoaderError>;
}

pub mod safetensors;

/// Named parameter tensors of one model. Immutable once built.
#[derive(Debug, Clone, Default)]
pub struct WeightStore {
    entries: BTreeMap<String, Tensor>,
}

impl WeightStore {
    pub fn builder() -> WeightStoreBuilder {
        WeightStoreBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.entries.get(name)
    }

    /// Decoded f32 values of a weight.
    pub fn values(&self, name: &str) -> Option<TensorData> {
        self.entries.get(name).and_then(TensorData::from_tensor)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct WeightStoreBuilder {
    entries: BTreeMap<String, Tensor>,
}

impl WeightStoreBuilder {
    pub fn insert_f32(self, name: &str, shape: &[usize], values: Vec<f32>) -> Result<Self, LoaderError> {
        let expected: usize = shape.iter().product();
        if expected != values.len() {
            return Err(LoaderError::ShapeMismatch {
                name: name.to_string(),
                shape: shape.to_vec(),
                expected,
                actual: values.len(),
            });
        }
        self.insert(Tensor::from_f32(name, shape, &values))
    }

    pub fn insert(mut self, tensor: Tensor) -> Result<Self, LoaderError> {
        if tensor.data_type != DataType::F32 {
            return Err(LoaderError::UnsupportedDataType {
                name: tensor.name,
                dtype: format!("{:?}", tensor.data_type),
            });
        }
        if self.entries.contains_key(&tensor.name) {
            return Err(LoaderError::DuplicateWeight(tensor.name));
        }
        self.entries.insert(tensor.name.clone(), tensor);
        Ok(self)
    }

    pub fn build(self) -> WeightStore {
        WeightStore { entries: self.entries }
    }
}

pub(crate) fn f32_tensor(name: &str, shape: &[usize], data: Vec<u8>) -> Tensor {
    Tensor {
        name: name.to_string(),
        shape: fixed_shape(shape),
        data_type: DataType::F32,
        data: Some(data),
    }
}
