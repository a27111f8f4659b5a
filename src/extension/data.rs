use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Dense n-dimensional array of f64 stored in row-major order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NdArray {
    shape: Vec<usize>,
    data: Vec<f64>,
}

impl NdArray {
    pub fn new(shape: Vec<usize>, data: Vec<f64>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(EngineError::InvalidPayload(format!(
                "shape {shape:?} needs {expected} values, got {}",
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            data: vec![0.0; len],
        }
    }

    /// One-dimensional array over `data`.
    pub fn vector(data: Vec<f64>) -> Self {
        Self {
            shape: vec![data.len()],
            data,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<f64> {
        self.data
    }

    /// Flat offset of a multi-index, `None` when it is out of bounds.
    pub fn offset(&self, index: &[usize]) -> Option<usize> {
        if index.len() != self.shape.len() {
            return None;
        }
        let mut offset = 0;
        for (&i, &dim) in index.iter().zip(&self.shape) {
            if i >= dim {
                return None;
            }
            offset = offset * dim + i;
        }
        Some(offset)
    }

    pub fn get(&self, index: &[usize]) -> Option<f64> {
        self.offset(index).map(|o| self.data[o])
    }

    /// Contiguous block addressed by a prefix of the shape, e.g. one unit's
    /// `[samples, channels]` plane of a `[units, samples, channels]` array.
    pub fn slab(&self, prefix: &[usize]) -> Option<&[f64]> {
        if prefix.len() > self.shape.len() {
            return None;
        }
        let inner: usize = self.shape[prefix.len()..].iter().product();
        let mut offset = 0;
        for (&i, &dim) in prefix.iter().zip(&self.shape) {
            if i >= dim {
                return None;
            }
            offset = offset * dim + i;
        }
        let start = offset * inner;
        Some(&self.data[start..start + inner])
    }
}

/// Output of one extension computation: named arrays plus JSON attributes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtensionData {
    pub arrays: BTreeMap<String, NdArray>,
    pub attrs: serde_json::Map<String, serde_json::Value>,
}

impl ExtensionData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_array(mut self, key: impl Into<String>, array: NdArray) -> Self {
        self.arrays.insert(key.into(), array);
        self
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attrs.insert(key.into(), value);
        self
    }

    pub fn insert_array(&mut self, key: impl Into<String>, array: NdArray) {
        self.arrays.insert(key.into(), array);
    }

    pub fn array(&self, key: &str) -> Option<&NdArray> {
        self.arrays.get(key)
    }

    pub fn attr(&self, key: &str) -> Option<&serde_json::Value> {
        self.attrs.get(key)
    }

    /// Required array, as an error a computation can return with `?`.
    pub fn require_array(&self, key: &str) -> Result<&NdArray> {
        self.arrays
            .get(key)
            .ok_or_else(|| EngineError::InvalidPayload(format!("missing array `{key}`")))
    }

    pub fn is_empty(&self) -> bool {
        self.arrays.is_empty() && self.attrs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_must_match_data() {
        assert!(NdArray::new(vec![2, 3], vec![0.0; 6]).is_ok());
        let err = NdArray::new(vec![2, 3], vec![0.0; 5]).unwrap_err();
        assert_eq!(err.error_code(), "ST-INVALID-PAYLOAD");
    }

    #[test]
    fn test_indexing() {
        let a = NdArray::new(vec![2, 2, 3], (0..12).map(f64::from).collect()).unwrap();
        assert_eq!(a.get(&[1, 0, 2]), Some(8.0));
        assert_eq!(a.get(&[2, 0, 0]), None);
        assert_eq!(a.get(&[0, 0]), None);
        assert_eq!(a.slab(&[1]), Some(&[6.0, 7.0, 8.0, 9.0, 10.0, 11.0][..]));
        assert_eq!(a.slab(&[1, 1]), Some(&[9.0, 10.0, 11.0][..]));
    }

    #[test]
    fn test_missing_array() {
        let data = ExtensionData::new().with_array("x", NdArray::vector(vec![1.0]));
        assert!(data.require_array("x").is_ok());
        assert!(data.require_array("y").is_err());
    }
}
