//! Nested trees of tensors and scalar config values

use std::collections::BTreeMap;

use bytes::Bytes;
use checkpoint_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// Separator used in key paths such as `params/dense/kernel`
pub const KEY_SEPARATOR: char = '/';

/// Element type of a tensor
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F32,
    F64,
    I32,
    I64,
    U8,
}

impl DType {
    /// Width of one element in bytes
    pub fn size_bytes(&self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::F64 | DType::I64 => 8,
            DType::U8 => 1,
        }
    }
}

/// Dense tensor stored as little-endian bytes
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    dtype: DType,
    shape: Vec<usize>,
    data: Bytes,
}

macro_rules! typed_constructor {
    ($name:ident, $ty:ty, $dtype:expr) => {
        pub fn $name(shape: Vec<usize>, values: &[$ty]) -> Result<Self> {
            let mut data = Vec::with_capacity(values.len() * std::mem::size_of::<$ty>());
            for value in values {
                data.extend_from_slice(&value.to_le_bytes());
            }
            Self::from_bytes($dtype, shape, Bytes::from(data))
        }
    };
}

impl Tensor {
    /// Wrap raw little-endian bytes, checking they match `shape`
    pub fn from_bytes(dtype: DType, shape: Vec<usize>, data: Bytes) -> Result<Self> {
        let expected = shape
            .iter()
            .try_fold(dtype.size_bytes(), |acc, &dim| acc.checked_mul(dim))
            .ok_or_else(|| Error::InvalidArgument {
                message: format!("tensor of shape {:?} overflows the address space", shape),
            })?;
        if data.len() != expected {
            return Err(Error::InvalidArgument {
                message: format!(
                    "tensor of shape {:?} and dtype {:?} needs {} bytes, got {}",
                    shape,
                    dtype,
                    expected,
                    data.len()
                ),
            });
        }
        Ok(Self { dtype, shape, data })
    }

    typed_constructor!(from_f32, f32, DType::F32);
    typed_constructor!(from_f64, f64, DType::F64);
    typed_constructor!(from_i32, i32, DType::I32);
    typed_constructor!(from_i64, i64, DType::I64);
    typed_constructor!(from_u8, u8, DType::U8);

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }

    /// Elements widened to `f64`
    pub fn to_f64_vec(&self) -> Vec<f64> {
        let width = self.dtype.size_bytes();
        self.data
            .chunks_exact(width)
            .map(|c| match self.dtype {
                DType::F32 => f32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64,
                DType::F64 => f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]),
                DType::I32 => i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64,
                DType::I64 => {
                    i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f64
                }
                DType::U8 => c[0] as f64,
            })
            .collect()
    }

    /// Convert to another element type; float to int truncates toward zero
    pub fn cast(&self, dtype: DType) -> Tensor {
        if dtype == self.dtype {
            return self.clone();
        }
        let values = self.to_f64_vec();
        let mut data = Vec::with_capacity(values.len() * dtype.size_bytes());
        for v in values {
            match dtype {
                DType::F32 => data.extend_from_slice(&(v as f32).to_le_bytes()),
                DType::F64 => data.extend_from_slice(&v.to_le_bytes()),
                DType::I32 => data.extend_from_slice(&(v as i32).to_le_bytes()),
                DType::I64 => data.extend_from_slice(&(v as i64).to_le_bytes()),
                DType::U8 => data.push(v as u8),
            }
        }
        Tensor {
            dtype,
            shape: self.shape.clone(),
            data: Bytes::from(data),
        }
    }
}

/// A nested training-state structure
#[derive(Debug, Clone, PartialEq)]
pub enum TensorTree {
    Leaf(Tensor),
    Scalar(serde_json::Value),
    Node(BTreeMap<String, TensorTree>),
}

impl TensorTree {
    /// An empty interior node
    pub fn node() -> Self {
        TensorTree::Node(BTreeMap::new())
    }

    /// Builder-style insert of a direct child; no-op on non-nodes
    pub fn with(mut self, key: impl Into<String>, child: TensorTree) -> Self {
        if let TensorTree::Node(children) = &mut self {
            children.insert(key.into(), child);
        }
        self
    }

    /// Look up a subtree by `/`-separated key path
    pub fn get(&self, path: &str) -> Option<&TensorTree> {
        let mut current = self;
        for key in path.split(KEY_SEPARATOR).filter(|k| !k.is_empty()) {
            match current {
                TensorTree::Node(children) => current = children.get(key)?,
                _ => return None,
            }
        }
        Some(current)
    }

    /// Reject keys that cannot be addressed by a key path
    pub fn validate_keys(&self) -> Result<()> {
        self.validate_from("")
    }

    fn validate_from(&self, prefix: &str) -> Result<()> {
        if let TensorTree::Node(children) = self {
            for (key, child) in children {
                if key.is_empty() || key.contains(KEY_SEPARATOR) {
                    return Err(Error::InvalidArgument {
                        message: format!(
                            "tree key {:?} under {:?} must be non-empty and must not contain '{}'",
                            key, prefix, KEY_SEPARATOR
                        ),
                    });
                }
                child.validate_from(&join_key(prefix, key))?;
            }
        }
        Ok(())
    }
}

pub(crate) fn join_key(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}{}{}", prefix, KEY_SEPARATOR, key)
    }
}

impl From<Tensor> for TensorTree {
    fn from(tensor: Tensor) -> Self {
        TensorTree::Leaf(tensor)
    }
}
