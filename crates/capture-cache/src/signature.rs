//! Shape signatures of call arguments

use std::fmt;

use common::error::{Error, Result};
use common::types::{DType, Shape};
use device_runtime::{ArgKey, CallArgs};
use serde::{Deserialize, Serialize};

/// Shape and dtype of one tensor argument
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignatureEntry {
    pub key: ArgKey,
    pub shape: Shape,
    pub dtype: DType,
}

/// Cache key derived from the tensor arguments of a call
///
/// Entries follow the canonical argument order: positional arguments by
/// index, then named arguments by name. Non-tensor arguments are not part of
/// the signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShapeSignature(Vec<SignatureEntry>);

impl ShapeSignature {
    /// Signature of `args`
    ///
    /// Tensors nested inside map arguments are rejected; replaying them would
    /// require holders the signature cannot describe.
    pub fn from_args(args: &CallArgs) -> Result<Self> {
        let mut entries = Vec::new();
        for (key, value) in args.iter() {
            if let Some(tensor) = value.as_tensor() {
                entries.push(SignatureEntry {
                    key,
                    shape: tensor.shape().clone(),
                    dtype: tensor.dtype(),
                });
            } else if value.has_nested_tensor() {
                return Err(Error::InvalidArgument(format!(
                    "argument {} nests tensors inside a map and cannot be captured",
                    key
                )));
            }
        }
        Ok(Self(entries))
    }

    pub fn entries(&self) -> &[SignatureEntry] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ShapeSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "()");
        }
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|e| format!("{}:{}{}", e.key, e.dtype, e.shape))
            .collect();
        write!(f, "{}", parts.join(", "))
    }
}
