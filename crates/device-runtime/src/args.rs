//! Call arguments passed to executables

use std::collections::BTreeMap;
use std::fmt;

use common::error::Result;
use serde::{Deserialize, Serialize};

use crate::tensor::Tensor;

/// Key of a call argument
///
/// The derived ordering puts positional arguments first, by index, followed
/// by named arguments sorted by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ArgKey {
    Positional(usize),
    Named(String),
}

impl fmt::Display for ArgKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgKey::Positional(index) => write!(f, "#{}", index),
            ArgKey::Named(name) => write!(f, "{}", name),
        }
    }
}

impl From<&str> for ArgKey {
    fn from(name: &str) -> Self {
        ArgKey::Named(name.to_string())
    }
}

impl From<usize> for ArgKey {
    fn from(index: usize) -> Self {
        ArgKey::Positional(index)
    }
}

/// Value of a call argument
#[derive(Debug, Clone)]
pub enum ArgValue {
    Tensor(Tensor),
    Float(f64),
    Int(i64),
    Bool(bool),
    Str(String),
    None,
    Map(BTreeMap<String, ArgValue>),
}

impl ArgValue {
    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            ArgValue::Tensor(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            ArgValue::Float(v) => Some(*v),
            ArgValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ArgValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ArgValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns true if a tensor is nested anywhere inside a map
    pub fn has_nested_tensor(&self) -> bool {
        match self {
            ArgValue::Map(map) => map
                .values()
                .any(|v| matches!(v, ArgValue::Tensor(_)) || v.has_nested_tensor()),
            _ => false,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ArgValue::Tensor(_) => "tensor",
            ArgValue::Float(_) => "float",
            ArgValue::Int(_) => "int",
            ArgValue::Bool(_) => "bool",
            ArgValue::Str(_) => "str",
            ArgValue::None => "none",
            ArgValue::Map(_) => "map",
        }
    }
}

impl From<Tensor> for ArgValue {
    fn from(t: Tensor) -> Self {
        ArgValue::Tensor(t)
    }
}

impl From<f64> for ArgValue {
    fn from(v: f64) -> Self {
        ArgValue::Float(v)
    }
}

impl From<i64> for ArgValue {
    fn from(v: i64) -> Self {
        ArgValue::Int(v)
    }
}

impl From<bool> for ArgValue {
    fn from(v: bool) -> Self {
        ArgValue::Bool(v)
    }
}

impl From<&str> for ArgValue {
    fn from(v: &str) -> Self {
        ArgValue::Str(v.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(v: String) -> Self {
        ArgValue::Str(v)
    }
}

/// Positional and named arguments of one call
#[derive(Debug, Clone, Default)]
pub struct CallArgs {
    positional: Vec<ArgValue>,
    named: BTreeMap<String, ArgValue>,
}

impl CallArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a positional argument
    pub fn arg(mut self, value: impl Into<ArgValue>) -> Self {
        self.positional.push(value.into());
        self
    }

    /// Sets a named argument
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<ArgValue>) -> Self {
        self.named.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, key: &ArgKey) -> Option<&ArgValue> {
        match key {
            ArgKey::Positional(index) => self.positional.get(*index),
            ArgKey::Named(name) => self.named.get(name),
        }
    }

    /// Tensor argument under `key`, if present
    pub fn tensor(&self, key: &ArgKey) -> Option<&Tensor> {
        self.get(key).and_then(ArgValue::as_tensor)
    }

    pub fn len(&self) -> usize {
        self.positional.len() + self.named.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All arguments in canonical order
    pub fn iter(&self) -> impl Iterator<Item = (ArgKey, &ArgValue)> {
        self.positional
            .iter()
            .enumerate()
            .map(|(i, v)| (ArgKey::Positional(i), v))
            .chain(self.named.iter().map(|(k, v)| (ArgKey::Named(k.clone()), v)))
    }

    /// Top-level tensor arguments in canonical order
    pub fn tensors(&self) -> Vec<(ArgKey, &Tensor)> {
        self.iter()
            .filter_map(|(k, v)| v.as_tensor().map(|t| (k, t)))
            .collect()
    }

    /// Returns a copy with every top-level tensor replaced by `f`
    ///
    /// Non-tensor arguments are carried over unchanged.
    pub fn map_tensors<F>(&self, mut f: F) -> Result<CallArgs>
    where
        F: FnMut(&ArgKey, &Tensor) -> Result<Tensor>,
    {
        let mut mapped = CallArgs::new();
        for (key, value) in self.iter() {
            let value = match value {
                ArgValue::Tensor(t) => ArgValue::Tensor(f(&key, t)?),
                other => other.clone(),
            };
            match key {
                ArgKey::Positional(_) => mapped.positional.push(value),
                ArgKey::Named(name) => {
                    mapped.named.insert(name, value);
                }
            }
        }
        Ok(mapped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use common::types::{DType, Shape};

    #[test]
    fn test_canonical_order() {
        let device = Device::host();
        let t = device.allocate(Shape::new(vec![2]), DType::F32).unwrap();
        let args = CallArgs::new()
            .kwarg("zeta", t.clone())
            .kwarg("alpha", 1.5)
            .arg(t.clone())
            .kwarg("beta", t);

        let keys: Vec<String> = args.iter().map(|(k, _)| k.to_string()).collect();
        assert_eq!(keys, vec!["#0", "alpha", "beta", "zeta"]);

        let tensor_keys: Vec<ArgKey> = args.tensors().into_iter().map(|(k, _)| k).collect();
        assert_eq!(
            tensor_keys,
            vec![ArgKey::Positional(0), "beta".into(), "zeta".into()]
        );
        assert!(ArgKey::Positional(5) < ArgKey::from("a"));
    }

    #[test]
    fn test_map_tensors_keeps_other_values() {
        let device = Device::host();
        let t = device.allocate(Shape::new(vec![2]), DType::F32).unwrap();
        let args = CallArgs::new().arg(t.clone()).kwarg("flag", true);

        let replacement = device.allocate(Shape::new(vec![2]), DType::F32).unwrap();
        let mapped = args.map_tensors(|_, _| Ok(replacement.clone())).unwrap();

        assert!(mapped.tensor(&ArgKey::Positional(0)).unwrap().same_storage(&replacement));
        assert_eq!(mapped.get(&"flag".into()).and_then(ArgValue::as_bool), Some(true));
        assert_eq!(mapped.len(), 2);
    }

    #[test]
    fn test_nested_tensor_detection() {
        let device = Device::host();
        let t = device.allocate(Shape::new(vec![2]), DType::F32).unwrap();
        let mut inner = BTreeMap::new();
        inner.insert("scale".to_string(), ArgValue::Float(1.0));
        assert!(!ArgValue::Map(inner.clone()).has_nested_tensor());
        inner.insert("mask".to_string(), ArgValue::Tensor(t));
        assert!(ArgValue::Map(inner).has_nested_tensor());
    }
}
