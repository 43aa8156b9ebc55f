//! Weight archive providers: an in-memory map and a safetensors reader.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{Device, Tensor};

use super::error::LoadError;

/// A store of externally named weight tensors.
pub trait WeightLoader {
    fn exists(&self, key: &str) -> bool;
    fn get(&self, key: &str) -> Result<Tensor, LoadError>;
    fn list_keys(&self) -> Vec<String>;
}

/// In-memory provider, used by tests and for synthetic checkpoints.
#[derive(Default)]
pub struct MapWeightLoader {
    tensors: HashMap<String, Tensor>,
}

impl MapWeightLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tensors(tensors: HashMap<String, Tensor>) -> Self {
        Self { tensors }
    }

    pub fn insert(&mut self, key: impl Into<String>, tensor: Tensor) {
        self.tensors.insert(key.into(), tensor);
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

impl WeightLoader for MapWeightLoader {
    fn exists(&self, key: &str) -> bool {
        self.tensors.contains_key(key)
    }

    fn get(&self, key: &str) -> Result<Tensor, LoadError> {
        self.tensors
            .get(key)
            .cloned()
            .ok_or_else(|| LoadError::MissingKey(key.to_string()))
    }

    fn list_keys(&self) -> Vec<String> {
        self.tensors.keys().cloned().collect()
    }
}

/// Safetensors archive provider. Tensors are materialized on CPU and moved
/// to the destination device during assignment.
pub struct SafetensorsWeightLoader {
    tensors: HashMap<String, Tensor>,
}

impl SafetensorsWeightLoader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LoadError> {
        let tensors = candle_core::safetensors::load(path.as_ref(), &Device::Cpu)
            .map_err(|e| LoadError::Archive(format!("{}: {e}", path.as_ref().display())))?;
        Ok(Self { tensors })
    }
}

impl WeightLoader for SafetensorsWeightLoader {
    fn exists(&self, key: &str) -> bool {
        self.tensors.contains_key(key)
    }

    fn get(&self, key: &str) -> Result<Tensor, LoadError> {
        self.tensors
            .get(key)
            .cloned()
            .ok_or_else(|| LoadError::MissingKey(key.to_string()))
    }

    fn list_keys(&self) -> Vec<String> {
        self.tensors.keys().cloned().collect()
    }
}

/// External keys present in the archive but never consumed by the mapper.
pub fn diff_unused_keys(wl: &dyn WeightLoader, used_keys: &[String]) -> Vec<String> {
    let used: std::collections::HashSet<&str> = used_keys.iter().map(String::as_str).collect();
    let mut extra: Vec<String> = wl
        .list_keys()
        .into_iter()
        .filter(|k| !used.contains(k.as_str()))
        .collect();
    extra.sort();
    extra
}
