use std::collections::BTreeMap;

use candle_core::{Device, Tensor};
use serde_json::Value;

use crate::{config::to_runtime_error, TrainingError};

/// Field holding the network input; its leading dimension is the batch size.
pub const INPUT_FIELD: &str = "input";

/// Named tensors for one step plus auxiliary metadata.
///
/// `meta` is never moved between devices. When it is a JSON array with one
/// entry per sample it is sliced alongside the tensors by [`Batch::narrow`].
#[derive(Debug, Clone)]
pub struct Batch {
    fields: BTreeMap<String, Tensor>,
    pub meta: Value,
}

impl Batch {
    pub fn new(input: Tensor) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(INPUT_FIELD.to_string(), input);
        Self {
            fields,
            meta: Value::Null,
        }
    }

    pub fn from_fields(fields: BTreeMap<String, Tensor>, meta: Value) -> Self {
        Self { fields, meta }
    }

    pub fn with_field(mut self, name: impl Into<String>, tensor: Tensor) -> Self {
        self.fields.insert(name.into(), tensor);
        self
    }

    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = meta;
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) -> Option<Tensor> {
        self.fields.insert(name.into(), tensor)
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.fields.get(name)
    }

    /// Looks up a field that the computation cannot proceed without.
    pub fn require(&self, name: &str) -> Result<&Tensor, TrainingError> {
        self.fields
            .get(name)
            .ok_or_else(|| TrainingError::runtime(format!("batch is missing field '{}'", name)))
    }

    pub fn input(&self) -> Result<&Tensor, TrainingError> {
        self.require(INPUT_FIELD)
    }

    pub fn batch_size(&self) -> Result<usize, TrainingError> {
        let input = self.input()?;
        input
            .dims()
            .first()
            .copied()
            .ok_or_else(|| TrainingError::runtime("batch input must have a leading dimension"))
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.fields.iter().map(|(name, tensor)| (name.as_str(), tensor))
    }

    /// Copies every tensor field to `device`, leaving `meta` untouched.
    pub fn to_device(&self, device: &Device) -> Result<Batch, TrainingError> {
        let mut fields = BTreeMap::new();
        for (name, tensor) in &self.fields {
            let moved = if tensor.device().same_device(device) {
                tensor.clone()
            } else {
                tensor.to_device(device).map_err(to_runtime_error)?
            };
            fields.insert(name.clone(), moved);
        }
        Ok(Batch {
            fields,
            meta: self.meta.clone(),
        })
    }

    /// Samples `start..start + len` of every field.
    pub fn narrow(&self, start: usize, len: usize) -> Result<Batch, TrainingError> {
        let batch_size = self.batch_size()?;
        let mut fields = BTreeMap::new();
        for (name, tensor) in &self.fields {
            let leading = tensor.dims().first().copied().unwrap_or(0);
            if leading != batch_size {
                return Err(TrainingError::runtime(format!(
                    "field '{}' has leading dimension {} but batch size is {}",
                    name, leading, batch_size
                )));
            }
            let slice = tensor.narrow(0, start, len).map_err(to_runtime_error)?;
            fields.insert(name.clone(), slice);
        }
        let meta = match &self.meta {
            Value::Array(entries) if entries.len() == batch_size => {
                Value::Array(entries[start..start + len].to_vec())
            }
            other => other.clone(),
        };
        Ok(Batch { fields, meta })
    }

    /// Splits the batch into contiguous chunks of the requested sizes.
    pub fn split(&self, chunk_sizes: &[usize]) -> Result<Vec<Batch>, TrainingError> {
        let batch_size = self.batch_size()?;
        let total: usize = chunk_sizes.iter().sum();
        if total != batch_size {
            return Err(TrainingError::runtime(format!(
                "chunk sizes {:?} sum to {} but the batch holds {} samples",
                chunk_sizes, total, batch_size
            )));
        }
        let mut chunks = Vec::with_capacity(chunk_sizes.len());
        let mut start = 0;
        for &size in chunk_sizes {
            chunks.push(self.narrow(start, size)?);
            start += size;
        }
        Ok(chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use serde_json::json;

    fn sample_batch() -> Batch {
        let input = Tensor::arange(0f32, 12f32, &Device::Cpu)
            .unwrap()
            .reshape((6, 2))
            .unwrap();
        let target = Tensor::zeros((6, 1), DType::F32, &Device::Cpu).unwrap();
        Batch::new(input)
            .with_field("target", target)
            .with_meta(json!(["a", "b", "c", "d", "e", "f"]))
    }

    #[test]
    fn batch_size_reads_input_leading_dimension() {
        assert_eq!(sample_batch().batch_size().unwrap(), 6);
    }

    #[test]
    fn missing_input_is_a_runtime_error() {
        let batch = Batch::from_fields(BTreeMap::new(), Value::Null);
        assert!(matches!(batch.batch_size(), Err(TrainingError::Runtime(_))));
    }

    #[test]
    fn split_slices_fields_and_per_sample_meta() {
        let chunks = sample_batch().split(&[4, 2]).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].batch_size().unwrap(), 4);
        assert_eq!(chunks[1].get("target").unwrap().dims(), &[2, 1]);
        assert_eq!(chunks[1].meta, json!(["e", "f"]));
        let first = chunks[1].input().unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(first[0], vec![8.0, 9.0]);
    }

    #[test]
    fn split_rejects_sizes_that_do_not_cover_the_batch() {
        assert!(sample_batch().split(&[3, 2]).is_err());
    }

    #[test]
    fn device_transfer_keeps_meta() {
        let batch = sample_batch().with_meta(json!({"frame": 12}));
        let moved = batch.to_device(&Device::Cpu).unwrap();
        assert_eq!(moved.meta, json!({"frame": 12}));
        assert_eq!(moved.field_names().collect::<Vec<_>>(), vec!["input", "target"]);
    }
}
