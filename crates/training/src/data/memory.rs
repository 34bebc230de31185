use std::collections::BTreeMap;

use candle_core::Tensor;
use futures::future::BoxFuture;
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use serde_json::Value;

use super::{EpochDataset, InputSize, Result, DEFAULT_INPUT_SIZES};
use crate::{batch::Batch, config::to_runtime_error, TrainingError};

/// One example: unbatched tensors keyed by field name plus an identifier.
#[derive(Debug, Clone)]
pub struct Sample {
    pub id: String,
    pub fields: BTreeMap<String, Tensor>,
}

impl Sample {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, tensor: Tensor) -> Self {
        self.fields.insert(name.into(), tensor);
        self
    }
}

/// In-memory dataset that stacks samples into fixed-size batches.
///
/// Incomplete trailing batches are dropped so that every batch matches the
/// configured chunk sizes. Batch `meta` is the JSON array of sample ids.
pub struct TensorDataset {
    samples: Vec<Sample>,
    batch_size: usize,
    order: Vec<usize>,
    batch_scales: Vec<usize>,
    multi_scales: Option<Vec<InputSize>>,
    multi_scale: bool,
    rng: StdRng,
    cursor: usize,
}

impl TensorDataset {
    pub fn new(samples: Vec<Sample>, batch_size: usize, seed: u64) -> Result<Self> {
        if batch_size == 0 {
            return Err(TrainingError::initialization(
                "batch size must be greater than zero",
            ));
        }
        let order = (0..samples.len()).collect();
        let batches = samples.len() / batch_size;
        Ok(Self {
            samples,
            batch_size,
            order,
            batch_scales: vec![DEFAULT_INPUT_SIZES.len() - 1; batches],
            multi_scales: None,
            multi_scale: false,
            rng: StdRng::seed_from_u64(seed),
            cursor: 0,
        })
    }

    /// Uses `sizes` instead of the default resolution table; every batch starts
    /// at the last entry.
    pub fn with_input_sizes(mut self, sizes: Vec<InputSize>) -> Result<Self> {
        if sizes.is_empty() {
            return Err(TrainingError::initialization(
                "multi-scale table must not be empty",
            ));
        }
        let last = sizes.len() - 1;
        self.batch_scales.iter_mut().for_each(|scale| *scale = last);
        self.multi_scales = Some(sizes);
        Ok(self)
    }

    /// Enables random per-batch scale assignment in [`EpochDataset::rand_scale`].
    pub fn with_multi_scale(mut self, enabled: bool) -> Self {
        self.multi_scale = enabled;
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Sample ids in the order the next pass will yield them.
    pub fn order(&self) -> Vec<&str> {
        self.order
            .iter()
            .map(|&index| self.samples[index].id.as_str())
            .collect()
    }

    pub fn batch_scales(&self) -> &[usize] {
        &self.batch_scales
    }

    fn scale_table_len(&self) -> usize {
        self.multi_scales
            .as_ref()
            .map_or(DEFAULT_INPUT_SIZES.len(), Vec::len)
    }

    fn build_batch(&mut self) -> Result<Option<Batch>> {
        if self.cursor >= self.len() {
            return Ok(None);
        }
        let start = self.cursor * self.batch_size;
        let members = &self.order[start..start + self.batch_size];
        self.cursor += 1;

        let first = &self.samples[members[0]];
        let mut fields = BTreeMap::new();
        for name in first.fields.keys() {
            let mut tensors = Vec::with_capacity(members.len());
            for &index in members {
                let sample = &self.samples[index];
                let tensor = sample.fields.get(name).ok_or_else(|| {
                    TrainingError::runtime(format!(
                        "sample '{}' is missing field '{}'",
                        sample.id, name
                    ))
                })?;
                tensors.push(tensor.clone());
            }
            let stacked = Tensor::stack(&tensors, 0).map_err(to_runtime_error)?;
            fields.insert(name.clone(), stacked);
        }

        let ids = members
            .iter()
            .map(|&index| Value::String(self.samples[index].id.clone()))
            .collect();
        Ok(Some(Batch::from_fields(fields, Value::Array(ids))))
    }
}

impl EpochDataset for TensorDataset {
    fn len(&self) -> usize {
        self.samples.len() / self.batch_size
    }

    fn begin_epoch(&mut self) -> Result<()> {
        self.cursor = 0;
        Ok(())
    }

    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<Batch>>> {
        Box::pin(async move { self.build_batch() })
    }

    fn scale_index(&self, batch_index: usize) -> usize {
        self.batch_scales
            .get(batch_index)
            .copied()
            .unwrap_or_else(|| self.scale_table_len() - 1)
    }

    fn input_multi_scales(&self) -> Option<&[InputSize]> {
        self.multi_scales.as_deref()
    }

    fn rand_scale(&mut self) -> Result<()> {
        if !self.multi_scale {
            return Ok(());
        }
        let table_len = self.scale_table_len();
        for scale in &mut self.batch_scales {
            *scale = self.rng.gen_range(0..table_len);
        }
        log::debug!("re-assigned scales for {} batches", self.batch_scales.len());
        Ok(())
    }

    fn shuffle(&mut self) -> Result<()> {
        self.order.shuffle(&mut self.rng);
        Ok(())
    }
}
