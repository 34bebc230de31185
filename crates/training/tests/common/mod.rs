#![allow(dead_code)]

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use anyhow::Result;
use candle_core::{DType, Device, Tensor, Var};
use futures::future::BoxFuture;
use serde_json::json;
use training::{
    config::LoggingConfig, Batch, EpochDataset, LossModule, LossOutput, LossTerm, Model, Module,
    ProgressSink, ResultMap, Task, TrainingConfig, TrainingError, DEFAULT_INPUT_SIZES,
};

pub const IN_FEATURES: usize = 4;
pub const HIDDEN: usize = 3;
pub const NUM_IDS: usize = 5;

fn deterministic(rows: usize, cols: usize, phase: f32) -> Result<Tensor> {
    let values: Vec<f32> = (0..rows * cols)
        .map(|i| ((i as f32 + 1.0) * 0.37 + phase).sin() * 0.5)
        .collect();
    Ok(Tensor::from_vec(values, (rows, cols), &Device::Cpu)?)
}

fn clone_var(var: &Var, device: &Device) -> candle_core::Result<Var> {
    let moved = var.as_tensor().to_device(device)?.copy()?;
    Var::from_tensor(&moved)
}

/// Two-stage model: a linear embedding followed by `tanh`.
pub struct LinearModel {
    weight: Var,
    training: AtomicBool,
}

impl LinearModel {
    pub fn new() -> Result<Self> {
        Ok(Self {
            weight: Var::from_tensor(&deterministic(IN_FEATURES, HIDDEN, 0.0)?)?,
            training: AtomicBool::new(false),
        })
    }
}

impl Module for LinearModel {
    fn named_parameters(&self) -> Vec<(String, Var)> {
        vec![("weight".to_string(), self.weight.clone())]
    }

    fn set_training(&self, training: bool) {
        self.training.store(training, Ordering::SeqCst);
    }

    fn is_training(&self) -> bool {
        self.training.load(Ordering::SeqCst)
    }

    fn to_device(&self, device: &Device) -> candle_core::Result<Self> {
        Ok(Self {
            weight: clone_var(&self.weight, device)?,
            training: AtomicBool::new(self.is_training()),
        })
    }
}

impl Model for LinearModel {
    fn forward(&self, input: &Tensor) -> candle_core::Result<Vec<Tensor>> {
        let embedding = input.matmul(self.weight.as_tensor())?;
        let output = embedding.tanh()?;
        Ok(vec![embedding, output])
    }
}

/// Detection regression plus an identity classifier that only applies to
/// batches carrying an `ids` field.
pub struct JointLoss {
    classifier: Var,
    training: AtomicBool,
}

impl JointLoss {
    pub fn new() -> Result<Self> {
        Ok(Self {
            classifier: Var::from_tensor(&deterministic(HIDDEN, NUM_IDS, 1.3)?)?,
            training: AtomicBool::new(false),
        })
    }
}

impl Module for JointLoss {
    fn named_parameters(&self) -> Vec<(String, Var)> {
        vec![("classifier".to_string(), self.classifier.clone())]
    }

    fn set_training(&self, training: bool) {
        self.training.store(training, Ordering::SeqCst);
    }

    fn is_training(&self) -> bool {
        self.training.load(Ordering::SeqCst)
    }

    fn to_device(&self, device: &Device) -> candle_core::Result<Self> {
        Ok(Self {
            classifier: clone_var(&self.classifier, device)?,
            training: AtomicBool::new(self.is_training()),
        })
    }
}

impl LossModule for JointLoss {
    fn forward(&self, outputs: &[Tensor], batch: &Batch) -> Result<LossOutput, TrainingError> {
        let to_err = |err: candle_core::Error| TrainingError::runtime(err.to_string());
        let (embedding, output) = match outputs {
            [embedding, output] => (embedding, output),
            _ => return Err(TrainingError::runtime("expected two output stages")),
        };

        let det = candle_nn::loss::mse(output, batch.require("target")?).map_err(to_err)?;
        let (total, id_term) = match batch.get("ids") {
            Some(ids) => {
                let logits = embedding
                    .matmul(self.classifier.as_tensor())
                    .map_err(to_err)?;
                let id = candle_nn::loss::cross_entropy(&logits, ids).map_err(to_err)?;
                ((&det + &id).map_err(to_err)?, LossTerm::Active(id))
            }
            None => (det.clone(), LossTerm::Inactive),
        };

        Ok(LossOutput::new(total.clone())
            .with_term("loss", LossTerm::Active(total))
            .with_term("det_loss", LossTerm::Active(det))
            .with_term("id_loss", id_term))
    }
}

fn joint_losses() -> Result<(Vec<String>, JointLoss), TrainingError> {
    let loss = JointLoss::new().map_err(|err| TrainingError::initialization(err.to_string()))?;
    let keys = ["loss", "det_loss", "id_loss"]
        .iter()
        .map(|key| key.to_string())
        .collect();
    Ok((keys, loss))
}

/// Task overriding both hooks.
#[derive(Default)]
pub struct JointTask {
    pub debug_iters: Vec<usize>,
}

impl Task for JointTask {
    type Model = LinearModel;
    type Loss = JointLoss;

    fn resolve_losses(
        &self,
        _config: &TrainingConfig,
    ) -> Result<(Vec<String>, Self::Loss), TrainingError> {
        joint_losses()
    }

    fn save_result(
        &mut self,
        output: &Tensor,
        batch: &Batch,
        results: &mut ResultMap,
    ) -> Result<(), TrainingError> {
        let rows = output
            .to_vec2::<f32>()
            .map_err(|err| TrainingError::runtime(err.to_string()))?;
        let ids = batch
            .meta
            .as_array()
            .ok_or_else(|| TrainingError::runtime("meta must list sample ids"))?;
        for (id, row) in ids.iter().zip(rows) {
            let key = id.as_str().unwrap_or_default().to_string();
            results.insert(key, json!(row));
        }
        Ok(())
    }

    fn debug(
        &mut self,
        _batch: &Batch,
        _output: &Tensor,
        iter_id: usize,
    ) -> Result<(), TrainingError> {
        self.debug_iters.push(iter_id);
        Ok(())
    }
}

/// Task relying on the default hooks.
pub struct BareTask;

impl Task for BareTask {
    type Model = LinearModel;
    type Loss = JointLoss;

    fn resolve_losses(
        &self,
        _config: &TrainingConfig,
    ) -> Result<(Vec<String>, Self::Loss), TrainingError> {
        joint_losses()
    }
}

/// Task reporting an arbitrary list of metric keys over [`JointLoss`].
pub struct KeyedTask {
    pub keys: Vec<&'static str>,
}

impl Task for KeyedTask {
    type Model = LinearModel;
    type Loss = JointLoss;

    fn resolve_losses(
        &self,
        _config: &TrainingConfig,
    ) -> Result<(Vec<String>, Self::Loss), TrainingError> {
        let (_, loss) = joint_losses()?;
        Ok((self.keys.iter().map(|key| key.to_string()).collect(), loss))
    }
}

/// Batch of `size` samples; ids are attached when `with_ids` is set.
pub fn make_batch(offset: usize, size: usize, with_ids: bool) -> Result<Batch> {
    let input = deterministic(size, IN_FEATURES, offset as f32)?;
    let target = deterministic(size, HIDDEN, offset as f32 + 0.5)?.affine(0.5, 0.1)?;
    let meta = json!((0..size)
        .map(|i| format!("sample{}", offset + i))
        .collect::<Vec<_>>());
    let mut batch = Batch::new(input).with_field("target", target).with_meta(meta);
    if with_ids {
        let ids: Vec<u32> = (0..size).map(|i| ((offset + i) % NUM_IDS) as u32).collect();
        batch.insert("ids", Tensor::from_vec(ids, size, &Device::Cpu)?);
    }
    Ok(batch)
}

/// Replays fixed batches and records every call the epoch loop makes.
pub struct ScriptedDataset {
    batches: Vec<Batch>,
    cursor: usize,
    pub events: Arc<Mutex<Vec<&'static str>>>,
}

impl ScriptedDataset {
    pub fn new(batches: Vec<Batch>) -> Self {
        Self {
            batches,
            cursor: 0,
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn events(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.events().iter().filter(|&&e| e == event).count()
    }

    fn record(&self, event: &'static str) {
        self.events.lock().unwrap().push(event);
    }
}

impl EpochDataset for ScriptedDataset {
    fn len(&self) -> usize {
        self.batches.len()
    }

    fn begin_epoch(&mut self) -> Result<(), TrainingError> {
        self.record("begin_epoch");
        self.cursor = 0;
        Ok(())
    }

    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<Batch>, TrainingError>> {
        Box::pin(async move {
            self.record("next_batch");
            let batch = self.batches.get(self.cursor).cloned();
            self.cursor += 1;
            Ok(batch)
        })
    }

    fn scale_index(&self, _batch_index: usize) -> usize {
        DEFAULT_INPUT_SIZES.len() - 1
    }

    fn rand_scale(&mut self) -> Result<(), TrainingError> {
        self.record("rand_scale");
        Ok(())
    }

    fn shuffle(&mut self) -> Result<(), TrainingError> {
        self.record("shuffle");
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct RecordingSink {
    pub lines: Arc<Mutex<Vec<String>>>,
}

impl RecordingSink {
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }
}

impl ProgressSink for RecordingSink {
    fn status(&mut self, line: &str) {
        self.lines.lock().unwrap().push(line.to_string());
    }
}

/// Quiet configuration printing one status line per batch.
pub fn quiet_config() -> TrainingConfig {
    let mut config = TrainingConfig::default();
    config.runtime.print_iter = 1;
    config.logging = LoggingConfig {
        enable_stdout: false,
        ..LoggingConfig::default()
    };
    config
}

pub fn sgd_config(learning_rate: f32) -> training::config::OptimizerConfig {
    training::config::OptimizerConfig {
        algorithm: training::config::OptimizerType::Sgd,
        learning_rate,
        ..Default::default()
    }
}

/// Snapshot of every parameter of the primary unit.
pub fn parameter_values<M: Module>(module: &M) -> Result<Vec<(String, Vec<f32>)>> {
    module
        .named_parameters()
        .into_iter()
        .map(|(name, var)| {
            let values = var
                .as_tensor()
                .to_dtype(DType::F32)?
                .flatten_all()?
                .to_vec1::<f32>()?;
            Ok((name, values))
        })
        .collect()
}
