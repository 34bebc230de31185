use std::collections::BTreeMap;

use candle_core::Tensor;

use crate::{
    batch::Batch, config::TrainingConfig, loss::LossModule, module::Model, TrainingError,
};

/// Per-example results accumulated by [`Task::save_result`] during test runs.
pub type ResultMap = BTreeMap<String, serde_json::Value>;

/// Task-specific pieces plugged into the generic epoch loop.
pub trait Task {
    type Model: Model;
    type Loss: LossModule;

    /// Reported metric keys, in display order, together with the loss module.
    /// The first key is conventionally the total loss.
    fn resolve_losses(
        &self,
        config: &TrainingConfig,
    ) -> Result<(Vec<String>, Self::Loss), TrainingError>;

    /// Records the predictions for `batch` into `results`.
    fn save_result(
        &mut self,
        _output: &Tensor,
        _batch: &Batch,
        _results: &mut ResultMap,
    ) -> Result<(), TrainingError> {
        Err(TrainingError::not_implemented("save_result"))
    }

    /// Visualization hook invoked for every batch when debugging is enabled.
    fn debug(
        &mut self,
        _batch: &Batch,
        _output: &Tensor,
        _iter_id: usize,
    ) -> Result<(), TrainingError> {
        Err(TrainingError::not_implemented("debug"))
    }
}
