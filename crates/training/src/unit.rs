use candle_core::{Device, Tensor, Var};

use crate::{
    batch::Batch,
    config::to_runtime_error,
    loss::{LossModule, LossOutput, LossTermMap},
    module::{Model, Module},
    optimizer::ParameterGroup,
    TrainingError,
};

pub const MODEL_GROUP: &str = "model";
pub const LOSS_GROUP: &str = "loss";

/// Result of one fused model and loss evaluation.
#[derive(Debug, Clone)]
pub struct ForwardOutput {
    /// Last output stage of the model.
    pub output: Tensor,
    pub loss: Tensor,
    pub terms: LossTermMap,
}

/// Model and loss module evaluated as a single unit so that replication
/// distributes both together.
#[derive(Debug)]
pub struct CompositeForwardUnit<M, L> {
    model: M,
    loss: L,
}

impl<M, L> CompositeForwardUnit<M, L>
where
    M: Model,
    L: LossModule,
{
    pub fn new(model: M, loss: L) -> Self {
        Self { model, loss }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn loss(&self) -> &L {
        &self.loss
    }

    pub fn into_parts(self) -> (M, L) {
        (self.model, self.loss)
    }

    pub fn forward(&self, batch: &Batch) -> Result<ForwardOutput, TrainingError> {
        let outputs = self
            .model
            .forward(batch.input()?)
            .map_err(to_runtime_error)?;
        let output = outputs
            .last()
            .cloned()
            .ok_or_else(|| TrainingError::runtime("model produced no output stages"))?;

        let LossOutput { loss, terms } = self.loss.forward(&outputs, batch)?;

        Ok(ForwardOutput {
            output,
            loss,
            terms,
        })
    }

    /// Model and loss parameters as two separate optimizer groups.
    pub fn parameter_groups(&self) -> Vec<ParameterGroup> {
        vec![
            ParameterGroup::new(MODEL_GROUP, self.model.named_parameters()),
            ParameterGroup::new(LOSS_GROUP, self.loss.named_parameters()),
        ]
    }
}

impl<M, L> Module for CompositeForwardUnit<M, L>
where
    M: Model,
    L: LossModule,
{
    fn named_parameters(&self) -> Vec<(String, Var)> {
        self.parameter_groups()
            .into_iter()
            .flat_map(|group| group.into_named_parameters())
            .collect()
    }

    fn set_training(&self, training: bool) {
        self.model.set_training(training);
        self.loss.set_training(training);
    }

    fn is_training(&self) -> bool {
        self.model.is_training()
    }

    fn to_device(&self, device: &Device) -> candle_core::Result<Self> {
        Ok(Self {
            model: self.model.to_device(device)?,
            loss: self.loss.to_device(device)?,
        })
    }
}
