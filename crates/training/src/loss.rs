use std::collections::BTreeMap;

use candle_core::{DType, Tensor};

use crate::{batch::Batch, config::to_runtime_error, module::Module, TrainingError};

/// One named component of a composite loss.
#[derive(Debug, Clone)]
pub enum LossTerm {
    /// Per-sample or scalar value computed for this batch.
    Active(Tensor),
    /// The term does not apply to this batch and must not enter any average.
    Inactive,
}

impl LossTerm {
    pub fn is_active(&self) -> bool {
        matches!(self, LossTerm::Active(_))
    }

    pub fn tensor(&self) -> Option<&Tensor> {
        match self {
            LossTerm::Active(tensor) => Some(tensor),
            LossTerm::Inactive => None,
        }
    }

    /// Mean of the term as a host scalar, `None` when inactive.
    pub fn scalar(&self) -> Result<Option<f64>, TrainingError> {
        match self {
            LossTerm::Active(tensor) => scalar_mean(tensor).map(Some),
            LossTerm::Inactive => Ok(None),
        }
    }
}

impl From<Tensor> for LossTerm {
    fn from(value: Tensor) -> Self {
        LossTerm::Active(value)
    }
}

pub type LossTermMap = BTreeMap<String, LossTerm>;

#[derive(Debug, Clone)]
pub struct LossOutput {
    pub loss: Tensor,
    pub terms: LossTermMap,
}

impl LossOutput {
    pub fn new(loss: Tensor) -> Self {
        Self {
            loss,
            terms: LossTermMap::new(),
        }
    }

    pub fn with_term(mut self, name: impl Into<String>, term: LossTerm) -> Self {
        self.terms.insert(name.into(), term);
        self
    }
}

/// Loss computation that may own trainable parameters of its own.
pub trait LossModule: Module {
    /// Scores every output stage of the model against the batch targets.
    fn forward(&self, outputs: &[Tensor], batch: &Batch) -> Result<LossOutput, TrainingError>;
}

pub(crate) fn scalar_mean(tensor: &Tensor) -> Result<f64, TrainingError> {
    let value = tensor
        .mean_all()
        .map_err(to_runtime_error)?
        .to_dtype(DType::F32)
        .map_err(to_runtime_error)?
        .to_vec0::<f32>()
        .map_err(to_runtime_error)?;
    Ok(value as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn inactive_term_has_no_scalar() {
        assert_eq!(LossTerm::Inactive.scalar().unwrap(), None);
        assert!(!LossTerm::Inactive.is_active());
    }

    #[test]
    fn active_zero_is_still_reported() {
        let zero = Tensor::zeros(3, DType::F32, &Device::Cpu).unwrap();
        assert_eq!(LossTerm::from(zero).scalar().unwrap(), Some(0.0));
    }

    #[test]
    fn per_sample_terms_reduce_to_their_mean() {
        let values = Tensor::new(&[1f32, 2.0, 6.0], &Device::Cpu).unwrap();
        let mean = LossTerm::Active(values).scalar().unwrap().unwrap();
        assert!((mean - 3.0).abs() < 1e-6);
    }
}
