use std::collections::{HashMap, HashSet};

use candle_core::{backprop::GradStore, DType, Device, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::{
    config::{self, to_runtime_error},
    TrainingError,
};

const EPS: f64 = 1e-12;

/// Named set of parameters registered with the optimizer together.
#[derive(Debug, Clone)]
pub struct ParameterGroup {
    pub name: String,
    pub parameters: Vec<(String, Var)>,
}

impl ParameterGroup {
    pub fn new(name: impl Into<String>, parameters: Vec<(String, Var)>) -> Self {
        Self {
            name: name.into(),
            parameters,
        }
    }

    /// Parameters with names qualified by the group, e.g. `loss.classifier`.
    pub fn into_named_parameters(self) -> Vec<(String, Var)> {
        let group = self.name;
        self.parameters
            .into_iter()
            .map(|(name, var)| (format!("{}.{}", group, name), var))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub enum OptimizerConfig {
    Adam(AdamConfig),
    AdamW(AdamConfig),
    Sgd(SgdConfig),
}

#[derive(Debug, Clone, Copy)]
pub struct AdamConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct SgdConfig {
    pub learning_rate: f64,
    pub momentum: f64,
    pub weight_decay: f64,
}

impl From<&config::OptimizerConfig> for OptimizerConfig {
    fn from(value: &config::OptimizerConfig) -> Self {
        let adam = AdamConfig {
            learning_rate: value.learning_rate as f64,
            beta1: value.beta1 as f64,
            beta2: value.beta2 as f64,
            epsilon: value.epsilon as f64,
            weight_decay: value.weight_decay as f64,
        };
        match value.algorithm {
            config::OptimizerType::Adam => OptimizerConfig::Adam(adam),
            config::OptimizerType::AdamW => OptimizerConfig::AdamW(adam),
            config::OptimizerType::Sgd => OptimizerConfig::Sgd(SgdConfig {
                learning_rate: value.learning_rate as f64,
                momentum: value.momentum as f64,
                weight_decay: value.weight_decay as f64,
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrainerOptimizerOptions {
    pub use_master_weights: bool,
    pub clip_global_norm: Option<f64>,
}

impl Default for TrainerOptimizerOptions {
    fn default() -> Self {
        Self {
            use_master_weights: true,
            clip_global_norm: None,
        }
    }
}

impl From<&config::OptimizerConfig> for TrainerOptimizerOptions {
    fn from(value: &config::OptimizerConfig) -> Self {
        Self {
            clip_global_norm: value.max_grad_norm.map(f64::from),
            ..Self::default()
        }
    }
}

#[derive(Debug)]
pub struct TrainerOptimizer {
    config: OptimizerConfig,
    params: Vec<ParameterSlot>,
    step: usize,
    clip_global_norm: Option<f64>,
}

#[derive(Debug)]
struct ParameterSlot {
    group: String,
    name: String,
    param: Var,
    dtype: DType,
    master: Option<Var>,
    first_moment: Tensor,
    second_moment: Tensor,
}

impl TrainerOptimizer {
    /// Builds the optimizer once every parameter group is known.
    pub fn new(
        groups: Vec<ParameterGroup>,
        config: OptimizerConfig,
        options: TrainerOptimizerOptions,
    ) -> Result<Self, TrainingError> {
        let mut params = Vec::new();
        let mut seen = HashSet::new();
        for group in groups {
            let group_name = group.name.clone();
            for (name, var) in group.into_named_parameters() {
                if !seen.insert(name.clone()) {
                    return Err(TrainingError::initialization(format!(
                        "parameter '{}' registered twice",
                        name
                    )));
                }
                params.push(ParameterSlot::new(
                    group_name.clone(),
                    name,
                    var,
                    options.use_master_weights,
                )?);
            }
        }

        if params.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }

        Ok(Self {
            config,
            params,
            step: 0,
            clip_global_norm: options.clip_global_norm,
        })
    }

    pub fn steps(&self) -> usize {
        self.step
    }

    /// Names of the registered groups in registration order.
    pub fn group_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for slot in &self.params {
            if names.last() != Some(&slot.group.as_str()) {
                names.push(&slot.group);
            }
        }
        names
    }

    pub fn parameters(&self) -> impl Iterator<Item = (&str, &Var)> {
        self.params
            .iter()
            .map(|slot| (slot.name.as_str(), &slot.param))
    }

    /// True when every state tensor the optimizer holds lives on `device`.
    pub fn state_on_device(&self, device: &Device) -> bool {
        self.params.iter().all(|slot| {
            slot.first_moment.device().same_device(device)
                && slot.second_moment.device().same_device(device)
                && slot
                    .master
                    .as_ref()
                    .map_or(true, |master| master.as_tensor().device().same_device(device))
        })
    }

    pub fn step(&mut self, grads: &mut GradStore) -> Result<(), TrainingError> {
        let mut processed = Vec::new();

        for (idx, slot) in self.params.iter().enumerate() {
            let tensor = slot.param.as_tensor();
            let grad = match grads.remove(tensor) {
                Some(grad) => grad,
                None => continue,
            };

            let grad = grad.to_dtype(DType::F32).map_err(to_runtime_error)?;
            let norm = tensor_l2_norm(&grad)?;

            processed.push(ProcessedGradient {
                index: idx,
                grad,
                norm,
            });
        }

        if processed.is_empty() {
            return Ok(());
        }

        if let Some(max_norm) = self.clip_global_norm {
            let total_norm_sq: f64 = processed.iter().map(|g| g.norm * g.norm).sum();
            let total_norm = total_norm_sq.sqrt();
            if total_norm > max_norm {
                let scale = max_norm / (total_norm + EPS);
                for item in &mut processed {
                    item.grad = item.grad.affine(scale, 0.0).map_err(to_runtime_error)?;
                    item.norm *= scale;
                }
            }
        }

        self.step += 1;
        match self.config {
            OptimizerConfig::Adam(cfg) => self.step_adam(cfg, false, processed)?,
            OptimizerConfig::AdamW(cfg) => self.step_adam(cfg, true, processed)?,
            OptimizerConfig::Sgd(cfg) => self.step_sgd(cfg, processed)?,
        }

        Ok(())
    }

    fn step_adam(
        &mut self,
        cfg: AdamConfig,
        decoupled_decay: bool,
        processed: Vec<ProcessedGradient>,
    ) -> Result<(), TrainingError> {
        let bias_correction1 = 1.0 - cfg.beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - cfg.beta2.powi(self.step as i32);
        let scale_m = if bias_correction1.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction1
        };
        let scale_v = if bias_correction2.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction2
        };

        for item in processed {
            let slot = &mut self.params[item.index];
            let base = slot.master_value()?;

            let grad = if !decoupled_decay && cfg.weight_decay != 0.0 {
                let decay = base.affine(cfg.weight_decay, 0.0).map_err(to_runtime_error)?;
                item.grad.add(&decay).map_err(to_runtime_error)?
            } else {
                item.grad
            };

            let prev_m = slot
                .first_moment
                .affine(cfg.beta1, 0.0)
                .map_err(to_runtime_error)?;
            let grad_term = grad.affine(1.0 - cfg.beta1, 0.0).map_err(to_runtime_error)?;
            let new_m = prev_m.add(&grad_term).map_err(to_runtime_error)?;

            let grad_sq = grad.sqr().map_err(to_runtime_error)?;
            let prev_v = slot
                .second_moment
                .affine(cfg.beta2, 0.0)
                .map_err(to_runtime_error)?;
            let grad_sq_term = grad_sq
                .affine(1.0 - cfg.beta2, 0.0)
                .map_err(to_runtime_error)?;
            let new_v = prev_v.add(&grad_sq_term).map_err(to_runtime_error)?;

            let m_hat = new_m.affine(scale_m, 0.0).map_err(to_runtime_error)?;
            let v_hat = new_v.affine(scale_v, 0.0).map_err(to_runtime_error)?;
            let denom = v_hat
                .sqrt()
                .map_err(to_runtime_error)?
                .affine(1.0, cfg.epsilon)
                .map_err(to_runtime_error)?;
            let update = m_hat
                .div(&denom)
                .map_err(to_runtime_error)?
                .affine(cfg.learning_rate, 0.0)
                .map_err(to_runtime_error)?;

            let decayed = if decoupled_decay && cfg.weight_decay != 0.0 {
                base.affine(1.0 - cfg.learning_rate * cfg.weight_decay, 0.0)
                    .map_err(to_runtime_error)?
            } else {
                base
            };

            let next = decayed.sub(&update).map_err(to_runtime_error)?;
            slot.write(next)?;

            slot.first_moment = new_m;
            slot.second_moment = new_v;
        }

        Ok(())
    }

    fn step_sgd(
        &mut self,
        cfg: SgdConfig,
        processed: Vec<ProcessedGradient>,
    ) -> Result<(), TrainingError> {
        for item in processed {
            let slot = &mut self.params[item.index];
            let base = slot.master_value()?;

            let grad = if cfg.weight_decay != 0.0 {
                let decay = base.affine(cfg.weight_decay, 0.0).map_err(to_runtime_error)?;
                item.grad.add(&decay).map_err(to_runtime_error)?
            } else {
                item.grad
            };

            let direction = if cfg.momentum != 0.0 {
                let buffer = slot
                    .first_moment
                    .affine(cfg.momentum, 0.0)
                    .map_err(to_runtime_error)?
                    .add(&grad)
                    .map_err(to_runtime_error)?;
                slot.first_moment = buffer.clone();
                buffer
            } else {
                grad
            };

            let update = direction
                .affine(cfg.learning_rate, 0.0)
                .map_err(to_runtime_error)?;
            let next = base.sub(&update).map_err(to_runtime_error)?;
            slot.write(next)?;
        }

        Ok(())
    }

    /// Rebinds every slot to the parameter of the same name in `named_parameters`
    /// and moves all optimizer state onto `device`.
    pub fn migrate(
        &mut self,
        named_parameters: Vec<(String, Var)>,
        device: &Device,
    ) -> Result<(), TrainingError> {
        let mut by_name: HashMap<String, Var> = named_parameters.into_iter().collect();

        for slot in &mut self.params {
            let var = by_name.remove(&slot.name).ok_or_else(|| {
                TrainingError::runtime(format!(
                    "placed module is missing optimized parameter '{}'",
                    slot.name
                ))
            })?;
            if var.as_tensor().dims() != slot.first_moment.dims() {
                return Err(TrainingError::runtime(format!(
                    "placed parameter '{}' changed shape",
                    slot.name
                )));
            }

            slot.first_moment = move_to(&slot.first_moment, device)?;
            slot.second_moment = move_to(&slot.second_moment, device)?;
            if let Some(master) = slot.master.as_ref() {
                let moved = move_to(master.as_tensor(), device)?;
                slot.master = Some(Var::from_tensor(&moved).map_err(to_runtime_error)?);
            }
            slot.param = var;
        }

        if !by_name.is_empty() {
            let mut extra: Vec<_> = by_name.into_keys().collect();
            extra.sort();
            return Err(TrainingError::runtime(format!(
                "placed module exposes parameters unknown to the optimizer: {}",
                extra.join(", ")
            )));
        }

        log::debug!(
            "optimizer state migrated to {:?} ({} parameter(s))",
            device,
            self.params.len()
        );
        Ok(())
    }

    pub fn state(&self) -> Result<OptimizerState, TrainingError> {
        let mut parameters = Vec::with_capacity(self.params.len());
        for slot in &self.params {
            let shape = slot.param.as_tensor().dims().to_vec();
            let numel = numel(&shape);
            let first = flatten_to_vec(&slot.first_moment, numel)?;
            let second = flatten_to_vec(&slot.second_moment, numel)?;
            let master = if let Some(master) = &slot.master {
                Some(flatten_to_vec(master.as_tensor(), numel)?)
            } else {
                None
            };
            parameters.push(ParameterState {
                name: slot.name.clone(),
                shape,
                first_moment: first,
                second_moment: second,
                master,
            });
        }

        Ok(OptimizerState {
            step: self.step,
            parameters,
        })
    }

    /// Restores serialized state onto the devices of the current parameters.
    pub fn load_state(&mut self, state: OptimizerState) -> Result<(), TrainingError> {
        self.step = state.step;
        let mut by_name: HashMap<_, _> = state
            .parameters
            .into_iter()
            .map(|param| (param.name.clone(), param))
            .collect();

        for slot in &mut self.params {
            let state = by_name.remove(&slot.name).ok_or_else(|| {
                TrainingError::runtime(format!("optimizer state missing parameter '{}'", slot.name))
            })?;

            let dims = slot.param.as_tensor().dims().to_vec();
            let expected = numel(&dims);
            if dims != state.shape {
                return Err(TrainingError::runtime(format!(
                    "optimizer state shape mismatch for '{}'",
                    slot.name
                )));
            }
            if expected != state.first_moment.len()
                || expected != state.second_moment.len()
                || state.master.as_ref().map_or(false, |m| m.len() != expected)
            {
                return Err(TrainingError::runtime(format!(
                    "optimizer state size mismatch for '{}'",
                    slot.name
                )));
            }

            let device = slot.param.as_tensor().device().clone();
            slot.first_moment = Tensor::from_vec(state.first_moment, dims.as_slice(), &device)
                .map_err(to_runtime_error)?;
            slot.second_moment = Tensor::from_vec(state.second_moment, dims.as_slice(), &device)
                .map_err(to_runtime_error)?;

            match (&slot.master, state.master) {
                (Some(_), Some(values)) => {
                    let tensor = Tensor::from_vec(values, dims.as_slice(), &device)
                        .map_err(to_runtime_error)?;
                    slot.write(tensor)?;
                }
                (None, None) => {}
                (Some(_), None) => {
                    return Err(TrainingError::runtime(format!(
                        "optimizer state missing master weights for '{}'",
                        slot.name
                    )))
                }
                (None, Some(_)) => {
                    return Err(TrainingError::runtime(format!(
                        "optimizer state contains master weights for '{}' but optimizer is not using them",
                        slot.name
                    )))
                }
            }
        }

        if !by_name.is_empty() {
            return Err(TrainingError::runtime(
                "optimizer state has extra parameters not present in the model",
            ));
        }

        Ok(())
    }
}

impl ParameterSlot {
    fn new(
        group: String,
        name: String,
        param: Var,
        use_master_weights: bool,
    ) -> Result<Self, TrainingError> {
        let tensor = param.as_tensor();
        if !tensor.dtype().is_float() {
            return Err(TrainingError::initialization(format!(
                "optimizer received non-floating parameter '{}'",
                name
            )));
        }
        let device = tensor.device();
        let shape = tensor.dims().to_vec();
        let dtype = tensor.dtype();

        let first_moment =
            Tensor::zeros(shape.as_slice(), DType::F32, device).map_err(to_runtime_error)?;
        let second_moment =
            Tensor::zeros(shape.as_slice(), DType::F32, device).map_err(to_runtime_error)?;

        let master = if use_master_weights && dtype != DType::F32 {
            let fp32 = tensor.to_dtype(DType::F32).map_err(to_runtime_error)?;
            Some(Var::from_tensor(&fp32).map_err(to_runtime_error)?)
        } else {
            None
        };

        Ok(Self {
            group,
            name,
            param,
            dtype,
            master,
            first_moment,
            second_moment,
        })
    }

    fn master_value(&self) -> Result<Tensor, TrainingError> {
        match self.master.as_ref() {
            Some(master) => Ok(master.as_tensor().clone()),
            None => self
                .param
                .as_tensor()
                .to_dtype(DType::F32)
                .map_err(to_runtime_error),
        }
    }

    fn write(&self, next: Tensor) -> Result<(), TrainingError> {
        if let Some(master) = self.master.as_ref() {
            master.set(&next).map_err(to_runtime_error)?;
        }
        let cast = if self.dtype == DType::F32 {
            next
        } else {
            next.to_dtype(self.dtype).map_err(to_runtime_error)?
        };
        self.param.set(&cast).map_err(to_runtime_error)
    }
}

struct ProcessedGradient {
    index: usize,
    grad: Tensor,
    norm: f64,
}

fn move_to(tensor: &Tensor, device: &Device) -> Result<Tensor, TrainingError> {
    if tensor.device().same_device(device) {
        Ok(tensor.clone())
    } else {
        tensor.to_device(device).map_err(to_runtime_error)
    }
}

fn tensor_l2_norm(tensor: &Tensor) -> Result<f64, TrainingError> {
    let squared = tensor
        .sqr()
        .map_err(to_runtime_error)?
        .sum_all()
        .map_err(to_runtime_error)?;
    let value = squared.to_vec0::<f32>().map_err(to_runtime_error)?;
    Ok((value as f64).sqrt())
}

fn flatten_to_vec(tensor: &Tensor, expected: usize) -> Result<Vec<f32>, TrainingError> {
    let flat = tensor
        .flatten_all()
        .map_err(to_runtime_error)?
        .to_dtype(DType::F32)
        .map_err(to_runtime_error)?
        .to_vec1::<f32>()
        .map_err(to_runtime_error)?;
    if flat.len() != expected {
        return Err(TrainingError::runtime(
            "unexpected element count during serialization",
        ));
    }
    Ok(flat)
}

fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerState {
    pub step: usize,
    pub parameters: Vec<ParameterState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterState {
    pub name: String,
    pub shape: Vec<usize>,
    pub first_moment: Vec<f32>,
    pub second_moment: Vec<f32>,
    pub master: Option<Vec<f32>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quadratic_grads(var: &Var) -> GradStore {
        // d/dw sum(w^2) = 2w
        var.as_tensor().sqr().unwrap().sum_all().unwrap().backward().unwrap()
    }

    fn groups() -> (Var, Var, Vec<ParameterGroup>) {
        let weight = Var::new(&[1f32, -2.0, 3.0], &Device::Cpu).unwrap();
        let classifier = Var::new(&[0.5f32, 0.5], &Device::Cpu).unwrap();
        let groups = vec![
            ParameterGroup::new("model", vec![("weight".into(), weight.clone())]),
            ParameterGroup::new("loss", vec![("classifier".into(), classifier.clone())]),
        ];
        (weight, classifier, groups)
    }

    fn sgd(lr: f64, momentum: f64) -> OptimizerConfig {
        OptimizerConfig::Sgd(SgdConfig {
            learning_rate: lr,
            momentum,
            weight_decay: 0.0,
        })
    }

    #[test]
    fn both_groups_are_registered_in_order() {
        let (_, _, groups) = groups();
        let optimizer =
            TrainerOptimizer::new(groups, sgd(0.1, 0.0), TrainerOptimizerOptions::default())
                .unwrap();
        assert_eq!(optimizer.group_names(), vec!["model", "loss"]);
        let names: Vec<_> = optimizer.parameters().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["model.weight", "loss.classifier"]);
    }

    #[test]
    fn duplicate_parameter_names_are_rejected() {
        let weight = Var::new(&[1f32], &Device::Cpu).unwrap();
        let groups = vec![ParameterGroup::new(
            "model",
            vec![("w".into(), weight.clone()), ("w".into(), weight)],
        )];
        let err = TrainerOptimizer::new(groups, sgd(0.1, 0.0), Default::default()).unwrap_err();
        assert!(matches!(err, TrainingError::Initialization(_)));
    }

    #[test]
    fn sgd_step_follows_gradient() {
        let (weight, classifier, groups) = groups();
        let mut optimizer =
            TrainerOptimizer::new(groups, sgd(0.1, 0.0), Default::default()).unwrap();
        let mut grads = quadratic_grads(&weight);
        optimizer.step(&mut grads).unwrap();

        let updated = weight.as_tensor().to_vec1::<f32>().unwrap();
        for (value, expected) in updated.iter().zip([0.8f32, -1.6, 2.4]) {
            assert!((value - expected).abs() < 1e-6);
        }
        // No gradient reached the loss group, so it must be untouched.
        assert_eq!(classifier.as_tensor().to_vec1::<f32>().unwrap(), vec![0.5, 0.5]);
        assert_eq!(optimizer.steps(), 1);
    }

    #[test]
    fn adam_moves_each_coordinate_by_learning_rate_on_first_step() {
        let (weight, _, groups) = groups();
        let config = OptimizerConfig::Adam(AdamConfig {
            learning_rate: 0.01,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
        });
        let mut optimizer = TrainerOptimizer::new(groups, config, Default::default()).unwrap();
        let mut grads = quadratic_grads(&weight);
        optimizer.step(&mut grads).unwrap();

        let updated = weight.as_tensor().to_vec1::<f32>().unwrap();
        for (value, expected) in updated.iter().zip([0.99f32, -1.99, 2.99]) {
            assert!((value - expected).abs() < 1e-4, "{value} vs {expected}");
        }
    }

    #[test]
    fn migrate_rebinds_parameters_and_keeps_state() {
        let (weight, classifier, groups) = groups();
        let mut optimizer =
            TrainerOptimizer::new(groups, sgd(0.1, 0.9), Default::default()).unwrap();
        let mut grads = quadratic_grads(&weight);
        optimizer.step(&mut grads).unwrap();
        let before = optimizer.state().unwrap();

        let replacement = Var::from_tensor(weight.as_tensor()).unwrap();
        let classifier_copy = Var::from_tensor(classifier.as_tensor()).unwrap();
        optimizer
            .migrate(
                vec![
                    ("model.weight".into(), replacement.clone()),
                    ("loss.classifier".into(), classifier_copy),
                ],
                &Device::Cpu,
            )
            .unwrap();

        assert!(optimizer.state_on_device(&Device::Cpu));
        let after = optimizer.state().unwrap();
        assert_eq!(
            before.parameters[0].first_moment,
            after.parameters[0].first_moment
        );
        let bound = optimizer.parameters().next().unwrap().1;
        assert_eq!(bound.as_tensor().id(), replacement.as_tensor().id());
    }

    #[test]
    fn migrate_requires_every_parameter() {
        let (weight, _, groups) = groups();
        let mut optimizer =
            TrainerOptimizer::new(groups, sgd(0.1, 0.0), Default::default()).unwrap();
        let err = optimizer
            .migrate(vec![("model.weight".into(), weight)], &Device::Cpu)
            .unwrap_err();
        assert!(err.to_string().contains("loss.classifier"));
    }

    #[test]
    fn state_round_trips_through_json() {
        let (weight, _, initial) = groups();
        let mut optimizer =
            TrainerOptimizer::new(initial, sgd(0.1, 0.9), Default::default()).unwrap();
        let mut grads = quadratic_grads(&weight);
        optimizer.step(&mut grads).unwrap();

        let encoded = serde_json::to_string(&optimizer.state().unwrap()).unwrap();
        let decoded: OptimizerState = serde_json::from_str(&encoded).unwrap();

        let (_, _, fresh_groups) = groups();
        let mut restored =
            TrainerOptimizer::new(fresh_groups, sgd(0.1, 0.9), Default::default()).unwrap();
        restored.load_state(decoded).unwrap();
        assert_eq!(restored.steps(), 1);
        assert_eq!(
            restored.state().unwrap().parameters[0].first_moment,
            vec![2.0, -4.0, 6.0]
        );
    }
}
