use std::collections::BTreeMap;

use candle_core::{
    backprop::GradStore,
    utils::{cuda_is_available, metal_is_available},
    Device, Tensor, Var,
};

use crate::{
    batch::Batch,
    config::{to_runtime_error, RuntimeConfig},
    loss::{LossModule, LossTerm, LossTermMap},
    module::{Model, Module},
    optimizer::TrainerOptimizer,
    unit::{CompositeForwardUnit, ForwardOutput},
    TrainingError,
};

/// Where the composite unit runs.
#[derive(Debug, Clone)]
pub enum DeviceStrategy {
    Single(Device),
    /// One replica per device; replica `i` receives `chunk_sizes[i]` samples of
    /// every batch. The first device is the primary.
    Replicated {
        devices: Vec<Device>,
        chunk_sizes: Vec<usize>,
    },
}

impl DeviceStrategy {
    pub fn single(device: Device) -> Self {
        Self::Single(device)
    }

    pub fn replicated(devices: Vec<Device>, chunk_sizes: Vec<usize>) -> Result<Self, TrainingError> {
        if devices.len() < 2 {
            return Err(TrainingError::initialization(
                "replication requires at least two devices",
            ));
        }
        if devices.len() != chunk_sizes.len() {
            return Err(TrainingError::initialization(format!(
                "{} chunk size(s) given for {} devices",
                chunk_sizes.len(),
                devices.len()
            )));
        }
        if chunk_sizes.iter().any(|&size| size == 0) {
            return Err(TrainingError::initialization(
                "chunk sizes must be greater than zero",
            ));
        }
        Ok(Self::Replicated {
            devices,
            chunk_sizes,
        })
    }

    pub fn from_config(runtime: &RuntimeConfig) -> Result<Self, TrainingError> {
        let gpus = runtime.active_gpus();
        match gpus.as_slice() {
            [] => Ok(Self::Single(Device::Cpu)),
            [ordinal] => Ok(Self::Single(resolve_device(*ordinal))),
            ordinals => {
                let devices = ordinals.iter().map(|&ordinal| resolve_device(ordinal)).collect();
                Self::replicated(devices, runtime.chunk_sizes.clone())
            }
        }
    }

    pub fn primary(&self) -> &Device {
        match self {
            Self::Single(device) => device,
            Self::Replicated { devices, .. } => &devices[0],
        }
    }

    pub fn devices(&self) -> &[Device] {
        match self {
            Self::Single(device) => std::slice::from_ref(device),
            Self::Replicated { devices, .. } => devices,
        }
    }

    /// Copies `unit` onto the primary device and, when replicating, onto every
    /// other device.
    pub fn place<M, L>(
        &self,
        unit: &CompositeForwardUnit<M, L>,
    ) -> Result<PlacedUnit<M, L>, TrainingError>
    where
        M: Model,
        L: LossModule,
    {
        let primary = unit.to_device(self.primary()).map_err(to_runtime_error)?;
        primary.set_training(unit.is_training());

        match self {
            Self::Single(device) => {
                log::info!("placing model and loss on {:?}", device);
                Ok(PlacedUnit::Single(primary))
            }
            Self::Replicated {
                devices,
                chunk_sizes,
            } => {
                log::info!(
                    "replicating model and loss across {} devices (chunk sizes {:?})",
                    devices.len(),
                    chunk_sizes
                );
                let mut replicas = Vec::with_capacity(devices.len() - 1);
                for device in &devices[1..] {
                    let replica = primary.to_device(device).map_err(to_runtime_error)?;
                    replica.set_training(primary.is_training());
                    replicas.push(Replica {
                        device: device.clone(),
                        unit: replica,
                    });
                }
                Ok(PlacedUnit::Replicated(ReplicatedUnit {
                    primary,
                    primary_device: devices[0].clone(),
                    replicas,
                    chunk_sizes: chunk_sizes.clone(),
                }))
            }
        }
    }

    /// Rebinds `optimizer` to the placed primary parameters and moves its state
    /// to the primary device.
    pub fn migrate<M, L>(
        &self,
        optimizer: &mut TrainerOptimizer,
        placed: &PlacedUnit<M, L>,
    ) -> Result<(), TrainingError>
    where
        M: Model,
        L: LossModule,
    {
        optimizer.migrate(placed.primary().named_parameters(), self.primary())
    }

    /// Waits for outstanding work so evaluation starts from a drained device.
    pub fn release_cached_memory(&self) -> Result<(), TrainingError> {
        for device in self.devices() {
            device.synchronize().map_err(to_runtime_error)?;
        }
        log::debug!("synchronized {} device(s)", self.devices().len());
        Ok(())
    }
}

fn resolve_device(ordinal: usize) -> Device {
    if metal_is_available() {
        match Device::new_metal(ordinal) {
            Ok(device) => return device,
            Err(err) => log::warn!(
                "failed to initialize metal device #{}, falling back to CPU: {}",
                ordinal,
                err
            ),
        }
    } else if cuda_is_available() {
        match Device::new_cuda(ordinal) {
            Ok(device) => return device,
            Err(err) => log::warn!(
                "cuda reported available but device #{} failed to initialize: {}",
                ordinal,
                err
            ),
        }
    } else {
        log::warn!("no GPU backend available for device #{}; using CPU", ordinal);
    }
    Device::Cpu
}

/// Composite unit after placement.
#[derive(Debug)]
pub enum PlacedUnit<M, L> {
    Single(CompositeForwardUnit<M, L>),
    Replicated(ReplicatedUnit<M, L>),
}

impl<M, L> PlacedUnit<M, L>
where
    M: Model,
    L: LossModule,
{
    /// The unreplicated unit; its parameters are the ones the optimizer updates.
    pub fn primary(&self) -> &CompositeForwardUnit<M, L> {
        match self {
            Self::Single(unit) => unit,
            Self::Replicated(replicated) => &replicated.primary,
        }
    }

    pub fn is_replicated(&self) -> bool {
        matches!(self, Self::Replicated(_))
    }

    pub fn set_training(&self, training: bool) {
        match self {
            Self::Single(unit) => unit.set_training(training),
            Self::Replicated(replicated) => {
                replicated.primary.set_training(training);
                for replica in &replicated.replicas {
                    replica.unit.set_training(training);
                }
            }
        }
    }

    pub fn forward(&self, batch: &Batch) -> Result<ForwardOutput, TrainingError> {
        match self {
            Self::Single(unit) => unit.forward(batch),
            Self::Replicated(replicated) => replicated.forward(batch),
        }
    }

    /// Folds replica gradients into the entries of the primary parameters.
    pub fn reduce_gradients(&self, grads: &mut GradStore) -> Result<(), TrainingError> {
        match self {
            Self::Single(_) => Ok(()),
            Self::Replicated(replicated) => replicated.reduce_gradients(grads),
        }
    }
}

#[derive(Debug)]
struct Replica<M, L> {
    device: Device,
    unit: CompositeForwardUnit<M, L>,
}

#[derive(Debug)]
pub struct ReplicatedUnit<M, L> {
    primary: CompositeForwardUnit<M, L>,
    primary_device: Device,
    replicas: Vec<Replica<M, L>>,
    chunk_sizes: Vec<usize>,
}

impl<M, L> ReplicatedUnit<M, L>
where
    M: Model,
    L: LossModule,
{
    pub fn chunk_sizes(&self) -> &[usize] {
        &self.chunk_sizes
    }

    /// Runs one chunk per device and gathers the results on the primary device.
    /// The returned loss holds one entry per replica.
    pub fn forward(&self, batch: &Batch) -> Result<ForwardOutput, TrainingError> {
        self.broadcast_parameters()?;

        let chunks = batch.split(&self.chunk_sizes)?;
        let mut results = Vec::with_capacity(chunks.len());
        let mut chunks = chunks.into_iter();
        if let Some(first) = chunks.next() {
            let local = first.to_device(&self.primary_device)?;
            results.push(self.primary.forward(&local)?);
        }
        for (replica, chunk) in self.replicas.iter().zip(chunks) {
            let local = chunk.to_device(&replica.device)?;
            results.push(replica.unit.forward(&local)?);
        }

        self.gather(results)
    }

    fn gather(&self, results: Vec<ForwardOutput>) -> Result<ForwardOutput, TrainingError> {
        let device = &self.primary_device;
        let mut outputs = Vec::with_capacity(results.len());
        let mut losses = Vec::with_capacity(results.len());
        let mut gathered: BTreeMap<String, Vec<Tensor>> = BTreeMap::new();

        for result in results {
            outputs.push(result.output.to_device(device).map_err(to_runtime_error)?);
            let loss = result
                .loss
                .mean_all()
                .and_then(|loss| loss.reshape(1))
                .and_then(|loss| loss.to_device(device))
                .map_err(to_runtime_error)?;
            losses.push(loss);
            for (name, term) in result.terms {
                let entry = gathered.entry(name).or_default();
                if let LossTerm::Active(value) = term {
                    let value = value
                        .flatten_all()
                        .and_then(|value| value.to_device(device))
                        .map_err(to_runtime_error)?;
                    entry.push(value);
                }
            }
        }

        let output = Tensor::cat(&outputs, 0).map_err(to_runtime_error)?;
        let loss = Tensor::cat(&losses, 0).map_err(to_runtime_error)?;
        let mut terms = LossTermMap::new();
        for (name, values) in gathered {
            let term = if values.is_empty() {
                LossTerm::Inactive
            } else {
                LossTerm::Active(Tensor::cat(&values, 0).map_err(to_runtime_error)?)
            };
            terms.insert(name, term);
        }

        Ok(ForwardOutput {
            output,
            loss,
            terms,
        })
    }

    fn broadcast_parameters(&self) -> Result<(), TrainingError> {
        let source = self.primary.named_parameters();
        for replica in &self.replicas {
            for ((_, from), (_, to)) in source.iter().zip(replica.unit.named_parameters()) {
                if from.as_tensor().id() == to.as_tensor().id() {
                    continue;
                }
                let value = from
                    .as_tensor()
                    .to_device(&replica.device)
                    .map_err(to_runtime_error)?;
                to.set(&value).map_err(to_runtime_error)?;
            }
        }
        Ok(())
    }

    fn reduce_gradients(&self, grads: &mut GradStore) -> Result<(), TrainingError> {
        let primary: Vec<Var> = self
            .primary
            .named_parameters()
            .into_iter()
            .map(|(_, var)| var)
            .collect();
        for replica in &self.replicas {
            for (target, (_, source)) in primary.iter().zip(replica.unit.named_parameters()) {
                // Shared storage means backprop already summed into one entry.
                if target.as_tensor().id() == source.as_tensor().id() {
                    continue;
                }
                let Some(grad) = grads.remove(source.as_tensor()) else {
                    continue;
                };
                let grad = grad
                    .to_device(&self.primary_device)
                    .map_err(to_runtime_error)?;
                let combined = match grads.remove(target.as_tensor()) {
                    Some(existing) => existing.add(&grad).map_err(to_runtime_error)?,
                    None => grad,
                };
                grads.insert(target.as_tensor(), combined);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_marker_selects_single_cpu_device() {
        let strategy = DeviceStrategy::from_config(&RuntimeConfig::default()).unwrap();
        assert!(matches!(strategy, DeviceStrategy::Single(Device::Cpu)));
        assert_eq!(strategy.devices().len(), 1);
    }

    #[test]
    fn replication_needs_one_chunk_per_device() {
        let err = DeviceStrategy::replicated(vec![Device::Cpu, Device::Cpu], vec![4]).unwrap_err();
        assert!(matches!(err, TrainingError::Initialization(_)));
        let err = DeviceStrategy::replicated(vec![Device::Cpu], vec![4]).unwrap_err();
        assert!(matches!(err, TrainingError::Initialization(_)));
    }

    #[test]
    fn primary_is_first_replicated_device() {
        let strategy =
            DeviceStrategy::replicated(vec![Device::Cpu, Device::Cpu], vec![3, 3]).unwrap();
        assert!(strategy.primary().is_cpu());
        assert_eq!(strategy.devices().len(), 2);
        strategy.release_cached_memory().unwrap();
    }
}
