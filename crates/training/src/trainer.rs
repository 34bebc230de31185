use std::time::Instant;

use candle_core::Device;

use crate::{
    batch::Batch,
    config::{self, to_runtime_error},
    data::{input_size_for, next_batch_blocking, EpochDataset},
    device::{DeviceStrategy, PlacedUnit},
    logging::Logger,
    metrics::{AverageMeter, EpochMetrics, LossMeters, TIME_KEY},
    module::Module,
    optimizer::{OptimizerConfig, TrainerOptimizer, TrainerOptimizerOptions},
    progress::{default_sink, ProgressReporter, ProgressSink, StatusLine},
    task::{ResultMap, Task},
    unit::{CompositeForwardUnit, ForwardOutput},
    TrainingConfig, TrainingError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Train,
    Eval,
}

impl Phase {
    /// Label used in status lines and metric tags.
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Train => "train",
            Phase::Eval => "val",
        }
    }

    pub fn tracks_gradients(self) -> bool {
        matches!(self, Phase::Train)
    }

    pub fn steps_optimizer(self) -> bool {
        matches!(self, Phase::Train)
    }

    /// Evaluation bypasses replication and runs the primary unit directly.
    pub fn unwraps_replicas(self) -> bool {
        matches!(self, Phase::Eval)
    }
}

/// Result of one pass over a dataset.
#[derive(Debug, Clone)]
pub struct EpochOutcome {
    pub metrics: EpochMetrics,
    /// Filled by [`Task::save_result`] in test mode; empty otherwise.
    pub results: ResultMap,
    pub batches: usize,
}

/// Drives train and validation epochs for one task.
///
/// The runner owns the placed model and loss, the optimizer and the device
/// strategy. Every epoch runs sequentially on the calling thread; replicated
/// placements fan each step out across devices and gather on the primary.
pub struct EpochRunner<T: Task> {
    config: TrainingConfig,
    task: T,
    metric_keys: Vec<String>,
    strategy: DeviceStrategy,
    unit: PlacedUnit<T::Model, T::Loss>,
    optimizer: Option<TrainerOptimizer>,
    progress: Box<dyn ProgressSink>,
    logger: Option<Logger>,
}

impl<T: Task> EpochRunner<T> {
    /// Resolves the task's loss module, fuses it with `model` and, when an
    /// optimizer configuration is given, builds the optimizer over both the
    /// model and loss parameter groups.
    pub fn new(
        config: TrainingConfig,
        model: T::Model,
        task: T,
        optimizer_config: Option<config::OptimizerConfig>,
    ) -> Result<Self, TrainingError> {
        config.validate()?;

        let (metric_keys, loss) = task.resolve_losses(&config)?;
        if metric_keys.is_empty() {
            return Err(TrainingError::initialization(
                "task must report at least one metric key",
            ));
        }
        if metric_keys.iter().any(|key| key == TIME_KEY) {
            return Err(TrainingError::initialization(format!(
                "metric key '{}' is reserved for the epoch wall time",
                TIME_KEY
            )));
        }
        let unit = CompositeForwardUnit::new(model, loss);

        let optimizer = match optimizer_config.as_ref() {
            Some(cfg) => {
                let groups = unit.parameter_groups();
                for group in &groups {
                    log::debug!(
                        "parameter group '{}' with {} tensor(s)",
                        group.name,
                        group.parameters.len()
                    );
                }
                Some(TrainerOptimizer::new(
                    groups,
                    OptimizerConfig::from(cfg),
                    TrainerOptimizerOptions::from(cfg),
                )?)
            }
            None => None,
        };

        let device = unit
            .named_parameters()
            .first()
            .map(|(_, var)| var.device().clone())
            .unwrap_or(Device::Cpu);

        let prefix = format!("{}/{}", config.task, config.exp_id);
        let progress = default_sink(prefix, config.runtime.print_iter);
        let logger = Some(Logger::from_config(&config.logging)?);

        log::info!(
            "epoch runner ready: task={} metrics={:?} optimizer={}",
            config.task,
            metric_keys,
            optimizer.is_some()
        );

        Ok(Self {
            config,
            task,
            metric_keys,
            strategy: DeviceStrategy::Single(device),
            unit: PlacedUnit::Single(unit),
            optimizer,
            progress,
            logger,
        })
    }

    /// Places the unit according to `strategy` and moves the optimizer along.
    pub fn set_device(&mut self, strategy: DeviceStrategy) -> Result<(), TrainingError> {
        let placed = strategy.place(self.unit.primary())?;
        if let Some(optimizer) = self.optimizer.as_mut() {
            strategy.migrate(optimizer, &placed)?;
        }
        self.unit = placed;
        self.strategy = strategy;
        Ok(())
    }

    pub fn set_progress_sink(&mut self, sink: Box<dyn ProgressSink>) {
        self.progress = sink;
    }

    pub fn set_logger(&mut self, logger: Option<Logger>) {
        self.logger = logger;
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn metric_keys(&self) -> &[String] {
        &self.metric_keys
    }

    pub fn task(&self) -> &T {
        &self.task
    }

    pub fn task_mut(&mut self) -> &mut T {
        &mut self.task
    }

    pub fn strategy(&self) -> &DeviceStrategy {
        &self.strategy
    }

    pub fn unit(&self) -> &PlacedUnit<T::Model, T::Loss> {
        &self.unit
    }

    pub fn optimizer(&self) -> Option<&TrainerOptimizer> {
        self.optimizer.as_ref()
    }

    pub fn optimizer_mut(&mut self) -> Option<&mut TrainerOptimizer> {
        self.optimizer.as_mut()
    }

    pub fn train<D>(&mut self, epoch: usize, dataset: &mut D) -> Result<EpochOutcome, TrainingError>
    where
        D: EpochDataset + ?Sized,
    {
        self.run_epoch(Phase::Train, epoch, dataset)
    }

    pub fn val<D>(&mut self, epoch: usize, dataset: &mut D) -> Result<EpochOutcome, TrainingError>
    where
        D: EpochDataset + ?Sized,
    {
        self.run_epoch(Phase::Eval, epoch, dataset)
    }

    pub fn run_epoch<D>(
        &mut self,
        phase: Phase,
        epoch: usize,
        dataset: &mut D,
    ) -> Result<EpochOutcome, TrainingError>
    where
        D: EpochDataset + ?Sized,
    {
        if phase.steps_optimizer() && self.optimizer.is_none() {
            return Err(TrainingError::initialization(
                "training requires an optimizer configuration",
            ));
        }

        if phase.unwraps_replicas() {
            self.unit.primary().set_training(false);
            self.strategy.release_cached_memory()?;
        } else {
            self.unit.set_training(true);
        }

        let runtime = &self.config.runtime;
        let total = runtime.iteration_bound(dataset.len());
        let mut meters = LossMeters::new(self.metric_keys.iter().cloned());
        let mut data_time = AverageMeter::new();
        let mut batch_time = AverageMeter::new();
        let mut results = ResultMap::new();
        let mut processed = 0;

        dataset.begin_epoch()?;
        let mut reporter = ProgressReporter::begin(self.progress.as_mut(), runtime.print_iter, total);
        let epoch_start = Instant::now();
        let mut end = Instant::now();

        for batch_index in 0..total {
            let Some(batch) = next_batch_blocking(dataset)? else {
                log::warn!(
                    "data source ended after {} of {} batches",
                    batch_index,
                    total
                );
                break;
            };
            data_time.update_duration(end.elapsed());

            let batch = batch.to_device(self.strategy.primary())?;
            let forward = execute_step(&self.unit, self.optimizer.as_mut(), phase, &batch)?;

            let updated = meters.observe(&forward.terms, batch.batch_size()?)?;
            batch_time.update_duration(end.elapsed());
            end = Instant::now();

            let mut line = StatusLine::new(
                phase.as_str(),
                epoch,
                batch_index,
                total,
                epoch_start.elapsed(),
            );
            for index in updated {
                if let Some((name, meter)) = meters.entry(index) {
                    line = line.metric(name, meter.avg);
                }
            }
            line = line.input_size(input_size_for(&*dataset, batch_index)?);
            if !runtime.hide_data_time {
                line = line.timing(&data_time, &batch_time);
            }
            reporter.report(batch_index, line.as_str());

            if runtime.debug > 0 {
                log::debug!("debug hook for batch {}", batch_index);
                self.task.debug(&batch, &forward.output, batch_index)?;
            }
            if runtime.test {
                self.task.save_result(&forward.output, &batch, &mut results)?;
            }
            processed += 1;
        }
        reporter.finish();

        dataset.rand_scale()?;
        dataset.shuffle()?;

        let metrics = meters.finalize(epoch_start.elapsed());
        if let Some(logger) = self.logger.as_mut() {
            logger.log_epoch(phase.as_str(), epoch, &metrics);
        }
        log::info!(
            "{} epoch {} finished after {} batch(es)",
            phase.as_str(),
            epoch,
            processed
        );

        Ok(EpochOutcome {
            metrics,
            results,
            batches: processed,
        })
    }
}

/// Forward pass, plus backward and optimizer step when `phase` trains.
fn execute_step<M, L>(
    unit: &PlacedUnit<M, L>,
    optimizer: Option<&mut TrainerOptimizer>,
    phase: Phase,
    batch: &Batch,
) -> Result<ForwardOutput, TrainingError>
where
    M: crate::module::Model,
    L: crate::loss::LossModule,
{
    let mut forward = if phase.unwraps_replicas() {
        unit.primary().forward(batch)?
    } else {
        unit.forward(batch)?
    };
    forward.loss = forward.loss.mean_all().map_err(to_runtime_error)?;

    if phase.tracks_gradients() {
        let mut grads = forward.loss.backward().map_err(to_runtime_error)?;
        unit.reduce_gradients(&mut grads)?;
        if let Some(optimizer) = optimizer {
            optimizer.step(&mut grads)?;
        }
    }

    Ok(forward)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_decisions() {
        assert!(Phase::Train.tracks_gradients());
        assert!(Phase::Train.steps_optimizer());
        assert!(!Phase::Train.unwraps_replicas());

        assert!(!Phase::Eval.tracks_gradients());
        assert!(!Phase::Eval.steps_optimizer());
        assert!(Phase::Eval.unwraps_replicas());
    }

    #[test]
    fn phase_labels() {
        assert_eq!(Phase::Train.as_str(), "train");
        assert_eq!(Phase::Eval.as_str(), "val");
    }
}
