pub mod batch;
pub mod config;
pub mod data;
pub mod device;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod module;
pub mod optimizer;
pub mod progress;
pub mod task;
pub mod trainer;
pub mod unit;

pub use batch::{Batch, INPUT_FIELD};
pub use config::{TrainingConfig, TrainingError};
pub use data::{EpochDataset, InputSize, Sample, TensorDataset, DEFAULT_INPUT_SIZES};
pub use device::{DeviceStrategy, PlacedUnit};
pub use logging::{Logger, LoggingSettings};
pub use loss::{LossModule, LossOutput, LossTerm, LossTermMap};
pub use metrics::{AverageMeter, EpochMetrics, TIME_KEY};
pub use module::{Model, Module};
pub use optimizer::{
    OptimizerConfig, OptimizerState, ParameterGroup, TrainerOptimizer, TrainerOptimizerOptions,
};
pub use progress::{BarSink, PrintSink, ProgressSink};
pub use task::{ResultMap, Task};
pub use trainer::{EpochOutcome, EpochRunner, Phase};
pub use unit::{CompositeForwardUnit, ForwardOutput};
