use serde::{Deserialize, Serialize};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default = "default_task")]
    pub task: String,
    #[serde(default = "default_exp_id")]
    pub exp_id: String,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            task: default_task(),
            exp_id: default_exp_id(),
            runtime: RuntimeConfig::default(),
            optimizer: OptimizerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::from_path(path)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.task.trim().is_empty() {
            errors.push("task must not be empty".to_string());
        }

        let gpus = self.runtime.active_gpus();
        if gpus.len() > 1 {
            if self.runtime.chunk_sizes.len() != gpus.len() {
                errors.push(format!(
                    "runtime.chunk_sizes must list one entry per gpu (got {} for {} gpus)",
                    self.runtime.chunk_sizes.len(),
                    gpus.len()
                ));
            }
            if self.runtime.chunk_sizes.iter().any(|&size| size == 0) {
                errors.push("runtime.chunk_sizes entries must be greater than 0".to_string());
            }
        }

        if self.runtime.gpus.iter().any(|&gpu| gpu < -1) {
            errors.push("runtime.gpus entries must be >= -1".to_string());
        }

        if self.optimizer.learning_rate <= 0.0 {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }

        if self.optimizer.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }

        if !(0.0 < self.optimizer.beta1 && self.optimizer.beta1 < 1.0) {
            errors.push("optimizer.beta1 must be in (0, 1)".to_string());
        }

        if !(0.0 < self.optimizer.beta2 && self.optimizer.beta2 < 1.0) {
            errors.push("optimizer.beta2 must be in (0, 1)".to_string());
        }

        if !(0.0..1.0).contains(&self.optimizer.momentum) {
            errors.push("optimizer.momentum must be in [0, 1)".to_string());
        }

        if let Some(max_norm) = self.optimizer.max_grad_norm {
            if max_norm <= 0.0 {
                errors.push("optimizer.max_grad_norm must be greater than 0".to_string());
            }
        }

        if let Some(dir) = &self.logging.tensorboard {
            if dir.as_os_str().is_empty() {
                errors.push("logging.tensorboard must not be empty".to_string());
            }
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    fn apply_base_path(&mut self, base: &Path) {
        if let Some(dir) = self.logging.tensorboard.as_mut() {
            absolutize_in_place(dir, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Device ordinals; empty or `[-1]` selects the CPU.
    #[serde(default = "default_gpus")]
    pub gpus: Vec<i32>,
    /// Per-device slice of each batch when more than one device is requested.
    #[serde(default)]
    pub chunk_sizes: Vec<usize>,
    /// Batches per epoch; negative means the full dataset.
    #[serde(default = "default_num_iters")]
    pub num_iters: i64,
    /// Print a status line every `print_iter` batches; non-positive shows a live bar instead.
    #[serde(default)]
    pub print_iter: i64,
    #[serde(default)]
    pub hide_data_time: bool,
    #[serde(default)]
    pub test: bool,
    #[serde(default)]
    pub debug: u32,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            gpus: default_gpus(),
            chunk_sizes: Vec::new(),
            num_iters: default_num_iters(),
            print_iter: 0,
            hide_data_time: false,
            test: false,
            debug: 0,
            seed: default_seed(),
        }
    }
}

impl RuntimeConfig {
    /// Requested device ordinals with the CPU marker filtered out.
    pub fn active_gpus(&self) -> Vec<usize> {
        self.gpus
            .iter()
            .filter(|&&gpu| gpu >= 0)
            .map(|&gpu| gpu as usize)
            .collect()
    }

    /// Iteration bound for a data source holding `len` batches.
    pub fn iteration_bound(&self, len: usize) -> usize {
        if self.num_iters < 0 {
            len
        } else {
            (self.num_iters as usize).min(len)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default)]
    pub algorithm: OptimizerType,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,
    #[serde(default)]
    pub weight_decay: f32,
    #[serde(default = "default_beta1")]
    pub beta1: f32,
    #[serde(default = "default_beta2")]
    pub beta2: f32,
    #[serde(default = "default_adam_eps")]
    pub epsilon: f32,
    #[serde(default)]
    pub momentum: f32,
    #[serde(default)]
    pub max_grad_norm: Option<f32>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            algorithm: OptimizerType::default(),
            learning_rate: default_learning_rate(),
            weight_decay: 0.0,
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_adam_eps(),
            momentum: 0.0,
            max_grad_norm: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerType {
    AdamW,
    Adam,
    Sgd,
}

impl Default for OptimizerType {
    fn default() -> Self {
        Self::Adam
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_enable_stdout")]
    pub enable_stdout: bool,
    #[serde(default)]
    pub tensorboard: Option<PathBuf>,
    #[serde(default = "default_tensorboard_flush_every_n")]
    pub tensorboard_flush_every_n: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enable_stdout: default_enable_stdout(),
            tensorboard: None,
            tensorboard_flush_every_n: default_tensorboard_flush_every_n(),
        }
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_task() -> String {
    "mot".to_string()
}

fn default_exp_id() -> String {
    "default".to_string()
}

fn default_gpus() -> Vec<i32> {
    vec![-1]
}

fn default_num_iters() -> i64 {
    -1
}

fn default_seed() -> u64 {
    317
}

fn default_learning_rate() -> f32 {
    1e-4
}

fn default_beta1() -> f32 {
    0.9
}

fn default_beta2() -> f32 {
    0.999
}

fn default_adam_eps() -> f32 {
    1e-8
}

fn default_enable_stdout() -> bool {
    true
}

fn default_tensorboard_flush_every_n() -> usize {
    1
}

#[derive(Debug)]
pub enum TrainingError {
    Io(std::io::Error),
    ConfigFormat(String),
    Validation(Vec<String>),
    Initialization(String),
    Runtime(String),
    NotImplemented(&'static str),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }

    pub fn not_implemented(hook: &'static str) -> Self {
        Self::NotImplemented(hook)
    }
}

impl fmt::Display for TrainingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingError::Io(err) => write!(f, "failed to read config: {}", err),
            TrainingError::ConfigFormat(err) => write!(f, "failed to parse config: {}", err),
            TrainingError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            TrainingError::Initialization(msg) => {
                write!(f, "trainer initialization failed: {}", msg)
            }
            TrainingError::Runtime(msg) => write!(f, "training failed: {}", msg),
            TrainingError::NotImplemented(hook) => {
                write!(f, "task does not implement the `{}` hook", hook)
            }
        }
    }
}

impl std::error::Error for TrainingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrainingError::Io(err) => Some(err),
            TrainingError::ConfigFormat(_) => None,
            TrainingError::Validation(_) => None,
            TrainingError::Initialization(_)
            | TrainingError::Runtime(_)
            | TrainingError::NotImplemented(_) => None,
        }
    }
}

impl From<std::io::Error> for TrainingError {
    fn from(value: std::io::Error) -> Self {
        TrainingError::Io(value)
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

pub(crate) fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
