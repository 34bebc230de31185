use candle_core::{Device, Result, Tensor, Var};

/// Trainable component whose parameters the trainer places and optimizes.
pub trait Module {
    /// Parameters in a stable order; names must be unique within the module.
    fn named_parameters(&self) -> Vec<(String, Var)>;

    /// Toggles stochastic training behavior such as dropout and batch statistics.
    fn set_training(&self, training: bool);

    fn is_training(&self) -> bool;

    /// Builds a copy of the module whose parameters live on `device`.
    fn to_device(&self, device: &Device) -> Result<Self>
    where
        Self: Sized;
}

/// Backbone producing one tensor per output stage; the last stage is the prediction.
pub trait Model: Module {
    fn forward(&self, input: &Tensor) -> Result<Vec<Tensor>>;
}
