use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::{batch::Batch, TrainingError};

pub mod memory;

pub use memory::{Sample, TensorDataset};

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;

/// Network input resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSize {
    pub width: u32,
    pub height: u32,
}

impl InputSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Resolutions used when a dataset does not carry its own multi-scale table.
pub const DEFAULT_INPUT_SIZES: [InputSize; 15] = [
    InputSize::new(640, 320),
    InputSize::new(672, 352),
    InputSize::new(704, 384),
    InputSize::new(736, 416),
    InputSize::new(768, 448),
    InputSize::new(800, 480),
    InputSize::new(832, 512),
    InputSize::new(864, 544),
    InputSize::new(896, 576),
    InputSize::new(928, 608),
    InputSize::new(960, 640),
    InputSize::new(992, 672),
    InputSize::new(1064, 704),
    InputSize::new(1064, 608),
    InputSize::new(1088, 608),
];

/// Batched data source consumed by the epoch loop.
///
/// Iteration goes through [`EpochDataset::next_batch`] so loaders backed by a
/// background producer can be awaited; the epoch loop drives it with
/// [`next_batch_blocking`]. The two mutators only change what the next pass
/// yields.
pub trait EpochDataset: Send {
    /// Number of batches in one full pass.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rewinds iteration to the first batch of the current order.
    fn begin_epoch(&mut self) -> Result<()>;

    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<Batch>>>;

    /// Scale index of the batch at `batch_index` in the current pass.
    fn scale_index(&self, batch_index: usize) -> usize;

    /// Dataset specific resolution table; `None` selects [`DEFAULT_INPUT_SIZES`].
    fn input_multi_scales(&self) -> Option<&[InputSize]> {
        None
    }

    /// Draws a new batch-to-scale assignment for the next pass.
    fn rand_scale(&mut self) -> Result<()>;

    /// Draws a new example order for the next pass.
    fn shuffle(&mut self) -> Result<()>;
}

pub fn next_batch_blocking<D>(dataset: &mut D) -> Result<Option<Batch>>
where
    D: EpochDataset + ?Sized,
{
    futures::executor::block_on(dataset.next_batch())
}

/// Input resolution of the batch at `batch_index`.
pub fn input_size_for<D>(dataset: &D, batch_index: usize) -> Result<InputSize>
where
    D: EpochDataset + ?Sized,
{
    let scale = dataset.scale_index(batch_index);
    let table = dataset
        .input_multi_scales()
        .unwrap_or(DEFAULT_INPUT_SIZES.as_slice());
    table.get(scale).copied().ok_or_else(|| {
        TrainingError::runtime(format!(
            "scale index {} out of range for {} input sizes",
            scale,
            table.len()
        ))
    })
}
