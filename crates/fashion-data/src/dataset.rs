// Dataset trait — unified interface for any caption/image source

use candle_core::Tensor;

use crate::error::Result;

/// A single training sample: a preprocessed image, its precomputed text
/// embedding and the caption the embedding was computed from.
#[derive(Debug, Clone)]
pub struct Sample {
    /// Image tensor in `[C, H, W]` layout.
    pub image: Tensor,
    /// Text embedding with `text_dimension` elements.
    pub text_embedding: Tensor,
    /// Raw caption.
    pub prompt: String,
}

/// A stacked group of samples.
///
/// `image` and `text_embedding` carry a leading batch dimension and
/// `prompt[i]` belongs to row `i` of both tensors.
#[derive(Debug, Clone)]
pub struct Batch {
    pub image: Tensor,
    pub text_embedding: Tensor,
    pub prompt: Vec<String>,
}

impl Batch {
    /// Number of samples in the batch.
    pub fn len(&self) -> usize {
        self.prompt.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prompt.is_empty()
    }
}

/// A dataset is an indexed collection of samples.
///
/// Implementations must be `Send + Sync` so the loader can read from worker
/// threads. Every sample of one dataset must share image shape and embedding
/// length, otherwise collation fails.
pub trait Dataset: Send + Sync {
    /// Total number of samples in the dataset.
    fn len(&self) -> usize;

    /// Whether the dataset is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load the sample at position `index`.
    ///
    /// # Panics
    /// May panic if `index >= self.len()`.
    fn get(&self, index: usize) -> Result<Sample>;

    /// Optional human-readable name.
    fn name(&self) -> &str {
        "dataset"
    }
}
