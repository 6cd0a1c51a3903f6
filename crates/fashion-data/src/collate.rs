// Collation — stack individually loaded samples into one batch

use candle_core::Tensor;

use crate::dataset::{Batch, Sample};
use crate::error::{Error, Result};

/// Stack `samples` along a new leading dimension.
///
/// Row `i` of both tensors and `prompt[i]` come from `samples[i]`. Samples that
/// disagree in image shape or embedding length make the stack fail with the
/// tensor library's shape error.
pub fn collate(samples: Vec<Sample>) -> Result<Batch> {
    if samples.is_empty() {
        return Err(Error::EmptyBatch);
    }

    let mut images = Vec::with_capacity(samples.len());
    let mut embeddings = Vec::with_capacity(samples.len());
    let mut prompt = Vec::with_capacity(samples.len());
    for s in samples {
        images.push(s.image);
        embeddings.push(s.text_embedding);
        prompt.push(s.prompt);
    }

    Ok(Batch {
        image: Tensor::stack(&images, 0)?,
        text_embedding: Tensor::stack(&embeddings, 0)?,
        prompt,
    })
}
