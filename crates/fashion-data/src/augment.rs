// Image Augmentation — random transforms for data augmentation
//
// Augmentations accept either frame kind. Tensor frames are treated as images
// in [C, H, W] layout (channel-first, row-major).

use candle_core::{Tensor, D};
use rand::thread_rng;
use rand::Rng;

use crate::error::Result;
use crate::transform::{Frame, Transform};

// RandomHorizontalFlip

/// Randomly mirror an image left-to-right with probability `p`.
///
/// The coin is tossed independently on every call, so the same sample may be
/// flipped in one pass and not in the next.
#[derive(Debug, Clone)]
pub struct RandomHorizontalFlip {
    pub p: f64,
}

impl RandomHorizontalFlip {
    pub fn new(p: f64) -> Self {
        Self { p }
    }
}

impl Default for RandomHorizontalFlip {
    fn default() -> Self {
        Self::new(0.5)
    }
}

impl Transform for RandomHorizontalFlip {
    fn apply(&self, frame: Frame) -> Result<Frame> {
        let mut rng = thread_rng();
        if rng.gen::<f64>() >= self.p {
            return Ok(frame);
        }
        match frame {
            Frame::Image(img) => Ok(Frame::Image(img.fliph())),
            Frame::Tensor(t) => Ok(Frame::Tensor(flip_last_dim(&t)?)),
        }
    }
}

/// Reverse the order of the last (width) dimension.
pub(crate) fn flip_last_dim(t: &Tensor) -> Result<Tensor> {
    let w = t.dim(D::Minus1)?;
    let reversed: Vec<u32> = (0..w as u32).rev().collect();
    let idx = Tensor::from_vec(reversed, w, t.device())?;
    Ok(t.index_select(&idx, t.rank() - 1)?)
}

// Tests
