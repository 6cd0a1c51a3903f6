// Transform — image preprocessing pipeline
//
// A pipeline starts from a decoded image and must end in a tensor:
//
//   Resize -> [augmentations] -> ToTensor -> Normalize
//
// Transforms before ToTensor see `Frame::Image`, transforms after it see
// `Frame::Tensor`. Feeding the wrong kind is an error, not a silent no-op.

use candle_core::{Device, Tensor};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};

use crate::error::{Error, Result};

/// The value flowing through a preprocessing pipeline.
#[derive(Debug, Clone)]
pub enum Frame {
    /// Decoded pixels.
    Image(DynamicImage),
    /// Float tensor in `[C, H, W]` layout.
    Tensor(Tensor),
}

impl Frame {
    /// Unwrap the final tensor of a pipeline.
    pub fn into_tensor(self) -> Result<Tensor> {
        match self {
            Frame::Tensor(t) => Ok(t),
            Frame::Image(_) => Err(Error::FrameKind {
                transform: "pipeline output",
                expected: "tensor",
            }),
        }
    }
}

/// A transform applied to each image before batching.
pub trait Transform: Send + Sync {
    /// Apply the transform to a frame, returning the modified frame.
    fn apply(&self, frame: Frame) -> Result<Frame>;
}

// Built-in transforms

/// Resize to exactly `(width, height)` with bilinear filtering.
#[derive(Debug, Clone)]
pub struct Resize {
    pub width: u32,
    pub height: u32,
}

impl Resize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Square output of side `size`.
    pub fn square(size: u32) -> Self {
        Self::new(size, size)
    }
}

impl Transform for Resize {
    fn apply(&self, frame: Frame) -> Result<Frame> {
        match frame {
            Frame::Image(img) if img.dimensions() == (self.width, self.height) => {
                Ok(Frame::Image(img))
            }
            Frame::Image(img) => Ok(Frame::Image(img.resize_exact(
                self.width,
                self.height,
                FilterType::Triangle,
            ))),
            Frame::Tensor(_) => Err(Error::FrameKind {
                transform: "Resize",
                expected: "image",
            }),
        }
    }
}

/// Convert an RGB image to an `f32` tensor `[3, H, W]` with values in [0, 1].
#[derive(Debug, Clone, Default)]
pub struct ToTensor;

impl Transform for ToTensor {
    fn apply(&self, frame: Frame) -> Result<Frame> {
        let img = match frame {
            Frame::Image(img) => img,
            Frame::Tensor(_) => {
                return Err(Error::FrameKind {
                    transform: "ToTensor",
                    expected: "image",
                })
            }
        };
        let (w, h) = img.dimensions();
        let rgb = img.to_rgb8();
        let raw = rgb.as_raw();

        // [H, W, C] interleaved -> [C, H, W] planar
        let npix = w as usize * h as usize;
        let mut data = vec![0.0f32; 3 * npix];
        for i in 0..npix {
            data[i] = raw[i * 3] as f32 / 255.0;
            data[npix + i] = raw[i * 3 + 1] as f32 / 255.0;
            data[2 * npix + i] = raw[i * 3 + 2] as f32 / 255.0;
        }
        let t = Tensor::from_vec(data, (3, h as usize, w as usize), &Device::Cpu)?;
        Ok(Frame::Tensor(t))
    }
}

/// Per-channel standardization: `x' = (x - mean[c]) / std[c]`.
#[derive(Debug, Clone)]
pub struct Normalize {
    pub mean: Vec<f32>,
    pub std: Vec<f32>,
}

impl Normalize {
    pub fn new(mean: Vec<f32>, std: Vec<f32>) -> Self {
        Self { mean, std }
    }
}

impl Transform for Normalize {
    fn apply(&self, frame: Frame) -> Result<Frame> {
        let t = match frame {
            Frame::Tensor(t) => t,
            Frame::Image(_) => {
                return Err(Error::FrameKind {
                    transform: "Normalize",
                    expected: "tensor",
                })
            }
        };
        let channels = t.dim(0)?;
        if channels != self.mean.len() || channels != self.std.len() {
            return Err(Error::ChannelMismatch {
                got: channels,
                mean: self.mean.len(),
                std: self.std.len(),
            });
        }
        let mean = Tensor::from_slice(&self.mean, (channels, 1, 1), t.device())?;
        let std = Tensor::from_slice(&self.std, (channels, 1, 1), t.device())?;
        Ok(Frame::Tensor(t.broadcast_sub(&mean)?.broadcast_div(&std)?))
    }
}

/// Chain multiple transforms.
pub struct Compose {
    transforms: Vec<Box<dyn Transform>>,
}

impl Compose {
    pub fn new(transforms: Vec<Box<dyn Transform>>) -> Self {
        Self { transforms }
    }

    /// Run the pipeline on a decoded image and return the final tensor.
    pub fn run(&self, img: DynamicImage) -> Result<Tensor> {
        self.apply(Frame::Image(img))?.into_tensor()
    }
}

impl Transform for Compose {
    fn apply(&self, mut frame: Frame) -> Result<Frame> {
        for t in &self.transforms {
            frame = t.apply(frame)?;
        }
        Ok(frame)
    }
}
