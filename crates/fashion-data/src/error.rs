use std::path::PathBuf;

use crate::datamodule::Split;

/// All errors that can occur while loading fashion samples.
///
/// Configuration problems, missing files, decode failures and tensor shape
/// mismatches all funnel into this one enum so callers can propagate with `?`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A configuration value is out of range (e.g. `batch_size == 0`).
    #[error("invalid config: {field} {reason}")]
    InvalidConfig {
        field: &'static str,
        reason: &'static str,
    },

    /// The split directory does not exist or is not a directory.
    #[error("not a directory: {}", .0.display())]
    NotADirectory(PathBuf),

    /// A split directory contained no usable image files.
    #[error("no samples for split '{split}' in {}", .dir.display())]
    NoSamples { split: String, dir: PathBuf },

    /// An image has no caption/embedding sidecar next to it.
    #[error("missing sidecar {}", .0.display())]
    MissingSidecar(PathBuf),

    /// A precomputed embedding does not have the configured dimensionality.
    #[error("embedding {} has {got} values, expected {expected}", .path.display())]
    EmbeddingDimension {
        path: PathBuf,
        expected: usize,
        got: usize,
    },

    /// Image decoding failed.
    #[error("failed to decode {}: {source}", .path.display())]
    ImageDecode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// A transform received a frame of the wrong kind.
    #[error("{transform}: expected {expected} frame")]
    FrameKind {
        transform: &'static str,
        expected: &'static str,
    },

    /// Collation was asked to build a batch out of nothing.
    #[error("cannot collate an empty batch")]
    EmptyBatch,

    /// A loader was requested before `setup` built the split.
    #[error("split '{0}' is not set up; call setup() first")]
    StageNotReady(Split),

    /// A prefetch worker exited before delivering all of its batches.
    #[error("prefetch worker exited with {remaining} batches undelivered")]
    WorkerDisconnected { remaining: usize },

    /// `Normalize` statistics do not cover every channel of the tensor.
    #[error("tensor has {got} channels, normalize mean/std have {mean}/{std}")]
    ChannelMismatch { got: usize, mean: usize, std: usize },

    #[error(transparent)]
    Tensor(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Convenience Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

