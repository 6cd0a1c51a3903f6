//! # fashion-data
//!
//! Image/caption data loading for text-conditioned image generators.
//!
//! This crate provides:
//! - [`Dataset`] trait — indexed source of [`Sample`]s (image, text embedding, prompt)
//! - [`collate`] — stacks samples into a [`Batch`] along a new leading axis
//! - [`DataLoader`] — batching, per-pass shuffling, drop-last, worker prefetch
//! - [`DataModule`] — train/test splits, preprocessing pipelines and loaders
//   - Preprocessing transforms — Resize, ToTensor, Normalize, Compose
//   - Augmentation — RandomHorizontalFlip
//   - CaptionFolder (image + `.txt` caption + `.npy` embedding per sample)

pub mod augment;
pub mod caption_folder;
pub mod collate;
pub mod datamodule;
pub mod dataset;
pub mod error;
pub mod loader;
pub mod transform;

pub use augment::RandomHorizontalFlip;
pub use caption_folder::{CaptionFolder, CaptionFolderBuilder};
pub use collate::collate;
pub use datamodule::{
    test_transform, train_transform, CaptionFolderSource, DataModule, DataModuleConfig,
    SourceFactory, Split, SplitRequest, Stage,
};
pub use dataset::{Batch, Dataset, Sample};
pub use error::{Error, Result};
pub use loader::{BatchIterator, DataLoader, DataLoaderConfig};
pub use transform::{Compose, Frame, Normalize, Resize, ToTensor, Transform};
