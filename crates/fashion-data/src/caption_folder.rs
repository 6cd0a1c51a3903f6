// CaptionFolder — Directory-based image/caption dataset
//
// Loads one split of a captioned image collection laid out as:
//
//   root/
//     train/
//       0001.jpg
//       0001.txt     <- caption (UTF-8, surrounding whitespace trimmed)
//       0001.npy     <- precomputed text embedding
//       0002.png
//       ...
//     test/
//       ...
//
// Images are ordered by path. Captions are read eagerly when the dataset is
// built; images and embeddings are read on every `get`.
//
// USAGE:
//
//   let ds = CaptionFolder::new("data/deepfashion")
//       .split("train")
//       .transform(Arc::new(pipeline))
//       .max_samples(1000)
//       .text_dimension(768)
//       .build()?;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use candle_core::{DType, Tensor};
use rayon::prelude::*;
use tracing::debug;

use crate::dataset::{Dataset, Sample};
use crate::error::{Error, Result};
use crate::transform::{Frame, ToTensor, Transform};

/// Supported image extensions (case-insensitive).
const EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "webp"];

/// Caption sidecar extension.
const CAPTION_EXT: &str = "txt";
/// Embedding sidecar extension.
const EMBEDDING_EXT: &str = "npy";

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

// CaptionFolderBuilder

/// Builder for [`CaptionFolder`].
pub struct CaptionFolderBuilder {
    root: PathBuf,
    split: String,
    transform: Arc<dyn Transform>,
    max_samples: Option<usize>,
    text_dimension: Option<usize>,
}

impl CaptionFolderBuilder {
    /// Create a builder rooted at the given directory.
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        CaptionFolderBuilder {
            root: root.as_ref().to_path_buf(),
            split: "train".to_string(),
            transform: Arc::new(ToTensor),
            max_samples: None,
            text_dimension: None,
        }
    }

    /// Subdirectory of the root to read (default `"train"`).
    pub fn split(mut self, split: impl Into<String>) -> Self {
        self.split = split.into();
        self
    }

    /// Preprocessing applied to every decoded image (default: [`ToTensor`]).
    pub fn transform(mut self, t: Arc<dyn Transform>) -> Self {
        self.transform = t;
        self
    }

    /// Keep at most `n` samples (the first `n` in path order).
    pub fn max_samples(mut self, n: usize) -> Self {
        self.max_samples = Some(n);
        self
    }

    /// Require every embedding to hold exactly `dim` values.
    pub fn text_dimension(mut self, dim: usize) -> Self {
        self.text_dimension = Some(dim);
        self
    }

    /// Scan the split directory and build the dataset.
    pub fn build(self) -> Result<CaptionFolder> {
        CaptionFolder::scan(self)
    }
}

// CaptionFolder dataset

/// One split of an image/caption/embedding collection.
pub struct CaptionFolder {
    name: String,
    /// Per-sample metadata, in path order.
    entries: Vec<Entry>,
    transform: Arc<dyn Transform>,
    text_dimension: Option<usize>,
}

struct Entry {
    image: PathBuf,
    embedding: PathBuf,
    prompt: String,
}

impl CaptionFolder {
    /// Convenience entry-point: `CaptionFolder::new(root)` returns a builder.
    pub fn new<P: AsRef<Path>>(root: P) -> CaptionFolderBuilder {
        CaptionFolderBuilder::new(root)
    }

    fn scan(cfg: CaptionFolderBuilder) -> Result<Self> {
        let dir = cfg.root.join(&cfg.split);
        if !dir.is_dir() {
            return Err(Error::NotADirectory(dir));
        }

        let mut images: Vec<PathBuf> = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_file() && is_image(&path) {
                images.push(path);
            }
        }
        images.sort();
        if let Some(n) = cfg.max_samples {
            images.truncate(n);
        }

        if images.is_empty() {
            return Err(Error::NoSamples {
                split: cfg.split,
                dir,
            });
        }

        let entries = images
            .into_par_iter()
            .map(Self::read_entry)
            .collect::<Result<Vec<Entry>>>()?;

        debug!(
            split = %cfg.split,
            dir = %dir.display(),
            samples = entries.len(),
            "scanned caption folder"
        );

        Ok(CaptionFolder {
            name: format!("CaptionFolder-{}", cfg.split),
            entries,
            transform: cfg.transform,
            text_dimension: cfg.text_dimension,
        })
    }

    fn read_entry(image: PathBuf) -> Result<Entry> {
        let caption = image.with_extension(CAPTION_EXT);
        let embedding = image.with_extension(EMBEDDING_EXT);
        for sidecar in [&caption, &embedding] {
            if !sidecar.is_file() {
                return Err(Error::MissingSidecar(sidecar.clone()));
            }
        }
        let prompt = std::fs::read_to_string(&caption)?.trim().to_string();
        Ok(Entry {
            image,
            embedding,
            prompt,
        })
    }

    /// Get the image path of the i-th sample.
    pub fn path_of(&self, index: usize) -> &Path {
        &self.entries[index].image
    }

    /// Get the caption of the i-th sample without decoding anything.
    pub fn prompt_of(&self, index: usize) -> &str {
        &self.entries[index].prompt
    }

    fn load_image(&self, entry: &Entry) -> Result<Tensor> {
        let img = image::open(&entry.image).map_err(|e| Error::ImageDecode {
            path: entry.image.clone(),
            source: e,
        })?;
        self.transform.apply(Frame::Image(img))?.into_tensor()
    }

    fn load_embedding(&self, entry: &Entry) -> Result<Tensor> {
        let t = Tensor::read_npy(&entry.embedding)?
            .to_dtype(DType::F32)?
            .flatten_all()?;
        if let Some(expected) = self.text_dimension {
            let got = t.elem_count();
            if got != expected {
                return Err(Error::EmbeddingDimension {
                    path: entry.embedding.clone(),
                    expected,
                    got,
                });
            }
        }
        Ok(t)
    }
}

impl Dataset for CaptionFolder {
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn get(&self, index: usize) -> Result<Sample> {
        let entry = &self.entries[index];
        Ok(Sample {
            image: self.load_image(entry)?,
            text_embedding: self.load_embedding(entry)?,
            prompt: entry.prompt.clone(),
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}
