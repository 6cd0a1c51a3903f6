// DataModule — train/test wiring for a captioned image collection
//
// Lifecycle:
//
//   let mut dm = DataModule::new(DataModuleConfig::new("data/deepfashion")
//       .batch_size(64)
//       .workers(4)
//       .text_dimension(768)
//       .imsize(64))?;
//   dm.setup(Stage::Both)?;
//   let mut train = dm.train_dataloader()?;
//   for batch in train.iter_epoch() { ... }
//
// `new` never touches disk. `setup` builds the split datasets through a
// `SourceFactory` (CaptionFolder by default) and replaces whatever was there.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use crate::augment::RandomHorizontalFlip;
use crate::caption_folder::CaptionFolder;
use crate::dataset::Dataset;
use crate::error::{Error, Result};
use crate::loader::{DataLoader, DataLoaderConfig};
use crate::transform::{Compose, Normalize, Resize, ToTensor, Transform};

/// Per-channel mean used to map [0, 1] pixels to [-1, 1].
pub const NORMALIZE_MEAN: [f32; 3] = [0.5, 0.5, 0.5];
/// Per-channel std used to map [0, 1] pixels to [-1, 1].
pub const NORMALIZE_STD: [f32; 3] = [0.5, 0.5, 0.5];
/// Flip probability of the train pipeline.
pub const FLIP_PROBABILITY: f64 = 0.5;

// Split / Stage

/// A named partition of the collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Split {
    Train,
    Test,
}

impl Split {
    /// Directory name of the split.
    pub fn as_str(self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Test => "test",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which splits [`DataModule::setup`] should build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Stage {
    Train,
    Test,
    #[default]
    Both,
}

impl Stage {
    pub fn splits(self) -> &'static [Split] {
        match self {
            Stage::Train => &[Split::Train],
            Stage::Test => &[Split::Test],
            Stage::Both => &[Split::Train, Split::Test],
        }
    }
}

// Configuration

/// Configuration for [`DataModule`]. Immutable once handed to `DataModule::new`.
#[derive(Debug, Clone)]
pub struct DataModuleConfig {
    /// Root directory holding one subdirectory per split.
    pub data_dir: PathBuf,
    /// Samples per batch. Partial batches are always dropped.
    pub batch_size: usize,
    /// Loader worker threads (0 = load on the calling thread).
    pub workers: usize,
    /// Cap on samples drawn from each split.
    pub max_samples: Option<usize>,
    /// Length of every precomputed text embedding.
    pub text_dimension: usize,
    /// Side of the square images fed to the model.
    pub imsize: u32,
    /// Batches buffered per worker.
    pub prefetch_factor: usize,
    /// Seed for the train shuffle; `None` draws from OS entropy.
    pub seed: Option<u64>,
}

impl DataModuleConfig {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    pub fn batch_size(mut self, bs: usize) -> Self {
        self.batch_size = bs;
        self
    }

    pub fn workers(mut self, n: usize) -> Self {
        self.workers = n;
        self
    }

    pub fn max_samples(mut self, n: usize) -> Self {
        self.max_samples = Some(n);
        self
    }

    pub fn text_dimension(mut self, dim: usize) -> Self {
        self.text_dimension = dim;
        self
    }

    pub fn imsize(mut self, size: u32) -> Self {
        self.imsize = size;
        self
    }

    pub fn prefetch_factor(mut self, pf: usize) -> Self {
        self.prefetch_factor = pf;
        self
    }

    pub fn seed(mut self, s: u64) -> Self {
        self.seed = Some(s);
        self
    }

    fn validate(&self) -> Result<()> {
        let check = |ok: bool, field: &'static str| {
            if ok {
                Ok(())
            } else {
                Err(Error::InvalidConfig {
                    field,
                    reason: "must be at least 1",
                })
            }
        };
        check(self.batch_size > 0, "batch_size")?;
        check(self.text_dimension > 0, "text_dimension")?;
        check(self.imsize > 0, "imsize")?;
        check(self.prefetch_factor > 0, "prefetch_factor")
    }

    fn loader_config(&self, shuffle: bool) -> DataLoaderConfig {
        let mut cfg = DataLoaderConfig::default()
            .batch_size(self.batch_size)
            .shuffle(shuffle)
            .drop_last(true)
            .num_workers(self.workers)
            .prefetch_factor(self.prefetch_factor);
        if let Some(seed) = self.seed {
            cfg = cfg.seed(seed);
        }
        cfg
    }
}

impl Default for DataModuleConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            batch_size: 32,
            workers: 0,
            max_samples: None,
            text_dimension: 768,
            imsize: 64,
            prefetch_factor: 2,
            seed: None,
        }
    }
}

// Pipelines

/// Resize, random mirror, tensor conversion, [-1, 1] normalization.
pub fn train_transform(imsize: u32) -> Compose {
    Compose::new(vec![
        Box::new(Resize::square(imsize)),
        Box::new(RandomHorizontalFlip::new(FLIP_PROBABILITY)),
        Box::new(ToTensor),
        Box::new(Normalize::new(NORMALIZE_MEAN.to_vec(), NORMALIZE_STD.to_vec())),
    ])
}

/// Same as [`train_transform`] without the random mirror.
pub fn test_transform(imsize: u32) -> Compose {
    Compose::new(vec![
        Box::new(Resize::square(imsize)),
        Box::new(ToTensor),
        Box::new(Normalize::new(NORMALIZE_MEAN.to_vec(), NORMALIZE_STD.to_vec())),
    ])
}

// Sample source

/// Everything a sample source needs to build one split.
pub struct SplitRequest<'a> {
    pub data_dir: &'a Path,
    pub split: Split,
    pub transform: Arc<dyn Transform>,
    pub max_samples: Option<usize>,
    pub text_dimension: usize,
}

/// Builds split datasets for a [`DataModule`].
///
/// Implemented for any `Fn(&SplitRequest) -> Result<Arc<dyn Dataset>>`, which
/// is the easiest way to plug in a different on-disk format.
pub trait SourceFactory: Send + Sync {
    fn open(&self, request: &SplitRequest<'_>) -> Result<Arc<dyn Dataset>>;
}

impl<F> SourceFactory for F
where
    F: Fn(&SplitRequest<'_>) -> Result<Arc<dyn Dataset>> + Send + Sync,
{
    fn open(&self, request: &SplitRequest<'_>) -> Result<Arc<dyn Dataset>> {
        self(request)
    }
}

/// The default source: a [`CaptionFolder`] per split directory.
#[derive(Debug, Clone, Copy, Default)]
pub struct CaptionFolderSource;

impl SourceFactory for CaptionFolderSource {
    fn open(&self, req: &SplitRequest<'_>) -> Result<Arc<dyn Dataset>> {
        let mut builder = CaptionFolder::new(req.data_dir)
            .split(req.split.as_str())
            .transform(req.transform.clone())
            .text_dimension(req.text_dimension);
        if let Some(n) = req.max_samples {
            builder = builder.max_samples(n);
        }
        Ok(Arc::new(builder.build()?))
    }
}

// DataModule

/// Owns the configuration, both pipelines and the lazily built splits.
pub struct DataModule {
    config: DataModuleConfig,
    source: Box<dyn SourceFactory>,
    train_transform: Arc<dyn Transform>,
    test_transform: Arc<dyn Transform>,
    train_dataset: Option<Arc<dyn Dataset>>,
    test_dataset: Option<Arc<dyn Dataset>>,
}

impl DataModule {
    /// Validate `config` and build the pipelines. Does not touch disk.
    pub fn new(config: DataModuleConfig) -> Result<Self> {
        Self::with_source(config, CaptionFolderSource)
    }

    /// Like [`DataModule::new`] but reading splits through `source`.
    pub fn with_source(
        config: DataModuleConfig,
        source: impl SourceFactory + 'static,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            train_transform: Arc::new(train_transform(config.imsize)),
            test_transform: Arc::new(test_transform(config.imsize)),
            config,
            source: Box::new(source),
            train_dataset: None,
            test_dataset: None,
        })
    }

    pub fn config(&self) -> &DataModuleConfig {
        &self.config
    }

    /// Build (or rebuild) the datasets for `stage`.
    ///
    /// A rebuilt split replaces the previous dataset. If the train split fails
    /// under `Stage::Both`, the test split is left untouched.
    pub fn setup(&mut self, stage: Stage) -> Result<()> {
        for &split in stage.splits() {
            let transform = match split {
                Split::Train => self.train_transform.clone(),
                Split::Test => self.test_transform.clone(),
            };
            let request = SplitRequest {
                data_dir: &self.config.data_dir,
                split,
                transform,
                max_samples: self.config.max_samples,
                text_dimension: self.config.text_dimension,
            };
            let dataset = self.source.open(&request)?;
            info!(
                split = %split,
                dataset = dataset.name(),
                samples = dataset.len(),
                "split ready"
            );
            match split {
                Split::Train => self.train_dataset = Some(dataset),
                Split::Test => self.test_dataset = Some(dataset),
            }
        }
        Ok(())
    }

    /// Whether `setup` has built `split`.
    pub fn is_ready(&self, split: Split) -> bool {
        self.dataset(split).is_some()
    }

    /// The dataset currently bound to `split`, if any.
    pub fn dataset(&self, split: Split) -> Option<&Arc<dyn Dataset>> {
        match split {
            Split::Train => self.train_dataset.as_ref(),
            Split::Test => self.test_dataset.as_ref(),
        }
    }

    pub fn train_transform(&self) -> &Arc<dyn Transform> {
        &self.train_transform
    }

    pub fn test_transform(&self) -> &Arc<dyn Transform> {
        &self.test_transform
    }

    /// Shuffled, drop-last loader over the train split.
    pub fn train_dataloader(&self) -> Result<DataLoader> {
        self.dataloader(Split::Train, true)
    }

    /// Unshuffled, drop-last loader over the test split.
    pub fn test_dataloader(&self) -> Result<DataLoader> {
        self.dataloader(Split::Test, false)
    }

    fn dataloader(&self, split: Split, shuffle: bool) -> Result<DataLoader> {
        let dataset = self
            .dataset(split)
            .ok_or(Error::StageNotReady(split))?
            .clone();
        DataLoader::new(dataset, self.config.loader_config(shuffle))
    }
}
