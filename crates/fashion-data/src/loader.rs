// DataLoader — batching, shuffling, prefetching iteration
//
// One call to `iter_epoch` is one pass over the dataset:
//
//   1. reshuffle the index permutation (if enabled),
//   2. cut it into batch-sized index lists (dropping the tail if drop_last),
//   3. load + collate each list, either on the calling thread
//      (num_workers == 0) or on background workers feeding a bounded channel.
//
// Usage:
//
//   let mut loader = DataLoader::new(
//       dataset,
//       DataLoaderConfig::default()
//           .batch_size(64)
//           .drop_last(true)
//           .num_workers(4),
//   )?;
//
//   for epoch in 0..num_epochs {
//       for batch in loader.iter_epoch() {
//           let batch = batch?;
//           // train on batch ...
//       }
//   }

use std::collections::BTreeMap;
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::debug;

use crate::collate::collate;
use crate::dataset::{Batch, Dataset};
use crate::error::{Error, Result};

/// Configuration for the DataLoader.
#[derive(Debug, Clone)]
pub struct DataLoaderConfig {
    /// Number of samples per batch.
    pub batch_size: usize,
    /// Whether to shuffle indices each pass.
    pub shuffle: bool,
    /// Whether to drop the last incomplete batch.
    pub drop_last: bool,
    /// Number of background worker threads (0 = load on the calling thread).
    pub num_workers: usize,
    /// Batches buffered per worker ahead of the consumer.
    pub prefetch_factor: usize,
    /// Optional random seed for reproducible shuffling.
    pub seed: Option<u64>,
}

impl Default for DataLoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            shuffle: true,
            drop_last: false,
            num_workers: 0,
            prefetch_factor: 2,
            seed: None,
        }
    }
}

impl DataLoaderConfig {
    pub fn batch_size(mut self, bs: usize) -> Self {
        self.batch_size = bs;
        self
    }

    pub fn shuffle(mut self, s: bool) -> Self {
        self.shuffle = s;
        self
    }

    pub fn drop_last(mut self, d: bool) -> Self {
        self.drop_last = d;
        self
    }

    pub fn num_workers(mut self, n: usize) -> Self {
        self.num_workers = n;
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

    pub(crate) fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::InvalidConfig {
                field: "batch_size",
                reason: "must be at least 1",
            });
        }
        if self.prefetch_factor == 0 {
            return Err(Error::InvalidConfig {
                field: "prefetch_factor",
                reason: "must be at least 1",
            });
        }
        Ok(())
    }
}

/// A DataLoader wraps a Dataset and produces [`Batch`]es.
///
/// The loader is restartable: every [`iter_epoch`](DataLoader::iter_epoch)
/// starts a new pass, reshuffled when `shuffle` is set. A seeded loader
/// replays the same sequence of permutations, but consecutive passes still
/// differ from each other.
pub struct DataLoader {
    dataset: Arc<dyn Dataset>,
    config: DataLoaderConfig,
    indices: Vec<usize>,
    rng: StdRng,
}

impl DataLoader {
    /// Create a new DataLoader over a dataset.
    pub fn new(dataset: Arc<dyn Dataset>, config: DataLoaderConfig) -> Result<Self> {
        config.validate()?;
        let indices: Vec<usize> = (0..dataset.len()).collect();
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            dataset,
            config,
            indices,
            rng,
        })
    }

    /// The number of batches per pass.
    pub fn num_batches(&self) -> usize {
        if self.config.drop_last {
            self.dataset.len() / self.config.batch_size
        } else {
            self.dataset.len().div_ceil(self.config.batch_size)
        }
    }

    /// Total number of samples.
    pub fn len(&self) -> usize {
        self.dataset.len()
    }

    /// Whether the dataset is empty.
    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    pub fn dataset(&self) -> &Arc<dyn Dataset> {
        &self.dataset
    }

    pub fn config(&self) -> &DataLoaderConfig {
        &self.config
    }

    /// Reshuffle indices (called at the start of each pass).
    pub fn reshuffle(&mut self) {
        if self.config.shuffle {
            self.indices.shuffle(&mut self.rng);
        }
    }

    /// Start one pass over the dataset.
    ///
    /// With `num_workers > 0` the workers start loading immediately and are
    /// joined when the returned iterator is dropped.
    pub fn iter_epoch(&mut self) -> BatchIterator {
        self.reshuffle();

        let bs = self.config.batch_size;
        let n = self.indices.len();
        let num_batches = self.num_batches();
        let batches: Vec<Vec<usize>> = (0..num_batches)
            .map(|b| {
                let start = b * bs;
                let end = (start + bs).min(n);
                self.indices[start..end].to_vec()
            })
            .collect();

        debug!(
            dataset = self.dataset.name(),
            batches = num_batches,
            workers = self.config.num_workers,
            "starting pass"
        );

        let source = if self.config.num_workers == 0 {
            Source::Sequential {
                dataset: self.dataset.clone(),
                batches: batches.into_iter(),
            }
        } else {
            Source::Prefetch(Prefetch::spawn(
                self.dataset.clone(),
                batches,
                self.config.num_workers,
                self.config.prefetch_factor * self.config.num_workers,
            ))
        };

        BatchIterator {
            source,
            remaining: num_batches,
        }
    }
}

impl IntoIterator for &mut DataLoader {
    type Item = Result<Batch>;
    type IntoIter = BatchIterator;

    fn into_iter(self) -> BatchIterator {
        self.iter_epoch()
    }
}

/// Load and collate the samples at `indices`.
fn load_batch(dataset: &dyn Dataset, indices: &[usize]) -> Result<Batch> {
    let samples = indices
        .iter()
        .map(|&i| dataset.get(i))
        .collect::<Result<Vec<_>>>()?;
    collate(samples)
}

// BatchIterator

/// Iterator over the batches of one pass, in permutation order.
pub struct BatchIterator {
    source: Source,
    remaining: usize,
}

enum Source {
    Sequential {
        dataset: Arc<dyn Dataset>,
        batches: std::vec::IntoIter<Vec<usize>>,
    },
    Prefetch(Prefetch),
}

impl Iterator for BatchIterator {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let item = match &mut self.source {
            Source::Sequential { dataset, batches } => {
                let indices = batches.next()?;
                load_batch(dataset.as_ref(), &indices)
            }
            Source::Prefetch(p) => match p.next_in_order() {
                Some(item) => item,
                None => {
                    let remaining = self.remaining;
                    self.remaining = 0;
                    return Some(Err(Error::WorkerDisconnected { remaining }));
                }
            },
        };
        self.remaining -= 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for BatchIterator {}

// Prefetch workers

/// Background workers claiming batch indices from a shared dispatch window.
///
/// Workers finish out of order; arrivals are parked in `pending` until the
/// next expected batch index shows up. A worker may only claim batch `k` while
/// `k < yielded + capacity`, so at most `capacity` batches are loaded ahead of
/// the consumer, whether they sit in the channel, in `pending`, or mid-load.
struct Prefetch {
    rx: Option<mpsc::Receiver<(usize, Result<Batch>)>>,
    pending: BTreeMap<usize, Result<Batch>>,
    next_index: usize,
    window: Arc<Window>,
    handles: Vec<thread::JoinHandle<()>>,
}

struct WindowState {
    dispatched: usize,
    yielded: usize,
    closed: bool,
}

struct Window {
    state: Mutex<WindowState>,
    room: Condvar,
    capacity: usize,
    total: usize,
}

impl Window {
    /// Block until the next batch fits in the window, then claim it.
    ///
    /// Returns `None` once every batch is claimed or the window is closed.
    fn claim(&self) -> Option<usize> {
        let mut st = self.state.lock().ok()?;
        loop {
            if st.closed || st.dispatched >= self.total {
                return None;
            }
            if st.dispatched < st.yielded + self.capacity {
                st.dispatched += 1;
                return Some(st.dispatched - 1);
            }
            st = self.room.wait(st).ok()?;
        }
    }

    fn advance(&self) {
        if let Ok(mut st) = self.state.lock() {
            st.yielded += 1;
        }
        self.room.notify_all();
    }

    fn close(&self) {
        if let Ok(mut st) = self.state.lock() {
            st.closed = true;
        }
        self.room.notify_all();
    }
}

/// Closes the window when a worker unwinds, so its siblings stop waiting
/// for room that the lost batch will never free.
struct CloseOnPanic(Arc<Window>);

impl Drop for CloseOnPanic {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.close();
        }
    }
}

impl Prefetch {
    fn spawn(
        dataset: Arc<dyn Dataset>,
        batches: Vec<Vec<usize>>,
        workers: usize,
        capacity: usize,
    ) -> Self {
        let (tx, rx) = mpsc::sync_channel::<(usize, Result<Batch>)>(capacity);

        let window = Arc::new(Window {
            state: Mutex::new(WindowState {
                dispatched: 0,
                yielded: 0,
                closed: false,
            }),
            room: Condvar::new(),
            capacity,
            total: batches.len(),
        });
        let batches = Arc::new(batches);

        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let window = window.clone();
            let batches = batches.clone();
            let tx = tx.clone();
            let ds = dataset.clone();

            handles.push(thread::spawn(move || {
                let _guard = CloseOnPanic(window.clone());
                while let Some(batch_idx) = window.claim() {
                    let result = load_batch(ds.as_ref(), &batches[batch_idx]);
                    // Receiver dropped: the consumer abandoned the pass
                    if tx.send((batch_idx, result)).is_err() {
                        break;
                    }
                }
            }));
        }

        // Drop the original sender so the channel closes when all workers finish
        drop(tx);

        Self {
            rx: Some(rx),
            pending: BTreeMap::new(),
            next_index: 0,
            window,
            handles,
        }
    }

    /// Block until the next batch in permutation order is available.
    ///
    /// Returns `None` if every worker is gone and the batch never arrived.
    fn next_in_order(&mut self) -> Option<Result<Batch>> {
        loop {
            if let Some(batch) = self.pending.remove(&self.next_index) {
                self.next_index += 1;
                self.window.advance();
                return Some(batch);
            }
            let (idx, batch) = self.rx.as_ref()?.recv().ok()?;
            self.pending.insert(idx, batch);
        }
    }
}

impl Drop for Prefetch {
    fn drop(&mut self) {
        // Wake workers waiting for room, and make blocked senders fail
        self.window.close();
        self.rx.take();
        for h in self.handles.drain(..) {
            let _ = h.join();
        }
    }
}
