//! Background batch loading.
//!
//! A single producer thread shuffles, loads and crops images and pushes
//! whole batches into a bounded channel. When the channel is full the
//! producer blocks, so at most `prefetch` batches are resident.
//!
//! Order and crops depend only on `(seed, epoch, position)`, which makes a
//! run reproducible and lets a resumed run skip straight to its batch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use mcquic_core::ImageTensor;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::{debug, warn};

use crate::config::TrainSection;
use crate::dataset::Dataset;
use crate::error::{Result, TrainError};

/// Loader settings
#[derive(Debug, Clone, PartialEq)]
pub struct PrefetchConfig {
    /// Images per batch
    pub batch_size: usize,
    /// Square crop side
    pub crop_size: usize,
    /// Base seed
    pub seed: u64,
    /// Channel capacity in batches
    pub prefetch: usize,
    /// Passes over the dataset
    pub epochs: usize,
    /// Retries per image for transient failures
    pub io_retries: u32,
    /// Backoff unit; attempt `n` waits `n` units
    pub retry_backoff: Duration,
}

impl PrefetchConfig {
    /// Loader settings of a training run.
    pub fn from_train(train: &TrainSection) -> Self {
        Self {
            batch_size: train.batch_size,
            crop_size: train.crop_size,
            seed: train.seed,
            prefetch: train.prefetch,
            epochs: train.epochs,
            io_retries: train.io_retries,
            retry_backoff: Duration::from_millis(train.retry_backoff_ms),
        }
    }
}

/// One batch of equally sized crops
#[derive(Debug, Clone)]
pub struct Batch {
    /// Epoch the batch belongs to
    pub epoch: usize,
    /// Position within the epoch
    pub index: usize,
    /// Cropped images
    pub images: Vec<ImageTensor>,
}

/// Where a loader starts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursor {
    /// Epoch
    pub epoch: usize,
    /// Batch within the epoch
    pub batch: usize,
}

/// Handle to the producer thread; iterate it for batches.
pub struct Prefetcher {
    receiver: Option<Receiver<Result<Batch>>>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    batches_per_epoch: usize,
}

impl Prefetcher {
    /// Start loading from `start`.
    ///
    /// Only full batches are produced; a trailing partial batch of each
    /// epoch is dropped.
    pub fn spawn(dataset: Arc<dyn Dataset>, config: PrefetchConfig, start: Cursor) -> Result<Self> {
        if config.batch_size == 0 || config.crop_size == 0 || config.prefetch == 0 {
            return Err(TrainError::config(
                "batch_size, crop_size and prefetch must be positive",
            ));
        }
        let batches_per_epoch = dataset.len() / config.batch_size;
        if batches_per_epoch == 0 {
            return Err(TrainError::Data(format!(
                "dataset has {} images, a batch needs {}",
                dataset.len(),
                config.batch_size
            )));
        }

        let (sender, receiver) = bounded(config.prefetch);
        let stop = Arc::new(AtomicBool::new(false));
        let producer = Producer {
            dataset,
            config,
            stop: Arc::clone(&stop),
            sender,
            batches_per_epoch,
        };
        let handle = thread::Builder::new()
            .name("mcquic-prefetch".into())
            .spawn(move || producer.run(start))?;

        Ok(Self {
            receiver: Some(receiver),
            stop,
            handle: Some(handle),
            batches_per_epoch,
        })
    }

    /// Full batches per epoch.
    pub fn batches_per_epoch(&self) -> usize {
        self.batches_per_epoch
    }
}

impl Iterator for Prefetcher {
    type Item = Result<Batch>;

    /// Next batch; `None` once every epoch has been produced.
    fn next(&mut self) -> Option<Self::Item> {
        self.receiver.as_ref()?.recv().ok()
    }
}

impl Drop for Prefetcher {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        // Unblocks a producer waiting on a full channel
        self.receiver.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("prefetch thread panicked");
            }
        }
    }
}

struct Producer {
    dataset: Arc<dyn Dataset>,
    config: PrefetchConfig,
    stop: Arc<AtomicBool>,
    sender: Sender<Result<Batch>>,
    batches_per_epoch: usize,
}

impl Producer {
    fn run(self, start: Cursor) {
        let bs = self.config.batch_size;
        for epoch in start.epoch..self.config.epochs {
            let order = epoch_order(self.dataset.len(), self.config.seed, epoch);
            let first = if epoch == start.epoch { start.batch } else { 0 };
            for index in first..self.batches_per_epoch {
                if self.stop.load(Ordering::SeqCst) {
                    return;
                }
                let positions = index * bs..(index + 1) * bs;
                let batch = positions
                    .map(|pos| -> Result<ImageTensor> {
                        let image = self.load_with_retry(order[pos])?;
                        let mut rng = StdRng::seed_from_u64(crop_seed(self.config.seed, epoch, pos));
                        Ok(random_crop(&image, self.config.crop_size, &mut rng)?)
                    })
                    .collect::<Result<Vec<_>>>()
                    .map(|images| Batch {
                        epoch,
                        index,
                        images,
                    });
                let failed = batch.is_err();
                if self.sender.send(batch).is_err() || failed {
                    return;
                }
            }
            debug!(epoch, "epoch produced");
        }
    }

    fn load_with_retry(&self, index: usize) -> Result<ImageTensor> {
        let mut attempt = 0;
        loop {
            match self.dataset.load(index) {
                Ok(image) => return Ok(image),
                Err(e) if e.is_recoverable() && attempt < self.config.io_retries => {
                    attempt += 1;
                    warn!(
                        image = %self.dataset.name(index),
                        attempt,
                        "transient load failure: {}",
                        e
                    );
                    thread::sleep(self.config.retry_backoff * attempt);
                }
                Err(e) => {
                    return Err(TrainError::Data(format!(
                        "cannot load {} after {} attempts: {}",
                        self.dataset.name(index),
                        attempt + 1,
                        e
                    )))
                }
            }
        }
    }
}

/// Shuffled dataset order of one epoch.
pub fn epoch_order(len: usize, seed: u64, epoch: usize) -> Vec<usize> {
    let mut rng = StdRng::seed_from_u64(seed.wrapping_add(epoch as u64));
    let mut order: Vec<usize> = (0..len).collect();
    order.shuffle(&mut rng);
    order
}

fn crop_seed(seed: u64, epoch: usize, position: usize) -> u64 {
    seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ ((epoch as u64) << 32) ^ position as u64
}

/// Random `size × size` window; smaller images are edge-padded first.
pub fn random_crop(image: &ImageTensor, size: usize, rng: &mut StdRng) -> mcquic_core::Result<ImageTensor> {
    let source = if image.height < size || image.width < size {
        image.pad_to_multiple(size)
    } else {
        image.clone()
    };
    let top = rng.gen_range(0..=source.height - size);
    let left = rng.gen_range(0..=source.width - size);
    source.crop_at(top, left, size, size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::InMemory;
    use std::sync::atomic::AtomicUsize;

    fn images(n: usize, side: usize) -> Vec<ImageTensor> {
        (0..n)
            .map(|i| {
                let data = vec![i as f32 / n as f32; side * side * 3];
                ImageTensor::from_vec(side, side, 3, data).unwrap()
            })
            .collect()
    }

    fn config(batch_size: usize, epochs: usize) -> PrefetchConfig {
        PrefetchConfig {
            batch_size,
            crop_size: 8,
            seed: 42,
            prefetch: 2,
            epochs,
            io_retries: 2,
            retry_backoff: Duration::from_millis(1),
        }
    }

    fn collect(prefetcher: Prefetcher) -> Vec<Batch> {
        prefetcher.map(|b| b.unwrap()).collect()
    }

    #[test]
    fn test_epochs_and_batches() {
        let set: Arc<dyn Dataset> = Arc::new(InMemory::new(images(10, 12)));
        let batches = collect(Prefetcher::spawn(set, config(3, 2), Cursor::default()).unwrap());
        // 10 / 3 = 3 full batches per epoch
        assert_eq!(batches.len(), 6);
        assert_eq!(batches[3].epoch, 1);
        assert_eq!(batches[3].index, 0);
        for batch in &batches {
            assert_eq!(batch.images.len(), 3);
            assert_eq!((batch.images[0].height, batch.images[0].width), (8, 8));
        }
    }

    #[test]
    fn test_deterministic_and_resumable() {
        let set: Arc<dyn Dataset> = Arc::new(InMemory::new(images(8, 16)));
        let a = collect(Prefetcher::spawn(Arc::clone(&set), config(2, 2), Cursor::default()).unwrap());
        let b = collect(Prefetcher::spawn(Arc::clone(&set), config(2, 2), Cursor::default()).unwrap());
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.images, y.images);
        }

        let resumed = collect(Prefetcher::spawn(set, config(2, 2), Cursor { epoch: 1, batch: 1 }).unwrap());
        assert_eq!(resumed.len(), 3);
        assert_eq!(resumed[0].images, a[5].images);
    }

    #[test]
    fn test_small_images_are_padded() {
        let mut rng = StdRng::seed_from_u64(0);
        let image = ImageTensor::zeros(5, 20, 3);
        let crop = random_crop(&image, 8, &mut rng).unwrap();
        assert_eq!((crop.height, crop.width), (8, 8));
    }

    struct Flaky {
        inner: InMemory,
        failures: AtomicUsize,
    }

    impl Dataset for Flaky {
        fn len(&self) -> usize {
            self.inner.len()
        }

        fn name(&self, index: usize) -> String {
            self.inner.name(index)
        }

        fn load(&self, index: usize) -> mcquic_core::Result<ImageTensor> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(mcquic_core::Error::Io(std::io::Error::from(
                    std::io::ErrorKind::Interrupted,
                )));
            }
            self.inner.load(index)
        }
    }

    #[test]
    fn test_transient_failures_are_retried() {
        let set: Arc<dyn Dataset> = Arc::new(Flaky {
            inner: InMemory::new(images(2, 8)),
            failures: AtomicUsize::new(2),
        });
        let batches = collect(Prefetcher::spawn(set, config(2, 1), Cursor::default()).unwrap());
        assert_eq!(batches.len(), 1);
    }

    #[test]
    fn test_persistent_failure_surfaces() {
        let set: Arc<dyn Dataset> = Arc::new(Flaky {
            inner: InMemory::new(images(2, 8)),
            failures: AtomicUsize::new(100),
        });
        let mut prefetcher = Prefetcher::spawn(set, config(2, 1), Cursor::default()).unwrap();
        assert!(matches!(prefetcher.next(), Some(Err(TrainError::Data(_)))));
        assert!(prefetcher.next().is_none());
    }

    #[test]
    fn test_early_drop_does_not_hang() {
        let set: Arc<dyn Dataset> = Arc::new(InMemory::new(images(16, 8)));
        let mut prefetcher = Prefetcher::spawn(set, config(1, 100), Cursor::default()).unwrap();
        assert!(prefetcher.next().is_some());
        drop(prefetcher);
    }

    #[test]
    fn test_too_few_images() {
        let set: Arc<dyn Dataset> = Arc::new(InMemory::new(images(1, 8)));
        assert!(matches!(
            Prefetcher::spawn(set, config(2, 1), Cursor::default()),
            Err(TrainError::Data(_))
        ));
    }
}
