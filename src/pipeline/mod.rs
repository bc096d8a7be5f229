//! Input pipeline: cache, shuffle, normalize, augment, batch, prefetch.
//!
//! Each call to [`Pipeline::epoch`] spawns a producer thread that assembles
//! batches ahead of the consumer over a bounded channel. The per-sample map
//! inside a batch is split across scoped worker threads. Every sample draws
//! its augmentation from an RNG seeded by `(seed, epoch, position)`, so the
//! produced batches do not depend on the worker count.

use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use ndarray::{Array2, Array4, ArrayView2, ArrayViewMut4, Axis};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::parsing::{Dataset, IMAGE_HEIGHT, IMAGE_WIDTH};

pub mod augment;

use augment::AugmentConfig;

const GREYSCALE_SIZE: f32 = 255.0;
const SHUFFLE_STREAM: usize = u32::MAX as usize;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub batch_size: usize,
    /// Number of batches buffered ahead of the training loop
    pub prefetch: usize,
    /// Threads used for the per-sample map. Defaults to the available parallelism.
    pub workers: Option<usize>,
    pub seed: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            batch_size: 32,
            prefetch: 2,
            workers: None,
            seed: 42,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::InvalidConfig("batch_size must be positive".to_string()));
        }
        if self.workers == Some(0) {
            return Err(Error::InvalidConfig("workers must be positive".to_string()));
        }
        Ok(())
    }

    fn num_workers(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        })
    }
}

/// A batch of normalized images in NCHW layout with their class indices
#[derive(Debug, Clone)]
pub struct Batch {
    pub images: Array4<f32>,
    pub labels: Vec<usize>,
}

pub struct Pipeline {
    dataset: Arc<Dataset>,
    batch_size: usize,
    prefetch: usize,
    workers: usize,
    seed: u64,
    shuffle: bool,
    augment: Option<AugmentConfig>,
}

impl Pipeline {
    /// Training pipeline: shuffled every epoch and augmented
    pub fn train(
        dataset: Arc<Dataset>,
        config: &PipelineConfig,
        augment: AugmentConfig,
    ) -> Result<Pipeline> {
        augment.validate()?;
        Self::new(dataset, config, true, Some(augment))
    }

    /// Evaluation pipeline: fixed order, normalization only
    pub fn test(dataset: Arc<Dataset>, config: &PipelineConfig) -> Result<Pipeline> {
        Self::new(dataset, config, false, None)
    }

    fn new(
        dataset: Arc<Dataset>,
        config: &PipelineConfig,
        shuffle: bool,
        augment: Option<AugmentConfig>,
    ) -> Result<Pipeline> {
        config.validate()?;
        let workers = config.num_workers();

        tracing::debug!(
            "Caching {} examples in memory (batch size {}, {} workers, prefetch {})",
            dataset.len(),
            config.batch_size,
            workers,
            config.prefetch
        );

        Ok(Pipeline {
            dataset,
            batch_size: config.batch_size,
            prefetch: config.prefetch,
            workers,
            seed: config.seed,
            shuffle,
            augment,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    /// Start producing the batches of one epoch
    pub fn epoch(&self, epoch: usize) -> Batches {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(derive_seed(self.seed, epoch, SHUFFLE_STREAM));
            order.shuffle(&mut rng);
        }

        let job = EpochJob {
            dataset: Arc::clone(&self.dataset),
            augment: self.augment.clone(),
            batch_size: self.batch_size,
            workers: self.workers,
            seed: self.seed,
            epoch,
        };
        let (sender, receiver) = mpsc::sync_channel(self.prefetch);
        let producer = thread::spawn(move || job.run(&order, sender));

        Batches {
            receiver,
            producer: Some(producer),
        }
    }
}

/// Iterator over the prefetched batches of one epoch.
/// Dropping it early makes the producer stop at its next send.
pub struct Batches {
    receiver: Receiver<Batch>,
    producer: Option<JoinHandle<()>>,
}

impl Iterator for Batches {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Result<Batch>> {
        match self.receiver.recv() {
            Ok(batch) => Some(Ok(batch)),
            Err(_) => {
                let producer = self.producer.take()?;
                match producer.join() {
                    Ok(()) => None,
                    Err(_) => Some(Err(Error::WorkerPanicked)),
                }
            }
        }
    }
}

struct EpochJob {
    dataset: Arc<Dataset>,
    augment: Option<AugmentConfig>,
    batch_size: usize,
    workers: usize,
    seed: u64,
    epoch: usize,
}

impl EpochJob {
    fn run(&self, order: &[usize], sender: SyncSender<Batch>) {
        for (batch_idx, indices) in order.chunks(self.batch_size).enumerate() {
            let batch = self.build_batch(indices, batch_idx * self.batch_size);

            if sender.send(batch).is_err() {
                tracing::trace!("Consumer dropped epoch {} early", self.epoch);
                return;
            }
        }
    }

    fn build_batch(&self, indices: &[usize], position: usize) -> Batch {
        let mut images = Array4::zeros((indices.len(), 1, IMAGE_HEIGHT, IMAGE_WIDTH));
        let per_worker = indices.len().div_ceil(self.workers).max(1);

        if self.workers == 1 || indices.len() <= 1 {
            self.fill(indices, position, images.view_mut());
        } else {
            thread::scope(|scope| {
                for (part, (chunk, out)) in indices
                    .chunks(per_worker)
                    .zip(images.axis_chunks_iter_mut(Axis(0), per_worker))
                    .enumerate()
                {
                    scope.spawn(move || self.fill(chunk, position + part * per_worker, out));
                }
            });
        }

        let labels = indices
            .iter()
            .map(|&idx| self.dataset.labels[idx] as usize)
            .collect();

        Batch { images, labels }
    }

    fn fill(&self, indices: &[usize], position: usize, mut out: ArrayViewMut4<f32>) {
        for (k, (&idx, mut slot)) in indices.iter().zip(out.outer_iter_mut()).enumerate() {
            let image = normalize(self.dataset.image(idx));
            let image = match &self.augment {
                Some(augment) => {
                    let seed = derive_seed(self.seed, self.epoch, position + k);
                    let mut rng = StdRng::seed_from_u64(seed);
                    augment.apply(image.view(), IMAGE_HEIGHT, IMAGE_WIDTH, &mut rng)
                }
                None => image,
            };

            slot.index_axis_mut(Axis(0), 0).assign(&image);
        }
    }
}

fn normalize(image: ArrayView2<u8>) -> Array2<f32> {
    image.mapv(|p| p as f32 / GREYSCALE_SIZE)
}

fn derive_seed(seed: u64, epoch: usize, position: usize) -> u64 {
    seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ ((epoch as u64) << 32) ^ position as u64
}
