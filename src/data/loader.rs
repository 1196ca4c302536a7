use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::data::dataset::{Batch, Dataset};
use crate::error::Result;

/// A restartable, finite sequence of batches. Each call to `iter_epoch`
/// starts a fresh pass; the orchestrator re-iterates it whenever a pass is
/// exhausted.
pub trait BatchSource {
    fn iter_epoch(&self, epoch: usize) -> Box<dyn Iterator<Item = Result<Batch>> + '_>;

    /// Number of batches one pass yields.
    fn batches_per_epoch(&self) -> usize;
}

/// Batches an in-memory `Dataset`, optionally shuffled per epoch and
/// sharded across data-parallel workers.
///
/// Sharding follows the distributed-sampler convention: the (shuffled)
/// index order is padded by wrapping around until it divides evenly by the
/// worker count, then worker `r` takes positions `r, r + w, r + 2w, ...`.
/// Every worker therefore sees the same number of batches per epoch, which
/// keeps the per-window collectives aligned.
#[derive(Debug, Clone)]
pub struct DataLoader {
    dataset: Arc<Dataset>,
    batch_size: usize,
    shuffle: bool,
    seed: u64,
    rank: usize,
    world_size: usize,
}

impl DataLoader {
    pub fn new(dataset: Arc<Dataset>, batch_size: usize) -> DataLoader {
        DataLoader {
            dataset,
            batch_size: batch_size.max(1),
            shuffle: false,
            seed: 0,
            rank: 0,
            world_size: 1,
        }
    }

    /// Reshuffle every epoch with `seed + epoch`.
    pub fn shuffled(mut self, seed: u64) -> DataLoader {
        self.shuffle = true;
        self.seed = seed;
        self
    }

    pub fn sharded(mut self, rank: usize, world_size: usize) -> DataLoader {
        self.world_size = world_size.max(1);
        self.rank = rank.min(self.world_size - 1);
        self
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    fn shard_len(&self) -> usize {
        let n = self.dataset.len();
        if self.world_size == 1 {
            n
        } else {
            n.div_ceil(self.world_size)
        }
    }

    fn epoch_indices(&self, epoch: usize) -> Vec<usize> {
        let n = self.dataset.len();
        let mut order: Vec<usize> = (0..n).collect();
        if self.shuffle {
            order.shuffle(&mut StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64)));
        }
        if self.world_size == 1 || n == 0 {
            return order;
        }

        let padded = self.shard_len() * self.world_size;
        let mut i = 0;
        while order.len() < padded {
            order.push(order[i % n]);
            i += 1;
        }
        order.into_iter().skip(self.rank).step_by(self.world_size).collect()
    }
}

impl BatchSource for DataLoader {
    fn iter_epoch(&self, epoch: usize) -> Box<dyn Iterator<Item = Result<Batch>> + '_> {
        let indices = self.epoch_indices(epoch);
        let batch_size = self.batch_size;
        let chunks: Vec<Vec<usize>> = indices.chunks(batch_size).map(<[usize]>::to_vec).collect();
        Box::new(chunks.into_iter().map(move |chunk| {
            let inputs = chunk.iter().map(|&i| self.dataset.samples[i].clone()).collect();
            let labels = chunk.iter().map(|&i| self.dataset.labels[i]).collect();
            Batch::new(inputs, labels)
        }))
    }

    fn batches_per_epoch(&self) -> usize {
        self.shard_len().div_ceil(self.batch_size)
    }
}
