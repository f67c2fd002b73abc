use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::error::{Result, TrainError};
use crate::feeder::feeder::Feeder;
use crate::feeder::tta::mirror_x;
use crate::math::matrix::Matrix;

/// Batches a worker may have ready before it blocks.
const PREFETCH: usize = 2;

/// A block of samples, one per row of `features`.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub features: Matrix,
    pub labels: Vec<usize>,
    pub indices: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Rows `start..end` as a batch of their own.
    pub fn slice(&self, start: usize, end: usize) -> Batch {
        Batch {
            features: self.features.slice_rows(start, end),
            labels: self.labels[start..end].to_vec(),
            indices: self.indices[start..end].to_vec(),
        }
    }
}

/// Random augmentation applied while batches are assembled.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Augment {
    pub random_flip: bool,
    pub in_channels: usize,
}

/// Splits a feeder into batches, optionally on worker threads.
///
/// The shuffle generator is created once and advances across epochs, so
/// every epoch sees a different permutation while the sequence of epochs
/// stays reproducible for a fixed seed.
pub struct DataLoader {
    feeder: Arc<dyn Feeder>,
    batch_size: usize,
    shuffle: bool,
    drop_last: bool,
    num_worker: usize,
    seed: u64,
    augment: Augment,
    shuffle_rng: StdRng,
}

impl DataLoader {
    /// # Panics
    /// Panics if `batch_size` is zero.
    pub fn new(feeder: Arc<dyn Feeder>, batch_size: usize) -> DataLoader {
        assert!(batch_size > 0, "batch size must be positive");
        DataLoader {
            feeder,
            batch_size,
            shuffle: false,
            drop_last: false,
            num_worker: 0,
            seed: 0,
            augment: Augment::default(),
            shuffle_rng: StdRng::seed_from_u64(0),
        }
    }

    pub fn shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    pub fn drop_last(mut self, drop_last: bool) -> Self {
        self.drop_last = drop_last;
        self
    }

    pub fn num_worker(mut self, num_worker: usize) -> Self {
        self.num_worker = num_worker;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self.shuffle_rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn augment(mut self, augment: Augment) -> Self {
        self.augment = augment;
        self
    }

    pub fn feeder(&self) -> &Arc<dyn Feeder> {
        &self.feeder
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Batches per epoch.
    pub fn len(&self) -> usize {
        let n = self.feeder.len();
        if self.drop_last {
            n / self.batch_size
        } else {
            n.div_ceil(self.batch_size)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Starts one pass over the data.
    pub fn iter(&mut self) -> BatchIter {
        let mut order: Vec<usize> = (0..self.feeder.len()).collect();
        if self.shuffle {
            order.shuffle(&mut self.shuffle_rng);
        }
        let mut plan: Vec<Vec<usize>> = order.chunks(self.batch_size).map(<[usize]>::to_vec).collect();
        if self.drop_last && plan.last().map(|b| b.len() < self.batch_size).unwrap_or(false) {
            plan.pop();
        }
        let total = plan.len();

        let source = if self.num_worker == 0 {
            Source::Inline {
                feeder: Arc::clone(&self.feeder),
                plan,
                augment: self.augment,
                rng: StdRng::seed_from_u64(self.seed),
            }
        } else {
            self.spawn_workers(Arc::new(plan))
        };
        BatchIter { next: 0, total, source }
    }

    fn spawn_workers(&self, plan: Arc<Vec<Vec<usize>>>) -> Source {
        let n = self.num_worker;
        let mut receivers = Vec::with_capacity(n);
        let mut handles = Vec::with_capacity(n);

        for w in 0..n {
            let (tx, rx): (SyncSender<Batch>, Receiver<Batch>) = mpsc::sync_channel(PREFETCH);
            let feeder = Arc::clone(&self.feeder);
            let plan = Arc::clone(&plan);
            let augment = self.augment;
            let seed = self.seed.wrapping_add(w as u64);

            let handle = thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(seed);
                for indices in plan.iter().skip(w).step_by(n) {
                    let batch = assemble(feeder.as_ref(), indices, augment, &mut rng);
                    // The consumer hung up; nothing left to do.
                    if tx.send(batch).is_err() {
                        break;
                    }
                }
            });
            receivers.push(rx);
            handles.push(handle);
        }
        Source::Workers { receivers, handles }
    }
}

fn assemble(feeder: &dyn Feeder, indices: &[usize], augment: Augment, rng: &mut StdRng) -> Batch {
    let mut rows = Vec::with_capacity(indices.len());
    let mut labels = Vec::with_capacity(indices.len());
    for &i in indices {
        let mut sample = feeder.sample(i);
        if augment.random_flip && rng.gen_bool(0.5) {
            mirror_x(&mut sample.features, augment.in_channels);
        }
        rows.push(sample.features);
        labels.push(sample.label);
    }
    Batch { features: Matrix::from_data(rows), labels, indices: indices.to_vec() }
}

enum Source {
    Inline {
        feeder: Arc<dyn Feeder>,
        plan: Vec<Vec<usize>>,
        augment: Augment,
        rng: StdRng,
    },
    Workers {
        receivers: Vec<Receiver<Batch>>,
        handles: Vec<JoinHandle<()>>,
    },
}

/// One epoch of batches, in plan order regardless of worker count.
pub struct BatchIter {
    next: usize,
    total: usize,
    source: Source,
}

impl BatchIter {
    pub fn total(&self) -> usize {
        self.total
    }
}

impl Iterator for BatchIter {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.total {
            return None;
        }
        let i = self.next;
        self.next += 1;

        match &mut self.source {
            Source::Inline { feeder, plan, augment, rng } => {
                Some(Ok(assemble(feeder.as_ref(), &plan[i], *augment, rng)))
            }
            Source::Workers { receivers, .. } => {
                let w = i % receivers.len();
                match receivers[w].recv() {
                    Ok(batch) => Some(Ok(batch)),
                    Err(_) => {
                        self.next = self.total;
                        Some(Err(TrainError::LoaderWorker(w)))
                    }
                }
            }
        }
    }
}

impl Drop for BatchIter {
    fn drop(&mut self) {
        if let Source::Workers { receivers, handles } = &mut self.source {
            // Unblock workers waiting on a full channel before joining them.
            receivers.clear();
            for handle in handles.drain(..) {
                if handle.join().is_err() {
                    tracing::error!("data loader worker panicked");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feeder::memory::InMemoryFeeder;
    use crate::feeder::feeder::Sample;

    fn feeder(n: usize) -> Arc<dyn Feeder> {
        let features = (0..n).map(|i| vec![i as f64, 1.0]).collect();
        Arc::new(InMemoryFeeder::new(features, (0..n).map(|i| i % 3).collect()))
    }

    fn collect(loader: &mut DataLoader) -> Vec<Vec<usize>> {
        loader.iter().map(|b| b.unwrap().indices).collect()
    }

    #[test]
    fn drop_last_discards_partial_batch() {
        let mut keep = DataLoader::new(feeder(10), 4);
        assert_eq!(keep.len(), 3);
        assert_eq!(collect(&mut keep).last().unwrap(), &vec![8, 9]);

        let mut drop = DataLoader::new(feeder(10), 4).drop_last(true);
        assert_eq!(drop.len(), 2);
        assert_eq!(collect(&mut drop).len(), 2);
    }

    #[test]
    fn workers_preserve_batch_order() {
        let mut inline = DataLoader::new(feeder(23), 3).shuffle(true).seed(5);
        let mut threaded = DataLoader::new(feeder(23), 3).shuffle(true).seed(5).num_worker(3);
        assert_eq!(collect(&mut inline), collect(&mut threaded));
    }

    #[test]
    fn shuffle_changes_between_epochs_but_is_seeded() {
        let mut a = DataLoader::new(feeder(20), 20).shuffle(true).seed(1);
        let mut b = DataLoader::new(feeder(20), 20).shuffle(true).seed(1);
        let first = collect(&mut a);
        assert_eq!(first, collect(&mut b));
        assert_ne!(first, collect(&mut a));
    }

    #[test]
    fn early_drop_joins_workers() {
        let mut loader = DataLoader::new(feeder(50), 1).num_worker(2);
        let mut iter = loader.iter();
        assert!(iter.next().is_some());
        drop(iter);
    }

    struct Exploding;

    impl Feeder for Exploding {
        fn len(&self) -> usize { 4 }
        fn feature_dim(&self) -> usize { 1 }
        fn sample(&self, index: usize) -> Sample {
            if index == 2 {
                panic!("corrupt sample");
            }
            Sample { features: vec![0.0], label: 0 }
        }
        fn label(&self, _index: usize) -> usize { 0 }
        fn sample_name(&self, index: usize) -> String { index.to_string() }
    }

    #[test]
    fn dead_worker_is_reported() {
        let mut loader = DataLoader::new(Arc::new(Exploding), 1).num_worker(2);
        let results: Vec<_> = loader.iter().collect();
        assert!(results[0].is_ok());
        assert!(results[1].is_ok());
        assert!(matches!(results[2], Err(TrainError::LoaderWorker(0))));
        assert_eq!(results.len(), 3);
    }
}
