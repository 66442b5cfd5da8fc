//! Batched iteration over residue environments.
use crate::environment::ResidueEnvironmentsDataset;
use crate::transform::ToTensor;
use anyhow::Result;
use candle_core::Tensor;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// `(features, one_hot_labels)`
pub type Batch = (Tensor, Tensor);

/// Anything that can be walked once per epoch as a stream of batches.
pub trait BatchStream {
    fn batches(&mut self) -> Box<dyn Iterator<Item = Result<Batch>> + '_>;
}

/// Pre-built batches, replayed in order on every pass.
impl BatchStream for Vec<Batch> {
    fn batches(&mut self) -> Box<dyn Iterator<Item = Result<Batch>> + '_> {
        Box::new(self.iter().map(|(x, y)| Ok((x.clone(), y.clone()))))
    }
}

#[derive(Debug, Clone)]
pub struct DataLoaderConfig {
    pub batch_size: usize,
    pub shuffle: bool,
    pub drop_last: bool,
    pub seed: u64,
}

impl DataLoaderConfig {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            shuffle: false,
            drop_last: false,
            seed: 0,
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
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

pub struct DataLoader {
    dataset: ResidueEnvironmentsDataset,
    transformer: ToTensor,
    config: DataLoaderConfig,
    rng: StdRng,
}

impl DataLoader {
    pub fn new(
        dataset: ResidueEnvironmentsDataset,
        transformer: ToTensor,
        config: DataLoaderConfig,
    ) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            dataset,
            transformer,
            config,
            rng,
        }
    }
    pub fn dataset(&self) -> &ResidueEnvironmentsDataset {
        &self.dataset
    }
    pub fn config(&self) -> &DataLoaderConfig {
        &self.config
    }

    /// Number of batches one pass yields.
    pub fn num_batches(&self) -> usize {
        let n = self.dataset.len();
        let bs = self.config.batch_size.max(1);
        if self.config.drop_last {
            n / bs
        } else {
            n.div_ceil(bs)
        }
    }

    /// Dataset indices for one pass, grouped into batches.
    pub fn batch_indices(&mut self) -> Vec<Vec<usize>> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.config.shuffle {
            order.shuffle(&mut self.rng);
        }
        let mut batches: Vec<Vec<usize>> = order
            .chunks(self.config.batch_size.max(1))
            .map(|chunk| chunk.to_vec())
            .collect();
        if self.config.drop_last
            && batches
                .last()
                .is_some_and(|b| b.len() < self.config.batch_size)
        {
            batches.pop();
        }
        batches
    }
}

impl BatchStream for DataLoader {
    fn batches(&mut self) -> Box<dyn Iterator<Item = Result<Batch>> + '_> {
        let indices = self.batch_indices();
        let dataset = &self.dataset;
        let transformer = &self.transformer;
        Box::new(indices.into_iter().map(move |idxs| {
            let envs: Vec<_> = idxs.iter().filter_map(|&i| dataset.get(i)).collect();
            transformer.collate_cat(&envs)
        }))
    }
}
