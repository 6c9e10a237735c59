//! Batch iteration for training and validation.

use crate::index::index_split;
use crate::loader::load_sample;
use crate::types::{
    BevDatasetError, BevSample, DataLoaderConfig, DatasetResult, SampleIndex, TargetRow,
};
use burn::tensor::{backend::Backend, Tensor, TensorData};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

/// Build the training iterator (shuffled, augmented as configured).
pub fn create_train_dataloader(cfg: DataLoaderConfig) -> DatasetResult<BatchIter> {
    let indices = index_split(&cfg.dataset_dir, &cfg.split)?;
    BatchIter::new(indices, cfg)
}

/// Build the validation iterator: no shuffle, no flips, keeps the last partial batch.
pub fn create_val_dataloader(cfg: DataLoaderConfig) -> DatasetResult<BatchIter> {
    let cfg = DataLoaderConfig {
        shuffle: false,
        hflip_prob: 0.0,
        drop_last: false,
        ..cfg
    };
    let indices = index_split(&cfg.dataset_dir, &cfg.split)?;
    BatchIter::new(indices, cfg)
}

/// A batch still on the host, ready to be split across devices.
#[derive(Debug, Clone)]
pub struct HostBatch {
    pub ids: Vec<String>,
    /// `[N, 3, S, S]` flattened.
    pub images: Vec<f32>,
    pub img_size: usize,
    pub targets: Vec<TargetRow>,
}

impl HostBatch {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    fn from_samples(samples: Vec<BevSample>, img_size: usize) -> Self {
        let mut ids = Vec::with_capacity(samples.len());
        let mut images = Vec::with_capacity(samples.len() * 3 * img_size * img_size);
        let mut targets = Vec::new();
        for (b, sample) in samples.into_iter().enumerate() {
            for label in &sample.labels {
                let (im, re) = label.yaw_components();
                targets.push([
                    b as f32,
                    label.class_id as f32,
                    label.x,
                    label.y,
                    label.z,
                    label.h,
                    label.w,
                    label.l,
                    im,
                    re,
                ]);
            }
            images.extend_from_slice(&sample.image_chw);
            ids.push(sample.id);
        }
        Self {
            ids,
            images,
            img_size,
            targets,
        }
    }

    /// Partition into at most `parts` contiguous sub-batches, re-indexing the
    /// target rows so each sub-batch counts from zero.
    pub fn split(self, parts: usize) -> Vec<HostBatch> {
        let parts = parts.clamp(1, self.len().max(1));
        if parts == 1 {
            return vec![self];
        }
        let per_image = 3 * self.img_size * self.img_size;
        let base = self.len() / parts;
        let extra = self.len() % parts;
        let mut out = Vec::with_capacity(parts);
        let mut start = 0usize;
        for p in 0..parts {
            let count = base + usize::from(p < extra);
            let end = start + count;
            let targets = self
                .targets
                .iter()
                .filter(|t| {
                    let b = t[0] as usize;
                    b >= start && b < end
                })
                .map(|t| {
                    let mut row = *t;
                    row[0] -= start as f32;
                    row
                })
                .collect();
            out.push(HostBatch {
                ids: self.ids[start..end].to_vec(),
                images: self.images[start * per_image..end * per_image].to_vec(),
                img_size: self.img_size,
                targets,
            });
            start = end;
        }
        out
    }

    pub fn to_device<B: Backend>(&self, device: &B::Device) -> BevBatch<B> {
        let s = self.img_size;
        let images = Tensor::<B, 4>::from_data(
            TensorData::new(self.images.clone(), [self.len(), 3, s, s]),
            device,
        );
        BevBatch {
            ids: self.ids.clone(),
            images,
            targets: self.targets.clone(),
        }
    }
}

/// A batch with its rasters on a Burn device. Targets stay on the host; the
/// loss builds its dense target tensors from them.
#[derive(Debug, Clone)]
pub struct BevBatch<B: Backend> {
    pub ids: Vec<String>,
    pub images: Tensor<B, 4>,
    pub targets: Vec<TargetRow>,
}

pub struct BatchIter {
    indices: Vec<SampleIndex>,
    order: Vec<usize>,
    cursor: usize,
    cfg: DataLoaderConfig,
    rng: StdRng,
    pool: rayon::ThreadPool,
    permissive_errors: bool,
    skipped_errors: usize,
}

impl BatchIter {
    pub fn new(mut indices: Vec<SampleIndex>, cfg: DataLoaderConfig) -> DatasetResult<Self> {
        if indices.is_empty() {
            return Err(BevDatasetError::EmptySplit {
                root: cfg.dataset_dir.clone(),
                split: cfg.split.clone(),
            });
        }
        if let Some(limit) = cfg.num_samples {
            indices.truncate(limit.max(1));
        }
        let rng = match cfg.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_rng(&mut rand::rng()),
        };
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(cfg.num_workers)
            .build()
            .map_err(|e| BevDatasetError::Other(format!("failed to build loader pool: {e}")))?;
        let permissive_errors = std::env::var("BEV_DATASET_PERMISSIVE")
            .ok()
            .map(|v| v.trim().to_ascii_lowercase())
            .map(|v| v == "1" || v == "true" || v == "on")
            .unwrap_or(false);
        let mut iter = Self {
            order: (0..indices.len()).collect(),
            indices,
            cursor: 0,
            cfg,
            rng,
            pool,
            permissive_errors,
            skipped_errors: 0,
        };
        iter.reset();
        Ok(iter)
    }

    /// Rewind for a new epoch, reshuffling when configured.
    pub fn reset(&mut self) {
        self.cursor = 0;
        if self.cfg.shuffle {
            self.order.shuffle(&mut self.rng);
        }
    }

    pub fn num_samples(&self) -> usize {
        self.indices.len()
    }

    /// Batches per epoch.
    pub fn len(&self) -> usize {
        let bs = self.cfg.batch_size.max(1);
        if self.cfg.drop_last {
            self.indices.len() / bs
        } else {
            self.indices.len().div_ceil(bs)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn skipped_errors(&self) -> usize {
        self.skipped_errors
    }

    pub fn next_host_batch(&mut self) -> DatasetResult<Option<HostBatch>> {
        let bs = self.cfg.batch_size.max(1);
        loop {
            if self.cursor >= self.order.len() {
                return Ok(None);
            }
            let end = (self.cursor + bs).min(self.order.len());
            if self.cfg.drop_last && end - self.cursor < bs {
                self.cursor = self.order.len();
                return Ok(None);
            }
            // Flip decisions come from the iterator's rng so seeded runs repeat.
            let jobs: Vec<(usize, bool)> = self.order[self.cursor..end]
                .iter()
                .map(|&i| (i, self.rng.random::<f32>() < self.cfg.hflip_prob))
                .collect();
            self.cursor = end;

            let indices = &self.indices;
            let cfg = &self.cfg;
            let loaded: Vec<(usize, DatasetResult<BevSample>)> = self.pool.install(|| {
                jobs.par_iter()
                    .map(|&(i, flip)| (i, load_sample(&indices[i], cfg, flip)))
                    .collect()
            });

            let mut samples = Vec::with_capacity(loaded.len());
            for (i, res) in loaded {
                match res {
                    Ok(sample) => samples.push(sample),
                    Err(e) if self.permissive_errors => {
                        log::warn!("skipping sample {}: {e}", self.indices[i].id);
                        self.skipped_errors += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
            if samples.is_empty() {
                continue;
            }
            return Ok(Some(HostBatch::from_samples(
                samples,
                self.cfg.img_size as usize,
            )));
        }
    }

    pub fn next_batch<B: Backend>(
        &mut self,
        device: &B::Device,
    ) -> DatasetResult<Option<BevBatch<B>>> {
        Ok(self.next_host_batch()?.map(|b| b.to_device::<B>(device)))
    }
}
