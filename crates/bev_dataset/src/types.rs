//! Core types, error definitions and loader configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

pub type DatasetResult<T> = Result<T, BevDatasetError>;

/// One target row: `[batch_idx, class, x, y, z, h, w, l, im, re]`.
pub type TargetRow = [f32; TARGET_COLS];
pub const TARGET_COLS: usize = 10;

#[derive(Debug, Error)]
pub enum BevDatasetError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("image decode error at {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("label error at {path}: {source}")]
    Label {
        path: PathBuf,
        #[source]
        source: data_contracts::LabelError,
    },
    #[error("image file missing for sample {id}: {path}")]
    MissingImage { id: String, path: PathBuf },
    #[error("class id {class_id} in {path} exceeds configured class count {num_classes}")]
    UnknownClass {
        path: PathBuf,
        class_id: usize,
        num_classes: usize,
    },
    #[error("split {split:?} under {root} has no samples")]
    EmptySplit { root: PathBuf, split: String },
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleIndex {
    pub id: String,
    pub image_path: PathBuf,
    pub label_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct BevSample {
    pub id: String,
    /// Raster in CHW layout, normalized to [0, 1], `img_size` x `img_size`.
    pub image_chw: Vec<f32>,
    pub labels: Vec<data_contracts::ObjectLabel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataLoaderConfig {
    pub dataset_dir: PathBuf,
    /// Split name; resolves to `ImageSets/<split>.txt`.
    pub split: String,
    /// Square raster edge in pixels; rasters of another size are resized.
    pub img_size: u32,
    pub batch_size: usize,
    /// Loader threads; 0 lets rayon pick.
    pub num_workers: usize,
    pub shuffle: bool,
    pub seed: Option<u64>,
    /// Probability of mirroring a sample left/right.
    pub hflip_prob: f32,
    pub num_classes: usize,
    /// Cap on the number of indexed samples (debug subsets).
    pub num_samples: Option<usize>,
    pub drop_last: bool,
}

impl Default for DataLoaderConfig {
    fn default() -> Self {
        Self {
            dataset_dir: PathBuf::from("dataset/kitti"),
            split: "train".to_string(),
            img_size: 608,
            batch_size: 4,
            num_workers: 4,
            shuffle: true,
            seed: None,
            hflip_prob: 0.5,
            num_classes: 3,
            num_samples: None,
            drop_last: false,
        }
    }
}
