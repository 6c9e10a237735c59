//! Loading a single BEV sample from disk.

use crate::types::{BevDatasetError, BevSample, DataLoaderConfig, DatasetResult, SampleIndex};
use data_contracts::parse_label_file;
use image::imageops::{self, FilterType};
use std::fs;

/// Decode the raster and labels for one sample, resizing to `cfg.img_size` and
/// mirroring left/right when `flip` is set.
pub fn load_sample(
    idx: &SampleIndex,
    cfg: &DataLoaderConfig,
    flip: bool,
) -> DatasetResult<BevSample> {
    if !idx.image_path.exists() {
        return Err(BevDatasetError::MissingImage {
            id: idx.id.clone(),
            path: idx.image_path.clone(),
        });
    }
    let img = image::open(&idx.image_path)
        .map_err(|source| BevDatasetError::Image {
            path: idx.image_path.clone(),
            source,
        })?
        .to_rgb8();

    let size = cfg.img_size;
    let mut img = if img.dimensions() != (size, size) {
        imageops::resize(&img, size, size, FilterType::Triangle)
    } else {
        img
    };
    if flip {
        imageops::flip_horizontal_in_place(&mut img);
    }

    let raw = fs::read_to_string(&idx.label_path).map_err(|source| BevDatasetError::Io {
        path: idx.label_path.clone(),
        source,
    })?;
    let mut labels = parse_label_file(&raw).map_err(|source| BevDatasetError::Label {
        path: idx.label_path.clone(),
        source,
    })?;
    if let Some(bad) = labels.iter().find(|l| l.class_id >= cfg.num_classes) {
        return Err(BevDatasetError::UnknownClass {
            path: idx.label_path.clone(),
            class_id: bad.class_id,
            num_classes: cfg.num_classes,
        });
    }
    if flip {
        labels = labels.iter().map(|l| l.flipped_horizontal()).collect();
    }

    let pixels = (size * size) as usize;
    let mut image_chw = vec![0.0f32; 3 * pixels];
    for (i, p) in img.pixels().enumerate() {
        image_chw[i] = p[0] as f32 / 255.0;
        image_chw[pixels + i] = p[1] as f32 / 255.0;
        image_chw[2 * pixels + i] = p[2] as f32 / 255.0;
    }

    Ok(BevSample {
        id: idx.id.clone(),
        image_chw,
        labels,
    })
}
