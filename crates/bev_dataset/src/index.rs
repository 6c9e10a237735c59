//! Sample indexing for a dataset split.

use crate::types::{BevDatasetError, DatasetResult, SampleIndex};
use std::fs;
use std::path::Path;

pub const IMAGE_DIR: &str = "bev";
pub const LABEL_DIR: &str = "labels";
pub const SPLIT_DIR: &str = "ImageSets";

/// Index the samples of `split`. Uses `ImageSets/<split>.txt` when present,
/// otherwise every `labels/*.txt` in name order.
pub fn index_split(root: &Path, split: &str) -> DatasetResult<Vec<SampleIndex>> {
    let split_file = root.join(SPLIT_DIR).join(format!("{split}.txt"));
    let ids = if split_file.exists() {
        let raw = fs::read_to_string(&split_file).map_err(|source| BevDatasetError::Io {
            path: split_file.clone(),
            source,
        })?;
        raw.lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect::<Vec<_>>()
    } else {
        log::warn!(
            "split file {} not found; indexing every label under {}",
            split_file.display(),
            root.join(LABEL_DIR).display()
        );
        scan_label_ids(root)?
    };

    let indices: Vec<SampleIndex> = ids
        .into_iter()
        .map(|id| SampleIndex {
            image_path: root.join(IMAGE_DIR).join(format!("{id}.png")),
            label_path: root.join(LABEL_DIR).join(format!("{id}.txt")),
            id,
        })
        .collect();
    if indices.is_empty() {
        return Err(BevDatasetError::EmptySplit {
            root: root.to_path_buf(),
            split: split.to_string(),
        });
    }
    Ok(indices)
}

fn scan_label_ids(root: &Path) -> DatasetResult<Vec<String>> {
    let labels_dir = root.join(LABEL_DIR);
    let entries = fs::read_dir(&labels_dir).map_err(|source| BevDatasetError::Io {
        path: labels_dir.clone(),
        source,
    })?;
    let mut ids = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| BevDatasetError::Io {
            path: labels_dir.clone(),
            source,
        })?;
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) != Some("txt") {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            ids.push(stem.to_string());
        }
    }
    ids.sort();
    Ok(ids)
}
