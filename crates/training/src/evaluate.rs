//! Validation pass: inference, rotated NMS, TP matching and per-class AP.

use anyhow::Context;
use bev_dataset::{BatchIter, TargetRow};
use burn::tensor::backend::Backend;
use indicatif::{ProgressBar, ProgressStyle};
use models::{decode_predictions, nms_rotated, BevBox, BevDetector, Detection};
use serde::{Deserialize, Serialize};

use crate::config::TrainConfig;
use crate::metrics::{ap_per_class, ApPerClass};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvalSettings {
    pub conf_thresh: f32,
    pub nms_thresh: f32,
    pub iou_thresh: f32,
}

impl From<&TrainConfig> for EvalSettings {
    fn from(cfg: &TrainConfig) -> Self {
        Self {
            conf_thresh: cfg.conf_thresh,
            nms_thresh: cfg.nms_thresh,
            iou_thresh: cfg.iou_thresh,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvalResult {
    pub per_class: ApPerClass,
    pub num_images: usize,
    pub num_targets: usize,
    pub num_detections: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EvalSummary {
    pub precision: f32,
    pub recall: f32,
    pub map: f32,
    pub f1: f32,
}

fn mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f32>() / values.len() as f32
    }
}

impl EvalResult {
    pub fn means(&self) -> EvalSummary {
        EvalSummary {
            precision: mean(&self.per_class.precision),
            recall: mean(&self.per_class.recall),
            map: mean(&self.per_class.ap),
            f1: mean(&self.per_class.f1),
        }
    }
}

/// Drop low-confidence cells, then class-aware rotated NMS. Output is sorted by score.
pub fn postprocess(detections: Vec<Detection>, settings: &EvalSettings) -> Vec<Detection> {
    let kept: Vec<Detection> = detections
        .into_iter()
        .filter(|d| d.conf >= settings.conf_thresh)
        .collect();
    let boxes: Vec<BevBox> = kept.iter().map(Detection::bev_box).collect();
    let scores: Vec<f32> = kept.iter().map(Detection::score).collect();
    let classes: Vec<usize> = kept.iter().map(|d| d.cls_id).collect();
    nms_rotated(&boxes, &scores, &classes, settings.nms_thresh)
        .into_iter()
        .map(|i| kept[i])
        .collect()
}

fn target_box(row: &TargetRow) -> BevBox {
    BevBox::from_components(row[2], row[3], row[6], row[7], row[8], row[9])
}

/// Per-detection statistics for one batch: `(tp, score, class)`.
/// Detections are visited by descending score; each claims the best unmatched
/// same-class target of its image when the rotated IoU reaches `iou_thresh`.
pub fn batch_statistics(
    outputs: &[Vec<Detection>],
    targets: &[TargetRow],
    iou_thresh: f32,
) -> Vec<(f32, f32, usize)> {
    let mut stats = Vec::new();
    for (image, dets) in outputs.iter().enumerate() {
        let image_targets: Vec<&TargetRow> = targets
            .iter()
            .filter(|t| t[0] as usize == image)
            .collect();
        let boxes: Vec<BevBox> = image_targets.iter().map(|t| target_box(t)).collect();
        let mut matched = vec![false; image_targets.len()];

        let mut order: Vec<usize> = (0..dets.len()).collect();
        order.sort_by(|&a, &b| {
            dets[b]
                .score()
                .partial_cmp(&dets[a].score())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        for i in order {
            let det = &dets[i];
            let pred = det.bev_box();
            let best = image_targets
                .iter()
                .enumerate()
                .filter(|(k, t)| !matched[*k] && t[1] as usize == det.cls_id)
                .map(|(k, _)| (k, models::rotated_iou(&pred, &boxes[k])))
                .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
            let tp = match best {
                Some((k, iou)) if iou >= iou_thresh => {
                    matched[k] = true;
                    1.0
                }
                _ => 0.0,
            };
            stats.push((tp, det.score(), det.cls_id));
        }
    }
    stats
}

/// Run the model over the whole loader and compute per-class P/R/AP/F1.
pub fn evaluate_map<B: Backend>(
    loader: &mut BatchIter,
    model: &BevDetector<B>,
    settings: &EvalSettings,
    device: &B::Device,
) -> anyhow::Result<EvalResult> {
    loader.reset();
    let cfg = model.config.0.clone();
    let pb = ProgressBar::new(loader.len() as u64);
    pb.set_style(
        ProgressStyle::with_template("eval {bar:40.cyan/blue} {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );

    let mut tp = Vec::new();
    let mut conf = Vec::new();
    let mut pred_cls = Vec::new();
    let mut target_cls = Vec::new();
    let mut result = EvalResult::default();

    while let Some(batch) = loader
        .next_batch::<B>(device)
        .context("failed to load validation batch")?
    {
        let raw = model.forward(batch.images);
        let outputs: Vec<Vec<Detection>> = decode_predictions(raw, &cfg)
            .into_iter()
            .map(|dets| postprocess(dets, settings))
            .collect();
        result.num_images += outputs.len();
        result.num_detections += outputs.iter().map(Vec::len).sum::<usize>();
        result.num_targets += batch.targets.len();
        target_cls.extend(batch.targets.iter().map(|t| t[1] as usize));
        for (hit, score, class) in batch_statistics(&outputs, &batch.targets, settings.iou_thresh) {
            tp.push(hit);
            conf.push(score);
            pred_cls.push(class);
        }
        pb.inc(1);
    }
    pb.finish_and_clear();

    result.per_class = ap_per_class(&tp, &conf, &pred_cls, &target_cls);
    log::info!(
        "evaluated {} images: {} targets, {} detections after NMS",
        result.num_images,
        result.num_targets,
        result.num_detections
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x: f32, y: f32, conf: f32, cls_id: usize) -> Detection {
        Detection {
            x,
            y,
            z: 0.0,
            h: 0.1,
            w: 0.1,
            l: 0.2,
            im: 0.0,
            re: 1.0,
            conf,
            cls_conf: 1.0,
            cls_id,
        }
    }

    fn target(image: usize, class: usize, x: f32, y: f32) -> TargetRow {
        [image as f32, class as f32, x, y, 0.0, 0.1, 0.1, 0.2, 0.0, 1.0]
    }

    #[test]
    fn duplicate_detection_is_false_positive() {
        let outputs = vec![vec![det(0.5, 0.5, 0.9, 0), det(0.5, 0.5, 0.8, 0)]];
        let stats = batch_statistics(&outputs, &[target(0, 0, 0.5, 0.5)], 0.5);
        assert_eq!(stats, vec![(1.0, 0.9, 0), (0.0, 0.8, 0)]);
    }

    #[test]
    fn wrong_class_never_matches() {
        let outputs = vec![vec![det(0.5, 0.5, 0.9, 1)]];
        let stats = batch_statistics(&outputs, &[target(0, 0, 0.5, 0.5)], 0.5);
        assert_eq!(stats[0].0, 0.0);
    }

    #[test]
    fn targets_match_only_within_their_image() {
        let outputs = vec![vec![], vec![det(0.3, 0.3, 0.9, 0)]];
        let stats = batch_statistics(&outputs, &[target(0, 0, 0.3, 0.3)], 0.5);
        assert_eq!(stats, vec![(0.0, 0.9, 0)]);
    }

    #[test]
    fn postprocess_filters_and_suppresses() {
        let settings = EvalSettings {
            conf_thresh: 0.5,
            nms_thresh: 0.4,
            iou_thresh: 0.5,
        };
        let kept = postprocess(
            vec![
                det(0.5, 0.5, 0.7, 0),
                det(0.501, 0.5, 0.9, 0),
                det(0.2, 0.2, 0.3, 0),
                det(0.5, 0.5, 0.6, 1),
            ],
            &settings,
        );
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].conf, 0.9);
        assert_eq!(kept[1].cls_id, 1);
    }
}
