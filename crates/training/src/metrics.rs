//! Per-class precision / recall / AP / F1 from ranked detections.

use serde::{Deserialize, Serialize};

/// Columns are aligned: entry `i` of every vector belongs to `classes[i]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApPerClass {
    pub precision: Vec<f32>,
    pub recall: Vec<f32>,
    pub ap: Vec<f32>,
    pub f1: Vec<f32>,
    pub classes: Vec<usize>,
}

/// VOC-style AP: area under the monotone precision envelope, summed where recall changes.
pub fn compute_ap(recall: &[f32], precision: &[f32]) -> f32 {
    let mut mrec = Vec::with_capacity(recall.len() + 2);
    mrec.push(0.0);
    mrec.extend_from_slice(recall);
    mrec.push(1.0);
    let mut mpre = Vec::with_capacity(precision.len() + 2);
    mpre.push(0.0);
    mpre.extend_from_slice(precision);
    mpre.push(0.0);

    for i in (1..mpre.len()).rev() {
        mpre[i - 1] = mpre[i - 1].max(mpre[i]);
    }
    (0..mrec.len() - 1)
        .filter(|&i| mrec[i + 1] != mrec[i])
        .map(|i| (mrec[i + 1] - mrec[i]) * mpre[i + 1])
        .sum()
}

/// `tp`, `conf` and `pred_cls` describe every detection; `target_cls` every ground-truth box.
/// Classes are the distinct target classes in ascending order.
pub fn ap_per_class(tp: &[f32], conf: &[f32], pred_cls: &[usize], target_cls: &[usize]) -> ApPerClass {
    let mut order: Vec<usize> = (0..tp.len()).collect();
    order.sort_by(|&a, &b| {
        conf[b]
            .partial_cmp(&conf[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut classes: Vec<usize> = target_cls.to_vec();
    classes.sort_unstable();
    classes.dedup();

    let mut out = ApPerClass::default();
    for &c in &classes {
        let n_gt = target_cls.iter().filter(|&&t| t == c).count();
        let ranked: Vec<f32> = order
            .iter()
            .filter(|&&i| pred_cls[i] == c)
            .map(|&i| tp[i])
            .collect();

        if ranked.is_empty() || n_gt == 0 {
            out.ap.push(0.0);
            out.recall.push(0.0);
            out.precision.push(0.0);
        } else {
            let mut tpc = 0.0f32;
            let mut fpc = 0.0f32;
            let mut recall_curve = Vec::with_capacity(ranked.len());
            let mut precision_curve = Vec::with_capacity(ranked.len());
            for hit in &ranked {
                tpc += hit;
                fpc += 1.0 - hit;
                recall_curve.push(tpc / (n_gt as f32 + 1e-16));
                precision_curve.push(tpc / (tpc + fpc));
            }
            out.recall.push(*recall_curve.last().unwrap_or(&0.0));
            out.precision.push(*precision_curve.last().unwrap_or(&0.0));
            out.ap.push(compute_ap(&recall_curve, &precision_curve));
        }
        out.classes.push(c);
    }
    out.f1 = out
        .precision
        .iter()
        .zip(&out.recall)
        .map(|(p, r)| 2.0 * p * r / (p + r + 1e-16))
        .collect();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perfect_detections_score_one() {
        let m = ap_per_class(&[1.0, 1.0], &[0.9, 0.8], &[0, 1], &[0, 1]);
        assert_eq!(m.classes, vec![0, 1]);
        for ap in &m.ap {
            assert!((ap - 1.0).abs() < 1e-5);
        }
        assert!((m.f1[0] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn ranked_false_positive_halves_precision_tail() {
        // ranked: TP, FP, TP with two targets of class 0
        let m = ap_per_class(&[1.0, 0.0, 1.0], &[0.9, 0.8, 0.7], &[0, 0, 0], &[0, 0]);
        assert!((m.recall[0] - 1.0).abs() < 1e-5);
        assert!((m.precision[0] - 2.0 / 3.0).abs() < 1e-5);
        // 0.5 * 1.0 + 0.5 * 2/3
        assert!((m.ap[0] - (0.5 + 1.0 / 3.0)).abs() < 1e-5);
    }

    #[test]
    fn class_without_predictions_scores_zero() {
        let m = ap_per_class(&[1.0], &[0.9], &[0], &[0, 2]);
        assert_eq!(m.classes, vec![0, 2]);
        assert_eq!(m.ap[1], 0.0);
        assert_eq!(m.f1[1], 0.0);
    }

    #[test]
    fn compute_ap_uses_precision_envelope() {
        let ap = compute_ap(&[0.5, 0.5, 1.0], &[1.0, 0.5, 0.6]);
        assert!((ap - (0.5 * 1.0 + 0.5 * 0.6)).abs() < 1e-6);
    }
}
