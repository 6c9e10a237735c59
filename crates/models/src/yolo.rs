//! YOLO target assignment, loss, and host-side decoding for the BEV head.
//!
//! Target rows are `[batch_idx, class, x, y, z, h, w, l, im, re]` with `x, y, w, l`
//! normalised to the input raster.

use burn::tensor::activation::sigmoid;
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use serde::{Deserialize, Serialize};

use crate::detector::{DetectorConfig, BOX_ATTRS};
use crate::geometry::{shape_iou, BevBox};

const EPS: f32 = 1e-7;

/// Per-batch loss components, in reporting order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct YoloMetrics {
    pub grid_size: f32,
    pub loss: f32,
    pub loss_x: f32,
    pub loss_y: f32,
    pub loss_z: f32,
    pub loss_w: f32,
    pub loss_h: f32,
    pub loss_l: f32,
    pub loss_im: f32,
    pub loss_re: f32,
    pub loss_obj: f32,
    pub loss_cls: f32,
    pub cls_acc: f32,
    pub conf_obj: f32,
    pub conf_noobj: f32,
}

impl YoloMetrics {
    pub fn as_pairs(&self) -> [(&'static str, f32); 15] {
        [
            ("grid_size", self.grid_size),
            ("loss", self.loss),
            ("loss_x", self.loss_x),
            ("loss_y", self.loss_y),
            ("loss_z", self.loss_z),
            ("loss_w", self.loss_w),
            ("loss_h", self.loss_h),
            ("loss_l", self.loss_l),
            ("loss_im", self.loss_im),
            ("loss_re", self.loss_re),
            ("loss_obj", self.loss_obj),
            ("loss_cls", self.loss_cls),
            ("cls_acc", self.cls_acc),
            ("conf_obj", self.conf_obj),
            ("conf_noobj", self.conf_noobj),
        ]
    }

    /// Sample-weighted mean of per-replica metrics.
    pub fn weighted_mean(parts: &[(YoloMetrics, usize)]) -> YoloMetrics {
        let total: usize = parts.iter().map(|(_, n)| *n).sum();
        if total == 0 {
            return YoloMetrics::default();
        }
        let mut acc = [0.0f32; 15];
        for (m, n) in parts {
            for (slot, (_, v)) in acc.iter_mut().zip(m.as_pairs()) {
                *slot += v * *n as f32;
            }
        }
        let f = |i: usize| acc[i] / total as f32;
        YoloMetrics {
            grid_size: f(0),
            loss: f(1),
            loss_x: f(2),
            loss_y: f(3),
            loss_z: f(4),
            loss_w: f(5),
            loss_h: f(6),
            loss_l: f(7),
            loss_im: f(8),
            loss_re: f(9),
            loss_obj: f(10),
            loss_cls: f(11),
            cls_acc: f(12),
            conf_obj: f(13),
            conf_noobj: f(14),
        }
    }
}

/// Dense host-side targets, each plane laid out `[N, A, G, G]` (classes `[N, A, C, G, G]`).
#[derive(Debug, Clone)]
pub struct YoloTargets {
    pub batch: usize,
    pub anchors: usize,
    pub grid: usize,
    pub classes: usize,
    pub obj_mask: Vec<f32>,
    pub noobj_mask: Vec<f32>,
    pub tx: Vec<f32>,
    pub ty: Vec<f32>,
    pub tz: Vec<f32>,
    pub th: Vec<f32>,
    pub tw: Vec<f32>,
    pub tl: Vec<f32>,
    pub tim: Vec<f32>,
    pub tre: Vec<f32>,
    pub tcls: Vec<f32>,
    pub cls_mask: Vec<f32>,
    /// `(cell index, class)` for every assigned target.
    pub assigned: Vec<(usize, usize)>,
}

impl YoloTargets {
    pub fn cell(&self, b: usize, a: usize, j: usize, i: usize) -> usize {
        ((b * self.anchors + a) * self.grid + j) * self.grid + i
    }

    fn class_cell(&self, cell: usize, c: usize) -> usize {
        let plane = self.grid * self.grid;
        let ba = cell / plane;
        let ji = cell % plane;
        (ba * self.classes + c) * plane + ji
    }

    pub fn num_obj(&self) -> usize {
        self.obj_mask.iter().filter(|v| **v > 0.5).count()
    }
}

/// Assign each target to the grid cell holding its centre and the anchor with the best
/// `w`/`l` shape IoU. Anchors whose shape IoU exceeds `ignore_thresh` are excluded from
/// the no-object term.
pub fn build_targets(
    targets: &[[f32; 10]],
    batch: usize,
    cfg: &DetectorConfig,
) -> YoloTargets {
    let grid = cfg.grid_size();
    let anchors = cfg.anchors.len();
    let classes = cfg.num_classes;
    let stride = cfg.stride() as f32;
    let plane = batch * anchors * grid * grid;
    let mut t = YoloTargets {
        batch,
        anchors,
        grid,
        classes,
        obj_mask: vec![0.0; plane],
        noobj_mask: vec![1.0; plane],
        tx: vec![0.0; plane],
        ty: vec![0.0; plane],
        tz: vec![0.0; plane],
        th: vec![0.0; plane],
        tw: vec![0.0; plane],
        tl: vec![0.0; plane],
        tim: vec![0.0; plane],
        tre: vec![0.0; plane],
        tcls: vec![0.0; plane * classes],
        cls_mask: vec![0.0; plane * classes],
        assigned: Vec::new(),
    };
    let anchor_grid: Vec<[f32; 2]> = cfg
        .anchors
        .iter()
        .map(|[w, l]| [w / stride, l / stride])
        .collect();
    let g = grid as f32;

    for row in targets {
        let b = row[0] as usize;
        let class = row[1] as usize;
        if b >= batch || class >= classes {
            log::warn!("target row {row:?} outside batch {batch} / {classes} classes; skipped");
            continue;
        }
        let (gx, gy) = (row[2] * g, row[3] * g);
        let (gw, gl) = (row[6] * g, row[7] * g);
        let ious: Vec<f32> = anchor_grid
            .iter()
            .map(|[aw, al]| shape_iou(*aw, *al, gw, gl))
            .collect();
        let best = ious
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(i, _)| i)
            .unwrap_or(0);
        let gi = (gx.floor().max(0.0) as usize).min(grid - 1);
        let gj = (gy.floor().max(0.0) as usize).min(grid - 1);

        for (a, iou) in ious.iter().enumerate() {
            if *iou > cfg.ignore_thresh {
                let idx = t.cell(b, a, gj, gi);
                t.noobj_mask[idx] = 0.0;
            }
        }
        let idx = t.cell(b, best, gj, gi);
        t.obj_mask[idx] = 1.0;
        t.noobj_mask[idx] = 0.0;
        t.tx[idx] = gx - gi as f32;
        t.ty[idx] = gy - gj as f32;
        t.tz[idx] = row[4];
        t.th[idx] = row[5];
        t.tw[idx] = (gw / anchor_grid[best][0] + 1e-16).ln();
        t.tl[idx] = (gl / anchor_grid[best][1] + 1e-16).ln();
        t.tim[idx] = row[8];
        t.tre[idx] = row[9];
        for c in 0..classes {
            let ci = t.class_cell(idx, c);
            t.cls_mask[ci] = 1.0;
            t.tcls[ci] = 0.0;
        }
        let ci = t.class_cell(idx, class);
        t.tcls[ci] = 1.0;
        t.assigned.retain(|(cell, _)| *cell != idx);
        t.assigned.push((idx, class));
    }
    t
}

fn to_f32<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Vec<f32> {
    tensor.into_data().to_vec::<f32>().unwrap_or_default()
}

fn scalar<B: Backend>(tensor: Tensor<B, 1>) -> f32 {
    to_f32(tensor).first().copied().unwrap_or(0.0)
}

/// `[N, A, 9 + C, G, G]` view of the raw head, one attribute selected.
fn attr<B: Backend>(view: &Tensor<B, 5>, k: usize) -> Tensor<B, 4> {
    let [n, a, _, g, _] = view.dims();
    view.clone()
        .slice([0..n, 0..a, k..k + 1, 0..g, 0..g])
        .reshape([n, a, g, g])
}

fn masked_mse<B: Backend>(
    pred: Tensor<B, 4>,
    target: Tensor<B, 4>,
    mask: Tensor<B, 4>,
    count: f32,
) -> Tensor<B, 1> {
    let diff = pred - target;
    (diff.clone() * diff * mask).sum().div_scalar(count.max(1.0))
}

fn masked_bce<B: Backend, const D: usize>(
    prob: Tensor<B, D>,
    target: Tensor<B, D>,
    mask: Tensor<B, D>,
    count: f32,
) -> Tensor<B, 1> {
    let prob = prob.clamp(EPS, 1.0 - EPS);
    let pos = target.clone() * prob.clone().log();
    let neg = target.neg().add_scalar(1.0) * prob.neg().add_scalar(1.0).log();
    ((pos + neg) * mask).sum().neg().div_scalar(count.max(1.0))
}

/// Total loss (differentiable) and detached metric components.
pub fn yolo_loss<B: Backend>(
    raw: Tensor<B, 4>,
    targets: &[[f32; 10]],
    cfg: &DetectorConfig,
) -> (Tensor<B, 1>, YoloMetrics) {
    let device = raw.device();
    let [n, _, g, _] = raw.dims();
    let a = cfg.anchors.len();
    let c = cfg.num_classes;
    let view: Tensor<B, 5> = raw.reshape([n, a, BOX_ATTRS + c, g, g]);

    let px = sigmoid(attr(&view, 0));
    let py = sigmoid(attr(&view, 1));
    let pz = attr(&view, 2);
    let ph = attr(&view, 3);
    let pw = attr(&view, 4);
    let pl = attr(&view, 5);
    let pim = attr(&view, 6);
    let pre = attr(&view, 7);
    let pconf = sigmoid(attr(&view, 8));
    let pcls = sigmoid(view.slice([0..n, 0..a, BOX_ATTRS..BOX_ATTRS + c, 0..g, 0..g]));

    let t = build_targets(targets, n, cfg);
    let plane = [n, a, g, g];
    let dense = |values: &[f32]| -> Tensor<B, 4> {
        Tensor::from_data(TensorData::new(values.to_vec(), plane), &device)
    };
    let obj_mask = dense(&t.obj_mask);
    let noobj_mask = dense(&t.noobj_mask);
    let n_obj = t.num_obj() as f32;
    let n_noobj = t.noobj_mask.iter().sum::<f32>();

    let loss_x = masked_mse(px, dense(&t.tx), obj_mask.clone(), n_obj);
    let loss_y = masked_mse(py, dense(&t.ty), obj_mask.clone(), n_obj);
    let loss_z = masked_mse(pz, dense(&t.tz), obj_mask.clone(), n_obj);
    let loss_h = masked_mse(ph, dense(&t.th), obj_mask.clone(), n_obj);
    let loss_w = masked_mse(pw, dense(&t.tw), obj_mask.clone(), n_obj);
    let loss_l = masked_mse(pl, dense(&t.tl), obj_mask.clone(), n_obj);
    let loss_im = masked_mse(pim, dense(&t.tim), obj_mask.clone(), n_obj);
    let loss_re = masked_mse(pre, dense(&t.tre), obj_mask.clone(), n_obj);

    let ones = Tensor::<B, 4>::ones(plane, &device);
    let zeros = Tensor::<B, 4>::zeros(plane, &device);
    let loss_conf_obj = masked_bce(pconf.clone(), ones, obj_mask, n_obj);
    let loss_conf_noobj = masked_bce(pconf.clone(), zeros, noobj_mask, n_noobj);
    let loss_obj = loss_conf_obj.mul_scalar(cfg.obj_scale)
        + loss_conf_noobj.mul_scalar(cfg.noobj_scale);

    let cls_shape = [n, a, c, g, g];
    let tcls = Tensor::<B, 5>::from_data(TensorData::new(t.tcls.clone(), cls_shape), &device);
    let cls_mask =
        Tensor::<B, 5>::from_data(TensorData::new(t.cls_mask.clone(), cls_shape), &device);
    let loss_cls = masked_bce(pcls.clone(), tcls, cls_mask, n_obj * c as f32);

    let total = loss_x.clone()
        + loss_y.clone()
        + loss_z.clone()
        + loss_h.clone()
        + loss_w.clone()
        + loss_l.clone()
        + loss_im.clone()
        + loss_re.clone()
        + loss_obj.clone()
        + loss_cls.clone();

    let conf_host = to_f32(pconf.detach());
    let cls_host = to_f32(pcls.detach());
    let mut metrics = YoloMetrics {
        grid_size: g as f32,
        loss: scalar(total.clone().detach()),
        loss_x: scalar(loss_x.detach()),
        loss_y: scalar(loss_y.detach()),
        loss_z: scalar(loss_z.detach()),
        loss_w: scalar(loss_w.detach()),
        loss_h: scalar(loss_h.detach()),
        loss_l: scalar(loss_l.detach()),
        loss_im: scalar(loss_im.detach()),
        loss_re: scalar(loss_re.detach()),
        loss_obj: scalar(loss_obj.detach()),
        loss_cls: scalar(loss_cls.detach()),
        ..YoloMetrics::default()
    };
    fill_confidence_metrics(&mut metrics, &t, &conf_host, &cls_host);
    (total, metrics)
}

fn fill_confidence_metrics(m: &mut YoloMetrics, t: &YoloTargets, conf: &[f32], cls: &[f32]) {
    if conf.len() != t.obj_mask.len() || cls.len() != t.tcls.len() {
        return;
    }
    let mean_where = |mask: &[f32]| {
        let (sum, count) = mask
            .iter()
            .zip(conf)
            .filter(|(m, _)| **m > 0.5)
            .fold((0.0f32, 0usize), |(s, k), (_, v)| (s + v, k + 1));
        if count == 0 {
            0.0
        } else {
            sum / count as f32
        }
    };
    m.conf_obj = mean_where(&t.obj_mask);
    m.conf_noobj = mean_where(&t.noobj_mask);

    if !t.assigned.is_empty() {
        let correct = t
            .assigned
            .iter()
            .filter(|(cell, class)| {
                let best = (0..t.classes)
                    .max_by(|a, b| {
                        cls[t.class_cell(*cell, *a)]
                            .partial_cmp(&cls[t.class_cell(*cell, *b)])
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .unwrap_or(0);
                best == *class
            })
            .count();
        m.cls_acc = 100.0 * correct as f32 / t.assigned.len() as f32;
    }
}

/// One decoded head cell in normalised raster coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub h: f32,
    pub w: f32,
    pub l: f32,
    pub im: f32,
    pub re: f32,
    pub conf: f32,
    pub cls_conf: f32,
    pub cls_id: usize,
}

impl Detection {
    pub fn score(&self) -> f32 {
        self.conf * self.cls_conf
    }

    pub fn bev_box(&self) -> BevBox {
        BevBox::from_components(self.x, self.y, self.w, self.l, self.im, self.re)
    }
}

fn sig(v: f32) -> f32 {
    1.0 / (1.0 + (-v).exp())
}

/// Decode every anchor/cell of a raw head into detections, one list per image.
pub fn decode_predictions<B: Backend>(raw: Tensor<B, 4>, cfg: &DetectorConfig) -> Vec<Vec<Detection>> {
    let [n, ch, g, _] = raw.dims();
    let data = to_f32(raw);
    decode_host(&data, n, ch, g, cfg)
}

pub fn decode_host(data: &[f32], n: usize, ch: usize, g: usize, cfg: &DetectorConfig) -> Vec<Vec<Detection>> {
    let per_anchor = BOX_ATTRS + cfg.num_classes;
    let anchors = cfg.anchors.len();
    let plane = g * g;
    let img = cfg.img_size as f32;
    let mut out = Vec::with_capacity(n);
    if data.len() != n * ch * plane || ch != anchors * per_anchor {
        return vec![Vec::new(); n];
    }
    for b in 0..n {
        let mut dets = Vec::with_capacity(anchors * plane);
        for (a, [aw, al]) in cfg.anchors.iter().enumerate() {
            let base = (b * ch + a * per_anchor) * plane;
            let at = |k: usize, cell: usize| data[base + k * plane + cell];
            for j in 0..g {
                for i in 0..g {
                    let cell = j * g + i;
                    let (cls_id, cls_conf) = (0..cfg.num_classes)
                        .map(|c| (c, sig(at(BOX_ATTRS + c, cell))))
                        .fold((0, f32::MIN), |best, cur| if cur.1 > best.1 { cur } else { best });
                    dets.push(Detection {
                        x: (i as f32 + sig(at(0, cell))) / g as f32,
                        y: (j as f32 + sig(at(1, cell))) / g as f32,
                        z: at(2, cell),
                        h: at(3, cell),
                        w: at(4, cell).exp() * aw / img,
                        l: at(5, cell).exp() * al / img,
                        im: at(6, cell),
                        re: at(7, cell),
                        conf: sig(at(8, cell)),
                        cls_conf,
                        cls_id,
                    });
                }
            }
        }
        out.push(dets);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_cfg() -> DetectorConfig {
        DetectorConfig {
            num_classes: 2,
            img_size: 32,
            backbone_channels: vec![4, 8, 8],
            anchors: vec![[4.0, 4.0], [4.0, 12.0]],
            ..DetectorConfig::default()
        }
    }

    #[test]
    fn target_lands_in_centre_cell_with_best_anchor() {
        let cfg = tiny_cfg();
        // grid 8, stride 4: a 4x12 px box matches the second anchor exactly.
        let row = [0.0, 1.0, 0.55, 0.3, 0.1, 0.2, 4.0 / 32.0, 12.0 / 32.0, 0.0, 1.0];
        let t = build_targets(&[row], 1, &cfg);
        let idx = t.cell(0, 1, 2, 4);
        assert_eq!(t.obj_mask[idx], 1.0);
        assert_eq!(t.noobj_mask[idx], 0.0);
        assert!((t.tx[idx] - 0.4).abs() < 1e-5);
        assert!((t.ty[idx] - 0.4).abs() < 1e-5);
        assert!(t.tw[idx].abs() < 1e-5);
        assert!(t.tl[idx].abs() < 1e-5);
        assert_eq!(t.assigned, vec![(idx, 1)]);
        assert_eq!(t.num_obj(), 1);
    }

    #[test]
    fn out_of_range_rows_are_skipped() {
        let cfg = tiny_cfg();
        let rows = [
            [3.0, 0.0, 0.5, 0.5, 0.0, 0.1, 0.1, 0.1, 0.0, 1.0],
            [0.0, 7.0, 0.5, 0.5, 0.0, 0.1, 0.1, 0.1, 0.0, 1.0],
        ];
        let t = build_targets(&rows, 1, &cfg);
        assert_eq!(t.num_obj(), 0);
    }

    #[test]
    fn decode_zero_head_centres_cells() {
        let cfg = tiny_cfg();
        let g = cfg.grid_size();
        let ch = cfg.head_channels();
        let dets = decode_host(&vec![0.0; ch * g * g], 1, ch, g, &cfg);
        assert_eq!(dets[0].len(), 2 * g * g);
        let first = dets[0][0];
        assert!((first.x - 0.5 / g as f32).abs() < 1e-6);
        assert!((first.conf - 0.5).abs() < 1e-6);
        assert!((first.w - 4.0 / 32.0).abs() < 1e-6);
        assert!((first.score() - 0.25).abs() < 1e-6);
    }

    #[test]
    fn metric_pairs_keep_reporting_order() {
        let names: Vec<_> = YoloMetrics::default().as_pairs().iter().map(|p| p.0).collect();
        assert_eq!(names.first(), Some(&"grid_size"));
        assert_eq!(names.last(), Some(&"conf_noobj"));
        assert_eq!(names.len(), 15);
    }
}
