//! Rotated bird's-eye-view box geometry: corners, polygon clipping, IoU and NMS.

/// A rotated box on the BEV plane. `l` runs along the heading, `w` across it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BevBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub l: f32,
    pub yaw: f32,
}

impl BevBox {
    pub fn from_components(x: f32, y: f32, w: f32, l: f32, im: f32, re: f32) -> Self {
        Self {
            x,
            y,
            w,
            l,
            yaw: im.atan2(re),
        }
    }

    /// Corners with positive signed area (counter-clockwise in a y-up frame).
    pub fn corners(&self) -> [[f32; 2]; 4] {
        let (s, c) = self.yaw.sin_cos();
        let (hl, hw) = (self.l * 0.5, self.w * 0.5);
        let along = [c * hl, s * hl];
        let across = [-s * hw, c * hw];
        [
            [self.x + along[0] + across[0], self.y + along[1] + across[1]],
            [self.x - along[0] + across[0], self.y - along[1] + across[1]],
            [self.x - along[0] - across[0], self.y - along[1] - across[1]],
            [self.x + along[0] - across[0], self.y + along[1] - across[1]],
        ]
    }

    pub fn area(&self) -> f32 {
        self.w.max(0.0) * self.l.max(0.0)
    }
}

fn side(a: [f32; 2], b: [f32; 2], p: [f32; 2]) -> f32 {
    (b[0] - a[0]) * (p[1] - a[1]) - (b[1] - a[1]) * (p[0] - a[0])
}

fn intersect(p1: [f32; 2], p2: [f32; 2], a: [f32; 2], b: [f32; 2]) -> [f32; 2] {
    let d1 = side(a, b, p1);
    let d2 = side(a, b, p2);
    let t = d1 / (d1 - d2);
    [p1[0] + t * (p2[0] - p1[0]), p1[1] + t * (p2[1] - p1[1])]
}

/// Sutherland–Hodgman clip of `subject` against the convex, positively oriented `clip`.
pub fn clip_polygon(subject: &[[f32; 2]], clip: &[[f32; 2]]) -> Vec<[f32; 2]> {
    let mut output = subject.to_vec();
    for i in 0..clip.len() {
        if output.is_empty() {
            break;
        }
        let a = clip[i];
        let b = clip[(i + 1) % clip.len()];
        let input = std::mem::take(&mut output);
        for j in 0..input.len() {
            let cur = input[j];
            let prev = input[(j + input.len() - 1) % input.len()];
            let cur_in = side(a, b, cur) >= 0.0;
            let prev_in = side(a, b, prev) >= 0.0;
            if cur_in {
                if !prev_in {
                    output.push(intersect(prev, cur, a, b));
                }
                output.push(cur);
            } else if prev_in {
                output.push(intersect(prev, cur, a, b));
            }
        }
    }
    output
}

pub fn polygon_area(points: &[[f32; 2]]) -> f32 {
    if points.len() < 3 {
        return 0.0;
    }
    let mut twice = 0.0f32;
    for i in 0..points.len() {
        let p = points[i];
        let q = points[(i + 1) % points.len()];
        twice += p[0] * q[1] - q[0] * p[1];
    }
    twice.abs() * 0.5
}

pub fn rotated_iou(a: &BevBox, b: &BevBox) -> f32 {
    let inter = polygon_area(&clip_polygon(&a.corners(), &b.corners()));
    let union = a.area() + b.area() - inter;
    if union <= 0.0 {
        0.0
    } else {
        (inter / union).clamp(0.0, 1.0)
    }
}

/// IoU of two boxes sharing a centre and heading; used to pick anchors.
pub fn shape_iou(w1: f32, l1: f32, w2: f32, l2: f32) -> f32 {
    let inter = w1.min(w2) * l1.min(l2);
    inter / (w1 * l1 + w2 * l2 - inter + 1e-16)
}

/// Class-aware NMS over rotated boxes. Returns kept indices by descending score.
pub fn nms_rotated(boxes: &[BevBox], scores: &[f32], classes: &[usize], iou_thresh: f32) -> Vec<usize> {
    let mut order: Vec<usize> = (0..boxes.len()).collect();
    order.sort_by(|&a, &b| {
        scores[b]
            .partial_cmp(&scores[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut suppressed = vec![false; boxes.len()];
    let mut keep = Vec::new();
    for (pos, &i) in order.iter().enumerate() {
        if suppressed[i] {
            continue;
        }
        keep.push(i);
        for &j in &order[pos + 1..] {
            if !suppressed[j]
                && classes[j] == classes[i]
                && rotated_iou(&boxes[i], &boxes[j]) > iou_thresh
            {
                suppressed[j] = true;
            }
        }
    }
    keep
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::FRAC_PI_2;

    fn bx(x: f32, y: f32, w: f32, l: f32, yaw: f32) -> BevBox {
        BevBox { x, y, w, l, yaw }
    }

    #[test]
    fn identical_boxes_have_unit_iou() {
        let a = bx(0.5, 0.5, 0.1, 0.3, 0.7);
        assert!((rotated_iou(&a, &a) - 1.0).abs() < 1e-4);
    }

    #[test]
    fn disjoint_boxes_have_zero_iou() {
        let a = bx(0.2, 0.2, 0.1, 0.1, 0.0);
        let b = bx(0.8, 0.8, 0.1, 0.1, 0.3);
        assert_eq!(rotated_iou(&a, &b), 0.0);
    }

    #[test]
    fn half_shifted_square_is_one_third() {
        let a = bx(0.0, 0.0, 2.0, 2.0, 0.0);
        let b = bx(1.0, 0.0, 2.0, 2.0, 0.0);
        // intersection 2, union 6
        assert!((rotated_iou(&a, &b) - 1.0 / 3.0).abs() < 1e-4);
    }

    #[test]
    fn quarter_turn_cross_overlap() {
        // 1x3 bar crossed with itself rotated 90 degrees: inter 1, union 5
        let a = bx(0.0, 0.0, 1.0, 3.0, 0.0);
        let b = bx(0.0, 0.0, 1.0, 3.0, FRAC_PI_2);
        assert!((rotated_iou(&a, &b) - 0.2).abs() < 1e-4);
    }

    #[test]
    fn nms_keeps_best_per_class() {
        let boxes = vec![
            bx(0.5, 0.5, 0.1, 0.2, 0.0),
            bx(0.505, 0.5, 0.1, 0.2, 0.0),
            bx(0.5, 0.5, 0.1, 0.2, 0.0),
            bx(0.1, 0.1, 0.1, 0.2, 0.0),
        ];
        let scores = vec![0.6, 0.9, 0.8, 0.3];
        let classes = vec![0, 0, 1, 0];
        let keep = nms_rotated(&boxes, &scores, &classes, 0.5);
        assert_eq!(keep, vec![1, 2, 3]);
    }

    #[test]
    fn shape_iou_prefers_matching_anchor() {
        let close = shape_iou(2.0, 4.0, 2.0, 5.0);
        let far = shape_iou(2.0, 4.0, 8.0, 1.0);
        assert!(close > far);
        assert!((shape_iou(3.0, 3.0, 3.0, 3.0) - 1.0).abs() < 1e-6);
    }
}
