//! Burn BEV 3D detector and its helpers.
//!
//! - `BevDetector`: darknet-style backbone with a single YOLO head regressing
//!   `x, y, z, h, w, l, im, re` plus objectness and class scores per anchor.
//! - `yolo`: target assignment, the multi-component loss, and host-side decoding.
//! - `geometry`: rotated BEV boxes, rotated IoU and class-aware NMS.
//! - `darknet`: reader for darknet `.weights` files used as pretrained weights.
//!
//! These are plain Burn modules; the `training` crate owns the loop, optimizer and
//! evaluation around them.

pub mod darknet;
pub mod detector;
pub mod error;
pub mod geometry;
pub mod yolo;

pub use darknet::{DarknetHeader, DarknetWeights};
pub use detector::{BevDetector, DetectorConfig, BOX_ATTRS};
pub use error::ModelError;
pub use geometry::{nms_rotated, rotated_iou, shape_iou, BevBox};
pub use yolo::{build_targets, decode_predictions, yolo_loss, Detection, YoloMetrics, YoloTargets};
