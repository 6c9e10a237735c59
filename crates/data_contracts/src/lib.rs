//! Shared data contracts for BEV detection datasets: object labels and class names.

pub mod classes;
pub mod labels;

pub use classes::{load_classes, parse_classes};
pub use labels::{parse_label_file, LabelError, ObjectLabel};
