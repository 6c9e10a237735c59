use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of whitespace-separated fields in a label line.
pub const LABEL_FIELDS: usize = 8;

/// One annotated object in normalized bird's-eye-view coordinates.
///
/// `x`/`y` are the box centre along the raster width/height (0..1), `z` the
/// normalized height of the centre, `h`/`w`/`l` the normalized box extents and
/// `yaw` the heading in radians measured from the raster x axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ObjectLabel {
    pub class_id: usize,
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub h: f32,
    pub w: f32,
    pub l: f32,
    pub yaw: f32,
}

#[derive(Debug, Error, PartialEq)]
pub enum LabelError {
    #[error("line {line}: expected 8 fields, found {found}")]
    FieldCount { line: usize, found: usize },
    #[error("line {line}: could not parse {field} from {raw:?}")]
    Parse {
        line: usize,
        field: &'static str,
        raw: String,
    },
    #[error("non-finite value in label: {0:?}")]
    NonFinite(ObjectLabel),
    #[error("box centre out of [0,1]: ({x}, {y})")]
    CentreOutOfRange { x: f32, y: f32 },
    #[error("box extents must be positive: h={h} w={w} l={l}")]
    NonPositiveSize { h: f32, w: f32, l: f32 },
    #[error("line {line}: {source}")]
    Invalid {
        line: usize,
        #[source]
        source: Box<LabelError>,
    },
}

const FIELD_NAMES: [&str; LABEL_FIELDS] = ["class_id", "x", "y", "z", "h", "w", "l", "yaw"];

impl ObjectLabel {
    /// Parse a single `class_id x y z h w l yaw` line. `line` is only used for error context.
    pub fn parse_line(raw: &str, line: usize) -> Result<Self, LabelError> {
        let parts: Vec<&str> = raw.split_whitespace().collect();
        if parts.len() != LABEL_FIELDS {
            return Err(LabelError::FieldCount {
                line,
                found: parts.len(),
            });
        }
        let class_id = parts[0].parse::<usize>().map_err(|_| LabelError::Parse {
            line,
            field: FIELD_NAMES[0],
            raw: parts[0].to_string(),
        })?;
        let mut vals = [0.0f32; LABEL_FIELDS - 1];
        for (i, part) in parts[1..].iter().enumerate() {
            vals[i] = part.parse::<f32>().map_err(|_| LabelError::Parse {
                line,
                field: FIELD_NAMES[i + 1],
                raw: part.to_string(),
            })?;
        }
        Ok(Self {
            class_id,
            x: vals[0],
            y: vals[1],
            z: vals[2],
            h: vals[3],
            w: vals[4],
            l: vals[5],
            yaw: vals[6],
        })
    }

    pub fn validate(&self) -> Result<(), LabelError> {
        let values = [self.x, self.y, self.z, self.h, self.w, self.l, self.yaw];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(LabelError::NonFinite(*self));
        }
        if !(0.0..=1.0).contains(&self.x) || !(0.0..=1.0).contains(&self.y) {
            return Err(LabelError::CentreOutOfRange {
                x: self.x,
                y: self.y,
            });
        }
        if self.h <= 0.0 || self.w <= 0.0 || self.l <= 0.0 {
            return Err(LabelError::NonPositiveSize {
                h: self.h,
                w: self.w,
                l: self.l,
            });
        }
        Ok(())
    }

    /// Yaw split into `(im, re)` = `(sin, cos)`, the form the detector regresses.
    pub fn yaw_components(&self) -> (f32, f32) {
        (self.yaw.sin(), self.yaw.cos())
    }

    /// Mirror the object across the raster's vertical centre line.
    pub fn flipped_horizontal(&self) -> Self {
        Self {
            x: 1.0 - self.x,
            yaw: std::f32::consts::PI - self.yaw,
            ..*self
        }
    }
}

/// Parse every label in a file body. Blank lines and `#` comments are skipped.
pub fn parse_label_file(text: &str) -> Result<Vec<ObjectLabel>, LabelError> {
    let mut labels = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let label = ObjectLabel::parse_line(trimmed, line)?;
        label.validate().map_err(|e| LabelError::Invalid {
            line,
            source: Box::new(e),
        })?;
        labels.push(label);
    }
    Ok(labels)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flip_keeps_sine_and_negates_cosine() {
        let label = ObjectLabel {
            class_id: 0,
            x: 0.2,
            y: 0.5,
            z: 0.1,
            h: 0.1,
            w: 0.05,
            l: 0.1,
            yaw: 0.3,
        };
        let flipped = label.flipped_horizontal();
        let (im, re) = label.yaw_components();
        let (fim, fre) = flipped.yaw_components();
        assert!((flipped.x - 0.8).abs() < 1e-6);
        assert!((im - fim).abs() < 1e-5);
        assert!((re + fre).abs() < 1e-5);
    }
}
