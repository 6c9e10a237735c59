//! Reader for darknet `.weights` files.
//!
//! Layout: `major`, `minor`, `revision` as little-endian i32, then `seen` as u64
//! when `major * 10 + minor >= 2` (u32 otherwise), then the raw f32 parameters.

use crate::error::ModelError;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DarknetHeader {
    pub major: i32,
    pub minor: i32,
    pub revision: i32,
    pub seen: u64,
}

#[derive(Debug, Clone)]
pub struct DarknetWeights {
    pub header: DarknetHeader,
    pub values: Vec<f32>,
}

fn read_i32(bytes: &[u8], at: usize) -> i32 {
    i32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

impl DarknetWeights {
    pub fn from_path(path: &Path) -> Result<Self, ModelError> {
        let bytes = std::fs::read(path).map_err(|source| ModelError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ModelError> {
        if bytes.len() < 16 {
            return Err(ModelError::TruncatedHeader { len: bytes.len() });
        }
        let major = read_i32(bytes, 0);
        let minor = read_i32(bytes, 4);
        let revision = read_i32(bytes, 8);
        let wide_seen = i64::from(major) * 10 + i64::from(minor) >= 2;
        let (seen, offset) = if wide_seen {
            if bytes.len() < 20 {
                return Err(ModelError::TruncatedHeader { len: bytes.len() });
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[12..20]);
            (u64::from_le_bytes(raw), 20)
        } else {
            (read_i32(bytes, 12) as u32 as u64, 16)
        };
        let payload = &bytes[offset..];
        if payload.len() % 4 != 0 {
            return Err(ModelError::MisalignedPayload { len: payload.len() });
        }
        let values = payload
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(Self {
            header: DarknetHeader {
                major,
                minor,
                revision,
                seen,
            },
            values,
        })
    }

    pub fn cursor(&self) -> WeightCursor<'_> {
        WeightCursor {
            values: &self.values,
            pos: 0,
        }
    }
}

/// Sequential reader over the parameter payload.
pub struct WeightCursor<'a> {
    values: &'a [f32],
    pos: usize,
}

impl<'a> WeightCursor<'a> {
    pub fn take(&mut self, n: usize, layer: &str) -> Result<&'a [f32], ModelError> {
        let available = self.remaining();
        if n > available {
            return Err(ModelError::TruncatedWeights {
                layer: layer.to_string(),
                needed: n,
                available,
            });
        }
        let out = &self.values[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn remaining(&self) -> usize {
        self.values.len() - self.pos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(major: i32, minor: i32, seen_wide: bool, values: &[f32]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&major.to_le_bytes());
        out.extend_from_slice(&minor.to_le_bytes());
        out.extend_from_slice(&0i32.to_le_bytes());
        if seen_wide {
            out.extend_from_slice(&1234u64.to_le_bytes());
        } else {
            out.extend_from_slice(&1234u32.to_le_bytes());
        }
        for v in values {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    #[test]
    fn wide_seen_header() {
        let w = DarknetWeights::from_bytes(&encode(0, 2, true, &[1.0, 2.0])).unwrap();
        assert_eq!(w.header.seen, 1234);
        assert_eq!(w.values, vec![1.0, 2.0]);
    }

    #[test]
    fn extreme_version_fields_do_not_overflow() {
        let w = DarknetWeights::from_bytes(&encode(i32::MAX, i32::MAX, true, &[0.5])).unwrap();
        assert_eq!(w.header.major, i32::MAX);
        assert_eq!(w.values, vec![0.5]);

        let w = DarknetWeights::from_bytes(&encode(i32::MIN, 0, false, &[0.25])).unwrap();
        assert_eq!(w.header.seen, 1234);
        assert_eq!(w.values, vec![0.25]);

        // text bytes read as a header
        let w = DarknetWeights::from_bytes(b"abcdefghijklmnopqrstuvwx").unwrap();
        assert_eq!(w.values.len(), 1);
        let err = w.cursor().take(2, "block0").unwrap_err();
        assert!(matches!(err, ModelError::TruncatedWeights { needed: 2, available: 1, .. }));
    }

    #[test]
    fn narrow_seen_header() {
        let w = DarknetWeights::from_bytes(&encode(0, 1, false, &[3.5])).unwrap();
        assert_eq!(w.header.minor, 1);
        assert_eq!(w.values, vec![3.5]);
    }

    #[test]
    fn cursor_reports_exhaustion() {
        let w = DarknetWeights::from_bytes(&encode(0, 2, true, &[1.0, 2.0, 3.0])).unwrap();
        let mut cur = w.cursor();
        assert_eq!(cur.take(2, "a").unwrap(), &[1.0, 2.0]);
        let err = cur.take(2, "b").unwrap_err();
        assert!(matches!(
            err,
            ModelError::TruncatedWeights {
                needed: 2,
                available: 1,
                ..
            }
        ));
    }

    #[test]
    fn short_file_rejected() {
        assert!(matches!(
            DarknetWeights::from_bytes(&[0u8; 10]),
            Err(ModelError::TruncatedHeader { len: 10 })
        ));
    }
}
