//! Frame payloads delivered by capture sources.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// One captured image: one or more memory planes plus their layout.
///
/// Planes are reference-counted buffers. The pipeline owns a frame
/// exclusively until it has been handed to every registered callback; a
/// callback that must keep the image past the call (an encoder, a network
/// queue) clones it synchronously, which copies refcounts, not pixels.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    /// FFmpeg-style pixel format tag.
    pub pix_fmt: String,
    pub width: u32,
    pub height: u32,
    /// Per-plane stride in bytes.
    pub linesizes: Vec<u32>,
    pub planes: Vec<Bytes>,
}

impl Frame {
    /// Total payload size across all planes.
    pub fn total_bytes(&self) -> u64 {
        self.planes.iter().map(|p| p.len() as u64).sum()
    }
}

/// Per-frame metadata record.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrameMetadata {
    /// Presentation timestamp in seconds.
    pub pts: f64,
    /// Monotonically increasing sequence count, when the source provides
    /// one.
    pub count: Option<u64>,
}

impl FrameMetadata {
    pub fn new(pts: f64) -> Self {
        Self { pts, count: None }
    }

    pub fn with_count(pts: f64, count: u64) -> Self {
        Self {
            pts,
            count: Some(count),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_bytes_sums_planes() {
        let frame = Frame {
            pix_fmt: "yuv420p".into(),
            width: 4,
            height: 4,
            linesizes: vec![4, 2, 2],
            planes: vec![
                Bytes::from(vec![0u8; 16]),
                Bytes::from(vec![0u8; 4]),
                Bytes::from(vec![0u8; 4]),
            ],
        };
        assert_eq!(frame.total_bytes(), 24);
    }
}
