//! Shared media types.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Default frame rate assumed when neither the caller nor the source
/// provides one.
pub const DEFAULT_RATE: f64 = 30.0;

/// Lifecycle state shared by players and recorders.
///
/// `Active` means "playing" for a source and "recording" for a sink.
/// State changes driven by external callers (`play`, `record`, `stop`)
/// happen on the controlling thread; the `Starting -> Active` and
/// `Stopping -> Idle` completions are requested by the worker thread and
/// applied when the controlling thread drains its mailbox.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    /// Nothing running; the only state from which a start is legal.
    Idle,
    /// Start requested; the worker has not yet delivered a first frame.
    Starting,
    /// Live data is flowing and the negotiated format is known.
    Active,
    /// Stop requested; the worker has not yet exited.
    Stopping,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Idle => write!(f, "idle"),
            LifecycleState::Starting => write!(f, "starting"),
            LifecycleState::Active => write!(f, "active"),
            LifecycleState::Stopping => write!(f, "stopping"),
        }
    }
}

/// Describes a video stream: pixel format tag, frame size, and rate.
///
/// Empty or zero fields mean "not yet known". The same type serves as the
/// requested configuration and as the format actually negotiated once live
/// data flows; the latter is only ever filled in from a real frame.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoFormat {
    /// FFmpeg-style pixel format tag, e.g. `yuv420p` or `rgb24`.
    pub pix_fmt: String,
    pub width: u32,
    pub height: u32,
    /// Frames per second; 0 when unknown.
    pub rate: f64,
}

impl VideoFormat {
    pub fn new(pix_fmt: impl Into<String>, width: u32, height: u32, rate: f64) -> Self {
        Self {
            pix_fmt: pix_fmt.into(),
            width,
            height,
            rate,
        }
    }

    /// True when every field has a real value.
    pub fn is_fully_known(&self) -> bool {
        !self.pix_fmt.is_empty() && self.width != 0 && self.height != 0 && self.rate != 0.0
    }

    /// Per-field merge: any unknown field is taken from `fallback`.
    ///
    /// This is the backbone of recorder format negotiation: explicit
    /// overrides win, then the source's fields, then built-in defaults.
    pub fn or(&self, fallback: &VideoFormat) -> VideoFormat {
        VideoFormat {
            pix_fmt: if self.pix_fmt.is_empty() {
                fallback.pix_fmt.clone()
            } else {
                self.pix_fmt.clone()
            },
            width: if self.width == 0 {
                fallback.width
            } else {
                self.width
            },
            height: if self.height == 0 {
                fallback.height
            } else {
                self.height
            },
            rate: if self.rate == 0.0 {
                fallback.rate
            } else {
                self.rate
            },
        }
    }

    /// Estimated size in bytes of one uncompressed frame, for known pixel
    /// format tags. `None` when the tag or the frame size is unknown.
    pub fn bytes_per_frame(&self) -> Option<u64> {
        if self.width == 0 || self.height == 0 {
            return None;
        }
        let pixels = u64::from(self.width) * u64::from(self.height);
        let bytes = match self.pix_fmt.as_str() {
            "gray" => pixels,
            "yuv420p" | "nv12" => pixels * 3 / 2,
            "yuyv422" | "uyvy422" => pixels * 2,
            "rgb24" | "bgr24" => pixels * 3,
            "rgba" | "bgra" => pixels * 4,
            _ => return None,
        };
        Some(bytes)
    }

    /// Estimated data rate in bytes per second, with the rate falling back
    /// to [`DEFAULT_RATE`] when unknown.
    pub fn data_rate(&self) -> Option<u64> {
        let per_frame = self.bytes_per_frame()?;
        let rate = if self.rate == 0.0 {
            DEFAULT_RATE
        } else {
            self.rate
        };
        Some((per_frame as f64 * rate) as u64)
    }
}

impl fmt::Display for VideoFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pix_fmt = if self.pix_fmt.is_empty() {
            "?"
        } else {
            &self.pix_fmt
        };
        write!(
            f,
            "{}x{} {} @ {} fps",
            self.width, self.height, pix_fmt, self.rate
        )
    }
}
