//! Error types for the CamLink core, and the error-sink seam that worker
//! threads report through.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::types::LifecycleState;

/// Synchronous misuse of a lifecycle, raised straight back to the caller.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Operation requested while the lifecycle is in an incompatible state.
    #[error("cannot {op} while {state}")]
    InvalidState {
        op: &'static str,
        state: LifecycleState,
    },

    /// `play` requested while the source is being reconfigured.
    #[error("cannot play while the source is being configured")]
    Configuring,

    /// `record` requested against a source that is not delivering frames.
    #[error("cannot record from a player that is not playing (player is {state})")]
    SourceNotPlaying { state: LifecycleState },

    /// `record` requested before the source frame rate is known.
    #[error("cannot record until the source frame rate is known")]
    SourceRateUnknown,

    /// OS refused to start the worker thread.
    #[error("failed to spawn {thread} thread")]
    Spawn {
        thread: &'static str,
        #[source]
        source: io::Error,
    },
}

/// Worker-thread failure opening or reading a capture device.
///
/// Never crosses the thread boundary as a panic or a return value: the
/// worker wrapper routes it to the [`ErrorSink`] and forces the lifecycle
/// back to idle.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("failed to open device: {0}")]
    Open(String),

    #[error("capture failed: {0}")]
    Capture(String),

    /// The device produced neither a first frame nor a format in time.
    #[error("no frame from device within {0:?}")]
    FirstFrameTimeout(Duration),
}

/// Sink-side failure while opening or writing a recording.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to open sink: {0}")]
    Open(String),

    #[error("sink does not support format {0}")]
    UnsupportedFormat(String),

    #[error("write failed: {0}")]
    Write(String),

    #[error("sink already closed")]
    Closed,
}

/// Destination for errors caught on worker and connection threads.
///
/// Injected at construction rather than installed process-wide, so tests
/// can capture reports and hosts can route them to their own surface.
/// Every caught error reaches the sink exactly once.
pub trait ErrorSink: Send + Sync + 'static {
    /// `from_worker` is true when the error was caught off the controlling
    /// thread.
    fn report(&self, error: &anyhow::Error, from_worker: bool);
}

/// Error sink that drops every report.
#[derive(Debug, Default)]
pub struct NoopErrorSink;

impl ErrorSink for NoopErrorSink {
    fn report(&self, _error: &anyhow::Error, _from_worker: bool) {}
}

/// The default sink shared by constructors that take none.
pub fn noop_error_sink() -> Arc<dyn ErrorSink> {
    Arc::new(NoopErrorSink)
}
