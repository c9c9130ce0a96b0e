//! Testing utilities: scripted sources and sinks, a capturing error sink,
//! and polling helpers for lifecycle tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::errors::{DeviceError, ErrorSink, SinkError};
use crate::frame::{Frame, FrameMetadata};
use crate::player::{DeviceSource, Player, WorkerHandle};
use crate::recorder::{RecordSink, Recorder, SinkStream};
use crate::types::{LifecycleState, VideoFormat};

/// Error sink that stores every report for later inspection.
#[derive(Debug, Default)]
pub struct CapturingErrorSink {
    reports: Mutex<Vec<String>>,
}

impl CapturingErrorSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reports(&self) -> Vec<String> {
        self.reports.lock().clone()
    }
}

impl ErrorSink for CapturingErrorSink {
    fn report(&self, error: &anyhow::Error, _from_worker: bool) {
        self.reports.lock().push(format!("{error:#}"));
    }
}

/// Build one synthetic single-plane frame matching `format`.
pub fn test_frame(format: &VideoFormat, seq: u64) -> Frame {
    let len = format
        .bytes_per_frame()
        .unwrap_or(u64::from(format.width) * u64::from(format.height))
        .max(1) as usize;
    Frame {
        pix_fmt: format.pix_fmt.clone(),
        width: format.width,
        height: format.height,
        linesizes: vec![format.width],
        planes: vec![Bytes::from(vec![(seq % 251) as u8; len])],
    }
}

/// Scripted device source: announces `format`, emits a fixed number of
/// synthetic frames, then idles until stopped.
pub struct TestSource {
    format: VideoFormat,
    frames: u64,
    frame_interval: Duration,
    fail_before_start: bool,
}

impl TestSource {
    pub fn new(format: VideoFormat) -> Self {
        Self {
            format,
            frames: 0,
            frame_interval: Duration::from_millis(2),
            fail_before_start: false,
        }
    }

    /// Emit this many frames before idling.
    pub fn frames(mut self, frames: u64) -> Self {
        self.frames = frames;
        self
    }

    pub fn frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    /// Fail before delivering a first frame, exercising the
    /// starting-to-idle abort path.
    pub fn fail_before_start(mut self) -> Self {
        self.fail_before_start = true;
        self
    }
}

impl DeviceSource for TestSource {
    fn run(&self, worker: &mut WorkerHandle) -> Result<(), DeviceError> {
        if self.fail_before_start {
            return Err(DeviceError::Open("scripted failure".into()));
        }
        worker.complete_start(self.format.clone());
        let rate = if self.format.rate == 0.0 {
            30.0
        } else {
            self.format.rate
        };
        let mut emitted = 0;
        while !worker.should_stop() {
            if emitted < self.frames {
                let meta = FrameMetadata::with_count(emitted as f64 / rate, emitted);
                worker.process_frame(test_frame(&self.format, emitted), meta);
                emitted += 1;
            }
            thread::sleep(self.frame_interval);
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct SinkCounters {
    opens: AtomicU64,
    frames: AtomicU64,
    bytes: AtomicU64,
    closes: AtomicU64,
}

/// Record sink that counts opens, writes, and closes. Clones share
/// counters, so tests can keep one handle while the recorder owns another.
#[derive(Clone, Default)]
pub struct CountingSink {
    counters: Arc<SinkCounters>,
    fail_open: bool,
    fail_every: Option<u64>,
    opened_formats: Arc<Mutex<Vec<VideoFormat>>>,
}

impl CountingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse to open, exercising the fatal starting-phase path.
    pub fn fail_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Fail every n-th write, exercising the skip-and-continue path.
    pub fn fail_every(mut self, n: u64) -> Self {
        self.fail_every = Some(n);
        self
    }

    pub fn opens(&self) -> u64 {
        self.counters.opens.load(Ordering::SeqCst)
    }

    pub fn frames(&self) -> u64 {
        self.counters.frames.load(Ordering::SeqCst)
    }

    pub fn bytes(&self) -> u64 {
        self.counters.bytes.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> u64 {
        self.counters.closes.load(Ordering::SeqCst)
    }

    /// Formats passed to `open`, in order.
    pub fn opened_formats(&self) -> Vec<VideoFormat> {
        self.opened_formats.lock().clone()
    }
}

impl RecordSink for CountingSink {
    fn open(&self, format: &VideoFormat) -> Result<Box<dyn SinkStream>, SinkError> {
        if self.fail_open {
            return Err(SinkError::Open("scripted open failure".into()));
        }
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        self.opened_formats.lock().push(format.clone());
        Ok(Box::new(CountingStream {
            counters: self.counters.clone(),
            fail_every: self.fail_every,
            written: 0,
        }))
    }
}

struct CountingStream {
    counters: Arc<SinkCounters>,
    fail_every: Option<u64>,
    written: u64,
}

impl SinkStream for CountingStream {
    fn write(&mut self, frame: &Frame, _meta: &FrameMetadata) -> Result<u64, SinkError> {
        self.written += 1;
        if let Some(n) = self.fail_every {
            if self.written % n == 0 {
                return Err(SinkError::Write("scripted write failure".into()));
            }
        }
        let bytes = frame.total_bytes();
        self.counters.frames.fetch_add(1, Ordering::SeqCst);
        self.counters.bytes.fetch_add(bytes, Ordering::SeqCst);
        Ok(bytes)
    }

    fn close(&mut self) -> Result<(), SinkError> {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll until `condition` holds, panicking after a generous timeout.
pub fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(1));
    }
}

/// Pump a player until it reaches `state`.
pub fn wait_for_state(player: &mut Player, state: LifecycleState) {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    loop {
        player.pump();
        if player.state() == state {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "player never reached {state}, stuck in {}",
            player.state()
        );
        thread::sleep(Duration::from_millis(1));
    }
}

/// Pump a recorder until it reaches `state`.
pub fn wait_for_recorder_state(recorder: &mut Recorder, state: LifecycleState) {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    loop {
        recorder.pump();
        if recorder.state() == state {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "recorder never reached {state}, stuck in {}",
            recorder.state()
        );
        thread::sleep(Duration::from_millis(1));
    }
}
