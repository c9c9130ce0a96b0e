//! Recording lifecycle shared by every frame sink.
//!
//! A [`Recorder`] walks the same `Idle -> Starting -> Active -> Stopping ->
//! Idle` machine as a player, but is coupled to a source: while active it
//! holds a frame callback on the player feeding its worker's image queue.
//! Every `record` builds a fresh queue; a reattaching consumer never
//! inherits a previous session's queue.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::errors::{noop_error_sink, ErrorSink, LifecycleError, SinkError};
use crate::frame::{Frame, FrameMetadata};
use crate::mailbox::{Mailbox, MailboxSender};
use crate::player::{CallbackGuard, Player};
use crate::types::{LifecycleState, VideoFormat, DEFAULT_RATE};

/// Sink backend opened once the negotiated output format is known.
///
/// Encoders and file writers live behind this seam; the lifecycle never
/// knows what the bytes become.
pub trait RecordSink: Send + Sync + 'static {
    fn open(&self, format: &VideoFormat) -> Result<Box<dyn SinkStream>, SinkError>;
}

/// One recording session produced by [`RecordSink::open`].
pub trait SinkStream: Send {
    /// Write one frame; returns the number of bytes written.
    fn write(&mut self, frame: &Frame, meta: &FrameMetadata) -> Result<u64, SinkError>;

    fn close(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

enum QueueItem {
    Frame(Frame, FrameMetadata),
    /// Local sentinel waking a blocked worker on stop. Never leaves the
    /// process.
    Eof,
}

enum RecorderUpdate {
    CompleteStart(VideoFormat),
    CompleteStop,
    RecordStart(Instant),
    FramesRecorded(u64),
    FramesSkipped(u64),
    BytesRecorded(u64),
}

/// Record-time counters, updated when the controlling thread pumps.
#[derive(Clone, Debug, Default)]
pub struct RecordStats {
    pub frames_recorded: u64,
    /// Frames dropped by per-frame failures or backpressure; the session
    /// keeps going.
    pub frames_skipped: u64,
    pub bytes_recorded: u64,
    pub record_start: Option<Instant>,
}

impl RecordStats {
    pub fn elapsed(&self) -> Option<Duration> {
        self.record_start.map(|start| start.elapsed())
    }
}

struct RecorderShared {
    state: Mutex<LifecycleState>,
    updates: MailboxSender<RecorderUpdate>,
    errors: Arc<dyn ErrorSink>,
}

struct Attachment {
    guard: CallbackGuard,
    queue: flume::Sender<QueueItem>,
}

/// A frame sink with a record lifecycle.
pub struct Recorder {
    shared: Arc<RecorderShared>,
    updates: Mailbox<RecorderUpdate>,
    worker: Option<JoinHandle<()>>,
    sink: Arc<dyn RecordSink>,
    /// Explicit per-field output overrides; fields left unknown inherit
    /// from the source, then from built-in defaults.
    pub format_request: VideoFormat,
    /// When set, an unknown output rate prefers the player's observed rate
    /// over its nominal one.
    pub estimate_rate: bool,
    /// How often a blocked worker rechecks its lifecycle state.
    pub poll_timeout: Duration,
    format_source: VideoFormat,
    format_in_use: VideoFormat,
    stats: RecordStats,
    attachment: Option<Attachment>,
}

impl Recorder {
    pub fn new(sink: Arc<dyn RecordSink>) -> Self {
        Self::with_error_sink(sink, noop_error_sink())
    }

    pub fn with_error_sink(sink: Arc<dyn RecordSink>, errors: Arc<dyn ErrorSink>) -> Self {
        let updates = Mailbox::new();
        let shared = Arc::new(RecorderShared {
            state: Mutex::new(LifecycleState::Idle),
            updates: updates.sender(),
            errors,
        });
        Self {
            shared,
            updates,
            worker: None,
            sink,
            format_request: VideoFormat::default(),
            estimate_rate: false,
            poll_timeout: Duration::from_millis(10),
            format_source: VideoFormat::default(),
            format_in_use: VideoFormat::default(),
            stats: RecordStats::default(),
            attachment: None,
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.shared.state.lock()
    }

    pub fn is_recording(&self) -> bool {
        self.state() == LifecycleState::Active
    }

    /// The source's negotiated format captured when recording started.
    pub fn format_source(&self) -> &VideoFormat {
        &self.format_source
    }

    /// The negotiated output format; unknown until the worker sees its
    /// first frame.
    pub fn format_in_use(&self) -> &VideoFormat {
        &self.format_in_use
    }

    pub fn stats(&self) -> &RecordStats {
        &self.stats
    }

    /// Schedule pumps from an event loop.
    pub fn set_wake_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.updates.set_wake_hook(hook);
    }

    /// Start recording from `player`. Fails unless this lifecycle is idle
    /// and the player is actively delivering frames with a known rate.
    /// Registers a frame callback on the player and spawns the record
    /// worker; the first queued frame fixes the output format.
    pub fn record(&mut self, player: &mut Player) -> Result<(), LifecycleError> {
        self.pump();
        {
            let state = self.shared.state.lock();
            if *state != LifecycleState::Idle {
                return Err(LifecycleError::InvalidState {
                    op: "record",
                    state: *state,
                });
            }
        }
        if player.state() != LifecycleState::Active {
            return Err(LifecycleError::SourceNotPlaying {
                state: player.state(),
            });
        }
        let source_format = player.format_in_use().clone();
        if source_format.rate == 0.0 {
            return Err(LifecycleError::SourceRateUnknown);
        }

        *self.shared.state.lock() = LifecycleState::Starting;
        self.stats = RecordStats::default();
        self.format_source = source_format.clone();
        self.format_in_use = VideoFormat::default();

        // Fresh queue per session: a reattaching consumer never sees a
        // previous session's frames.
        let (tx, rx) = flume::unbounded();
        let callback_tx = tx.clone();
        let guard = player.attach_frame_callback(move |frame, meta| {
            // The clone copies refcounts, not pixels; the callback does
            // not retain the borrowed frame past the call.
            let _ = callback_tx.send(QueueItem::Frame(frame.clone(), *meta));
        });

        let negotiation = Negotiation {
            request: self.format_request.clone(),
            source: source_format,
            estimated_rate: if self.estimate_rate {
                player.stats().observed_rate
            } else {
                0.0
            },
        };
        let shared = self.shared.clone();
        let sink = self.sink.clone();
        let poll = self.poll_timeout;
        let spawned = thread::Builder::new()
            .name("camlink-record".into())
            .spawn(move || {
                record_worker(&shared, &rx, sink.as_ref(), &negotiation, poll);
                shared.updates.post(RecorderUpdate::CompleteStop);
            });
        match spawned {
            Ok(handle) => {
                self.worker = Some(handle);
                self.attachment = Some(Attachment { guard, queue: tx });
                info!("record requested");
                Ok(())
            }
            Err(e) => {
                guard.detach();
                *self.shared.state.lock() = LifecycleState::Idle;
                Err(LifecycleError::Spawn {
                    thread: "record",
                    source: e,
                })
            }
        }
    }

    /// Request a stop. Same contract as [`Player::stop`]: false when
    /// already idle or already stopping. Unregisters the frame callback
    /// before returning, so no frame delivered after this call is ever
    /// processed.
    pub fn stop(&mut self, join: bool) -> bool {
        self.pump();
        {
            let mut state = self.shared.state.lock();
            match *state {
                LifecycleState::Idle => {
                    debug_assert!(self.worker.is_none());
                    return false;
                }
                LifecycleState::Stopping => {
                    drop(state);
                    if join {
                        self.join_worker();
                    }
                    return false;
                }
                _ => {
                    *state = LifecycleState::Stopping;
                }
            }
        }
        self.detach();
        info!("record stop requested");
        if join {
            self.join_worker();
        }
        true
    }

    /// Stop everything this lifecycle owns.
    pub fn stop_all(&mut self, join: bool) {
        self.stop(join);
    }

    /// Estimated output data rate in bytes per second, from the negotiated
    /// format with the override and source formats filling unknown fields.
    pub fn data_rate(&self) -> Option<u64> {
        self.format_in_use
            .or(&self.format_request)
            .or(&self.format_source)
            .data_rate()
    }

    fn detach(&mut self) {
        if let Some(attachment) = self.attachment.take() {
            attachment.guard.detach();
            let _ = attachment.queue.send(QueueItem::Eof);
        }
    }

    fn join_worker(&mut self) {
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
        self.pump();
    }

    /// Apply pending worker updates.
    pub fn pump(&mut self) {
        let mut pending = Vec::new();
        self.updates.drain(|update| pending.push(update));
        for update in pending {
            self.apply(update);
        }
    }

    fn apply(&mut self, update: RecorderUpdate) {
        match update {
            RecorderUpdate::CompleteStart(format) => {
                let mut state = self.shared.state.lock();
                debug_assert_ne!(*state, LifecycleState::Idle);
                debug_assert_ne!(*state, LifecycleState::Active);
                if *state == LifecycleState::Starting {
                    *state = LifecycleState::Active;
                    drop(state);
                    info!(format = %format, "recording");
                    self.format_in_use = format;
                }
            }
            RecorderUpdate::CompleteStop => {
                {
                    let mut state = self.shared.state.lock();
                    if *state == LifecycleState::Idle {
                        return;
                    }
                    *state = LifecycleState::Idle;
                }
                // Safety net for the failed-start path, where stop was
                // never requested and the callback is still attached.
                self.detach();
                if let Some(handle) = self.worker.take() {
                    let _ = handle.join();
                }
                debug!("record stopped");
            }
            RecorderUpdate::RecordStart(at) => self.stats.record_start = Some(at),
            RecorderUpdate::FramesRecorded(n) => self.stats.frames_recorded += n,
            RecorderUpdate::FramesSkipped(n) => self.stats.frames_skipped += n,
            RecorderUpdate::BytesRecorded(n) => self.stats.bytes_recorded += n,
        }
    }
}

struct Negotiation {
    request: VideoFormat,
    source: VideoFormat,
    estimated_rate: f64,
}

impl Negotiation {
    /// Fix the output format from the first received frame. Each field
    /// falls back independently: explicit override, then what the source
    /// actually delivered, then its nominal metadata, then a built-in
    /// default.
    fn resolve(&self, first: &Frame) -> VideoFormat {
        let delivered = VideoFormat::new(first.pix_fmt.clone(), first.width, first.height, 0.0);
        let input = delivered
            .or(&self.source)
            .or(&VideoFormat::new("yuv420p", 640, 480, 0.0));
        let mut output = self.request.or(&input);
        // Rate falls back on its own chain: explicit override, observed
        // rate when estimation is on, the source's nominal rate, then the
        // built-in default.
        let mut rate = self.request.rate;
        if rate == 0.0 {
            rate = self.estimated_rate;
        }
        if rate == 0.0 {
            rate = self.source.rate;
        }
        if rate == 0.0 {
            rate = DEFAULT_RATE;
        }
        output.rate = rate;
        output
    }
}

fn record_worker(
    shared: &RecorderShared,
    rx: &flume::Receiver<QueueItem>,
    sink: &dyn RecordSink,
    negotiation: &Negotiation,
    poll: Duration,
) {
    let mut stream: Option<Box<dyn SinkStream>> = None;
    loop {
        if *shared.state.lock() == LifecycleState::Stopping {
            break;
        }
        let item = match rx.recv_timeout(poll) {
            Ok(item) => item,
            Err(flume::RecvTimeoutError::Timeout) => continue,
            Err(flume::RecvTimeoutError::Disconnected) => break,
        };
        let (frame, meta) = match item {
            QueueItem::Frame(frame, meta) => (frame, meta),
            QueueItem::Eof => break,
        };

        if stream.is_none() {
            shared
                .updates
                .post(RecorderUpdate::RecordStart(Instant::now()));
            let format = negotiation.resolve(&frame);
            match sink.open(&format) {
                Ok(opened) => {
                    stream = Some(opened);
                    shared.updates.post(RecorderUpdate::CompleteStart(format));
                }
                Err(e) => {
                    // A sink that cannot open aborts this attempt; the
                    // completion posted by the wrapper forces the
                    // lifecycle back to idle without reaching active.
                    shared
                        .errors
                        .report(&anyhow::Error::new(e).context("opening record sink"), true);
                    return;
                }
            }
        }

        if let Some(out) = stream.as_mut() {
            match out.write(&frame, &meta) {
                Ok(bytes) => {
                    shared.updates.post(RecorderUpdate::BytesRecorded(bytes));
                    shared.updates.post(RecorderUpdate::FramesRecorded(1));
                }
                Err(e) => {
                    // One bad frame does not end the session.
                    shared
                        .errors
                        .report(&anyhow::Error::new(e).context("writing frame"), true);
                    shared.updates.post(RecorderUpdate::FramesSkipped(1));
                }
            }
        }
    }

    if let Some(mut out) = stream {
        if let Err(e) = out.close() {
            warn!(error = %e, "closing record sink failed");
            shared
                .errors
                .report(&anyhow::Error::new(e).context("closing record sink"), true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        wait_for_recorder_state, wait_for_state, wait_until, CapturingErrorSink, CountingSink,
        TestSource,
    };

    fn test_format() -> VideoFormat {
        VideoFormat::new("yuv420p", 640, 480, 30.0)
    }

    fn playing_player(frames: u64) -> Player {
        let mut player = Player::new(Arc::new(TestSource::new(test_format()).frames(frames)));
        player.play().unwrap();
        wait_for_state(&mut player, LifecycleState::Active);
        player
    }

    #[test]
    fn negotiation_inherits_source_format_exactly() {
        let negotiation = Negotiation {
            request: VideoFormat::default(),
            source: test_format(),
            estimated_rate: 0.0,
        };
        let first = crate::testing::test_frame(&test_format(), 0);
        assert_eq!(negotiation.resolve(&first), test_format());
    }

    #[test]
    fn negotiation_explicit_override_wins_per_field() {
        let negotiation = Negotiation {
            request: VideoFormat::new("", 1280, 0, 0.0),
            source: test_format(),
            estimated_rate: 0.0,
        };
        let first = crate::testing::test_frame(&test_format(), 0);
        assert_eq!(
            negotiation.resolve(&first),
            VideoFormat::new("yuv420p", 1280, 480, 30.0)
        );
    }

    #[test]
    fn negotiation_estimated_rate_precedes_source_rate() {
        let negotiation = Negotiation {
            request: VideoFormat::default(),
            source: test_format(),
            estimated_rate: 24.5,
        };
        let first = crate::testing::test_frame(&test_format(), 0);
        assert_eq!(negotiation.resolve(&first).rate, 24.5);
    }

    #[test]
    fn negotiation_falls_back_to_builtin_defaults() {
        let negotiation = Negotiation {
            request: VideoFormat::default(),
            source: VideoFormat::new("", 0, 0, 12.0),
            estimated_rate: 0.0,
        };
        // A frame with no usable format metadata at all.
        let first = Frame {
            pix_fmt: String::new(),
            width: 0,
            height: 0,
            linesizes: vec![],
            planes: vec![],
        };
        assert_eq!(
            negotiation.resolve(&first),
            VideoFormat::new("yuv420p", 640, 480, 12.0)
        );
    }

    #[test]
    fn records_frames_from_playing_player() {
        let mut player = playing_player(1000);
        let sink = CountingSink::new();
        let mut recorder = Recorder::new(Arc::new(sink.clone()));

        recorder.record(&mut player).unwrap();
        wait_for_recorder_state(&mut recorder, LifecycleState::Active);
        assert_eq!(*recorder.format_in_use(), test_format());

        wait_until(|| sink.frames() >= 3);
        assert!(recorder.stop(true));
        assert_eq!(recorder.state(), LifecycleState::Idle);

        recorder.pump();
        assert!(recorder.stats().frames_recorded >= 3);
        assert!(recorder.stats().bytes_recorded > 0);
        assert_eq!(sink.closes(), 1);
        player.stop(true);
    }

    #[test]
    fn record_requires_playing_source() {
        let mut player = Player::new(Arc::new(TestSource::new(test_format())));
        let mut recorder = Recorder::new(Arc::new(CountingSink::new()));
        assert!(matches!(
            recorder.record(&mut player),
            Err(LifecycleError::SourceNotPlaying { .. })
        ));
        assert_eq!(recorder.state(), LifecycleState::Idle);
    }

    #[test]
    fn record_requires_known_source_rate() {
        let format = VideoFormat::new("yuv420p", 640, 480, 0.0);
        let mut player = Player::new(Arc::new(TestSource::new(format).frames(10)));
        player.play().unwrap();
        wait_for_state(&mut player, LifecycleState::Active);

        let mut recorder = Recorder::new(Arc::new(CountingSink::new()));
        assert!(matches!(
            recorder.record(&mut player),
            Err(LifecycleError::SourceRateUnknown)
        ));
        player.stop(true);
    }

    #[test]
    fn stop_when_idle_is_a_no_op() {
        let mut recorder = Recorder::new(Arc::new(CountingSink::new()));
        assert!(!recorder.stop(false));
        assert!(!recorder.stop(true));
    }

    #[test]
    fn double_record_is_rejected() {
        let mut player = playing_player(1000);
        let mut recorder = Recorder::new(Arc::new(CountingSink::new()));
        recorder.record(&mut player).unwrap();
        assert!(matches!(
            recorder.record(&mut player),
            Err(LifecycleError::InvalidState { op: "record", .. })
        ));
        recorder.stop(true);
        player.stop(true);
    }

    #[test]
    fn open_failure_aborts_start_without_active() {
        let mut player = playing_player(1000);
        let errors = CapturingErrorSink::new();
        let sink = CountingSink::new().fail_open();
        let mut recorder = Recorder::with_error_sink(Arc::new(sink), errors.clone());

        recorder.record(&mut player).unwrap();
        wait_for_recorder_state(&mut recorder, LifecycleState::Idle);
        assert!(!recorder.format_in_use().is_fully_known());
        assert_eq!(recorder.stats().frames_recorded, 0);
        assert!(errors
            .reports()
            .iter()
            .any(|r| r.contains("opening record sink")));
        player.stop(true);
    }

    #[test]
    fn write_failures_skip_frames_but_keep_recording() {
        let mut player = playing_player(1000);
        let errors = CapturingErrorSink::new();
        let sink = CountingSink::new().fail_every(2);
        let mut recorder = Recorder::with_error_sink(Arc::new(sink.clone()), errors.clone());

        recorder.record(&mut player).unwrap();
        wait_for_recorder_state(&mut recorder, LifecycleState::Active);
        wait_until(|| {
            recorder.pump();
            recorder.stats().frames_skipped >= 2 && recorder.stats().frames_recorded >= 2
        });
        assert_eq!(recorder.state(), LifecycleState::Active);

        recorder.stop(true);
        player.stop(true);
    }

    #[test]
    fn no_frames_processed_after_stop_returns() {
        let mut player = playing_player(1000);
        let sink = CountingSink::new();
        let mut recorder = Recorder::new(Arc::new(sink.clone()));

        recorder.record(&mut player).unwrap();
        wait_for_recorder_state(&mut recorder, LifecycleState::Active);
        wait_until(|| sink.frames() >= 1);

        recorder.stop(true);
        let frames_at_stop = sink.frames();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(sink.frames(), frames_at_stop);
        player.stop(true);
    }
}
