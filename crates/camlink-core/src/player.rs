//! Playback lifecycle shared by every capture source.
//!
//! A [`Player`] walks `Idle -> Starting -> Active -> Stopping -> Idle`.
//! `play` and `stop` are controlling-thread operations; the
//! `Starting -> Active` and `Stopping -> Idle` completions are requested by
//! the capture worker through the player's mailbox and applied when the
//! controlling thread pumps it. The worker never observes a transition
//! back to `Active` after it has requested a stop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::errors::{noop_error_sink, DeviceError, ErrorSink, LifecycleError};
use crate::frame::{Frame, FrameMetadata};
use crate::mailbox::{Mailbox, MailboxSender};
use crate::types::{LifecycleState, VideoFormat};

/// Capture backend driven by the player's worker thread.
///
/// An implementation opens its device, determines the first real frame's
/// format, calls [`WorkerHandle::complete_start`], then delivers frames
/// with [`WorkerHandle::process_frame`] until [`WorkerHandle::should_stop`]
/// reports true. Backends must poll `should_stop` at every loop iteration
/// (bounded waits only); stop is cooperative and a worker wedged in an
/// uninterruptible device call cannot be force-terminated.
///
/// Vendor callback APIs are wrapped by an adapter implementing this trait;
/// the lifecycle itself never implements a vendor interface.
pub trait DeviceSource: Send + Sync + 'static {
    fn run(&self, worker: &mut WorkerHandle) -> Result<(), DeviceError>;
}

/// Updates posted by the worker, applied on the controlling thread.
enum PlayerUpdate {
    CompleteStart(VideoFormat),
    CompleteStop,
    FirstFrame(Instant),
    ObservedRate(f64),
    FramesPlayed(u64),
}

/// Handle returned when registering a frame callback; used to unregister.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallbackId(u64);

/// Callback invoked synchronously for every frame, on the delivering
/// thread, in registration order. Must not block indefinitely and must not
/// retain the frame past the call without cloning it.
pub type FrameCallback = Arc<dyn Fn(&Frame, &FrameMetadata) + Send + Sync>;

#[derive(Default)]
struct CallbackRegistry {
    next_id: u64,
    entries: Vec<(CallbackId, FrameCallback)>,
}

impl CallbackRegistry {
    fn add(&mut self, callback: FrameCallback) -> CallbackId {
        let id = CallbackId(self.next_id);
        self.next_id += 1;
        self.entries.push((id, callback));
        id
    }

    fn remove(&mut self, id: CallbackId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry_id, _)| *entry_id != id);
        self.entries.len() != before
    }

    fn snapshot(&self) -> Vec<FrameCallback> {
        self.entries.iter().map(|(_, cb)| cb.clone()).collect()
    }
}

struct PlayerShared {
    state: Mutex<LifecycleState>,
    /// Mutated only from the controlling thread; the worker iterates over
    /// a per-call snapshot, so delivery never races a registration.
    callbacks: Mutex<CallbackRegistry>,
    last_frame: Mutex<Option<(Frame, FrameMetadata)>>,
    /// At most one display refresh is ever pending, however many frames
    /// arrive between pumps.
    display_pending: AtomicBool,
    updates: MailboxSender<PlayerUpdate>,
    errors: Arc<dyn ErrorSink>,
}

impl PlayerShared {
    fn process_frame(&self, frame: Frame, meta: FrameMetadata) {
        *self.last_frame.lock() = Some((frame.clone(), meta));
        let callbacks = self.callbacks.lock().snapshot();
        for callback in &callbacks {
            callback(&frame, &meta);
        }
        self.display_pending.store(true, Ordering::Release);
        self.updates.wake();
    }
}

/// Capture-side view of a [`Player`], handed to the device worker.
pub struct WorkerHandle {
    shared: Arc<PlayerShared>,
    request: VideoFormat,
    rate: RateEstimator,
    delivered: u64,
}

impl WorkerHandle {
    /// True once a stop was requested; poll this every loop iteration.
    pub fn should_stop(&self) -> bool {
        matches!(
            *self.shared.state.lock(),
            LifecycleState::Stopping | LifecycleState::Idle
        )
    }

    /// The format the controlling thread requested when play started.
    /// Fields left unknown are the worker's to negotiate with the device.
    pub fn format_request(&self) -> &VideoFormat {
        &self.request
    }

    /// Record the negotiated format and request `Starting -> Active`.
    /// Call exactly once, after the first real frame's format is known.
    pub fn complete_start(&mut self, format: VideoFormat) {
        self.shared.updates.post(PlayerUpdate::CompleteStart(format));
    }

    /// Deliver one frame to every registered callback, in registration
    /// order, then schedule a coalesced display refresh. Also drives the
    /// observed-rate accounting, recomputed on at-least-one-second windows
    /// and published through the mailbox.
    pub fn process_frame(&mut self, frame: Frame, meta: FrameMetadata) {
        let now = Instant::now();
        if self.delivered == 0 {
            self.shared.updates.post(PlayerUpdate::FirstFrame(now));
            self.rate.reset(now);
        }
        self.delivered += 1;
        self.shared.process_frame(frame, meta);
        self.shared.updates.post(PlayerUpdate::FramesPlayed(1));
        if let Some(rate) = self.rate.tick(now) {
            self.shared.updates.post(PlayerUpdate::ObservedRate(rate));
        }
    }
}

/// Play-time counters, updated when the controlling thread pumps.
#[derive(Clone, Debug, Default)]
pub struct PlayStats {
    pub frames_played: u64,
    /// Frames per second observed over the last accounting window.
    pub observed_rate: f64,
    /// When the first frame arrived.
    pub play_start: Option<Instant>,
}

impl PlayStats {
    pub fn elapsed(&self) -> Option<Duration> {
        self.play_start.map(|start| start.elapsed())
    }
}

/// A frame source with a play lifecycle.
///
/// All methods are controlling-thread operations. `pump` applies pending
/// worker updates; the public entry points call it first, and hosts with
/// an event loop can use [`Player::set_wake_hook`] to schedule pumps.
pub struct Player {
    shared: Arc<PlayerShared>,
    updates: Mailbox<PlayerUpdate>,
    worker: Option<JoinHandle<()>>,
    source: Option<Arc<dyn DeviceSource>>,
    /// The format requested from the device. Fields left unknown are
    /// negotiated from the first real frame.
    pub format_request: VideoFormat,
    /// Set while a host is reconfiguring the source; `play` refuses.
    pub config_active: bool,
    format_in_use: VideoFormat,
    stats: PlayStats,
    display_hook: Option<Box<dyn FnMut(&Frame) + Send>>,
}

impl Player {
    /// Player backed by a capture device.
    pub fn new(source: Arc<dyn DeviceSource>) -> Self {
        Self::with_error_sink(source, noop_error_sink())
    }

    pub fn with_error_sink(source: Arc<dyn DeviceSource>, errors: Arc<dyn ErrorSink>) -> Self {
        Self::build(Some(source), errors)
    }

    /// Player with no owned capture worker: frames arrive from an external
    /// connection, which drives the lifecycle through
    /// [`Player::complete_start`] / [`Player::complete_stop`]. Used by
    /// remote players.
    pub fn remote(errors: Arc<dyn ErrorSink>) -> Self {
        Self::build(None, errors)
    }

    fn build(source: Option<Arc<dyn DeviceSource>>, errors: Arc<dyn ErrorSink>) -> Self {
        let updates = Mailbox::new();
        let shared = Arc::new(PlayerShared {
            state: Mutex::new(LifecycleState::Idle),
            callbacks: Mutex::new(CallbackRegistry::default()),
            last_frame: Mutex::new(None),
            display_pending: AtomicBool::new(false),
            updates: updates.sender(),
            errors,
        });
        Self {
            shared,
            updates,
            worker: None,
            source,
            format_request: VideoFormat::default(),
            config_active: false,
            format_in_use: VideoFormat::default(),
            stats: PlayStats::default(),
            display_hook: None,
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.shared.state.lock()
    }

    pub fn is_playing(&self) -> bool {
        self.state() == LifecycleState::Active
    }

    /// The format actually negotiated once live data flows; unknown until
    /// the lifecycle reaches `Active`.
    pub fn format_in_use(&self) -> &VideoFormat {
        &self.format_in_use
    }

    pub fn stats(&self) -> &PlayStats {
        &self.stats
    }

    /// Latest delivered frame, if any.
    pub fn last_frame(&self) -> Option<(Frame, FrameMetadata)> {
        self.shared.last_frame.lock().clone()
    }

    /// Install the hook invoked (at most once per pump, with the latest
    /// frame) when a display refresh is pending.
    pub fn set_display_hook(&mut self, hook: impl FnMut(&Frame) + Send + 'static) {
        self.display_hook = Some(Box::new(hook));
    }

    /// Schedule pumps from an event loop: the hook fires once per batch of
    /// worker updates.
    pub fn set_wake_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.updates.set_wake_hook(hook);
    }

    /// Register a frame callback; it will be invoked synchronously for
    /// every frame, in registration order, on the delivering thread.
    /// Only call from the controlling thread.
    pub fn add_frame_callback(
        &mut self,
        callback: impl Fn(&Frame, &FrameMetadata) + Send + Sync + 'static,
    ) -> CallbackId {
        self.shared.callbacks.lock().add(Arc::new(callback))
    }

    /// Like [`Player::add_frame_callback`], returning a guard that can
    /// detach without borrowing the player. Detach only from the
    /// controlling thread.
    pub fn attach_frame_callback(
        &mut self,
        callback: impl Fn(&Frame, &FrameMetadata) + Send + Sync + 'static,
    ) -> CallbackGuard {
        let id = self.add_frame_callback(callback);
        CallbackGuard {
            shared: Arc::downgrade(&self.shared),
            id,
        }
    }

    /// Remove a registered callback. Only call from the controlling
    /// thread.
    pub fn remove_frame_callback(&mut self, id: CallbackId) -> bool {
        self.shared.callbacks.lock().remove(id)
    }

    /// Start playing. Fails unless the lifecycle is idle and the source is
    /// not being configured. The worker thread owns the capture loop from
    /// here until it requests stop-completion.
    pub fn play(&mut self) -> Result<(), LifecycleError> {
        self.pump();
        if self.config_active {
            return Err(LifecycleError::Configuring);
        }
        {
            let mut state = self.shared.state.lock();
            if *state != LifecycleState::Idle {
                return Err(LifecycleError::InvalidState {
                    op: "play",
                    state: *state,
                });
            }
            *state = LifecycleState::Starting;
        }
        self.stats = PlayStats::default();
        self.format_in_use = VideoFormat::default();
        info!("play requested");

        let source = match &self.source {
            Some(source) => source.clone(),
            // Remote players have no worker; the connection completes the
            // start when the server announces its format.
            None => return Ok(()),
        };

        let shared = self.shared.clone();
        let request = self.format_request.clone();
        let spawned = thread::Builder::new()
            .name("camlink-play".into())
            .spawn(move || {
                let mut worker = WorkerHandle {
                    shared: shared.clone(),
                    request,
                    rate: RateEstimator::new(),
                    delivered: 0,
                };
                if let Err(e) = source.run(&mut worker) {
                    shared
                        .errors
                        .report(&anyhow::Error::new(e).context("capture worker failed"), true);
                }
                // Completion is unconditional, error or not, so the
                // lifecycle can never wedge in starting/stopping.
                shared.updates.post(PlayerUpdate::CompleteStop);
            });
        match spawned {
            Ok(handle) => {
                self.worker = Some(handle);
                Ok(())
            }
            Err(e) => {
                *self.shared.state.lock() = LifecycleState::Idle;
                Err(LifecycleError::Spawn {
                    thread: "play",
                    source: e,
                })
            }
        }
    }

    /// Request a stop. Returns false (and does nothing) when already idle;
    /// returns false when already stopping, optionally joining the worker
    /// first. Returns true when this call initiated the stop.
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
        info!("stop requested");
        if join {
            self.join_worker();
        }
        true
    }

    /// Stop everything this lifecycle owns. A plain player only owns its
    /// capture worker; remote players also tear their connection down.
    pub fn stop_all(&mut self, join: bool) {
        self.stop(join);
    }

    /// Estimated stream data rate in bytes per second, from the negotiated
    /// format with the requested one filling unknown fields.
    pub fn data_rate(&self) -> Option<u64> {
        self.format_in_use.or(&self.format_request).data_rate()
    }

    fn join_worker(&mut self) {
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
        // The worker posted its completion before exiting; apply it so the
        // caller observes idle after a joining stop.
        self.pump();
    }

    /// Deliver a frame on behalf of an external connection, from the
    /// controlling thread. Device-backed players deliver through
    /// [`WorkerHandle::process_frame`] instead.
    pub fn process_frame(&mut self, frame: Frame, meta: FrameMetadata) {
        if self.stats.play_start.is_none() {
            self.stats.play_start = Some(Instant::now());
        }
        self.stats.frames_played += 1;
        self.shared.process_frame(frame, meta);
    }

    /// Observed-rate update computed by an external connection.
    pub fn note_observed_rate(&mut self, rate: f64) {
        self.stats.observed_rate = rate;
    }

    /// Complete `Starting -> Active` with the negotiated format, on behalf
    /// of an external connection. Device workers complete through their
    /// [`WorkerHandle`].
    pub fn complete_start(&mut self, format: VideoFormat) {
        self.apply(PlayerUpdate::CompleteStart(format));
    }

    /// Complete `Stopping -> Idle` (or abandon a start that never became
    /// active), on behalf of an external connection.
    pub fn complete_stop(&mut self) {
        self.apply(PlayerUpdate::CompleteStop);
    }

    /// Apply pending worker updates and run a pending display refresh.
    pub fn pump(&mut self) {
        let mut pending = Vec::new();
        self.updates.drain(|update| pending.push(update));
        for update in pending {
            self.apply(update);
        }
        if self.shared.display_pending.swap(false, Ordering::AcqRel) {
            if let Some(hook) = self.display_hook.as_mut() {
                let last = self.shared.last_frame.lock().clone();
                if let Some((frame, _meta)) = last {
                    hook(&frame);
                }
            }
        }
    }

    fn apply(&mut self, update: PlayerUpdate) {
        match update {
            PlayerUpdate::CompleteStart(format) => {
                let mut state = self.shared.state.lock();
                // The worker may have a stop queued behind this, but it
                // never requests stop first and active after.
                debug_assert_ne!(*state, LifecycleState::Idle);
                // Only the worker sets active, and only once.
                debug_assert_ne!(*state, LifecycleState::Active);
                if *state == LifecycleState::Starting {
                    *state = LifecycleState::Active;
                    drop(state);
                    info!(format = %format, "playing");
                    self.format_in_use = format;
                }
            }
            PlayerUpdate::CompleteStop => {
                {
                    let mut state = self.shared.state.lock();
                    if *state == LifecycleState::Idle {
                        return;
                    }
                    *state = LifecycleState::Idle;
                }
                if let Some(handle) = self.worker.take() {
                    let _ = handle.join();
                }
                debug!("stopped");
            }
            PlayerUpdate::FirstFrame(at) => self.stats.play_start = Some(at),
            PlayerUpdate::ObservedRate(rate) => self.stats.observed_rate = rate,
            PlayerUpdate::FramesPlayed(n) => self.stats.frames_played += n,
        }
    }
}

/// Registration handle detaching a frame callback without borrowing the
/// player. Detach only from the controlling thread.
pub struct CallbackGuard {
    shared: Weak<PlayerShared>,
    id: CallbackId,
}

impl CallbackGuard {
    /// Remove the callback; false when it was already gone (or the player
    /// was dropped).
    pub fn detach(self) -> bool {
        match self.shared.upgrade() {
            Some(shared) => shared.callbacks.lock().remove(self.id),
            None => false,
        }
    }
}

/// Observed frames-per-second over at-least-one-second windows.
///
/// Workers feed it one tick per frame; it reports a fresh rate each time a
/// window closes and the caller publishes that through its mailbox.
#[derive(Debug)]
pub struct RateEstimator {
    window_start: Instant,
    frames: u32,
}

impl Default for RateEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl RateEstimator {
    pub fn new() -> Self {
        Self {
            window_start: Instant::now(),
            frames: 0,
        }
    }

    pub fn reset(&mut self, now: Instant) {
        self.window_start = now;
        self.frames = 0;
    }

    /// Count one frame; returns the new rate when a window closes.
    pub fn tick(&mut self, now: Instant) -> Option<f64> {
        self.frames += 1;
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed >= Duration::from_secs(1) {
            let rate = f64::from(self.frames) / elapsed.as_secs_f64();
            self.frames = 0;
            self.window_start = now;
            Some(rate)
        } else {
            None
        }
    }
}
