//! Remote recorder server.
//!
//! A [`RemoteServer`] is a recorder whose sink is the network: it accepts
//! one client connection at a time and relays frames from its player to a
//! client that has asked to play. The server can record whether or not a
//! client is connected; frames with nobody watching are counted as
//! skipped, never queued.
//!
//! The handshake: the server answers a client's `started_playing` with
//! `started_recording(format)`, immediately when already recording or
//! deferred until recording starts. `stopped_recording` is sent to any
//! client that was watching (or waiting) when recording stops, and
//! duplicate `started_playing` requests are answered with an `exception`
//! envelope without double-registering the client.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use camlink_core::{
    noop_error_sink, CallbackGuard, ErrorSink, LifecycleError, LifecycleState, Player, RecordStats,
    VideoFormat,
};

use crate::backpressure::{ImageGate, ServerCommand};
use crate::envelope::{Envelope, Message, RemoteError};
use crate::framing::Decoder;
use crate::wire::{read_available, send_envelope, WireError};

/// Configuration for [`RemoteServer`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteServerConfig {
    pub host: String,
    /// Listening port; 0 picks a free one (see
    /// [`RemoteServer::local_addr`]).
    pub port: u16,
    /// Poll interval for the accept/read/queue loops; a stop request is
    /// observed within one interval.
    pub poll_timeout: Duration,
    /// Outbound image-queue capacity; the incoming frame is dropped when
    /// full. 0 disables the bound.
    pub max_images_buffered: usize,
}

impl Default for RemoteServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 10000,
            poll_timeout: Duration::from_millis(10),
            max_images_buffered: 5,
        }
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("failed to start listener: {0}")]
    Listen(#[from] std::io::Error),
}

/// Connection-level handshake state, kept apart from socket I/O so the
/// protocol rules are testable on their own.
///
/// Invariants: `client_playing` and `client_requested_playing` are never
/// both set, and `client_playing` only becomes true while a recording
/// format is known.
#[derive(Debug, Default)]
pub struct ServerSession {
    client_playing: bool,
    client_requested_playing: bool,
    recording: Option<VideoFormat>,
    first_image_pending: bool,
}

/// Envelopes the connection loop should transmit in response to an event.
#[derive(Debug, Default, PartialEq)]
pub struct SessionReply {
    pub send: Vec<Message>,
}

impl SessionReply {
    fn one(message: Message) -> Self {
        Self {
            send: vec![message],
        }
    }
}

impl ServerSession {
    pub fn client_playing(&self) -> bool {
        self.client_playing
    }

    pub fn client_requested_playing(&self) -> bool {
        self.client_requested_playing
    }

    pub fn is_recording(&self) -> bool {
        self.recording.is_some()
    }

    /// Handle a message read from the client socket.
    pub fn on_client_message(&mut self, message: &Message) -> SessionReply {
        match message {
            Message::StartedPlaying => {
                if self.client_playing || self.client_requested_playing {
                    // Duplicate request: tell the client, change nothing.
                    return SessionReply::one(Message::Exception(RemoteError::new(
                        "client already notified that it is playing",
                    )));
                }
                if let Some(format) = &self.recording {
                    self.client_playing = true;
                    SessionReply::one(Message::StartedRecording(format.clone()))
                } else {
                    // Deferred until recording starts.
                    self.client_requested_playing = true;
                    SessionReply::default()
                }
            }
            Message::StoppedPlaying => {
                self.client_requested_playing = false;
                self.client_playing = false;
                SessionReply::one(Message::StoppedPlaying)
            }
            other => SessionReply::one(Message::Exception(RemoteError::new(format!(
                "unexpected message {}",
                other.tag()
            )))),
        }
    }

    /// Recording started locally; promote a waiting client.
    pub fn on_recording_started(&mut self, format: VideoFormat) -> SessionReply {
        // A client can at most be in requested state here: playing implies
        // a previous recording, which sent stopped_recording and cleared it.
        debug_assert!(!self.client_playing);
        self.recording = Some(format.clone());
        self.first_image_pending = true;
        if self.client_requested_playing {
            self.client_requested_playing = false;
            self.client_playing = true;
            SessionReply::one(Message::StartedRecording(format))
        } else {
            SessionReply::default()
        }
    }

    /// Recording stopped locally; notify a watching or waiting client.
    pub fn on_recording_stopped(&mut self) -> SessionReply {
        self.recording = None;
        if self.client_requested_playing || self.client_playing {
            self.client_requested_playing = false;
            self.client_playing = false;
            SessionReply::one(Message::StoppedRecording)
        } else {
            SessionReply::default()
        }
    }

    /// Connection torn down; client flags die with it, the recording
    /// state does not.
    pub fn on_disconnect(&mut self) {
        self.client_playing = false;
        self.client_requested_playing = false;
    }

    /// True exactly once per recording: for the first frame dequeued after
    /// `on_recording_started`.
    fn take_first_image(&mut self) -> bool {
        std::mem::take(&mut self.first_image_pending)
    }
}

/// Updates posted by the listener thread, applied on the controlling
/// thread.
enum ServerEvent {
    RecordStart(Instant),
    FramesRecorded(u64),
    BytesRecorded(u64),
    /// The listener died; the server shuts down after reporting.
    Fatal(String),
}

struct ListenerHandle {
    thread: JoinHandle<()>,
    tx: flume::Sender<ServerCommand>,
    gate: ImageGate,
    local_addr: SocketAddr,
}

/// A recorder whose sink is a network client.
///
/// Unlike a disk recorder there is no record worker: `record` and `stop`
/// complete their transitions synchronously on the controlling thread,
/// while the persistent listener thread owns all socket traffic.
pub struct RemoteServer {
    config: RemoteServerConfig,
    errors: Arc<dyn ErrorSink>,
    state: LifecycleState,
    format_source: VideoFormat,
    format_in_use: VideoFormat,
    stats: RecordStats,
    events: camlink_core::Mailbox<ServerEvent>,
    listener: Option<ListenerHandle>,
    attachment: Option<CallbackGuard>,
}

impl RemoteServer {
    pub fn new(config: RemoteServerConfig) -> Self {
        Self::with_error_sink(config, noop_error_sink())
    }

    pub fn with_error_sink(config: RemoteServerConfig, errors: Arc<dyn ErrorSink>) -> Self {
        Self {
            config,
            errors,
            state: LifecycleState::Idle,
            format_source: VideoFormat::default(),
            format_in_use: VideoFormat::default(),
            stats: RecordStats::default(),
            events: camlink_core::Mailbox::new(),
            listener: None,
            attachment: None,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn is_recording(&self) -> bool {
        self.state == LifecycleState::Active
    }

    /// True while the listener thread is up.
    pub fn is_server_active(&self) -> bool {
        self.listener.is_some()
    }

    /// The bound address, once the listener is started. With port 0 in the
    /// config this is where the real port shows up.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().map(|l| l.local_addr)
    }

    /// The source's negotiated format captured when recording started.
    pub fn format_source(&self) -> &VideoFormat {
        &self.format_source
    }

    /// The negotiated format being served; unknown while not recording.
    pub fn format_in_use(&self) -> &VideoFormat {
        &self.format_in_use
    }

    /// Counters for transmitted frames. `frames_skipped` covers both
    /// frames dropped at the bounded queue and frames that arrived with no
    /// client playing; only transmitted frames count toward
    /// `frames_recorded` and `bytes_recorded`.
    pub fn stats(&self) -> RecordStats {
        let mut stats = self.stats.clone();
        if let Some(listener) = &self.listener {
            stats.frames_skipped += listener.gate.skipped();
        }
        stats
    }

    /// Start the listener thread without recording. `record` calls this
    /// implicitly; starting early lets a client connect and wait.
    pub fn start_server(&mut self) -> Result<(), ServerError> {
        if self.listener.is_some() {
            return Ok(());
        }
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "remote recorder listening");

        let (tx, rx) = flume::unbounded();
        let gate = ImageGate::new(tx.clone(), self.config.max_images_buffered);
        let events = self.events.sender();
        let errors = self.errors.clone();
        let poll = self.config.poll_timeout;
        let loop_gate = gate.clone();
        let thread = thread::Builder::new()
            .name("camlink-server".into())
            .spawn(move || server_loop(&listener, &rx, &loop_gate, &events, errors.as_ref(), poll))
            .map_err(|e| LifecycleError::Spawn {
                thread: "server",
                source: e,
            })?;

        self.listener = Some(ListenerHandle {
            thread,
            tx,
            gate,
            local_addr,
        });
        Ok(())
    }

    /// Start recording from `player`: capture its negotiated format,
    /// subscribe to its frames, and announce `started_recording` (to be
    /// delivered now or when a client asks to play).
    pub fn record(&mut self, player: &mut Player) -> Result<(), ServerError> {
        self.pump();
        if self.state != LifecycleState::Idle {
            return Err(LifecycleError::InvalidState {
                op: "record",
                state: self.state,
            }
            .into());
        }
        if player.state() != LifecycleState::Active {
            return Err(LifecycleError::SourceNotPlaying {
                state: player.state(),
            }
            .into());
        }
        self.start_server()?;
        let listener = match &self.listener {
            Some(listener) => listener,
            None => unreachable!("listener running after start_server"),
        };

        self.state = LifecycleState::Starting;
        self.stats = RecordStats::default();
        self.format_source = player.format_in_use().clone();
        // The network relays frames as they are; the source format is the
        // negotiated one.
        self.format_in_use = self.format_source.clone();

        let gate = listener.gate.clone();
        let guard = player.attach_frame_callback(move |frame, meta| {
            gate.admit(frame.clone(), *meta);
        });
        self.attachment = Some(guard);
        let _ = listener
            .tx
            .send(ServerCommand::StartedRecording(self.format_in_use.clone()));

        // No worker to wait for: the transition completes here.
        self.state = LifecycleState::Active;
        info!(format = %self.format_in_use, "recording to network");
        Ok(())
    }

    /// Stop recording. Same idempotence contract as any recorder stop:
    /// false when already idle. The listener keeps running; use
    /// [`RemoteServer::stop_server`] to take it down too.
    pub fn stop(&mut self, _join: bool) -> bool {
        self.pump();
        if self.state == LifecycleState::Idle {
            return false;
        }
        self.state = LifecycleState::Stopping;
        if let Some(attachment) = self.attachment.take() {
            attachment.detach();
        }
        if let Some(listener) = &self.listener {
            let _ = listener.tx.send(ServerCommand::StoppedRecording);
        }
        self.format_in_use = VideoFormat::default();
        self.state = LifecycleState::Idle;
        info!("network recording stopped");
        true
    }

    /// Stop recording and shut the listener down.
    pub fn stop_server(&mut self, join: bool) {
        self.stop(join);
        if let Some(listener) = self.listener.take() {
            let _ = listener.tx.send(ServerCommand::Eof);
            if join {
                let _ = listener.thread.join();
            }
            // Fold the gate's skip count into the lifetime stats before
            // the handle goes away.
            self.stats.frames_skipped += listener.gate.skipped();
        }
    }

    pub fn stop_all(&mut self, join: bool) {
        self.stop_server(join);
    }

    /// Apply pending listener events.
    pub fn pump(&mut self) {
        let mut pending = Vec::new();
        self.events.drain(|event| pending.push(event));
        for event in pending {
            match event {
                ServerEvent::RecordStart(at) => self.stats.record_start = Some(at),
                ServerEvent::FramesRecorded(n) => self.stats.frames_recorded += n,
                ServerEvent::BytesRecorded(n) => self.stats.bytes_recorded += n,
                ServerEvent::Fatal(message) => {
                    self.errors
                        .report(&anyhow::anyhow!("listener failed: {message}"), false);
                    self.stop_server(false);
                }
            }
        }
    }
}

impl Drop for RemoteServer {
    fn drop(&mut self) {
        // Let the listener thread wind down on its own; nothing to join
        // from an arbitrary drop site.
        if let Some(listener) = &self.listener {
            let _ = listener.tx.send(ServerCommand::Eof);
        }
    }
}

enum LoopExit {
    /// Local shutdown requested.
    Eof,
    /// This client is gone; go back to accepting.
    Disconnected,
}

enum Drained {
    Continue,
    Eof,
}

fn server_loop(
    listener: &TcpListener,
    rx: &flume::Receiver<ServerCommand>,
    gate: &ImageGate,
    events: &camlink_core::MailboxSender<ServerEvent>,
    errors: &dyn ErrorSink,
    poll: Duration,
) {
    let mut session = ServerSession::default();
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                info!(%peer, "client connected");
                let exit = serve_connection(stream, &mut session, rx, gate, events, errors, poll);
                session.on_disconnect();
                info!(%peer, "closing client connection");
                if matches!(exit, LoopExit::Eof) {
                    return;
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                // No client: keep draining local commands so recording
                // state stays current and unwatched frames are counted.
                if let Drained::Eof = drain_commands(None, &mut session, rx, gate, events) {
                    return;
                }
                thread::sleep(poll);
            }
            Err(e) => {
                events.post(ServerEvent::Fatal(format!("accept failed: {e}")));
                return;
            }
        }
    }
}

fn serve_connection(
    mut stream: TcpStream,
    session: &mut ServerSession,
    rx: &flume::Receiver<ServerCommand>,
    gate: &ImageGate,
    events: &camlink_core::MailboxSender<ServerEvent>,
    errors: &dyn ErrorSink,
    poll: Duration,
) -> LoopExit {
    if let Err(e) = stream.set_read_timeout(Some(poll)) {
        errors.report(
            &anyhow::Error::new(e).context("configuring client socket"),
            true,
        );
        return LoopExit::Disconnected;
    }
    let mut decoder = Decoder::new();
    loop {
        match read_available(&mut stream, &mut decoder) {
            Ok(envelopes) => {
                for envelope in envelopes {
                    debug!(tag = envelope.message.tag(), "client message");
                    let reply = session.on_client_message(&envelope.message);
                    if send_reply(&mut stream, reply).is_err() {
                        return LoopExit::Disconnected;
                    }
                }
            }
            Err(e) if e.is_disconnect() => {
                debug!("client disconnected");
                return LoopExit::Disconnected;
            }
            Err(WireError::Framing(e)) => {
                // Protocol violation: tell the client if we still can,
                // stop serving this connection, keep the listener alive.
                errors.report(
                    &anyhow::Error::new(e).context("malformed client traffic"),
                    true,
                );
                let notice =
                    Envelope::control(Message::Exception(RemoteError::new("malformed envelope")));
                let _ = send_envelope(&mut stream, &notice);
                return LoopExit::Disconnected;
            }
            Err(e) => {
                errors.report(&anyhow::Error::new(e).context("reading client socket"), true);
                return LoopExit::Disconnected;
            }
        }

        if let Drained::Eof = drain_commands(Some(&mut stream), session, rx, gate, events) {
            return LoopExit::Eof;
        }
    }
}

/// Drain queued commands, relaying frames to a playing client. Without a
/// connection, replies are dropped and frames count as skipped.
fn drain_commands(
    mut conn: Option<&mut TcpStream>,
    session: &mut ServerSession,
    rx: &flume::Receiver<ServerCommand>,
    gate: &ImageGate,
    events: &camlink_core::MailboxSender<ServerEvent>,
) -> Drained {
    for command in rx.try_iter() {
        match command {
            ServerCommand::Eof => return Drained::Eof,
            ServerCommand::Image(frame, meta) => {
                if session.take_first_image() {
                    events.post(ServerEvent::RecordStart(Instant::now()));
                }
                if !session.client_playing() {
                    gate.note_skipped();
                    continue;
                }
                match conn.as_deref_mut() {
                    Some(stream) => {
                        let bytes = frame.total_bytes();
                        let envelope = Envelope::image(&frame, meta);
                        match send_envelope(stream, &envelope) {
                            Ok(()) => {
                                events.post(ServerEvent::FramesRecorded(1));
                                events.post(ServerEvent::BytesRecorded(bytes));
                            }
                            Err(e) => {
                                warn!(error = %e, "dropping client after failed send");
                                gate.note_skipped();
                                session.on_disconnect();
                                conn = None;
                            }
                        }
                    }
                    // client_playing without a socket cannot happen; the
                    // flags die with the connection.
                    None => gate.note_skipped(),
                }
            }
            ServerCommand::StartedRecording(format) => {
                let reply = session.on_recording_started(format);
                send_reply_opt(&mut conn, session, reply);
            }
            ServerCommand::StoppedRecording => {
                let reply = session.on_recording_stopped();
                send_reply_opt(&mut conn, session, reply);
            }
        }
    }
    Drained::Continue
}

fn send_reply(stream: &mut TcpStream, reply: SessionReply) -> Result<(), WireError> {
    for message in reply.send {
        send_envelope(stream, &Envelope::control(message))?;
    }
    Ok(())
}

fn send_reply_opt(
    conn: &mut Option<&mut TcpStream>,
    session: &mut ServerSession,
    reply: SessionReply,
) {
    if reply.send.is_empty() {
        return;
    }
    if let Some(stream) = conn.as_deref_mut() {
        if let Err(e) = send_reply(stream, reply) {
            warn!(error = %e, "dropping client after failed send");
            session.on_disconnect();
            *conn = None;
        }
    }
}
