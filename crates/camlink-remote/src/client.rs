//! Remote player client.
//!
//! A [`RemoteClient`] is a player whose frames come from a
//! [`RemoteServer`](crate::server::RemoteServer) across a socket. The
//! embedded [`Player`] has no capture worker; a dedicated connection
//! thread moves envelopes in both directions and the controlling thread
//! applies them in [`RemoteClient::pump`], completing the lifecycle
//! transitions the server's announcements drive.
//!
//! `play` does not assume the remote side is recording: it sends
//! `started_playing` and waits in `Starting` until an unsolicited
//! `started_recording(format)` arrives, immediately if the server already
//! has a negotiated format, or later when it starts.

use std::net::TcpStream;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use camlink_core::{
    noop_error_sink, ErrorSink, LifecycleError, LifecycleState, Mailbox, MailboxSender, Player,
    RateEstimator,
};

use crate::envelope::{Envelope, Message, RemoteError};
use crate::framing::Decoder;
use crate::wire::{read_available, send_envelope, WireError};

/// Configuration for [`RemoteClient`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteClientConfig {
    pub host: String,
    pub port: u16,
    /// Poll interval for the connection loop.
    pub poll_timeout: Duration,
}

impl Default for RemoteClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 10000,
            poll_timeout: Duration::from_millis(10),
        }
    }
}

enum ClientCommand {
    Send(Message),
    /// Close the connection. A local sentinel, never serialized.
    Eof,
}

struct ConnectionHandle {
    thread: JoinHandle<()>,
    tx: flume::Sender<ClientCommand>,
}

/// A player fed by a remote recorder server.
pub struct RemoteClient {
    config: RemoteClientConfig,
    player: Player,
    events: Mailbox<Envelope>,
    conn: Option<ConnectionHandle>,
    errors: Arc<dyn ErrorSink>,
    rate: RateEstimator,
}

impl RemoteClient {
    pub fn new(config: RemoteClientConfig) -> Self {
        Self::with_error_sink(config, noop_error_sink())
    }

    pub fn with_error_sink(config: RemoteClientConfig, errors: Arc<dyn ErrorSink>) -> Self {
        Self {
            config,
            player: Player::remote(errors.clone()),
            events: Mailbox::new(),
            conn: None,
            errors,
            rate: RateEstimator::new(),
        }
    }

    /// The underlying playback lifecycle: frame callbacks, stats, display
    /// hook, negotiated format.
    pub fn player(&self) -> &Player {
        &self.player
    }

    pub fn player_mut(&mut self) -> &mut Player {
        &mut self.player
    }

    pub fn state(&self) -> LifecycleState {
        self.player.state()
    }

    /// True while the connection thread is up.
    pub fn is_client_active(&self) -> bool {
        self.conn.is_some()
    }

    /// Schedule pumps from an event loop: fires once per batch of
    /// incoming envelopes.
    pub fn set_wake_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.events.set_wake_hook(hook);
    }

    /// Connect to the server without starting to play. `play` calls this
    /// implicitly.
    pub fn start_connection(&mut self) -> Result<(), LifecycleError> {
        if self.conn.is_some() {
            return Ok(());
        }
        let host = self.config.host.clone();
        let port = self.config.port;
        let poll = self.config.poll_timeout;
        let (tx, rx) = flume::unbounded();
        let events = self.events.sender();
        let thread = thread::Builder::new()
            .name("camlink-client".into())
            .spawn(move || {
                if let Err(e) = connection_loop(&host, port, poll, &rx, &events) {
                    // The connection is unusable; the controlling thread
                    // tears the session down when it drains this.
                    events.post(Envelope::control(Message::ExceptionExit(RemoteError::new(
                        e.to_string(),
                    ))));
                }
            })
            .map_err(|e| LifecycleError::Spawn {
                thread: "connection",
                source: e,
            })?;
        self.conn = Some(ConnectionHandle { thread, tx });
        Ok(())
    }

    /// Start playing: ensure the connection is up, enter `Starting`, and
    /// ask the server for frames. Completion waits for the server's
    /// `started_recording` announcement.
    pub fn play(&mut self) -> Result<(), LifecycleError> {
        self.pump();
        self.start_connection()?;
        self.player.play()?;
        self.send(Message::StartedPlaying);
        Ok(())
    }

    /// Stop playing. `stopped_playing` goes to the server only when this
    /// call actually left the active state; the lifecycle completes when
    /// the server acknowledges.
    pub fn stop(&mut self, join: bool) -> bool {
        self.pump();
        if self.player.stop(join) {
            self.send(Message::StoppedPlaying);
            true
        } else {
            false
        }
    }

    /// Stop playing and shut the connection thread down.
    pub fn stop_connection(&mut self, join: bool) {
        self.stop(join);
        if let Some(conn) = self.conn.take() {
            let _ = conn.tx.send(ClientCommand::Eof);
            if join {
                let _ = conn.thread.join();
            }
        }
    }

    pub fn stop_all(&mut self, join: bool) {
        self.stop_connection(join);
    }

    fn send(&self, message: Message) {
        if let Some(conn) = &self.conn {
            let _ = conn.tx.send(ClientCommand::Send(message));
        }
    }

    /// Apply pending envelopes from the connection thread, then pending
    /// player updates.
    pub fn pump(&mut self) {
        let mut pending = Vec::new();
        self.events.drain(|envelope| pending.push(envelope));
        for envelope in pending {
            self.handle_envelope(envelope);
        }
        self.player.pump();
    }

    fn handle_envelope(&mut self, envelope: Envelope) {
        let Envelope { message, planes } = envelope;
        match message {
            Message::StartedRecording(format) => {
                // Only meaningful while we wait in starting; a repeat
                // announcement mid-play changes nothing.
                if self.player.state() == LifecycleState::Starting {
                    info!(format = %format, "server is recording");
                    self.rate.reset(Instant::now());
                    self.player.complete_start(format);
                }
            }
            Message::Image(header) => {
                if self.player.state() != LifecycleState::Active {
                    return;
                }
                // The decoder already validated the plane boundaries
                // against the header.
                let frame = camlink_core::Frame {
                    pix_fmt: header.pix_fmt,
                    width: header.width,
                    height: header.height,
                    linesizes: header.linesizes,
                    planes,
                };
                if let Some(rate) = self.rate.tick(Instant::now()) {
                    self.player.note_observed_rate(rate);
                }
                self.player.process_frame(frame, header.meta);
            }
            Message::StoppedRecording => {
                debug!("server stopped recording");
                self.stop(false);
            }
            Message::StoppedPlaying => {
                // The server's ack to our stop request.
                if self.player.state() != LifecycleState::Idle {
                    self.player.complete_stop();
                }
            }
            Message::Exception(e) => {
                self.errors
                    .report(&anyhow::anyhow!("remote exception: {}", e.message), false);
            }
            Message::ExceptionExit(e) => {
                self.errors.report(
                    &anyhow::anyhow!("connection failed: {}", e.message),
                    false,
                );
                self.stop_all(false);
                if self.player.state() != LifecycleState::Idle {
                    self.player.complete_stop();
                }
            }
            other => warn!(tag = other.tag(), "unexpected message from server"),
        }
    }
}

impl Drop for RemoteClient {
    fn drop(&mut self) {
        if let Some(conn) = &self.conn {
            let _ = conn.tx.send(ClientCommand::Eof);
        }
    }
}

fn connection_loop(
    host: &str,
    port: u16,
    poll: Duration,
    rx: &flume::Receiver<ClientCommand>,
    events: &MailboxSender<Envelope>,
) -> Result<(), WireError> {
    info!(host, port, "connecting to remote recorder");
    let mut stream = TcpStream::connect((host, port))?;
    stream.set_read_timeout(Some(poll))?;
    let mut decoder = Decoder::new();
    loop {
        for envelope in read_available(&mut stream, &mut decoder)? {
            events.post(envelope);
        }
        for command in rx.try_iter() {
            match command {
                ClientCommand::Eof => {
                    info!("closing connection");
                    return Ok(());
                }
                ClientCommand::Send(message) => {
                    send_envelope(&mut stream, &Envelope::control(message))?;
                }
            }
        }
    }
}
