//! Loopback integration of the full remote streaming handshake: a real
//! player feeding a server over TCP to a client, in both orderings
//! (record-then-play and play-then-record).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use camlink_core::testing::{wait_for_state, CapturingErrorSink, TestSource};
use camlink_core::{LifecycleState, Player, VideoFormat};
use camlink_remote::client::{RemoteClient, RemoteClientConfig};
use camlink_remote::server::{RemoteServer, RemoteServerConfig};

const TIMEOUT: Duration = Duration::from_secs(10);

fn source_format() -> VideoFormat {
    VideoFormat::new("yuv420p", 64, 48, 30.0)
}

fn playing_player() -> Player {
    let source = TestSource::new(source_format())
        .frames(100_000)
        .frame_interval(Duration::from_millis(5));
    let mut player = Player::new(Arc::new(source));
    player.play().unwrap();
    wait_for_state(&mut player, LifecycleState::Active);
    player
}

fn server_on_free_port(errors: Arc<CapturingErrorSink>) -> RemoteServer {
    let config = RemoteServerConfig {
        port: 0,
        ..RemoteServerConfig::default()
    };
    RemoteServer::with_error_sink(config, errors)
}

fn client_for(server: &RemoteServer, errors: Arc<CapturingErrorSink>) -> RemoteClient {
    let addr = server.local_addr().expect("server must be listening");
    let config = RemoteClientConfig {
        host: addr.ip().to_string(),
        port: addr.port(),
        ..RemoteClientConfig::default()
    };
    RemoteClient::with_error_sink(config, errors)
}

/// Pump both ends until `condition` holds.
fn pump_until(
    server: &mut RemoteServer,
    client: &mut RemoteClient,
    mut condition: impl FnMut(&RemoteServer, &RemoteClient) -> bool,
) {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        server.pump();
        client.pump();
        if condition(server, client) {
            return;
        }
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn record_first_then_play_streams_frames() {
    let errors = CapturingErrorSink::new();
    let mut player = playing_player();
    let mut server = server_on_free_port(errors.clone());

    server.record(&mut player).unwrap();
    assert_eq!(server.state(), LifecycleState::Active);
    assert_eq!(*server.format_in_use(), source_format());

    let mut client = client_for(&server, errors.clone());
    let received = Arc::new(AtomicU64::new(0));
    let counter = received.clone();
    client.player_mut().add_frame_callback(move |frame, meta| {
        assert_eq!(frame.pix_fmt, "yuv420p");
        assert!(meta.count.is_some());
        counter.fetch_add(1, Ordering::SeqCst);
    });

    client.play().unwrap();
    pump_until(&mut server, &mut client, |_, c| {
        c.state() == LifecycleState::Active
    });
    assert_eq!(*client.player().format_in_use(), source_format());

    pump_until(&mut server, &mut client, |_, _| {
        received.load(Ordering::SeqCst) >= 5
    });
    server.pump();
    assert!(server.stats().frames_recorded >= 5);
    assert!(server.stats().bytes_recorded > 0);

    // Client-initiated stop: the server acks and the client returns to
    // idle.
    assert!(client.stop(false));
    pump_until(&mut server, &mut client, |_, c| {
        c.state() == LifecycleState::Idle
    });

    client.stop_all(true);
    server.stop_server(true);
    player.stop(true);
    assert!(errors.reports().is_empty(), "{:?}", errors.reports());
}

#[test]
fn play_first_is_deferred_until_recording_starts() {
    let errors = CapturingErrorSink::new();
    let mut player = playing_player();
    let mut server = server_on_free_port(errors.clone());

    // Listener up, but nothing recording yet.
    server.start_server().unwrap();
    let mut client = client_for(&server, errors.clone());
    let received = Arc::new(AtomicU64::new(0));
    let counter = received.clone();
    client.player_mut().add_frame_callback(move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    client.play().unwrap();
    // The request is deferred: the client stays in starting.
    thread::sleep(Duration::from_millis(50));
    client.pump();
    assert_eq!(client.state(), LifecycleState::Starting);

    // Recording starts; the deferred client is promoted.
    server.record(&mut player).unwrap();
    pump_until(&mut server, &mut client, |_, c| {
        c.state() == LifecycleState::Active
    });
    pump_until(&mut server, &mut client, |_, _| {
        received.load(Ordering::SeqCst) >= 3
    });

    // Server-initiated stop: the client is told and winds down through
    // the stopped_playing ack.
    server.stop(false);
    pump_until(&mut server, &mut client, |_, c| {
        c.state() == LifecycleState::Idle
    });

    client.stop_all(true);
    server.stop_server(true);
    player.stop(true);
    assert!(errors.reports().is_empty(), "{:?}", errors.reports());
}

#[test]
fn frames_without_a_watching_client_are_skipped() {
    let errors = CapturingErrorSink::new();
    let mut player = playing_player();
    let mut server = server_on_free_port(errors.clone());

    server.record(&mut player).unwrap();
    let deadline = Instant::now() + TIMEOUT;
    while server.stats().frames_skipped < 5 {
        server.pump();
        assert!(Instant::now() < deadline, "frames never counted as skipped");
        thread::sleep(Duration::from_millis(2));
    }
    // Nothing was transmitted to anyone.
    assert_eq!(server.stats().frames_recorded, 0);
    assert_eq!(server.stats().bytes_recorded, 0);

    server.stop_server(true);
    player.stop(true);
    assert!(errors.reports().is_empty(), "{:?}", errors.reports());
}

#[test]
fn duplicate_started_playing_gets_an_exception() {
    let errors = CapturingErrorSink::new();
    let client_errors = CapturingErrorSink::new();
    let mut player = playing_player();
    let mut server = server_on_free_port(errors.clone());

    server.record(&mut player).unwrap();
    let mut client = client_for(&server, client_errors.clone());
    client.play().unwrap();
    pump_until(&mut server, &mut client, |_, c| {
        c.state() == LifecycleState::Active
    });

    // A second started_playing without an intervening stopped_playing is
    // a protocol violation; the server answers with an exception envelope
    // and keeps serving.
    client.player_mut().complete_stop();
    client.play().unwrap();
    pump_until(&mut server, &mut client, |_, _| {
        !client_errors.reports().is_empty()
    });
    assert!(client_errors.reports()[0].contains("already notified"));

    client.stop_all(true);
    server.stop_server(true);
    player.stop(true);
}
