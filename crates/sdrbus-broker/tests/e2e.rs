//! End-to-end scenarios against a real broker: a socket bound under a
//! `tempfile`-scoped directory, a real event loop running on a background
//! thread, and plain `UnixStream` clients exercising it exactly as an
//! addon or the CLI would.

use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use sdrbus_broker::{config::BrokerConfig, event_loop, Broker};
use sdrbus_protocol::{send_frame, FrameReader, RecvOutcome};

fn spawn_broker() -> (String, std::thread::JoinHandle<()>) {
    let dir = tempfile::tempdir().unwrap();
    let sock = dir.path().join("broker.sock").to_string_lossy().into_owned();

    let cfg = BrokerConfig::from_str(&format!(
        r#"
        [broker]
        socket_path = "{sock}"
        [addons]
        roots = []
        autoload = false
        [timing]
        poll_interval_ms = 20
        frame_read_budget_ms = 10
        "#
    ))
    .unwrap();

    let broker = Broker::new(cfg);
    let listener = event_loop::bind(broker.socket_path()).unwrap();

    // Keep `dir` alive for the lifetime of the broker thread by leaking it;
    // the OS cleans up /tmp eventually and the test process is short-lived.
    std::mem::forget(dir);

    let handle = std::thread::spawn(move || {
        event_loop::run(&broker, listener).unwrap();
    });

    // Give the listener a moment to come up before the first connect.
    std::thread::sleep(Duration::from_millis(50));
    (sock, handle)
}

fn connect(sock: &str) -> UnixStream {
    for _ in 0..20 {
        if let Ok(s) = UnixStream::connect(sock) {
            s.set_nonblocking(true).unwrap();
            return s;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    panic!("could not connect to {sock}");
}

fn recv(stream: &UnixStream, timeout: Duration) -> RecvOutcome {
    let mut reader = FrameReader::new();
    reader.recv_frame(stream.as_raw_fd(), timeout).unwrap()
}

fn shutdown(sock: &str) {
    let client = connect(sock);
    let msg = br#"{"type":"command","feed":"cli-control","data":"exit"}"#;
    send_frame(client.as_raw_fd(), msg, &[]).ok();
}

#[test]
fn ping_gets_a_pong() {
    let (sock, handle) = spawn_broker();
    let client = connect(&sock);

    send_frame(client.as_raw_fd(), br#"{"type":"ping"}"#, &[]).unwrap();
    match recv(&client, Duration::from_secs(1)) {
        RecvOutcome::Frame { payload, .. } => assert_eq!(&payload, br#"{"type":"pong"}"#),
        other => panic!("expected pong, got a different outcome: {}", matches!(other, RecvOutcome::Timeout)),
    }

    shutdown(&sock);
    handle.join().unwrap();
}

#[test]
fn create_subscribe_publish_round_trip() {
    let (sock, handle) = spawn_broker();
    let publisher = connect(&sock);
    let subscriber = connect(&sock);

    send_frame(publisher.as_raw_fd(), br#"{"type":"create_feed","feed":"demo.feed"}"#, &[]).unwrap();
    send_frame(subscriber.as_raw_fd(), br#"{"type":"subscribe","feed":"demo.feed"}"#, &[]).unwrap();
    std::thread::sleep(Duration::from_millis(100));

    let publish = br#"{"type":"publish","feed":"demo.feed","data":"hi","encoding":"utf8"}"#;
    send_frame(publisher.as_raw_fd(), publish, &[]).unwrap();

    match recv(&subscriber, Duration::from_secs(1)) {
        RecvOutcome::Frame { payload, .. } => assert_eq!(&payload, publish),
        _ => panic!("subscriber never received the publish"),
    }

    shutdown(&sock);
    handle.join().unwrap();
}

#[test]
fn fd_handoff_reaches_the_subscriber() {
    let (sock, handle) = spawn_broker();
    let producer = connect(&sock);
    let subscriber = connect(&sock);

    send_frame(producer.as_raw_fd(), br#"{"type":"create_feed","feed":"ring.info"}"#, &[]).unwrap();
    send_frame(subscriber.as_raw_fd(), br#"{"type":"subscribe","feed":"ring.info"}"#, &[]).unwrap();
    std::thread::sleep(Duration::from_millis(100));

    let (region, dup_fd) = sdrbus_protocol::ring::SharedRegion::create(
        "e2e-ring",
        &sdrbus_protocol::RingSpec::audio(4096, sdrbus_protocol::ring::AudioFormat::F32, 1, 48_000.0),
    )
    .unwrap();
    let publish = br#"{"type":"publish","feed":"ring.info","data":"info","encoding":"utf8"}"#;
    send_frame(producer.as_raw_fd(), publish, &[dup_fd]).unwrap();
    unsafe { libc::close(dup_fd) };
    drop(region);

    let mut reader = FrameReader::new();
    match reader.recv_frame(subscriber.as_raw_fd(), Duration::from_secs(1)).unwrap() {
        RecvOutcome::Frame { payload, fds } => {
            assert_eq!(&payload, publish);
            assert_eq!(fds.len(), 1);
        }
        _ => panic!("subscriber never received the fd-bearing publish"),
    }

    shutdown(&sock);
    handle.join().unwrap();
}

#[test]
fn cli_control_feeds_lists_created_feeds() {
    let (sock, handle) = spawn_broker();
    let client = connect(&sock);

    send_frame(client.as_raw_fd(), br#"{"type":"create_feed","feed":"alpha"}"#, &[]).unwrap();
    std::thread::sleep(Duration::from_millis(50));

    let cmd = br#"{"type":"command","feed":"cli-control","data":"feeds"}"#;
    send_frame(client.as_raw_fd(), cmd, &[]).unwrap();

    let mut saw_alpha = false;
    let mut saw_cli_control = false;
    for _ in 0..10 {
        match recv(&client, Duration::from_millis(500)) {
            RecvOutcome::Frame { payload, .. } => {
                let text = String::from_utf8_lossy(&payload);
                if text.contains("\"feed\":\"alpha\"") {
                    saw_alpha = true;
                }
                if text.contains("\"feed\":\"cli-control\"") {
                    saw_cli_control = true;
                }
            }
            RecvOutcome::Timeout => break,
            RecvOutcome::Eof => break,
        }
    }
    assert!(saw_alpha, "expected the cli-control feeds listing to include the newly created feed");
    assert!(saw_cli_control, "expected the always-present cli-control feed in the listing");

    shutdown(&sock);
    handle.join().unwrap();
}

#[test]
fn subscriber_disconnect_mid_session_does_not_crash_broadcast() {
    let (sock, handle) = spawn_broker();
    let publisher = connect(&sock);
    let doomed = connect(&sock);

    send_frame(doomed.as_raw_fd(), br#"{"type":"subscribe","feed":"vol"}"#, &[]).unwrap();
    std::thread::sleep(Duration::from_millis(50));
    drop(doomed);
    std::thread::sleep(Duration::from_millis(100));

    let publish = br#"{"type":"publish","feed":"vol","data":"1","encoding":"utf8"}"#;
    send_frame(publisher.as_raw_fd(), publish, &[]).unwrap();
    std::thread::sleep(Duration::from_millis(50));

    // The broker must still be alive and answering after the dead
    // subscriber is reaped.
    send_frame(publisher.as_raw_fd(), br#"{"type":"ping"}"#, &[]).unwrap();
    match recv(&publisher, Duration::from_secs(1)) {
        RecvOutcome::Frame { payload, .. } => assert_eq!(&payload, br#"{"type":"pong"}"#),
        _ => panic!("broker stopped answering after a subscriber disconnect"),
    }

    shutdown(&sock);
    handle.join().unwrap();
}

#[test]
fn exit_command_shuts_the_broker_down() {
    let (sock, handle) = spawn_broker();
    shutdown(&sock);
    handle.join().unwrap();
}
