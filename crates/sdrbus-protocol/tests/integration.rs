//! Integration tests for the sdrbus-protocol crate.
//!
//! These exercise the frame codec, the JSON probe, and the shared ring
//! together, across module boundaries, the way a broker and an addon
//! would actually use them over a real socket pair.

use std::os::unix::net::UnixStream;
use std::time::Duration;

use sdrbus_protocol::json_probe::{get_string_field, get_type};
use sdrbus_protocol::ring::{IqFormat, RingConsumer, RingProducer, RingSpec, SharedRegion};
use sdrbus_protocol::{send_frame, FrameReader, RecvOutcome};

fn raw_fd(s: &UnixStream) -> std::os::unix::io::RawFd {
    use std::os::unix::io::AsRawFd;
    s.as_raw_fd()
}

#[test]
fn publish_frame_round_trip_and_routing_fields() {
    let (a, b) = UnixStream::pair().unwrap();
    a.set_nonblocking(true).unwrap();
    b.set_nonblocking(true).unwrap();

    let msg = br#"{"type":"publish","feed":"iq.demo","encoding":"json","data":"{}"}"#;
    send_frame(raw_fd(&a), msg, &[]).unwrap();

    let mut reader = FrameReader::new();
    let outcome = reader.recv_frame(raw_fd(&b), Duration::from_millis(500)).unwrap();

    let payload = match outcome {
        RecvOutcome::Frame { payload, .. } => payload,
        _ => panic!("expected a frame"),
    };

    assert_eq!(get_type(&payload).as_deref(), Some("publish"));
    assert_eq!(get_string_field(&payload, "feed").as_deref(), Some("iq.demo"));
}

#[test]
fn back_to_back_frames_are_each_delivered_once() {
    let (a, b) = UnixStream::pair().unwrap();
    a.set_nonblocking(true).unwrap();
    b.set_nonblocking(true).unwrap();

    send_frame(raw_fd(&a), br#"{"type":"ping"}"#, &[]).unwrap();
    send_frame(raw_fd(&a), br#"{"type":"pong"}"#, &[]).unwrap();

    let mut reader = FrameReader::new();
    let first = reader.recv_frame(raw_fd(&b), Duration::from_millis(500)).unwrap();
    let second = reader.recv_frame(raw_fd(&b), Duration::from_millis(500)).unwrap();

    let get_type_of = |o: RecvOutcome| match o {
        RecvOutcome::Frame { payload, .. } => get_type(&payload).map(|s| s.into_owned()),
        _ => None,
    };

    assert_eq!(get_type_of(first).as_deref(), Some("ping"));
    assert_eq!(get_type_of(second).as_deref(), Some("pong"));
}

#[test]
fn ring_carries_samples_across_a_producer_consumer_split() {
    let spec = RingSpec::iq(8192, IqFormat::Cf32, 2, 2_000_000.0, 433_900_000.0);
    let (region, dup_fd) = SharedRegion::create("itest-ring", &spec).unwrap();
    let producer = RingProducer::new(region);

    let consumer_region = SharedRegion::open(dup_fd, 8192).unwrap();
    let consumer = RingConsumer::new(consumer_region);

    assert_eq!(consumer.region().magic(), sdrbus_protocol::MAGIC_IQ);
    assert_eq!(consumer.region().channels(), 2);

    let frame = vec![0u8; producer.frame_bytes() * 4];
    producer.push(&frame);

    let got = consumer.pop(frame.len());
    assert_eq!(got.len(), frame.len());
}
