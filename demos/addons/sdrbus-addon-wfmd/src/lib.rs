//! IQ-to-audio transformer addon: attaches to `soapy.IQ-info`, drains the
//! IQ ring it maps, and republishes a derived audio stream on
//! `wfmd.audio-info`. A real FIR-decimator FM discriminator is out of
//! scope here; this keeps the shape of a well-behaved IQ consumer / audio
//! producer by computing each IQ sample's instantaneous magnitude (a cheap
//! envelope detector) and emitting that as the audio stream, downsampled
//! by a fixed ratio.

use std::os::fd::{IntoRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{info, warn};

use sdrbus_addon_sdk::abi::PluginCtx;
use sdrbus_addon_sdk::ControlClient;
use sdrbus_protocol::ring::AudioFormat;
use sdrbus_protocol::{RingConsumer, RingProducer, RingSpec, SharedRegion};

const FEED_IQ_INFO: &str = "soapy.IQ-info";
const FEED_AUDIO_INFO: &str = "wfmd.audio-info";
const FEED_CFG_IN: &str = "wfmd.config.in";
const FEED_CFG_OUT: &str = "wfmd.config.out";

const AUDIO_SAMPLE_RATE: f64 = 48_000.0;
const AUDIO_CAPACITY: u32 = (AUDIO_SAMPLE_RATE as u32) * 4 * 2; // ~2s of f32 mono

static RUN: AtomicBool = AtomicBool::new(false);
static SOCK_PATH: OnceLock<Mutex<String>> = OnceLock::new();
static WORKER: Mutex<Option<JoinHandle<()>>> = Mutex::new(None);

fn sock_path() -> String {
    SOCK_PATH.get().map(|m| m.lock().unwrap().clone()).unwrap_or_default()
}

fn init(ctx: &PluginCtx) -> bool {
    let Some(path) = copy_c_string(ctx.sock_path) else { return false };
    let cell = SOCK_PATH.get_or_init(|| Mutex::new(String::new()));
    *cell.lock().unwrap() = path;
    true
}

fn start() -> bool {
    let path = sock_path();
    if path.is_empty() {
        return false;
    }
    RUN.store(true, Ordering::SeqCst);
    let handle = std::thread::spawn(move || run(path));
    *WORKER.lock().unwrap() = Some(handle);
    true
}

fn stop() {
    RUN.store(false, Ordering::SeqCst);
    if let Some(handle) = WORKER.lock().unwrap().take() {
        let _ = handle.join();
    }
}

fn run(sock_path: String) {
    let mut client = match ControlClient::connect(&sock_path) {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "wfmd: failed to connect to broker");
            return;
        }
    };
    let _ = client.create_feed(FEED_CFG_OUT);
    let _ = client.create_feed(FEED_AUDIO_INFO);
    let _ = client.subscribe(FEED_CFG_IN);
    let _ = client.subscribe(FEED_IQ_INFO);

    let spec = RingSpec::audio(AUDIO_CAPACITY, AudioFormat::F32, 1, AUDIO_SAMPLE_RATE);
    let (audio_region, audio_fd) = match SharedRegion::create("sdrbus-wfmd-audio", &spec) {
        Ok(pair) => pair,
        Err(e) => {
            warn!(error = %e, "wfmd: failed to allocate audio ring");
            return;
        }
    };
    let producer = RingProducer::new(audio_region);
    if let Err(e) = client.publish_with_fds(FEED_AUDIO_INFO, &serde_json::json!({"info": true}), &[audio_fd]) {
        warn!(error = %e, "wfmd: failed to publish audio-info");
    }
    unsafe { libc::close(audio_fd) };

    let mut consumer: Option<RingConsumer> = None;
    // Every 10th IQ complex sample becomes one audio sample (demo decimation).
    const DECIMATION: usize = 10;
    let mut skip = 0usize;

    info!(sock_path = %sock_path, "wfmd transformer started");
    while RUN.load(Ordering::SeqCst) {
        match client.recv_reply_with_fds(Duration::from_millis(50)) {
            Ok((msg, fds)) => handle_message(&msg, fds, &mut consumer),
            Err(sdrbus_addon_sdk::AddonError::Protocol(sdrbus_protocol::BrokerError::TimedOut)) => {}
            Err(e) => {
                warn!(error = %e, "wfmd: control read error");
                break;
            }
        }

        let Some(cons) = &consumer else { continue };
        let frame_bytes = cons.region().bytes_per_samp() as usize * cons.region().channels() as usize;
        if frame_bytes == 0 {
            continue;
        }
        let bytes = cons.pop(frame_bytes * 2048);
        if bytes.is_empty() {
            continue;
        }
        let mut audio = Vec::with_capacity(bytes.len() / frame_bytes / DECIMATION + 1);
        for sample in bytes.chunks_exact(frame_bytes) {
            skip += 1;
            if skip % DECIMATION != 0 {
                continue;
            }
            let i = f32::from_le_bytes(sample[0..4].try_into().unwrap());
            let q = f32::from_le_bytes(sample[4..8].try_into().unwrap());
            audio.push((i * i + q * q).sqrt());
        }
        if !audio.is_empty() {
            let mut raw = Vec::with_capacity(audio.len() * 4);
            for s in &audio {
                raw.extend_from_slice(&s.to_le_bytes());
            }
            producer.push(&raw);
        }
    }
    info!("wfmd transformer stopped");
}

fn handle_message(msg: &serde_json::Value, fds: Vec<OwnedFd>, consumer: &mut Option<RingConsumer>) {
    if msg.get("type").and_then(|v| v.as_str()) != Some("publish") {
        return;
    }
    let Some(feed) = msg.get("feed").and_then(|v| v.as_str()) else { return };
    if feed != FEED_IQ_INFO || fds.is_empty() {
        return;
    }
    let Some(data) = msg.get("data") else { return };
    let Some(capacity) = data.get("capacity").and_then(|v| v.as_u64()) else {
        warn!("wfmd: IQ-info publish missing capacity annotation");
        return;
    };
    let fd: RawFd = fds.into_iter().next().unwrap().into_raw_fd();
    // `open_checked` takes ownership of `fd` unconditionally: on the `Err`
    // arm it has already been unmapped and closed, so it must not be
    // closed again here.
    match SharedRegion::open_checked(fd, capacity as usize, sdrbus_protocol::MAGIC_IQ) {
        Ok(region) => {
            info!(capacity, "wfmd: mapped IQ ring");
            *consumer = Some(RingConsumer::new(region));
        }
        Err(e) => {
            warn!(error = %e, "wfmd: failed to map IQ ring");
        }
    }
}

fn copy_c_string(ptr: *const std::ffi::c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    let cstr = unsafe { std::ffi::CStr::from_ptr(ptr) };
    cstr.to_str().ok().map(str::to_owned)
}

sdrbus_addon_sdk::export_plugin! {
    name: "wfmd",
    version: "0.1.0",
    consumes: ["soapy.IQ-info", "wfmd.config.in"],
    produces: ["wfmd.config.out", "wfmd.audio-info"],
    init: init,
    start: start,
    stop: stop,
}
