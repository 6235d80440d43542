//! Audio consumer addon: attaches to `wfmd.audio-info`, pops frames from
//! the mapped ring and tracks a running RMS level, publishing it on
//! `audiosink.level` in place of real ALSA playback (out of scope for this
//! workspace). Picks up the ring fd with a probe-then-remap pattern, since
//! its capacity isn't known until the header is read.

use std::os::fd::{IntoRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{info, warn};

use sdrbus_addon_sdk::abi::PluginCtx;
use sdrbus_addon_sdk::ControlClient;
use sdrbus_protocol::{RingConsumer, SharedRegion};

const FEED_AUDIO_INFO: &str = "wfmd.audio-info";
const FEED_LEVEL: &str = "audiosink.level";
const FEED_CFG_IN: &str = "audiosink.config.in";
const FEED_CFG_OUT: &str = "audiosink.config.out";

/// A fixed-size window used to read the header before the real capacity is
/// known; 64 KiB covers the 136-byte header with room to spare and is
/// never mistaken for a capacity value.
const PROBE_LEN: usize = 65536;

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
            warn!(error = %e, "audiosink: failed to connect to broker");
            return;
        }
    };
    let _ = client.create_feed(FEED_CFG_OUT);
    let _ = client.create_feed(FEED_LEVEL);
    let _ = client.subscribe(FEED_CFG_IN);
    let _ = client.subscribe(FEED_AUDIO_INFO);

    let mut consumer: Option<RingConsumer> = None;
    let mut rms_acc = 0.0f64;
    let mut rms_count = 0u64;
    let mut last_report = std::time::Instant::now();

    info!(sock_path = %sock_path, "audiosink consumer started");
    while RUN.load(Ordering::SeqCst) {
        match client.recv_reply_with_fds(Duration::from_millis(50)) {
            Ok((msg, fds)) => handle_message(&msg, fds, &mut consumer),
            Err(sdrbus_addon_sdk::AddonError::Protocol(sdrbus_protocol::BrokerError::TimedOut)) => {}
            Err(e) => {
                warn!(error = %e, "audiosink: control read error");
                break;
            }
        }

        if let Some(cons) = &consumer {
            let frame_bytes = cons.region().bytes_per_samp() as usize * cons.region().channels() as usize;
            if frame_bytes > 0 {
                let bytes = cons.pop(frame_bytes * 4096);
                for sample in bytes.chunks_exact(frame_bytes) {
                    let v = f32::from_le_bytes(sample[0..4].try_into().unwrap()) as f64;
                    rms_acc += v * v;
                    rms_count += 1;
                }
            }
        }

        if last_report.elapsed() >= Duration::from_millis(500) && rms_count > 0 {
            let rms = (rms_acc / rms_count as f64).sqrt();
            let _ = client.publish(FEED_LEVEL, &serde_json::json!({ "rms": rms, "samples": rms_count }));
            rms_acc = 0.0;
            rms_count = 0;
            last_report = std::time::Instant::now();
        }
    }
    info!("audiosink consumer stopped");
}

fn handle_message(msg: &serde_json::Value, fds: Vec<OwnedFd>, consumer: &mut Option<RingConsumer>) {
    if msg.get("type").and_then(|v| v.as_str()) != Some("publish") {
        return;
    }
    let Some(feed) = msg.get("feed").and_then(|v| v.as_str()) else { return };
    if feed != FEED_AUDIO_INFO || fds.is_empty() {
        return;
    }
    let fd: RawFd = fds.into_iter().next().unwrap().into_raw_fd();
    // `probe_then_map` takes ownership of `fd` unconditionally (every
    // branch either closes it directly or hands it to `SharedRegion::open`,
    // which closes it on failure too), so it must not be closed again here.
    match probe_then_map(fd) {
        Ok(region) => {
            info!(capacity = region.capacity(), "audiosink: mapped audio ring");
            *consumer = Some(RingConsumer::new(region));
        }
        Err(e) => {
            warn!(error = %e, "audiosink: failed to map audio ring");
        }
    }
}

/// Probe the ring's header through a fixed-size window first (the true
/// capacity isn't known until the header is read), then remap the full
/// region at its real size.
fn probe_then_map(fd: RawFd) -> sdrbus_protocol::Result<SharedRegion> {
    // `SharedRegion::open` takes ownership of the fd it's given and closes
    // it on drop, so the fd used for the final full-size mapping must be a
    // separate duplicate taken before the probe region consumes `fd`.
    let full_dup = unsafe { libc::dup(fd) };
    if full_dup < 0 {
        unsafe { libc::close(fd) };
        return Err(sdrbus_protocol::BrokerError::IoError(std::io::Error::last_os_error()));
    }
    let probe = match SharedRegion::open(fd, PROBE_LEN - sdrbus_protocol::ring::HEADER_LEN) {
        Ok(r) => r,
        Err(e) => {
            unsafe { libc::close(full_dup) };
            return Err(e);
        }
    };
    let magic = probe.magic();
    let capacity = probe.capacity() as usize;
    drop(probe);
    if magic != sdrbus_protocol::MAGIC_AUDIO {
        unsafe { libc::close(full_dup) };
        return Err(sdrbus_protocol::BrokerError::BadMagic { expected: sdrbus_protocol::MAGIC_AUDIO, got: magic });
    }
    SharedRegion::open(full_dup, capacity)
}

fn copy_c_string(ptr: *const std::ffi::c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    let cstr = unsafe { std::ffi::CStr::from_ptr(ptr) };
    cstr.to_str().ok().map(str::to_owned)
}

sdrbus_addon_sdk::export_plugin! {
    name: "audiosink",
    version: "0.1.0",
    consumes: ["wfmd.audio-info", "audiosink.config.in"],
    produces: ["audiosink.config.out", "audiosink.level"],
    init: init,
    start: start,
    stop: stop,
}
