//! Synthetic IQ producer addon: stands in for a SoapySDR-backed capture
//! loop without a hardware dependency. It synthesizes a constant complex
//! tone at a fixed sample rate, pushes it into a `sdrbus-protocol` ring,
//! and republishes the ring's fd on `soapy.IQ-info` at startup and every
//! five seconds so a late-joining subscriber can still pick it up.

use std::f32::consts::TAU;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde_json::json;
use tracing::{info, warn};

use sdrbus_addon_sdk::abi::PluginCtx;
use sdrbus_addon_sdk::ControlClient;
use sdrbus_protocol::ring::{IqFormat, RingSpec};
use sdrbus_protocol::{RingProducer, SharedRegion};

const FEED_CFG_IN: &str = "soapy.config.in";
const FEED_CFG_OUT: &str = "soapy.config.out";
const FEED_IQ_INFO: &str = "soapy.IQ-info";

const SAMPLE_RATE: f64 = 2_400_000.0;
const CENTER_FREQ: f64 = 100e6;
const TONE_HZ: f32 = 1_000.0;
const RING_CAPACITY: u32 = 8 << 20; // 8 MiB

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
    let client = match ControlClient::connect(&sock_path) {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "soapy-iq: failed to connect to broker");
            return;
        }
    };
    let _ = client.create_feed(FEED_CFG_OUT);
    let _ = client.create_feed(FEED_IQ_INFO);
    let _ = client.subscribe(FEED_CFG_IN);

    let spec = RingSpec::iq(RING_CAPACITY, IqFormat::Cf32, 1, SAMPLE_RATE, CENTER_FREQ);
    let (region, info_fd) = match SharedRegion::create("sdrbus-soapy-iq", &spec) {
        Ok(pair) => pair,
        Err(e) => {
            warn!(error = %e, "soapy-iq: failed to allocate IQ ring");
            return;
        }
    };
    let producer = RingProducer::new(region);
    publish_ring_info(&client, &producer, info_fd);

    let mut phase = 0.0f32;
    let phase_step = TAU * TONE_HZ / SAMPLE_RATE as f32;
    let chunk_samples = 4096usize;
    let mut chunk = vec![0u8; chunk_samples * producer.frame_bytes()];
    let mut last_republish = Instant::now();

    info!(sock_path = %sock_path, "soapy-iq producer started");
    while RUN.load(Ordering::SeqCst) {
        for sample in chunk.chunks_exact_mut(8) {
            let i = phase.cos();
            let q = phase.sin();
            sample[0..4].copy_from_slice(&i.to_le_bytes());
            sample[4..8].copy_from_slice(&q.to_le_bytes());
            phase += phase_step;
            if phase > TAU {
                phase -= TAU;
            }
        }
        producer.push(&chunk);

        if last_republish.elapsed() >= Duration::from_secs(5) {
            if let Ok(fd) = producer.region().try_clone_fd() {
                publish_ring_info(&client, &producer, fd);
            }
            last_republish = Instant::now();
        }

        std::thread::sleep(Duration::from_millis(
            (chunk_samples as f64 / SAMPLE_RATE * 1000.0) as u64,
        ));
    }
    info!("soapy-iq producer stopped");
}

fn publish_ring_info(client: &ControlClient, producer: &RingProducer, fd: std::os::fd::RawFd) {
    let region = producer.region();
    let annotation = json!({
        "fmt": region.fmt_raw(),
        "bytes_per_samp": region.bytes_per_samp(),
        "channels": region.channels(),
        "sample_rate": region.sample_rate(),
        "center_freq": region.center_freq(),
        "capacity": region.capacity(),
    });
    if let Err(e) = client.publish_with_fds(FEED_IQ_INFO, &annotation, &[fd]) {
        warn!(error = %e, "soapy-iq: failed to publish IQ-info");
    }
    unsafe { libc::close(fd) };
}

fn copy_c_string(ptr: *const std::ffi::c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    let cstr = unsafe { std::ffi::CStr::from_ptr(ptr) };
    cstr.to_str().ok().map(str::to_owned)
}

sdrbus_addon_sdk::export_plugin! {
    name: "soapy",
    version: "0.1.0",
    consumes: ["soapy.config.in"],
    produces: ["soapy.config.out", "soapy.IQ-info"],
    init: init,
    start: start,
    stop: stop,
}
