//! SIGINT handling for the event loop's shutdown path.
//!
//! A signal handler may only touch async-signal-safe state, so it does
//! nothing but flip a process-wide atomic flag that the event loop polls
//! once per tick. There is no async runtime here to hand a cancellation
//! future to, which is exactly why the broker loop stays a raw `poll()`
//! state machine instead of a `tokio::select!` (see DESIGN.md).

use std::sync::atomic::{AtomicBool, Ordering};

static SIGINT_RECEIVED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_sig: libc::c_int) {
    SIGINT_RECEIVED.store(true, Ordering::SeqCst);
}

/// Install the SIGINT handler. Safe to call once at process startup.
pub fn install() {
    unsafe {
        libc::signal(libc::SIGINT, on_sigint as libc::sighandler_t);
    }
}

pub fn received() -> bool {
    SIGINT_RECEIVED.load(Ordering::SeqCst)
}
