//! Test-only addon that implements the four ABI symbols by hand instead of
//! through `export_plugin!`, so that `plugin_init` can unconditionally
//! refuse the host's ABI version. Used by the plugin host's test suite to
//! exercise the `AbiMismatch` rejection path, which no real demo addon can
//! reach since they all link against this workspace's SDK and therefore
//! always agree on `PLUGIN_ABI_VERSION`.

use std::ffi::c_char;

use sdrbus_addon_sdk::abi::{PluginCaps, PluginCtx};

static NAME: &str = "abi-mismatch-fixture\0";

#[no_mangle]
pub extern "C" fn plugin_name() -> *const c_char {
    NAME.as_ptr() as *const c_char
}

/// Always rejects, simulating an addon built against an ABI version the
/// host does not support. Never touches `out_caps`.
#[no_mangle]
pub unsafe extern "C" fn plugin_init(_ctx: *const PluginCtx, _out_caps: *mut PluginCaps) -> bool {
    false
}

#[no_mangle]
pub extern "C" fn plugin_start() -> bool {
    false
}

#[no_mangle]
pub extern "C" fn plugin_stop() {}
