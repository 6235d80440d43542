//! The stable C ABI an addon exports and the host loads via `libloading`.
//!
//! Four exported `extern "C"` symbols (`plugin_name`, `plugin_init`,
//! `plugin_start`, `plugin_stop`), a context struct the host hands in at
//! init time, and a capabilities struct the addon fills in return. ABI
//! version 1 is the only version this host or SDK understands; a mismatch
//! is refused before `plugin_init` is ever called.

use std::ffi::{c_char, c_void};

pub const PLUGIN_ABI_VERSION: u32 = 1;

/// Context handed to an addon's `plugin_init`. `sock_path` and `name` are
/// borrowed, null-terminated C strings valid only for the duration of the
/// call; an addon that needs them afterward must copy them.
#[repr(C)]
pub struct PluginCtx {
    pub abi: u32,
    pub sock_path: *const c_char,
    pub name: *const c_char,
}

/// Capabilities an addon reports back through `plugin_init`'s `out_caps`
/// parameter. `consumes` and `produces` are null-terminated arrays of
/// null-terminated C strings, each terminated by a null pointer entry.
#[repr(C)]
pub struct PluginCaps {
    pub name: *const c_char,
    pub version: *const c_char,
    pub consumes: *const *const c_char,
    pub produces: *const *const c_char,
}

impl Default for PluginCaps {
    fn default() -> Self {
        Self {
            name: std::ptr::null(),
            version: std::ptr::null(),
            consumes: std::ptr::null(),
            produces: std::ptr::null(),
        }
    }
}

pub type PluginNameFn = unsafe extern "C" fn() -> *const c_char;
pub type PluginInitFn = unsafe extern "C" fn(*const PluginCtx, *mut PluginCaps) -> bool;
pub type PluginStartFn = unsafe extern "C" fn() -> bool;
pub type PluginStopFn = unsafe extern "C" fn();

pub const SYM_PLUGIN_NAME: &[u8] = b"plugin_name";
pub const SYM_PLUGIN_INIT: &[u8] = b"plugin_init";
pub const SYM_PLUGIN_START: &[u8] = b"plugin_start";
pub const SYM_PLUGIN_STOP: &[u8] = b"plugin_stop";

/// Declares the four required ABI entry points on top of a type
/// implementing the simple start/stop lifecycle most addons need.
///
/// Usage inside an addon crate:
/// ```ignore
/// sdrbus_addon_sdk::export_plugin! {
///     name: "wfmd",
///     version: "0.1.0",
///     consumes: ["iq"],
///     produces: ["audio"],
///     init: my_init_fn,
///     start: my_start_fn,
///     stop: my_stop_fn,
/// }
/// ```
#[macro_export]
macro_rules! export_plugin {
    (
        name: $name:expr,
        version: $version:expr,
        consumes: [$($consumes:expr),* $(,)?],
        produces: [$($produces:expr),* $(,)?],
        init: $init_fn:path,
        start: $start_fn:path,
        stop: $stop_fn:path,
    ) => {
        #[no_mangle]
        pub extern "C" fn plugin_name() -> *const std::ffi::c_char {
            static NAME: &str = concat!($name, "\0");
            NAME.as_ptr() as *const std::ffi::c_char
        }

        #[no_mangle]
        pub unsafe extern "C" fn plugin_init(
            ctx: *const $crate::abi::PluginCtx,
            out_caps: *mut $crate::abi::PluginCaps,
        ) -> bool {
            static PLUGIN_NAME: &str = concat!($name, "\0");
            static PLUGIN_VERSION: &str = concat!($version, "\0");
            static CONSUMES: &[*const std::ffi::c_char] =
                &[$(concat!($consumes, "\0").as_ptr() as *const std::ffi::c_char,)* std::ptr::null()];
            static PRODUCES: &[*const std::ffi::c_char] =
                &[$(concat!($produces, "\0").as_ptr() as *const std::ffi::c_char,)* std::ptr::null()];

            if ctx.is_null() || out_caps.is_null() {
                return false;
            }
            if (*ctx).abi != $crate::abi::PLUGIN_ABI_VERSION {
                return false;
            }

            (*out_caps).name = PLUGIN_NAME.as_ptr() as *const std::ffi::c_char;
            (*out_caps).version = PLUGIN_VERSION.as_ptr() as *const std::ffi::c_char;
            (*out_caps).consumes = CONSUMES.as_ptr();
            (*out_caps).produces = PRODUCES.as_ptr();

            $init_fn(&*ctx)
        }

        #[no_mangle]
        pub extern "C" fn plugin_start() -> bool {
            $start_fn()
        }

        #[no_mangle]
        pub extern "C" fn plugin_stop() {
            $stop_fn()
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abi_version_matches_documented_value() {
        assert_eq!(PLUGIN_ABI_VERSION, 1);
    }

    #[test]
    fn default_caps_are_all_null() {
        let caps = PluginCaps::default();
        assert!(caps.name.is_null());
        assert!(caps.consumes.is_null());
    }
}
