//! Addon discovery, dynamic loading, the init/start/stop lifecycle, and
//! the fleet table. `dlopen`/`dlsym` is wrapped via `libloading`:
//! `Library::new`, resolve each required symbol, treat a missing one as a
//! hard load failure.

use std::ffi::{CStr, CString};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use libloading::Library;
use tracing::{error, info, warn};

use sdrbus_addon_sdk::abi::{
    PluginCaps, PluginCtx, PluginInitFn, PluginNameFn, PluginStartFn, PluginStopFn,
    PLUGIN_ABI_VERSION, SYM_PLUGIN_INIT, SYM_PLUGIN_NAME, SYM_PLUGIN_START, SYM_PLUGIN_STOP,
};
use sdrbus_protocol::{BrokerError, Result};

/// A plugin that has completed `init` and `start` successfully. Per the
/// data model invariant, a `PluginRecord` exists in the `PluginTable` iff
/// its `start` returned `true` and `stop` has not yet been called.
pub struct PluginRecord {
    pub name: String,
    pub version: String,
    pub consumes: Vec<String>,
    pub produces: Vec<String>,
    pub path: PathBuf,
    library: Library,
}

impl PluginRecord {
    /// Call the addon's `plugin_stop`, which is expected to join its
    /// worker threads before returning. Idempotent on the addon's side;
    /// the host only ever calls it once per record.
    fn stop(&self) {
        unsafe {
            match self.library.get::<PluginStopFn>(SYM_PLUGIN_STOP) {
                Ok(stop) => stop(),
                Err(e) => warn!(plugin = %self.name, error = %e, "plugin_stop symbol vanished"),
            }
        }
    }
}

#[derive(Default)]
pub struct PluginTable {
    plugins: Mutex<Vec<PluginRecord>>,
}

impl PluginTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn names(&self) -> Vec<String> {
        self.plugins.lock().unwrap().iter().map(|p| p.name.clone()).collect()
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.plugins.lock().unwrap().iter().any(|p| p.name == name)
    }

    /// Load, init, and start a plugin from `path`, adding it to the table
    /// on success. Refuses a duplicate name (`AlreadyLoaded`) without
    /// touching the table.
    pub fn load(&self, path: &Path, sock_path: &str) -> Result<String> {
        let record = load_and_start(path, sock_path)?;
        let mut plugins = self.plugins.lock().unwrap();
        if plugins.iter().any(|p| p.name == record.name) {
            record.stop();
            return Err(BrokerError::AlreadyLoaded(record.name));
        }
        let name = record.name.clone();
        plugins.push(record);
        Ok(name)
    }

    /// Autoload every discoverable addon under `roots`, skipping any whose
    /// declared name is already loaded and continuing past individual
    /// failures — mirrors `autoload_addons`'s "log and keep going" policy.
    pub fn autoload(&self, roots: &[String], sock_path: &str) -> usize {
        let mut loaded = 0;
        for path in discover_addons(roots) {
            match load_and_start(&path, sock_path) {
                Ok(record) => {
                    let mut plugins = self.plugins.lock().unwrap();
                    if plugins.iter().any(|p| p.name == record.name) {
                        info!(plugin = %record.name, path = %path.display(), "autoload skip (already loaded)");
                        record.stop();
                        continue;
                    }
                    info!(plugin = %record.name, path = %path.display(), "autoload loaded plugin");
                    plugins.push(record);
                    loaded += 1;
                }
                Err(e) => {
                    error!(path = %path.display(), error = %e, "autoload failed for addon");
                }
            }
        }
        loaded
    }

    /// Stop and unload the named plugin. No-op (returns `NotFound`) if it
    /// isn't loaded.
    pub fn unload(&self, name: &str) -> Result<()> {
        let mut plugins = self.plugins.lock().unwrap();
        let idx = plugins
            .iter()
            .position(|p| p.name == name)
            .ok_or_else(|| BrokerError::NotFound(name.to_string()))?;
        let record = plugins.remove(idx);
        record.stop();
        Ok(())
    }

    /// Stop every loaded plugin, in load order, releasing their
    /// libraries. Called once at broker shutdown.
    pub fn stop_all(&self) {
        let mut plugins = self.plugins.lock().unwrap();
        for record in plugins.drain(..) {
            info!(plugin = %record.name, "stopping plugin");
            record.stop();
        }
    }
}

/// Open `path`, resolve the four required symbols, run the init handshake,
/// and call `start`. On any failure, releases whatever was partially
/// acquired and returns an error — the table is never touched.
fn load_and_start(path: &Path, sock_path: &str) -> Result<PluginRecord> {
    let library = unsafe { Library::new(path) }.map_err(|e| {
        BrokerError::IoError(std::io::Error::other(format!("dlopen {}: {e}", path.display())))
    })?;

    let name_fn = unsafe { library.get::<PluginNameFn>(SYM_PLUGIN_NAME) }
        .map_err(|_| BrokerError::SymbolMissing("plugin_name".into()))?;
    let init_fn = unsafe { library.get::<PluginInitFn>(SYM_PLUGIN_INIT) }
        .map_err(|_| BrokerError::SymbolMissing("plugin_init".into()))?;
    let start_fn = unsafe { library.get::<PluginStartFn>(SYM_PLUGIN_START) }
        .map_err(|_| BrokerError::SymbolMissing("plugin_start".into()))?;
    let _stop_fn = unsafe { library.get::<PluginStopFn>(SYM_PLUGIN_STOP) }
        .map_err(|_| BrokerError::SymbolMissing("plugin_stop".into()))?;

    let name = unsafe {
        let raw = name_fn();
        if raw.is_null() {
            return Err(BrokerError::SymbolMissing("plugin_name returned null".into()));
        }
        CStr::from_ptr(raw).to_string_lossy().into_owned()
    };

    let c_sock_path = CString::new(sock_path).unwrap_or_default();
    let c_name = CString::new(name.clone()).unwrap_or_default();
    let ctx = PluginCtx {
        abi: PLUGIN_ABI_VERSION,
        sock_path: c_sock_path.as_ptr(),
        name: c_name.as_ptr(),
    };
    let mut caps = PluginCaps::default();

    let init_ok = unsafe { init_fn(&ctx, &mut caps) };
    if !init_ok {
        // The generated `plugin_init` (see sdrbus-addon-sdk::abi::export_plugin!)
        // only ever returns false on an ABI check failure, so this is the
        // best-effort classification available to the host: the addon does
        // not echo back the ABI it actually wanted.
        return Err(BrokerError::AbiMismatch { host: PLUGIN_ABI_VERSION, plugin: 0 });
    }

    let version = unsafe { c_string_or_default(caps.version, "0.0.0") };
    let consumes = unsafe { c_string_array(caps.consumes) };
    let produces = unsafe { c_string_array(caps.produces) };

    if !unsafe { start_fn() } {
        let stop_fn = unsafe { library.get::<PluginStopFn>(SYM_PLUGIN_STOP) }
            .map_err(|_| BrokerError::SymbolMissing("plugin_stop".into()))?;
        unsafe { stop_fn() };
        return Err(BrokerError::IoError(std::io::Error::other(format!(
            "plugin_start failed for {name}"
        ))));
    }

    Ok(PluginRecord { name, version, consumes, produces, path: path.to_path_buf(), library })
}

unsafe fn c_string_or_default(ptr: *const std::ffi::c_char, default: &str) -> String {
    if ptr.is_null() {
        default.to_string()
    } else {
        CStr::from_ptr(ptr).to_string_lossy().into_owned()
    }
}

/// Walk a null-terminated array of null-terminated C strings into owned
/// `String`s. A null array pointer yields an empty vec.
unsafe fn c_string_array(ptr: *const *const std::ffi::c_char) -> Vec<String> {
    if ptr.is_null() {
        return Vec::new();
    }
    let mut out = Vec::new();
    let mut i = 0isize;
    loop {
        let entry = *ptr.offset(i);
        if entry.is_null() {
            break;
        }
        out.push(CStr::from_ptr(entry).to_string_lossy().into_owned());
        i += 1;
    }
    out
}

/// Walk `roots` in order; within each root, every first-level subdirectory
/// is a candidate (files inside it ending in the platform's dynamic
/// library suffix are returned), and flat files directly under the root
/// ending in the same suffix are also accepted. Mirrors
/// `scan_addon_paths`, generalized from a hard-coded `.so` substring match
/// to `std::env::consts::DLL_SUFFIX` so the same logic works on macOS.
pub fn discover_addons(roots: &[String]) -> Vec<PathBuf> {
    let suffix = std::env::consts::DLL_SUFFIX;
    let mut found = Vec::new();

    for root in roots {
        let Ok(entries) = fs::read_dir(root) else { continue };
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(meta) = entry.metadata() else { continue };
            if meta.is_dir() {
                let Ok(inner) = fs::read_dir(&path) else { continue };
                for inner_entry in inner.flatten() {
                    let inner_path = inner_entry.path();
                    if is_dynamic_lib(&inner_path, suffix) {
                        push_canonical(&mut found, inner_path);
                    }
                }
            } else if is_dynamic_lib(&path, suffix) {
                push_canonical(&mut found, path);
            }
        }
    }

    found.sort();
    found.dedup();
    found
}

fn is_dynamic_lib(path: &Path, suffix: &str) -> bool {
    path.file_name().and_then(|n| n.to_str()).is_some_and(|n| n.ends_with(suffix))
}

fn push_canonical(out: &mut Vec<PathBuf>, path: PathBuf) {
    out.push(fs::canonicalize(&path).unwrap_or(path));
}
