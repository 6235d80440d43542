//! Plugin host properties against the three demo addon `cdylib`s, plus a
//! synthetic fixture addon, as real loadable fixtures: ABI handshake,
//! load/unload/load, and the already-loaded guard. These addons are
//! workspace members built alongside the broker, so by the time `cargo
//! test` reaches this file their shared objects already sit in the same
//! `target/<profile>` directory this binary does.
//!
//! A fixture that hasn't been built for the current target triple/profile
//! (e.g. a partial workspace build) is skipped rather than failed — this
//! file verifies the plugin host's behavior against real dylibs where
//! available, it isn't the thing that builds them.

use std::path::{Path, PathBuf};

use sdrbus_broker::plugin_host::PluginTable;

fn target_dir() -> PathBuf {
    let mut dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    dir.pop(); // crates/
    dir.pop(); // workspace root
    dir.join("target").join(if cfg!(debug_assertions) { "debug" } else { "release" })
}

fn cdylib_path(crate_name: &str) -> Option<PathBuf> {
    let file = format!("{}{}{}", std::env::consts::DLL_PREFIX, crate_name, std::env::consts::DLL_SUFFIX);
    let path = target_dir().join(file);
    path.is_file().then_some(path)
}

fn require_fixture(crate_name: &str) -> Option<PathBuf> {
    match cdylib_path(crate_name) {
        Some(p) => Some(p),
        None => {
            eprintln!("skipping: {crate_name} cdylib not found under {}", target_dir().display());
            None
        }
    }
}

#[test]
fn load_start_stop_round_trip() {
    let Some(path) = require_fixture("sdrbus_addon_soapy_iq") else { return };
    let table = PluginTable::new();
    let name = table.load(&path, "/tmp/.sdrbus-broker-test.sock").expect("soapy-iq should load and start");
    assert_eq!(name, "soapy");
    assert!(table.is_loaded("soapy"));

    table.unload("soapy").expect("soapy should unload cleanly");
    assert!(!table.is_loaded("soapy"));

    let name_again = table.load(&path, "/tmp/.sdrbus-broker-test.sock").expect("soapy-iq should reload after unload");
    assert_eq!(name_again, "soapy");
    table.unload("soapy").unwrap();
}

#[test]
fn loading_the_same_plugin_twice_is_rejected() {
    let Some(path) = require_fixture("sdrbus_addon_wfmd") else { return };
    let table = PluginTable::new();
    table.load(&path, "/tmp/.sdrbus-broker-test.sock").expect("wfmd should load and start");

    let err = table.load(&path, "/tmp/.sdrbus-broker-test.sock").unwrap_err();
    assert!(matches!(err, sdrbus_protocol::BrokerError::AlreadyLoaded(_)));

    table.unload("wfmd").unwrap();
}

#[test]
fn all_three_demo_addons_declare_distinct_capabilities() {
    let names = ["sdrbus_addon_soapy_iq", "sdrbus_addon_wfmd", "sdrbus_addon_audiosink"];
    let paths: Vec<Option<PathBuf>> = names.iter().map(|n| cdylib_path(n)).collect();
    if paths.iter().any(Option::is_none) {
        eprintln!("skipping: not all three demo addon cdylibs are built");
        return;
    }

    let table = PluginTable::new();
    for path in paths.iter().flatten() {
        table.load(path, "/tmp/.sdrbus-broker-test.sock").expect("demo addon should load and start");
    }
    let mut loaded = table.names();
    loaded.sort();
    assert_eq!(loaded, vec!["audiosink", "soapy", "wfmd"]);

    for name in &loaded {
        table.unload(name).unwrap();
    }
}

#[test]
fn mismatched_abi_is_refused_before_start() {
    // Unlike the three demo addons, this fixture hand-implements
    // `plugin_init` to always reject the host's ABI version, so it's the
    // only loadable dylib in this workspace that actually exercises the
    // refusal path.
    let Some(path) = require_fixture("sdrbus_fixture_abi_mismatch") else { return };
    let table = PluginTable::new();
    let err = table.load(&path, "/tmp/.sdrbus-broker-test.sock").unwrap_err();
    assert!(matches!(err, sdrbus_protocol::BrokerError::AbiMismatch { host: 1, plugin: 0 }));
    assert!(table.names().is_empty());
}

#[test]
fn unloading_a_non_dylib_path_fails_without_poisoning_the_table() {
    // Any regular file lacking the four ABI symbols is rejected at load
    // time with a symbol-missing error, never partially admitted.
    let bogus: &Path = Path::new(file!());
    let table = PluginTable::new();
    let err = table.load(bogus, "/tmp/.sdrbus-broker-test.sock").unwrap_err();
    assert!(matches!(
        err,
        sdrbus_protocol::BrokerError::IoError(_) | sdrbus_protocol::BrokerError::SymbolMissing(_)
    ));
    assert!(table.names().is_empty());
}
