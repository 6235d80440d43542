//! Broker configuration, loaded from a TOML file: every field has a
//! documented default so a missing file section never panics, only
//! `[broker]` itself is required.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    pub broker: BrokerSection,
    #[serde(default)]
    pub addons: AddonsSection,
    #[serde(default)]
    pub timing: TimingSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerSection {
    #[serde(default = "default_socket_path")]
    pub socket_path: String,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self { socket_path: default_socket_path() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AddonsSection {
    #[serde(default = "default_addon_roots")]
    pub roots: Vec<String>,
    #[serde(default = "default_true")]
    pub autoload: bool,
}

impl Default for AddonsSection {
    fn default() -> Self {
        Self { roots: default_addon_roots(), autoload: true }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimingSection {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_frame_read_budget_ms")]
    pub frame_read_budget_ms: u64,
}

impl Default for TimingSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            frame_read_budget_ms: default_frame_read_budget_ms(),
        }
    }
}

fn default_socket_path() -> String {
    "/tmp/.sdrbus-broker.sock".to_string()
}
fn default_addon_roots() -> Vec<String> {
    vec!["./addons".to_string(), "./demos/addons".to_string()]
}
fn default_true() -> bool {
    true
}
fn default_poll_interval_ms() -> u64 {
    200
}
fn default_frame_read_budget_ms() -> u64 {
    10
}

impl BrokerConfig {
    pub fn from_str(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }
}
