//! Shared error vocabulary for the broker, CLI, and addon SDK.
//!
//! Mirrors the error kinds enumerated in the system design: codec failures,
//! ring mapping failures, ABI mismatches, and plugin-host bookkeeping
//! failures all funnel through this one type so callers can match on kind
//! without downcasting.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("frame length out of bounds (0 < len <= {max}): got {got}")]
    BadLength { got: u32, max: u32 },

    #[error("ring magic mismatch: expected {expected:#010x}, got {got:#010x}")]
    BadMagic { expected: u32, got: u32 },

    #[error("plugin abi mismatch: host supports {host}, plugin requested {plugin}")]
    AbiMismatch { host: u32, plugin: u32 },

    #[error("missing required symbol in addon library: {0}")]
    SymbolMissing(String),

    #[error("plugin already loaded: {0}")]
    AlreadyLoaded(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("peer closed the connection")]
    PeerClosed,

    #[error("operation timed out")]
    TimedOut,

    #[error("i/o error: {0}")]
    IoError(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, BrokerError>;
