//! Stream kind/encoding tags carried in control-plane JSON alongside a
//! ring handle, so a subscriber knows how to interpret the bytes before it
//! has mapped anything.

use crate::error::{BrokerError, Result};

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Unknown = 0,
    Iq = 1,
    Audio = 2,
    Frames = 3,
    Events = 4,
    Log = 5,
}

impl TryFrom<u32> for StreamKind {
    type Error = BrokerError;
    fn try_from(v: u32) -> Result<Self> {
        Ok(match v {
            0 => StreamKind::Unknown,
            1 => StreamKind::Iq,
            2 => StreamKind::Audio,
            3 => StreamKind::Frames,
            4 => StreamKind::Events,
            5 => StreamKind::Log,
            other => return Err(BrokerError::NotFound(format!("unknown stream kind {other}"))),
        })
    }
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEncoding {
    Unknown = 0,
    Cf32 = 1,
    Cs16 = 2,
    F32 = 3,
    S16 = 4,
    Hex = 5,
    Json = 6,
    Utf8 = 7,
}

impl TryFrom<u32> for StreamEncoding {
    type Error = BrokerError;
    fn try_from(v: u32) -> Result<Self> {
        Ok(match v {
            0 => StreamEncoding::Unknown,
            1 => StreamEncoding::Cf32,
            2 => StreamEncoding::Cs16,
            3 => StreamEncoding::F32,
            4 => StreamEncoding::S16,
            5 => StreamEncoding::Hex,
            6 => StreamEncoding::Json,
            7 => StreamEncoding::Utf8,
            other => return Err(BrokerError::NotFound(format!("unknown stream encoding {other}"))),
        })
    }
}

impl StreamEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamEncoding::Unknown => "unknown",
            StreamEncoding::Cf32 => "cf32",
            StreamEncoding::Cs16 => "cs16",
            StreamEncoding::F32 => "f32",
            StreamEncoding::S16 => "s16",
            StreamEncoding::Hex => "hex",
            StreamEncoding::Json => "json",
            StreamEncoding::Utf8 => "utf8",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_known_values() {
        assert_eq!(StreamKind::try_from(1).unwrap(), StreamKind::Iq);
        assert_eq!(StreamEncoding::try_from(7).unwrap(), StreamEncoding::Utf8);
    }

    #[test]
    fn rejects_unknown_values() {
        assert!(StreamKind::try_from(99).is_err());
        assert!(StreamEncoding::try_from(99).is_err());
    }
}
