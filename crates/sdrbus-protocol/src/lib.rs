//! Wire-level plumbing shared by the broker, the CLI, and addons: the
//! length-prefixed frame codec with ancillary FD passing, a tiny JSON
//! field probe that avoids building a parse tree for routing decisions,
//! the shared-memory ring for bulk sample streams, and the stream
//! kind/encoding tags that describe what a ring carries.

pub mod error;
pub mod frame;
pub mod json_probe;
pub mod ring;
pub mod stream_meta;

pub use error::{BrokerError, Result};
pub use frame::{recv_frame_once, send_frame, FrameReader, RecvOutcome, MAX_PAYLOAD};
pub use ring::{AudioFormat, IqFormat, RingConsumer, RingProducer, RingSpec, SharedRegion, MAGIC_AUDIO, MAGIC_IQ};
pub use stream_meta::{StreamEncoding, StreamKind};
