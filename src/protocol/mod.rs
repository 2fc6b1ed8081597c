//! Wire format shared by the driver, executors and submitters.
//!
//! Every frame is a 4-byte big-endian length followed by its payload. Control frames
//! carry JSON envelopes; data-context frames carry raw bytes.

pub mod frame;
pub mod message;

pub use frame::{decode_json, encode_json, FrameCodec, DEFAULT_MAX_FRAME_LEN};
pub use message::{
    BundleHeader, BundleKind, BundleParams, ChannelKind, ClientMessage, DriverMessage,
    ResourceMessage, SystemInfo, MAX_PREALLOCATED_UNITS,
};
