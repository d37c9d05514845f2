//! YeiciCap Hub core: NatNet decoding, coordinate transforms, distribution framing.
//! Pure: no sockets, no threads, no logging. The hub crate drives it.

pub mod frame;
pub mod natnet;
pub mod transform;
pub mod wire;

pub use frame::{DecodedFrame, MarkerSet, RigidBody, Skeleton};
pub use natnet::{decode, encode_frame_of_data, DecodeError, Packet};
pub use transform::{
    BonePoses, MocapTransformer, Pose, ProcessedFrame, SanitizationCache, Subject,
};
pub use wire::{decode_line, encode_line, LineDecodeError, LineEncodeError};
