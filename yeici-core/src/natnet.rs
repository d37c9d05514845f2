//! NatNet 3.x datagram decoding (Frame of Data only) and a matching encoder.
//!
//! Layout, little-endian throughout:
//!
//! ```text
//! u16 message_id | u16 size | u32 frame_number
//! u32 marker_set_count  { cstr name | u32 marker_count | marker_count * 12 bytes }
//! u32 rigid_body_count  { rigid body | f32 mean_marker_error }
//! u32 skeleton_count    { u32 id | u32 bone_count { rigid body | f32 mean_marker_error } }
//!
//! rigid body = u32 id | 3 * f32 position | 4 * f32 rotation (x, y, z, w)
//! ```
//!
//! Anything after the skeleton section is ignored.

use std::net::Ipv4Addr;

use crate::frame::{DecodedFrame, MarkerSet, RigidBody, Skeleton};

/// Message id of a "Frame of Data" packet.
pub const NAT_FRAMEOFDATA: u16 = 7;

/// Multicast group Motive publishes frames to by default.
pub const DEFAULT_MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 42, 99);

/// Default NatNet data port.
pub const DEFAULT_DATA_PORT: u16 = 1511;

/// Largest datagram the receive loop accepts.
pub const MAX_PACKET_SIZE: usize = 65535;

const HEADER_SIZE: usize = 4;
const MARKER_SIZE: usize = 12;
// id + position + rotation + mean marker error
const RIGID_BODY_RECORD_SIZE: usize = 4 + 12 + 16 + 4;
// empty name terminator + marker count
const MIN_MARKER_SET_SIZE: usize = 1 + 4;
// id + bone count
const MIN_SKELETON_SIZE: usize = 4 + 4;

/// Result of decoding one datagram.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    FrameOfData(DecodedFrame),
    /// Well-formed header carrying a message type this bridge does not handle.
    Skip { message_id: u16 },
}

/// A datagram that cannot be decoded. Every variant means "malformed": drop it and keep listening.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("truncated at offset {offset}: need {needed} bytes, {remaining} remaining")]
    Truncated {
        offset: usize,
        needed: usize,
        remaining: usize,
    },
    #[error("unterminated marker set name at offset {offset}")]
    UnterminatedName { offset: usize },
    #[error("{what} count {count} cannot fit in {remaining} remaining bytes")]
    CountTooLarge {
        what: &'static str,
        count: u32,
        remaining: usize,
    },
}

impl DecodeError {
    /// All decode errors are malformed-datagram errors; unknown message types are `Packet::Skip`.
    pub fn is_malformed(&self) -> bool {
        true
    }
}

/// Decode one datagram. Never panics and never returns a partial frame.
pub fn decode(buf: &[u8]) -> Result<Packet, DecodeError> {
    let mut r = Reader::new(buf);
    let message_id = r.u16()?;
    // Size field only advances the offset.
    let _size = r.u16()?;
    if message_id != NAT_FRAMEOFDATA {
        return Ok(Packet::Skip { message_id });
    }
    decode_frame_of_data(&mut r).map(Packet::FrameOfData)
}

fn decode_frame_of_data(r: &mut Reader<'_>) -> Result<DecodedFrame, DecodeError> {
    let frame_number = r.u32()?;

    let marker_set_count = r.count("marker set", MIN_MARKER_SET_SIZE)?;
    for _ in 0..marker_set_count {
        r.skip_cstr()?;
        let markers = r.count("marker", MARKER_SIZE)?;
        r.skip(markers * MARKER_SIZE)?;
    }

    let rigid_body_count = r.count("rigid body", RIGID_BODY_RECORD_SIZE)?;
    let mut rigid_bodies = Vec::with_capacity(rigid_body_count);
    for _ in 0..rigid_body_count {
        rigid_bodies.push(r.rigid_body()?);
    }

    let skeleton_count = r.count("skeleton", MIN_SKELETON_SIZE)?;
    let mut skeletons = Vec::with_capacity(skeleton_count);
    for _ in 0..skeleton_count {
        let id = r.u32()?;
        let bone_count = r.count("bone", RIGID_BODY_RECORD_SIZE)?;
        let mut bones = Vec::with_capacity(bone_count);
        for _ in 0..bone_count {
            bones.push(r.rigid_body()?);
        }
        skeletons.push(Skeleton { id, bones });
    }

    Ok(DecodedFrame {
        frame_number,
        rigid_bodies,
        skeletons,
    })
}

/// Bounds-checked little-endian cursor over a datagram.
struct Reader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.offset
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::Truncated {
                offset: self.offset,
                needed: n,
                remaining: self.remaining(),
            });
        }
        let out = &self.buf[self.offset..self.offset + n];
        self.offset += n;
        Ok(out)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn skip(&mut self, n: usize) -> Result<(), DecodeError> {
        self.take(n).map(|_| ())
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.take_array()?))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    fn f32(&mut self) -> Result<f32, DecodeError> {
        Ok(f32::from_le_bytes(self.take_array()?))
    }

    /// Read a u32 count and reject it if `count * min_record_size` cannot fit in what is left.
    fn count(&mut self, what: &'static str, min_record_size: usize) -> Result<usize, DecodeError> {
        let count = self.u32()?;
        let remaining = self.remaining();
        match (count as usize).checked_mul(min_record_size) {
            Some(needed) if needed <= remaining => Ok(count as usize),
            _ => Err(DecodeError::CountTooLarge {
                what,
                count,
                remaining,
            }),
        }
    }

    fn skip_cstr(&mut self) -> Result<(), DecodeError> {
        let rest = &self.buf[self.offset..];
        match rest.iter().position(|&b| b == 0) {
            Some(nul) => {
                self.offset += nul + 1;
                Ok(())
            }
            None => Err(DecodeError::UnterminatedName {
                offset: self.offset,
            }),
        }
    }

    /// One rigid body record followed by its discarded mean marker error.
    fn rigid_body(&mut self) -> Result<RigidBody, DecodeError> {
        let id = self.u32()?;
        let position = [self.f32()?, self.f32()?, self.f32()?];
        let rotation = [self.f32()?, self.f32()?, self.f32()?, self.f32()?];
        let _mean_marker_error = self.f32()?;
        Ok(RigidBody {
            id,
            position,
            rotation,
        })
    }
}

/// Encode a Frame of Data datagram with no marker sets.
pub fn encode_frame_of_data(frame: &DecodedFrame) -> Vec<u8> {
    encode_frame_of_data_with_marker_sets(frame, &[])
}

/// Encode a Frame of Data datagram. Mean marker errors are written as 0.0;
/// the size field carries the payload length, saturated to u16.
pub fn encode_frame_of_data_with_marker_sets(
    frame: &DecodedFrame,
    marker_sets: &[MarkerSet],
) -> Vec<u8> {
    let mut payload = Vec::with_capacity(
        16 + RIGID_BODY_RECORD_SIZE * frame.rigid_bodies.len()
            + frame
                .skeletons
                .iter()
                .map(|s| MIN_SKELETON_SIZE + RIGID_BODY_RECORD_SIZE * s.bones.len())
                .sum::<usize>(),
    );
    payload.extend_from_slice(&frame.frame_number.to_le_bytes());

    put_len(&mut payload, marker_sets.len());
    for set in marker_sets {
        payload.extend_from_slice(set.name.as_bytes());
        payload.push(0);
        put_len(&mut payload, set.markers.len());
        for marker in &set.markers {
            for v in marker {
                payload.extend_from_slice(&v.to_le_bytes());
            }
        }
    }

    put_len(&mut payload, frame.rigid_bodies.len());
    for rb in &frame.rigid_bodies {
        put_rigid_body(&mut payload, rb);
    }

    put_len(&mut payload, frame.skeletons.len());
    for sk in &frame.skeletons {
        payload.extend_from_slice(&sk.id.to_le_bytes());
        put_len(&mut payload, sk.bones.len());
        for bone in &sk.bones {
            put_rigid_body(&mut payload, bone);
        }
    }

    let size = u16::try_from(payload.len()).unwrap_or(u16::MAX);
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.extend_from_slice(&NAT_FRAMEOFDATA.to_le_bytes());
    out.extend_from_slice(&size.to_le_bytes());
    out.extend_from_slice(&payload);
    out
}

fn put_len(out: &mut Vec<u8>, len: usize) {
    let len = u32::try_from(len).unwrap_or(u32::MAX);
    out.extend_from_slice(&len.to_le_bytes());
}

fn put_rigid_body(out: &mut Vec<u8>, rb: &RigidBody) {
    out.extend_from_slice(&rb.id.to_le_bytes());
    for v in rb.position.iter().chain(rb.rotation.iter()) {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out.extend_from_slice(&0f32.to_le_bytes());
}
