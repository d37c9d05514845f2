//! Decoded motion data: one NatNet "Frame of Data" as plain values.

use serde::{Deserialize, Serialize};

/// A tracked object: position (meters, Motive Y-up) and orientation quaternion (x, y, z, w).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RigidBody {
    pub id: u32,
    pub position: [f32; 3],
    pub rotation: [f32; 4],
}

impl RigidBody {
    pub fn new(id: u32, position: [f32; 3], rotation: [f32; 4]) -> Self {
        Self {
            id,
            position,
            rotation,
        }
    }
}

/// A performer. Bones are carried as rigid bodies; no hierarchy metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Skeleton {
    pub id: u32,
    pub bones: Vec<RigidBody>,
}

/// One time-sample as received from the capture application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecodedFrame {
    /// Passed through as sent; gaps are not repaired.
    pub frame_number: u32,
    pub rigid_bodies: Vec<RigidBody>,
    pub skeletons: Vec<Skeleton>,
}

/// Named marker cloud. The decoder skips these; only the encoder writes them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarkerSet {
    pub name: String,
    pub markers: Vec<[f32; 3]>,
}
