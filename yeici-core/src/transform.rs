//! Coordinate transform engine: Motive (Y-up, right-handed, meters) to Unreal and Maya.
//!
//! Unreal: axes remapped X->X, Y->Z, Z->Y and scaled to centimeters; quaternion becomes
//! (x, z, y, -w). Maya: Y-up kept, positions scaled to centimeters, rotation untouched.
//!
//! Positions and rotations of a frame are remapped as whole `N x 3` / `N x 4` batches
//! against the constant matrices below.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::frame::{DecodedFrame, RigidBody};

/// Meters to centimeters.
pub const UNIT_SCALE: f32 = 100.0;

/// Row-vector position remap for Unreal, scale folded in: `pos_ue = pos * M`.
pub const MOTIVE_TO_UNREAL_POS: [[f32; 3]; 3] = [
    [UNIT_SCALE, 0.0, 0.0],
    [0.0, 0.0, UNIT_SCALE],
    [0.0, UNIT_SCALE, 0.0],
];

/// Row-vector quaternion remap for Unreal: `(x, y, z, w) -> (x, z, y, -w)`.
pub const MOTIVE_TO_UNREAL_ROT: [[f32; 4]; 4] = [
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 0.0, -1.0],
];

/// Row-vector position scale for Maya.
pub const MOTIVE_TO_MAYA_POS: [[f32; 3]; 3] = [
    [UNIT_SCALE, 0.0, 0.0],
    [0.0, UNIT_SCALE, 0.0],
    [0.0, 0.0, UNIT_SCALE],
];

/// Subject key of a rigid body in the outgoing payload.
pub fn rigid_body_key(id: u32) -> String {
    format!("RB_{}", id)
}

/// Subject key of a skeleton in the outgoing payload.
pub fn skeleton_key(id: u32) -> String {
    format!("SK_{}", id)
}

/// Position and rotation in one target application's space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub pos: [f32; 3],
    pub rot: [f32; 4],
}

/// Per-bone arrays, index-aligned with the skeleton's bones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BonePoses {
    pub positions: Vec<[f32; 3]>,
    pub rotations: Vec<[f32; 4]>,
}

/// One tracked entity in a processed frame.
///
/// `stale` is set when corrupt input was replaced by the cached or zero fallback;
/// it is omitted from the wire form when false.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Subject {
    RigidBody {
        unreal: Pose,
        maya: Pose,
        #[serde(default, skip_serializing_if = "is_false")]
        stale: bool,
    },
    Skeleton {
        bone_count: usize,
        unreal: BonePoses,
        #[serde(default, skip_serializing_if = "is_false")]
        stale: bool,
    },
}

impl Subject {
    pub fn is_stale(&self) -> bool {
        match self {
            Subject::RigidBody { stale, .. } | Subject::Skeleton { stale, .. } => *stale,
        }
    }
}

fn is_false(v: &bool) -> bool {
    !*v
}

/// A frame remapped for every target application, keyed by `RB_<id>` / `SK_<id>`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessedFrame {
    pub frame_number: u32,
    pub subjects: BTreeMap<String, Subject>,
}

impl ProcessedFrame {
    pub fn stale_count(&self) -> usize {
        self.subjects.values().filter(|s| s.is_stale()).count()
    }
}

/// Last-known-good raw samples per subject key. A key exists only after a clean observation.
#[derive(Debug, Default)]
pub struct SanitizationCache {
    positions: HashMap<String, Vec<[f32; 3]>>,
    rotations: HashMap<String, Vec<[f32; 4]>>,
}

impl SanitizationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of subjects with at least one cached array.
    pub fn len(&self) -> usize {
        self.positions
            .keys()
            .chain(self.rotations.keys().filter(|k| !self.positions.contains_key(*k)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty() && self.rotations.is_empty()
    }

    pub fn clear(&mut self) {
        self.positions.clear();
        self.rotations.clear();
    }

    pub fn position(&self, key: &str) -> Option<&[[f32; 3]]> {
        self.positions.get(key).map(Vec::as_slice)
    }

    pub fn rotation(&self, key: &str) -> Option<&[[f32; 4]]> {
        self.rotations.get(key).map(Vec::as_slice)
    }

    fn positions(&mut self, key: &str, samples: Vec<[f32; 3]>) -> (Vec<[f32; 3]>, bool) {
        sanitize(&mut self.positions, key, samples, UNIT_SCALE)
    }

    fn rotations(&mut self, key: &str, samples: Vec<[f32; 4]>) -> (Vec<[f32; 4]>, bool) {
        sanitize(&mut self.rotations, key, samples, 1.0)
    }
}

/// Replace a corrupt array (NaN, Inf, or a component that overflows once multiplied by
/// `scale`) with the cached one, or zeros when nothing usable is cached. Clean arrays
/// refresh the cache. Returns the array to use and whether it is stale.
fn sanitize<const N: usize>(
    cache: &mut HashMap<String, Vec<[f32; N]>>,
    key: &str,
    samples: Vec<[f32; N]>,
    scale: f32,
) -> (Vec<[f32; N]>, bool) {
    let corrupt = samples.iter().flatten().any(|v| !(v * scale).is_finite());
    if !corrupt {
        cache.insert(key.to_owned(), samples.clone());
        return (samples, false);
    }
    match cache.get(key) {
        Some(last) if last.len() == samples.len() => (last.clone(), true),
        _ => (vec![[0.0; N]; samples.len()], true),
    }
}

/// Multiply every row vector by `m`.
fn remap<const N: usize>(rows: &[[f32; N]], m: &[[f32; N]; N]) -> Vec<[f32; N]> {
    rows.iter()
        .map(|row| {
            let mut out = [0.0f32; N];
            for (j, o) in out.iter_mut().enumerate() {
                *o = (0..N).fold(0.0, |acc, i| acc + row[i] * m[i][j]);
            }
            out
        })
        .collect()
}

/// Batch Motive -> Unreal.
pub fn to_unreal_space(
    positions: &[[f32; 3]],
    rotations: &[[f32; 4]],
) -> (Vec<[f32; 3]>, Vec<[f32; 4]>) {
    (
        remap(positions, &MOTIVE_TO_UNREAL_POS),
        remap(rotations, &MOTIVE_TO_UNREAL_ROT),
    )
}

/// Batch Motive -> Maya.
pub fn to_maya_space(
    positions: &[[f32; 3]],
    rotations: &[[f32; 4]],
) -> (Vec<[f32; 3]>, Vec<[f32; 4]>) {
    (remap(positions, &MOTIVE_TO_MAYA_POS), rotations.to_vec())
}

/// Single sample Motive -> Unreal.
pub fn motive_to_unreal(position: [f32; 3], rotation: [f32; 4]) -> Pose {
    let (p, r) = to_unreal_space(&[position], &[rotation]);
    Pose { pos: p[0], rot: r[0] }
}

/// Single sample Motive -> Maya.
pub fn motive_to_maya(position: [f32; 3], rotation: [f32; 4]) -> Pose {
    let (p, r) = to_maya_space(&[position], &[rotation]);
    Pose { pos: p[0], rot: r[0] }
}

/// Turns decoded frames into per-application payloads. Owns its sanitization cache,
/// so independent instances never share fallback state.
#[derive(Debug, Default)]
pub struct MocapTransformer {
    cache: SanitizationCache,
}

impl MocapTransformer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cache(&self) -> &SanitizationCache {
        &self.cache
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    pub fn process(&mut self, frame: &DecodedFrame) -> ProcessedFrame {
        let mut subjects = BTreeMap::new();
        self.process_rigid_bodies(&frame.rigid_bodies, &mut subjects);

        for sk in &frame.skeletons {
            let key = skeleton_key(sk.id);
            let (positions, rotations) = split(&sk.bones);
            let (positions, pos_stale) = self.cache.positions(&key, positions);
            let (rotations, rot_stale) = self.cache.rotations(&key, rotations);
            let (positions, rotations) = to_unreal_space(&positions, &rotations);
            subjects.insert(
                key,
                Subject::Skeleton {
                    bone_count: sk.bones.len(),
                    unreal: BonePoses {
                        positions,
                        rotations,
                    },
                    stale: pos_stale || rot_stale,
                },
            );
        }

        ProcessedFrame {
            frame_number: frame.frame_number,
            subjects,
        }
    }

    fn process_rigid_bodies(
        &mut self,
        rigid_bodies: &[RigidBody],
        subjects: &mut BTreeMap<String, Subject>,
    ) {
        if rigid_bodies.is_empty() {
            return;
        }
        let n = rigid_bodies.len();
        let mut keys = Vec::with_capacity(n);
        let mut positions = Vec::with_capacity(n);
        let mut rotations = Vec::with_capacity(n);
        let mut stale = Vec::with_capacity(n);
        for rb in rigid_bodies {
            let key = rigid_body_key(rb.id);
            let (pos, pos_stale) = self.cache.positions(&key, vec![rb.position]);
            let (rot, rot_stale) = self.cache.rotations(&key, vec![rb.rotation]);
            positions.push(pos[0]);
            rotations.push(rot[0]);
            stale.push(pos_stale || rot_stale);
            keys.push(key);
        }

        let (pos_ue, rot_ue) = to_unreal_space(&positions, &rotations);
        let (pos_maya, rot_maya) = to_maya_space(&positions, &rotations);

        for (i, key) in keys.into_iter().enumerate() {
            subjects.insert(
                key,
                Subject::RigidBody {
                    unreal: Pose {
                        pos: pos_ue[i],
                        rot: rot_ue[i],
                    },
                    maya: Pose {
                        pos: pos_maya[i],
                        rot: rot_maya[i],
                    },
                    stale: stale[i],
                },
            );
        }
    }
}

fn split(bones: &[RigidBody]) -> (Vec<[f32; 3]>, Vec<[f32; 4]>) {
    bones.iter().map(|b| (b.position, b.rotation)).unzip()
}
