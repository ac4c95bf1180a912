//! Area state: overlap bookkeeping and gravity overrides

use crate::body_table::BodyId;
use crate::composition::ShapeInstanceId;
use rapier3d::na::Vector3;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How an area's gravity combines with what is already acting on a body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GravityMode {
    /// The area does not touch gravity
    #[default]
    Disabled,
    /// Add to gravity from lower-priority areas and the space
    Combine,
    /// Add, then ignore every lower-priority area and the space
    Replace,
}

/// Gravity settings of one area
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GravityOverride {
    pub mode: GravityMode,
    pub gravity: [f32; 3],
    /// Higher priorities are applied first
    pub priority: i32,
}

impl Default for GravityOverride {
    fn default() -> Self {
        Self {
            mode: GravityMode::Disabled,
            gravity: [0.0, -9.81, 0.0],
            priority: 0,
        }
    }
}

impl GravityOverride {
    pub fn combine(gravity: [f32; 3]) -> Self {
        Self {
            mode: GravityMode::Combine,
            gravity,
            ..Default::default()
        }
    }

    pub fn replace(gravity: [f32; 3]) -> Self {
        Self {
            mode: GravityMode::Replace,
            gravity,
            ..Default::default()
        }
    }

    /// Set priority (builder pattern)
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn vector(&self) -> Vector3<f32> {
        Vector3::from(self.gravity)
    }
}

/// Effective gravity on a body from the areas it is inside
pub fn combine_gravity(space_gravity: &Vector3<f32>, areas: &mut [GravityOverride]) -> Vector3<f32> {
    areas.sort_by(|a, b| b.priority.cmp(&a.priority));

    let mut total = Vector3::zeros();
    for area in areas.iter() {
        match area.mode {
            GravityMode::Disabled => {}
            GravityMode::Combine => total += area.vector(),
            GravityMode::Replace => return total + area.vector(),
        }
    }
    total + space_gravity
}

/// One overlapping (other shape, own shape) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OverlapKey {
    pub other: BodyId,
    pub other_shape: ShapeInstanceId,
    pub self_shape: ShapeInstanceId,
}

/// Bridge-side state of a body that is an area
#[derive(Debug, Clone, Default)]
pub struct AreaState {
    pub monitoring: bool,
    pub gravity: GravityOverride,
    overlaps: HashMap<OverlapKey, u32>,
}

impl AreaState {
    pub fn new(monitoring: bool, gravity: GravityOverride) -> Self {
        Self {
            monitoring,
            gravity,
            overlaps: HashMap::new(),
        }
    }

    /// Count one more contact for `key`; true if the pair just started
    pub fn add_overlap(&mut self, key: OverlapKey) -> bool {
        let count = self.overlaps.entry(key).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Count one contact less for `key`; true if the pair just ended.
    /// Unknown keys are ignored.
    pub fn remove_overlap(&mut self, key: OverlapKey) -> bool {
        match self.overlaps.get_mut(&key) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                self.overlaps.remove(&key);
                true
            }
            None => false,
        }
    }

    /// Forget every pair involving `other`, returning them
    pub fn remove_body(&mut self, other: BodyId) -> Vec<OverlapKey> {
        let keys: Vec<_> = self
            .overlaps
            .keys()
            .filter(|key| key.other == other)
            .copied()
            .collect();
        for key in &keys {
            self.overlaps.remove(key);
        }
        keys
    }

    /// Forget every pair, returning them
    pub fn clear(&mut self) -> Vec<OverlapKey> {
        self.overlaps.drain().map(|(key, _)| key).collect()
    }

    pub fn is_overlapping(&self, other: BodyId) -> bool {
        self.overlaps.keys().any(|key| key.other == other)
    }

    /// Distinct bodies currently inside the area
    pub fn overlapping_bodies(&self) -> Vec<BodyId> {
        let mut bodies: Vec<_> = self.overlaps.keys().map(|key| key.other).collect();
        bodies.sort_unstable();
        bodies.dedup();
        bodies
    }

    pub fn overlap_count(&self) -> usize {
        self.overlaps.len()
    }
}
