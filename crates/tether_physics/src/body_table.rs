//! Body records and their bucketed storage
//!
//! Every body the bridge creates gets a [`BodyRecord`]: the bridge-side view
//! of one engine body (which object owns it, its layer, its composed shape,
//! the state mirrored back after each step). Records are spread across a
//! fixed number of buckets, each behind its own read/write lock, so that
//! accessors touching unrelated bodies never contend.
//!
//! Records are reached through [`crate::body_access`]; the table itself only
//! exposes insertion, removal and bucket arithmetic.

use crate::area::AreaState;
use crate::composition::{ComposedShape, ShapeInstanceId};
use crate::error::{PhysicsError, Result};
use crate::layers::ObjectLayer;
use crate::object::ObjectRid;
use parking_lot::{Mutex, RwLock};
use rapier3d::na::{Isometry3, Vector3};
use rapier3d::prelude as rapier;
use std::fmt;
use std::sync::Arc;

// ==================== Body Id ====================

/// Engine-side body identifier: 24-bit index + 8-bit sequence number
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BodyId(u32);

impl BodyId {
    pub const MAX_INDEX: u32 = (1 << 24) - 1;

    /// The id of a body that does not exist
    pub const INVALID: Self = Self(u32::MAX);

    fn new(index: u32, sequence: u8) -> Self {
        debug_assert!(index <= Self::MAX_INDEX);
        Self(((sequence as u32) << 24) | index)
    }

    #[inline]
    pub fn index(self) -> u32 {
        self.0 & Self::MAX_INDEX
    }

    #[inline]
    pub fn sequence(self) -> u8 {
        (self.0 >> 24) as u8
    }

    #[inline]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    #[inline]
    pub fn to_bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }
}

impl Default for BodyId {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Debug for BodyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "BodyId({}s{})", self.index(), self.sequence())
        } else {
            write!(f, "BodyId(invalid)")
        }
    }
}

// ==================== Records ====================

/// How the engine moves a body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MotionType {
    Static,
    Kinematic,
    Dynamic,
}

impl MotionType {
    pub fn is_static(self) -> bool {
        self == Self::Static
    }
}

/// Per-step force inputs of a dynamic body
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BodyDynamics {
    pub mass: f32,
    pub gravity_scale: f32,
    pub constant_force: Vector3<f32>,
    pub constant_torque: Vector3<f32>,
}

impl Default for BodyDynamics {
    fn default() -> Self {
        Self {
            mass: 1.0,
            gravity_scale: 1.0,
            constant_force: Vector3::zeros(),
            constant_torque: Vector3::zeros(),
        }
    }
}

/// Bridge-side record of one engine body
#[derive(Debug, Clone)]
pub struct BodyRecord {
    pub id: BodyId,
    pub handle: rapier::RigidBodyHandle,
    pub colliders: Vec<rapier::ColliderHandle>,
    /// Owning collision object (non-owning back reference)
    pub object: ObjectRid,
    /// Host instance the object belongs to
    pub instance_id: u64,
    pub object_layer: ObjectLayer,
    pub motion: MotionType,
    pub shape: Arc<ComposedShape>,
    /// Instance id of each shape slot on the object, in shape-index order
    pub instance_ids: Vec<ShapeInstanceId>,
    pub pose: Isometry3<f32>,
    pub linvel: Vector3<f32>,
    pub angvel: Vector3<f32>,
    pub sleeping: bool,
    pub dynamics: BodyDynamics,
    /// Present for areas
    pub area: Option<AreaState>,
    /// Free for host use
    pub user_data: u64,
}

impl BodyRecord {
    pub fn new(id: BodyId, object: ObjectRid, shape: Arc<ComposedShape>) -> Self {
        Self {
            id,
            handle: rapier::RigidBodyHandle::invalid(),
            colliders: Vec::new(),
            object,
            instance_id: 0,
            object_layer: ObjectLayer::from_bits(0),
            motion: MotionType::Static,
            shape,
            instance_ids: Vec::new(),
            pose: Isometry3::identity(),
            linvel: Vector3::zeros(),
            angvel: Vector3::zeros(),
            sleeping: false,
            dynamics: BodyDynamics::default(),
            area: None,
            user_data: 0,
        }
    }

    pub fn is_area(&self) -> bool {
        self.area.is_some()
    }

    /// Current index of a shape instance on the owning object
    pub fn shape_index(&self, instance: ShapeInstanceId) -> Option<usize> {
        self.instance_ids.iter().position(|id| *id == instance)
    }
}

// ==================== Buckets ====================

/// Slots of one lock bucket. Body index `i` lives in bucket `i % n` at
/// slot `i / n`.
#[derive(Debug)]
pub struct BodyBucket {
    slots: Vec<Option<BodyRecord>>,
    bucket_count: u32,
}

impl BodyBucket {
    fn slot_of(&self, id: BodyId) -> usize {
        (id.index() / self.bucket_count) as usize
    }

    /// Record for `id`, if it is still the body in that slot
    pub fn get(&self, id: BodyId) -> Option<&BodyRecord> {
        if !id.is_valid() {
            return None;
        }
        self.slots
            .get(self.slot_of(id))?
            .as_ref()
            .filter(|record| record.id == id)
    }

    pub fn get_mut(&mut self, id: BodyId) -> Option<&mut BodyRecord> {
        if !id.is_valid() {
            return None;
        }
        let slot = self.slot_of(id);
        self.slots
            .get_mut(slot)?
            .as_mut()
            .filter(|record| record.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BodyRecord> {
        self.slots.iter().flatten()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut BodyRecord> {
        self.slots.iter_mut().flatten()
    }

    fn place(&mut self, record: BodyRecord) {
        let slot = self.slot_of(record.id);
        if slot >= self.slots.len() {
            self.slots.resize_with(slot + 1, || None);
        }
        self.slots[slot] = Some(record);
    }

    fn take(&mut self, id: BodyId) -> Option<BodyRecord> {
        self.get(id)?;
        let slot = self.slot_of(id);
        self.slots[slot].take()
    }
}

/// Hands out body ids under a hard ceiling
#[derive(Debug)]
struct IdAllocator {
    sequences: Vec<u8>,
    free_list: Vec<u32>,
    live: u32,
    limit: u32,
}

impl IdAllocator {
    fn allocate(&mut self) -> Option<BodyId> {
        if self.live >= self.limit {
            return None;
        }
        let id = match self.free_list.pop() {
            Some(index) => BodyId::new(index, self.sequences[index as usize]),
            None => {
                let index = self.sequences.len() as u32;
                if index > BodyId::MAX_INDEX {
                    return None;
                }
                self.sequences.push(0);
                BodyId::new(index, 0)
            }
        };
        self.live += 1;
        Some(id)
    }

    fn free(&mut self, id: BodyId) {
        let sequence = &mut self.sequences[id.index() as usize];
        *sequence = sequence.wrapping_add(1);
        // Sequence 0xFF on the last index would spell the invalid id.
        if BodyId::new(id.index(), *sequence).is_valid() {
            self.free_list.push(id.index());
        }
        self.live -= 1;
    }
}

// ==================== Table ====================

/// Fixed set of lock buckets holding every body record of a space
pub struct BodyTable {
    buckets: Box<[RwLock<BodyBucket>]>,
    ids: Mutex<IdAllocator>,
}

impl BodyTable {
    /// `bucket_count` must be a power of two no larger than 64
    pub fn new(max_bodies: u32, bucket_count: u32) -> Self {
        assert!(
            bucket_count.is_power_of_two() && bucket_count <= 64,
            "body bucket count must be a power of two in 1..=64, got {}",
            bucket_count
        );
        let buckets = (0..bucket_count)
            .map(|_| {
                RwLock::new(BodyBucket {
                    slots: Vec::new(),
                    bucket_count,
                })
            })
            .collect();
        Self {
            buckets,
            ids: Mutex::new(IdAllocator {
                sequences: Vec::new(),
                free_list: Vec::new(),
                live: 0,
                limit: max_bodies,
            }),
        }
    }

    /// Number of lock buckets
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Bucket a body id lives in
    #[inline]
    pub fn bucket_of(&self, id: BodyId) -> usize {
        id.index() as usize & (self.buckets.len() - 1)
    }

    pub(crate) fn bucket(&self, index: usize) -> &RwLock<BodyBucket> {
        &self.buckets[index]
    }

    /// Number of live bodies
    pub fn len(&self) -> usize {
        self.ids.lock().live as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_bodies(&self) -> u32 {
        self.ids.lock().limit
    }

    /// Allocate an id and store the record built for it.
    ///
    /// If `build` fails the id is returned to the allocator and nothing is
    /// stored.
    pub fn insert_with(
        &self,
        build: impl FnOnce(BodyId) -> Result<BodyRecord>,
    ) -> Result<BodyId> {
        let id = {
            let mut ids = self.ids.lock();
            match ids.allocate() {
                Some(id) => id,
                None => {
                    let limit = ids.limit;
                    drop(ids);
                    log::error!("Body limit of {} reached; body not created", limit);
                    return Err(PhysicsError::BodyLimitReached { limit });
                }
            }
        };

        match build(id) {
            Ok(mut record) => {
                record.id = id;
                self.buckets[self.bucket_of(id)].write().place(record);
                Ok(id)
            }
            Err(err) => {
                self.ids.lock().free(id);
                Err(err)
            }
        }
    }

    /// Remove a record; `None` if the id is stale
    pub fn remove(&self, id: BodyId) -> Option<BodyRecord> {
        if !id.is_valid() {
            return None;
        }
        let record = self.buckets[self.bucket_of(id)].write().take(id)?;
        self.ids.lock().free(id);
        Some(record)
    }

    pub fn contains(&self, id: BodyId) -> bool {
        id.is_valid() && self.buckets[self.bucket_of(id)].read().get(id).is_some()
    }

    /// Every live body id, bucket by bucket
    pub fn ids(&self) -> Vec<BodyId> {
        let mut out = Vec::with_capacity(self.len());
        for bucket in self.buckets.iter() {
            out.extend(bucket.read().iter().map(|record| record.id));
        }
        out
    }
}

impl fmt::Debug for BodyTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyTable")
            .field("buckets", &self.buckets.len())
            .field("bodies", &self.len())
            .finish()
    }
}
