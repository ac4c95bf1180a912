//! Engine system - the rapier pipeline plus the bridge's body table
//!
//! [`PhysicsSystem`] is the one place that talks to rapier's sets. Every
//! engine body it creates gets a [`BodyRecord`] in the [`BodyTable`], and
//! every collider carries a packed [`ColliderTag`] in its user data so that
//! filter callbacks on engine threads can identify it without taking a lock.

use crate::area::AreaState;
use crate::body_access::{BodyReader, BodyWriter};
use crate::body_table::{BodyDynamics, BodyId, BodyRecord, BodyTable, MotionType};
use crate::composition::{ColliderPart, ComposedShape, ShapeInstanceId};
use crate::config::PhysicsConfig;
use crate::error::Result;
use crate::layers::{LayerFilter, ObjectLayer};
use crate::object::ObjectRid;
use rapier3d::na::{Isometry3, Vector3};
use rapier3d::prelude as rapier;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

// ==================== Collider Tags ====================

/// Identity of one engine collider, packed into its `u128` user data.
///
/// Layout: bits 0..32 body id, 32..64 shape instance id, 64..80 object
/// layer, 80..112 owning object handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColliderTag {
    pub body: BodyId,
    pub instance: ShapeInstanceId,
    pub layer: ObjectLayer,
    pub object: ObjectRid,
}

impl ColliderTag {
    pub fn pack(&self) -> u128 {
        (self.body.to_bits() as u128)
            | (self.instance.to_bits() as u128) << 32
            | (self.layer.to_bits() as u128) << 64
            | (self.object.to_bits() as u128) << 80
    }

    pub fn unpack(bits: u128) -> Self {
        Self {
            body: BodyId::from_bits(bits as u32),
            instance: ShapeInstanceId::new((bits >> 32) as u32),
            layer: ObjectLayer::from_bits((bits >> 64) as u16),
            object: ObjectRid::from_bits((bits >> 80) as u32),
        }
    }
}

// ==================== Body Settings ====================

/// Surface and solver settings of a body
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BodyMaterial {
    pub friction: f32,
    pub bounce: f32,
    pub linear_damping: f32,
    pub angular_damping: f32,
    pub ccd: bool,
    pub can_sleep: bool,
    pub lock_rotation: bool,
}

impl Default for BodyMaterial {
    fn default() -> Self {
        Self {
            friction: 1.0,
            bounce: 0.0,
            linear_damping: 0.0,
            angular_damping: 0.0,
            ccd: false,
            can_sleep: true,
            lock_rotation: false,
        }
    }
}

/// Everything needed to create an engine body.
///
/// Also what [`PhysicsSystem::remove_body`] hands back, captured from the
/// live body, so a later re-creation resumes where the simulation left off.
#[derive(Debug, Clone)]
pub struct BodySettings {
    pub object: ObjectRid,
    pub instance_id: u64,
    pub motion: MotionType,
    pub pose: Isometry3<f32>,
    pub linvel: Vector3<f32>,
    pub angvel: Vector3<f32>,
    pub object_layer: ObjectLayer,
    pub shape: Arc<ComposedShape>,
    /// Instance id of each shape slot on the object, in shape-index order
    pub instance_ids: Vec<ShapeInstanceId>,
    pub material: BodyMaterial,
    pub dynamics: BodyDynamics,
    /// `Some` makes the body a sensor area
    pub area: Option<AreaState>,
}

impl BodySettings {
    pub fn new(object: ObjectRid, motion: MotionType, shape: Arc<ComposedShape>) -> Self {
        Self {
            object,
            instance_id: 0,
            motion,
            pose: Isometry3::identity(),
            linvel: Vector3::zeros(),
            angvel: Vector3::zeros(),
            object_layer: ObjectLayer::from_bits(0),
            shape,
            instance_ids: Vec::new(),
            material: BodyMaterial::default(),
            dynamics: BodyDynamics::default(),
            area: None,
        }
    }

    pub fn is_area(&self) -> bool {
        self.area.is_some()
    }
}

// ==================== Step Output ====================

/// A sensor overlap starting or stopping, decoded from a collision event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorContact {
    pub started: bool,
    pub a: ColliderTag,
    pub b: ColliderTag,
}

impl SensorContact {
    /// Whether both contacts are between the same two shape instances
    pub fn same_pair(&self, other: &SensorContact) -> bool {
        let key = |tag: &ColliderTag| (tag.body, tag.instance);
        (key(&self.a) == key(&other.a) && key(&self.b) == key(&other.b))
            || (key(&self.a) == key(&other.b) && key(&self.b) == key(&other.a))
    }
}

/// Cancel start/stop pairs for the same shape pair within one step.
///
/// Replacing a body's colliders stops every sensor pair of the old ones and
/// starts the same pairs on the new ones; the overlap itself never ended.
pub fn coalesce_contacts(contacts: impl IntoIterator<Item = SensorContact>) -> Vec<SensorContact> {
    let mut net: Vec<SensorContact> = Vec::new();
    for contact in contacts {
        let opposite = net
            .iter()
            .position(|pending| pending.started != contact.started && pending.same_pair(&contact));
        match opposite {
            Some(index) => {
                net.remove(index);
            }
            None => net.push(contact),
        }
    }
    net
}

/// What one [`PhysicsSystem::update`] produced
#[derive(Debug, Default)]
pub struct StepReport {
    /// Bodies awake this step or last, in active-body order
    pub moved: Vec<BodyId>,
    pub sensor_contacts: Vec<SensorContact>,
}

// ==================== Engine Callbacks ====================

/// Broad/narrow-phase pair filter, called from engine threads
struct LayerHooks<'a> {
    filter: &'a LayerFilter,
}

impl LayerHooks<'_> {
    fn allows(&self, context: &rapier::PairFilterContext) -> bool {
        let (Some(c1), Some(c2)) = (
            context.colliders.get(context.collider1),
            context.colliders.get(context.collider2),
        ) else {
            return false;
        };
        let a = ColliderTag::unpack(c1.user_data);
        let b = ColliderTag::unpack(c2.user_data);
        a.body != b.body && self.filter.should_collide(a.layer, b.layer)
    }
}

impl rapier::PhysicsHooks for LayerHooks<'_> {
    fn filter_contact_pair(&self, context: &rapier::PairFilterContext) -> Option<rapier::SolverFlags> {
        self.allows(context).then_some(rapier::SolverFlags::COMPUTE_IMPULSES)
    }

    fn filter_intersection_pair(&self, context: &rapier::PairFilterContext) -> bool {
        self.allows(context)
    }
}

/// Channel-based contact listener
struct ChannelEventCollector {
    collision_events: crossbeam_channel::Sender<rapier::CollisionEvent>,
}

impl rapier::EventHandler for ChannelEventCollector {
    fn handle_collision_event(
        &self,
        _bodies: &rapier::RigidBodySet,
        _colliders: &rapier::ColliderSet,
        event: rapier::CollisionEvent,
        _contact_pair: Option<&rapier::ContactPair>,
    ) {
        if event.sensor() && self.collision_events.send(event).is_err() {
            log::trace!("Sensor event dropped, step receiver is gone: {:?}", event);
        }
    }

    fn handle_contact_force_event(
        &self,
        _dt: f32,
        _bodies: &rapier::RigidBodySet,
        _colliders: &rapier::ColliderSet,
        _contact_pair: &rapier::ContactPair,
        _total_force_magnitude: f32,
    ) {
    }
}

// ==================== Physics System ====================

/// One rapier world and the bridge records of its bodies
pub struct PhysicsSystem {
    /// Rapier physics pipeline
    pipeline: rapier::PhysicsPipeline,

    gravity: rapier::Vector<f32>,

    integration_params: rapier::IntegrationParameters,

    islands: rapier::IslandManager,

    broad_phase: rapier::DefaultBroadPhase,

    narrow_phase: rapier::NarrowPhase,

    impulse_joints: rapier::ImpulseJointSet,

    multibody_joints: rapier::MultibodyJointSet,

    ccd_solver: rapier::CCDSolver,

    query_pipeline: rapier::QueryPipeline,

    bodies: rapier::RigidBodySet,

    colliders: rapier::ColliderSet,

    /// Bridge-side body records
    table: BodyTable,

    /// Reverse layer table, shared with the space's layer mapper
    filter: Arc<LayerFilter>,

    /// Tags of colliders removed since the last step, so that their final
    /// sensor events can still be decoded
    retired: HashMap<rapier::ColliderHandle, u128>,

    /// Bodies that were awake after the last step
    awake: Vec<BodyId>,

    queries_dirty: bool,

    sleep_enabled: bool,
    max_body_pairs: usize,
    max_contact_constraints: usize,
    warned_pairs: bool,
    warned_contacts: bool,
}

impl PhysicsSystem {
    /// Create an empty system from a validated config
    pub fn new(config: &PhysicsConfig, filter: Arc<LayerFilter>) -> Self {
        let gravity = rapier::Vector::new(config.gravity[0], config.gravity[1], config.gravity[2]);

        let mut integration_params = rapier::IntegrationParameters::default();
        integration_params.num_solver_iterations =
            NonZeroUsize::new(config.solver_iterations).unwrap_or(NonZeroUsize::MIN);

        Self {
            pipeline: rapier::PhysicsPipeline::new(),
            gravity,
            integration_params,
            islands: rapier::IslandManager::new(),
            broad_phase: rapier::DefaultBroadPhase::new(),
            narrow_phase: rapier::NarrowPhase::new(),
            impulse_joints: rapier::ImpulseJointSet::new(),
            multibody_joints: rapier::MultibodyJointSet::new(),
            ccd_solver: rapier::CCDSolver::new(),
            query_pipeline: rapier::QueryPipeline::new(),
            bodies: rapier::RigidBodySet::new(),
            colliders: rapier::ColliderSet::new(),
            table: BodyTable::new(config.max_bodies, config.effective_mutex_count()),
            filter,
            retired: HashMap::new(),
            awake: Vec::new(),
            queries_dirty: false,
            sleep_enabled: config.sleep_enabled,
            max_body_pairs: config.max_body_pairs as usize,
            max_contact_constraints: config.max_contact_constraints as usize,
            warned_pairs: false,
            warned_contacts: false,
        }
    }

    pub fn gravity(&self) -> Vector3<f32> {
        self.gravity
    }

    pub fn set_gravity(&mut self, gravity: Vector3<f32>) {
        self.gravity = gravity;
    }

    pub fn table(&self) -> &BodyTable {
        &self.table
    }

    pub fn filter(&self) -> &Arc<LayerFilter> {
        &self.filter
    }

    /// Number of bodies
    pub fn body_count(&self) -> usize {
        self.table.len()
    }

    /// Number of engine colliders
    pub fn collider_count(&self) -> usize {
        self.colliders.len()
    }

    /// Number of awake dynamic bodies
    pub fn active_body_count(&self) -> usize {
        self.islands.active_dynamic_bodies().len()
    }

    pub fn contains(&self, id: BodyId) -> bool {
        self.table.contains(id)
    }

    /// Awake bodies, dynamic then kinematic, in engine order
    pub fn active_body_ids(&self) -> Vec<BodyId> {
        self.islands
            .active_dynamic_bodies()
            .iter()
            .chain(self.islands.active_kinematic_bodies())
            .filter_map(|handle| self.bodies.get(*handle))
            .map(|body| BodyId::from_bits(body.user_data as u32))
            .collect()
    }

    // ==================== Bodies ====================

    /// Create an engine body. It always starts awake.
    pub fn add_body(&mut self, settings: BodySettings) -> Result<BodyId> {
        let Self {
            table,
            bodies,
            colliders,
            sleep_enabled,
            ..
        } = self;

        let id = table.insert_with(|id| {
            let (shape, parts) = materialize_or_empty(settings.shape);
            let material = settings.material;

            let mut builder = rapier::RigidBodyBuilder::new(body_type(settings.motion))
                .position(settings.pose)
                .linvel(settings.linvel)
                .angvel(settings.angvel)
                .linear_damping(material.linear_damping)
                .angular_damping(material.angular_damping)
                .gravity_scale(settings.dynamics.gravity_scale)
                .ccd_enabled(material.ccd)
                .can_sleep(material.can_sleep && *sleep_enabled)
                .sleeping(false)
                .user_data(id.to_bits() as u128);
            if material.lock_rotation {
                builder = builder.lock_rotations();
            }
            if settings.motion == MotionType::Dynamic {
                builder = builder
                    .additional_mass_properties(shape.mass_properties(&parts, settings.dynamics.mass));
            }
            let handle = bodies.insert(builder);

            let mut record = BodyRecord::new(id, settings.object, shape);
            record.handle = handle;
            record.instance_id = settings.instance_id;
            record.object_layer = settings.object_layer;
            record.motion = settings.motion;
            record.instance_ids = settings.instance_ids;
            record.pose = settings.pose;
            record.linvel = settings.linvel;
            record.angvel = settings.angvel;
            record.dynamics = settings.dynamics;
            record.area = settings.area;
            record.colliders = insert_colliders(colliders, bodies, &record, &parts, &material);
            Ok(record)
        })?;

        self.awake.push(id);
        self.queries_dirty = true;
        log::debug!("Created body {:?}", id);
        Ok(id)
    }

    /// Destroy an engine body, returning its last live state
    pub fn remove_body(&mut self, id: BodyId) -> Option<BodySettings> {
        let record = self.table.remove(id)?;

        for handle in &record.colliders {
            if let Some(collider) = self.colliders.get(*handle) {
                self.retired.insert(*handle, collider.user_data);
            }
        }

        let mut settings = BodySettings::new(record.object, record.motion, record.shape);
        settings.instance_id = record.instance_id;
        settings.object_layer = record.object_layer;
        settings.instance_ids = record.instance_ids;
        settings.dynamics = record.dynamics;
        settings.area = record.area;
        settings.pose = record.pose;
        settings.linvel = record.linvel;
        settings.angvel = record.angvel;

        if let Some(body) = self.bodies.get(record.handle) {
            settings.pose = *body.position();
            settings.linvel = *body.linvel();
            settings.angvel = *body.angvel();
            settings.material = read_material(body, record.colliders.first().and_then(|h| self.colliders.get(*h)));
        }

        self.bodies.remove(
            record.handle,
            &mut self.islands,
            &mut self.colliders,
            &mut self.impulse_joints,
            &mut self.multibody_joints,
            true,
        );
        self.awake.retain(|awake| *awake != id);
        self.queries_dirty = true;
        log::debug!("Removed body {:?}", id);
        Some(settings)
    }

    /// Swap a body's composed shape; false when nothing changed.
    ///
    /// The instance-id list is always refreshed, since shape indices can
    /// shift without the composed shape changing.
    pub fn set_shape(
        &mut self,
        id: BodyId,
        shape: Arc<ComposedShape>,
        instance_ids: Vec<ShapeInstanceId>,
    ) -> bool {
        let mut writer = BodyWriter::lock(&self.table, &[id]);
        let Some(record) = writer.try_get_mut(id) else {
            return false;
        };
        record.instance_ids = instance_ids;
        if Arc::ptr_eq(&record.shape, &shape) {
            return false;
        }

        let material = self
            .bodies
            .get(record.handle)
            .map(|body| read_material(body, record.colliders.first().and_then(|h| self.colliders.get(*h))))
            .unwrap_or_default();

        let (shape, parts) = materialize_or_empty(shape);
        for handle in record.colliders.drain(..) {
            if let Some(collider) = self.colliders.get(handle) {
                self.retired.insert(handle, collider.user_data);
            }
            self.colliders
                .remove(handle, &mut self.islands, &mut self.bodies, true);
        }
        record.shape = shape;
        record.colliders =
            insert_colliders(&mut self.colliders, &mut self.bodies, record, &parts, &material);

        if record.motion == MotionType::Dynamic {
            if let Some(body) = self.bodies.get_mut(record.handle) {
                let props = record.shape.mass_properties(&parts, record.dynamics.mass);
                body.set_additional_mass_properties(props, true);
            }
        }

        self.queries_dirty = true;
        log::debug!("Rebuilt shape of body {:?} ({} colliders)", id, record.colliders.len());
        true
    }

    /// Push a new object layer to a body and all of its colliders
    pub fn set_object_layer(&mut self, id: BodyId, layer: ObjectLayer) -> bool {
        let mut writer = BodyWriter::lock(&self.table, &[id]);
        let Some(record) = writer.try_get_mut(id) else {
            return false;
        };
        record.object_layer = layer;
        for handle in &record.colliders {
            if let Some(collider) = self.colliders.get_mut(*handle) {
                let mut tag = ColliderTag::unpack(collider.user_data);
                tag.layer = layer;
                collider.user_data = tag.pack();
            }
        }
        if let Some(body) = self.bodies.get_mut(record.handle) {
            body.wake_up(true);
        }
        true
    }

    /// Change how a body moves
    pub fn set_motion(&mut self, id: BodyId, motion: MotionType) -> bool {
        let mut writer = BodyWriter::lock(&self.table, &[id]);
        let Some(record) = writer.try_get_mut(id) else {
            return false;
        };
        if record.motion == motion {
            return true;
        }
        record.motion = motion;
        if let Some(body) = self.bodies.get_mut(record.handle) {
            body.set_body_type(body_type(motion), true);
            if motion == MotionType::Dynamic {
                if let Ok(parts) = record.shape.materialize() {
                    let props = record.shape.mass_properties(&parts, record.dynamics.mass);
                    body.set_additional_mass_properties(props, true);
                }
            }
        }
        true
    }

    /// Update damping, friction and the other tunables of a live body
    pub fn set_params(&mut self, id: BodyId, material: &BodyMaterial, dynamics: &BodyDynamics) -> bool {
        let mut writer = BodyWriter::lock(&self.table, &[id]);
        let Some(record) = writer.try_get_mut(id) else {
            return false;
        };
        let mass_changed = record.dynamics.mass != dynamics.mass;
        record.dynamics = *dynamics;

        let Some(body) = self.bodies.get_mut(record.handle) else {
            return false;
        };
        body.set_linear_damping(material.linear_damping);
        body.set_angular_damping(material.angular_damping);
        body.set_gravity_scale(dynamics.gravity_scale, true);
        body.enable_ccd(material.ccd);
        body.lock_rotations(material.lock_rotation, true);
        if material.can_sleep != can_sleep(body) {
            *body.activation_mut() = if material.can_sleep && self.sleep_enabled {
                rapier::RigidBodyActivation::active()
            } else {
                rapier::RigidBodyActivation::cannot_sleep()
            };
        }
        if mass_changed && record.motion == MotionType::Dynamic {
            if let Ok(parts) = record.shape.materialize() {
                body.set_additional_mass_properties(
                    record.shape.mass_properties(&parts, dynamics.mass),
                    true,
                );
            }
        }

        for handle in &record.colliders {
            if let Some(collider) = self.colliders.get_mut(*handle) {
                collider.set_friction(material.friction);
                collider.set_restitution(material.bounce);
            }
        }
        true
    }

    /// Move a body. Kinematic bodies are driven to the pose over the next
    /// step; everything else is teleported.
    pub fn set_pose(&mut self, id: BodyId, pose: Isometry3<f32>, activate: bool) -> bool {
        let mut writer = BodyWriter::lock(&self.table, &[id]);
        let Some(record) = writer.try_get_mut(id) else {
            return false;
        };
        let Some(body) = self.bodies.get_mut(record.handle) else {
            return false;
        };
        if body.body_type() == rapier::RigidBodyType::KinematicPositionBased {
            body.set_next_kinematic_position(pose);
        } else {
            body.set_position(pose, activate);
        }
        record.pose = pose;
        self.queries_dirty = true;
        true
    }

    pub fn set_velocities(&mut self, id: BodyId, linvel: Vector3<f32>, angvel: Vector3<f32>) -> bool {
        let mut writer = BodyWriter::lock(&self.table, &[id]);
        let Some(record) = writer.try_get_mut(id) else {
            return false;
        };
        let Some(body) = self.bodies.get_mut(record.handle) else {
            return false;
        };
        body.set_linvel(linvel, true);
        body.set_angvel(angvel, true);
        record.linvel = linvel;
        record.angvel = angvel;
        true
    }

    pub fn apply_central_impulse(&mut self, id: BodyId, impulse: Vector3<f32>) -> bool {
        let reader = BodyReader::lock(&self.table, &[id]);
        let Some(record) = reader.try_get(id) else {
            return false;
        };
        match self.bodies.get_mut(record.handle) {
            Some(body) => {
                body.apply_impulse(impulse, true);
                true
            }
            None => false,
        }
    }

    /// Put a body to sleep or wake it up
    pub fn set_sleeping(&mut self, id: BodyId, sleeping: bool) -> bool {
        let mut writer = BodyWriter::lock(&self.table, &[id]);
        let Some(record) = writer.try_get_mut(id) else {
            return false;
        };
        let Some(body) = self.bodies.get_mut(record.handle) else {
            return false;
        };
        if sleeping {
            body.sleep();
        } else {
            body.wake_up(true);
        }
        record.sleeping = body.is_sleeping();
        true
    }

    /// Re-apply a body's per-step forces: its constant force and torque,
    /// plus `gravity` in place of the space gravity when given
    pub fn apply_forces(&mut self, id: BodyId, gravity: Option<Vector3<f32>>) -> bool {
        let reader = BodyReader::lock(&self.table, &[id]);
        let Some(record) = reader.try_get(id) else {
            return false;
        };
        let Some(body) = self.bodies.get_mut(record.handle) else {
            return false;
        };
        let dynamics = &record.dynamics;

        body.reset_forces(false);
        body.reset_torques(false);

        let mut force = dynamics.constant_force;
        match gravity {
            Some(gravity) => {
                body.set_gravity_scale(0.0, false);
                force += gravity * body.mass() * dynamics.gravity_scale;
            }
            None => body.set_gravity_scale(dynamics.gravity_scale, false),
        }
        body.add_force(force, false);
        body.add_torque(dynamics.constant_torque, false);
        true
    }

    // ==================== Simulation ====================

    /// Advance the simulation by `dt` seconds
    pub fn update(&mut self, dt: f32) -> StepReport {
        self.integration_params.dt = dt;

        let (collision_send, collision_recv) = crossbeam_channel::unbounded();
        let event_handler = ChannelEventCollector {
            collision_events: collision_send,
        };
        let hooks = LayerHooks {
            filter: &self.filter,
        };

        self.pipeline.step(
            &self.gravity,
            &self.integration_params,
            &mut self.islands,
            &mut self.broad_phase,
            &mut self.narrow_phase,
            &mut self.bodies,
            &mut self.colliders,
            &mut self.impulse_joints,
            &mut self.multibody_joints,
            &mut self.ccd_solver,
            None,
            &hooks,
            &event_handler,
        );

        self.query_pipeline.update(&self.colliders);
        self.queries_dirty = false;
        self.check_capacity();

        let sensor_contacts = coalesce_contacts(
            collision_recv
                .try_iter()
                .filter_map(|event| self.decode_sensor_event(event)),
        );
        self.retired.clear();

        StepReport {
            moved: self.sync_records(),
            sensor_contacts,
        }
    }

    /// Bring the query structures up to date with edits made since the
    /// last step
    pub fn refresh_queries(&mut self) {
        if self.queries_dirty {
            self.bodies
                .propagate_modified_body_positions_to_colliders(&mut self.colliders);
            self.query_pipeline.update(&self.colliders);
            self.queries_dirty = false;
        }
    }

    pub(crate) fn query_pipeline(&self) -> &rapier::QueryPipeline {
        &self.query_pipeline
    }

    pub(crate) fn bodies(&self) -> &rapier::RigidBodySet {
        &self.bodies
    }

    pub(crate) fn colliders(&self) -> &rapier::ColliderSet {
        &self.colliders
    }

    fn decode_sensor_event(&self, event: rapier::CollisionEvent) -> Option<SensorContact> {
        let (h1, h2, started) = match event {
            rapier::CollisionEvent::Started(h1, h2, _) => (h1, h2, true),
            rapier::CollisionEvent::Stopped(h1, h2, _) => (h1, h2, false),
        };
        let tag = |handle: rapier::ColliderHandle| {
            self.colliders
                .get(handle)
                .map(|collider| collider.user_data)
                .or_else(|| self.retired.get(&handle).copied())
                .map(ColliderTag::unpack)
        };
        Some(SensorContact {
            started,
            a: tag(h1)?,
            b: tag(h2)?,
        })
    }

    /// Mirror live engine state into the records of bodies that moved
    fn sync_records(&mut self) -> Vec<BodyId> {
        let active = self.active_body_ids();
        let mut touched = active.clone();
        for id in &self.awake {
            if !touched.contains(id) {
                touched.push(*id);
            }
        }

        let mut writer = BodyWriter::lock(&self.table, &touched);
        let mut moved = Vec::with_capacity(touched.len());
        for id in &touched {
            let Some(record) = writer.try_get_mut(*id) else {
                continue;
            };
            let Some(body) = self.bodies.get(record.handle) else {
                continue;
            };
            record.pose = *body.position();
            record.linvel = *body.linvel();
            record.angvel = *body.angvel();
            record.sleeping = body.is_sleeping();
            moved.push(*id);
        }
        drop(writer);

        self.awake = active;
        moved
    }

    fn check_capacity(&mut self) {
        if self.warned_pairs && self.warned_contacts {
            return;
        }
        let mut pairs = 0;
        let mut points = 0;
        for pair in self.narrow_phase.contact_pairs() {
            if pair.has_any_active_contact {
                pairs += 1;
                points += pair
                    .manifolds
                    .iter()
                    .map(|manifold| manifold.points.len())
                    .sum::<usize>();
            }
        }
        if pairs > self.max_body_pairs && !self.warned_pairs {
            log::warn!(
                "Contact pair count {} exceeds the configured maximum of {}",
                pairs,
                self.max_body_pairs
            );
            self.warned_pairs = true;
        }
        if points > self.max_contact_constraints && !self.warned_contacts {
            log::warn!(
                "Contact point count {} exceeds the configured maximum of {}",
                points,
                self.max_contact_constraints
            );
            self.warned_contacts = true;
        }
    }
}

impl std::fmt::Debug for PhysicsSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicsSystem")
            .field("bodies", &self.table.len())
            .field("colliders", &self.colliders.len())
            .field("gravity", &self.gravity)
            .finish()
    }
}

fn body_type(motion: MotionType) -> rapier::RigidBodyType {
    match motion {
        MotionType::Static => rapier::RigidBodyType::Fixed,
        MotionType::Kinematic => rapier::RigidBodyType::KinematicPositionBased,
        MotionType::Dynamic => rapier::RigidBodyType::Dynamic,
    }
}

fn can_sleep(body: &rapier::RigidBody) -> bool {
    body.activation().normalized_linear_threshold >= 0.0
}

fn read_material(body: &rapier::RigidBody, collider: Option<&rapier::Collider>) -> BodyMaterial {
    let defaults = BodyMaterial::default();
    BodyMaterial {
        friction: collider.map_or(defaults.friction, |c| c.friction()),
        bounce: collider.map_or(defaults.bounce, |c| c.restitution()),
        linear_damping: body.linear_damping(),
        angular_damping: body.angular_damping(),
        ccd: body.is_ccd_enabled(),
        can_sleep: can_sleep(body),
        lock_rotation: body.locked_axes().contains(rapier::LockedAxes::ROTATION_LOCKED),
    }
}

fn materialize_or_empty(shape: Arc<ComposedShape>) -> (Arc<ComposedShape>, Vec<ColliderPart>) {
    match shape.materialize() {
        Ok(parts) => (shape, parts),
        Err(err) => {
            log::warn!("Failed to build colliders, using an empty shape: {}", err);
            (Arc::new(ComposedShape::empty()), Vec::new())
        }
    }
}

fn insert_colliders(
    colliders: &mut rapier::ColliderSet,
    bodies: &mut rapier::RigidBodySet,
    record: &BodyRecord,
    parts: &[ColliderPart],
    material: &BodyMaterial,
) -> Vec<rapier::ColliderHandle> {
    let is_area = record.is_area();
    parts
        .iter()
        .map(|part| {
            let tag = ColliderTag {
                body: record.id,
                instance: part.instance,
                layer: record.object_layer,
                object: record.object,
            };
            let mut builder = rapier::ColliderBuilder::new(part.shape.clone())
                .position(part.position)
                .density(0.0)
                .friction(material.friction)
                .restitution(material.bounce)
                .active_hooks(
                    rapier::ActiveHooks::FILTER_CONTACT_PAIRS
                        | rapier::ActiveHooks::FILTER_INTERSECTION_PAIR,
                )
                .user_data(tag.pack());
            if is_area {
                builder = builder
                    .sensor(true)
                    .active_events(rapier::ActiveEvents::COLLISION_EVENTS)
                    .active_collision_types(rapier::ActiveCollisionTypes::all());
            }
            colliders.insert_with_parent(builder, record.handle, bodies)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{BroadPhaseCategory, LayerMapper};
    use crate::shape::{Shape, ShapeData};
    use approx::assert_relative_eq;
    use tether_core::RidOwner;

    fn sphere_shape(radius: f32) -> Arc<ComposedShape> {
        use crate::composition::{compose, ShapeInstance};
        use crate::math::Transform3;

        let mut shapes = RidOwner::new("Shape");
        let rid = shapes.insert(Shape::new(ShapeData::Sphere { radius }).unwrap());
        let instance = ShapeInstance::new(ShapeInstanceId::new(0), rid, &Transform3::identity(), false);
        Arc::new(compose(&[instance], &mut shapes, None, &Vector3::repeat(1.0)).unwrap())
    }

    fn system() -> (PhysicsSystem, LayerMapper) {
        let mapper = LayerMapper::new();
        let system = PhysicsSystem::new(&PhysicsConfig::default(), mapper.filter());
        (system, mapper)
    }

    fn dynamic_settings(mapper: &mut LayerMapper, y: f32) -> BodySettings {
        let mut settings = BodySettings::new(ObjectRid::new(1, 0), MotionType::Dynamic, sphere_shape(0.5));
        settings.pose = Isometry3::translation(0.0, y, 0.0);
        settings.object_layer = mapper.encode(BroadPhaseCategory::Moving, 1, 1).unwrap();
        settings.instance_ids = vec![ShapeInstanceId::new(0)];
        settings
    }

    #[test]
    fn test_collider_tag_roundtrip() {
        let tag = ColliderTag {
            body: BodyId::from_bits(0x0300_0042),
            instance: ShapeInstanceId::new(7),
            layer: ObjectLayer::from_bits(0x2abc),
            object: ObjectRid::new(99, 3),
        };
        assert_eq!(ColliderTag::unpack(tag.pack()), tag);
    }

    fn tag(body: u32, instance: u32) -> ColliderTag {
        ColliderTag {
            body: BodyId::from_bits(body),
            instance: ShapeInstanceId::new(instance),
            layer: ObjectLayer::from_bits(1),
            object: ObjectRid::new(body, 0),
        }
    }

    fn contact(started: bool, a: ColliderTag, b: ColliderTag) -> SensorContact {
        SensorContact { started, a, b }
    }

    #[test]
    fn test_coalesce_cancels_rebuilt_pair() {
        let (area, ball, other) = (tag(1, 0), tag(2, 0), tag(3, 0));
        let contacts = vec![
            contact(false, area, ball),
            contact(true, ball, area),
            contact(true, area, other),
        ];
        assert_eq!(coalesce_contacts(contacts), vec![contact(true, area, other)]);

        // A distinct instance on the same body is a different pair.
        let moved = vec![contact(false, area, ball), contact(true, area, tag(2, 1))];
        assert_eq!(coalesce_contacts(moved.clone()), moved);

        // Repeated events of one kind are kept for the overlap refcount.
        let twice = vec![contact(true, area, ball), contact(true, area, ball)];
        assert_eq!(coalesce_contacts(twice.clone()), twice);
    }

    #[test]
    fn test_sensor_event_without_receiver_is_dropped() {
        let (sender, receiver) = crossbeam_channel::unbounded();
        drop(receiver);
        let collector = ChannelEventCollector { collision_events: sender };
        let event = rapier::CollisionEvent::Started(
            rapier::ColliderHandle::from_raw_parts(0, 0),
            rapier::ColliderHandle::from_raw_parts(1, 0),
            rapier::CollisionEventFlags::SENSOR,
        );
        let bodies = rapier::RigidBodySet::new();
        let colliders = rapier::ColliderSet::new();
        rapier::EventHandler::handle_collision_event(&collector, &bodies, &colliders, event, None);
    }

    #[test]
    fn test_add_and_remove_body() {
        let (mut system, mut mapper) = system();
        let settings = dynamic_settings(&mut mapper, 3.0);
        let id = system.add_body(settings).unwrap();

        assert_eq!(system.body_count(), 1);
        assert_eq!(system.collider_count(), 1);
        assert!(system.contains(id));

        let snapshot = system.remove_body(id).unwrap();
        assert_relative_eq!(snapshot.pose.translation.vector.y, 3.0);
        assert_eq!(system.body_count(), 0);
        assert_eq!(system.collider_count(), 0);
        assert!(system.remove_body(id).is_none());
    }

    #[test]
    fn test_body_limit() {
        let mapper = LayerMapper::new();
        let config = PhysicsConfig::default().with_max_bodies(1);
        let mut system = PhysicsSystem::new(&config, mapper.filter());
        let mut mapper = mapper;

        system.add_body(dynamic_settings(&mut mapper, 0.0)).unwrap();
        let err = system.add_body(dynamic_settings(&mut mapper, 2.0));
        assert!(matches!(err, Err(crate::error::PhysicsError::BodyLimitReached { limit: 1 })));
        assert_eq!(system.body_count(), 1);
    }

    #[test]
    fn test_remove_snapshot_follows_simulation() {
        let (mut system, mut mapper) = system();
        let id = system.add_body(dynamic_settings(&mut mapper, 10.0)).unwrap();
        for _ in 0..30 {
            system.update(1.0 / 60.0);
        }
        let snapshot = system.remove_body(id).unwrap();
        assert!(snapshot.pose.translation.vector.y < 10.0);
        assert!(snapshot.linvel.y < 0.0);
    }

    #[test]
    fn test_empty_shape_has_no_colliders() {
        let (mut system, mut mapper) = system();
        let mut settings = dynamic_settings(&mut mapper, 0.0);
        settings.shape = Arc::new(ComposedShape::empty());
        let id = system.add_body(settings).unwrap();

        assert_eq!(system.collider_count(), 0);
        system.update(1.0 / 60.0);
        assert!(system.contains(id));
    }

    #[test]
    fn test_set_shape_same_handle_is_noop() {
        let (mut system, mut mapper) = system();
        let settings = dynamic_settings(&mut mapper, 0.0);
        let shape = Arc::clone(&settings.shape);
        let id = system.add_body(settings).unwrap();

        assert!(!system.set_shape(id, Arc::clone(&shape), vec![ShapeInstanceId::new(0)]));
        assert!(system.set_shape(id, sphere_shape(2.0), vec![ShapeInstanceId::new(0)]));
        assert!(system.set_shape(id, Arc::new(ComposedShape::empty()), Vec::new()));
        assert_eq!(system.collider_count(), 0);
    }

    #[test]
    fn test_moved_bodies_reported() {
        let (mut system, mut mapper) = system();
        let id = system.add_body(dynamic_settings(&mut mapper, 5.0)).unwrap();
        let report = system.update(1.0 / 60.0);
        assert_eq!(report.moved, vec![id]);

        let reader = BodyReader::lock(system.table(), &[id]);
        let record = reader.try_get(id).unwrap();
        assert!(record.pose.translation.vector.y < 5.0);
    }

    #[test]
    fn test_layer_filter_blocks_contacts() {
        let (mut system, mut mapper) = system();

        let mut floor = BodySettings::new(ObjectRid::new(2, 0), MotionType::Static, sphere_shape(1.0));
        floor.object_layer = mapper.encode(BroadPhaseCategory::Static, 4, 4).unwrap();
        system.add_body(floor).unwrap();

        let ball = system.add_body(dynamic_settings(&mut mapper, 2.0)).unwrap();
        for _ in 0..120 {
            system.update(1.0 / 60.0);
        }

        let reader = BodyReader::lock(system.table(), &[ball]);
        // Layers 1 and 4 never meet, so the ball falls through the floor.
        assert!(reader.try_get(ball).unwrap().pose.translation.vector.y < -1.0);
    }
}
