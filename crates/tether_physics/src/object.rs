//! Collision objects: bodies and areas
//!
//! A [`CollisionObject`] is the host-facing side of one engine body. It owns
//! the shape list, the transform, the collision layer and mask, and the
//! per-kind parameters. While it is not in a space every edit lands in these
//! buffered fields; once attached, the space pushes edits straight to the
//! engine body and the buffered pose goes stale until the object detaches
//! again and absorbs the live state.

use crate::area::{AreaState, GravityOverride};
use crate::body_table::{BodyDynamics, BodyId, MotionType};
use crate::composition::{compose_or_empty, reuse_or_replace, ComposedShape, ShapeInstance, ShapeInstanceId};
use crate::error::{PhysicsError, Result};
use crate::events::{BodyState, MonitorEvent};
use crate::layers::BroadPhaseCategory;
use crate::math::Transform3;
use crate::shape::{Shape, ShapeRid};
use crate::space::SpaceRid;
use crate::system::{BodyMaterial, BodySettings};
use rapier3d::na::{Isometry3, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tether_core::{Rid, RidOwner};

/// Handle of a collision object
pub type ObjectRid = Rid<CollisionObject>;

/// Called after a step with the body's new state
pub type StateCallback = Box<dyn FnMut(&BodyState) + Send>;

/// Called for every monitored enter/exit of an area
pub type MonitorCallback = Box<dyn FnMut(&MonitorEvent) + Send>;

/// How a body moves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BodyMode {
    Static,
    Kinematic,
    #[default]
    Rigid,
    /// Rigid with rotation locked
    RigidLinear,
}

impl BodyMode {
    pub fn motion(self) -> MotionType {
        match self {
            Self::Static => MotionType::Static,
            Self::Kinematic => MotionType::Kinematic,
            Self::Rigid | Self::RigidLinear => MotionType::Dynamic,
        }
    }

    pub fn category(self) -> BroadPhaseCategory {
        match self {
            Self::Static => BroadPhaseCategory::Static,
            _ => BroadPhaseCategory::Moving,
        }
    }
}

/// Physical parameters of a body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BodyParams {
    pub mass: f32,
    /// Local center of mass; `None` keeps the shape's own
    pub center_of_mass: Option<[f32; 3]>,
    pub gravity_scale: f32,
    pub linear_damping: f32,
    pub angular_damping: f32,
    pub friction: f32,
    pub bounce: f32,
    pub ccd: bool,
    pub can_sleep: bool,
    pub constant_force: [f32; 3],
    pub constant_torque: [f32; 3],
}

impl Default for BodyParams {
    fn default() -> Self {
        Self {
            mass: 1.0,
            center_of_mass: None,
            gravity_scale: 1.0,
            linear_damping: 0.0,
            angular_damping: 0.0,
            friction: 1.0,
            bounce: 0.0,
            ccd: false,
            can_sleep: true,
            constant_force: [0.0; 3],
            constant_torque: [0.0; 3],
        }
    }
}

impl BodyParams {
    pub fn material(&self, mode: BodyMode) -> BodyMaterial {
        BodyMaterial {
            friction: self.friction,
            bounce: self.bounce,
            linear_damping: self.linear_damping,
            angular_damping: self.angular_damping,
            ccd: self.ccd,
            can_sleep: self.can_sleep,
            lock_rotation: mode == BodyMode::RigidLinear,
        }
    }

    pub fn dynamics(&self) -> BodyDynamics {
        BodyDynamics {
            mass: self.mass,
            gravity_scale: self.gravity_scale,
            constant_force: Vector3::from(self.constant_force),
            constant_torque: Vector3::from(self.constant_torque),
        }
    }
}

/// Parameters of an area
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AreaParams {
    pub monitoring: bool,
    pub gravity: GravityOverride,
}

/// Body or area
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Body(BodyMode),
    Area,
}

/// A body or area as seen by the host
pub struct CollisionObject {
    kind: ObjectKind,
    instance_id: u64,
    shapes: Vec<ShapeInstance>,
    next_instance: u32,
    transform: Transform3,
    collision_layer: u32,
    collision_mask: u32,
    space: Option<SpaceRid>,
    body: BodyId,
    composed: Arc<ComposedShape>,

    // Buffered while detached
    linear_velocity: Vector3<f32>,
    angular_velocity: Vector3<f32>,
    area_state: Option<AreaState>,

    body_params: BodyParams,
    area_params: AreaParams,
    state_callback: Option<StateCallback>,
    monitor_callback: Option<MonitorCallback>,
}

impl CollisionObject {
    fn new(kind: ObjectKind, instance_id: u64) -> Self {
        Self {
            kind,
            instance_id,
            shapes: Vec::new(),
            next_instance: 0,
            transform: Transform3::identity(),
            collision_layer: 1,
            collision_mask: 1,
            space: None,
            body: BodyId::INVALID,
            composed: Arc::new(ComposedShape::empty()),
            linear_velocity: Vector3::zeros(),
            angular_velocity: Vector3::zeros(),
            area_state: None,
            body_params: BodyParams::default(),
            area_params: AreaParams::default(),
            state_callback: None,
            monitor_callback: None,
        }
    }

    pub fn new_body(mode: BodyMode, instance_id: u64) -> Self {
        Self::new(ObjectKind::Body(mode), instance_id)
    }

    pub fn new_area(instance_id: u64) -> Self {
        Self::new(ObjectKind::Area, instance_id)
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn is_area(&self) -> bool {
        self.kind == ObjectKind::Area
    }

    /// Body mode; areas move like kinematic bodies
    pub fn mode(&self) -> BodyMode {
        match self.kind {
            ObjectKind::Body(mode) => mode,
            ObjectKind::Area => BodyMode::Kinematic,
        }
    }

    /// Change a body's mode. Ignored for areas.
    pub fn set_mode(&mut self, mode: BodyMode) {
        if let ObjectKind::Body(current) = &mut self.kind {
            *current = mode;
        }
    }

    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    pub fn space(&self) -> Option<SpaceRid> {
        self.space
    }

    /// Engine body, `BodyId::INVALID` while detached
    pub fn body(&self) -> BodyId {
        self.body
    }

    pub fn is_attached(&self) -> bool {
        self.space.is_some()
    }

    pub fn category(&self) -> BroadPhaseCategory {
        self.mode().category()
    }

    // ==================== Shapes ====================

    pub fn shapes(&self) -> &[ShapeInstance] {
        &self.shapes
    }

    pub fn shape_count(&self) -> usize {
        self.shapes.len()
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index < self.shapes.len() {
            Ok(())
        } else {
            Err(PhysicsError::ShapeIndexOutOfBounds {
                index,
                count: self.shapes.len(),
            })
        }
    }

    pub fn shape(&self, index: usize) -> Result<&ShapeInstance> {
        self.check_index(index)?;
        Ok(&self.shapes[index])
    }

    /// Append a shape instance, returning its new index
    pub fn add_shape(&mut self, shape: ShapeRid, transform: &Transform3, disabled: bool) -> usize {
        let id = ShapeInstanceId::new(self.next_instance);
        self.next_instance += 1;
        self.shapes.push(ShapeInstance::new(id, shape, transform, disabled));
        self.shapes.len() - 1
    }

    pub fn remove_shape(&mut self, index: usize) -> Result<ShapeInstance> {
        self.check_index(index)?;
        Ok(self.shapes.remove(index))
    }

    /// Point a slot at another shape; returns the shape it replaced
    pub fn set_shape(&mut self, index: usize, shape: ShapeRid) -> Result<ShapeRid> {
        self.check_index(index)?;
        Ok(std::mem::replace(&mut self.shapes[index].shape, shape))
    }

    pub fn set_shape_transform(&mut self, index: usize, transform: &Transform3) -> Result<()> {
        self.check_index(index)?;
        self.shapes[index].set_transform(transform);
        Ok(())
    }

    pub fn set_shape_disabled(&mut self, index: usize, disabled: bool) -> Result<()> {
        self.check_index(index)?;
        self.shapes[index].disabled = disabled;
        Ok(())
    }

    /// Remove every instance of `shape`, returning how many were removed
    pub fn remove_shape_rid(&mut self, shape: ShapeRid) -> usize {
        let before = self.shapes.len();
        self.shapes.retain(|instance| instance.shape != shape);
        before - self.shapes.len()
    }

    pub fn clear_shapes(&mut self) -> Vec<ShapeInstance> {
        std::mem::take(&mut self.shapes)
    }

    pub fn instance_ids(&self) -> Vec<ShapeInstanceId> {
        self.shapes.iter().map(|instance| instance.id).collect()
    }

    /// Shape index of an instance id
    pub fn find_shape(&self, id: ShapeInstanceId) -> Option<usize> {
        self.shapes.iter().position(|instance| instance.id == id)
    }

    pub fn composed(&self) -> &Arc<ComposedShape> {
        &self.composed
    }

    /// Rebuild the composed shape from the current shape list and scale.
    ///
    /// Returns true if the result differs from the previous one; an
    /// unchanged rebuild keeps the old handle.
    pub fn rebuild_shape(&mut self, shapes: &mut RidOwner<Shape>) -> bool {
        let (_, scale) = self.transform.decompose();
        let center_of_mass = match self.kind {
            ObjectKind::Body(_) => self.body_params.center_of_mass.map(Vector3::from),
            ObjectKind::Area => None,
        };
        let next = compose_or_empty(&self.shapes, shapes, center_of_mass, &scale);
        let composed = reuse_or_replace(&self.composed, next);
        let changed = !Arc::ptr_eq(&composed, &self.composed);
        self.composed = composed;
        changed
    }

    // ==================== Transform and layers ====================

    /// Buffered transform; stale while attached
    pub fn transform(&self) -> &Transform3 {
        &self.transform
    }

    /// Set the buffered transform; returns true if its scale changed
    pub fn set_transform(&mut self, transform: Transform3) -> bool {
        let (_, old_scale) = self.transform.decompose();
        let (_, new_scale) = transform.decompose();
        self.transform = transform;
        old_scale != new_scale
    }

    pub fn scale(&self) -> Vector3<f32> {
        self.transform.decompose().1
    }

    pub fn collision_layer(&self) -> u32 {
        self.collision_layer
    }

    pub fn collision_mask(&self) -> u32 {
        self.collision_mask
    }

    pub fn set_collision_layer(&mut self, layer: u32) {
        self.collision_layer = layer;
    }

    pub fn set_collision_mask(&mut self, mask: u32) {
        self.collision_mask = mask;
    }

    // ==================== Parameters ====================

    pub fn linear_velocity(&self) -> Vector3<f32> {
        self.linear_velocity
    }

    pub fn angular_velocity(&self) -> Vector3<f32> {
        self.angular_velocity
    }

    pub fn set_velocities(&mut self, linear: Vector3<f32>, angular: Vector3<f32>) {
        self.linear_velocity = linear;
        self.angular_velocity = angular;
    }

    pub fn body_params(&self) -> &BodyParams {
        &self.body_params
    }

    pub fn body_params_mut(&mut self) -> &mut BodyParams {
        &mut self.body_params
    }

    pub fn area_params(&self) -> &AreaParams {
        &self.area_params
    }

    pub fn area_params_mut(&mut self) -> &mut AreaParams {
        &mut self.area_params
    }

    pub fn set_state_callback(&mut self, callback: Option<StateCallback>) {
        self.state_callback = callback;
    }

    pub fn set_monitor_callback(&mut self, callback: Option<MonitorCallback>) {
        self.monitor_callback = callback;
    }

    pub fn has_state_callback(&self) -> bool {
        self.state_callback.is_some()
    }

    pub(crate) fn notify_state(&mut self, state: &BodyState) {
        if let Some(callback) = self.state_callback.as_mut() {
            callback(state);
        }
    }

    pub(crate) fn notify_monitor(&mut self, event: &MonitorEvent) {
        if let Some(callback) = self.monitor_callback.as_mut() {
            callback(event);
        }
    }

    // ==================== Attachment ====================

    /// Creation settings for the engine body, from the buffered state
    pub(crate) fn body_settings(&self, rid: ObjectRid) -> BodySettings {
        let (pose, _) = self.transform.decompose();
        let mode = self.mode();

        let mut settings = BodySettings::new(rid, mode.motion(), Arc::clone(&self.composed));
        settings.instance_id = self.instance_id;
        settings.pose = pose;
        settings.linvel = self.linear_velocity;
        settings.angvel = self.angular_velocity;
        settings.instance_ids = self.instance_ids();
        settings.material = self.body_params.material(mode);
        settings.dynamics = self.body_params.dynamics();
        if self.is_area() {
            let mut state = self.area_state.clone().unwrap_or_default();
            state.monitoring = self.area_params.monitoring;
            state.gravity = self.area_params.gravity;
            settings.area = Some(state);
        }
        settings
    }

    pub(crate) fn attached(&mut self, space: SpaceRid, body: BodyId) {
        self.space = Some(space);
        self.body = body;
    }

    /// Take back the live state captured when the engine body was removed
    pub(crate) fn detached(&mut self, settings: Option<BodySettings>) {
        self.space = None;
        self.body = BodyId::INVALID;
        if let Some(settings) = settings {
            let scale = self.scale();
            self.transform = Transform3::from_parts(&settings.pose, &scale);
            self.linear_velocity = settings.linvel;
            self.angular_velocity = settings.angvel;
            // Overlaps do not survive a trip through another space.
            self.area_state = settings.area.map(|mut state| {
                state.clear();
                state
            });
        }
    }

    /// Pose the body would be created at
    pub fn pose(&self) -> Isometry3<f32> {
        self.transform.decompose().0
    }
}

impl fmt::Debug for CollisionObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollisionObject")
            .field("kind", &self.kind)
            .field("instance_id", &self.instance_id)
            .field("shapes", &self.shapes.len())
            .field("space", &self.space)
            .field("body", &self.body)
            .finish()
    }
}
