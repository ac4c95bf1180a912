//! Physics space - one engine world and the objects attached to it
//!
//! A [`PhysicsSpace`] owns the engine system, the layer mapper, the
//! notification queue and a per-step scratch arena. Stepping and every
//! structural change take `&mut self`, so a step can never overlap an
//! add/remove on the same space.
//!
//! One step runs in three phases:
//!
//! 1. pre-step: for every active body, re-apply its constant force and
//!    torque and its area-adjusted gravity, in active-body order
//! 2. the engine step
//! 3. post-step: route sensor contacts into area overlap counts and queue
//!    body-state notifications, bodies ahead of areas

use crate::area::{combine_gravity, GravityMode, GravityOverride, OverlapKey};
use crate::body_access::{BodyReader, BodyWriter};
use crate::body_table::{BodyId, MotionType};
use crate::config::PhysicsConfig;
use crate::error::{PhysicsError, Result};
use crate::events::{BodyState, MonitorEvent, MonitorEventKind, Notification, NotificationQueue};
use crate::layers::{LayerMapper, ObjectLayer};
use crate::object::{CollisionObject, ObjectRid};
use crate::query::SpaceQuery;
use crate::system::{ColliderTag, PhysicsSystem, SensorContact};
use bumpalo::Bump;
use rapier3d::na::{Isometry3, Vector3};
use std::collections::BTreeSet;
use tether_core::{Rid, RidOwner};

/// Handle of a physics space
pub type SpaceRid = Rid<PhysicsSpace>;

/// One simulated world
pub struct PhysicsSpace {
    rid: SpaceRid,
    config: PhysicsConfig,
    system: PhysicsSystem,
    mapper: LayerMapper,
    /// Scratch memory for one step; reset when the step ends
    arena: Bump,
    active: bool,
    notifications: NotificationQueue,
    objects: BTreeSet<ObjectRid>,
    /// Bodies that are areas
    areas: Vec<BodyId>,
}

impl PhysicsSpace {
    /// Create a space. The config is validated and read once, here.
    pub fn new(rid: SpaceRid, config: PhysicsConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::with_validated(rid, config))
    }

    pub(crate) fn with_validated(rid: SpaceRid, config: PhysicsConfig) -> Self {
        let mapper = LayerMapper::new();
        let system = PhysicsSystem::new(&config, mapper.filter());
        log::debug!("Created physics space {:?}", rid);
        Self {
            rid,
            arena: Bump::with_capacity(config.temp_arena_bytes),
            config,
            system,
            mapper,
            active: true,
            notifications: NotificationQueue::new(),
            objects: BTreeSet::new(),
            areas: Vec::new(),
        }
    }

    pub fn rid(&self) -> SpaceRid {
        self.rid
    }

    pub fn config(&self) -> &PhysicsConfig {
        &self.config
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    pub fn gravity(&self) -> Vector3<f32> {
        self.system.gravity()
    }

    pub fn set_gravity(&mut self, gravity: Vector3<f32>) {
        self.system.set_gravity(gravity);
    }

    pub fn system(&self) -> &PhysicsSystem {
        &self.system
    }

    pub fn layer_mapper(&self) -> &LayerMapper {
        &self.mapper
    }

    // ==================== Stats ====================

    pub fn body_count(&self) -> usize {
        self.system.body_count()
    }

    pub fn active_body_count(&self) -> usize {
        self.system.active_body_count()
    }

    pub fn layer_code_count(&self) -> usize {
        self.mapper.code_count()
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn contains(&self, object: ObjectRid) -> bool {
        self.objects.contains(&object)
    }

    /// Objects attached to this space
    pub fn objects(&self) -> impl Iterator<Item = ObjectRid> + '_ {
        self.objects.iter().copied()
    }

    // ==================== Attachment ====================

    fn encode_layer(&mut self, object: &CollisionObject) -> Result<ObjectLayer> {
        self.mapper.encode(
            object.category(),
            object.collision_layer(),
            object.collision_mask(),
        )
    }

    /// Create the engine body for `object`.
    ///
    /// On failure the object stays detached.
    pub fn add_object(&mut self, rid: ObjectRid, object: &mut CollisionObject) -> Result<BodyId> {
        let layer = self.encode_layer(object)?;
        let mut settings = object.body_settings(rid);
        settings.object_layer = layer;

        let is_area = settings.is_area();
        let body = self.system.add_body(settings)?;
        if is_area {
            self.areas.push(body);
        }
        self.objects.insert(rid);
        object.attached(self.rid, body);
        log::debug!("Attached {:?} to space {:?} as body {:?}", rid, self.rid, body);
        Ok(body)
    }

    /// Destroy the engine body of `object`, handing its live state back.
    ///
    /// Areas that overlapped it queue exit events.
    pub fn remove_object(&mut self, rid: ObjectRid, object: &mut CollisionObject) -> Result<()> {
        if object.space() != Some(self.rid) || !self.objects.remove(&rid) {
            return Err(PhysicsError::ObjectNotInSpace(rid));
        }
        let body = object.body();
        self.purge_overlaps(body);
        self.areas.retain(|area| *area != body);
        self.notifications.forget(rid);

        let settings = self.system.remove_body(body);
        object.detached(settings);
        log::debug!("Detached {:?} from space {:?}", rid, self.rid);
        Ok(())
    }

    /// Queue exits for every area overlap involving `removed`
    fn purge_overlaps(&mut self, removed: BodyId) {
        let mut ids = self.areas.clone();
        ids.push(removed);
        let mut writer = BodyWriter::lock(self.system.table(), &ids);

        let Some(other) = writer.try_get(removed).map(|record| {
            (
                record.object,
                record.instance_id,
                record.instance_ids.clone(),
                record.is_area(),
            )
        }) else {
            return;
        };
        let (other_object, other_instance_id, other_instance_ids, other_is_area) = other;

        for area_id in &self.areas {
            if *area_id == removed {
                continue;
            }
            let Some(area) = writer.try_get_mut(*area_id) else {
                continue;
            };
            let area_object = area.object;
            let self_shapes = area.instance_ids.clone();
            let Some(state) = area.area.as_mut() else {
                continue;
            };
            let keys = state.remove_body(removed);
            if !state.monitoring {
                continue;
            }
            for key in keys {
                self.notifications.push(Notification::AreaMonitor {
                    area: area_object,
                    event: MonitorEvent {
                        kind: MonitorEventKind::Exited,
                        other: other_object,
                        other_instance_id,
                        other_shape: other_instance_ids.iter().position(|id| *id == key.other_shape),
                        self_shape: self_shapes.iter().position(|id| *id == key.self_shape),
                        other_is_area,
                    },
                });
            }
        }
    }

    // ==================== Object Updates ====================

    /// Push the object's composed shape; false if the engine shape was
    /// already the same
    pub fn update_shape(&mut self, object: &CollisionObject) -> bool {
        self.system
            .set_shape(object.body(), std::sync::Arc::clone(object.composed()), object.instance_ids())
    }

    /// Re-encode and push the object's layer and mask
    pub fn update_layer(&mut self, object: &CollisionObject) -> Result<()> {
        let layer = self.encode_layer(object)?;
        self.system.set_object_layer(object.body(), layer);
        Ok(())
    }

    /// Push a changed body mode: motion type, layer category and parameters
    pub fn update_mode(&mut self, object: &CollisionObject) -> Result<()> {
        let body = object.body();
        self.system.set_motion(body, object.mode().motion());
        self.update_layer(object)?;
        self.update_params(object);
        Ok(())
    }

    /// Push mass, damping and the other body parameters
    pub fn update_params(&mut self, object: &CollisionObject) {
        let params = object.body_params();
        self.system
            .set_params(object.body(), &params.material(object.mode()), &params.dynamics());
    }

    /// Push area monitoring and gravity settings
    pub fn update_area(&mut self, object: &CollisionObject) {
        let body = object.body();
        let mut writer = BodyWriter::lock(self.system.table(), &[body]);
        if let Some(state) = writer.try_get_mut(body).and_then(|record| record.area.as_mut()) {
            state.monitoring = object.area_params().monitoring;
            state.gravity = object.area_params().gravity;
        }
    }

    /// Authoritative pose correction; does not wake the body
    pub fn set_pose(&mut self, body: BodyId, pose: Isometry3<f32>) -> bool {
        self.system.set_pose(body, pose, false)
    }

    pub fn set_velocities(&mut self, body: BodyId, linear: Vector3<f32>, angular: Vector3<f32>) -> bool {
        self.system.set_velocities(body, linear, angular)
    }

    pub fn apply_central_impulse(&mut self, body: BodyId, impulse: Vector3<f32>) -> bool {
        self.system.apply_central_impulse(body, impulse)
    }

    pub fn set_sleeping(&mut self, body: BodyId, sleeping: bool) -> bool {
        self.system.set_sleeping(body, sleeping)
    }

    /// Current state of a body, `None` if it is gone
    pub fn body_state(&self, body: BodyId) -> Option<BodyState> {
        let reader = BodyReader::lock(self.system.table(), &[body]);
        reader.try_get(body).map(|record| BodyState {
            transform: record.pose,
            linear_velocity: record.linvel,
            angular_velocity: record.angvel,
            sleeping: record.sleeping,
        })
    }

    /// Objects currently inside an area
    pub fn area_overlaps(&self, area: BodyId) -> Vec<ObjectRid> {
        let reader = BodyReader::lock(self.system.table(), &[area]);
        let Some(bodies) = reader
            .try_get(area)
            .and_then(|record| record.area.as_ref())
            .map(|state| state.overlapping_bodies())
        else {
            return Vec::new();
        };
        drop(reader);

        let reader = BodyReader::lock(self.system.table(), &bodies);
        bodies
            .iter()
            .filter_map(|id| reader.try_get(*id))
            .map(|record| record.object)
            .collect()
    }

    // ==================== Stepping ====================

    /// Advance the space by `dt` seconds. Inactive spaces do nothing.
    pub fn step(&mut self, dt: f32) {
        if !self.active {
            return;
        }
        self.pre_step();
        let report = self.system.update(dt);
        for contact in &report.sensor_contacts {
            self.route_sensor_contact(contact);
        }
        self.queue_body_states(&report.moved);
        self.arena.reset();
    }

    fn pre_step(&mut self) {
        let active = self.system.active_body_ids();
        if active.is_empty() {
            return;
        }

        let mut fields: Vec<(GravityOverride, Vec<BodyId>)> = Vec::new();
        {
            let reader = BodyReader::lock(self.system.table(), &self.areas);
            for record in reader.iter() {
                if let Some(state) = record.area.as_ref() {
                    if state.gravity.mode != GravityMode::Disabled {
                        fields.push((state.gravity, state.overlapping_bodies()));
                    }
                }
            }
        }

        let space_gravity = self.system.gravity();
        for id in active {
            let mut overrides = bumpalo::collections::Vec::new_in(&self.arena);
            for (gravity, bodies) in &fields {
                if bodies.binary_search(&id).is_ok() {
                    overrides.push(*gravity);
                }
            }
            let gravity = (!overrides.is_empty()).then(|| combine_gravity(&space_gravity, &mut overrides));
            self.system.apply_forces(id, gravity);
        }
    }

    fn route_sensor_contact(&mut self, contact: &SensorContact) {
        self.route_to_area(contact.a, contact.b, contact.started);
        self.route_to_area(contact.b, contact.a, contact.started);
    }

    /// Count a contact against `area` if it is one, queueing an event when
    /// a shape pair starts or stops overlapping
    fn route_to_area(&mut self, area: ColliderTag, other: ColliderTag, started: bool) {
        let mut writer = BodyWriter::lock(self.system.table(), &[area.body, other.body]);
        let (other_shape, other_instance_id, other_is_area) = match writer.try_get(other.body) {
            Some(record) => (
                record.shape_index(other.instance),
                record.instance_id,
                record.is_area(),
            ),
            None => (None, 0, false),
        };

        let Some(record) = writer.try_get_mut(area.body) else {
            return;
        };
        let self_shape = record.shape_index(area.instance);
        let area_object = record.object;
        let Some(state) = record.area.as_mut() else {
            return;
        };

        let key = OverlapKey {
            other: other.body,
            other_shape: other.instance,
            self_shape: area.instance,
        };
        let changed = if started {
            state.add_overlap(key)
        } else {
            state.remove_overlap(key)
        };
        if !changed || !state.monitoring {
            return;
        }

        self.notifications.push(Notification::AreaMonitor {
            area: area_object,
            event: MonitorEvent {
                kind: if started {
                    MonitorEventKind::Entered
                } else {
                    MonitorEventKind::Exited
                },
                other: other.object,
                other_instance_id,
                other_shape,
                self_shape,
                other_is_area,
            },
        });
    }

    fn queue_body_states(&mut self, moved: &[BodyId]) {
        let reader = BodyReader::lock(self.system.table(), moved);
        let mut dispatch = bumpalo::collections::Vec::with_capacity_in(moved.len(), &self.arena);
        for record in moved.iter().filter_map(|id| reader.try_get(*id)) {
            if record.is_area() || record.motion == MotionType::Static {
                continue;
            }
            dispatch.push(Notification::BodyState {
                object: record.object,
                state: BodyState {
                    transform: record.pose,
                    linear_velocity: record.linvel,
                    angular_velocity: record.angvel,
                    sleeping: record.sleeping,
                },
            });
        }
        drop(reader);
        for notification in dispatch {
            self.notifications.push(notification);
        }
    }

    // ==================== Notifications ====================

    pub fn pending_notifications(&self) -> usize {
        self.notifications.len()
    }

    /// Hand the queued notifications to a host that polls
    pub fn drain_notifications(&mut self) -> Vec<Notification> {
        self.notifications.drain()
    }

    /// Run the callbacks of every queued notification, bodies first
    pub fn dispatch_notifications(&mut self, objects: &mut RidOwner<CollisionObject>) {
        for notification in self.notifications.drain() {
            match notification {
                Notification::BodyState { object, state } => {
                    if let Some(object) = objects.get_mut(object) {
                        object.notify_state(&state);
                    }
                }
                Notification::AreaMonitor { area, event } => {
                    if let Some(area) = objects.get_mut(area) {
                        area.notify_monitor(&event);
                    }
                }
            }
        }
    }

    /// Query view over the current engine state
    pub fn direct_state(&mut self) -> SpaceQuery<'_> {
        self.system.refresh_queries();
        SpaceQuery::new(&self.system)
    }
}

impl std::fmt::Debug for PhysicsSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicsSpace")
            .field("rid", &self.rid)
            .field("active", &self.active)
            .field("objects", &self.objects.len())
            .field("system", &self.system)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::area::GravityOverride;
    use crate::math::Transform3;
    use crate::object::BodyMode;
    use crate::shape::{Shape, ShapeData};
    use approx::assert_relative_eq;

    struct Fixture {
        space: PhysicsSpace,
        objects: RidOwner<CollisionObject>,
        shapes: RidOwner<Shape>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                space: PhysicsSpace::new(SpaceRid::new(0, 0), PhysicsConfig::default()).unwrap(),
                objects: RidOwner::new("CollisionObject"),
                shapes: RidOwner::new("Shape"),
            }
        }

        fn spawn(&mut self, mut object: CollisionObject, data: ShapeData, at: [f32; 3]) -> ObjectRid {
            let shape = self.shapes.insert(Shape::new(data).unwrap());
            object.add_shape(shape, &Transform3::identity(), false);
            object.set_transform(Transform3::from_translation(at[0], at[1], at[2]));
            object.rebuild_shape(&mut self.shapes);
            let rid = self.objects.insert(object);
            let object = self.objects.get_mut(rid).unwrap();
            self.space.add_object(rid, object).unwrap();
            rid
        }

        fn body(&self, rid: ObjectRid) -> BodyId {
            self.objects.get(rid).unwrap().body()
        }
    }

    fn cube(half: f32) -> ShapeData {
        ShapeData::Box {
            half_extents: Vector3::repeat(half),
        }
    }

    #[test]
    fn test_attach_and_detach() {
        let mut fx = Fixture::new();
        let rid = fx.spawn(
            CollisionObject::new_body(BodyMode::Rigid, 1),
            ShapeData::Sphere { radius: 0.5 },
            [0.0, 10.0, 0.0],
        );
        assert_eq!(fx.space.body_count(), 1);
        assert!(fx.space.contains(rid));

        for _ in 0..10 {
            fx.space.step(1.0 / 60.0);
        }

        let object = fx.objects.get_mut(rid).unwrap();
        fx.space.remove_object(rid, object).unwrap();
        let object = fx.objects.get(rid).unwrap();
        assert!(!object.is_attached());
        assert!(object.pose().translation.vector.y < 10.0);
        assert_eq!(fx.space.body_count(), 0);

        let object = fx.objects.get_mut(rid).unwrap();
        assert!(matches!(
            fx.space.remove_object(rid, object),
            Err(PhysicsError::ObjectNotInSpace(_))
        ));
    }

    #[test]
    fn test_body_state_notifications() {
        let mut fx = Fixture::new();
        let rid = fx.spawn(
            CollisionObject::new_body(BodyMode::Rigid, 1),
            ShapeData::Sphere { radius: 0.5 },
            [0.0, 10.0, 0.0],
        );
        fx.spawn(
            CollisionObject::new_body(BodyMode::Static, 2),
            cube(1.0),
            [5.0, 0.0, 0.0],
        );

        fx.space.step(1.0 / 60.0);
        let notifications = fx.space.drain_notifications();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].target(), rid);
        assert!(fx.space.drain_notifications().is_empty());
    }

    #[test]
    fn test_callbacks_dispatched() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let mut fx = Fixture::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut object = CollisionObject::new_body(BodyMode::Rigid, 1);
        let counter = Arc::clone(&calls);
        object.set_state_callback(Some(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })));
        fx.spawn(object, ShapeData::Sphere { radius: 0.5 }, [0.0, 10.0, 0.0]);

        fx.space.step(1.0 / 60.0);
        fx.space.step(1.0 / 60.0);
        fx.space.dispatch_notifications(&mut fx.objects);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_inactive_space_does_not_step() {
        let mut fx = Fixture::new();
        let rid = fx.spawn(
            CollisionObject::new_body(BodyMode::Rigid, 1),
            ShapeData::Sphere { radius: 0.5 },
            [0.0, 10.0, 0.0],
        );
        fx.space.set_active(false);
        fx.space.step(1.0 / 60.0);

        let state = fx.space.body_state(fx.body(rid)).unwrap();
        assert_relative_eq!(state.transform.translation.vector.y, 10.0);
        assert_eq!(fx.space.pending_notifications(), 0);
    }

    #[test]
    fn test_area_enter_and_exit() {
        let mut fx = Fixture::new();
        let mut area = CollisionObject::new_area(9);
        area.area_params_mut().monitoring = true;
        let area = fx.spawn(area, cube(2.0), [0.0, 0.0, 0.0]);
        let ball = fx.spawn(
            CollisionObject::new_body(BodyMode::Rigid, 1),
            ShapeData::Sphere { radius: 0.5 },
            [0.0, 0.0, 0.0],
        );

        fx.space.step(1.0 / 60.0);
        let entered: Vec<_> = fx
            .space
            .drain_notifications()
            .into_iter()
            .filter_map(|n| match n {
                Notification::AreaMonitor { area, event } => Some((area, event)),
                _ => None,
            })
            .collect();
        assert_eq!(entered.len(), 1);
        assert_eq!(entered[0].0, area);
        assert!(entered[0].1.is_entered());
        assert_eq!(entered[0].1.other, ball);
        assert_eq!(entered[0].1.other_instance_id, 1);
        assert_eq!(entered[0].1.other_shape, Some(0));
        assert_eq!(entered[0].1.self_shape, Some(0));
        assert!(!entered[0].1.other_is_area);
        assert_eq!(fx.space.area_overlaps(fx.body(area)), vec![ball]);

        let object = fx.objects.get_mut(ball).unwrap();
        fx.space.remove_object(ball, object).unwrap();
        let exited = fx.space.drain_notifications();
        assert_eq!(exited.len(), 1);
        assert!(matches!(
            exited[0],
            Notification::AreaMonitor { event, .. } if event.is_exited() && event.other == ball
        ));

        // The engine's own stop event for the removed collider is absorbed.
        fx.space.step(1.0 / 60.0);
        assert!(fx
            .space
            .drain_notifications()
            .iter()
            .all(|n| !n.is_area()));
    }

    #[test]
    fn test_reshaping_overlapping_body_keeps_area_contact() {
        let mut fx = Fixture::new();
        let mut area = CollisionObject::new_area(9);
        area.area_params_mut().monitoring = true;
        let area = fx.spawn(area, cube(2.0), [0.0, 0.0, 0.0]);
        let mut ball = CollisionObject::new_body(BodyMode::Rigid, 1);
        ball.body_params_mut().gravity_scale = 0.0;
        let ball = fx.spawn(ball, ShapeData::Sphere { radius: 0.5 }, [0.0, 0.0, 0.0]);

        fx.space.step(1.0 / 60.0);
        assert_eq!(fx.space.area_overlaps(fx.body(area)), vec![ball]);
        fx.space.drain_notifications();

        // Growing the ball swaps its colliders while the overlap persists.
        let shape = fx.objects.get(ball).unwrap().shapes()[0].shape;
        fx.shapes
            .get_mut(shape)
            .unwrap()
            .set_data(ShapeData::Sphere { radius: 0.6 })
            .unwrap();
        let object = fx.objects.get_mut(ball).unwrap();
        assert!(object.rebuild_shape(&mut fx.shapes));
        assert!(fx.space.update_shape(object));

        fx.space.step(1.0 / 60.0);
        assert!(fx
            .space
            .drain_notifications()
            .iter()
            .all(|n| !n.is_area()));
        assert_eq!(fx.space.area_overlaps(fx.body(area)), vec![ball]);
    }

    #[test]
    fn test_area_gravity_replaces_space_gravity() {
        let mut fx = Fixture::new();
        let mut area = CollisionObject::new_area(0);
        area.area_params_mut().gravity = GravityOverride::replace([0.0, 9.81, 0.0]);
        fx.spawn(area, cube(50.0), [0.0, 0.0, 0.0]);
        let ball = fx.spawn(
            CollisionObject::new_body(BodyMode::Rigid, 1),
            ShapeData::Sphere { radius: 0.5 },
            [0.0, 0.0, 0.0],
        );

        // The first step registers the overlap; gravity flips after that.
        for _ in 0..60 {
            fx.space.step(1.0 / 60.0);
        }
        let state = fx.space.body_state(fx.body(ball)).unwrap();
        assert!(state.linear_velocity.y > 0.0);
        assert!(state.transform.translation.vector.y > 0.0);
    }

    #[test]
    fn test_layer_change_while_attached() {
        let mut fx = Fixture::new();
        fx.spawn(
            CollisionObject::new_body(BodyMode::Static, 2),
            cube(1.0),
            [0.0, 0.0, 0.0],
        );
        let ball = fx.spawn(
            CollisionObject::new_body(BodyMode::Rigid, 1),
            ShapeData::Sphere { radius: 0.5 },
            [0.0, 3.0, 0.0],
        );

        let object = fx.objects.get_mut(ball).unwrap();
        object.set_collision_layer(8);
        object.set_collision_mask(8);
        fx.space.update_layer(object).unwrap();
        assert_eq!(fx.space.layer_code_count(), 3);

        for _ in 0..120 {
            fx.space.step(1.0 / 60.0);
        }
        let state = fx.space.body_state(fx.body(ball)).unwrap();
        assert!(state.transform.translation.vector.y < 0.0);
    }
}
