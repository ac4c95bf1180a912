//! Physics server - the host-facing entry point
//!
//! [`PhysicsServer`] owns every space, collision object and shape and hands
//! the host opaque handles to them. All edits go through here so the server
//! can keep the three in step: shape owner counts, composed shapes and the
//! engine bodies of attached objects.

use crate::area::GravityOverride;
use crate::config::PhysicsConfig;
use crate::error::{PhysicsError, Result};
use crate::events::Notification;
use crate::math::Transform3;
use crate::object::{BodyMode, BodyParams, CollisionObject, MonitorCallback, ObjectRid, StateCallback};
use crate::query::SpaceQuery;
use crate::shape::{Shape, ShapeData, ShapeRid};
use crate::space::{PhysicsSpace, SpaceRid};
use rapier3d::na::Vector3;
use tether_core::RidOwner;

/// Owns spaces, objects and shapes
pub struct PhysicsServer {
    spaces: RidOwner<PhysicsSpace>,
    objects: RidOwner<CollisionObject>,
    shapes: RidOwner<Shape>,
}

impl Default for PhysicsServer {
    fn default() -> Self {
        Self::new()
    }
}

impl PhysicsServer {
    pub fn new() -> Self {
        Self {
            spaces: RidOwner::new("spaces"),
            objects: RidOwner::new("collision objects"),
            shapes: RidOwner::new("shapes"),
        }
    }

    fn object_mut(&mut self, rid: ObjectRid) -> Result<&mut CollisionObject> {
        self.objects.get_mut(rid).ok_or(PhysicsError::ObjectNotFound(rid))
    }

    // ==================== Spaces ====================

    pub fn space_create(&mut self, config: PhysicsConfig) -> Result<SpaceRid> {
        config.validate()?;
        let rid = self
            .spaces
            .insert_with(|rid| PhysicsSpace::with_validated(rid, config));
        Ok(rid)
    }

    /// Free a space. Its objects are detached and keep their last state.
    pub fn space_free(&mut self, rid: SpaceRid) -> Result<()> {
        let mut space = self.spaces.remove(rid).ok_or(PhysicsError::SpaceNotFound(rid))?;
        let attached: Vec<_> = space.objects().collect();
        for object_rid in attached {
            if let Some(object) = self.objects.get_mut(object_rid) {
                space.remove_object(object_rid, object)?;
            }
        }
        log::debug!("Freed physics space {:?}", rid);
        Ok(())
    }

    pub fn space(&self, rid: SpaceRid) -> Result<&PhysicsSpace> {
        self.spaces.get(rid).ok_or(PhysicsError::SpaceNotFound(rid))
    }

    pub fn space_mut(&mut self, rid: SpaceRid) -> Result<&mut PhysicsSpace> {
        self.spaces.get_mut(rid).ok_or(PhysicsError::SpaceNotFound(rid))
    }

    pub fn space_set_active(&mut self, rid: SpaceRid, active: bool) -> Result<()> {
        self.space_mut(rid)?.set_active(active);
        Ok(())
    }

    pub fn space_set_gravity(&mut self, rid: SpaceRid, gravity: Vector3<f32>) -> Result<()> {
        self.space_mut(rid)?.set_gravity(gravity);
        Ok(())
    }

    pub fn space_gravity(&self, rid: SpaceRid) -> Result<Vector3<f32>> {
        Ok(self.space(rid)?.gravity())
    }

    pub fn space_step(&mut self, rid: SpaceRid, dt: f32) -> Result<()> {
        self.space_mut(rid)?.step(dt);
        Ok(())
    }

    /// Step every active space
    pub fn step_all(&mut self, dt: f32) {
        for (_, space) in self.spaces.iter_mut() {
            space.step(dt);
        }
    }

    /// Run the queued callbacks of one space
    pub fn space_dispatch(&mut self, rid: SpaceRid) -> Result<()> {
        let space = self.spaces.get_mut(rid).ok_or(PhysicsError::SpaceNotFound(rid))?;
        space.dispatch_notifications(&mut self.objects);
        Ok(())
    }

    /// Run the queued callbacks of every space
    pub fn dispatch_all(&mut self) {
        for (_, space) in self.spaces.iter_mut() {
            space.dispatch_notifications(&mut self.objects);
        }
    }

    pub fn space_drain(&mut self, rid: SpaceRid) -> Result<Vec<Notification>> {
        Ok(self.space_mut(rid)?.drain_notifications())
    }

    /// Direct query access to a space
    pub fn space_query(&mut self, rid: SpaceRid) -> Result<SpaceQuery<'_>> {
        Ok(self.space_mut(rid)?.direct_state())
    }

    // ==================== Shapes ====================

    pub fn shape_create(&mut self, data: ShapeData) -> Result<ShapeRid> {
        let shape = Shape::new(data)?;
        Ok(self.shapes.insert(shape))
    }

    pub fn shape(&self, rid: ShapeRid) -> Result<&Shape> {
        self.shapes.get(rid).ok_or(PhysicsError::ShapeNotFound(rid))
    }

    /// Replace a shape's data and rebuild every object using it
    pub fn shape_set_data(&mut self, rid: ShapeRid, data: ShapeData) -> Result<()> {
        let shape = self.shapes.get_mut(rid).ok_or(PhysicsError::ShapeNotFound(rid))?;
        shape.set_data(data)?;
        let owners: Vec<_> = shape.owners().collect();
        for owner in owners {
            self.refresh_shape(owner)?;
        }
        Ok(())
    }

    /// Free a shape, removing it from every object that still uses it
    pub fn shape_free(&mut self, rid: ShapeRid) -> Result<()> {
        let shape = self.shapes.get(rid).ok_or(PhysicsError::ShapeNotFound(rid))?;
        let owners: Vec<_> = shape.owners().collect();
        for owner in owners {
            if let Some(object) = self.objects.get_mut(owner) {
                object.remove_shape_rid(rid);
            }
            self.refresh_shape(owner)?;
        }
        self.shapes.remove(rid);
        Ok(())
    }

    // ==================== Objects ====================

    pub fn body_create(&mut self, mode: BodyMode, instance_id: u64) -> ObjectRid {
        self.objects.insert(CollisionObject::new_body(mode, instance_id))
    }

    pub fn area_create(&mut self, instance_id: u64) -> ObjectRid {
        self.objects.insert(CollisionObject::new_area(instance_id))
    }

    pub fn object(&self, rid: ObjectRid) -> Result<&CollisionObject> {
        self.objects.get(rid).ok_or(PhysicsError::ObjectNotFound(rid))
    }

    /// Detach and free an object, releasing its shape references
    pub fn object_free(&mut self, rid: ObjectRid) -> Result<()> {
        self.object_set_space(rid, None)?;
        let mut object = self.objects.remove(rid).ok_or(PhysicsError::ObjectNotFound(rid))?;
        for instance in object.clear_shapes() {
            if let Some(shape) = self.shapes.get_mut(instance.shape) {
                shape.remove_owner(rid);
            }
        }
        Ok(())
    }

    /// Move an object into `space`, or out of any space with `None`.
    ///
    /// If attaching fails the object is left detached.
    pub fn object_set_space(&mut self, rid: ObjectRid, space: Option<SpaceRid>) -> Result<()> {
        let object = self.objects.get_mut(rid).ok_or(PhysicsError::ObjectNotFound(rid))?;
        if object.space() == space {
            return Ok(());
        }
        if let Some(target) = space {
            if !self.spaces.contains(target) {
                return Err(PhysicsError::SpaceNotFound(target));
            }
        }

        if let Some(current) = object.space() {
            let from = self
                .spaces
                .get_mut(current)
                .ok_or(PhysicsError::SpaceNotFound(current))?;
            from.remove_object(rid, object)?;
        }

        let Some(target) = space else {
            return Ok(());
        };
        object.rebuild_shape(&mut self.shapes);
        let to = self
            .spaces
            .get_mut(target)
            .ok_or(PhysicsError::SpaceNotFound(target))?;
        if let Err(err) = to.add_object(rid, object) {
            log::error!("Failed to add {:?} to space {:?}: {}", rid, target, err);
            return Err(err);
        }
        Ok(())
    }

    /// Rebuild an object's composed shape and push it if attached
    fn refresh_shape(&mut self, rid: ObjectRid) -> Result<()> {
        let object = self.objects.get_mut(rid).ok_or(PhysicsError::ObjectNotFound(rid))?;
        object.rebuild_shape(&mut self.shapes);
        if let Some(space) = object.space().and_then(|space| self.spaces.get_mut(space)) {
            space.update_shape(object);
        }
        Ok(())
    }

    // ==================== Shape Instances ====================

    pub fn object_add_shape(
        &mut self,
        rid: ObjectRid,
        shape: ShapeRid,
        transform: &Transform3,
        disabled: bool,
    ) -> Result<usize> {
        let owned = self.shapes.get_mut(shape).ok_or(PhysicsError::ShapeNotFound(shape))?;
        let object = self.objects.get_mut(rid).ok_or(PhysicsError::ObjectNotFound(rid))?;
        owned.add_owner(rid);
        let index = object.add_shape(shape, transform, disabled);
        self.refresh_shape(rid)?;
        Ok(index)
    }

    pub fn object_remove_shape(&mut self, rid: ObjectRid, index: usize) -> Result<()> {
        let instance = self.object_mut(rid)?.remove_shape(index)?;
        if let Some(shape) = self.shapes.get_mut(instance.shape) {
            shape.remove_owner(rid);
        }
        self.refresh_shape(rid)
    }

    /// Point shape slot `index` at another shape
    pub fn object_set_shape(&mut self, rid: ObjectRid, index: usize, shape: ShapeRid) -> Result<()> {
        if !self.shapes.contains(shape) {
            return Err(PhysicsError::ShapeNotFound(shape));
        }
        let previous = self.object_mut(rid)?.set_shape(index, shape)?;
        if let Some(old) = self.shapes.get_mut(previous) {
            old.remove_owner(rid);
        }
        if let Some(new) = self.shapes.get_mut(shape) {
            new.add_owner(rid);
        }
        self.refresh_shape(rid)
    }

    pub fn object_set_shape_transform(
        &mut self,
        rid: ObjectRid,
        index: usize,
        transform: &Transform3,
    ) -> Result<()> {
        self.object_mut(rid)?.set_shape_transform(index, transform)?;
        self.refresh_shape(rid)
    }

    pub fn object_set_shape_disabled(&mut self, rid: ObjectRid, index: usize, disabled: bool) -> Result<()> {
        self.object_mut(rid)?.set_shape_disabled(index, disabled)?;
        self.refresh_shape(rid)
    }

    pub fn object_clear_shapes(&mut self, rid: ObjectRid) -> Result<()> {
        let removed = self.object_mut(rid)?.clear_shapes();
        for instance in removed {
            if let Some(shape) = self.shapes.get_mut(instance.shape) {
                shape.remove_owner(rid);
            }
        }
        self.refresh_shape(rid)
    }

    // ==================== Object State ====================

    /// Current transform, read from the engine body while attached
    pub fn object_transform(&self, rid: ObjectRid) -> Result<Transform3> {
        let object = self.object(rid)?;
        let live = object
            .space()
            .and_then(|space| self.spaces.get(space))
            .and_then(|space| space.body_state(object.body()));
        Ok(match live {
            Some(state) => Transform3::from_parts(&state.transform, &object.scale()),
            None => *object.transform(),
        })
    }

    /// Set the transform. While attached this is a non-activating correction;
    /// a scale change also rebuilds the shape.
    pub fn object_set_transform(&mut self, rid: ObjectRid, transform: Transform3) -> Result<()> {
        let object = self.objects.get_mut(rid).ok_or(PhysicsError::ObjectNotFound(rid))?;
        let rescaled = object.set_transform(transform);
        if let Some(space) = object.space().and_then(|space| self.spaces.get_mut(space)) {
            space.set_pose(object.body(), object.pose());
        }
        if rescaled {
            self.refresh_shape(rid)?;
        }
        Ok(())
    }

    pub fn object_collision_layer(&self, rid: ObjectRid) -> Result<u32> {
        Ok(self.object(rid)?.collision_layer())
    }

    pub fn object_collision_mask(&self, rid: ObjectRid) -> Result<u32> {
        Ok(self.object(rid)?.collision_mask())
    }

    pub fn object_set_collision_layer(&mut self, rid: ObjectRid, layer: u32) -> Result<()> {
        self.object_mut(rid)?.set_collision_layer(layer);
        self.push_layer(rid)
    }

    pub fn object_set_collision_mask(&mut self, rid: ObjectRid, mask: u32) -> Result<()> {
        self.object_mut(rid)?.set_collision_mask(mask);
        self.push_layer(rid)
    }

    fn push_layer(&mut self, rid: ObjectRid) -> Result<()> {
        let object = self.objects.get(rid).ok_or(PhysicsError::ObjectNotFound(rid))?;
        match object.space().and_then(|space| self.spaces.get_mut(space)) {
            Some(space) => space.update_layer(object),
            None => Ok(()),
        }
    }

    pub fn body_linear_velocity(&self, rid: ObjectRid) -> Result<Vector3<f32>> {
        let object = self.object(rid)?;
        Ok(self
            .live_state(object)
            .map_or_else(|| object.linear_velocity(), |state| state.linear_velocity))
    }

    pub fn body_angular_velocity(&self, rid: ObjectRid) -> Result<Vector3<f32>> {
        let object = self.object(rid)?;
        Ok(self
            .live_state(object)
            .map_or_else(|| object.angular_velocity(), |state| state.angular_velocity))
    }

    fn live_state(&self, object: &CollisionObject) -> Option<crate::events::BodyState> {
        object
            .space()
            .and_then(|space| self.spaces.get(space))
            .and_then(|space| space.body_state(object.body()))
    }

    pub fn body_set_velocities(
        &mut self,
        rid: ObjectRid,
        linear: Vector3<f32>,
        angular: Vector3<f32>,
    ) -> Result<()> {
        let object = self.objects.get_mut(rid).ok_or(PhysicsError::ObjectNotFound(rid))?;
        object.set_velocities(linear, angular);
        if let Some(space) = object.space().and_then(|space| self.spaces.get_mut(space)) {
            space.set_velocities(object.body(), linear, angular);
        }
        Ok(())
    }

    /// Apply an impulse at the center of mass. Needs an attached body.
    pub fn body_apply_central_impulse(&mut self, rid: ObjectRid, impulse: Vector3<f32>) -> Result<()> {
        let object = self.objects.get(rid).ok_or(PhysicsError::ObjectNotFound(rid))?;
        let body = object.body();
        let space = object
            .space()
            .and_then(|space| self.spaces.get_mut(space))
            .ok_or(PhysicsError::ObjectNotInSpace(rid))?;
        space.apply_central_impulse(body, impulse);
        Ok(())
    }

    /// Force and torque re-applied before every step
    pub fn body_set_constant_force(
        &mut self,
        rid: ObjectRid,
        force: Vector3<f32>,
        torque: Vector3<f32>,
    ) -> Result<()> {
        let params = self.object_mut(rid)?.body_params_mut();
        params.constant_force = [force.x, force.y, force.z];
        params.constant_torque = [torque.x, torque.y, torque.z];
        self.push_params(rid)
    }

    pub fn body_is_sleeping(&self, rid: ObjectRid) -> Result<bool> {
        let object = self.object(rid)?;
        Ok(self.live_state(object).map_or(false, |state| state.sleeping))
    }

    /// Put an attached body to sleep or wake it. Ignored while detached.
    pub fn body_set_sleeping(&mut self, rid: ObjectRid, sleeping: bool) -> Result<()> {
        let object = self.objects.get(rid).ok_or(PhysicsError::ObjectNotFound(rid))?;
        let body = object.body();
        if let Some(space) = object.space().and_then(|space| self.spaces.get_mut(space)) {
            space.set_sleeping(body, sleeping);
        }
        Ok(())
    }

    pub fn body_set_mode(&mut self, rid: ObjectRid, mode: BodyMode) -> Result<()> {
        let object = self.objects.get_mut(rid).ok_or(PhysicsError::ObjectNotFound(rid))?;
        object.set_mode(mode);
        match object.space().and_then(|space| self.spaces.get_mut(space)) {
            Some(space) => space.update_mode(object),
            None => Ok(()),
        }
    }

    /// Replace every body parameter at once
    pub fn body_set_params(&mut self, rid: ObjectRid, params: BodyParams) -> Result<()> {
        *self.object_mut(rid)?.body_params_mut() = params;
        // A custom center of mass lives in the composed shape.
        self.refresh_shape(rid)?;
        self.push_params(rid)
    }

    fn push_params(&mut self, rid: ObjectRid) -> Result<()> {
        let object = self.objects.get(rid).ok_or(PhysicsError::ObjectNotFound(rid))?;
        if let Some(space) = object.space().and_then(|space| self.spaces.get_mut(space)) {
            space.update_params(object);
        }
        Ok(())
    }

    pub fn body_set_state_callback(&mut self, rid: ObjectRid, callback: Option<StateCallback>) -> Result<()> {
        self.object_mut(rid)?.set_state_callback(callback);
        Ok(())
    }

    // ==================== Areas ====================

    pub fn area_set_monitoring(&mut self, rid: ObjectRid, monitoring: bool) -> Result<()> {
        self.object_mut(rid)?.area_params_mut().monitoring = monitoring;
        self.push_area(rid)
    }

    pub fn area_set_gravity(&mut self, rid: ObjectRid, gravity: GravityOverride) -> Result<()> {
        self.object_mut(rid)?.area_params_mut().gravity = gravity;
        self.push_area(rid)
    }

    pub fn area_set_monitor_callback(&mut self, rid: ObjectRid, callback: Option<MonitorCallback>) -> Result<()> {
        self.object_mut(rid)?.set_monitor_callback(callback);
        Ok(())
    }

    /// Objects inside an attached area
    pub fn area_overlaps(&self, rid: ObjectRid) -> Result<Vec<ObjectRid>> {
        let object = self.object(rid)?;
        let space = object
            .space()
            .and_then(|space| self.spaces.get(space))
            .ok_or(PhysicsError::ObjectNotInSpace(rid))?;
        Ok(space.area_overlaps(object.body()))
    }

    fn push_area(&mut self, rid: ObjectRid) -> Result<()> {
        let object = self.objects.get(rid).ok_or(PhysicsError::ObjectNotFound(rid))?;
        if let Some(space) = object.space().and_then(|space| self.spaces.get_mut(space)) {
            space.update_area(object);
        }
        Ok(())
    }

    // ==================== Stats ====================

    pub fn space_count(&self) -> usize {
        self.spaces.len()
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn shape_count(&self) -> usize {
        self.shapes.len()
    }
}

impl Drop for PhysicsServer {
    fn drop(&mut self) {
        for rid in self.spaces.rids() {
            if let Err(err) = self.space_free(rid) {
                log::warn!("Failed to free space {:?}: {}", rid, err);
            }
        }
        let leaks = [self.objects.leak_report(), self.shapes.leak_report()];
        for report in leaks.into_iter().flatten() {
            log::warn!("Physics server dropped with {} live {}", report.count, report.kind);
        }
    }
}

impl std::fmt::Debug for PhysicsServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicsServer")
            .field("spaces", &self.spaces.len())
            .field("objects", &self.objects.len())
            .field("shapes", &self.shapes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sphere(server: &mut PhysicsServer) -> ShapeRid {
        server.shape_create(ShapeData::Sphere { radius: 0.5 }).unwrap()
    }

    #[test]
    fn test_shape_owner_counts() {
        let mut server = PhysicsServer::new();
        let shape = sphere(&mut server);
        let body = server.body_create(BodyMode::Rigid, 1);

        server.object_add_shape(body, shape, &Transform3::identity(), false).unwrap();
        server
            .object_add_shape(body, shape, &Transform3::from_translation(1.0, 0.0, 0.0), false)
            .unwrap();
        assert_eq!(server.shape(shape).unwrap().owner_count(body), 2);

        server.object_remove_shape(body, 0).unwrap();
        assert_eq!(server.shape(shape).unwrap().owner_count(body), 1);

        server.object_free(body).unwrap();
        assert!(!server.shape(shape).unwrap().has_owners());
        server.shape_free(shape).unwrap();
    }

    #[test]
    fn test_shape_free_detaches_from_objects() {
        let mut server = PhysicsServer::new();
        let shape = sphere(&mut server);
        let body = server.body_create(BodyMode::Rigid, 1);
        server.object_add_shape(body, shape, &Transform3::identity(), false).unwrap();

        server.shape_free(shape).unwrap();
        let object = server.object(body).unwrap();
        assert_eq!(object.shape_count(), 0);
        assert!(object.composed().is_empty());
        server.object_free(body).unwrap();
    }

    #[test]
    fn test_unknown_handles() {
        let mut server = PhysicsServer::new();
        let body = server.body_create(BodyMode::Rigid, 1);
        let missing = ShapeRid::new(42, 0);
        assert!(matches!(
            server.object_add_shape(body, missing, &Transform3::identity(), false),
            Err(PhysicsError::ShapeNotFound(_))
        ));
        assert!(matches!(
            server.object_remove_shape(body, 3),
            Err(PhysicsError::ShapeIndexOutOfBounds { index: 3, count: 0 })
        ));
        assert!(matches!(
            server.object_set_space(body, Some(SpaceRid::new(7, 0))),
            Err(PhysicsError::SpaceNotFound(_))
        ));
        assert!(matches!(
            server.body_apply_central_impulse(body, Vector3::x()),
            Err(PhysicsError::ObjectNotInSpace(_))
        ));
        server.object_free(body).unwrap();
    }

    #[test]
    fn test_transform_buffered_while_detached() {
        let mut server = PhysicsServer::new();
        let space = server.space_create(PhysicsConfig::default()).unwrap();
        let shape = sphere(&mut server);
        let body = server.body_create(BodyMode::Rigid, 1);
        server.object_add_shape(body, shape, &Transform3::identity(), false).unwrap();
        server
            .object_set_transform(body, Transform3::from_translation(0.0, 10.0, 0.0))
            .unwrap();

        server.object_set_space(body, Some(space)).unwrap();
        for _ in 0..30 {
            server.space_step(space, 1.0 / 60.0).unwrap();
        }
        let live = server.object_transform(body).unwrap();
        assert!(live.origin.y < 10.0);
        assert!(server.body_linear_velocity(body).unwrap().y < 0.0);

        // Detaching keeps the simulated state.
        server.object_set_space(body, None).unwrap();
        let kept = server.object_transform(body).unwrap();
        assert_relative_eq!(kept.origin.y, live.origin.y);
        assert!(!server.body_is_sleeping(body).unwrap());
    }

    #[test]
    fn test_moving_between_spaces() {
        let mut server = PhysicsServer::new();
        let a = server.space_create(PhysicsConfig::default()).unwrap();
        let b = server.space_create(PhysicsConfig::default()).unwrap();
        let shape = sphere(&mut server);
        let body = server.body_create(BodyMode::Rigid, 1);
        server.object_add_shape(body, shape, &Transform3::identity(), false).unwrap();

        server.object_set_space(body, Some(a)).unwrap();
        assert_eq!(server.space(a).unwrap().body_count(), 1);
        server.object_set_space(body, Some(b)).unwrap();
        assert_eq!(server.space(a).unwrap().body_count(), 0);
        assert_eq!(server.space(b).unwrap().body_count(), 1);

        server.space_free(b).unwrap();
        assert!(!server.object(body).unwrap().is_attached());
    }

    #[test]
    fn test_inactive_space_skipped_by_step_all() {
        let mut server = PhysicsServer::new();
        let space = server.space_create(PhysicsConfig::default()).unwrap();
        let shape = sphere(&mut server);
        let body = server.body_create(BodyMode::Rigid, 1);
        server.object_add_shape(body, shape, &Transform3::identity(), false).unwrap();
        server.object_set_space(body, Some(space)).unwrap();

        server.space_set_active(space, false).unwrap();
        server.step_all(1.0 / 60.0);
        assert_relative_eq!(server.object_transform(body).unwrap().origin.y, 0.0);

        server.space_set_active(space, true).unwrap();
        server.step_all(1.0 / 60.0);
        assert!(server.object_transform(body).unwrap().origin.y < 0.0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut server = PhysicsServer::new();
        let config = PhysicsConfig::default().with_max_bodies(0);
        assert!(matches!(
            server.space_create(config),
            Err(PhysicsError::InvalidConfig(_))
        ));
        assert_eq!(server.space_count(), 0);
    }
}
