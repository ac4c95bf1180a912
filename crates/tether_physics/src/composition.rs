//! Shape composition
//!
//! Turns an object's list of shape instances into one [`ComposedShape`]: a
//! base (nothing, one placed shape, or a compound of placed shapes) plus an
//! ordered list of wrapping steps. Each step is only recorded when it is not
//! the identity:
//!
//! ```text
//! Single:    shape -> Scale -> Transform -> CenterOfMass -> OuterScale
//! Compound:  [shape @ transform, scale]* -> CenterOfMass -> OuterScale
//! ```
//!
//! The engine has no decorator shapes, so [`ComposedShape::materialize`]
//! flattens the steps into one collider per placed shape, with every scale
//! baked into the geometry.

use crate::error::{PhysicsError, Result};
use crate::math::{is_identity_isometry, is_unit_scale, scale_in_frame, Transform3};
use crate::shape::{Shape, ShapeData, ShapeRid};
use rapier3d::na::{Isometry3, Point3, Translation3, Vector3};
use rapier3d::prelude as rapier;
use std::sync::Arc;
use tether_core::RidOwner;

/// Identifier of one shape instance, stable while the instance exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShapeInstanceId(u32);

impl ShapeInstanceId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn to_bits(self) -> u32 {
        self.0
    }
}

/// One shape attached to an object at a local placement
#[derive(Debug, Clone, PartialEq)]
pub struct ShapeInstance {
    pub id: ShapeInstanceId,
    pub shape: ShapeRid,
    pub transform: Isometry3<f32>,
    pub scale: Vector3<f32>,
    pub disabled: bool,
}

impl ShapeInstance {
    pub fn new(id: ShapeInstanceId, shape: ShapeRid, transform: &Transform3, disabled: bool) -> Self {
        let (transform, scale) = transform.decompose();
        Self {
            id,
            shape,
            transform,
            scale,
            disabled,
        }
    }

    /// Replace the local transform (rotation, translation and scale)
    pub fn set_transform(&mut self, transform: &Transform3) {
        let (isometry, scale) = transform.decompose();
        self.transform = isometry;
        self.scale = scale;
    }

    pub fn local_transform(&self) -> Transform3 {
        Transform3::from_parts(&self.transform, &self.scale)
    }
}

// ==================== Composed Shape ====================

/// A built shape at its place inside the composition
#[derive(Debug, Clone)]
pub struct PlacedShape {
    pub instance: ShapeInstanceId,
    /// Data the engine shape was built from, for rebuilding at other scales
    pub source: Arc<ShapeData>,
    /// Engine shape at unit scale
    pub shape: rapier::SharedShape,
    pub transform: Isometry3<f32>,
    pub scale: Vector3<f32>,
}

impl PartialEq for PlacedShape {
    fn eq(&self, other: &Self) -> bool {
        self.instance == other.instance
            && Arc::ptr_eq(&self.source, &other.source)
            && Arc::ptr_eq(&self.shape.0, &other.shape.0)
            && self.transform == other.transform
            && self.scale == other.scale
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ComposedBase {
    /// No enabled shapes: the body gets no colliders at all
    Empty,
    Single(PlacedShape),
    Compound(Vec<PlacedShape>),
}

/// Optional wrapping layer around the base
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WrapStep {
    Scale(Vector3<f32>),
    Transform(Isometry3<f32>),
    /// Offset from the natural center of mass
    CenterOfMass(Vector3<f32>),
    /// Object-level scale taken from the object's transform
    OuterScale(Vector3<f32>),
}

/// Final collision representation of one object
#[derive(Debug, Clone, PartialEq)]
pub struct ComposedShape {
    base: ComposedBase,
    steps: Vec<WrapStep>,
}

/// One engine collider produced from a composed shape
#[derive(Clone)]
pub struct ColliderPart {
    pub instance: ShapeInstanceId,
    pub shape: rapier::SharedShape,
    pub position: Isometry3<f32>,
    pub has_volume: bool,
}

impl ComposedShape {
    pub fn empty() -> Self {
        Self {
            base: ComposedBase::Empty,
            steps: Vec::new(),
        }
    }

    pub fn base(&self) -> &ComposedBase {
        &self.base
    }

    pub fn steps(&self) -> &[WrapStep] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.base, ComposedBase::Empty)
    }

    /// The single undecorated engine shape, when that is all there is
    pub fn root_shape(&self) -> Option<&rapier::SharedShape> {
        match &self.base {
            ComposedBase::Single(placed) if self.steps.is_empty() => Some(&placed.shape),
            _ => None,
        }
    }

    fn outer_scale(&self) -> Vector3<f32> {
        self.steps
            .iter()
            .find_map(|step| match step {
                WrapStep::OuterScale(scale) => Some(*scale),
                _ => None,
            })
            .unwrap_or_else(|| Vector3::repeat(1.0))
    }

    fn center_of_mass_offset(&self) -> Vector3<f32> {
        self.steps
            .iter()
            .find_map(|step| match step {
                WrapStep::CenterOfMass(offset) => Some(*offset),
                _ => None,
            })
            .unwrap_or_else(Vector3::zeros)
    }

    /// Flatten into engine colliders with all scales baked in
    pub fn materialize(&self) -> Result<Vec<ColliderPart>> {
        self.parts_with_outer_scale(&self.outer_scale())
    }

    fn parts_with_outer_scale(&self, outer: &Vector3<f32>) -> Result<Vec<ColliderPart>> {
        match &self.base {
            ComposedBase::Empty => Ok(Vec::new()),
            ComposedBase::Single(placed) => {
                let mut scale = placed.scale;
                let mut transform = placed.transform;
                for step in &self.steps {
                    match step {
                        WrapStep::Scale(s) => scale = scale.component_mul(s),
                        WrapStep::Transform(t) => transform = t * transform,
                        _ => {}
                    }
                }
                Ok(vec![place(placed, &transform, &scale, outer)?])
            }
            ComposedBase::Compound(children) => children
                .iter()
                .map(|child| place(child, &child.transform, &child.scale, outer))
                .collect(),
        }
    }

    /// Mass properties for a body of total `mass` built from `parts`
    pub fn mass_properties(&self, parts: &[ColliderPart], mass: f32) -> rapier::MassProperties {
        let unit = parts
            .iter()
            .filter(|part| part.has_volume)
            .map(|part| part.shape.mass_properties(1.0).transform_by(&part.position))
            .fold(rapier3d::na::zero::<rapier::MassProperties>(), |acc, props| acc + props);

        let outer = self.outer_scale();
        let offset = self.center_of_mass_offset().component_mul(&outer);

        if unit.mass() <= f32::EPSILON {
            // Nothing with volume: treat as a unit sphere of the given mass.
            return rapier::MassProperties::new(
                Point3::from(offset),
                mass,
                Vector3::repeat(0.4 * mass),
            );
        }

        let ratio = mass / unit.mass();
        rapier::MassProperties::new(
            unit.local_com + offset,
            mass,
            unit.principal_inertia() * ratio,
        )
    }
}

fn place(
    placed: &PlacedShape,
    transform: &Isometry3<f32>,
    scale: &Vector3<f32>,
    outer: &Vector3<f32>,
) -> Result<ColliderPart> {
    let total = scale.component_mul(&scale_in_frame(&transform.rotation, outer));
    let shape = if is_unit_scale(&total) {
        placed.shape.clone()
    } else {
        placed.source.build_scaled(&total)?
    };
    let translation = Translation3::from(transform.translation.vector.component_mul(outer));
    let position =
        Isometry3::from_parts(translation, transform.rotation) * placed.source.local_offset(&total);

    Ok(ColliderPart {
        instance: placed.instance,
        shape,
        position,
        has_volume: placed.source.has_volume(),
    })
}

// ==================== Building ====================

/// Build the composed shape for a list of instances.
///
/// Fails if a referenced shape is gone or cannot be built.
pub fn compose(
    instances: &[ShapeInstance],
    shapes: &mut RidOwner<Shape>,
    center_of_mass: Option<Vector3<f32>>,
    outer_scale: &Vector3<f32>,
) -> Result<ComposedShape> {
    let mut placed = Vec::new();
    for instance in instances.iter().filter(|instance| !instance.disabled) {
        let shape = shapes
            .get_mut(instance.shape)
            .ok_or(PhysicsError::ShapeNotFound(instance.shape))?;
        placed.push(PlacedShape {
            instance: instance.id,
            source: Arc::clone(shape.data()),
            shape: shape.build()?,
            transform: instance.transform,
            scale: instance.scale,
        });
    }

    let mut steps = Vec::new();
    let base = match placed.len() {
        0 => ComposedBase::Empty,
        1 => {
            let mut single = placed.remove(0);
            if !is_unit_scale(&single.scale) {
                steps.push(WrapStep::Scale(single.scale));
            }
            if !is_identity_isometry(&single.transform) {
                steps.push(WrapStep::Transform(single.transform));
            }
            single.scale = Vector3::repeat(1.0);
            single.transform = Isometry3::identity();
            ComposedBase::Single(single)
        }
        _ => ComposedBase::Compound(placed),
    };

    let mut composed = ComposedShape { base, steps };

    if let Some(requested) = center_of_mass {
        if !composed.is_empty() {
            let parts = composed.parts_with_outer_scale(&Vector3::repeat(1.0))?;
            let natural = composed.mass_properties(&parts, 1.0).local_com.coords;
            let offset = requested - natural;
            if offset != Vector3::zeros() {
                composed.steps.push(WrapStep::CenterOfMass(offset));
            }
        }
    }

    if !is_unit_scale(outer_scale) {
        composed.steps.push(WrapStep::OuterScale(*outer_scale));
    }

    Ok(composed)
}

/// [`compose`], falling back to the empty shape when building fails
pub fn compose_or_empty(
    instances: &[ShapeInstance],
    shapes: &mut RidOwner<Shape>,
    center_of_mass: Option<Vector3<f32>>,
    outer_scale: &Vector3<f32>,
) -> ComposedShape {
    match compose(instances, shapes, center_of_mass, outer_scale) {
        Ok(composed) => composed,
        Err(err) => {
            log::warn!("Shape composition failed, using an empty shape: {}", err);
            ComposedShape::empty()
        }
    }
}

/// Keep `current` if `next` is structurally the same, so that an unchanged
/// rebuild hands back the same handle
pub fn reuse_or_replace(current: &Arc<ComposedShape>, next: ComposedShape) -> Arc<ComposedShape> {
    if **current == next {
        Arc::clone(current)
    } else {
        Arc::new(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::ShapeData;
    use approx::assert_relative_eq;
    use rapier3d::na::UnitQuaternion;

    fn setup() -> (RidOwner<Shape>, ShapeRid, ShapeRid) {
        let mut shapes = RidOwner::new("shapes");
        let sphere = shapes.insert(Shape::new(ShapeData::Sphere { radius: 0.5 }).unwrap());
        let cube = shapes.insert(
            Shape::new(ShapeData::Box {
                half_extents: Vector3::new(1.0, 1.0, 1.0),
            })
            .unwrap(),
        );
        (shapes, sphere, cube)
    }

    fn instance(id: u32, shape: ShapeRid, transform: Transform3) -> ShapeInstance {
        ShapeInstance::new(ShapeInstanceId::new(id), shape, &transform, false)
    }

    #[test]
    fn test_single_identity_is_undecorated() {
        let (mut shapes, sphere, _) = setup();
        let instances = [instance(1, sphere, Transform3::identity())];

        let composed = compose(&instances, &mut shapes, None, &Vector3::repeat(1.0)).unwrap();
        assert!(composed.steps().is_empty());

        let own = shapes.get_mut(sphere).unwrap().build().unwrap();
        let root = composed.root_shape().unwrap();
        assert!(Arc::ptr_eq(&root.0, &own.0));

        let parts = composed.materialize().unwrap();
        assert_eq!(parts.len(), 1);
        assert!(Arc::ptr_eq(&parts[0].shape.0, &own.0));
        assert!(is_identity_isometry(&parts[0].position));
    }

    #[test]
    fn test_rebuild_is_idempotent() {
        let (mut shapes, sphere, cube) = setup();
        let instances = [
            instance(1, sphere, Transform3::from_translation(0.0, 1.0, 0.0)),
            instance(2, cube, Transform3::identity()),
        ];

        let first = Arc::new(compose(&instances, &mut shapes, None, &Vector3::repeat(1.0)).unwrap());
        let second = compose(&instances, &mut shapes, None, &Vector3::repeat(1.0)).unwrap();
        let kept = reuse_or_replace(&first, second);
        assert!(Arc::ptr_eq(&first, &kept));
    }

    #[test]
    fn test_shape_data_change_forces_rebuild() {
        let (mut shapes, sphere, _) = setup();
        let instances = [instance(1, sphere, Transform3::identity())];
        let first = Arc::new(compose(&instances, &mut shapes, None, &Vector3::repeat(1.0)).unwrap());

        shapes
            .get_mut(sphere)
            .unwrap()
            .set_data(ShapeData::Sphere { radius: 2.0 })
            .unwrap();
        let second = compose(&instances, &mut shapes, None, &Vector3::repeat(1.0)).unwrap();
        let replaced = reuse_or_replace(&first, second);
        assert!(!Arc::ptr_eq(&first, &replaced));
    }

    #[test]
    fn test_single_decorators_are_recorded_in_order() {
        let (mut shapes, _, cube) = setup();
        let transform = Transform3::from_translation(1.0, 0.0, 0.0).with_scale(Vector3::new(2.0, 2.0, 2.0));
        let instances = [instance(1, cube, transform)];

        let composed = compose(&instances, &mut shapes, None, &Vector3::repeat(1.0)).unwrap();
        assert!(matches!(
            composed.steps(),
            [WrapStep::Scale(_), WrapStep::Transform(_)]
        ));

        let parts = composed.materialize().unwrap();
        assert_relative_eq!(parts[0].position.translation.vector.x, 1.0, epsilon = 1e-5);
        let cuboid = parts[0].shape.as_cuboid().unwrap();
        assert_relative_eq!(cuboid.half_extents, Vector3::repeat(2.0), epsilon = 1e-5);
    }

    #[test]
    fn test_disabled_instances_are_skipped() {
        let (mut shapes, sphere, cube) = setup();
        let mut instances = vec![
            instance(1, sphere, Transform3::identity()),
            instance(2, cube, Transform3::identity()),
        ];
        instances[1].disabled = true;

        let composed = compose(&instances, &mut shapes, None, &Vector3::repeat(1.0)).unwrap();
        assert!(matches!(composed.base(), ComposedBase::Single(p) if p.instance == ShapeInstanceId::new(1)));

        instances[0].disabled = true;
        let composed = compose(&instances, &mut shapes, None, &Vector3::repeat(1.0)).unwrap();
        assert!(composed.is_empty());
        assert!(composed.materialize().unwrap().is_empty());
    }

    #[test]
    fn test_compound_keeps_instance_ids() {
        let (mut shapes, sphere, cube) = setup();
        let instances = [
            instance(7, sphere, Transform3::from_translation(0.0, 2.0, 0.0)),
            instance(9, cube, Transform3::identity()),
        ];

        let composed = compose(&instances, &mut shapes, None, &Vector3::new(2.0, 2.0, 2.0)).unwrap();
        assert!(matches!(composed.steps(), [WrapStep::OuterScale(_)]));

        let parts = composed.materialize().unwrap();
        let ids: Vec<_> = parts.iter().map(|p| p.instance.to_bits()).collect();
        assert_eq!(ids, vec![7, 9]);

        // Outer scale moves the child and grows it.
        assert_relative_eq!(parts[0].position.translation.vector.y, 4.0, epsilon = 1e-5);
        assert_relative_eq!(parts[0].shape.as_ball().unwrap().radius, 1.0, epsilon = 1e-5);
    }

    #[test]
    fn test_center_of_mass_offset() {
        let (mut shapes, _, cube) = setup();
        let instances = [instance(1, cube, Transform3::identity())];
        let requested = Vector3::new(0.0, -0.5, 0.0);

        let composed = compose(&instances, &mut shapes, Some(requested), &Vector3::repeat(1.0)).unwrap();
        assert!(matches!(composed.steps(), [WrapStep::CenterOfMass(_)]));

        let parts = composed.materialize().unwrap();
        let props = composed.mass_properties(&parts, 3.0);
        assert_relative_eq!(props.mass(), 3.0, epsilon = 1e-4);
        assert_relative_eq!(props.local_com.coords, requested, epsilon = 1e-5);

        // Requesting the natural center adds nothing.
        let natural = compose(&instances, &mut shapes, Some(Vector3::zeros()), &Vector3::repeat(1.0)).unwrap();
        assert!(natural.steps().is_empty());
    }

    #[test]
    fn test_rotated_child_gets_scale_in_its_frame() {
        let (mut shapes, sphere, cube) = setup();
        let rotation = UnitQuaternion::from_euler_angles(0.0, 0.0, std::f32::consts::FRAC_PI_2);
        let rotated = Transform3::from_isometry(&Isometry3::from_parts(Translation3::identity(), rotation));
        let instances = [instance(1, cube, rotated), instance(2, sphere, Transform3::identity())];

        let composed = compose(&instances, &mut shapes, None, &Vector3::new(3.0, 1.0, 1.0)).unwrap();
        let parts = composed.materialize().unwrap();
        let cuboid = parts[0].shape.as_cuboid().unwrap();
        // Local Y now points along world X.
        assert_relative_eq!(cuboid.half_extents, Vector3::new(1.0, 3.0, 1.0), epsilon = 1e-4);
    }

    #[test]
    fn test_missing_shape_falls_back_to_empty() {
        let (mut shapes, sphere, _) = setup();
        let instances = [instance(1, sphere, Transform3::identity())];
        shapes.remove(sphere);

        assert!(matches!(
            compose(&instances, &mut shapes, None, &Vector3::repeat(1.0)),
            Err(PhysicsError::ShapeNotFound(_))
        ));
        assert!(compose_or_empty(&instances, &mut shapes, None, &Vector3::repeat(1.0)).is_empty());
    }
}
