//! Shape geometry
//!
//! A [`Shape`] is geometry only: no placement, no owner-specific scale. It
//! keeps the engine shape built from its data until the data changes, and
//! counts how many times each collision object references it so that
//! owners can be told to rebuild.

use crate::error::{PhysicsError, Result};
use crate::math::{is_unit_scale, SCALE_EPSILON};
use crate::object::ObjectRid;
use rapier3d::na::{DMatrix, Isometry3, Point3, Translation3, Unit, UnitQuaternion, Vector3};
use rapier3d::prelude as rapier;
use std::collections::HashMap;
use std::sync::Arc;
use tether_core::Rid;

/// Handle to a shape owned by the server
pub type ShapeRid = Rid<Shape>;

/// Shape type, without its parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShapeKind {
    Sphere,
    Box,
    Capsule,
    Cylinder,
    ConvexPolygon,
    ConcavePolygon,
    HeightMap,
    SeparationRay,
    WorldBoundary,
}

/// Defining parameters of a shape
#[derive(Debug, Clone, PartialEq)]
pub enum ShapeData {
    Sphere {
        radius: f32,
    },
    Box {
        half_extents: Vector3<f32>,
    },
    /// Y-aligned; `height` includes both caps
    Capsule {
        radius: f32,
        height: f32,
    },
    /// Y-aligned
    Cylinder {
        radius: f32,
        height: f32,
    },
    ConvexPolygon {
        points: Vec<Point3<f32>>,
    },
    /// Triangle soup, three points per face
    ConcavePolygon {
        faces: Vec<Point3<f32>>,
    },
    /// `width` samples along X, `depth` along Z, unit cell size, centered
    HeightMap {
        width: usize,
        depth: usize,
        heights: Vec<f32>,
    },
    /// Segment from the origin along +Z
    SeparationRay {
        length: f32,
    },
    /// Plane `normal . p = distance`; everything below it is solid
    WorldBoundary {
        normal: Vector3<f32>,
        distance: f32,
    },
}

fn invalid(message: impl Into<String>) -> PhysicsError {
    PhysicsError::InvalidShape(message.into())
}

fn positive(value: f32) -> bool {
    value.is_finite() && value > 0.0
}

impl ShapeData {
    pub fn kind(&self) -> ShapeKind {
        match self {
            Self::Sphere { .. } => ShapeKind::Sphere,
            Self::Box { .. } => ShapeKind::Box,
            Self::Capsule { .. } => ShapeKind::Capsule,
            Self::Cylinder { .. } => ShapeKind::Cylinder,
            Self::ConvexPolygon { .. } => ShapeKind::ConvexPolygon,
            Self::ConcavePolygon { .. } => ShapeKind::ConcavePolygon,
            Self::HeightMap { .. } => ShapeKind::HeightMap,
            Self::SeparationRay { .. } => ShapeKind::SeparationRay,
            Self::WorldBoundary { .. } => ShapeKind::WorldBoundary,
        }
    }

    /// Reject data no engine shape can be built from
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Sphere { radius } => {
                if !positive(*radius) {
                    return Err(invalid(format!("sphere radius must be positive, got {}", radius)));
                }
            }
            Self::Box { half_extents } => {
                if !half_extents.iter().all(|e| positive(*e)) {
                    return Err(invalid(format!(
                        "box half extents must be positive, got {:?}",
                        half_extents
                    )));
                }
            }
            Self::Capsule { radius, height } => {
                if !positive(*radius) || !positive(*height) {
                    return Err(invalid(format!(
                        "capsule radius and height must be positive, got {} / {}",
                        radius, height
                    )));
                }
                if *height < *radius * 2.0 {
                    return Err(invalid(format!(
                        "capsule height {} is less than its diameter {}",
                        height,
                        radius * 2.0
                    )));
                }
            }
            Self::Cylinder { radius, height } => {
                if !positive(*radius) || !positive(*height) {
                    return Err(invalid(format!(
                        "cylinder radius and height must be positive, got {} / {}",
                        radius, height
                    )));
                }
            }
            Self::ConvexPolygon { points } => {
                if points.len() < 4 {
                    return Err(invalid(format!(
                        "convex polygon needs at least 4 points, got {}",
                        points.len()
                    )));
                }
            }
            Self::ConcavePolygon { faces } => {
                if faces.is_empty() || faces.len() % 3 != 0 {
                    return Err(invalid(format!(
                        "concave polygon needs a non-empty multiple of 3 points, got {}",
                        faces.len()
                    )));
                }
            }
            Self::HeightMap {
                width,
                depth,
                heights,
            } => {
                for (name, dim) in [("width", *width), ("depth", *depth)] {
                    if dim < 2 || !dim.is_power_of_two() {
                        return Err(invalid(format!(
                            "height map {} must be a power of two of at least 2, got {}",
                            name, dim
                        )));
                    }
                }
                if heights.len() != width * depth {
                    return Err(invalid(format!(
                        "height map of {}x{} needs {} heights, got {}",
                        width,
                        depth,
                        width * depth,
                        heights.len()
                    )));
                }
                if heights.iter().any(|h| !h.is_finite()) {
                    return Err(invalid("height map contains non-finite heights"));
                }
            }
            Self::SeparationRay { length } => {
                if !positive(*length) {
                    return Err(invalid(format!(
                        "separation ray length must be positive, got {}",
                        length
                    )));
                }
            }
            Self::WorldBoundary { normal, distance } => {
                if normal.norm_squared() <= f32::EPSILON || !distance.is_finite() {
                    return Err(invalid("world boundary needs a non-zero normal"));
                }
            }
        }
        Ok(())
    }

    /// Whether the shape encloses volume and so contributes mass
    pub fn has_volume(&self) -> bool {
        matches!(
            self,
            Self::Sphere { .. }
                | Self::Box { .. }
                | Self::Capsule { .. }
                | Self::Cylinder { .. }
                | Self::ConvexPolygon { .. }
        )
    }

    /// Placement of the engine shape inside the shape's own frame.
    ///
    /// Identity for everything but world boundaries, whose engine
    /// counterpart always passes through the origin.
    pub fn local_offset(&self, scale: &Vector3<f32>) -> Isometry3<f32> {
        match self {
            Self::WorldBoundary { normal, distance } => {
                let point = normal.normalize() * *distance;
                Isometry3::from_parts(
                    Translation3::from(point.component_mul(scale)),
                    UnitQuaternion::identity(),
                )
            }
            _ => Isometry3::identity(),
        }
    }

    /// Build the engine shape at unit scale
    pub fn build(&self) -> Result<rapier::SharedShape> {
        self.build_scaled(&Vector3::repeat(1.0))
    }

    /// Build the engine shape with `scale` baked into its geometry
    pub fn build_scaled(&self, scale: &Vector3<f32>) -> Result<rapier::SharedShape> {
        let abs = scale.abs();
        if abs.iter().any(|s| *s <= SCALE_EPSILON) {
            return Err(invalid(format!("scale {:?} collapses the shape", scale)));
        }

        let shape = match self {
            Self::Sphere { radius } => {
                warn_if_not_uniform(self.kind(), &abs, abs.x, abs.y, abs.z);
                rapier::SharedShape::ball(radius * abs.max())
            }
            Self::Box { half_extents } => {
                let he = half_extents.component_mul(&abs);
                rapier::SharedShape::cuboid(he.x, he.y, he.z)
            }
            Self::Capsule { radius, height } => {
                warn_if_not_uniform(self.kind(), &abs, abs.x, abs.z, abs.x);
                let radius = radius * abs.x.max(abs.z);
                let half_segment = (height * abs.y * 0.5 - radius).max(0.0);
                if half_segment <= f32::EPSILON {
                    rapier::SharedShape::ball(radius)
                } else {
                    rapier::SharedShape::capsule_y(half_segment, radius)
                }
            }
            Self::Cylinder { radius, height } => {
                warn_if_not_uniform(self.kind(), &abs, abs.x, abs.z, abs.x);
                rapier::SharedShape::cylinder(height * abs.y * 0.5, radius * abs.x.max(abs.z))
            }
            Self::ConvexPolygon { points } => {
                let scaled: Vec<_> = points
                    .iter()
                    .map(|p| Point3::from(p.coords.component_mul(scale)))
                    .collect();
                rapier::SharedShape::convex_hull(&scaled)
                    .ok_or_else(|| invalid("convex hull construction failed; points are degenerate"))?
            }
            Self::ConcavePolygon { faces } => {
                let (vertices, indices) = scaled_triangles(faces, scale);
                rapier::SharedShape::trimesh(vertices, indices)
            }
            Self::HeightMap {
                width,
                depth,
                heights,
            } => {
                let matrix = DMatrix::from_row_slice(*depth, *width, heights);
                rapier::SharedShape::heightfield(
                    matrix,
                    Vector3::new(
                        (*width - 1) as f32 * abs.x,
                        abs.y,
                        (*depth - 1) as f32 * abs.z,
                    ),
                )
            }
            Self::SeparationRay { length } => rapier::SharedShape::segment(
                Point3::origin(),
                Point3::new(0.0, 0.0, length * abs.z),
            ),
            Self::WorldBoundary { normal, .. } => {
                // Normals transform by the inverse scale.
                let scaled = normal.component_div(scale);
                rapier::SharedShape::halfspace(Unit::new_normalize(scaled))
            }
        };
        Ok(shape)
    }
}

fn warn_if_not_uniform(kind: ShapeKind, scale: &Vector3<f32>, a: f32, b: f32, c: f32) {
    if (a - b).abs() > SCALE_EPSILON || (a - c).abs() > SCALE_EPSILON {
        log::warn!(
            "{:?} shapes cannot be scaled non-uniformly; using the largest axis of {:?}",
            kind,
            scale
        );
    }
}

/// Scale a triangle soup, flipping winding when the scale mirrors it
fn scaled_triangles(faces: &[Point3<f32>], scale: &Vector3<f32>) -> (Vec<Point3<f32>>, Vec<[u32; 3]>) {
    let mirrored = scale.x * scale.y * scale.z < 0.0;
    let vertices = faces
        .iter()
        .map(|p| Point3::from(p.coords.component_mul(scale)))
        .collect();
    let indices = (0..faces.len() as u32 / 3)
        .map(|face| {
            let base = face * 3;
            if mirrored {
                [base, base + 2, base + 1]
            } else {
                [base, base + 1, base + 2]
            }
        })
        .collect();
    (vertices, indices)
}

// ==================== Shape Resource ====================

/// Shape geometry plus its build cache and owner counts
#[derive(Debug)]
pub struct Shape {
    data: Arc<ShapeData>,
    cached: Option<rapier::SharedShape>,
    owners: HashMap<ObjectRid, u32>,
}

impl Shape {
    pub fn new(data: ShapeData) -> Result<Self> {
        data.validate()?;
        Ok(Self {
            data: Arc::new(data),
            cached: None,
            owners: HashMap::new(),
        })
    }

    pub fn kind(&self) -> ShapeKind {
        self.data.kind()
    }

    pub fn data(&self) -> &Arc<ShapeData> {
        &self.data
    }

    /// Replace the defining data, dropping the cached engine shape.
    ///
    /// On error the previous data is kept. Owners must be rebuilt by the
    /// caller.
    pub fn set_data(&mut self, data: ShapeData) -> Result<()> {
        data.validate()?;
        self.data = Arc::new(data);
        self.cached = None;
        Ok(())
    }

    /// Engine shape at unit scale, built on first use
    pub fn build(&mut self) -> Result<rapier::SharedShape> {
        if let Some(shape) = &self.cached {
            return Ok(shape.clone());
        }
        let shape = self.data.build()?;
        self.cached = Some(shape.clone());
        Ok(shape)
    }

    /// Engine shape with `scale` baked in; reuses the cache at unit scale
    pub fn build_scaled(&mut self, scale: &Vector3<f32>) -> Result<rapier::SharedShape> {
        if is_unit_scale(scale) {
            self.build()
        } else {
            self.data.build_scaled(scale)
        }
    }

    pub fn is_built(&self) -> bool {
        self.cached.is_some()
    }

    // ==================== Owners ====================

    pub fn add_owner(&mut self, object: ObjectRid) {
        *self.owners.entry(object).or_insert(0) += 1;
    }

    /// Drop one reference; true when `object` no longer references the shape
    pub fn remove_owner(&mut self, object: ObjectRid) -> bool {
        match self.owners.get_mut(&object) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                self.owners.remove(&object);
                true
            }
            None => true,
        }
    }

    pub fn owner_count(&self, object: ObjectRid) -> u32 {
        self.owners.get(&object).copied().unwrap_or(0)
    }

    pub fn owners(&self) -> impl Iterator<Item = ObjectRid> + '_ {
        self.owners.keys().copied()
    }

    pub fn has_owners(&self) -> bool {
        !self.owners.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn cube_points() -> Vec<Point3<f32>> {
        let mut points = Vec::new();
        for x in [-1.0, 1.0] {
            for y in [-1.0, 1.0] {
                for z in [-1.0, 1.0] {
                    points.push(Point3::new(x, y, z));
                }
            }
        }
        points
    }

    #[test]
    fn test_validation() {
        assert!(ShapeData::Sphere { radius: 0.0 }.validate().is_err());
        assert!(ShapeData::Capsule { radius: 1.0, height: 1.0 }.validate().is_err());
        assert!(ShapeData::Capsule { radius: 0.5, height: 2.0 }.validate().is_ok());
        assert!(ShapeData::ConvexPolygon { points: vec![Point3::origin(); 3] }
            .validate()
            .is_err());
        assert!(ShapeData::ConcavePolygon { faces: vec![Point3::origin(); 4] }
            .validate()
            .is_err());
        assert!(ShapeData::SeparationRay { length: -1.0 }.validate().is_err());
        assert!(ShapeData::WorldBoundary {
            normal: Vector3::zeros(),
            distance: 0.0
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_height_map_dimensions() {
        let ok = ShapeData::HeightMap {
            width: 4,
            depth: 2,
            heights: vec![0.0; 8],
        };
        assert!(ok.validate().is_ok());

        let not_pow2 = ShapeData::HeightMap {
            width: 3,
            depth: 2,
            heights: vec![0.0; 6],
        };
        assert!(matches!(not_pow2.validate(), Err(PhysicsError::InvalidShape(_))));

        let short = ShapeData::HeightMap {
            width: 4,
            depth: 4,
            heights: vec![0.0; 15],
        };
        assert!(short.validate().is_err());
    }

    #[test]
    fn test_build_is_cached_until_data_changes() {
        let mut shape = Shape::new(ShapeData::Sphere { radius: 1.0 }).unwrap();
        let first = shape.build().unwrap();
        let second = shape.build().unwrap();
        assert!(Arc::ptr_eq(&first.0, &second.0));

        shape.set_data(ShapeData::Sphere { radius: 2.0 }).unwrap();
        assert!(!shape.is_built());
        let third = shape.build().unwrap();
        assert!(!Arc::ptr_eq(&first.0, &third.0));
        assert_relative_eq!(third.as_ball().unwrap().radius, 2.0);
    }

    #[test]
    fn test_set_data_rejects_and_keeps_old() {
        let mut shape = Shape::new(ShapeData::Sphere { radius: 1.0 }).unwrap();
        assert!(shape.set_data(ShapeData::Sphere { radius: -1.0 }).is_err());
        assert_eq!(**shape.data(), ShapeData::Sphere { radius: 1.0 });
    }

    #[test]
    fn test_scale_is_baked() {
        let data = ShapeData::Box {
            half_extents: Vector3::new(1.0, 2.0, 3.0),
        };
        let built = data.build_scaled(&Vector3::new(2.0, -1.0, 0.5)).unwrap();
        let cuboid = built.as_cuboid().unwrap();
        assert_relative_eq!(cuboid.half_extents, Vector3::new(2.0, 2.0, 1.5));

        let sphere = ShapeData::Sphere { radius: 1.0 }
            .build_scaled(&Vector3::new(1.0, 3.0, 2.0))
            .unwrap();
        assert_relative_eq!(sphere.as_ball().unwrap().radius, 3.0);
    }

    #[test]
    fn test_zero_scale_fails() {
        let data = ShapeData::Sphere { radius: 1.0 };
        assert!(data.build_scaled(&Vector3::new(0.0, 1.0, 1.0)).is_err());
    }

    #[test]
    fn test_mirrored_mesh_flips_winding() {
        let faces = vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
        ];
        let (_, plain) = scaled_triangles(&faces, &Vector3::new(1.0, 1.0, 1.0));
        let (vertices, mirrored) = scaled_triangles(&faces, &Vector3::new(-1.0, 1.0, 1.0));
        assert_eq!(plain, vec![[0, 1, 2]]);
        assert_eq!(mirrored, vec![[0, 2, 1]]);
        assert_relative_eq!(vertices[1].x, -1.0);
    }

    #[test]
    fn test_convex_hull_builds() {
        let shape = ShapeData::ConvexPolygon {
            points: cube_points(),
        };
        let built = shape.build().unwrap();
        let aabb = built.compute_local_aabb();
        assert_relative_eq!(aabb.maxs, Point3::new(1.0, 1.0, 1.0), epsilon = 1e-5);
    }

    #[test]
    fn test_world_boundary_offset() {
        let data = ShapeData::WorldBoundary {
            normal: Vector3::new(0.0, 2.0, 0.0),
            distance: 3.0,
        };
        let offset = data.local_offset(&Vector3::repeat(1.0));
        assert_relative_eq!(offset.translation.vector, Vector3::new(0.0, 3.0, 0.0));
        assert!(data.build().unwrap().as_halfspace().is_some());
    }

    #[test]
    fn test_owner_counts() {
        let mut shape = Shape::new(ShapeData::Sphere { radius: 1.0 }).unwrap();
        let a = ObjectRid::new(1, 0);
        let b = ObjectRid::new(2, 0);

        shape.add_owner(a);
        shape.add_owner(a);
        shape.add_owner(b);
        assert_eq!(shape.owner_count(a), 2);
        assert_eq!(shape.owners().count(), 2);

        assert!(!shape.remove_owner(a));
        assert!(shape.remove_owner(a));
        assert!(shape.remove_owner(b));
        assert!(!shape.has_owners());
    }
}
