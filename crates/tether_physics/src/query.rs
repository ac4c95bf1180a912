//! Direct space state: ray casts, overlaps and shape sweeps
//!
//! Every query funnels its raw engine hits through a [`CollectStrategy`]
//! collector, then resolves the survivors to host-facing [`QueryHit`]s
//! under a [`BodyReader`] covering only the bodies that were hit. Hits on
//! bodies removed in the meantime are dropped, not reported as errors.

use crate::body_access::BodyReader;
use crate::body_table::BodyId;
use crate::collectors::{CollectStrategy, CollectedHit, CollisionCollector};
use crate::object::ObjectRid;
use crate::system::{ColliderTag, PhysicsSystem};
use rapier3d::na::{Isometry3, Point3, Translation3, Vector3};
use rapier3d::parry::bounding_volume::BoundingVolume;
use rapier3d::parry::query::ShapeCastOptions;
use rapier3d::prelude as rapier;

/// Filter applied to every direct-state query
#[derive(Debug, Clone, PartialEq)]
pub struct SpaceQueryFilter {
    /// Objects whose collision layer does not intersect this are skipped
    pub collision_mask: u32,
    pub collide_with_bodies: bool,
    pub collide_with_areas: bool,
    pub exclude: Vec<ObjectRid>,
}

impl Default for SpaceQueryFilter {
    fn default() -> Self {
        Self {
            collision_mask: u32::MAX,
            collide_with_bodies: true,
            collide_with_areas: false,
            exclude: Vec::new(),
        }
    }
}

impl SpaceQueryFilter {
    /// Set the collision mask (builder pattern)
    pub fn with_mask(mut self, mask: u32) -> Self {
        self.collision_mask = mask;
        self
    }

    /// Include areas in the results
    pub fn with_areas(mut self, collide_with_areas: bool) -> Self {
        self.collide_with_areas = collide_with_areas;
        self
    }

    /// Include bodies in the results
    pub fn with_bodies(mut self, collide_with_bodies: bool) -> Self {
        self.collide_with_bodies = collide_with_bodies;
        self
    }

    /// Skip an object
    pub fn exclude(mut self, object: ObjectRid) -> Self {
        self.exclude.push(object);
        self
    }
}

/// One query result
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueryHit {
    pub object: ObjectRid,
    pub body: BodyId,
    /// Host instance of the object
    pub instance_id: u64,
    /// Index of the hit shape on the object
    pub shape: usize,
    /// World-space point on the hit object
    pub point: Point3<f32>,
    /// World-space surface normal of the hit object
    pub normal: Vector3<f32>,
    /// Ray/sweep parameter of the hit, or signed distance for overlaps
    pub fraction: f32,
}

/// Contact between a query shape and one object
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContactPoints {
    pub hit: QueryHit,
    /// World-space point on the query shape
    pub query_point: Point3<f32>,
}

/// How far a shape can travel along a motion
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CastMotion {
    /// Largest fraction with no contact
    pub safe: f32,
    /// Smallest fraction with contact
    pub unsafe_: f32,
}

impl CastMotion {
    pub const UNBLOCKED: Self = Self {
        safe: 1.0,
        unsafe_: 1.0,
    };
}

/// Margin kept between a cast shape and what it hits, in world units
const CAST_MARGIN: f32 = 1.0e-3;

#[derive(Debug, Clone, Copy)]
struct RawHit {
    tag: ColliderTag,
    point: Point3<f32>,
    normal: Vector3<f32>,
    fraction: f32,
    query_point: Point3<f32>,
}

impl CollectedHit for RawHit {
    fn fraction(&self) -> f32 {
        self.fraction
    }
}

/// Read-only query view over one space's engine state
pub struct SpaceQuery<'a> {
    system: &'a PhysicsSystem,
}

impl<'a> SpaceQuery<'a> {
    pub fn new(system: &'a PhysicsSystem) -> Self {
        Self { system }
    }

    fn accepts(&self, filter: &SpaceQueryFilter, collider: &rapier::Collider) -> bool {
        let allowed = if collider.is_sensor() {
            filter.collide_with_areas
        } else {
            filter.collide_with_bodies
        };
        if !allowed {
            return false;
        }
        let tag = ColliderTag::unpack(collider.user_data);
        !filter.exclude.contains(&tag.object)
            && self
                .system
                .filter()
                .query_matches(tag.layer, filter.collision_mask)
    }

    fn tag_of(&self, handle: rapier::ColliderHandle) -> Option<ColliderTag> {
        self.system
            .colliders()
            .get(handle)
            .map(|collider| ColliderTag::unpack(collider.user_data))
    }

    /// Cast a ray from `from` to `to`. With `hit_from_inside`, a ray
    /// starting inside a shape hits it at fraction 0 with a zero normal.
    pub fn intersect_ray(
        &self,
        from: Point3<f32>,
        to: Point3<f32>,
        filter: &SpaceQueryFilter,
        hit_from_inside: bool,
        strategy: CollectStrategy,
    ) -> Vec<QueryHit> {
        let direction = to - from;
        if direction.norm_squared() <= f32::EPSILON {
            return Vec::new();
        }
        let ray = rapier::Ray::new(from, direction);
        let predicate = |_: rapier::ColliderHandle, collider: &rapier::Collider| self.accepts(filter, collider);
        let query_filter = rapier::QueryFilter::new().predicate(&predicate);
        let mut collector = strategy.collector::<RawHit>();

        let to_hit = |handle, intersection: rapier::RayIntersection| {
            self.tag_of(handle).map(|tag| RawHit {
                tag,
                point: ray.point_at(intersection.time_of_impact),
                normal: intersection.normal,
                fraction: intersection.time_of_impact,
                query_point: from,
            })
        };

        if strategy == CollectStrategy::Closest {
            if let Some((handle, intersection)) = self.system.query_pipeline().cast_ray_and_get_normal(
                self.system.bodies(),
                self.system.colliders(),
                &ray,
                1.0,
                hit_from_inside,
                query_filter,
            ) {
                if let Some(hit) = to_hit(handle, intersection) {
                    collector.add_hit(hit);
                }
            }
        } else {
            self.system.query_pipeline().intersections_with_ray(
                self.system.bodies(),
                self.system.colliders(),
                &ray,
                1.0,
                hit_from_inside,
                query_filter,
                |handle, intersection| {
                    if collector.accepts(intersection.time_of_impact) {
                        if let Some(hit) = to_hit(handle, intersection) {
                            collector.add_hit(hit);
                        }
                    }
                    !collector.should_early_out()
                },
            );
        }

        self.resolve(&mut collector)
            .into_iter()
            .map(|(hit, _)| hit)
            .collect()
    }

    /// Objects containing `point`, at most one hit per object
    pub fn intersect_point(
        &self,
        point: Point3<f32>,
        filter: &SpaceQueryFilter,
        strategy: CollectStrategy,
    ) -> Vec<QueryHit> {
        let predicate = |_: rapier::ColliderHandle, collider: &rapier::Collider| self.accepts(filter, collider);
        let query_filter = rapier::QueryFilter::new().predicate(&predicate);
        let mut collector = strategy.collector::<RawHit>();
        let mut seen = Vec::new();

        self.system.query_pipeline().intersections_with_point(
            self.system.bodies(),
            self.system.colliders(),
            &point,
            query_filter,
            |handle| {
                if let Some(tag) = self.tag_of(handle) {
                    if !seen.contains(&tag.object) {
                        seen.push(tag.object);
                        collector.add_hit(RawHit {
                            tag,
                            point,
                            normal: Vector3::zeros(),
                            fraction: 0.0,
                            query_point: point,
                        });
                    }
                }
                !collector.should_early_out()
            },
        );

        self.resolve(&mut collector)
            .into_iter()
            .map(|(hit, _)| hit)
            .collect()
    }

    fn overlap_hits(
        &self,
        shape: &rapier::SharedShape,
        pose: &Isometry3<f32>,
        filter: &SpaceQueryFilter,
        strategy: CollectStrategy,
    ) -> Vec<(QueryHit, Point3<f32>)> {
        let predicate = |_: rapier::ColliderHandle, collider: &rapier::Collider| self.accepts(filter, collider);
        let query_filter = rapier::QueryFilter::new().predicate(&predicate);

        let mut candidates = Vec::new();
        self.system.query_pipeline().intersections_with_shape(
            self.system.bodies(),
            self.system.colliders(),
            pose,
            shape.as_ref(),
            query_filter,
            |handle| {
                candidates.push(handle);
                true
            },
        );

        let mut collector = strategy.collector::<RawHit>();
        for handle in candidates {
            let Some(collider) = self.system.colliders().get(handle) else {
                continue;
            };
            let Ok(Some(contact)) = rapier3d::parry::query::contact(
                pose,
                shape.as_ref(),
                collider.position(),
                collider.shape(),
                0.0,
            ) else {
                continue;
            };
            if !collector.accepts(contact.dist) {
                continue;
            }
            collector.add_hit(RawHit {
                tag: ColliderTag::unpack(collider.user_data),
                point: contact.point2,
                normal: contact.normal2.into_inner(),
                fraction: contact.dist,
                query_point: contact.point1,
            });
            if collector.should_early_out() {
                break;
            }
        }

        self.resolve(&mut collector)
    }

    /// Objects overlapping `shape` at `pose`, deepest penetration first.
    /// The fraction of each hit is its signed distance, so minus the depth.
    pub fn intersect_shape(
        &self,
        shape: &rapier::SharedShape,
        pose: &Isometry3<f32>,
        filter: &SpaceQueryFilter,
        strategy: CollectStrategy,
    ) -> Vec<QueryHit> {
        self.overlap_hits(shape, pose, filter, strategy)
            .into_iter()
            .map(|(hit, _)| hit)
            .collect()
    }

    /// Contact point pairs between `shape` at `pose` and what it overlaps
    pub fn collide_shape(
        &self,
        shape: &rapier::SharedShape,
        pose: &Isometry3<f32>,
        filter: &SpaceQueryFilter,
        strategy: CollectStrategy,
    ) -> Vec<ContactPoints> {
        self.overlap_hits(shape, pose, filter, strategy)
            .into_iter()
            .map(|(hit, query_point)| ContactPoints { hit, query_point })
            .collect()
    }

    /// Sweep `shape` from `pose` along `motion`; fractions are in `0..=1`
    pub fn cast_shape(
        &self,
        shape: &rapier::SharedShape,
        pose: &Isometry3<f32>,
        motion: &Vector3<f32>,
        filter: &SpaceQueryFilter,
        strategy: CollectStrategy,
    ) -> Vec<QueryHit> {
        let start = shape.compute_aabb(pose);
        let end = shape.compute_aabb(&(Translation3::from(*motion) * *pose));
        let swept = start.merged(&end);

        let mut candidates = Vec::new();
        self.system
            .query_pipeline()
            .colliders_with_aabb_intersecting_aabb(&swept, |handle| {
                candidates.push(*handle);
                true
            });

        let options = ShapeCastOptions {
            max_time_of_impact: 1.0,
            stop_at_penetration: true,
            ..Default::default()
        };
        let mut collector = strategy.collector::<RawHit>();
        for handle in candidates {
            let Some(collider) = self.system.colliders().get(handle) else {
                continue;
            };
            if !self.accepts(filter, collider) {
                continue;
            }
            let Ok(Some(hit)) = rapier3d::parry::query::cast_shapes(
                pose,
                motion,
                shape.as_ref(),
                collider.position(),
                &Vector3::zeros(),
                collider.shape(),
                options,
            ) else {
                continue;
            };
            if !collector.accepts(hit.time_of_impact) {
                continue;
            }
            let other = collider.position();
            collector.add_hit(RawHit {
                tag: ColliderTag::unpack(collider.user_data),
                point: other.transform_point(&hit.witness2),
                normal: other.rotation * hit.normal2.into_inner(),
                fraction: hit.time_of_impact,
                query_point: (Translation3::from(motion * hit.time_of_impact) * *pose).transform_point(&hit.witness1),
            });
            if collector.should_early_out() {
                break;
            }
        }

        self.resolve(&mut collector)
            .into_iter()
            .map(|(hit, _)| hit)
            .collect()
    }

    /// Safe and unsafe fractions of `motion` before `shape` hits anything
    pub fn cast_motion(
        &self,
        shape: &rapier::SharedShape,
        pose: &Isometry3<f32>,
        motion: &Vector3<f32>,
        filter: &SpaceQueryFilter,
    ) -> CastMotion {
        let length = motion.norm();
        if length <= f32::EPSILON {
            return CastMotion::UNBLOCKED;
        }
        let Some(hit) = self
            .cast_shape(shape, pose, motion, filter, CollectStrategy::Closest)
            .into_iter()
            .next()
        else {
            return CastMotion::UNBLOCKED;
        };

        let margin = CAST_MARGIN / length;
        CastMotion {
            safe: (hit.fraction - margin).max(0.0),
            unsafe_: (hit.fraction + margin).min(1.0),
        }
    }

    /// Turn collected raw hits into host hits ranked by fraction, dropping
    /// stale bodies
    fn resolve(&self, collector: &mut impl CollisionCollector<RawHit>) -> Vec<(QueryHit, Point3<f32>)> {
        let mut raw = collector.take_hits();
        if raw.is_empty() {
            return Vec::new();
        }
        raw.sort_by(|a, b| a.fraction.total_cmp(&b.fraction));
        let ids: Vec<BodyId> = raw.iter().map(|hit| hit.tag.body).collect();
        let reader = BodyReader::lock(self.system.table(), &ids);

        raw.into_iter()
            .filter_map(|hit| {
                let record = reader.try_get(hit.tag.body)?;
                let shape = record.shape_index(hit.tag.instance)?;
                Some((
                    QueryHit {
                        object: hit.tag.object,
                        body: hit.tag.body,
                        instance_id: record.instance_id,
                        shape,
                        point: hit.point,
                        normal: hit.normal,
                        fraction: hit.fraction,
                    },
                    hit.query_point,
                ))
            })
            .collect()
    }
}
