//! Tether Physics - Rapier 3D physics-server bridge
//!
//! This crate adapts the Rapier 3D engine to a host engine's physics-server
//! contract. The host talks in spaces, collision objects and shapes held by
//! opaque handles; the bridge keeps the matching engine bodies, colliders and
//! query structures in step with them.
//!
//! # Features
//!
//! - Bodies (static, kinematic, rigid, rigid-linear) and sensor areas
//! - Shape composition from scaled, offset and disabled shape instances
//! - Collision layers and masks interned into compact object-layer codes
//! - Per-bucket locked body records, readable from engine callbacks
//! - Ray, point, shape overlap and shape cast queries with pluggable collectors
//! - Area monitoring and gravity overrides
//! - Body-state and area-monitor notifications, bodies first
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                  PhysicsServer                   │
//! │  ┌──────────┐  ┌──────────────────┐  ┌────────┐  │
//! │  │  Spaces  │  │ CollisionObjects │  │ Shapes │  │
//! │  └────┬─────┘  └──────────────────┘  └────────┘  │
//! └───────┼──────────────────────────────────────────┘
//!         ▼
//! ┌──────────────────────────────────────────────────┐
//! │                  PhysicsSpace                    │
//! │  ┌─────────────┐ ┌───────────┐ ┌──────────────┐  │
//! │  │ LayerMapper │ │ BodyTable │ │ Notifications│  │
//! │  └─────────────┘ └───────────┘ └──────────────┘  │
//! │  ┌─────────────────────────────────────────────┐ │
//! │  │ PhysicsSystem (Rapier pipeline + hooks)     │ │
//! │  └─────────────────────────────────────────────┘ │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use tether_physics::prelude::*;
//!
//! let mut server = PhysicsServer::new();
//! let space = server.space_create(PhysicsConfig::default())?;
//!
//! let ball = server.shape_create(ShapeData::Sphere { radius: 0.5 })?;
//! let body = server.body_create(BodyMode::Rigid, 1);
//! server.object_add_shape(body, ball, &Transform3::identity(), false)?;
//! server.object_set_transform(body, Transform3::from_translation(0.0, 5.0, 0.0))?;
//! server.object_set_space(body, Some(space))?;
//!
//! server.space_step(space, 1.0 / 60.0)?;
//! server.space_dispatch(space)?;
//! ```

pub mod area;
pub mod body_access;
pub mod body_table;
pub mod collectors;
pub mod composition;
pub mod config;
pub mod error;
pub mod events;
pub mod layers;
pub mod math;
pub mod object;
pub mod query;
pub mod server;
pub mod shape;
pub mod space;
pub mod system;

pub mod prelude {
    //! Common imports for the physics bridge
    pub use crate::area::{GravityMode, GravityOverride};
    pub use crate::body_access::{BodyReader, BodyWriter};
    pub use crate::body_table::{BodyId, MotionType};
    pub use crate::collectors::{CollectStrategy, CollisionCollector};
    pub use crate::composition::{ComposedShape, ShapeInstanceId};
    pub use crate::config::PhysicsConfig;
    pub use crate::error::{PhysicsError, Result};
    pub use crate::events::{BodyState, MonitorEvent, MonitorEventKind, Notification};
    pub use crate::layers::{BroadPhaseCategory, LayerMapper, ObjectLayer};
    pub use crate::math::Transform3;
    pub use crate::object::{AreaParams, BodyMode, BodyParams, CollisionObject, ObjectRid};
    pub use crate::query::{CastMotion, QueryHit, SpaceQuery, SpaceQueryFilter};
    pub use crate::server::PhysicsServer;
    pub use crate::shape::{Shape, ShapeData, ShapeKind, ShapeRid};
    pub use crate::space::{PhysicsSpace, SpaceRid};
}

pub use prelude::*;
