//! Error types for the physics bridge

use crate::object::ObjectRid;
use crate::shape::ShapeRid;
use crate::space::SpaceRid;
use thiserror::Error;

/// Physics bridge errors
#[derive(Debug, Error)]
pub enum PhysicsError {
    /// Space handle does not resolve
    #[error("Physics space not found: {0:?}")]
    SpaceNotFound(SpaceRid),

    /// Collision object handle does not resolve
    #[error("Collision object not found: {0:?}")]
    ObjectNotFound(ObjectRid),

    /// Shape handle does not resolve
    #[error("Shape not found: {0:?}")]
    ShapeNotFound(ShapeRid),

    /// Shape instance index past the end of the object's shape list
    #[error("Shape index {index} out of bounds (object has {count} shapes)")]
    ShapeIndexOutOfBounds { index: usize, count: usize },

    /// Operation needs the object to be in a space
    #[error("Collision object {0:?} is not in a space")]
    ObjectNotInSpace(ObjectRid),

    /// Every object-layer code in the space is taken
    #[error("Object layer codes exhausted ({limit} distinct collision layer/mask pairs)")]
    LayerCodesExhausted { limit: usize },

    /// The engine body table is full
    #[error("Body limit reached ({limit} bodies)")]
    BodyLimitReached { limit: u32 },

    /// Malformed shape data
    #[error("Invalid shape data: {0}")]
    InvalidShape(String),

    /// Invalid configuration
    #[error("Invalid physics configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for physics operations
pub type Result<T> = std::result::Result<T, PhysicsError>;
