//! Physics configuration
//!
//! Loaded by the host (project settings, a config file, ...) and read once
//! when a space is constructed.

use crate::error::{PhysicsError, Result};
use serde::{Deserialize, Serialize};

/// Upper bound on body mutex buckets; lock sets are `u64` bitmasks
pub const MAX_BODY_MUTEXES: u32 = 64;

/// Physics space configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhysicsConfig {
    /// Gravity vector (default: -9.81 in Y)
    pub gravity: [f32; 3],

    /// Maximum number of bodies per space
    pub max_bodies: u32,

    /// Contact pairs past this count trigger a one-time warning
    pub max_body_pairs: u32,

    /// Contact points past this count trigger a one-time warning
    pub max_contact_constraints: u32,

    /// Number of mutexes the body table is partitioned across
    pub body_mutex_count: u32,

    /// Solver iterations for velocity
    pub solver_iterations: usize,

    /// Enable sleeping for inactive bodies
    pub sleep_enabled: bool,

    /// Initial capacity of the per-step scratch arena, in bytes
    pub temp_arena_bytes: usize,
}

impl Default for PhysicsConfig {
    fn default() -> Self {
        Self {
            gravity: [0.0, -9.81, 0.0],
            max_bodies: 10240,
            max_body_pairs: 65536,
            max_contact_constraints: 20480,
            body_mutex_count: 32,
            solver_iterations: 4,
            sleep_enabled: true,
            temp_arena_bytes: 64 * 1024,
        }
    }
}

impl PhysicsConfig {
    /// Create a configuration for high-precision simulation
    pub fn high_precision() -> Self {
        Self {
            solver_iterations: 8,
            ..Default::default()
        }
    }

    /// Create a configuration for fast simulation (lower quality)
    pub fn fast() -> Self {
        Self {
            solver_iterations: 2,
            ..Default::default()
        }
    }

    /// Set gravity
    pub fn with_gravity(mut self, x: f32, y: f32, z: f32) -> Self {
        self.gravity = [x, y, z];
        self
    }

    /// Set the body limit
    pub fn with_max_bodies(mut self, max_bodies: u32) -> Self {
        self.max_bodies = max_bodies;
        self
    }

    /// Set the number of body mutex buckets
    pub fn with_body_mutex_count(mut self, count: u32) -> Self {
        self.body_mutex_count = count;
        self
    }

    /// Bucket count actually used: a power of two in `1..=64`
    pub fn effective_mutex_count(&self) -> u32 {
        self.body_mutex_count
            .clamp(1, MAX_BODY_MUTEXES)
            .next_power_of_two()
    }

    /// Reject settings a space cannot be built from
    pub fn validate(&self) -> Result<()> {
        if self.max_bodies == 0 {
            return Err(PhysicsError::InvalidConfig(
                "max_bodies must be at least 1".to_string(),
            ));
        }
        if self.solver_iterations == 0 {
            return Err(PhysicsError::InvalidConfig(
                "solver_iterations must be at least 1".to_string(),
            ));
        }
        if self.gravity.iter().any(|g| !g.is_finite()) {
            return Err(PhysicsError::InvalidConfig(format!(
                "gravity must be finite, got {:?}",
                self.gravity
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(PhysicsConfig::default().validate().is_ok());
        assert!(PhysicsConfig::fast().validate().is_ok());
        assert!(PhysicsConfig::high_precision().validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_bodies() {
        let config = PhysicsConfig::default().with_max_bodies(0);
        assert!(matches!(
            config.validate(),
            Err(PhysicsError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_mutex_count_is_power_of_two() {
        let config = PhysicsConfig::default().with_body_mutex_count(20);
        assert_eq!(config.effective_mutex_count(), 32);

        let config = PhysicsConfig::default().with_body_mutex_count(0);
        assert_eq!(config.effective_mutex_count(), 1);

        let config = PhysicsConfig::default().with_body_mutex_count(1000);
        assert_eq!(config.effective_mutex_count(), 64);
    }

    #[test]
    fn test_deserialize_partial() {
        let config: PhysicsConfig =
            serde_json::from_str(r#"{ "max_bodies": 16, "gravity": [0.0, -1.0, 0.0] }"#).unwrap();
        assert_eq!(config.max_bodies, 16);
        assert_eq!(config.gravity, [0.0, -1.0, 0.0]);
        assert_eq!(config.solver_iterations, 4);
    }
}
