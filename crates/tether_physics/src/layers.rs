//! Collision layers and filtering
//!
//! The host describes filtering with two 32-bit masks per object (layer =
//! "what am I", mask = "what do I look for"). The engine side wants one
//! small integer per object. [`LayerMapper`] interns each distinct
//! (layer, mask) pair into a 13-bit code and packs it with a broad-phase
//! category into an [`ObjectLayer`].
//!
//! Interning happens on the thread that creates objects. Decoding happens
//! from engine worker threads during a step, so the reverse table lives in a
//! separately shared [`LayerFilter`] behind its own read/write lock.

use crate::error::{PhysicsError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Bits of an [`ObjectLayer`] holding the interned (layer, mask) code
pub const LAYER_CODE_BITS: u32 = 13;

/// Distinct (layer, mask) pairs one mapper can hold
pub const MAX_LAYER_CODES: usize = 1 << LAYER_CODE_BITS;

const CODE_MASK: u16 = (1 << LAYER_CODE_BITS) - 1;

/// Coarse broad-phase bucket an object is sorted into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum BroadPhaseCategory {
    /// Never moves; never tested against other static objects
    Static = 0,
    /// Kinematic and dynamic bodies, and areas
    Moving = 1,
    /// Takes part in nothing
    None = 2,
}

impl BroadPhaseCategory {
    fn from_bits(bits: u16) -> Option<Self> {
        match bits {
            0 => Some(Self::Static),
            1 => Some(Self::Moving),
            2 => Some(Self::None),
            _ => None,
        }
    }

    /// Cheap category-level pre-filter, evaluated before any mask test
    pub fn collides_with(self, other: Self) -> bool {
        match (self, other) {
            (Self::None, _) | (_, Self::None) => false,
            (Self::Static, Self::Static) => false,
            _ => true,
        }
    }
}

/// Flat layer identifier handed to the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectLayer(u16);

impl ObjectLayer {
    fn new(category: BroadPhaseCategory, code: u16) -> Self {
        debug_assert!(code <= CODE_MASK);
        Self(((category as u16) << LAYER_CODE_BITS) | code)
    }

    /// Raw packed value
    pub fn to_bits(self) -> u16 {
        self.0
    }

    pub fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    /// Interned (layer, mask) code
    pub fn code(self) -> u16 {
        self.0 & CODE_MASK
    }

    /// Broad-phase category, if the bits name one
    pub fn category(self) -> Option<BroadPhaseCategory> {
        BroadPhaseCategory::from_bits(self.0 >> LAYER_CODE_BITS)
    }
}

/// Decoded form of an [`ObjectLayer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayerPair {
    pub category: BroadPhaseCategory,
    pub layer: u32,
    pub mask: u32,
}

/// Reverse (code -> pair) table, shared with engine worker threads
#[derive(Debug, Default)]
pub struct LayerFilter {
    pairs: RwLock<Vec<(u32, u32)>>,
}

impl LayerFilter {
    /// Decode a layer; `None` for codes this mapper never issued
    pub fn decode(&self, layer: ObjectLayer) -> Option<LayerPair> {
        let category = layer.category()?;
        let (layer_bits, mask_bits) = *self.pairs.read().get(layer.code() as usize)?;
        Some(LayerPair {
            category,
            layer: layer_bits,
            mask: mask_bits,
        })
    }

    /// Whether two objects should be tested against each other at all.
    ///
    /// Either side scanning the other is enough: `mask_a & layer_b` or
    /// `mask_b & layer_a` being non-zero lets the pair through.
    pub fn should_collide(&self, a: ObjectLayer, b: ObjectLayer) -> bool {
        let (Some(cat_a), Some(cat_b)) = (a.category(), b.category()) else {
            return false;
        };
        if !cat_a.collides_with(cat_b) {
            return false;
        }

        let pairs = self.pairs.read();
        let (Some(&(layer_a, mask_a)), Some(&(layer_b, mask_b))) =
            (pairs.get(a.code() as usize), pairs.get(b.code() as usize))
        else {
            return false;
        };

        (mask_a & layer_b) != 0 || (mask_b & layer_a) != 0
    }

    /// Whether a query scanning `mask` can see an object on `layer`
    pub fn query_matches(&self, layer: ObjectLayer, mask: u32) -> bool {
        self.decode(layer).map_or(false, |pair| pair.layer & mask != 0)
    }
}

/// Interns (layer, mask) pairs into object-layer codes
#[derive(Debug)]
pub struct LayerMapper {
    forward: HashMap<(u32, u32), u16>,
    filter: Arc<LayerFilter>,
    limit: usize,
}

impl Default for LayerMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl LayerMapper {
    /// Create a mapper with the full 13-bit code space
    pub fn new() -> Self {
        Self::with_limit(MAX_LAYER_CODES)
    }

    fn with_limit(limit: usize) -> Self {
        let mut mapper = Self {
            forward: HashMap::new(),
            filter: Arc::new(LayerFilter::default()),
            limit: limit.min(MAX_LAYER_CODES),
        };
        // Code 0 is always "no layer, no mask".
        mapper.forward.insert((0, 0), 0);
        mapper.filter.pairs.write().push((0, 0));
        mapper
    }

    /// Encode a triple, allocating a new code on first sight of the pair.
    ///
    /// Codes are never reused or freed; running out is a configuration
    /// error the caller must surface.
    pub fn encode(
        &mut self,
        category: BroadPhaseCategory,
        layer: u32,
        mask: u32,
    ) -> Result<ObjectLayer> {
        if let Some(&code) = self.forward.get(&(layer, mask)) {
            return Ok(ObjectLayer::new(category, code));
        }

        let next = self.forward.len();
        if next >= self.limit {
            log::error!(
                "Out of object layer codes: {} distinct collision layer/mask pairs in use",
                self.limit
            );
            return Err(PhysicsError::LayerCodesExhausted { limit: self.limit });
        }

        let code = next as u16;
        self.forward.insert((layer, mask), code);
        self.filter.pairs.write().push((layer, mask));
        log::debug!(
            "Allocated object layer code {} for layer {:#x} / mask {:#x}",
            code,
            layer,
            mask
        );
        Ok(ObjectLayer::new(category, code))
    }

    /// Decode a layer back into its triple
    pub fn decode(&self, layer: ObjectLayer) -> Option<LayerPair> {
        self.filter.decode(layer)
    }

    pub fn should_collide(&self, a: ObjectLayer, b: ObjectLayer) -> bool {
        self.filter.should_collide(a, b)
    }

    /// Shared reverse table for use off the creating thread
    pub fn filter(&self) -> Arc<LayerFilter> {
        Arc::clone(&self.filter)
    }

    /// Number of codes issued so far (including the reserved code 0)
    pub fn code_count(&self) -> usize {
        self.forward.len()
    }
}
