//! # tether_core - Tether Core
//!
//! Zero-dependency primitives shared by the Tether physics bridge.
//!
//! The host engine never holds pointers into the bridge. It holds [`Rid`]s:
//! generational handles resolved through a [`RidOwner`], which also reports
//! anything still alive when it is torn down.

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(not(feature = "std"))]
extern crate alloc;

#[cfg(feature = "std")]
extern crate std as alloc;

pub mod rid;

pub use rid::*;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::rid::{LeakReport, Rid, RidOwner};
}
