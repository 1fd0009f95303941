//! patchbay-core: audio routing and volume-policy engine
//!
//! The core crate owns the device/output/input topology, the routing strategy
//! engine and the volume computation pipeline. Hardware access goes through
//! the [`domain::hal::HalClient`] capability; concrete backends live in the
//! `infra` crate.

pub mod domain;
