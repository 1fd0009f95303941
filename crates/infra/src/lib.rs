//! patchbay-infra: HAL client implementations
//!
//! The core crate talks to hardware through the [`HalClient`] capability;
//! this crate provides the concrete backends. Right now that is the scripted
//! in-memory [`hal::FakeHal`], which records every command it receives and is
//! used both by the CLI demo and the test suites.
//!
//! [`HalClient`]: patchbay_core::domain::hal::HalClient

pub mod hal;

pub use hal::FakeHal;
