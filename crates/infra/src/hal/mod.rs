//! HAL client backends

pub mod fake;

pub use fake::{FakeHal, HalCommand};
