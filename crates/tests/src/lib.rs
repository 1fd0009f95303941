//! Cross-crate integration tests for the policy engine
//!
//! The suites drive a [`patchbay_core::domain::manager::PolicyManager`] built
//! over the scripted HAL from `patchbay-infra` and assert on the resulting
//! command stream.

#[cfg(test)]
mod policy_integration;
