//! Domain entities and business rules

pub mod audio;
pub mod config;
pub mod descriptor;
pub mod device;
pub mod engine;
pub mod hal;
pub mod manager;
pub mod mix;
pub mod patch;
pub mod profile;
pub mod session;
pub mod volume;

// Re-export specific items to avoid ambiguous glob imports
pub use audio::{
    AudioAttributes, AudioFormat, ChannelMask, ForceUsage, ForcedConfig, InputFlags, InputSource,
    IoHandle, ModuleHandle, OutputFlags, PatchHandle, PhoneState, PolicyError, PortId,
    ProfileHandle, Result, Session, StreamType, Uid, Usage,
};
pub use device::{DeviceCategory, DeviceDescriptor, DeviceSet, DeviceType, DeviceVector};
pub use engine::{
    strategy_for_stream, DefaultVendorHooks, PolicyEngine, Strategy, VendorPolicyHooks,
};
pub use hal::{HalClient, InputConfig, MixState, OutputConfig, PolicyTone};
pub use manager::PolicyManager;
pub use volume::PolicyTuning;
