//! Routing patches: explicit source→sink connections in the routing graph
//!
//! A patch connects one source port to one or more sink ports; ports are
//! either devices or opened mixes. Patches are first-class, handle-indexed
//! and uid-scoped; at most one patch exists per endpoint at a time.

use crate::domain::audio::{HalPatchHandle, IoHandle, PatchHandle, PolicyError, Result, Uid};
use crate::domain::device::DeviceType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Maximum number of sinks a single patch may carry
pub const MAX_PATCH_SINKS: usize = 16;

/// One end of a routing patch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatchPort {
    Device { device: DeviceType, address: String },
    Mix { io: IoHandle },
}

impl PatchPort {
    pub fn device(device: DeviceType, address: impl Into<String>) -> Self {
        PatchPort::Device {
            device,
            address: address.into(),
        }
    }

    pub fn mix(io: IoHandle) -> Self {
        PatchPort::Mix { io }
    }

    pub fn is_device(&self) -> bool {
        matches!(self, PatchPort::Device { .. })
    }
}

/// A patch creation request before it has been realized
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchRequest {
    pub source: PatchPort,
    pub sinks: Vec<PatchPort>,
}

impl PatchRequest {
    /// Role validation: exactly one source, 1..=MAX sinks, directions sane
    pub fn validate(&self) -> Result<()> {
        if self.sinks.is_empty() {
            return Err(PolicyError::InvalidArgument(
                "patch requires at least one sink".to_string(),
            ));
        }
        if self.sinks.len() > MAX_PATCH_SINKS {
            return Err(PolicyError::InvalidArgument(format!(
                "patch exceeds {} sinks",
                MAX_PATCH_SINKS
            )));
        }
        if let PatchPort::Device { device, .. } = &self.source {
            if device.is_output() {
                return Err(PolicyError::InvalidArgument(format!(
                    "output device {} cannot be a patch source",
                    device
                )));
            }
        }
        for sink in &self.sinks {
            if let PatchPort::Device { device, .. } = sink {
                if device.is_input() {
                    return Err(PolicyError::InvalidArgument(format!(
                        "input device {} cannot be a patch sink",
                        device
                    )));
                }
            }
        }
        Ok(())
    }
}

/// A realized patch tracked by the policy manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioPatch {
    pub handle: PatchHandle,
    pub source: PatchPort,
    pub sinks: Vec<PatchPort>,
    pub owner: Uid,
    /// Handle under which the HAL knows this patch, when realized there
    pub hal_handle: Option<HalPatchHandle>,
}

/// Handle-indexed patch table
#[derive(Debug, Default)]
pub struct PatchCollection {
    patches: BTreeMap<PatchHandle, AudioPatch>,
    next_handle: u32,
}

impl PatchCollection {
    pub fn new() -> Self {
        Self {
            patches: BTreeMap::new(),
            next_handle: 1,
        }
    }

    pub fn next_handle(&mut self) -> PatchHandle {
        let handle = PatchHandle::new(self.next_handle);
        self.next_handle += 1;
        handle
    }

    /// Insert or replace; replacing keeps the handle stable
    pub fn put(&mut self, patch: AudioPatch) {
        self.patches.insert(patch.handle, patch);
    }

    pub fn remove(&mut self, handle: PatchHandle) -> Result<AudioPatch> {
        self.patches
            .remove(&handle)
            .ok_or_else(|| PolicyError::NotFound(format!("patch {handle} not found")))
    }

    pub fn get(&self, handle: PatchHandle) -> Option<&AudioPatch> {
        self.patches.get(&handle)
    }

    /// Existing patch sourced from the given mix port, for update-in-place
    pub fn find_by_source_mix(&self, io: IoHandle) -> Option<PatchHandle> {
        self.patches
            .values()
            .find(|p| matches!(&p.source, PatchPort::Mix { io: i } if *i == io))
            .map(|p| p.handle)
    }

    /// Existing patch whose source is the given device, for update-in-place
    pub fn find_by_source_device(
        &self,
        device: DeviceType,
        address: &str,
    ) -> Option<PatchHandle> {
        self.patches
            .values()
            .find(|p| matches!(&p.source, PatchPort::Device { device: d, address: a } if *d == device && a == address))
            .map(|p| p.handle)
    }

    pub fn owned_by(&self, uid: Uid) -> Vec<PatchHandle> {
        self.patches
            .values()
            .filter(|p| p.owner == uid)
            .map(|p| p.handle)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AudioPatch> {
        self.patches.values()
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_rejects_bad_roles() {
        // Output device as source
        let request = PatchRequest {
            source: PatchPort::device(DeviceType::Speaker, ""),
            sinks: vec![PatchPort::device(DeviceType::WiredHeadset, "")],
        };
        assert!(request.validate().is_err());

        // Input device as sink
        let request = PatchRequest {
            source: PatchPort::device(DeviceType::BuiltinMic, ""),
            sinks: vec![PatchPort::device(DeviceType::BackMic, "")],
        };
        assert!(request.validate().is_err());

        // No sinks
        let request = PatchRequest {
            source: PatchPort::mix(IoHandle::new(1)),
            sinks: vec![],
        };
        assert!(request.validate().is_err());

        // Mix to output device is fine
        let request = PatchRequest {
            source: PatchPort::mix(IoHandle::new(1)),
            sinks: vec![PatchPort::device(DeviceType::Speaker, "")],
        };
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_collection_handles_are_stable() {
        let mut patches = PatchCollection::new();
        let h1 = patches.next_handle();
        let h2 = patches.next_handle();
        assert_ne!(h1, h2);

        patches.put(AudioPatch {
            handle: h1,
            source: PatchPort::device(DeviceType::BuiltinMic, ""),
            sinks: vec![PatchPort::mix(IoHandle::new(9))],
            owner: Uid(1000),
            hal_handle: None,
        });
        assert_eq!(patches.len(), 1);
        assert!(patches.get(h1).is_some());
        assert!(patches.remove(h2).is_err());
        assert!(patches.remove(h1).is_ok());
        assert!(patches.is_empty());
    }

    #[test]
    fn test_find_by_source_device() {
        let mut patches = PatchCollection::new();
        let handle = patches.next_handle();
        patches.put(AudioPatch {
            handle,
            source: PatchPort::device(DeviceType::FmTuner, ""),
            sinks: vec![PatchPort::device(DeviceType::Speaker, "")],
            owner: Uid(1000),
            hal_handle: Some(HalPatchHandle::new(7)),
        });

        assert_eq!(patches.find_by_source_device(DeviceType::FmTuner, ""), Some(handle));
        assert_eq!(patches.find_by_source_device(DeviceType::BuiltinMic, ""), None);

        let mix_handle = patches.next_handle();
        patches.put(AudioPatch {
            handle: mix_handle,
            source: PatchPort::mix(IoHandle::new(3)),
            sinks: vec![PatchPort::device(DeviceType::Speaker, "")],
            owner: Uid(1000),
            hal_handle: None,
        });
        assert_eq!(patches.find_by_source_mix(IoHandle::new(3)), Some(mix_handle));
        assert_eq!(patches.find_by_source_mix(IoHandle::new(4)), None);
    }

    #[test]
    fn test_owned_by() {
        let mut patches = PatchCollection::new();
        for uid in [1000, 1000, 2000] {
            let handle = patches.next_handle();
            patches.put(AudioPatch {
                handle,
                source: PatchPort::mix(IoHandle::new(1)),
                sinks: vec![PatchPort::device(DeviceType::Speaker, "")],
                owner: Uid(uid),
                hal_handle: None,
            });
        }
        assert_eq!(patches.owned_by(Uid(1000)).len(), 2);
        assert_eq!(patches.owned_by(Uid(3000)).len(), 0);
    }
}
