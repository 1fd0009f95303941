//! Static hardware topology: modules and the I/O profiles they expose
//!
//! Profiles come from the topology configuration. Empty capability lists mean
//! "dynamic": the real values are discovered by querying the HAL once an
//! endpoint using the profile is open.

use crate::domain::audio::{
    AudioFormat, ChannelMask, InputFlags, ModuleHandle, OutputFlags, ProfileHandle,
};
use crate::domain::device::{DeviceSet, DeviceType};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Direction of an I/O profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortDirection {
    Output,
    Input,
}

/// One directional port of a hardware module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IOProfile {
    pub handle: ProfileHandle,
    pub name: String,
    pub direction: PortDirection,
    pub devices: DeviceSet,
    /// Non-empty for address-keyed ports (remote submix endpoints)
    pub address: String,
    /// Empty list means the values are discovered dynamically
    pub sample_rates: Vec<u32>,
    pub formats: Vec<AudioFormat>,
    pub channel_masks: Vec<ChannelMask>,
    pub out_flags: OutputFlags,
    pub in_flags: InputFlags,
    /// Declared without capabilities; they are probed on device connection
    /// and dropped again on disconnection
    #[serde(default)]
    pub dynamic: bool,
}

impl IOProfile {
    pub fn new_output(
        handle: ProfileHandle,
        name: impl Into<String>,
        devices: DeviceSet,
        flags: OutputFlags,
    ) -> Self {
        Self {
            handle,
            name: name.into(),
            direction: PortDirection::Output,
            devices,
            address: String::new(),
            sample_rates: Vec::new(),
            formats: Vec::new(),
            channel_masks: Vec::new(),
            out_flags: flags,
            in_flags: InputFlags::NONE,
            dynamic: false,
        }
    }

    pub fn new_input(
        handle: ProfileHandle,
        name: impl Into<String>,
        devices: DeviceSet,
        flags: InputFlags,
    ) -> Self {
        Self {
            handle,
            name: name.into(),
            direction: PortDirection::Input,
            devices,
            address: String::new(),
            sample_rates: Vec::new(),
            formats: Vec::new(),
            channel_masks: Vec::new(),
            out_flags: OutputFlags::NONE,
            in_flags: flags,
            dynamic: false,
        }
    }

    pub fn is_direct(&self) -> bool {
        self.out_flags.contains(OutputFlags::DIRECT)
    }

    pub fn supports_device(&self, device: DeviceType, address: &str) -> bool {
        self.devices.contains(device) && (self.address.is_empty() || self.address == address)
    }

    /// True while any capability list still awaits HAL discovery
    pub fn has_dynamic_params(&self) -> bool {
        self.sample_rates.is_empty() || self.formats.is_empty() || self.channel_masks.is_empty()
    }

    /// Exact-match compatibility test for direct output requests
    pub fn is_compatible_output(
        &self,
        device: DeviceType,
        address: &str,
        sample_rate: u32,
        format: AudioFormat,
        channel_mask: ChannelMask,
        flags: OutputFlags,
    ) -> bool {
        if self.direction != PortDirection::Output || !self.supports_device(device, address) {
            return false;
        }
        if !self.sample_rates.is_empty() && !self.sample_rates.contains(&sample_rate) {
            return false;
        }
        if !self.formats.is_empty() && !self.formats.contains(&format) {
            return false;
        }
        if !self.channel_masks.is_empty() && !self.channel_masks.contains(&channel_mask) {
            return false;
        }
        // All requested flags must be offered by the profile
        self.out_flags.contains(flags)
    }

    pub fn is_compatible_input(
        &self,
        device: DeviceType,
        address: &str,
        sample_rate: u32,
        format: AudioFormat,
        channel_mask: ChannelMask,
        flags: InputFlags,
    ) -> bool {
        if self.direction != PortDirection::Input || !self.supports_device(device, address) {
            return false;
        }
        if !self.sample_rates.is_empty() && !self.sample_rates.contains(&sample_rate) {
            return false;
        }
        if !self.formats.is_empty() && !self.formats.contains(&format) {
            return false;
        }
        if !self.channel_masks.is_empty() && !self.channel_masks.contains(&channel_mask) {
            return false;
        }
        self.in_flags.contains(flags)
    }

    /// Preferred configuration when the caller leaves parameters unspecified
    pub fn default_sample_rate(&self) -> u32 {
        self.sample_rates.iter().copied().max().unwrap_or(44_100)
    }

    pub fn default_format(&self) -> AudioFormat {
        self.formats.first().copied().unwrap_or(AudioFormat::Pcm16)
    }

    pub fn default_channel_mask(&self) -> ChannelMask {
        self.channel_masks.first().copied().unwrap_or(match self.direction {
            PortDirection::Output => ChannelMask::OutStereo,
            PortDirection::Input => ChannelMask::InStereo,
        })
    }

    /// Fill dynamic capability lists from a HAL parameter reply of the form
    /// `sup_sampling_rates=44100|48000;sup_formats=pcm16;sup_channels=out_stereo`
    pub fn import_from_parameters(&mut self, reply: &str) {
        for entry in reply.split(';') {
            let Some((key, value)) = entry.split_once('=') else {
                continue;
            };
            match key {
                crate::domain::hal::PARAM_SUP_SAMPLING_RATES => {
                    for rate in value.split('|').filter_map(|v| v.parse::<u32>().ok()) {
                        if !self.sample_rates.contains(&rate) {
                            self.sample_rates.push(rate);
                        }
                    }
                }
                crate::domain::hal::PARAM_SUP_FORMATS => {
                    for format in value.split('|').filter_map(AudioFormat::from_name) {
                        if !self.formats.contains(&format) {
                            self.formats.push(format);
                        }
                    }
                }
                crate::domain::hal::PARAM_SUP_CHANNELS => {
                    for mask in value.split('|').filter_map(ChannelMask::from_name) {
                        if !self.channel_masks.contains(&mask) {
                            self.channel_masks.push(mask);
                        }
                    }
                }
                other => {
                    warn!(key = other, "ignoring unknown capability parameter");
                }
            }
        }
        debug!(
            profile = %self.name,
            rates = self.sample_rates.len(),
            formats = self.formats.len(),
            channels = self.channel_masks.len(),
            "imported dynamic capabilities"
        );
    }

    pub fn clear_dynamic_params(&mut self) {
        self.sample_rates.clear();
        self.formats.clear();
        self.channel_masks.clear();
    }
}

/// A named hardware module grouping output and input profiles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HwModule {
    pub name: String,
    /// Assigned once the HAL has loaded the module; unloaded modules are unusable
    pub handle: Option<ModuleHandle>,
    pub outputs: Vec<IOProfile>,
    pub inputs: Vec<IOProfile>,
}

impl HwModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handle: None,
            outputs: Vec::new(),
            inputs: Vec::new(),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.handle.is_some()
    }

    pub fn supported_output_devices(&self) -> DeviceSet {
        self.outputs
            .iter()
            .fold(DeviceSet::EMPTY, |set, p| set | p.devices)
    }

    pub fn supported_input_devices(&self) -> DeviceSet {
        self.inputs
            .iter()
            .fold(DeviceSet::EMPTY, |set, p| set | p.devices)
    }

    pub fn profile(&self, handle: ProfileHandle) -> Option<&IOProfile> {
        self.outputs
            .iter()
            .chain(self.inputs.iter())
            .find(|p| p.handle == handle)
    }

    pub fn profile_mut(&mut self, handle: ProfileHandle) -> Option<&mut IOProfile> {
        self.outputs
            .iter_mut()
            .chain(self.inputs.iter_mut())
            .find(|p| p.handle == handle)
    }

    pub fn remove_profile(&mut self, handle: ProfileHandle) {
        self.outputs.retain(|p| p.handle != handle);
        self.inputs.retain(|p| p.handle != handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm_output_profile() -> IOProfile {
        let mut profile = IOProfile::new_output(
            ProfileHandle::new(1),
            "primary out",
            DeviceSet::of(DeviceType::Speaker) | DeviceSet::of(DeviceType::WiredHeadset),
            OutputFlags::PRIMARY,
        );
        profile.sample_rates = vec![44_100, 48_000];
        profile.formats = vec![AudioFormat::Pcm16];
        profile.channel_masks = vec![ChannelMask::OutStereo];
        profile
    }

    #[test]
    fn test_compatibility_exact() {
        let profile = pcm_output_profile();
        assert!(profile.is_compatible_output(
            DeviceType::Speaker,
            "",
            44_100,
            AudioFormat::Pcm16,
            ChannelMask::OutStereo,
            OutputFlags::NONE,
        ));
        assert!(!profile.is_compatible_output(
            DeviceType::Speaker,
            "",
            96_000,
            AudioFormat::Pcm16,
            ChannelMask::OutStereo,
            OutputFlags::NONE,
        ));
        assert!(!profile.is_compatible_output(
            DeviceType::Earpiece,
            "",
            44_100,
            AudioFormat::Pcm16,
            ChannelMask::OutStereo,
            OutputFlags::NONE,
        ));
    }

    #[test]
    fn test_dynamic_import() {
        let mut profile = IOProfile::new_output(
            ProfileHandle::new(2),
            "hdmi out",
            DeviceSet::of(DeviceType::Hdmi),
            OutputFlags::DIRECT,
        );
        assert!(profile.has_dynamic_params());

        profile.import_from_parameters(
            "sup_sampling_rates=44100|48000;sup_formats=pcm16|pcm24;sup_channels=out_stereo|out_5point1",
        );
        assert!(!profile.has_dynamic_params());
        assert_eq!(profile.sample_rates, vec![44_100, 48_000]);
        assert_eq!(profile.formats, vec![AudioFormat::Pcm16, AudioFormat::Pcm24]);
        assert_eq!(profile.default_sample_rate(), 48_000);

        profile.clear_dynamic_params();
        assert!(profile.has_dynamic_params());
    }

    #[test]
    fn test_address_keyed_profile() {
        let mut profile = IOProfile::new_output(
            ProfileHandle::new(3),
            "submix out",
            DeviceSet::of(DeviceType::RemoteSubmix),
            OutputFlags::NONE,
        );
        profile.address = "mix0".to_string();
        assert!(profile.supports_device(DeviceType::RemoteSubmix, "mix0"));
        assert!(!profile.supports_device(DeviceType::RemoteSubmix, "mix1"));
    }

    #[test]
    fn test_module_device_union() {
        let mut module = HwModule::new("primary");
        module.outputs.push(pcm_output_profile());
        module.inputs.push(IOProfile::new_input(
            ProfileHandle::new(4),
            "primary in",
            DeviceSet::of(DeviceType::BuiltinMic),
            InputFlags::NONE,
        ));

        assert!(module
            .supported_output_devices()
            .contains(DeviceType::WiredHeadset));
        assert!(module
            .supported_input_devices()
            .contains(DeviceType::BuiltinMic));
        assert!(module.profile(ProfileHandle::new(4)).is_some());
    }
}
