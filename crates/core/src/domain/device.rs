//! Audio device types, device set algebra and the attached-device registry
//!
//! Devices are identified by a kind plus an address string; the address
//! disambiguates several devices of the same kind (two remote submix
//! endpoints, two USB cards). `DeviceSet` is the bitmask currency the
//! routing engine trades in.

use crate::domain::audio::{
    AudioFormat, ChannelMask, ModuleHandle, PolicyError, PortId, Result,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Physical or virtual audio device kinds.
///
/// Output kinds occupy bits 0..32 of a [`DeviceSet`], input kinds the upper
/// half, so a set can never accidentally mix directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    // Outputs
    Earpiece,
    Speaker,
    WiredHeadset,
    WiredHeadphone,
    BluetoothSco,
    BluetoothScoHeadset,
    BluetoothScoCarkit,
    BluetoothA2dp,
    BluetoothA2dpHeadphones,
    BluetoothA2dpSpeaker,
    Hdmi,
    AnlgDockHeadset,
    DgtlDockHeadset,
    UsbAccessory,
    UsbDevice,
    RemoteSubmix,
    TelephonyTx,
    Line,
    HdmiArc,
    Spdif,
    Fm,
    AuxLine,
    SpeakerSafe,
    // Inputs
    BuiltinMic,
    BackMic,
    WiredHeadsetMic,
    BluetoothScoHeadsetMic,
    HdmiIn,
    TelephonyRx,
    UsbDeviceIn,
    RemoteSubmixIn,
    FmTuner,
    LineIn,
}

impl DeviceType {
    pub const ALL: [DeviceType; 33] = [
        DeviceType::Earpiece,
        DeviceType::Speaker,
        DeviceType::WiredHeadset,
        DeviceType::WiredHeadphone,
        DeviceType::BluetoothSco,
        DeviceType::BluetoothScoHeadset,
        DeviceType::BluetoothScoCarkit,
        DeviceType::BluetoothA2dp,
        DeviceType::BluetoothA2dpHeadphones,
        DeviceType::BluetoothA2dpSpeaker,
        DeviceType::Hdmi,
        DeviceType::AnlgDockHeadset,
        DeviceType::DgtlDockHeadset,
        DeviceType::UsbAccessory,
        DeviceType::UsbDevice,
        DeviceType::RemoteSubmix,
        DeviceType::TelephonyTx,
        DeviceType::Line,
        DeviceType::HdmiArc,
        DeviceType::Spdif,
        DeviceType::Fm,
        DeviceType::AuxLine,
        DeviceType::SpeakerSafe,
        DeviceType::BuiltinMic,
        DeviceType::BackMic,
        DeviceType::WiredHeadsetMic,
        DeviceType::BluetoothScoHeadsetMic,
        DeviceType::HdmiIn,
        DeviceType::TelephonyRx,
        DeviceType::UsbDeviceIn,
        DeviceType::RemoteSubmixIn,
        DeviceType::FmTuner,
        DeviceType::LineIn,
    ];

    const fn bit(self) -> u64 {
        match self {
            DeviceType::Earpiece => 1 << 0,
            DeviceType::Speaker => 1 << 1,
            DeviceType::WiredHeadset => 1 << 2,
            DeviceType::WiredHeadphone => 1 << 3,
            DeviceType::BluetoothSco => 1 << 4,
            DeviceType::BluetoothScoHeadset => 1 << 5,
            DeviceType::BluetoothScoCarkit => 1 << 6,
            DeviceType::BluetoothA2dp => 1 << 7,
            DeviceType::BluetoothA2dpHeadphones => 1 << 8,
            DeviceType::BluetoothA2dpSpeaker => 1 << 9,
            DeviceType::Hdmi => 1 << 10,
            DeviceType::AnlgDockHeadset => 1 << 11,
            DeviceType::DgtlDockHeadset => 1 << 12,
            DeviceType::UsbAccessory => 1 << 13,
            DeviceType::UsbDevice => 1 << 14,
            DeviceType::RemoteSubmix => 1 << 15,
            DeviceType::TelephonyTx => 1 << 16,
            DeviceType::Line => 1 << 17,
            DeviceType::HdmiArc => 1 << 18,
            DeviceType::Spdif => 1 << 19,
            DeviceType::Fm => 1 << 20,
            DeviceType::AuxLine => 1 << 21,
            DeviceType::SpeakerSafe => 1 << 22,
            DeviceType::BuiltinMic => 1 << 32,
            DeviceType::BackMic => 1 << 33,
            DeviceType::WiredHeadsetMic => 1 << 34,
            DeviceType::BluetoothScoHeadsetMic => 1 << 35,
            DeviceType::HdmiIn => 1 << 36,
            DeviceType::TelephonyRx => 1 << 37,
            DeviceType::UsbDeviceIn => 1 << 38,
            DeviceType::RemoteSubmixIn => 1 << 39,
            DeviceType::FmTuner => 1 << 40,
            DeviceType::LineIn => 1 << 41,
        }
    }

    pub fn is_output(self) -> bool {
        self.bit() < (1 << 32)
    }

    pub fn is_input(self) -> bool {
        !self.is_output()
    }

    pub fn is_a2dp(self) -> bool {
        matches!(
            self,
            DeviceType::BluetoothA2dp
                | DeviceType::BluetoothA2dpHeadphones
                | DeviceType::BluetoothA2dpSpeaker
        )
    }

    pub fn is_sco(self) -> bool {
        matches!(
            self,
            DeviceType::BluetoothSco
                | DeviceType::BluetoothScoHeadset
                | DeviceType::BluetoothScoCarkit
                | DeviceType::BluetoothScoHeadsetMic
        )
    }

    /// Digital devices start with empty capability lists and are probed
    /// once an endpoint reaching them is opened.
    pub fn is_digital(self) -> bool {
        matches!(
            self,
            DeviceType::Hdmi
                | DeviceType::HdmiArc
                | DeviceType::Spdif
                | DeviceType::UsbAccessory
                | DeviceType::UsbDevice
                | DeviceType::DgtlDockHeadset
                | DeviceType::HdmiIn
                | DeviceType::UsbDeviceIn
        )
    }

    /// Devices whose volume is not adjustable; always driven at full scale
    pub fn has_fixed_volume(self) -> bool {
        matches!(
            self,
            DeviceType::HdmiArc | DeviceType::Spdif | DeviceType::AuxLine
        )
    }

    /// Virtual capture devices are exempt from the single-active-input rule
    pub fn is_virtual_input(self) -> bool {
        matches!(self, DeviceType::RemoteSubmixIn)
    }

    pub fn from_name(name: &str) -> Option<DeviceType> {
        DeviceType::ALL
            .iter()
            .copied()
            .find(|d| d.name() == name)
    }

    pub fn name(self) -> &'static str {
        match self {
            DeviceType::Earpiece => "earpiece",
            DeviceType::Speaker => "speaker",
            DeviceType::WiredHeadset => "wired_headset",
            DeviceType::WiredHeadphone => "wired_headphone",
            DeviceType::BluetoothSco => "bt_sco",
            DeviceType::BluetoothScoHeadset => "bt_sco_headset",
            DeviceType::BluetoothScoCarkit => "bt_sco_carkit",
            DeviceType::BluetoothA2dp => "bt_a2dp",
            DeviceType::BluetoothA2dpHeadphones => "bt_a2dp_headphones",
            DeviceType::BluetoothA2dpSpeaker => "bt_a2dp_speaker",
            DeviceType::Hdmi => "hdmi",
            DeviceType::AnlgDockHeadset => "analog_dock_headset",
            DeviceType::DgtlDockHeadset => "digital_dock_headset",
            DeviceType::UsbAccessory => "usb_accessory",
            DeviceType::UsbDevice => "usb_device",
            DeviceType::RemoteSubmix => "remote_submix",
            DeviceType::TelephonyTx => "telephony_tx",
            DeviceType::Line => "line",
            DeviceType::HdmiArc => "hdmi_arc",
            DeviceType::Spdif => "spdif",
            DeviceType::Fm => "fm",
            DeviceType::AuxLine => "aux_line",
            DeviceType::SpeakerSafe => "speaker_safe",
            DeviceType::BuiltinMic => "builtin_mic",
            DeviceType::BackMic => "back_mic",
            DeviceType::WiredHeadsetMic => "wired_headset_mic",
            DeviceType::BluetoothScoHeadsetMic => "bt_sco_headset_mic",
            DeviceType::HdmiIn => "hdmi_in",
            DeviceType::TelephonyRx => "telephony_rx",
            DeviceType::UsbDeviceIn => "usb_device_in",
            DeviceType::RemoteSubmixIn => "remote_submix_in",
            DeviceType::FmTuner => "fm_tuner",
            DeviceType::LineIn => "line_in",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Set of device kinds, the currency of strategy resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct DeviceSet(u64);

impl DeviceSet {
    pub const EMPTY: DeviceSet = DeviceSet(0);

    pub fn of(device: DeviceType) -> DeviceSet {
        DeviceSet(device.bit())
    }

    pub fn a2dp_all() -> DeviceSet {
        DeviceSet::of(DeviceType::BluetoothA2dp)
            | DeviceSet::of(DeviceType::BluetoothA2dpHeadphones)
            | DeviceSet::of(DeviceType::BluetoothA2dpSpeaker)
    }

    pub fn sco_all() -> DeviceSet {
        DeviceSet::of(DeviceType::BluetoothSco)
            | DeviceSet::of(DeviceType::BluetoothScoHeadset)
            | DeviceSet::of(DeviceType::BluetoothScoCarkit)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn len(self) -> u32 {
        self.0.count_ones()
    }

    pub fn is_single(self) -> bool {
        self.len() == 1
    }

    pub fn contains(self, device: DeviceType) -> bool {
        self.0 & device.bit() != 0
    }

    pub fn contains_all(self, other: DeviceSet) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: DeviceSet) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, device: DeviceType) {
        self.0 |= device.bit();
    }

    pub fn remove(&mut self, device: DeviceType) {
        self.0 &= !device.bit();
    }

    pub fn difference(self, other: DeviceSet) -> DeviceSet {
        DeviceSet(self.0 & !other.0)
    }

    /// First device in bit order; the representative for category lookups
    pub fn primary(self) -> Option<DeviceType> {
        self.iter().next()
    }

    pub fn iter(self) -> impl Iterator<Item = DeviceType> {
        DeviceType::ALL
            .iter()
            .copied()
            .filter(move |d| self.contains(*d))
    }
}

impl std::ops::BitOr for DeviceSet {
    type Output = DeviceSet;

    fn bitor(self, rhs: DeviceSet) -> DeviceSet {
        DeviceSet(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for DeviceSet {
    fn bitor_assign(&mut self, rhs: DeviceSet) {
        self.0 |= rhs.0;
    }
}

impl std::ops::BitAnd for DeviceSet {
    type Output = DeviceSet;

    fn bitand(self, rhs: DeviceSet) -> DeviceSet {
        DeviceSet(self.0 & rhs.0)
    }
}

impl From<DeviceType> for DeviceSet {
    fn from(device: DeviceType) -> DeviceSet {
        DeviceSet::of(device)
    }
}

impl fmt::Display for DeviceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let mut first = true;
        for device in self.iter() {
            if !first {
                f.write_str("|")?;
            }
            f.write_str(device.name())?;
            first = false;
        }
        Ok(())
    }
}

/// Device grouping used to pick a volume curve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceCategory {
    Headset,
    Speaker,
    Earpiece,
    ExtMedia,
}

impl DeviceCategory {
    pub const COUNT: usize = 4;

    pub const ALL: [DeviceCategory; Self::COUNT] = [
        DeviceCategory::Headset,
        DeviceCategory::Speaker,
        DeviceCategory::Earpiece,
        DeviceCategory::ExtMedia,
    ];

    pub fn index(self) -> usize {
        match self {
            DeviceCategory::Headset => 0,
            DeviceCategory::Speaker => 1,
            DeviceCategory::Earpiece => 2,
            DeviceCategory::ExtMedia => 3,
        }
    }

    pub fn for_device(device: DeviceType) -> DeviceCategory {
        match device {
            DeviceType::Earpiece => DeviceCategory::Earpiece,
            DeviceType::WiredHeadset
            | DeviceType::WiredHeadphone
            | DeviceType::BluetoothSco
            | DeviceType::BluetoothScoHeadset
            | DeviceType::BluetoothScoCarkit
            | DeviceType::BluetoothA2dp
            | DeviceType::BluetoothA2dpHeadphones
            | DeviceType::AnlgDockHeadset
            | DeviceType::Line => DeviceCategory::Headset,
            DeviceType::Hdmi
            | DeviceType::HdmiArc
            | DeviceType::Spdif
            | DeviceType::AuxLine
            | DeviceType::DgtlDockHeadset
            | DeviceType::UsbAccessory
            | DeviceType::UsbDevice
            | DeviceType::RemoteSubmix => DeviceCategory::ExtMedia,
            _ => DeviceCategory::Speaker,
        }
    }

    /// Category of the representative device of a set; speaker when empty
    pub fn for_set(devices: DeviceSet) -> DeviceCategory {
        devices
            .primary()
            .map(DeviceCategory::for_device)
            .unwrap_or(DeviceCategory::Speaker)
    }
}

/// One physical or virtual audio device known to the policy manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub device_type: DeviceType,
    pub address: String,
    /// Assigned once the device is advertised as an audio port
    pub port_id: Option<PortId>,
    /// Module the device is reachable through; unattached devices are not routable
    pub module: Option<ModuleHandle>,
    pub sample_rates: Vec<u32>,
    pub formats: Vec<AudioFormat>,
    pub channel_masks: Vec<ChannelMask>,
}

impl DeviceDescriptor {
    pub fn new(device_type: DeviceType, address: impl Into<String>) -> Self {
        Self {
            device_type,
            address: address.into(),
            port_id: None,
            module: None,
            sample_rates: Vec::new(),
            formats: Vec::new(),
            channel_masks: Vec::new(),
        }
    }

    pub fn matches(&self, device_type: DeviceType, address: &str) -> bool {
        self.device_type == device_type && (address.is_empty() || self.address == address)
    }

    pub fn is_attached(&self) -> bool {
        self.module.is_some()
    }

    /// Replace capability lists with ones probed from an opened endpoint
    pub fn import_capabilities(
        &mut self,
        sample_rates: &[u32],
        formats: &[AudioFormat],
        channel_masks: &[ChannelMask],
    ) {
        for rate in sample_rates {
            if !self.sample_rates.contains(rate) {
                self.sample_rates.push(*rate);
            }
        }
        for format in formats {
            if !self.formats.contains(format) {
                self.formats.push(*format);
            }
        }
        for mask in channel_masks {
            if !self.channel_masks.contains(mask) {
                self.channel_masks.push(*mask);
            }
        }
    }

}

/// Registry of known devices, either the available set or a module's declared set
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceVector {
    devices: Vec<DeviceDescriptor>,
}

impl DeviceVector {
    /// Hard cap on registry growth, matching the fixed port tables downstream
    pub const MAX_DEVICES: usize = 64;

    pub fn new() -> Self {
        Self {
            devices: Vec::new(),
        }
    }

    pub fn add(&mut self, descriptor: DeviceDescriptor) -> Result<()> {
        if self.contains(descriptor.device_type, &descriptor.address) {
            return Err(PolicyError::InvalidState(format!(
                "device {} (addr '{}') already registered",
                descriptor.device_type, descriptor.address
            )));
        }
        if self.devices.len() >= Self::MAX_DEVICES {
            return Err(PolicyError::ResourceExhausted(format!(
                "device registry full ({} entries)",
                Self::MAX_DEVICES
            )));
        }
        debug!(device = %descriptor.device_type, address = %descriptor.address, "registering device");
        self.devices.push(descriptor);
        Ok(())
    }

    pub fn remove(&mut self, device_type: DeviceType, address: &str) -> Result<DeviceDescriptor> {
        let pos = self
            .devices
            .iter()
            .position(|d| d.matches(device_type, address))
            .ok_or_else(|| {
                PolicyError::NotFound(format!(
                    "device {} (addr '{}') not registered",
                    device_type, address
                ))
            })?;
        Ok(self.devices.remove(pos))
    }

    pub fn contains(&self, device_type: DeviceType, address: &str) -> bool {
        self.devices.iter().any(|d| d.matches(device_type, address))
    }

    pub fn get(&self, device_type: DeviceType, address: &str) -> Option<&DeviceDescriptor> {
        self.devices.iter().find(|d| d.matches(device_type, address))
    }

    pub fn get_mut(
        &mut self,
        device_type: DeviceType,
        address: &str,
    ) -> Option<&mut DeviceDescriptor> {
        self.devices
            .iter_mut()
            .find(|d| d.matches(device_type, address))
    }

    /// Union of the kinds present, regardless of address
    pub fn types(&self) -> DeviceSet {
        self.devices
            .iter()
            .fold(DeviceSet::EMPTY, |set, d| set | DeviceSet::of(d.device_type))
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceDescriptor> {
        self.devices.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut DeviceDescriptor> {
        self.devices.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Drop devices never attached to a loaded module
    pub fn prune_unattached(&mut self) {
        self.devices.retain(|d| {
            if !d.is_attached() {
                debug!(device = %d.device_type, "pruning unattached device");
            }
            d.is_attached()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_split() {
        assert!(DeviceType::Speaker.is_output());
        assert!(DeviceType::BuiltinMic.is_input());
        let set = DeviceSet::of(DeviceType::Speaker) | DeviceSet::of(DeviceType::BuiltinMic);
        assert_eq!(set.len(), 2);
        assert!(set.contains(DeviceType::Speaker));
        assert!(set.contains(DeviceType::BuiltinMic));
    }

    #[test]
    fn test_set_algebra() {
        let mut set = DeviceSet::EMPTY;
        assert!(set.is_empty());

        set.insert(DeviceType::WiredHeadset);
        set.insert(DeviceType::Speaker);
        assert_eq!(set.len(), 2);
        assert!(!set.is_single());

        let headset_only = set & DeviceSet::of(DeviceType::WiredHeadset);
        assert!(headset_only.is_single());
        assert_eq!(headset_only.primary(), Some(DeviceType::WiredHeadset));

        set.remove(DeviceType::Speaker);
        assert!(set.is_single());
        assert!(!set.intersects(DeviceSet::of(DeviceType::Speaker)));
    }

    #[test]
    fn test_primary_follows_bit_order() {
        let set = DeviceSet::of(DeviceType::WiredHeadphone) | DeviceSet::of(DeviceType::Earpiece);
        assert_eq!(set.primary(), Some(DeviceType::Earpiece));
    }

    #[test]
    fn test_device_category() {
        assert_eq!(
            DeviceCategory::for_device(DeviceType::WiredHeadset),
            DeviceCategory::Headset
        );
        assert_eq!(
            DeviceCategory::for_device(DeviceType::Speaker),
            DeviceCategory::Speaker
        );
        assert_eq!(
            DeviceCategory::for_device(DeviceType::Hdmi),
            DeviceCategory::ExtMedia
        );
        assert_eq!(DeviceCategory::for_set(DeviceSet::EMPTY), DeviceCategory::Speaker);
    }

    #[test]
    fn test_device_name_round_trip() {
        for device in DeviceType::ALL {
            assert_eq!(DeviceType::from_name(device.name()), Some(device));
        }
        assert_eq!(DeviceType::from_name("walkman"), None);
    }

    #[test]
    fn test_vector_duplicate_rejected() {
        let mut vector = DeviceVector::new();
        vector
            .add(DeviceDescriptor::new(DeviceType::Speaker, ""))
            .unwrap();
        assert!(vector
            .add(DeviceDescriptor::new(DeviceType::Speaker, ""))
            .is_err());

        // Same kind, different address is a distinct device
        vector
            .add(DeviceDescriptor::new(DeviceType::RemoteSubmix, "mix0"))
            .unwrap();
        vector
            .add(DeviceDescriptor::new(DeviceType::RemoteSubmix, "mix1"))
            .unwrap();
        assert_eq!(vector.len(), 3);
    }

    #[test]
    fn test_vector_remove_and_types() {
        let mut vector = DeviceVector::new();
        vector
            .add(DeviceDescriptor::new(DeviceType::Speaker, ""))
            .unwrap();
        vector
            .add(DeviceDescriptor::new(DeviceType::WiredHeadset, ""))
            .unwrap();

        assert!(vector.types().contains(DeviceType::WiredHeadset));

        vector.remove(DeviceType::WiredHeadset, "").unwrap();
        assert!(!vector.types().contains(DeviceType::WiredHeadset));
        assert!(vector.remove(DeviceType::WiredHeadset, "").is_err());
    }

    #[test]
    fn test_empty_address_matches_any() {
        let mut vector = DeviceVector::new();
        vector
            .add(DeviceDescriptor::new(DeviceType::RemoteSubmix, "mix0"))
            .unwrap();
        assert!(vector.contains(DeviceType::RemoteSubmix, ""));
        assert!(vector.contains(DeviceType::RemoteSubmix, "mix0"));
        assert!(!vector.contains(DeviceType::RemoteSubmix, "mix1"));
    }
}
