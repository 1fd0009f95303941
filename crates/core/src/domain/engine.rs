//! Routing strategy resolution
//!
//! Streams map onto a fixed set of strategies; each strategy resolves to a
//! device set given phone state, forced-use overrides and what is plugged in.
//! The engine also keeps a precomputed per-strategy device snapshot so that
//! cascading re-evaluations during a topology change see one consistent view.

use crate::domain::audio::{
    AttrFlags, AudioAttributes, ForceUsage, ForcedConfig, InputSource, PhoneState, PolicyError,
    Result, StreamType, Usage,
};
use crate::domain::device::{DeviceSet, DeviceType};
use tracing::{debug, trace};

/// Routing policy buckets; device selection is computed per strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    Phone,
    Sonification,
    SonificationRespectful,
    Media,
    Dtmf,
    EnforcedAudible,
    TransmittedThroughSpeaker,
    Accessibility,
    Rerouting,
}

impl Strategy {
    pub const COUNT: usize = 9;

    pub const ALL: [Strategy; Self::COUNT] = [
        Strategy::Phone,
        Strategy::Sonification,
        Strategy::SonificationRespectful,
        Strategy::Media,
        Strategy::Dtmf,
        Strategy::EnforcedAudible,
        Strategy::TransmittedThroughSpeaker,
        Strategy::Accessibility,
        Strategy::Rerouting,
    ];

    pub fn index(self) -> usize {
        match self {
            Strategy::Phone => 0,
            Strategy::Sonification => 1,
            Strategy::SonificationRespectful => 2,
            Strategy::Media => 3,
            Strategy::Dtmf => 4,
            Strategy::EnforcedAudible => 5,
            Strategy::TransmittedThroughSpeaker => 6,
            Strategy::Accessibility => 7,
            Strategy::Rerouting => 8,
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Strategy::Phone => "phone",
            Strategy::Sonification => "sonification",
            Strategy::SonificationRespectful => "sonification_respectful",
            Strategy::Media => "media",
            Strategy::Dtmf => "dtmf",
            Strategy::EnforcedAudible => "enforced_audible",
            Strategy::TransmittedThroughSpeaker => "transmitted_through_speaker",
            Strategy::Accessibility => "accessibility",
            Strategy::Rerouting => "rerouting",
        };
        write!(f, "{name}")
    }
}

/// Fixed stream-to-strategy mapping
pub fn strategy_for_stream(stream: StreamType) -> Strategy {
    match stream {
        StreamType::VoiceCall | StreamType::BluetoothSco => Strategy::Phone,
        StreamType::Ring | StreamType::Alarm => Strategy::Sonification,
        StreamType::Notification => Strategy::SonificationRespectful,
        StreamType::Dtmf => Strategy::Dtmf,
        // System sounds follow media so they move with it across outputs
        StreamType::System | StreamType::Music => Strategy::Media,
        StreamType::EnforcedAudible => Strategy::EnforcedAudible,
        StreamType::Tts => Strategy::TransmittedThroughSpeaker,
        StreamType::Accessibility => Strategy::Accessibility,
        StreamType::Rerouting => Strategy::Rerouting,
    }
}

/// Attribute-bundle heuristics mirroring the stream mapping
pub fn strategy_for_attributes(attrs: &AudioAttributes) -> Strategy {
    if attrs.flags.contains(AttrFlags::AUDIBILITY_ENFORCED) {
        return Strategy::EnforcedAudible;
    }
    if attrs.flags.contains(AttrFlags::BEACON) {
        return Strategy::TransmittedThroughSpeaker;
    }
    match attrs.usage {
        Usage::Media | Usage::Game | Usage::AssistanceNavigationGuidance | Usage::Unknown => {
            Strategy::Media
        }
        Usage::VoiceCommunication => Strategy::Phone,
        Usage::VoiceCommunicationSignalling => Strategy::Dtmf,
        Usage::NotificationRingtone | Usage::Alarm => Strategy::Sonification,
        Usage::Notification | Usage::NotificationEvent | Usage::AssistanceSonification => {
            Strategy::SonificationRespectful
        }
        Usage::AssistanceAccessibility => Strategy::Accessibility,
        Usage::VirtualSource => Strategy::Rerouting,
    }
}

/// Stream type an attribute bundle will render as, for volume purposes
pub fn stream_for_attributes(attrs: &AudioAttributes) -> StreamType {
    if attrs.flags.contains(AttrFlags::AUDIBILITY_ENFORCED) {
        return StreamType::EnforcedAudible;
    }
    match attrs.usage {
        Usage::Media
        | Usage::Game
        | Usage::AssistanceNavigationGuidance
        | Usage::Unknown
        | Usage::VirtualSource => StreamType::Music,
        Usage::VoiceCommunication => StreamType::VoiceCall,
        Usage::VoiceCommunicationSignalling => StreamType::Dtmf,
        Usage::Alarm => StreamType::Alarm,
        Usage::NotificationRingtone => StreamType::Ring,
        Usage::Notification | Usage::NotificationEvent | Usage::AssistanceSonification => {
            StreamType::Notification
        }
        Usage::AssistanceAccessibility => StreamType::Accessibility,
    }
}

/// Vendor-specific policy adjustments, called unconditionally by the core
pub trait VendorPolicyHooks: Send + Sync {
    /// Last word on the device set a strategy resolves to
    fn adjust_device_for_strategy(
        &self,
        _strategy: Strategy,
        proposed: DeviceSet,
        _available: DeviceSet,
    ) -> DeviceSet {
        proposed
    }

    /// Extra mute condition evaluated when a device switch mutes strategies
    fn should_force_mute(&self, _strategy: Strategy, _devices: DeviceSet) -> bool {
        false
    }
}

/// No vendor quirks
#[derive(Debug, Default)]
pub struct DefaultVendorHooks;

impl VendorPolicyHooks for DefaultVendorHooks {}

/// Per-strategy device resolution with a refreshable snapshot
#[derive(Debug)]
pub struct PolicyEngine {
    phone_state: PhoneState,
    force_use: [ForcedConfig; ForceUsage::COUNT],
    cached_devices: [DeviceSet; Strategy::COUNT],
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyEngine {
    pub fn new() -> Self {
        Self {
            phone_state: PhoneState::Normal,
            force_use: [ForcedConfig::None; ForceUsage::COUNT],
            cached_devices: [DeviceSet::EMPTY; Strategy::COUNT],
        }
    }

    pub fn phone_state(&self) -> PhoneState {
        self.phone_state
    }

    pub fn set_phone_state(&mut self, state: PhoneState) {
        self.phone_state = state;
    }

    pub fn force_use(&self, usage: ForceUsage) -> ForcedConfig {
        self.force_use[usage.index()]
    }

    pub fn set_force_use(&mut self, usage: ForceUsage, config: ForcedConfig) -> Result<()> {
        if !Self::force_config_valid(usage, config) {
            return Err(PolicyError::InvalidArgument(format!(
                "forced config {config:?} not valid for usage {usage:?}"
            )));
        }
        debug!(?usage, ?config, "forced use changed");
        self.force_use[usage.index()] = config;
        Ok(())
    }

    fn force_config_valid(usage: ForceUsage, config: ForcedConfig) -> bool {
        use ForcedConfig::*;
        match usage {
            ForceUsage::Communication => matches!(config, None | Speaker | BtSco),
            ForceUsage::Media => matches!(
                config,
                None | Headphones
                    | BtA2dp
                    | WiredAccessory
                    | AnalogDock
                    | DigitalDock
                    | Speaker
                    | NoBtA2dp
            ),
            ForceUsage::Record => matches!(config, None | BtSco | WiredAccessory),
            ForceUsage::Dock => matches!(
                config,
                None | WiredAccessory | BtCarDock | BtDeskDock | AnalogDock | DigitalDock
            ),
            ForceUsage::System => matches!(config, None | SystemEnforced),
            ForceUsage::HdmiSystemAudio => matches!(config, None | Speaker),
        }
    }

    /// Strategy evaluation order for rerouting an output. In-call strictly
    /// dominates forced-enforced-audible, so the enforced-audible bucket only
    /// jumps the queue outside of call and ring states.
    pub fn strategy_priority(&self) -> [Strategy; Strategy::COUNT] {
        let enforced_first = self.force_use(ForceUsage::System) == ForcedConfig::SystemEnforced
            && !self.phone_state.is_in_call()
            && self.phone_state != PhoneState::Ringtone;
        if enforced_first {
            [
                Strategy::EnforcedAudible,
                Strategy::Phone,
                Strategy::Accessibility,
                Strategy::Sonification,
                Strategy::SonificationRespectful,
                Strategy::Media,
                Strategy::Dtmf,
                Strategy::TransmittedThroughSpeaker,
                Strategy::Rerouting,
            ]
        } else {
            [
                Strategy::Phone,
                Strategy::EnforcedAudible,
                Strategy::Accessibility,
                Strategy::Sonification,
                Strategy::SonificationRespectful,
                Strategy::Media,
                Strategy::Dtmf,
                Strategy::TransmittedThroughSpeaker,
                Strategy::Rerouting,
            ]
        }
    }

    /// Refresh the per-strategy snapshot from the current topology
    pub fn update_device_cache(&mut self, available: DeviceSet, media_active: bool) {
        for strategy in Strategy::ALL {
            self.cached_devices[strategy.index()] =
                self.compute_device_for_strategy(strategy, available, media_active);
        }
        trace!(?available, "strategy device cache refreshed");
    }

    pub fn cached_device_for_strategy(&self, strategy: Strategy) -> DeviceSet {
        self.cached_devices[strategy.index()]
    }

    /// Resolve the device set for one strategy against what is available
    pub fn compute_device_for_strategy(
        &self,
        strategy: Strategy,
        available: DeviceSet,
        media_active: bool,
    ) -> DeviceSet {
        let devices = match strategy {
            Strategy::Phone => self.phone_devices(available),
            Strategy::Sonification => self.sonification_devices(available),
            Strategy::SonificationRespectful => {
                if self.phone_state.is_in_call() {
                    self.phone_devices(available)
                } else if media_active {
                    // Do not ring on the speaker while music plays on a headset
                    self.media_devices(available)
                } else {
                    self.sonification_devices(available)
                }
            }
            Strategy::Media => self.media_devices(available),
            Strategy::Dtmf => {
                if self.phone_state.is_in_call() {
                    self.phone_devices(available)
                } else {
                    self.media_devices(available)
                }
            }
            Strategy::EnforcedAudible => {
                // Camera shutter class sounds insist on the speaker when the
                // system-enforced mode is engaged outside of a call
                if !self.phone_state.is_in_call()
                    && self.force_use(ForceUsage::System) == ForcedConfig::SystemEnforced
                    && available.contains(DeviceType::Speaker)
                {
                    DeviceSet::of(DeviceType::Speaker)
                } else {
                    self.sonification_devices(available)
                }
            }
            Strategy::TransmittedThroughSpeaker => {
                DeviceSet::of(DeviceType::Speaker) & available
            }
            Strategy::Accessibility => {
                if self.phone_state.is_in_call() || self.phone_state == PhoneState::Ringtone {
                    self.sonification_devices(available)
                } else {
                    self.media_devices(available)
                }
            }
            // Rerouting streams land on policy mixes, never on a strategy device
            Strategy::Rerouting => DeviceSet::EMPTY,
        };
        trace!(%strategy, %devices, "strategy resolved");
        devices
    }

    fn phone_devices(&self, available: DeviceSet) -> DeviceSet {
        match self.force_use(ForceUsage::Communication) {
            ForcedConfig::BtSco => {
                for device in [
                    DeviceType::BluetoothScoCarkit,
                    DeviceType::BluetoothScoHeadset,
                    DeviceType::BluetoothSco,
                ] {
                    if available.contains(device) {
                        return DeviceSet::of(device);
                    }
                }
                self.phone_default_devices(available)
            }
            ForcedConfig::Speaker => {
                if available.contains(DeviceType::Speaker) {
                    DeviceSet::of(DeviceType::Speaker)
                } else {
                    self.phone_default_devices(available)
                }
            }
            _ => self.phone_default_devices(available),
        }
    }

    fn phone_default_devices(&self, available: DeviceSet) -> DeviceSet {
        for device in [
            DeviceType::WiredHeadphone,
            DeviceType::WiredHeadset,
            DeviceType::UsbDevice,
            DeviceType::DgtlDockHeadset,
            DeviceType::Earpiece,
            DeviceType::Speaker,
        ] {
            if available.contains(device) {
                return DeviceSet::of(device);
            }
        }
        DeviceSet::EMPTY
    }

    fn sonification_devices(&self, available: DeviceSet) -> DeviceSet {
        if self.phone_state.is_in_call() {
            return self.phone_devices(available);
        }
        // Ring on the speaker and on whatever media is routed to
        let mut devices = self.media_devices(available);
        if available.contains(DeviceType::Speaker) {
            devices.insert(DeviceType::Speaker);
        }
        devices
    }

    fn media_devices(&self, available: DeviceSet) -> DeviceSet {
        let mut available = available;
        if self.force_use(ForceUsage::Media) == ForcedConfig::NoBtA2dp
            || self.force_use(ForceUsage::Communication) == ForcedConfig::BtSco
        {
            available = available.difference(DeviceSet::a2dp_all());
        }
        if self.force_use(ForceUsage::Media) == ForcedConfig::Speaker {
            if available.contains(DeviceType::Speaker) {
                return DeviceSet::of(DeviceType::Speaker);
            }
        }
        for device in [
            DeviceType::BluetoothA2dp,
            DeviceType::BluetoothA2dpHeadphones,
            DeviceType::BluetoothA2dpSpeaker,
            DeviceType::WiredHeadphone,
            DeviceType::WiredHeadset,
            DeviceType::UsbAccessory,
            DeviceType::UsbDevice,
            DeviceType::DgtlDockHeadset,
            DeviceType::AnlgDockHeadset,
            DeviceType::Hdmi,
            DeviceType::Line,
            DeviceType::Speaker,
        ] {
            if available.contains(device) {
                return DeviceSet::of(device);
            }
        }
        DeviceSet::EMPTY
    }

    /// Capture device selection for one record source
    pub fn device_for_input_source(
        &self,
        source: InputSource,
        available: DeviceSet,
    ) -> Option<DeviceType> {
        let pick = |candidates: &[DeviceType]| {
            candidates.iter().copied().find(|d| available.contains(*d))
        };
        match source {
            InputSource::VoiceUplink | InputSource::VoiceDownlink | InputSource::VoiceCall => {
                pick(&[DeviceType::TelephonyRx])
            }
            InputSource::RemoteSubmix => pick(&[DeviceType::RemoteSubmixIn]),
            InputSource::FmTuner => pick(&[DeviceType::FmTuner]),
            InputSource::Camcorder => pick(&[DeviceType::BackMic, DeviceType::BuiltinMic]),
            InputSource::VoiceCommunication => {
                if self.force_use(ForceUsage::Communication) == ForcedConfig::BtSco {
                    if let Some(d) = pick(&[DeviceType::BluetoothScoHeadsetMic]) {
                        return Some(d);
                    }
                }
                pick(&[
                    DeviceType::WiredHeadsetMic,
                    DeviceType::UsbDeviceIn,
                    DeviceType::BuiltinMic,
                ])
            }
            InputSource::Default
            | InputSource::Mic
            | InputSource::VoiceRecognition
            | InputSource::Hotword => {
                if self.force_use(ForceUsage::Record) == ForcedConfig::BtSco {
                    if let Some(d) = pick(&[DeviceType::BluetoothScoHeadsetMic]) {
                        return Some(d);
                    }
                }
                pick(&[
                    DeviceType::WiredHeadsetMic,
                    DeviceType::UsbDeviceIn,
                    DeviceType::BuiltinMic,
                ])
            }
        }
    }
}
