//! Base audio types shared across the policy engine
//!
//! Handles, stream types, formats, flags and the error taxonomy. Everything
//! here is a plain value type; the stateful collections live in the other
//! domain modules.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors that can occur in the policy engine
#[derive(Debug, Error)]
pub enum PolicyError {
    /// Malformed request: bad device type, out-of-range index, bad patch roles
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Request conflicts with current state (already connected, refcount at zero)
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Unknown io handle, session, patch handle or device
    #[error("not found: {0}")]
    NotFound(String),

    /// Caller is not allowed to touch the resource (uid mismatch on a patch)
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A collection refused an insertion
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// No profile or device can satisfy the requested parameters
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The HAL refused an operation and no fallback exists
    #[error("operation failed: {0}")]
    OperationFailed(String),
}

pub type Result<T> = std::result::Result<T, PolicyError>;

macro_rules! handle_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(u32);

        impl $name {
            pub const NONE: $name = $name(0);

            pub fn new(raw: u32) -> Self {
                Self(raw)
            }

            pub fn raw(self) -> u32 {
                self.0
            }

            pub fn is_none(self) -> bool {
                self.0 == 0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

handle_type!(
    /// Handle of an opened output or input endpoint
    IoHandle
);
handle_type!(
    /// Stable handle of a routing patch owned by the policy manager
    PatchHandle
);
handle_type!(
    /// Handle of a patch as realized inside the HAL
    HalPatchHandle
);
handle_type!(
    /// Client session identifier
    Session
);
handle_type!(
    /// Handle of a loaded hardware module
    ModuleHandle
);
handle_type!(
    /// Stable identifier of an I/O profile inside the module catalog
    ProfileHandle
);
handle_type!(
    /// Stable identifier of a device port once attached
    PortId
);

/// Unix-style uid owning client-scoped resources (patches, session routes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Uid(pub u32);

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stream types carried by playback requests and volume operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamType {
    VoiceCall,
    System,
    Ring,
    Music,
    Alarm,
    Notification,
    BluetoothSco,
    EnforcedAudible,
    Dtmf,
    Tts,
    Accessibility,
    Rerouting,
}

impl StreamType {
    pub const COUNT: usize = 12;

    pub const ALL: [StreamType; Self::COUNT] = [
        StreamType::VoiceCall,
        StreamType::System,
        StreamType::Ring,
        StreamType::Music,
        StreamType::Alarm,
        StreamType::Notification,
        StreamType::BluetoothSco,
        StreamType::EnforcedAudible,
        StreamType::Dtmf,
        StreamType::Tts,
        StreamType::Accessibility,
        StreamType::Rerouting,
    ];

    /// Dense index for per-stream arrays
    pub fn index(self) -> usize {
        match self {
            StreamType::VoiceCall => 0,
            StreamType::System => 1,
            StreamType::Ring => 2,
            StreamType::Music => 3,
            StreamType::Alarm => 4,
            StreamType::Notification => 5,
            StreamType::BluetoothSco => 6,
            StreamType::EnforcedAudible => 7,
            StreamType::Dtmf => 8,
            StreamType::Tts => 9,
            StreamType::Accessibility => 10,
            StreamType::Rerouting => 11,
        }
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Audio sample formats negotiated with the HAL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioFormat {
    Pcm16,
    Pcm8,
    Pcm24,
    PcmFloat,
    Mp3,
    AacLc,
    Vorbis,
}

impl AudioFormat {
    pub fn is_linear_pcm(self) -> bool {
        matches!(
            self,
            AudioFormat::Pcm16 | AudioFormat::Pcm8 | AudioFormat::Pcm24 | AudioFormat::PcmFloat
        )
    }

    pub fn from_name(name: &str) -> Option<AudioFormat> {
        match name {
            "pcm16" => Some(AudioFormat::Pcm16),
            "pcm8" => Some(AudioFormat::Pcm8),
            "pcm24" => Some(AudioFormat::Pcm24),
            "pcm_float" => Some(AudioFormat::PcmFloat),
            "mp3" => Some(AudioFormat::Mp3),
            "aac_lc" => Some(AudioFormat::AacLc),
            "vorbis" => Some(AudioFormat::Vorbis),
            _ => None,
        }
    }
}

/// Channel layouts, split by direction like the device namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelMask {
    OutMono,
    OutStereo,
    Out5Point1,
    Out7Point1,
    InMono,
    InStereo,
    InVoiceUplink,
    InVoiceDownlink,
}

impl ChannelMask {
    pub fn channel_count(self) -> u32 {
        match self {
            ChannelMask::OutMono | ChannelMask::InMono => 1,
            ChannelMask::OutStereo
            | ChannelMask::InStereo
            | ChannelMask::InVoiceUplink
            | ChannelMask::InVoiceDownlink => 2,
            ChannelMask::Out5Point1 => 6,
            ChannelMask::Out7Point1 => 8,
        }
    }

    pub fn is_output(self) -> bool {
        matches!(
            self,
            ChannelMask::OutMono
                | ChannelMask::OutStereo
                | ChannelMask::Out5Point1
                | ChannelMask::Out7Point1
        )
    }

    pub fn from_name(name: &str) -> Option<ChannelMask> {
        match name {
            "out_mono" => Some(ChannelMask::OutMono),
            "out_stereo" => Some(ChannelMask::OutStereo),
            "out_5point1" => Some(ChannelMask::Out5Point1),
            "out_7point1" => Some(ChannelMask::Out7Point1),
            "in_mono" => Some(ChannelMask::InMono),
            "in_stereo" => Some(ChannelMask::InStereo),
            "in_voice_uplink" => Some(ChannelMask::InVoiceUplink),
            "in_voice_downlink" => Some(ChannelMask::InVoiceDownlink),
            _ => None,
        }
    }
}

/// Output profile and request flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct OutputFlags(u32);

impl OutputFlags {
    pub const NONE: OutputFlags = OutputFlags(0);
    pub const DIRECT: OutputFlags = OutputFlags(1 << 0);
    pub const PRIMARY: OutputFlags = OutputFlags(1 << 1);
    pub const FAST: OutputFlags = OutputFlags(1 << 2);
    pub const DEEP_BUFFER: OutputFlags = OutputFlags(1 << 3);
    pub const COMPRESS_OFFLOAD: OutputFlags = OutputFlags(1 << 4);
    pub const NON_BLOCKING: OutputFlags = OutputFlags(1 << 5);
    pub const HW_AV_SYNC: OutputFlags = OutputFlags(1 << 6);
    pub const TTS: OutputFlags = OutputFlags(1 << 7);

    pub fn contains(self, other: OutputFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: OutputFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub fn without(self, other: OutputFlags) -> OutputFlags {
        OutputFlags(self.0 & !other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Number of flag bits shared with `other`, used for output selection
    pub fn common_bits(self, other: OutputFlags) -> u32 {
        (self.0 & other.0).count_ones()
    }

    pub fn from_names(names: &[String]) -> Result<OutputFlags> {
        let mut flags = OutputFlags::NONE;
        for name in names {
            flags = flags
                | match name.as_str() {
                    "direct" => OutputFlags::DIRECT,
                    "primary" => OutputFlags::PRIMARY,
                    "fast" => OutputFlags::FAST,
                    "deep_buffer" => OutputFlags::DEEP_BUFFER,
                    "compress_offload" => OutputFlags::COMPRESS_OFFLOAD,
                    "non_blocking" => OutputFlags::NON_BLOCKING,
                    "hw_av_sync" => OutputFlags::HW_AV_SYNC,
                    "tts" => OutputFlags::TTS,
                    other => {
                        return Err(PolicyError::InvalidArgument(format!(
                            "unknown output flag: {other}"
                        )))
                    }
                };
        }
        Ok(flags)
    }
}

impl std::ops::BitOr for OutputFlags {
    type Output = OutputFlags;

    fn bitor(self, rhs: OutputFlags) -> OutputFlags {
        OutputFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for OutputFlags {
    fn bitor_assign(&mut self, rhs: OutputFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for OutputFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// Input profile and request flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct InputFlags(u32);

impl InputFlags {
    pub const NONE: InputFlags = InputFlags(0);
    pub const FAST: InputFlags = InputFlags(1 << 0);
    pub const HW_HOTWORD: InputFlags = InputFlags(1 << 1);

    pub fn contains(self, other: InputFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn from_names(names: &[String]) -> Result<InputFlags> {
        let mut flags = InputFlags::NONE;
        for name in names {
            flags = InputFlags(
                flags.0
                    | match name.as_str() {
                        "fast" => InputFlags::FAST.0,
                        "hw_hotword" => InputFlags::HW_HOTWORD.0,
                        other => {
                            return Err(PolicyError::InvalidArgument(format!(
                                "unknown input flag: {other}"
                            )))
                        }
                    },
            );
        }
        Ok(flags)
    }
}

/// Telephony state driving call routing and in-call sonification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhoneState {
    Normal,
    Ringtone,
    InCall,
    InCommunication,
}

impl PhoneState {
    /// True for both circuit-switched calls and VoIP communication
    pub fn is_in_call(self) -> bool {
        matches!(self, PhoneState::InCall | PhoneState::InCommunication)
    }
}

/// Usage categories that can carry a forced device configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForceUsage {
    Communication,
    Media,
    Record,
    Dock,
    System,
    HdmiSystemAudio,
}

impl ForceUsage {
    pub const COUNT: usize = 6;

    pub const ALL: [ForceUsage; Self::COUNT] = [
        ForceUsage::Communication,
        ForceUsage::Media,
        ForceUsage::Record,
        ForceUsage::Dock,
        ForceUsage::System,
        ForceUsage::HdmiSystemAudio,
    ];

    pub fn index(self) -> usize {
        match self {
            ForceUsage::Communication => 0,
            ForceUsage::Media => 1,
            ForceUsage::Record => 2,
            ForceUsage::Dock => 3,
            ForceUsage::System => 4,
            ForceUsage::HdmiSystemAudio => 5,
        }
    }
}

/// Forced device class overriding strategy computation for one usage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForcedConfig {
    None,
    Speaker,
    Headphones,
    BtSco,
    BtA2dp,
    WiredAccessory,
    BtCarDock,
    BtDeskDock,
    AnalogDock,
    DigitalDock,
    NoBtA2dp,
    SystemEnforced,
}

/// Capture sources carried by record requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputSource {
    Default,
    Mic,
    VoiceUplink,
    VoiceDownlink,
    VoiceCall,
    Camcorder,
    VoiceRecognition,
    VoiceCommunication,
    RemoteSubmix,
    Hotword,
    FmTuner,
}

/// Playback usage carried by attribute bundles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Usage {
    Unknown,
    Media,
    VoiceCommunication,
    VoiceCommunicationSignalling,
    Alarm,
    Notification,
    NotificationRingtone,
    NotificationEvent,
    AssistanceAccessibility,
    AssistanceNavigationGuidance,
    AssistanceSonification,
    Game,
    VirtualSource,
}

/// Attribute flag bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AttrFlags(u32);

impl AttrFlags {
    pub const NONE: AttrFlags = AttrFlags(0);
    pub const AUDIBILITY_ENFORCED: AttrFlags = AttrFlags(1 << 0);
    pub const BEACON: AttrFlags = AttrFlags(1 << 1);
    pub const HW_AV_SYNC: AttrFlags = AttrFlags(1 << 2);

    pub fn contains(self, other: AttrFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for AttrFlags {
    type Output = AttrFlags;

    fn bitor(self, rhs: AttrFlags) -> AttrFlags {
        AttrFlags(self.0 | rhs.0)
    }
}

/// Tag prefix used to target a registered policy mix by address
pub const MIX_ADDR_TAG: &str = "addr=";

/// Attribute bundle resolving playback routing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioAttributes {
    pub usage: Usage,
    pub flags: AttrFlags,
    /// Free-form tags; `addr=<registration>` targets a policy mix
    pub tags: String,
}

impl AudioAttributes {
    pub fn from_usage(usage: Usage) -> Self {
        Self {
            usage,
            flags: AttrFlags::NONE,
            tags: String::new(),
        }
    }

    /// Policy mix address embedded in the tags, if any
    pub fn mix_address(&self) -> Option<&str> {
        self.tags
            .split(';')
            .find_map(|tag| tag.strip_prefix(MIX_ADDR_TAG))
            .filter(|addr| !addr.is_empty())
    }
}

/// Attribute bundle resolving capture routing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordAttributes {
    pub source: InputSource,
    /// Free-form tags; `addr=<registration>` targets a policy mix
    pub tags: String,
}

impl RecordAttributes {
    pub fn from_source(source: InputSource) -> Self {
        Self {
            source,
            tags: String::new(),
        }
    }

    pub fn mix_address(&self) -> Option<&str> {
        self.tags
            .split(';')
            .find_map(|tag| tag.strip_prefix(MIX_ADDR_TAG))
            .filter(|addr| !addr.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_index_is_dense() {
        for (i, stream) in StreamType::ALL.iter().enumerate() {
            assert_eq!(stream.index(), i);
        }
    }

    #[test]
    fn test_output_flags_ops() {
        let flags = OutputFlags::DIRECT | OutputFlags::COMPRESS_OFFLOAD;
        assert!(flags.contains(OutputFlags::DIRECT));
        assert!(!flags.contains(OutputFlags::FAST));
        assert!(flags.intersects(OutputFlags::COMPRESS_OFFLOAD | OutputFlags::FAST));
        assert_eq!(flags.common_bits(OutputFlags::DIRECT | OutputFlags::FAST), 1);
        assert!(flags.without(flags).is_empty());
    }

    #[test]
    fn test_flag_parsing() {
        let flags =
            OutputFlags::from_names(&["direct".to_string(), "compress_offload".to_string()])
                .unwrap();
        assert!(flags.contains(OutputFlags::DIRECT | OutputFlags::COMPRESS_OFFLOAD));
        assert!(OutputFlags::from_names(&["bogus".to_string()]).is_err());
    }

    #[test]
    fn test_mix_address_tag() {
        let mut attr = AudioAttributes::from_usage(Usage::Media);
        assert_eq!(attr.mix_address(), None);

        attr.tags = "addr=mix0".to_string();
        assert_eq!(attr.mix_address(), Some("mix0"));

        attr.tags = "other=1;addr=mix1".to_string();
        assert_eq!(attr.mix_address(), Some("mix1"));
    }

    #[test]
    fn test_phone_state() {
        assert!(PhoneState::InCall.is_in_call());
        assert!(PhoneState::InCommunication.is_in_call());
        assert!(!PhoneState::Ringtone.is_in_call());
        assert!(!PhoneState::Normal.is_in_call());
    }

    #[test]
    fn test_handle_none() {
        assert!(IoHandle::NONE.is_none());
        assert!(!IoHandle::new(3).is_none());
        assert_eq!(IoHandle::new(3).raw(), 3);
    }
}
