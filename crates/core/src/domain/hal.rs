//! HAL client capability consumed by the policy manager
//!
//! The policy manager never touches hardware itself; every effectful decision
//! goes through this trait. Implementations live outside the core crate (the
//! infra crate ships a scripted in-memory one). Every call can fail, and a
//! failure means the action did not happen — the manager rolls back instead
//! of assuming partial success.

use crate::domain::audio::{
    AudioFormat, ChannelMask, HalPatchHandle, InputFlags, InputSource, IoHandle, ModuleHandle,
    OutputFlags, Result, Session, StreamType,
};
use crate::domain::device::DeviceType;
use crate::domain::patch::PatchPort;
use serde::{Deserialize, Serialize};

/// Capability parameter keys for dynamic profile discovery
pub const PARAM_SUP_SAMPLING_RATES: &str = "sup_sampling_rates";
pub const PARAM_SUP_FORMATS: &str = "sup_formats";
pub const PARAM_SUP_CHANNELS: &str = "sup_channels";

/// Out-of-band device connection parameters broadcast to the HAL
pub const PARAM_DEVICE_CONNECT: &str = "connect";
pub const PARAM_DEVICE_DISCONNECT: &str = "disconnect";

/// Negotiated output stream configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputConfig {
    pub sample_rate: u32,
    pub format: AudioFormat,
    pub channel_mask: ChannelMask,
    pub flags: OutputFlags,
}

/// Negotiated input stream configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputConfig {
    pub sample_rate: u32,
    pub format: AudioFormat,
    pub channel_mask: ChannelMask,
    pub flags: InputFlags,
}

/// Result of opening an output stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenedOutput {
    pub handle: IoHandle,
    pub config: OutputConfig,
    pub latency_ms: u32,
}

/// Result of opening an input stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenedInput {
    pub handle: IoHandle,
    pub config: InputConfig,
}

/// Dynamic policy mix activity reported to interested listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixState {
    Idle,
    Mixing,
}

/// Tones the policy manager can ask the platform to play
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyTone {
    InCallNotification,
}

/// Interface to the audio HAL and platform services.
///
/// Methods take `&self`; implementations use interior mutability. The policy
/// manager is single-writer, so no concurrent invocation happens.
pub trait HalClient: Send + Sync {
    /// Load a hardware module by name, returning its opaque handle
    fn load_hw_module(&self, name: &str) -> Result<ModuleHandle>;

    /// Open an output stream on a module for the given device; `config`
    /// carries the requested parameters, the reply the negotiated ones.
    fn open_output(
        &self,
        module: ModuleHandle,
        config: OutputConfig,
        device: DeviceType,
        address: &str,
    ) -> Result<OpenedOutput>;

    /// Open a duplicating output fanning out to two already-open outputs
    fn open_duplicate_output(&self, output1: IoHandle, output2: IoHandle) -> Result<IoHandle>;

    fn close_output(&self, output: IoHandle) -> Result<()>;

    /// Suspend/restore an output (A2DP suspension during SCO use)
    fn suspend_output(&self, output: IoHandle) -> Result<()>;
    fn restore_output(&self, output: IoHandle) -> Result<()>;

    fn open_input(
        &self,
        module: ModuleHandle,
        config: InputConfig,
        device: DeviceType,
        address: &str,
        source: InputSource,
    ) -> Result<OpenedInput>;

    fn close_input(&self, input: IoHandle) -> Result<()>;

    /// Apply a stream volume (linear amplitude) on one io, after `delay_ms`
    fn set_stream_volume(
        &self,
        stream: StreamType,
        volume: f32,
        output: IoHandle,
        delay_ms: u32,
    ) -> Result<()>;

    /// Force clients of a stream type to re-fetch their routing
    fn invalidate_stream(&self, stream: StreamType);

    /// Free-form parameter plumbing to one io handle (or none for global)
    fn set_parameters(&self, io: IoHandle, key_value_pairs: &str, delay_ms: u32);
    fn get_parameters(&self, io: IoHandle, keys: &str) -> String;

    fn start_tone(&self, tone: PolicyTone, stream: StreamType);
    fn stop_tone(&self);

    /// In-call voice volume, 0.0..=1.0
    fn set_voice_volume(&self, volume: f32, delay_ms: u32) -> Result<()>;

    /// Move effects registered on a session between io handles
    fn move_effects(&self, session: Session, src: IoHandle, dst: IoHandle) -> Result<()>;

    /// Realize a routing patch in the HAL; `existing` updates in place
    fn create_audio_patch(
        &self,
        sources: &[PatchPort],
        sinks: &[PatchPort],
        existing: Option<HalPatchHandle>,
    ) -> Result<HalPatchHandle>;

    fn release_audio_patch(&self, patch: HalPatchHandle) -> Result<()>;

    /// True when the HAL understands patch-panel routing natively; legacy
    /// HALs need device-to-device patches bridged through an output mix.
    fn patch_panel_supported(&self) -> bool {
        true
    }

    /// Platform notifications; fire-and-forget
    fn on_audio_port_list_changed(&self);
    fn on_audio_patch_list_changed(&self);
    fn on_dynamic_policy_mix_state_changed(&self, registration: &str, state: MixState);

    /// Global capture-in-progress signal consumed by the sound trigger service
    fn set_sound_trigger_capture_state(&self, active: bool);

    /// Allocate a process-unique id (io handles, sessions, patch handles)
    fn new_unique_id(&self) -> u32;
}
