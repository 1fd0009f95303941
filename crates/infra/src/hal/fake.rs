//! Scripted in-memory HAL
//!
//! [`FakeHal`] honours every [`HalClient`] call against pure in-memory state
//! and records the full command stream. Tests drive the policy manager, then
//! assert on the recorded commands; failure injection covers the rollback
//! paths.

use patchbay_core::domain::audio::{
    HalPatchHandle, InputSource, IoHandle, ModuleHandle, PolicyError, Result, Session, StreamType,
};
use patchbay_core::domain::device::DeviceType;
use patchbay_core::domain::hal::{
    HalClient, InputConfig, MixState, OpenedInput, OpenedOutput, OutputConfig, PolicyTone,
};
use patchbay_core::domain::patch::PatchPort;
use patchbay_core::domain::audio::OutputFlags;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use tracing::trace;

/// One recorded HAL command
#[derive(Debug, Clone, PartialEq)]
pub enum HalCommand {
    LoadModule {
        name: String,
    },
    OpenOutput {
        handle: IoHandle,
        module: ModuleHandle,
        device: DeviceType,
        address: String,
    },
    OpenDuplicateOutput {
        handle: IoHandle,
        output1: IoHandle,
        output2: IoHandle,
    },
    CloseOutput {
        output: IoHandle,
    },
    SuspendOutput {
        output: IoHandle,
    },
    RestoreOutput {
        output: IoHandle,
    },
    OpenInput {
        handle: IoHandle,
        module: ModuleHandle,
        device: DeviceType,
        address: String,
        source: InputSource,
    },
    CloseInput {
        input: IoHandle,
    },
    SetStreamVolume {
        stream: StreamType,
        volume: f32,
        output: IoHandle,
        delay_ms: u32,
    },
    InvalidateStream {
        stream: StreamType,
    },
    SetParameters {
        io: IoHandle,
        key_value_pairs: String,
        delay_ms: u32,
    },
    StartTone {
        tone: PolicyTone,
        stream: StreamType,
    },
    StopTone,
    SetVoiceVolume {
        volume: f32,
        delay_ms: u32,
    },
    MoveEffects {
        session: Session,
        src: IoHandle,
        dst: IoHandle,
    },
    CreateAudioPatch {
        handle: HalPatchHandle,
    },
    ReleaseAudioPatch {
        handle: HalPatchHandle,
    },
    PortListChanged,
    PatchListChanged,
    MixStateChanged {
        registration: String,
        state: MixState,
    },
    SoundTriggerCaptureState {
        active: bool,
    },
}

#[derive(Debug, Default)]
struct State {
    next_id: u32,
    commands: Vec<HalCommand>,
    modules: BTreeMap<String, ModuleHandle>,
    open_outputs: BTreeSet<IoHandle>,
    open_inputs: BTreeSet<IoHandle>,
    suspended: BTreeSet<IoHandle>,
    patches: BTreeSet<HalPatchHandle>,
    /// Replies served by `get_parameters`, keyed by the requested key string
    parameter_replies: BTreeMap<String, String>,
    /// Operation names whose next invocation fails
    failures: BTreeSet<&'static str>,
    patch_panel: bool,
}

/// In-memory [`HalClient`] with a command log and failure injection
pub struct FakeHal {
    state: Mutex<State>,
}

impl Default for FakeHal {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeHal {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_id: 0,
                patch_panel: true,
                ..State::default()
            }),
        }
    }

    /// Make the next invocation of `op` fail. Known names: `load_hw_module`,
    /// `open_output`, `open_duplicate_output`, `open_input`.
    pub fn fail_next(&self, op: &'static str) {
        self.state.lock().unwrap().failures.insert(op);
    }

    /// Script the reply `get_parameters` serves for an exact key string
    pub fn set_parameter_reply(&self, keys: impl Into<String>, reply: impl Into<String>) {
        self.state
            .lock()
            .unwrap()
            .parameter_replies
            .insert(keys.into(), reply.into());
    }

    pub fn set_patch_panel_supported(&self, supported: bool) {
        self.state.lock().unwrap().patch_panel = supported;
    }

    /// Snapshot of every command issued so far, oldest first
    pub fn commands(&self) -> Vec<HalCommand> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn clear_commands(&self) {
        self.state.lock().unwrap().commands.clear();
    }

    pub fn open_output_count(&self) -> usize {
        self.state.lock().unwrap().open_outputs.len()
    }

    pub fn open_input_count(&self) -> usize {
        self.state.lock().unwrap().open_inputs.len()
    }

    pub fn is_suspended(&self, output: IoHandle) -> bool {
        self.state.lock().unwrap().suspended.contains(&output)
    }

    /// Last `routing=` parameter pushed to an io handle, if any
    pub fn last_routing(&self, io: IoHandle) -> Option<String> {
        let state = self.state.lock().unwrap();
        state.commands.iter().rev().find_map(|c| match c {
            HalCommand::SetParameters {
                io: cmd_io,
                key_value_pairs,
                ..
            } if *cmd_io == io && key_value_pairs.starts_with("routing=") => {
                Some(key_value_pairs["routing=".len()..].to_string())
            }
            _ => None,
        })
    }

    /// Most recent volume set for a stream on an output
    pub fn last_volume(&self, stream: StreamType, output: IoHandle) -> Option<f32> {
        let state = self.state.lock().unwrap();
        state.commands.iter().rev().find_map(|c| match c {
            HalCommand::SetStreamVolume {
                stream: s,
                volume,
                output: o,
                ..
            } if *s == stream && *o == output => Some(*volume),
            _ => None,
        })
    }

    fn take_failure(state: &mut State, op: &'static str) -> bool {
        state.failures.remove(op)
    }

    fn allocate(state: &mut State) -> u32 {
        state.next_id += 1;
        state.next_id
    }
}

impl HalClient for FakeHal {
    fn load_hw_module(&self, name: &str) -> Result<ModuleHandle> {
        let mut state = self.state.lock().unwrap();
        if Self::take_failure(&mut state, "load_hw_module") {
            return Err(PolicyError::OperationFailed(format!(
                "module {name} failed to load"
            )));
        }
        if let Some(handle) = state.modules.get(name) {
            return Ok(*handle);
        }
        let handle = ModuleHandle::new(Self::allocate(&mut state));
        state.modules.insert(name.to_string(), handle);
        state.commands.push(HalCommand::LoadModule {
            name: name.to_string(),
        });
        Ok(handle)
    }

    fn open_output(
        &self,
        module: ModuleHandle,
        config: OutputConfig,
        device: DeviceType,
        address: &str,
    ) -> Result<OpenedOutput> {
        let mut state = self.state.lock().unwrap();
        if Self::take_failure(&mut state, "open_output") {
            return Err(PolicyError::OperationFailed(format!(
                "output open rejected for {device}"
            )));
        }
        let handle = IoHandle::new(Self::allocate(&mut state));
        state.open_outputs.insert(handle);
        state.commands.push(HalCommand::OpenOutput {
            handle,
            module,
            device,
            address: address.to_string(),
        });
        let latency_ms = if config.flags.contains(OutputFlags::COMPRESS_OFFLOAD) {
            100
        } else if config.flags.contains(OutputFlags::DEEP_BUFFER) {
            80
        } else {
            40
        };
        trace!(%handle, %device, latency_ms, "fake output opened");
        Ok(OpenedOutput {
            handle,
            config,
            latency_ms,
        })
    }

    fn open_duplicate_output(&self, output1: IoHandle, output2: IoHandle) -> Result<IoHandle> {
        let mut state = self.state.lock().unwrap();
        if Self::take_failure(&mut state, "open_duplicate_output") {
            return Err(PolicyError::OperationFailed(
                "duplicate output open rejected".to_string(),
            ));
        }
        if !state.open_outputs.contains(&output1) || !state.open_outputs.contains(&output2) {
            return Err(PolicyError::InvalidArgument(format!(
                "cannot duplicate over closed outputs {output1}/{output2}"
            )));
        }
        let handle = IoHandle::new(Self::allocate(&mut state));
        state.open_outputs.insert(handle);
        state.commands.push(HalCommand::OpenDuplicateOutput {
            handle,
            output1,
            output2,
        });
        Ok(handle)
    }

    fn close_output(&self, output: IoHandle) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.open_outputs.remove(&output) {
            return Err(PolicyError::NotFound(format!("output {output} not open")));
        }
        state.suspended.remove(&output);
        state.commands.push(HalCommand::CloseOutput { output });
        Ok(())
    }

    fn suspend_output(&self, output: IoHandle) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.open_outputs.contains(&output) {
            return Err(PolicyError::NotFound(format!("output {output} not open")));
        }
        state.suspended.insert(output);
        state.commands.push(HalCommand::SuspendOutput { output });
        Ok(())
    }

    fn restore_output(&self, output: IoHandle) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.open_outputs.contains(&output) {
            return Err(PolicyError::NotFound(format!("output {output} not open")));
        }
        state.suspended.remove(&output);
        state.commands.push(HalCommand::RestoreOutput { output });
        Ok(())
    }

    fn open_input(
        &self,
        module: ModuleHandle,
        config: InputConfig,
        device: DeviceType,
        address: &str,
        source: InputSource,
    ) -> Result<OpenedInput> {
        let mut state = self.state.lock().unwrap();
        if Self::take_failure(&mut state, "open_input") {
            return Err(PolicyError::OperationFailed(format!(
                "input open rejected for {device}"
            )));
        }
        let handle = IoHandle::new(Self::allocate(&mut state));
        state.open_inputs.insert(handle);
        state.commands.push(HalCommand::OpenInput {
            handle,
            module,
            device,
            address: address.to_string(),
            source,
        });
        Ok(OpenedInput { handle, config })
    }

    fn close_input(&self, input: IoHandle) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.open_inputs.remove(&input) {
            return Err(PolicyError::NotFound(format!("input {input} not open")));
        }
        state.commands.push(HalCommand::CloseInput { input });
        Ok(())
    }

    fn set_stream_volume(
        &self,
        stream: StreamType,
        volume: f32,
        output: IoHandle,
        delay_ms: u32,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.commands.push(HalCommand::SetStreamVolume {
            stream,
            volume,
            output,
            delay_ms,
        });
        Ok(())
    }

    fn invalidate_stream(&self, stream: StreamType) {
        let mut state = self.state.lock().unwrap();
        state.commands.push(HalCommand::InvalidateStream { stream });
    }

    fn set_parameters(&self, io: IoHandle, key_value_pairs: &str, delay_ms: u32) {
        let mut state = self.state.lock().unwrap();
        state.commands.push(HalCommand::SetParameters {
            io,
            key_value_pairs: key_value_pairs.to_string(),
            delay_ms,
        });
    }

    fn get_parameters(&self, _io: IoHandle, keys: &str) -> String {
        let state = self.state.lock().unwrap();
        state
            .parameter_replies
            .get(keys)
            .cloned()
            .unwrap_or_default()
    }

    fn start_tone(&self, tone: PolicyTone, stream: StreamType) {
        let mut state = self.state.lock().unwrap();
        state.commands.push(HalCommand::StartTone { tone, stream });
    }

    fn stop_tone(&self) {
        let mut state = self.state.lock().unwrap();
        state.commands.push(HalCommand::StopTone);
    }

    fn set_voice_volume(&self, volume: f32, delay_ms: u32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .commands
            .push(HalCommand::SetVoiceVolume { volume, delay_ms });
        Ok(())
    }

    fn move_effects(&self, session: Session, src: IoHandle, dst: IoHandle) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .commands
            .push(HalCommand::MoveEffects { session, src, dst });
        Ok(())
    }

    fn create_audio_patch(
        &self,
        _sources: &[PatchPort],
        _sinks: &[PatchPort],
        existing: Option<HalPatchHandle>,
    ) -> Result<HalPatchHandle> {
        let mut state = self.state.lock().unwrap();
        let handle = match existing {
            Some(handle) if state.patches.contains(&handle) => handle,
            Some(handle) => {
                return Err(PolicyError::NotFound(format!(
                    "hal patch {handle} not found"
                )))
            }
            None => HalPatchHandle::new(Self::allocate(&mut state)),
        };
        state.patches.insert(handle);
        state.commands.push(HalCommand::CreateAudioPatch { handle });
        Ok(handle)
    }

    fn release_audio_patch(&self, patch: HalPatchHandle) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.patches.remove(&patch) {
            return Err(PolicyError::NotFound(format!("hal patch {patch} not found")));
        }
        state.commands.push(HalCommand::ReleaseAudioPatch { handle: patch });
        Ok(())
    }

    fn patch_panel_supported(&self) -> bool {
        self.state.lock().unwrap().patch_panel
    }

    fn on_audio_port_list_changed(&self) {
        let mut state = self.state.lock().unwrap();
        state.commands.push(HalCommand::PortListChanged);
    }

    fn on_audio_patch_list_changed(&self) {
        let mut state = self.state.lock().unwrap();
        state.commands.push(HalCommand::PatchListChanged);
    }

    fn on_dynamic_policy_mix_state_changed(&self, registration: &str, state_change: MixState) {
        let mut state = self.state.lock().unwrap();
        state.commands.push(HalCommand::MixStateChanged {
            registration: registration.to_string(),
            state: state_change,
        });
    }

    fn set_sound_trigger_capture_state(&self, active: bool) {
        let mut state = self.state.lock().unwrap();
        state
            .commands
            .push(HalCommand::SoundTriggerCaptureState { active });
    }

    fn new_unique_id(&self) -> u32 {
        let mut state = self.state.lock().unwrap();
        Self::allocate(&mut state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use patchbay_core::domain::audio::{AudioFormat, ChannelMask};

    fn pcm_config() -> OutputConfig {
        OutputConfig {
            sample_rate: 48_000,
            format: AudioFormat::Pcm16,
            channel_mask: ChannelMask::OutStereo,
            flags: OutputFlags::NONE,
        }
    }

    #[test]
    fn test_open_close_bookkeeping() {
        let hal = FakeHal::new();
        let module = hal.load_hw_module("primary").unwrap();
        let opened = hal
            .open_output(module, pcm_config(), DeviceType::Speaker, "")
            .unwrap();
        assert_eq!(hal.open_output_count(), 1);
        assert_eq!(opened.latency_ms, 40);

        hal.close_output(opened.handle).unwrap();
        assert_eq!(hal.open_output_count(), 0);
        assert!(hal.close_output(opened.handle).is_err());
    }

    #[test]
    fn test_failure_injection_is_one_shot() {
        let hal = FakeHal::new();
        let module = hal.load_hw_module("primary").unwrap();
        hal.fail_next("open_output");
        assert!(hal
            .open_output(module, pcm_config(), DeviceType::Speaker, "")
            .is_err());
        assert!(hal
            .open_output(module, pcm_config(), DeviceType::Speaker, "")
            .is_ok());
    }

    #[test]
    fn test_last_routing_helper() {
        let hal = FakeHal::new();
        let io = IoHandle::new(7);
        hal.set_parameters(io, "routing=speaker", 0);
        hal.set_parameters(io, "routing=wired_headset", 0);
        hal.set_parameters(IoHandle::new(8), "routing=earpiece", 0);
        assert_eq!(hal.last_routing(io).as_deref(), Some("wired_headset"));
    }

    #[test]
    fn test_patch_update_requires_known_handle() {
        let hal = FakeHal::new();
        let handle = hal.create_audio_patch(&[], &[], None).unwrap();
        assert!(hal.create_audio_patch(&[], &[], Some(handle)).is_ok());
        hal.release_audio_patch(handle).unwrap();
        assert!(hal
            .create_audio_patch(&[], &[], Some(handle))
            .is_err());
    }
}
