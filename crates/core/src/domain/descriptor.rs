//! Live state of opened outputs and inputs
//!
//! Descriptors mirror what the HAL has open right now: negotiated
//! configuration, current routing, and per-stream activity. The collections
//! wrap handle-indexed maps and implement the aggregate queries the policy
//! manager asks (activity windows, device filtering, duplication fan-out).

use crate::domain::audio::{
    IoHandle, ModuleHandle, PatchHandle, ProfileHandle, Session, StreamType,
};
use crate::domain::device::{DeviceSet, DeviceType};
use crate::domain::hal::{InputConfig, OutputConfig};
use crate::domain::audio::{InputSource, OutputFlags};
use std::collections::{BTreeMap, HashSet};
use std::time::{Duration, Instant};
use tracing::warn;

/// What an output handle actually is underneath
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    /// A stream opened on a hardware module profile
    Physical {
        module: ModuleHandle,
        profile: ProfileHandle,
    },
    /// A software fan-out mirroring writes to two physical outputs
    Duplicated {
        output1: IoHandle,
        output2: IoHandle,
    },
}

/// State of one opened output stream
#[derive(Debug, Clone)]
pub struct OutputDescriptor {
    pub handle: IoHandle,
    pub kind: OutputKind,
    pub config: OutputConfig,
    pub latency_ms: u32,
    /// Devices this output is currently routed to
    pub devices: DeviceSet,
    pub address: String,
    /// Devices reachable through the profile (cached at open time)
    pub supported_devices: DeviceSet,
    /// Registration of the policy mix this output renders, if any
    pub policy_mix: Option<String>,
    /// Software patch currently feeding this output, if any
    pub patch: Option<PatchHandle>,
    /// Direct outputs are shared by clients via an open ref count
    pub open_count: u32,
    ref_counts: [u32; StreamType::COUNT],
    stop_times: [Option<Instant>; StreamType::COUNT],
    mute_counts: [u32; StreamType::COUNT],
    /// Last volume applied per stream, in dB, to skip redundant HAL calls
    curr_volumes: [f32; StreamType::COUNT],
}

impl OutputDescriptor {
    pub fn new(handle: IoHandle, kind: OutputKind, config: OutputConfig, latency_ms: u32) -> Self {
        Self {
            handle,
            kind,
            config,
            latency_ms,
            devices: DeviceSet::EMPTY,
            address: String::new(),
            supported_devices: DeviceSet::EMPTY,
            policy_mix: None,
            patch: None,
            open_count: 1,
            ref_counts: [0; StreamType::COUNT],
            stop_times: [None; StreamType::COUNT],
            mute_counts: [0; StreamType::COUNT],
            curr_volumes: [f32::NEG_INFINITY; StreamType::COUNT],
        }
    }

    pub fn is_duplicated(&self) -> bool {
        matches!(self.kind, OutputKind::Duplicated { .. })
    }

    pub fn module(&self) -> Option<ModuleHandle> {
        match self.kind {
            OutputKind::Physical { module, .. } => Some(module),
            OutputKind::Duplicated { .. } => None,
        }
    }

    pub fn profile(&self) -> Option<ProfileHandle> {
        match self.kind {
            OutputKind::Physical { profile, .. } => Some(profile),
            OutputKind::Duplicated { .. } => None,
        }
    }

    pub fn is_direct(&self) -> bool {
        self.config.flags.contains(OutputFlags::DIRECT)
    }

    pub fn is_primary(&self) -> bool {
        self.config.flags.contains(OutputFlags::PRIMARY)
    }

    pub fn is_offloaded(&self) -> bool {
        self.config.flags.contains(OutputFlags::COMPRESS_OFFLOAD)
    }

    /// Adjust the per-stream use count; returns the new count
    pub fn change_ref_count(&mut self, stream: StreamType, delta: i32) -> u32 {
        let slot = &mut self.ref_counts[stream.index()];
        if delta < 0 && (delta.unsigned_abs() > *slot) {
            warn!(output = %self.handle, %stream, "stream ref count underflow");
            *slot = 0;
        } else {
            *slot = (*slot as i64 + delta as i64) as u32;
        }
        if *slot == 0 {
            self.stop_times[stream.index()] = Some(Instant::now());
        }
        *slot
    }

    pub fn ref_count(&self, stream: StreamType) -> u32 {
        self.ref_counts[stream.index()]
    }

    /// Overwrite ref counts wholesale (duplicated output teardown hands its
    /// counts to the surviving physical output)
    pub fn set_ref_counts(&mut self, counts: [u32; StreamType::COUNT]) {
        self.ref_counts = counts;
    }

    pub fn ref_counts(&self) -> [u32; StreamType::COUNT] {
        self.ref_counts
    }

    /// Active now, or stopped less than `in_past_ms` ago
    pub fn is_stream_active(&self, stream: StreamType, in_past_ms: u32) -> bool {
        if self.ref_counts[stream.index()] > 0 {
            return true;
        }
        if in_past_ms == 0 {
            return false;
        }
        match self.stop_times[stream.index()] {
            Some(stopped) => stopped.elapsed() < Duration::from_millis(in_past_ms as u64),
            None => false,
        }
    }

    pub fn is_active(&self, in_past_ms: u32) -> bool {
        StreamType::ALL
            .iter()
            .any(|s| self.is_stream_active(*s, in_past_ms))
    }

    pub fn mute_count(&self, stream: StreamType) -> u32 {
        self.mute_counts[stream.index()]
    }

    pub fn increment_mute(&mut self, stream: StreamType) -> u32 {
        self.mute_counts[stream.index()] += 1;
        self.mute_counts[stream.index()]
    }

    pub fn decrement_mute(&mut self, stream: StreamType) -> u32 {
        let slot = &mut self.mute_counts[stream.index()];
        if *slot == 0 {
            warn!(output = %self.handle, %stream, "unbalanced unmute");
            return 0;
        }
        *slot -= 1;
        *slot
    }

    pub fn current_volume_db(&self, stream: StreamType) -> f32 {
        self.curr_volumes[stream.index()]
    }

    pub fn set_current_volume_db(&mut self, stream: StreamType, db: f32) {
        self.curr_volumes[stream.index()] = db;
    }

    pub fn supports_device(&self, device: DeviceType) -> bool {
        self.supported_devices.contains(device)
    }
}

/// Handle-indexed table of opened outputs
#[derive(Debug, Default)]
pub struct OutputCollection {
    outputs: BTreeMap<IoHandle, OutputDescriptor>,
}

impl OutputCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, desc: OutputDescriptor) {
        self.outputs.insert(desc.handle, desc);
    }

    pub fn remove(&mut self, handle: IoHandle) -> Option<OutputDescriptor> {
        self.outputs.remove(&handle)
    }

    pub fn get(&self, handle: IoHandle) -> Option<&OutputDescriptor> {
        self.outputs.get(&handle)
    }

    pub fn get_mut(&mut self, handle: IoHandle) -> Option<&mut OutputDescriptor> {
        self.outputs.get_mut(&handle)
    }

    pub fn contains(&self, handle: IoHandle) -> bool {
        self.outputs.contains_key(&handle)
    }

    pub fn handles(&self) -> Vec<IoHandle> {
        self.outputs.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &OutputDescriptor> {
        self.outputs.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut OutputDescriptor> {
        self.outputs.values_mut()
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    /// Bump a stream ref count, fanning out through duplicated outputs
    pub fn change_ref_count(&mut self, handle: IoHandle, stream: StreamType, delta: i32) {
        let fan_out = match self.outputs.get(&handle).map(|d| d.kind) {
            Some(OutputKind::Duplicated { output1, output2 }) => Some((output1, output2)),
            Some(OutputKind::Physical { .. }) => None,
            None => {
                warn!(output = %handle, "ref count change on unknown output");
                return;
            }
        };
        if let Some((o1, o2)) = fan_out {
            if let Some(d) = self.outputs.get_mut(&o1) {
                d.change_ref_count(stream, delta);
            }
            if let Some(d) = self.outputs.get_mut(&o2) {
                d.change_ref_count(stream, delta);
            }
        }
        if let Some(d) = self.outputs.get_mut(&handle) {
            d.change_ref_count(stream, delta);
        }
    }

    /// Any output playing (or recently playing) this stream
    pub fn is_stream_active(&self, stream: StreamType, in_past_ms: u32) -> bool {
        self.outputs
            .values()
            .any(|d| d.is_stream_active(stream, in_past_ms))
    }

    /// Stream activity restricted to outputs routed to the given devices
    pub fn is_stream_active_on(
        &self,
        stream: StreamType,
        devices: DeviceSet,
        in_past_ms: u32,
    ) -> bool {
        self.outputs
            .values()
            .any(|d| d.devices.intersects(devices) && d.is_stream_active(stream, in_past_ms))
    }

    /// Outputs whose profile can reach any of the given devices
    pub fn supporting_any(&self, devices: DeviceSet) -> Vec<IoHandle> {
        self.outputs
            .values()
            .filter(|d| d.supported_devices.intersects(devices))
            .map(|d| d.handle)
            .collect()
    }

    /// Outputs currently routed to any of the given devices
    pub fn routed_to_any(&self, devices: DeviceSet) -> Vec<IoHandle> {
        self.outputs
            .values()
            .filter(|d| d.devices.intersects(devices))
            .map(|d| d.handle)
            .collect()
    }

    pub fn primary(&self) -> Option<IoHandle> {
        self.outputs
            .values()
            .find(|d| d.is_primary())
            .map(|d| d.handle)
    }

    /// The duplicating output fanning into the given physical output, if any
    pub fn duplicating_into(&self, physical: IoHandle) -> Option<IoHandle> {
        self.outputs
            .values()
            .find(|d| match d.kind {
                OutputKind::Duplicated { output1, output2 } => {
                    output1 == physical || output2 == physical
                }
                OutputKind::Physical { .. } => false,
            })
            .map(|d| d.handle)
    }

    /// Output rendering the policy mix registered under `registration`
    pub fn for_policy_mix(&self, registration: &str) -> Option<IoHandle> {
        self.outputs
            .values()
            .find(|d| d.policy_mix.as_deref() == Some(registration))
            .map(|d| d.handle)
    }
}

/// State of one opened input stream
#[derive(Debug, Clone)]
pub struct InputDescriptor {
    pub handle: IoHandle,
    pub module: ModuleHandle,
    pub profile: ProfileHandle,
    pub config: InputConfig,
    pub device: DeviceType,
    pub address: String,
    pub source: InputSource,
    /// Sessions sharing this input (sound trigger reuse)
    pub sessions: HashSet<Session>,
    /// Open ref count; the input closes when it drops to zero
    pub open_count: u32,
    /// Capture started and not yet stopped
    pub active: bool,
    /// Opened on behalf of the sound trigger service
    pub is_sound_trigger: bool,
}

impl InputDescriptor {
    pub fn new(
        handle: IoHandle,
        module: ModuleHandle,
        profile: ProfileHandle,
        config: InputConfig,
        device: DeviceType,
        source: InputSource,
    ) -> Self {
        Self {
            handle,
            module,
            profile,
            config,
            device,
            address: String::new(),
            source,
            sessions: HashSet::new(),
            open_count: 1,
            active: false,
            is_sound_trigger: false,
        }
    }

    pub fn is_virtual(&self) -> bool {
        self.device.is_virtual_input()
    }
}

/// Handle-indexed table of opened inputs
#[derive(Debug, Default)]
pub struct InputCollection {
    inputs: BTreeMap<IoHandle, InputDescriptor>,
}

impl InputCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, desc: InputDescriptor) {
        self.inputs.insert(desc.handle, desc);
    }

    pub fn remove(&mut self, handle: IoHandle) -> Option<InputDescriptor> {
        self.inputs.remove(&handle)
    }

    pub fn get(&self, handle: IoHandle) -> Option<&InputDescriptor> {
        self.inputs.get(&handle)
    }

    pub fn get_mut(&mut self, handle: IoHandle) -> Option<&mut InputDescriptor> {
        self.inputs.get_mut(&handle)
    }

    pub fn handles(&self) -> Vec<IoHandle> {
        self.inputs.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &InputDescriptor> {
        self.inputs.values()
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    /// The single active non-virtual input, if capture is in progress
    pub fn active_input(&self) -> Option<IoHandle> {
        self.inputs
            .values()
            .find(|d| d.active && !d.is_virtual())
            .map(|d| d.handle)
    }

    pub fn active_count(&self, include_virtual: bool) -> usize {
        self.inputs
            .values()
            .filter(|d| d.active && (include_virtual || !d.is_virtual()))
            .count()
    }

    pub fn is_source_active(&self, source: InputSource) -> bool {
        self.inputs.values().any(|d| d.active && d.source == source)
    }

    /// An existing input opened for this session, if any
    pub fn for_session(&self, session: Session) -> Option<IoHandle> {
        self.inputs
            .values()
            .find(|d| d.sessions.contains(&session))
            .map(|d| d.handle)
    }

    pub fn on_device(&self, devices: DeviceSet) -> Vec<IoHandle> {
        self.inputs
            .values()
            .filter(|d| devices.contains(d.device))
            .map(|d| d.handle)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::audio::{AudioFormat, ChannelMask, InputFlags};

    fn output(handle: u32, flags: OutputFlags) -> OutputDescriptor {
        OutputDescriptor::new(
            IoHandle::new(handle),
            OutputKind::Physical {
                module: ModuleHandle::new(1),
                profile: ProfileHandle::new(1),
            },
            OutputConfig {
                sample_rate: 48_000,
                format: AudioFormat::Pcm16,
                channel_mask: ChannelMask::OutStereo,
                flags,
            },
            20,
        )
    }

    #[test]
    fn test_ref_count_tracks_activity() {
        let mut desc = output(1, OutputFlags::PRIMARY);
        assert!(!desc.is_stream_active(StreamType::Music, 0));

        desc.change_ref_count(StreamType::Music, 1);
        assert!(desc.is_stream_active(StreamType::Music, 0));
        assert!(desc.is_active(0));

        desc.change_ref_count(StreamType::Music, -1);
        assert!(!desc.is_stream_active(StreamType::Music, 0));
        // Just stopped, so still active within a window
        assert!(desc.is_stream_active(StreamType::Music, 10_000));
    }

    #[test]
    fn test_ref_count_underflow_clamps() {
        let mut desc = output(1, OutputFlags::NONE);
        assert_eq!(desc.change_ref_count(StreamType::Alarm, -3), 0);
    }

    #[test]
    fn test_duplicated_fan_out() {
        let mut outputs = OutputCollection::new();
        outputs.add(output(1, OutputFlags::PRIMARY));
        outputs.add(output(2, OutputFlags::NONE));

        let dup = OutputDescriptor::new(
            IoHandle::new(3),
            OutputKind::Duplicated {
                output1: IoHandle::new(1),
                output2: IoHandle::new(2),
            },
            OutputConfig {
                sample_rate: 48_000,
                format: AudioFormat::Pcm16,
                channel_mask: ChannelMask::OutStereo,
                flags: OutputFlags::NONE,
            },
            40,
        );
        outputs.add(dup);

        outputs.change_ref_count(IoHandle::new(3), StreamType::Music, 1);
        assert_eq!(
            outputs.get(IoHandle::new(1)).unwrap().ref_count(StreamType::Music),
            1
        );
        assert_eq!(
            outputs.get(IoHandle::new(2)).unwrap().ref_count(StreamType::Music),
            1
        );
        assert_eq!(
            outputs.get(IoHandle::new(3)).unwrap().ref_count(StreamType::Music),
            1
        );
        assert_eq!(outputs.duplicating_into(IoHandle::new(2)), Some(IoHandle::new(3)));
    }

    #[test]
    fn test_mute_counts_balanced() {
        let mut desc = output(1, OutputFlags::NONE);
        assert_eq!(desc.increment_mute(StreamType::Ring), 1);
        assert_eq!(desc.increment_mute(StreamType::Ring), 2);
        assert_eq!(desc.decrement_mute(StreamType::Ring), 1);
        assert_eq!(desc.decrement_mute(StreamType::Ring), 0);
        // Unbalanced unmute stays at zero
        assert_eq!(desc.decrement_mute(StreamType::Ring), 0);
    }

    #[test]
    fn test_single_active_input_query() {
        let mut inputs = InputCollection::new();
        let config = InputConfig {
            sample_rate: 16_000,
            format: AudioFormat::Pcm16,
            channel_mask: ChannelMask::InMono,
            flags: InputFlags::NONE,
        };
        let mut mic = InputDescriptor::new(
            IoHandle::new(10),
            ModuleHandle::new(1),
            ProfileHandle::new(5),
            config,
            DeviceType::BuiltinMic,
            InputSource::Mic,
        );
        mic.active = true;
        inputs.add(mic);

        let mut submix = InputDescriptor::new(
            IoHandle::new(11),
            ModuleHandle::new(2),
            ProfileHandle::new(6),
            config,
            DeviceType::RemoteSubmixIn,
            InputSource::RemoteSubmix,
        );
        submix.active = true;
        inputs.add(submix);

        // The virtual input does not count against the single-input rule
        assert_eq!(inputs.active_input(), Some(IoHandle::new(10)));
        assert_eq!(inputs.active_count(false), 1);
        assert_eq!(inputs.active_count(true), 2);
        assert!(inputs.is_source_active(InputSource::RemoteSubmix));
    }
}
