//! Input selection and capture lifecycle
//!
//! Capture policy is stricter than playback: at most one non-virtual input
//! captures at a time, with hotword detection yielding to any real client.

use super::PolicyManager;
use crate::domain::audio::{
    AudioFormat, ChannelMask, InputFlags, InputSource, IoHandle, PolicyError, RecordAttributes,
    Result, Session,
};
use crate::domain::device::DeviceType;
use crate::domain::hal::InputConfig;
use crate::domain::descriptor::InputDescriptor;
use tracing::{debug, info, warn};

impl PolicyManager {
    /// Resolve and open (or share) an input for a record request. Explicit
    /// session routes win, then recorders policy mixes by address tag, then
    /// the engine's source-based selection.
    pub fn get_input_for_attr(
        &mut self,
        attrs: &RecordAttributes,
        session: Session,
        sample_rate: u32,
        format: AudioFormat,
        mut channel_mask: ChannelMask,
        mut flags: InputFlags,
    ) -> Result<IoHandle> {
        // A session already holding an input shares it (sound trigger handoff)
        if let Some(existing) = self.inputs.for_session(session) {
            if let Some(desc) = self.inputs.get_mut(existing) {
                desc.open_count += 1;
                debug!(input = %existing, %session, "input shared with session");
                return Ok(existing);
            }
        }

        let source = attrs.source;
        let available = self.available_input_set();

        let (device, address) = if let Some(device) = self
            .input_routes
            .active_device_for_session(session, available)
        {
            (device, String::new())
        } else if let Some(registration) = attrs.mix_address() {
            let mix = self
                .mixes
                .match_input(source, registration)
                .ok_or_else(|| {
                    PolicyError::NotFound(format!(
                        "no recorders mix registered at {registration}"
                    ))
                })?;
            (DeviceType::RemoteSubmixIn, mix.registration.clone())
        } else {
            let device = self
                .engine
                .device_for_input_source(source, available)
                .ok_or_else(|| {
                    PolicyError::NotFound(format!("no available device for source {source:?}"))
                })?;
            (device, String::new())
        };

        // Telephony taps carry a fixed channel layout
        match source {
            InputSource::VoiceUplink => channel_mask = ChannelMask::InVoiceUplink,
            InputSource::VoiceDownlink => channel_mask = ChannelMask::InVoiceDownlink,
            _ => {}
        }

        let mut matched = self.find_input_profile(
            device,
            &address,
            sample_rate,
            format,
            channel_mask,
            flags,
        );
        if matched.is_none() && !flags.is_empty() {
            // Flags are a preference for inputs, not a contract
            flags = InputFlags::NONE;
            matched =
                self.find_input_profile(device, &address, sample_rate, format, channel_mask, flags);
        }
        let (module, profile) = matched.ok_or_else(|| {
            PolicyError::Unsupported(format!(
                "no input profile for {device} at {sample_rate}Hz {format:?} {channel_mask:?}"
            ))
        })?;

        let config = InputConfig {
            sample_rate,
            format,
            channel_mask,
            flags,
        };
        let opened = self
            .client
            .open_input(module, config, device, &address, source)?;
        // Capture clients cannot resample; the negotiated config must be the
        // requested one or the input is useless to them
        if opened.config != config {
            warn!(input = %opened.handle, "input negotiation mismatch, closing");
            self.client.close_input(opened.handle)?;
            return Err(PolicyError::OperationFailed(format!(
                "input config rejected for {device}"
            )));
        }

        let mut desc = InputDescriptor::new(opened.handle, module, profile, config, device, source);
        desc.address = address;
        desc.sessions.insert(session);
        desc.is_sound_trigger = flags.contains(InputFlags::HW_HOTWORD)
            && self.sound_trigger_sessions.contains_key(&session);
        info!(input = %opened.handle, %device, ?source, "input opened");
        self.inputs.add(desc);
        Ok(opened.handle)
    }

    fn find_input_profile(
        &self,
        device: DeviceType,
        address: &str,
        sample_rate: u32,
        format: AudioFormat,
        channel_mask: ChannelMask,
        flags: InputFlags,
    ) -> Option<(crate::domain::audio::ModuleHandle, crate::domain::audio::ProfileHandle)> {
        for module in &self.modules {
            let handle = module.handle?;
            for profile in &module.inputs {
                if profile.is_compatible_input(
                    device,
                    address,
                    sample_rate,
                    format,
                    channel_mask,
                    flags,
                ) {
                    return Some((handle, profile.handle));
                }
            }
        }
        None
    }

    /// Begin capture. Enforces the single-active-input rule, preempting a
    /// hotword capture in favor of any real client.
    pub fn start_input(&mut self, input: IoHandle, session: Session) -> Result<()> {
        let (is_member, is_virtual, source) = {
            let desc = self
                .inputs
                .get(input)
                .ok_or_else(|| PolicyError::NotFound(format!("input {input} not found")))?;
            (
                desc.sessions.contains(&session),
                desc.is_virtual(),
                desc.source,
            )
        };
        if !is_member {
            return Err(PolicyError::InvalidArgument(format!(
                "session {session} does not own input {input}"
            )));
        }

        if !is_virtual {
            if let Some(active) = self.inputs.active_input() {
                if active != input {
                    let active_is_hotword = self
                        .inputs
                        .get(active)
                        .map(|d| d.source == InputSource::Hotword || d.is_sound_trigger)
                        .unwrap_or(false);
                    let starting_is_hotword = source == InputSource::Hotword;
                    if active_is_hotword && !starting_is_hotword {
                        // Preempted hotword captures are closed outright; their
                        // sessions reopen an input once the mic frees up
                        info!(preempted = %active, by = %input, "hotword capture preempted");
                        self.close_input(active);
                    } else {
                        return Err(PolicyError::InvalidState(format!(
                            "input {active} is already capturing"
                        )));
                    }
                }
            }
        }

        debug!(%input, %session, "start input");
        if let Some(desc) = self.inputs.get_mut(input) {
            desc.active = true;
        }
        self.input_routes.start_activity(session);

        if let Some(device) = self.get_new_input_device(input) {
            self.set_input_device(input, device);
        }

        // Capturing from the submix needs its playback side advertised so
        // matching players start feeding it
        if is_virtual {
            let address = self
                .inputs
                .get(input)
                .map(|d| d.address.clone())
                .unwrap_or_default();
            if !self
                .available_output_devices
                .contains(DeviceType::RemoteSubmix, &address)
            {
                if let Err(e) =
                    self.set_device_connection_state(DeviceType::RemoteSubmix, &address, true)
                {
                    warn!(error = %e, "submix playback side failed to connect");
                }
            }
        }

        self.client
            .set_sound_trigger_capture_state(self.inputs.active_count(false) > 0);
        Ok(())
    }

    pub fn stop_input(&mut self, input: IoHandle, session: Session) -> Result<()> {
        let (active, is_virtual, address) = {
            let desc = self
                .inputs
                .get(input)
                .ok_or_else(|| PolicyError::NotFound(format!("input {input} not found")))?;
            (desc.active, desc.is_virtual(), desc.address.clone())
        };
        if !active {
            return Err(PolicyError::InvalidState(format!(
                "input {input} not started"
            )));
        }
        debug!(%input, %session, "stop input");

        if let Some(desc) = self.inputs.get_mut(input) {
            desc.active = false;
        }
        self.input_routes.stop_activity(session);
        self.client.set_parameters(input, "routing=none", 0);

        // A registered policy mix owns its playback side; only ad hoc
        // submix captures tear theirs down
        if is_virtual
            && self.mixes.get(&address).is_none()
            && self
                .available_output_devices
                .contains(DeviceType::RemoteSubmix, &address)
        {
            if let Err(e) =
                self.set_device_connection_state(DeviceType::RemoteSubmix, &address, false)
            {
                warn!(error = %e, "submix playback side failed to disconnect");
            }
        }

        self.client
            .set_sound_trigger_capture_state(self.inputs.active_count(false) > 0);
        Ok(())
    }

    /// Drop a session's claim; the input closes with its last session
    pub fn release_input(&mut self, input: IoHandle, session: Session) {
        debug!(%input, %session, "release input");
        self.input_routes.release_route(session);
        let close = match self.inputs.get_mut(input) {
            Some(desc) => {
                desc.sessions.remove(&session);
                desc.open_count = desc.open_count.saturating_sub(1);
                desc.open_count == 0
            }
            None => false,
        };
        if close {
            self.close_input(input);
        }
    }

    pub(super) fn close_input(&mut self, input: IoHandle) {
        if let Err(e) = self.client.close_input(input) {
            warn!(%input, error = %e, "input close failed");
        }
        self.inputs.remove(input);
        self.client
            .set_sound_trigger_capture_state(self.inputs.active_count(false) > 0);
        info!(%input, "input closed");
    }

    /// Best capture device for an open input right now
    pub(super) fn get_new_input_device(&self, input: IoHandle) -> Option<DeviceType> {
        let desc = self.inputs.get(input)?;
        let available = self.available_input_set();
        for session in &desc.sessions {
            if let Some(device) = self
                .input_routes
                .active_device_for_session(*session, available)
            {
                return Some(device);
            }
        }
        if let Some(device) = self
            .input_routes
            .active_device_for_source(desc.source, available)
        {
            return Some(device);
        }
        if desc.is_virtual() {
            return Some(desc.device);
        }
        self.engine.device_for_input_source(desc.source, available)
    }

    pub(super) fn set_input_device(&mut self, input: IoHandle, device: DeviceType) {
        let changed = match self.inputs.get_mut(input) {
            Some(desc) if desc.device != device => {
                desc.device = device;
                true
            }
            _ => false,
        };
        if changed {
            debug!(%input, %device, "input rerouted");
            self.client
                .set_parameters(input, &format!("routing={}", device.name()), 0);
        }
    }
}
