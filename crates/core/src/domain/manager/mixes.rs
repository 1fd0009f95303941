//! Policy mix registration
//!
//! Registering a mix grows the remote submix module with a pair of profiles
//! keyed by the mix's registration id, then synthesizes the device connection
//! events so the ordinary open/close machinery builds the endpoints.

use super::PolicyManager;
use crate::domain::audio::{PolicyError, ProfileHandle, Result};
use crate::domain::device::{DeviceDescriptor, DeviceSet, DeviceType};
use crate::domain::mix::{AudioPolicyMix, MixFormat};
use crate::domain::profile::IOProfile;
use tracing::{info, warn};

impl PolicyManager {
    fn submix_module_index(&self) -> Result<usize> {
        self.modules
            .iter()
            .position(|m| {
                m.handle.is_some()
                    && m.supported_output_devices()
                        .contains(DeviceType::RemoteSubmix)
            })
            .ok_or_else(|| {
                PolicyError::Unsupported("no remote submix module loaded".to_string())
            })
    }

    /// Register mixes, building their submix endpoints. Registration is
    /// all-or-nothing per mix; a failed mix is rolled back before returning.
    pub fn register_policy_mixes(&mut self, mixes: Vec<AudioPolicyMix>) -> Result<()> {
        for mix in mixes {
            let registration = mix.registration.clone();
            let format = mix.format;
            self.mixes.register(mix)?;

            if let Err(e) = self.build_mix_endpoints(&registration, format) {
                warn!(registration = %registration, error = %e, "mix registration failed");
                self.teardown_mix_endpoints(&registration);
                self.mixes.unregister(&registration).ok();
                return Err(e);
            }
            info!(registration = %registration, "policy mix online");
        }
        Ok(())
    }

    pub fn unregister_policy_mixes(&mut self, registrations: Vec<String>) -> Result<()> {
        for registration in registrations {
            self.mixes.unregister(&registration)?;
            self.teardown_mix_endpoints(&registration);
            info!(registration = %registration, "policy mix offline");
        }
        self.check_output_for_all_strategies();
        self.update_devices_and_outputs();
        self.client.on_audio_port_list_changed();
        Ok(())
    }

    fn build_mix_endpoints(&mut self, registration: &str, format: MixFormat) -> Result<()> {
        let module_idx = self.submix_module_index()?;
        let module_handle = self.modules[module_idx].handle;

        // Stereo-forced profile pair keyed by the registration address
        let out_handle = ProfileHandle::new(self.client.new_unique_id());
        let mut out_profile = IOProfile::new_output(
            out_handle,
            format!("submix out {registration}"),
            DeviceSet::of(DeviceType::RemoteSubmix),
            crate::domain::audio::OutputFlags::NONE,
        );
        out_profile.address = registration.to_string();
        out_profile.sample_rates = vec![format.sample_rate];
        out_profile.formats = vec![format.format];
        out_profile.channel_masks = vec![crate::domain::audio::ChannelMask::OutStereo];

        let in_handle = ProfileHandle::new(self.client.new_unique_id());
        let mut in_profile = IOProfile::new_input(
            in_handle,
            format!("submix in {registration}"),
            DeviceSet::of(DeviceType::RemoteSubmixIn),
            crate::domain::audio::InputFlags::NONE,
        );
        in_profile.address = registration.to_string();
        in_profile.sample_rates = vec![format.sample_rate];
        in_profile.formats = vec![format.format];
        in_profile.channel_masks = vec![crate::domain::audio::ChannelMask::InStereo];

        self.modules[module_idx].outputs.push(out_profile);
        self.modules[module_idx].inputs.push(in_profile);

        // Playback side comes up through the normal connection machinery so
        // an output opens and strategies re-evaluate
        self.set_device_connection_state(DeviceType::RemoteSubmix, registration, true)?;

        let output = self
            .outputs
            .iter()
            .find(|d| d.address == registration && d.supports_device(DeviceType::RemoteSubmix))
            .map(|d| d.handle)
            .ok_or_else(|| {
                PolicyError::OperationFailed(format!(
                    "no output bound for mix {registration}"
                ))
            })?;
        if let Some(desc) = self.outputs.get_mut(output) {
            desc.policy_mix = Some(registration.to_string());
        }
        if let Some(mix) = self.mixes.get_mut(registration) {
            mix.output = Some(output);
        }

        // Capture side is just advertised; an input opens on demand
        let mut capture = DeviceDescriptor::new(DeviceType::RemoteSubmixIn, registration);
        capture.module = module_handle;
        capture.port_id = Some(crate::domain::audio::PortId::new(self.client.new_unique_id()));
        self.available_input_devices.add(capture)?;
        Ok(())
    }

    fn teardown_mix_endpoints(&mut self, registration: &str) {
        if let Some(output) = self.outputs.for_policy_mix(registration) {
            self.close_output(output);
        }
        // The bound output may exist without the mix tag when rolling back
        let stray: Vec<_> = self
            .outputs
            .iter()
            .filter(|d| d.address == registration)
            .map(|d| d.handle)
            .collect();
        for output in stray {
            self.close_output(output);
        }
        let inputs = self.inputs.handles();
        for input in inputs {
            let matches = self
                .inputs
                .get(input)
                .map(|d| d.address == registration)
                .unwrap_or(false);
            if matches {
                self.close_input(input);
            }
        }

        self.available_output_devices
            .remove(DeviceType::RemoteSubmix, registration)
            .ok();
        self.available_input_devices
            .remove(DeviceType::RemoteSubmixIn, registration)
            .ok();

        for module in &mut self.modules {
            let doomed: Vec<ProfileHandle> = module
                .outputs
                .iter()
                .chain(module.inputs.iter())
                .filter(|p| p.address == registration)
                .map(|p| p.handle)
                .collect();
            for handle in doomed {
                module.remove_profile(handle);
            }
        }
    }
}
