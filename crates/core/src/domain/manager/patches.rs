//! Explicit routing patches and port enumeration

use super::PolicyManager;
use crate::domain::audio::{
    IoHandle, PatchHandle, PolicyError, PortId, Result, Uid,
};
use crate::domain::device::{DeviceSet, DeviceType};
use crate::domain::patch::{AudioPatch, PatchPort, PatchRequest};
use crate::domain::profile::PortDirection;
use serde::Serialize;
use tracing::{debug, info, warn};

/// One enumerable port of the routing graph
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum PortInfo {
    Device {
        device: DeviceType,
        address: String,
        port_id: PortId,
    },
    Mix {
        io: IoHandle,
        direction: PortDirection,
    },
}

impl PolicyManager {
    /// Create or update an explicit routing patch on behalf of `uid`.
    /// Passing `existing` retargets a patch in place, keeping its handle.
    pub fn create_audio_patch(
        &mut self,
        request: PatchRequest,
        uid: Uid,
        existing: Option<PatchHandle>,
    ) -> Result<PatchHandle> {
        request.validate()?;

        // At most one patch per endpoint: a new request on an already-patched
        // source updates that patch in place instead of stacking a second one
        let existing = existing.or_else(|| match &request.source {
            PatchPort::Mix { io } => self.patches.find_by_source_mix(*io),
            PatchPort::Device { device, address } => {
                self.patches.find_by_source_device(*device, address)
            }
        });

        let (handle, prior_hal) = match existing {
            Some(handle) => {
                let patch = self
                    .patches
                    .get(handle)
                    .ok_or_else(|| PolicyError::NotFound(format!("patch {handle} not found")))?;
                if patch.owner != uid {
                    return Err(PolicyError::PermissionDenied(format!(
                        "patch {handle} is owned by uid {}",
                        patch.owner.0
                    )));
                }
                (handle, patch.hal_handle)
            }
            None => (self.patches.next_handle(), None),
        };

        let hal_handle = match (&request.source, request.sinks.as_slice()) {
            // Playback patch: pin an open output onto explicit devices
            (PatchPort::Mix { io }, sinks) => {
                self.create_output_patch(*io, sinks, prior_hal, handle)?
            }
            // Capture patch: pin an open input onto an explicit device
            (PatchPort::Device { device, address }, [PatchPort::Mix { io }]) => {
                self.create_input_patch(*device, address.clone(), *io, prior_hal)?
            }
            // Device to device (FM tuner to speaker and friends)
            (PatchPort::Device { device, address }, sinks) => {
                self.create_device_patch(*device, address.clone(), sinks, prior_hal)?
            }
        };

        self.patches.put(AudioPatch {
            handle,
            source: request.source,
            sinks: request.sinks,
            owner: uid,
            hal_handle,
        });
        self.client.on_audio_patch_list_changed();
        info!(%handle, uid = uid.0, "audio patch created");
        Ok(handle)
    }

    fn sink_device_set(&self, sinks: &[PatchPort]) -> Result<DeviceSet> {
        let available = self.available_output_set();
        let mut devices = DeviceSet::EMPTY;
        for sink in sinks {
            match sink {
                PatchPort::Device { device, address } => {
                    if !self.available_output_devices.contains(*device, address) {
                        return Err(PolicyError::NotFound(format!(
                            "sink device {device} not connected"
                        )));
                    }
                    devices.insert(*device);
                }
                PatchPort::Mix { .. } => {
                    return Err(PolicyError::InvalidArgument(
                        "mixed device and mix sinks are not supported".to_string(),
                    ));
                }
            }
        }
        debug_assert!(available.contains_all(devices));
        Ok(devices)
    }

    fn create_output_patch(
        &mut self,
        output: IoHandle,
        sinks: &[PatchPort],
        prior_hal: Option<crate::domain::audio::HalPatchHandle>,
        handle: PatchHandle,
    ) -> Result<Option<crate::domain::audio::HalPatchHandle>> {
        if !self.outputs.contains(output) {
            return Err(PolicyError::NotFound(format!("output {output} not found")));
        }
        let devices = self.sink_device_set(sinks)?;
        let supported = self
            .outputs
            .get(output)
            .map(|d| d.supported_devices)
            .unwrap_or(DeviceSet::EMPTY);
        if !supported.intersects(devices) {
            return Err(PolicyError::InvalidArgument(format!(
                "output {output} cannot reach {devices}"
            )));
        }

        let hal = if self.client.patch_panel_supported() {
            Some(
                self.client
                    .create_audio_patch(&[PatchPort::mix(output)], sinks, prior_hal)?,
            )
        } else {
            None
        };
        // Pin before rerouting so strategy evaluation cannot undo it
        if let Some(desc) = self.outputs.get_mut(output) {
            desc.patch = Some(handle);
        }
        self.set_output_device(output, devices, true, 0);
        Ok(hal)
    }

    fn create_input_patch(
        &mut self,
        device: DeviceType,
        address: String,
        input: IoHandle,
        prior_hal: Option<crate::domain::audio::HalPatchHandle>,
    ) -> Result<Option<crate::domain::audio::HalPatchHandle>> {
        if self.inputs.get(input).is_none() {
            return Err(PolicyError::NotFound(format!("input {input} not found")));
        }
        if !self.available_input_devices.contains(device, &address) {
            return Err(PolicyError::NotFound(format!(
                "source device {device} not connected"
            )));
        }
        let hal = if self.client.patch_panel_supported() {
            Some(self.client.create_audio_patch(
                &[PatchPort::device(device, address)],
                &[PatchPort::mix(input)],
                prior_hal,
            )?)
        } else {
            None
        };
        self.set_input_device(input, device);
        Ok(hal)
    }

    /// Device-to-device patches either go straight to the HAL or, on HALs
    /// without patch panels (or across modules), get bridged through an
    /// output mix routed to the sink devices.
    fn create_device_patch(
        &mut self,
        device: DeviceType,
        address: String,
        sinks: &[PatchPort],
        prior_hal: Option<crate::domain::audio::HalPatchHandle>,
    ) -> Result<Option<crate::domain::audio::HalPatchHandle>> {
        if !self.available_input_devices.contains(device, &address) {
            return Err(PolicyError::NotFound(format!(
                "source device {device} not connected"
            )));
        }
        let devices = self.sink_device_set(sinks)?;

        let source_module = self
            .available_input_devices
            .get(device, &address)
            .and_then(|d| d.module);
        let sink_module = devices
            .primary()
            .and_then(|d| self.available_output_devices.get(d, "").and_then(|d| d.module));
        let same_module = source_module.is_some() && source_module == sink_module;

        // A lone same-module sink goes straight to the HAL; fan-outs and
        // cross-module hops bridge through an output mix below
        if self.client.patch_panel_supported() && same_module && devices.is_single() {
            let hal = self.client.create_audio_patch(
                &[PatchPort::device(device, address)],
                sinks,
                prior_hal,
            )?;
            return Ok(Some(hal));
        }

        // Bridge: force an output onto the sink devices, then feed it
        let output = self.get_output_for_device(
            devices,
            crate::domain::audio::StreamType::Music,
            0,
            crate::domain::audio::AudioFormat::Pcm16,
            crate::domain::audio::ChannelMask::OutStereo,
            crate::domain::audio::OutputFlags::NONE,
        )?;
        self.set_output_device(output, devices, true, 0);
        let hal = self.client.create_audio_patch(
            &[PatchPort::device(device, address)],
            &[PatchPort::mix(output)],
            prior_hal,
        )?;
        debug!(%device, %output, "device patch bridged through output mix");
        Ok(Some(hal))
    }

    /// Tear a patch down and return its endpoints to policy routing
    pub fn release_audio_patch(&mut self, handle: PatchHandle, uid: Uid) -> Result<()> {
        let owner = self
            .patches
            .get(handle)
            .map(|p| p.owner)
            .ok_or_else(|| PolicyError::NotFound(format!("patch {handle} not found")))?;
        if owner != uid {
            return Err(PolicyError::PermissionDenied(format!(
                "patch {handle} is owned by uid {}",
                owner.0
            )));
        }
        let patch = self.patches.remove(handle)?;

        if let Some(hal) = patch.hal_handle {
            if let Err(e) = self.client.release_audio_patch(hal) {
                warn!(%handle, error = %e, "hal patch release failed");
            }
        }

        // An output pinned by this patch goes back to strategy routing
        if let PatchPort::Mix { io } = patch.source {
            if let Some(desc) = self.outputs.get_mut(io) {
                desc.patch = None;
            }
            let devices = self.get_new_output_device(io, false);
            self.set_output_device(io, devices, true, 0);
        }
        if let [PatchPort::Mix { io }] = patch.sinks.as_slice() {
            if let Some(device) = self.get_new_input_device(*io) {
                self.set_input_device(*io, device);
            }
        }
        self.client.on_audio_patch_list_changed();
        info!(%handle, "audio patch released");
        Ok(())
    }

    pub fn list_audio_patches(&self) -> Vec<AudioPatch> {
        self.patches.iter().cloned().collect()
    }

    /// Apply a configuration tweak to one mix port; only gain is mutable
    pub fn set_audio_port_config(&mut self, io: IoHandle, gain_db: f32) -> Result<()> {
        if !self.outputs.contains(io) && self.inputs.get(io).is_none() {
            return Err(PolicyError::NotFound(format!("port {io} not found")));
        }
        if !(-144.0..=24.0).contains(&gain_db) {
            return Err(PolicyError::InvalidArgument(format!(
                "gain {gain_db} dB out of range"
            )));
        }
        self.client
            .set_parameters(io, &format!("gain={gain_db}"), 0);
        Ok(())
    }

    /// Every enumerable port: attached devices and open mixes
    pub fn list_audio_ports(&self) -> Vec<PortInfo> {
        let mut ports = Vec::new();
        for d in self
            .available_output_devices
            .iter()
            .chain(self.available_input_devices.iter())
        {
            ports.push(PortInfo::Device {
                device: d.device_type,
                address: d.address.clone(),
                port_id: d.port_id.unwrap_or(PortId::NONE),
            });
        }
        for desc in self.outputs.iter() {
            ports.push(PortInfo::Mix {
                io: desc.handle,
                direction: PortDirection::Output,
            });
        }
        for desc in self.inputs.iter() {
            ports.push(PortInfo::Mix {
                io: desc.handle,
                direction: PortDirection::Input,
            });
        }
        ports
    }

    pub fn get_audio_port(&self, port_id: PortId) -> Option<PortInfo> {
        self.list_audio_ports().into_iter().find(|p| match p {
            PortInfo::Device { port_id: id, .. } => *id == port_id,
            PortInfo::Mix { io, .. } => io.raw() == port_id.raw(),
        })
    }
}
