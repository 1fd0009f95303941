//! Device connection state machine

use super::PolicyManager;
use crate::domain::audio::{IoHandle, PolicyError, Result};
use crate::domain::device::{DeviceDescriptor, DeviceSet, DeviceType};
use crate::domain::hal::{PARAM_DEVICE_CONNECT, PARAM_DEVICE_DISCONNECT};
use tracing::{debug, info, warn};

impl PolicyManager {
    /// Process a device plug or unplug. Connecting an output device opens or
    /// validates at least one output able to reach it; failure to do so rolls
    /// the connection back. After either transition every strategy is
    /// re-evaluated and live outputs are pushed their new routes.
    pub fn set_device_connection_state(
        &mut self,
        device: DeviceType,
        address: &str,
        connected: bool,
    ) -> Result<()> {
        info!(%device, address, connected, "device connection state change");
        if device.is_output() {
            self.set_output_device_connection(device, address, connected)
        } else {
            self.set_input_device_connection(device, address, connected)
        }
    }

    pub fn device_connection_state(&self, device: DeviceType, address: &str) -> bool {
        if device.is_output() {
            self.available_output_devices.contains(device, address)
        } else {
            self.available_input_devices.contains(device, address)
        }
    }

    fn module_for_output_device(&self, device: DeviceType, address: &str) -> Option<usize> {
        self.modules.iter().position(|m| {
            m.handle.is_some()
                && m.outputs
                    .iter()
                    .any(|p| p.supports_device(device, address))
        })
    }

    fn module_for_input_device(&self, device: DeviceType, address: &str) -> Option<usize> {
        self.modules.iter().position(|m| {
            m.handle.is_some() && m.inputs.iter().any(|p| p.supports_device(device, address))
        })
    }

    fn set_output_device_connection(
        &mut self,
        device: DeviceType,
        address: &str,
        connected: bool,
    ) -> Result<()> {
        if connected {
            if self.available_output_devices.contains(device, address) {
                return Err(PolicyError::InvalidState(format!(
                    "device {device} (addr '{address}') already connected"
                )));
            }
            let module_idx = self.module_for_output_device(device, address).ok_or_else(|| {
                PolicyError::NotFound(format!("no module can reach output device {device}"))
            })?;
            let module_handle = self.modules[module_idx].handle;

            let mut descriptor = DeviceDescriptor::new(device, address);
            descriptor.module = module_handle;
            descriptor.port_id =
                Some(crate::domain::audio::PortId::new(self.client.new_unique_id()));
            self.available_output_devices.add(descriptor)?;

            // Tell the HAL before opening anything on the device
            self.client.set_parameters(
                IoHandle::NONE,
                &format!("{}={};address={}", PARAM_DEVICE_CONNECT, device.name(), address),
                0,
            );

            if let Err(e) = self.check_outputs_for_device(device, address, true) {
                warn!(%device, error = %e, "no output reaches device, rolling back");
                self.available_output_devices.remove(device, address)?;
                return Err(PolicyError::OperationFailed(format!(
                    "connection of {device} failed: {e}"
                )));
            }
        } else {
            if !self.available_output_devices.contains(device, address) {
                return Err(PolicyError::InvalidState(format!(
                    "device {device} (addr '{address}') not connected"
                )));
            }
            self.available_output_devices.remove(device, address)?;
            self.client.set_parameters(
                IoHandle::NONE,
                &format!(
                    "{}={};address={}",
                    PARAM_DEVICE_DISCONNECT,
                    device.name(),
                    address
                ),
                0,
            );
            self.check_outputs_for_device(device, address, false)?;
        }

        self.check_a2dp_suspend();
        self.check_output_for_all_strategies();
        self.update_devices_and_outputs();

        let in_call = self.engine.phone_state().is_in_call();
        let handles = self.outputs.handles();
        for output in handles {
            let devices = self.get_new_output_device(output, true);
            // Disconnection must always push a routing command so the HAL
            // stops addressing the vanished device
            let force = !connected || (in_call && output == self.primary_output);
            self.set_output_device(output, devices, force, 0);
        }
        self.client.on_audio_port_list_changed();
        Ok(())
    }

    fn set_input_device_connection(
        &mut self,
        device: DeviceType,
        address: &str,
        connected: bool,
    ) -> Result<()> {
        if connected {
            if self.available_input_devices.contains(device, address) {
                return Err(PolicyError::InvalidState(format!(
                    "device {device} (addr '{address}') already connected"
                )));
            }
            let module_idx = self.module_for_input_device(device, address).ok_or_else(|| {
                PolicyError::NotFound(format!("no module can reach input device {device}"))
            })?;
            let mut descriptor = DeviceDescriptor::new(device, address);
            descriptor.module = self.modules[module_idx].handle;
            descriptor.port_id =
                Some(crate::domain::audio::PortId::new(self.client.new_unique_id()));
            self.available_input_devices.add(descriptor)?;
            self.client.set_parameters(
                IoHandle::NONE,
                &format!("{}={};address={}", PARAM_DEVICE_CONNECT, device.name(), address),
                0,
            );
        } else {
            if !self.available_input_devices.contains(device, address) {
                return Err(PolicyError::InvalidState(format!(
                    "device {device} (addr '{address}') not connected"
                )));
            }
            self.available_input_devices.remove(device, address)?;
            self.check_inputs_for_device(device, false);
            self.client.set_parameters(
                IoHandle::NONE,
                &format!(
                    "{}={};address={}",
                    PARAM_DEVICE_DISCONNECT,
                    device.name(),
                    address
                ),
                0,
            );
        }

        self.update_devices_and_outputs();
        // An active capture may have just gained or lost its best device
        if let Some(input) = self.inputs.active_input() {
            if let Some(new_device) = self.get_new_input_device(input) {
                self.set_input_device(input, new_device);
            }
        }
        self.client.on_audio_port_list_changed();
        Ok(())
    }

    /// Output side of a connection event: open endpoints on connect (probing
    /// dynamic profiles), close orphaned endpoints on disconnect.
    pub(super) fn check_outputs_for_device(
        &mut self,
        device: DeviceType,
        address: &str,
        connected: bool,
    ) -> Result<Vec<IoHandle>> {
        if connected {
            self.open_outputs_for_device(device, address)
        } else {
            self.close_outputs_for_device(device, address);
            Ok(Vec::new())
        }
    }

    fn open_outputs_for_device(
        &mut self,
        device: DeviceType,
        address: &str,
    ) -> Result<Vec<IoHandle>> {
        // Outputs already able to reach the device count as coverage
        let mut opened: Vec<IoHandle> = self
            .outputs
            .iter()
            .filter(|d| d.supports_device(device) && !d.is_duplicated())
            .map(|d| d.handle)
            .collect();

        let primary_module = self
            .outputs
            .get(self.primary_output)
            .and_then(|d| d.module());

        // Profiles that can reach the device but have nothing open yet. An
        // address-keyed profile outranks the generic one for its address.
        let keyed_exists = self.modules.iter().any(|m| {
            m.handle.is_some()
                && m.outputs
                    .iter()
                    .any(|p| !p.address.is_empty() && p.supports_device(device, address))
        });
        let mut plan = Vec::new();
        for module in &self.modules {
            let Some(module_handle) = module.handle else {
                continue;
            };
            for profile in &module.outputs {
                if !profile.supports_device(device, address) {
                    continue;
                }
                if keyed_exists && profile.address.is_empty() {
                    continue;
                }
                let already_open = self
                    .outputs
                    .iter()
                    .any(|d| d.profile() == Some(profile.handle) && d.address == address);
                if already_open {
                    continue;
                }
                plan.push((
                    module_handle,
                    profile.handle,
                    profile.dynamic,
                    profile.is_direct(),
                ));
            }
        }

        for (module, profile, dynamic, direct) in plan {
            let output = match self.open_output_on_profile(module, profile, device, address, None) {
                Ok(output) => output,
                Err(e) => {
                    warn!(%device, %profile, error = %e, "output open failed on connect");
                    continue;
                }
            };
            if dynamic {
                let reply = self.client.get_parameters(
                    output,
                    "sup_sampling_rates;sup_formats;sup_channels",
                );
                let probed = self
                    .modules
                    .iter_mut()
                    .find(|m| m.handle == Some(module))
                    .and_then(|m| m.profile_mut(profile))
                    .map(|p| {
                        p.import_from_parameters(&reply);
                        (
                            p.sample_rates.clone(),
                            p.formats.clone(),
                            p.channel_masks.clone(),
                        )
                    });
                // The device descriptor accumulates what its profiles learn
                if let Some((rates, formats, masks)) = probed {
                    if let Some(d) = self.available_output_devices.get_mut(device, address) {
                        d.import_capabilities(&rates, &formats, &masks);
                    }
                }
            }
            // Fan non-direct secondary-module outputs into the primary path
            // so sonification reaches both sinks. Policy mix destinations
            // are address-keyed and never duplicated.
            if !direct
                && address.is_empty()
                && Some(module) != primary_module
                && !self.primary_output.is_none()
            {
                if let Err(e) = self.open_duplicated_output(output) {
                    warn!(%output, error = %e, "duplication failed");
                }
            }
            opened.push(output);
        }

        if opened.is_empty() {
            return Err(PolicyError::OperationFailed(format!(
                "no output profile could be opened for {device}"
            )));
        }
        debug!(%device, count = opened.len(), "outputs available for device");
        Ok(opened)
    }

    fn close_outputs_for_device(&mut self, device: DeviceType, address: &str) {
        let available = self.available_output_set();

        // Probed capabilities die with the device
        for module in &mut self.modules {
            for profile in module.outputs.iter_mut() {
                if profile.dynamic && profile.supports_device(device, address) {
                    profile.clear_dynamic_params();
                }
            }
        }

        // Close outputs whose profile can no longer reach anything attached
        let doomed: Vec<IoHandle> = self
            .outputs
            .iter()
            .filter(|d| {
                !d.is_duplicated()
                    && d.supports_device(device)
                    && (d.supported_devices & available).is_empty()
            })
            .map(|d| d.handle)
            .collect();
        for output in doomed {
            debug!(%output, %device, "closing output orphaned by disconnect");
            self.close_output(output);
        }
    }

    /// Input side of a disconnect: captures on the vanished device stop
    pub(super) fn check_inputs_for_device(&mut self, device: DeviceType, connected: bool) {
        if connected {
            return;
        }
        for module in &mut self.modules {
            for profile in module.inputs.iter_mut() {
                if profile.dynamic && profile.devices.contains(device) {
                    profile.clear_dynamic_params();
                }
            }
        }
        let doomed = self.inputs.on_device(DeviceSet::of(device));
        for input in doomed {
            debug!(%input, %device, "closing input orphaned by disconnect");
            self.close_input(input);
        }
    }

    /// Suspend A2DP outputs while a SCO link could carry audio; the two
    /// cannot run concurrently on most controllers.
    pub(super) fn check_a2dp_suspend(&mut self) {
        use crate::domain::audio::{ForceUsage, ForcedConfig, PhoneState};

        let a2dp_outputs = self.outputs.supporting_any(DeviceSet::a2dp_all());
        if a2dp_outputs.is_empty() {
            self.a2dp_suspended = false;
            return;
        }
        let sco_connected = self
            .available_output_set()
            .intersects(DeviceSet::sco_all());
        let state = self.engine.phone_state();
        let force_sco = self.engine.force_use(ForceUsage::Communication) == ForcedConfig::BtSco
            || self.engine.force_use(ForceUsage::Record) == ForcedConfig::BtSco;
        let should_suspend =
            sco_connected && (state.is_in_call() || state == PhoneState::Ringtone || force_sco);

        if should_suspend == self.a2dp_suspended {
            return;
        }
        for output in a2dp_outputs {
            let result = if should_suspend {
                self.client.suspend_output(output)
            } else {
                self.client.restore_output(output)
            };
            if let Err(e) = result {
                warn!(%output, suspend = should_suspend, error = %e, "a2dp suspend change failed");
            }
        }
        info!(suspended = should_suspend, "a2dp suspension changed");
        self.a2dp_suspended = should_suspend;
    }
}
