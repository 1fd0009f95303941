//! Output selection, lifecycle and rerouting

use super::PolicyManager;
use crate::domain::audio::{
    AttrFlags, AudioAttributes, AudioFormat, ChannelMask, IoHandle, ModuleHandle, OutputFlags,
    PolicyError, ProfileHandle, Result, Session, StreamType, Usage,
};
use crate::domain::descriptor::{OutputDescriptor, OutputKind};
use crate::domain::device::{DeviceSet, DeviceType};
use crate::domain::engine::{strategy_for_attributes, strategy_for_stream, stream_for_attributes, Strategy};
use crate::domain::hal::OutputConfig;
use crate::domain::profile::IOProfile;
use tracing::{debug, info, trace, warn};

impl PolicyManager {
    fn find_profile(&self, module: ModuleHandle, profile: ProfileHandle) -> Option<&IOProfile> {
        self.modules
            .iter()
            .find(|m| m.handle == Some(module))
            .and_then(|m| m.profile(profile))
    }

    /// Open a physical output on one profile, register its descriptor and
    /// prime its volumes. A direct request carries its own config; everything
    /// else opens at the profile defaults. The negotiated config may differ.
    pub(super) fn open_output_on_profile(
        &mut self,
        module: ModuleHandle,
        profile: ProfileHandle,
        device: DeviceType,
        address: &str,
        requested: Option<(u32, AudioFormat, ChannelMask)>,
    ) -> Result<IoHandle> {
        let (config, supported, profile_address) = {
            let p = self.find_profile(module, profile).ok_or_else(|| {
                PolicyError::NotFound(format!("profile {profile} not found on module {module}"))
            })?;
            let config = match requested {
                Some((sample_rate, format, channel_mask)) => OutputConfig {
                    sample_rate: if sample_rate == 0 {
                        p.default_sample_rate()
                    } else {
                        sample_rate
                    },
                    format,
                    channel_mask,
                    flags: p.out_flags,
                },
                None => OutputConfig {
                    sample_rate: p.default_sample_rate(),
                    format: p.default_format(),
                    channel_mask: p.default_channel_mask(),
                    flags: p.out_flags,
                },
            };
            (config, p.devices, p.address.clone())
        };
        let address = if address.is_empty() {
            profile_address
        } else {
            address.to_string()
        };

        let opened = self.client.open_output(module, config, device, &address)?;
        let mut desc = OutputDescriptor::new(
            opened.handle,
            OutputKind::Physical { module, profile },
            opened.config,
            opened.latency_ms,
        );
        desc.devices = DeviceSet::of(device);
        desc.address = address;
        desc.supported_devices = supported;
        info!(output = %opened.handle, %device, latency = opened.latency_ms, "output opened");
        self.outputs.add(desc);
        self.apply_stream_volumes(opened.handle, DeviceSet::of(device), 0, true);
        Ok(opened.handle)
    }

    /// Open a duplicating output fanning a non-direct output into the primary
    pub(super) fn open_duplicated_output(
        &mut self,
        secondary: IoHandle,
    ) -> Result<IoHandle> {
        let primary = self.primary_output;
        let (sec_config, sec_latency, sec_devices) = {
            let desc = self
                .outputs
                .get(secondary)
                .ok_or_else(|| PolicyError::NotFound(format!("output {secondary} not found")))?;
            (desc.config, desc.latency_ms, desc.devices)
        };
        let primary_latency = self
            .outputs
            .get(primary)
            .map(|d| d.latency_ms)
            .unwrap_or(0);

        let handle = self.client.open_duplicate_output(secondary, primary)?;
        let mut desc = OutputDescriptor::new(
            handle,
            OutputKind::Duplicated {
                output1: secondary,
                output2: primary,
            },
            OutputConfig {
                flags: OutputFlags::NONE,
                ..sec_config
            },
            sec_latency.max(primary_latency),
        );
        desc.devices = sec_devices;
        desc.supported_devices = sec_devices;
        info!(output = %handle, %secondary, %primary, "duplicating output opened");
        self.outputs.add(desc);
        Ok(handle)
    }

    /// Stream-typed legacy entry point
    pub fn get_output(&mut self, stream: StreamType) -> Result<IoHandle> {
        let devices = self.device_for_strategy(strategy_for_stream(stream), false);
        self.get_output_for_device(devices, stream, 0, AudioFormat::Pcm16, ChannelMask::OutStereo, OutputFlags::NONE)
    }

    /// Attribute-driven output selection. Policy mixes and session routes are
    /// consulted before strategy resolution. Returns the output and the
    /// stream type the request will render as, for volume purposes.
    pub fn get_output_for_attr(
        &mut self,
        attrs: &AudioAttributes,
        session: Session,
        sample_rate: u32,
        format: AudioFormat,
        channel_mask: ChannelMask,
        mut flags: OutputFlags,
    ) -> Result<(IoHandle, StreamType)> {
        // Explicit address tag targeting a registered mix wins outright
        if let Some(address) = attrs.mix_address() {
            if self.mixes.get(address).is_some() {
                if let Some(output) = self.outputs.for_policy_mix(address) {
                    trace!(address, %output, "routed to policy mix by address tag");
                    return Ok((output, StreamType::Rerouting));
                }
                return Err(PolicyError::InvalidState(format!(
                    "policy mix {address} has no open output"
                )));
            }
            return Err(PolicyError::NotFound(format!(
                "no policy mix registered at {address}"
            )));
        }

        // Rule-matched mixes reroute silently
        if let Some(mix) = self.mixes.match_attributes(attrs) {
            let registration = mix.registration.clone();
            if let Some(output) = self.outputs.for_policy_mix(&registration) {
                trace!(registration = %registration, %output, "routed to policy mix by rule");
                return Ok((output, StreamType::Rerouting));
            }
        }

        if attrs.usage == Usage::VirtualSource {
            return Err(PolicyError::InvalidArgument(
                "virtual sources route through patches, not outputs".to_string(),
            ));
        }

        let stream = stream_for_attributes(attrs);
        if attrs.flags.contains(AttrFlags::HW_AV_SYNC) {
            flags = flags | OutputFlags::HW_AV_SYNC;
        }

        let available = self.available_output_set();
        let devices = match self
            .output_routes
            .active_device_for_session(session, available)
        {
            Some(device) => DeviceSet::of(device),
            None => self.device_for_strategy(strategy_for_attributes(attrs), false),
        };

        let output =
            self.get_output_for_device(devices, stream, sample_rate, format, channel_mask, flags)?;
        Ok((output, stream))
    }

    /// Pick or open an output reaching the requested devices
    pub(super) fn get_output_for_device(
        &mut self,
        devices: DeviceSet,
        stream: StreamType,
        sample_rate: u32,
        format: AudioFormat,
        channel_mask: ChannelMask,
        mut flags: OutputFlags,
    ) -> Result<IoHandle> {
        // Flag normalization before any matching
        if stream == StreamType::Tts {
            flags = OutputFlags::TTS;
        } else if stream == StreamType::EnforcedAudible {
            // Enforced sounds never go direct; they must mix over the others
            flags = flags.without(OutputFlags::DIRECT);
        }
        if !format.is_linear_pcm() {
            flags = flags | OutputFlags::DIRECT;
        }

        let device = devices.primary().unwrap_or(self.default_output_device);

        // Direct path: exact profile match for direct-capable requests
        if flags.intersects(OutputFlags::DIRECT | OutputFlags::COMPRESS_OFFLOAD) {
            if let Some(output) = self.get_direct_output(
                device,
                sample_rate,
                format,
                channel_mask,
                flags,
            )? {
                return Ok(output);
            }
            // No direct profile fits; compressed requests cannot fall back
            if !format.is_linear_pcm() {
                return Err(PolicyError::Unsupported(format!(
                    "no direct output profile for format {format:?} on {device}"
                )));
            }
            flags = flags.without(OutputFlags::DIRECT);
        }

        // Mixed path: choose among already-open non-direct outputs
        let candidates: Vec<IoHandle> = self
            .outputs
            .supporting_any(devices)
            .into_iter()
            .filter(|h| {
                self.outputs
                    .get(*h)
                    .map(|d| !d.is_direct() && d.policy_mix.is_none())
                    .unwrap_or(false)
            })
            .collect();
        match self.select_output(&candidates, flags) {
            Some(output) => Ok(output),
            None => {
                debug!(%devices, %stream, "no matching output, using primary");
                Ok(self.primary_output)
            }
        }
    }

    fn get_direct_output(
        &mut self,
        device: DeviceType,
        sample_rate: u32,
        format: AudioFormat,
        channel_mask: ChannelMask,
        flags: OutputFlags,
    ) -> Result<Option<IoHandle>> {
        // A mixer-only effect pins playback to the mixed path; an offload
        // request cannot be honored until it is disabled
        let offload_ok = !self.is_non_offloadable_effect_enabled();
        if flags.contains(OutputFlags::COMPRESS_OFFLOAD) && !offload_ok {
            debug!(%device, "offload refused, non-offloadable effect enabled");
            return Ok(None);
        }

        // Among matching profiles, an offload-capable one wins
        let mut matched: Option<(ModuleHandle, ProfileHandle, bool)> = None;
        for module in &self.modules {
            let Some(module_handle) = module.handle else {
                continue;
            };
            for profile in &module.outputs {
                let rate = if sample_rate == 0 {
                    profile.default_sample_rate()
                } else {
                    sample_rate
                };
                if !profile.is_direct()
                    || !profile.is_compatible_output(
                        device,
                        "",
                        rate,
                        format,
                        channel_mask,
                        flags.without(OutputFlags::DIRECT),
                    )
                {
                    continue;
                }
                let offloads =
                    offload_ok && profile.out_flags.contains(OutputFlags::COMPRESS_OFFLOAD);
                match matched {
                    None => matched = Some((module_handle, profile.handle, offloads)),
                    Some((_, _, false)) if offloads => {
                        matched = Some((module_handle, profile.handle, true));
                    }
                    Some(_) => {}
                }
            }
        }
        let Some((module, profile, _)) = matched else {
            return Ok(None);
        };

        // Reuse an already-open direct output on the same profile
        let existing = self
            .outputs
            .iter()
            .find(|d| d.profile() == Some(profile) && d.config.format == format)
            .map(|d| d.handle);
        if let Some(handle) = existing {
            if let Some(desc) = self.outputs.get_mut(handle) {
                desc.open_count += 1;
                trace!(output = %handle, count = desc.open_count, "direct output shared");
            }
            return Ok(Some(handle));
        }

        let output = self.open_output_on_profile(
            module,
            profile,
            device,
            "",
            Some((sample_rate, format, channel_mask)),
        )?;
        // The HAL may have negotiated something other than what was asked
        let negotiated = self.outputs.get(output).map(|d| d.config);
        if let Some(config) = negotiated {
            let rate_ok = sample_rate == 0 || config.sample_rate == sample_rate;
            if !rate_ok || config.format != format {
                warn!(%output, "direct output negotiation mismatch, closing");
                self.close_output(output);
                return Ok(None);
            }
        }
        Ok(Some(output))
    }

    /// Most-specific-flags-first selection among open mixed outputs
    fn select_output(&self, candidates: &[IoHandle], flags: OutputFlags) -> Option<IoHandle> {
        let mut best: Option<(IoHandle, u32, bool)> = None;
        for handle in candidates {
            let Some(desc) = self.outputs.get(*handle) else {
                continue;
            };
            if desc.is_duplicated() {
                continue;
            }
            let score = desc.config.flags.common_bits(flags);
            let primary = desc.is_primary();
            let better = match best {
                None => true,
                Some((_, best_score, best_primary)) => {
                    score > best_score || (score == best_score && primary && !best_primary)
                }
            };
            if better {
                best = Some((*handle, score, primary));
            }
        }
        best.map(|(h, _, _)| h)
    }

    /// Client starts playing a stream on an output
    pub fn start_output(
        &mut self,
        output: IoHandle,
        stream: StreamType,
        session: Session,
    ) -> Result<()> {
        if !self.outputs.contains(output) {
            return Err(PolicyError::NotFound(format!("output {output} not found")));
        }
        debug!(%output, %stream, %session, "start output");

        let was_active = self
            .outputs
            .get(output)
            .map(|d| d.is_active(0))
            .unwrap_or(false);
        self.output_routes.start_activity(session);
        self.handle_beacon_on_start(stream, output);
        self.outputs.change_ref_count(output, stream, 1);

        if !was_active {
            if let Some(registration) = self.outputs.get(output).and_then(|d| d.policy_mix.clone())
            {
                self.client.on_dynamic_policy_mix_state_changed(
                    &registration,
                    crate::domain::hal::MixState::Mixing,
                );
            }
        }

        let devices = self.get_new_output_device(output, false);
        let wait_ms = self.set_output_device(output, devices, false, 0);

        // Apply this stream's volume on its new route
        let routed = self
            .outputs
            .get(output)
            .map(|d| d.devices)
            .unwrap_or(DeviceSet::EMPTY);
        let index = self
            .streams
            .get(stream)
            .index_for_category(crate::domain::device::DeviceCategory::for_set(routed));
        self.check_and_set_volume(stream, index, output, routed, wait_ms, false)?;

        // A sonification stream starting mid-call becomes a tone substitution
        if self.engine.phone_state().is_in_call()
            && matches!(
                strategy_for_stream(stream),
                Strategy::Sonification | Strategy::SonificationRespectful
            )
        {
            self.start_incall_substitution(stream, output);
        }
        self.update_devices_and_outputs();
        Ok(())
    }

    /// Client stops playing a stream on an output
    pub fn stop_output(
        &mut self,
        output: IoHandle,
        stream: StreamType,
        session: Session,
    ) -> Result<()> {
        let active = self
            .outputs
            .get(output)
            .ok_or_else(|| PolicyError::NotFound(format!("output {output} not found")))?
            .ref_count(stream);
        if active == 0 {
            return Err(PolicyError::InvalidState(format!(
                "stream {stream} not started on output {output}"
            )));
        }
        debug!(%output, %stream, %session, "stop output");

        if self.engine.phone_state().is_in_call()
            && matches!(
                strategy_for_stream(stream),
                Strategy::Sonification | Strategy::SonificationRespectful
            )
        {
            self.stop_incall_substitution(stream, output);
        }

        self.output_routes.stop_activity(session);
        self.handle_beacon_on_stop(stream);
        self.outputs.change_ref_count(output, stream, -1);

        let still_active = self
            .outputs
            .get(output)
            .map(|d| d.is_active(0))
            .unwrap_or(false);
        if !still_active {
            if let Some(registration) = self.outputs.get(output).and_then(|d| d.policy_mix.clone())
            {
                self.client.on_dynamic_policy_mix_state_changed(
                    &registration,
                    crate::domain::hal::MixState::Idle,
                );
            }
            let (latency, prev_devices) = self
                .outputs
                .get(output)
                .map(|d| (d.latency_ms, d.devices))
                .unwrap_or((0, DeviceSet::EMPTY));
            // Defer the route change past the tail of the stopping stream
            let delay = latency * self.tuning.mute_latency_factor;
            let devices = self.get_new_output_device(output, false);
            self.set_output_device(output, devices, false, delay);

            // Outputs sharing the released route may pick the device up now
            let others = self.outputs.routed_to_any(prev_devices);
            for other in others {
                if other != output {
                    let dev = self.get_new_output_device(other, true);
                    self.set_output_device(other, dev, false, delay);
                }
            }
        }
        self.update_devices_and_outputs();
        Ok(())
    }

    /// Client disposes its handle; direct outputs close on last release
    pub fn release_output(&mut self, output: IoHandle, session: Session) {
        debug!(%output, %session, "release output");
        self.output_routes.release_route(session);
        let close = match self.outputs.get_mut(output) {
            Some(desc) if desc.is_direct() => {
                desc.open_count = desc.open_count.saturating_sub(1);
                desc.open_count == 0
            }
            _ => false,
        };
        if close {
            self.close_output(output);
        }
    }

    /// Close an output, collapsing any duplication that references it and
    /// rescuing session effects onto the primary output.
    pub(super) fn close_output(&mut self, output: IoHandle) {
        // A duplicating output folding into this one must go first, handing
        // its play counts to the surviving side
        if let Some(dup) = self.outputs.duplicating_into(output) {
            let (counts, other) = match self.outputs.get(dup) {
                Some(desc) => {
                    let other = match desc.kind {
                        OutputKind::Duplicated { output1, output2 } => {
                            if output1 == output {
                                output2
                            } else {
                                output1
                            }
                        }
                        OutputKind::Physical { .. } => IoHandle::NONE,
                    };
                    (desc.ref_counts(), other)
                }
                None => ([0; StreamType::COUNT], IoHandle::NONE),
            };
            if let Some(surviving) = self.outputs.get_mut(other) {
                let mut merged = surviving.ref_counts();
                for (slot, extra) in merged.iter_mut().zip(counts.iter()) {
                    *slot += extra;
                }
                surviving.set_ref_counts(merged);
            }
            self.move_session_effects(dup, other);
            if let Err(e) = self.client.close_output(dup) {
                warn!(output = %dup, error = %e, "duplicating output close failed");
            }
            self.outputs.remove(dup);
            info!(output = %dup, "duplicating output closed");
        }

        self.move_session_effects(output, self.primary_output);
        if let Err(e) = self.client.close_output(output) {
            warn!(%output, error = %e, "output close failed");
        }
        self.outputs.remove(output);
        info!(%output, "output closed");
    }

    /// Has this output played anything of the strategy recently
    pub(super) fn is_strategy_active_on(
        &self,
        output: IoHandle,
        strategy: Strategy,
        in_past_ms: u32,
    ) -> bool {
        let Some(desc) = self.outputs.get(output) else {
            return false;
        };
        StreamType::ALL.iter().any(|s| {
            strategy_for_stream(*s) == strategy && desc.is_stream_active(*s, in_past_ms)
        })
    }

    /// React to a strategy's device set changing: when the outputs serving
    /// the strategy change, mute it around the move and force clients to
    /// re-fetch their routing.
    pub(super) fn check_output_for_strategy(&mut self, strategy: Strategy) {
        let old_devices = self.device_for_strategy(strategy, true);
        let new_devices = self.device_for_strategy(strategy, false);
        let src_outputs = self.outputs.supporting_any(old_devices);
        let dst_outputs = self.outputs.supporting_any(new_devices);
        if src_outputs == dst_outputs {
            return;
        }
        debug!(%strategy, %old_devices, %new_devices, "strategy output set changed");

        for output in &src_outputs {
            let delay = self
                .outputs
                .get(*output)
                .map(|d| d.latency_ms * self.tuning.mute_latency_factor)
                .unwrap_or(0);
            self.set_strategy_mute(strategy, true, *output, 0);
            self.set_strategy_mute(strategy, false, *output, delay);
        }

        // Session effects follow the strategy to its new home
        if let (Some(src), Some(dst)) = (src_outputs.first(), dst_outputs.first()) {
            self.move_session_effects(*src, *dst);
        }

        for stream in StreamType::ALL {
            if strategy_for_stream(stream) == strategy {
                self.client.invalidate_stream(stream);
            }
        }
    }

    pub(super) fn check_output_for_all_strategies(&mut self) {
        for strategy in self.engine.strategy_priority() {
            self.check_output_for_strategy(strategy);
        }
    }

    /// Device set an output should be routed to now, evaluated against the
    /// strategy priority order. A software patch pins the route.
    pub(super) fn get_new_output_device(&self, output: IoHandle, from_cache: bool) -> DeviceSet {
        let Some(desc) = self.outputs.get(output) else {
            return DeviceSet::EMPTY;
        };
        if desc.patch.is_some() {
            return desc.devices;
        }

        let in_call = self.engine.phone_state().is_in_call();
        for strategy in self.engine.strategy_priority() {
            // The phone strategy is live on the primary path whenever a call
            // is up, with or without started voice tracks
            let live = match strategy {
                Strategy::Phone if in_call && output == self.primary_output => true,
                _ => self.is_strategy_active_on(output, strategy, 0),
            };
            if live {
                return self.device_for_strategy(strategy, from_cache);
            }
        }
        DeviceSet::EMPTY
    }

    /// Route an output to a device set, orchestrating the mute transitions.
    /// Returns how long callers must defer dependent volume commands, in ms.
    pub(super) fn set_output_device(
        &mut self,
        output: IoHandle,
        devices: DeviceSet,
        force: bool,
        delay_ms: u32,
    ) -> u32 {
        let Some(desc) = self.outputs.get(output) else {
            return 0;
        };
        // Duplicated outputs route through both sides
        if let OutputKind::Duplicated { output1, output2 } = desc.kind {
            let w1 = self.set_output_device(output1, devices, force, delay_ms);
            let w2 = self.set_output_device(output2, devices, force, delay_ms);
            return w1.max(w2);
        }

        let supported = desc.supported_devices;
        let prev = desc.devices;
        let devices = devices & supported;

        let mute_wait = self.check_device_mute_strategies(output, prev, devices);

        if devices.is_empty() || (devices == prev && !force) {
            trace!(%output, %devices, force, "routing unchanged");
            return mute_wait;
        }

        if let Some(desc) = self.outputs.get_mut(output) {
            desc.devices = devices;
        }
        debug!(%output, from = %prev, to = %devices, "output rerouted");
        self.client.set_parameters(
            output,
            &format!("routing={devices}"),
            delay_ms.max(mute_wait),
        );
        self.apply_stream_volumes(output, devices, delay_ms.max(mute_wait), force);
        mute_wait
    }

    /// Mute bookkeeping around a device switch. Strategies landing on a
    /// different device than the output while it fans to several devices are
    /// muted; any active strategy on a changing route gets a transient mute
    /// so per-device curve differences never produce a level jump.
    fn check_device_mute_strategies(
        &mut self,
        output: IoHandle,
        prev: DeviceSet,
        new: DeviceSet,
    ) -> u32 {
        if prev == new {
            return 0;
        }
        let (latency, output_active) = self
            .outputs
            .get(output)
            .map(|d| (d.latency_ms, d.is_active(0)))
            .unwrap_or((0, false));
        let settle = latency * self.tuning.mute_latency_factor;
        let mut mute_wait = 0;

        for strategy in Strategy::ALL {
            let curr = self.device_for_strategy(strategy, true);
            if curr.is_empty() {
                continue;
            }
            let diverges = new.len() > 1 && curr.intersects(new) && !new.contains_all(curr & new)
                || !curr.intersects(new);
            let should_mute = output_active
                && new.len() > 1
                && diverges
                && curr.intersects(prev | new);
            let temp_mute =
                output_active && self.is_strategy_active_on(output, strategy, 0);
            let forced = self.hooks.should_force_mute(strategy, new);
            if !(should_mute || temp_mute || forced) {
                continue;
            }
            let affected = self.outputs.routed_to_any(curr);
            for o in affected {
                self.set_strategy_mute(strategy, true, o, 0);
                // Unmute rides a delayed command; nothing blocks here
                self.set_strategy_mute(strategy, false, o, settle);
            }
            mute_wait = mute_wait.max(settle);
        }
        mute_wait
    }

    fn handle_beacon_on_start(&mut self, stream: StreamType, output: IoHandle) {
        if stream == StreamType::Tts {
            self.beacon_playing_count += 1;
            if self.beacon_mute_count > 0 {
                // Beacons yield to everything else
                self.set_stream_mute(StreamType::Tts, true, output, 0);
                self.beacon_muted = true;
            }
        } else {
            self.beacon_mute_count += 1;
            if !self.beacon_muted && self.beacon_playing_count > 0 {
                for o in self.outputs.handles() {
                    self.set_stream_mute(StreamType::Tts, true, o, 0);
                }
                self.beacon_muted = true;
            }
        }
    }

    fn handle_beacon_on_stop(&mut self, stream: StreamType) {
        if stream == StreamType::Tts {
            self.beacon_playing_count = self.beacon_playing_count.saturating_sub(1);
        } else {
            self.beacon_mute_count = self.beacon_mute_count.saturating_sub(1);
            if self.beacon_muted && self.beacon_mute_count == 0 {
                for o in self.outputs.handles() {
                    self.set_stream_mute(StreamType::Tts, false, o, 0);
                }
                self.beacon_muted = false;
            }
        }
    }
}
