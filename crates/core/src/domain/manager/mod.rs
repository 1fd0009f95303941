//! The policy manager: single owner of all routing and volume state
//!
//! One instance coordinates the device registry, opened endpoints, strategy
//! resolution, volume application and patch bookkeeping. It is single-writer:
//! callers serialize on it, and every hardware side effect goes through the
//! [`HalClient`] it was built with. Settle delays are never waited on here;
//! they are forwarded to the HAL as command delays.

mod devices;
mod effects;
mod inputs;
mod mixes;
mod outputs;
mod patches;
mod volume;

pub use effects::EffectDescriptor;

use crate::domain::audio::{
    ForceUsage, ForcedConfig, InputSource, IoHandle, PhoneState, PolicyError, Result, Session,
    StreamType,
};
use crate::domain::config::TopologyConfig;
use crate::domain::descriptor::{InputCollection, OutputCollection};
use crate::domain::device::{DeviceSet, DeviceType, DeviceVector};
use crate::domain::engine::{strategy_for_stream, PolicyEngine, Strategy, VendorPolicyHooks};
use crate::domain::hal::HalClient;
use crate::domain::mix::MixRegistry;
use crate::domain::patch::PatchCollection;
use crate::domain::profile::HwModule;
use crate::domain::session::{RouteKind, SessionRouteMap};
use crate::domain::volume::{PolicyTuning, StreamVolumes};
use effects::EffectRegistry;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Activity window for "was playing recently" remote queries, in ms
const REMOTE_ACTIVITY_WINDOW_MS: u32 = 0;

pub struct PolicyManager {
    pub(super) client: Arc<dyn HalClient>,
    pub(super) hooks: Arc<dyn VendorPolicyHooks>,
    pub(super) tuning: PolicyTuning,
    pub(super) modules: Vec<HwModule>,
    pub(super) available_output_devices: DeviceVector,
    pub(super) available_input_devices: DeviceVector,
    pub(super) default_output_device: DeviceType,
    pub(super) outputs: OutputCollection,
    pub(super) inputs: InputCollection,
    pub(super) streams: StreamVolumes,
    pub(super) engine: PolicyEngine,
    pub(super) patches: PatchCollection,
    pub(super) mixes: MixRegistry,
    pub(super) output_routes: SessionRouteMap,
    pub(super) input_routes: SessionRouteMap,
    effects: EffectRegistry,
    pub(super) primary_output: IoHandle,
    pub(super) a2dp_suspended: bool,
    /// Sessions handed to the sound trigger service, mapped to their input
    pub(super) sound_trigger_sessions: BTreeMap<Session, IoHandle>,
    pub(super) last_voice_volume: f32,
    /// Ring stream substituted by the in-call notification tone right now
    pub(super) incall_tone_active: bool,
    /// Active beacon (transmitted-through-speaker) playback count
    pub(super) beacon_playing_count: u32,
    /// Playback count of everything that mutes beacons
    pub(super) beacon_mute_count: u32,
    pub(super) beacon_muted: bool,
}

impl PolicyManager {
    /// Build the manager from a topology: load modules, register attached
    /// devices and open the boot-time outputs. Fails when no primary output
    /// can be opened, since all default routing hangs off it.
    pub fn new(
        config: &TopologyConfig,
        client: Arc<dyn HalClient>,
        hooks: Arc<dyn VendorPolicyHooks>,
    ) -> Result<Self> {
        let mut modules = config
            .build_modules()
            .map_err(|e| PolicyError::InvalidArgument(e.to_string()))?;
        let attached = config
            .build_attached_devices(&modules)
            .map_err(|e| PolicyError::InvalidArgument(e.to_string()))?;
        let default_output_device = config
            .default_output_device()
            .map_err(|e| PolicyError::InvalidArgument(e.to_string()))?;

        for module in &mut modules {
            match client.load_hw_module(&module.name) {
                Ok(handle) => {
                    debug!(module = %module.name, %handle, "hw module loaded");
                    module.handle = Some(handle);
                }
                Err(e) => {
                    warn!(module = %module.name, error = %e, "hw module failed to load");
                }
            }
        }

        let mut manager = Self {
            client,
            hooks,
            tuning: config.tuning,
            modules,
            available_output_devices: DeviceVector::new(),
            available_input_devices: DeviceVector::new(),
            default_output_device,
            outputs: OutputCollection::new(),
            inputs: InputCollection::new(),
            streams: StreamVolumes::default(),
            engine: PolicyEngine::new(),
            patches: PatchCollection::new(),
            mixes: MixRegistry::new(),
            output_routes: SessionRouteMap::new(),
            input_routes: SessionRouteMap::new(),
            effects: EffectRegistry::new(),
            primary_output: IoHandle::NONE,
            a2dp_suspended: false,
            sound_trigger_sessions: BTreeMap::new(),
            last_voice_volume: -1.0,
            incall_tone_active: false,
            beacon_playing_count: 0,
            beacon_mute_count: 0,
            beacon_muted: false,
        };

        for descriptor in attached.iter() {
            if descriptor.device_type.is_output() {
                manager
                    .available_output_devices
                    .add(descriptor.clone())
                    .ok();
            } else {
                manager.available_input_devices.add(descriptor.clone()).ok();
            }
        }
        manager.attach_available_devices_to_modules();
        // A device declared attached but whose module failed to load cannot
        // be routed to; it must not linger in the registries
        manager.available_output_devices.prune_unattached();
        manager.available_input_devices.prune_unattached();
        manager.init_default_stream_volumes();
        manager.open_boot_outputs()?;

        if manager.primary_output.is_none() {
            return Err(PolicyError::InvalidState(
                "no primary output could be opened".to_string(),
            ));
        }

        manager.update_devices_and_outputs();
        let handles = manager.outputs.handles();
        for output in handles {
            let devices = manager.get_new_output_device(output, true);
            manager.set_output_device(output, devices, true, 0);
        }
        info!(
            outputs = manager.outputs.len(),
            modules = manager.modules.len(),
            "policy manager initialized"
        );
        Ok(manager)
    }

    /// Open one output per non-direct profile reaching an attached device
    fn open_boot_outputs(&mut self) -> Result<()> {
        let attached = self.available_output_devices.types();
        let mut plan = Vec::new();
        for module in &self.modules {
            let Some(module_handle) = module.handle else {
                continue;
            };
            for profile in &module.outputs {
                if profile.is_direct() {
                    continue;
                }
                let reachable = profile.devices & attached;
                if reachable.is_empty() {
                    continue;
                }
                let device = if reachable.contains(self.default_output_device) {
                    self.default_output_device
                } else {
                    // Sets from profiles are never empty here
                    reachable.primary().unwrap()
                };
                plan.push((module_handle, profile.handle, device));
            }
        }
        for (module, profile, device) in plan {
            match self.open_output_on_profile(module, profile, device, "", None) {
                Ok(output) => {
                    if self.primary_output.is_none() {
                        if let Some(desc) = self.outputs.get(output) {
                            if desc.is_primary() {
                                self.primary_output = output;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(%profile, %device, error = %e, "boot output failed to open");
                }
            }
        }
        Ok(())
    }

    /// Record which module owns each attached device
    fn attach_available_devices_to_modules(&mut self) {
        for module in &self.modules {
            let Some(handle) = module.handle else {
                continue;
            };
            let outputs = module.supported_output_devices();
            let inputs = module.supported_input_devices();
            for descriptor in self.available_output_devices.iter_mut() {
                if descriptor.module.is_none() && outputs.contains(descriptor.device_type) {
                    descriptor.module = Some(handle);
                    descriptor.port_id =
                        Some(crate::domain::audio::PortId::new(self.client.new_unique_id()));
                }
            }
            for descriptor in self.available_input_devices.iter_mut() {
                if descriptor.module.is_none() && inputs.contains(descriptor.device_type) {
                    descriptor.module = Some(handle);
                    descriptor.port_id =
                        Some(crate::domain::audio::PortId::new(self.client.new_unique_id()));
                }
            }
        }
    }

    /// Platform default index ranges per stream
    fn init_default_stream_volumes(&mut self) {
        let ranges: [(StreamType, u32, u32, u32); StreamType::COUNT] = [
            (StreamType::VoiceCall, 1, 5, 4),
            (StreamType::System, 0, 7, 5),
            (StreamType::Ring, 0, 7, 5),
            (StreamType::Music, 0, 15, 10),
            (StreamType::Alarm, 0, 7, 6),
            (StreamType::Notification, 0, 7, 5),
            (StreamType::BluetoothSco, 0, 15, 7),
            (StreamType::EnforcedAudible, 0, 7, 7),
            (StreamType::Dtmf, 0, 15, 11),
            (StreamType::Tts, 0, 15, 15),
            (StreamType::Accessibility, 0, 15, 10),
            (StreamType::Rerouting, 0, 15, 15),
        ];
        for (stream, min, max, default) in ranges {
            let descriptor = self.streams.get_mut(stream);
            descriptor.init(min, max);
            descriptor.set_index(None, default).ok();
        }
        self.streams.get_mut(StreamType::EnforcedAudible).can_be_muted = false;
    }

    pub fn primary_output(&self) -> IoHandle {
        self.primary_output
    }

    pub fn phone_state(&self) -> PhoneState {
        self.engine.phone_state()
    }

    pub fn force_use(&self, usage: ForceUsage) -> ForcedConfig {
        self.engine.force_use(usage)
    }

    /// Available output devices as a set
    pub(super) fn available_output_set(&self) -> DeviceSet {
        self.available_output_devices.types()
    }

    pub(super) fn available_input_set(&self) -> DeviceSet {
        self.available_input_devices.types()
    }

    /// Music played recently enough to drive respectful sonification
    pub(super) fn media_recently_active(&self) -> bool {
        self.outputs.is_stream_active(
            StreamType::Music,
            self.tuning.sonification_headset_music_delay_ms,
        )
    }

    /// Refresh the engine's per-strategy device snapshot
    pub(super) fn update_devices_and_outputs(&mut self) {
        let available = self.available_output_set();
        let media_active = self.media_recently_active();
        self.engine.update_device_cache(available, media_active);
    }

    /// Resolved device set for one strategy, session routes winning
    pub(super) fn device_for_strategy(&self, strategy: Strategy, from_cache: bool) -> DeviceSet {
        let available = self.available_output_set();
        for stream in StreamType::ALL {
            if strategy_for_stream(stream) != strategy {
                continue;
            }
            if let Some(device) = self.output_routes.active_device_for_stream(stream, available) {
                return DeviceSet::of(device);
            }
        }
        let proposed = if from_cache {
            self.engine.cached_device_for_strategy(strategy)
        } else {
            self.engine
                .compute_device_for_strategy(strategy, available, self.media_recently_active())
        };
        self.hooks
            .adjust_device_for_strategy(strategy, proposed, available)
    }

    pub fn devices_for_stream(&self, stream: StreamType) -> DeviceSet {
        self.device_for_strategy(strategy_for_stream(stream), true)
    }

    pub fn strategy_for_stream(&self, stream: StreamType) -> Strategy {
        strategy_for_stream(stream)
    }

    /// Telephony state transition; reroutes the primary output and drives
    /// in-call sonification.
    pub fn set_phone_state(&mut self, state: PhoneState) -> Result<()> {
        let old_state = self.engine.phone_state();
        if state == old_state {
            warn!(?state, "phone state unchanged");
            return Ok(());
        }
        info!(?old_state, ?state, "phone state changing");

        // Leaving a call: unmute sonification before the route moves back
        if old_state.is_in_call() && !state.is_in_call() {
            self.handle_incall_sonification(false);
        }

        // The engine cache still holds the previous resolution here, so the
        // strategy checks can compare old against new
        self.engine.set_phone_state(state);
        self.check_output_for_all_strategies();
        self.update_devices_and_outputs();

        // Force the routing command even when the device set is unchanged so
        // the HAL sees the call mode transition on the primary path
        let new_device = self.get_new_output_device(self.primary_output, false);
        let delay = if state.is_in_call() {
            self.outputs
                .get(self.primary_output)
                .map(|d| d.latency_ms * self.tuning.mute_latency_factor)
                .unwrap_or(0)
        } else {
            0
        };
        self.set_output_device(self.primary_output, new_device, true, delay);

        // Entering a call: substitute or mute sonification already playing
        if !old_state.is_in_call() && state.is_in_call() {
            self.handle_incall_sonification(true);
        }

        let handles = self.outputs.handles();
        for output in handles {
            if output == self.primary_output {
                continue;
            }
            let devices = self.get_new_output_device(output, true);
            self.set_output_device(output, devices, false, 0);
        }
        Ok(())
    }

    /// Forced-use override; revalidates routing for outputs and inputs
    pub fn set_force_use(&mut self, usage: ForceUsage, config: ForcedConfig) -> Result<()> {
        self.engine.set_force_use(usage, config)?;
        self.check_a2dp_suspend();
        self.check_output_for_all_strategies();
        self.update_devices_and_outputs();

        let handles = self.outputs.handles();
        for output in handles {
            let devices = self.get_new_output_device(output, true);
            let force = output == self.primary_output && self.engine.phone_state().is_in_call();
            self.set_output_device(output, devices, force, 0);
        }

        if let Some(input) = self.inputs.active_input() {
            if let Some(device) = self.get_new_input_device(input) {
                self.set_input_device(input, device);
            }
        }
        Ok(())
    }

    pub fn is_stream_active(&self, stream: StreamType, in_past_ms: u32) -> bool {
        self.outputs.is_stream_active(stream, in_past_ms)
    }

    /// Active on a remote-submix routed output only
    pub fn is_stream_active_remotely(&self, stream: StreamType, in_past_ms: u32) -> bool {
        self.outputs.is_stream_active_on(
            stream,
            DeviceSet::of(DeviceType::RemoteSubmix),
            in_past_ms.max(REMOTE_ACTIVITY_WINDOW_MS),
        )
    }

    pub fn is_source_active(&self, source: InputSource) -> bool {
        self.inputs.is_source_active(source)
    }

    /// Hand a capture session and its input to the sound trigger service
    pub fn acquire_sound_trigger_session(&mut self) -> Result<(Session, IoHandle)> {
        let session = Session::new(self.client.new_unique_id());
        let input = self.inputs.active_input().unwrap_or(IoHandle::NONE);
        self.sound_trigger_sessions.insert(session, input);
        debug!(%session, %input, "sound trigger session acquired");
        Ok((session, input))
    }

    pub fn release_sound_trigger_session(&mut self, session: Session) -> Result<()> {
        self.sound_trigger_sessions
            .remove(&session)
            .map(|_| ())
            .ok_or_else(|| {
                PolicyError::NotFound(format!("sound trigger session {session} not found"))
            })
    }

    /// Pin a session's playback or capture to one device. The route wins
    /// over strategy resolution while the session is active; it is released
    /// with the session's output or input handle.
    pub fn set_session_route(
        &mut self,
        session: Session,
        kind: RouteKind,
        device: DeviceType,
        uid: crate::domain::audio::Uid,
    ) -> Result<()> {
        match kind {
            RouteKind::Output(stream) => {
                if !device.is_output() {
                    return Err(PolicyError::InvalidArgument(format!(
                        "device {device} cannot carry playback"
                    )));
                }
                self.output_routes.set_route(session, kind, device, uid);
                self.client.invalidate_stream(stream);
            }
            RouteKind::Input(_) => {
                if !device.is_input() {
                    return Err(PolicyError::InvalidArgument(format!(
                        "device {device} cannot carry capture"
                    )));
                }
                self.input_routes.set_route(session, kind, device, uid);
                if let Some(input) = self.inputs.for_session(session) {
                    if let Some(new_device) = self.get_new_input_device(input) {
                        self.set_input_device(input, new_device);
                    }
                }
            }
        }
        Ok(())
    }

    /// Tear down everything a uid owns: patches and session routes
    pub fn release_resources_for_uid(&mut self, uid: crate::domain::audio::Uid) {
        let owned = self.patches.owned_by(uid);
        for handle in owned {
            if let Err(e) = self.release_audio_patch(handle, uid) {
                warn!(%handle, error = %e, "patch release on uid teardown failed");
            }
        }
        let outputs = self.output_routes.remove_for_uid(uid);
        let inputs = self.input_routes.remove_for_uid(uid);
        if outputs + inputs > 0 {
            debug!(uid = uid.0, outputs, inputs, "session routes dropped for uid");
        }
    }

    /// Diagnostic snapshot of every collection and policy knob
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "PolicyManager");
        let _ = writeln!(out, "  phone state: {:?}", self.engine.phone_state());
        for usage in ForceUsage::ALL {
            let _ = writeln!(
                out,
                "  force[{usage:?}]: {:?}",
                self.engine.force_use(usage)
            );
        }
        let _ = writeln!(out, "  primary output: {}", self.primary_output);
        let _ = writeln!(out, "  a2dp suspended: {}", self.a2dp_suspended);
        let _ = writeln!(
            out,
            "  available outputs: {}",
            self.available_output_set()
        );
        let _ = writeln!(out, "  available inputs: {}", self.available_input_set());

        let _ = writeln!(out, "  outputs ({}):", self.outputs.len());
        for desc in self.outputs.iter() {
            let _ = writeln!(
                out,
                "    {}: devices={} latency={}ms flags={:?} dup={} mix={:?}",
                desc.handle,
                desc.devices,
                desc.latency_ms,
                desc.config.flags,
                desc.is_duplicated(),
                desc.policy_mix,
            );
            for stream in StreamType::ALL {
                let refs = desc.ref_count(stream);
                let mutes = desc.mute_count(stream);
                if refs > 0 || mutes > 0 {
                    let _ = writeln!(out, "      {stream}: refs={refs} mutes={mutes}");
                }
            }
        }

        let _ = writeln!(out, "  inputs ({}):", self.inputs.len());
        for desc in self.inputs.iter() {
            let _ = writeln!(
                out,
                "    {}: device={} source={:?} active={} sessions={}",
                desc.handle,
                desc.device,
                desc.source,
                desc.active,
                desc.sessions.len()
            );
        }

        let _ = writeln!(out, "  patches ({}):", self.patches.len());
        for patch in self.patches.iter() {
            let _ = writeln!(
                out,
                "    {}: uid={} hal={:?}",
                patch.handle, patch.owner.0, patch.hal_handle
            );
        }

        let _ = writeln!(
            out,
            "  effects ({} bytes claimed):",
            self.effects.total_memory()
        );
        for fx in self.effects.iter() {
            let _ = writeln!(
                out,
                "    {}: {} io={} session={} enabled={} offloadable={}",
                fx.id, fx.name, fx.io, fx.session, fx.enabled, fx.offloadable
            );
        }

        let _ = writeln!(out, "  policy mixes ({}):", self.mixes.len());
        for mix in self.mixes.iter() {
            let _ = writeln!(
                out,
                "    {}: type={:?} output={:?}",
                mix.registration, mix.mix_type, mix.output
            );
        }

        let _ = writeln!(out, "  session routes:");
        for route in self.output_routes.iter().chain(self.input_routes.iter()) {
            let _ = writeln!(
                out,
                "    {}: {:?} -> {}",
                route.session, route.kind, route.device
            );
        }
        out
    }
}
