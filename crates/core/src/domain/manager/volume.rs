//! Volume computation and application

use super::PolicyManager;
use crate::domain::audio::{
    ForceUsage, ForcedConfig, IoHandle, PolicyError, Result, StreamType,
};
use crate::domain::device::{DeviceCategory, DeviceSet, DeviceType};
use crate::domain::engine::{strategy_for_stream, Strategy};
use crate::domain::hal::PolicyTone;
use crate::domain::volume::db_to_amplitude;
use tracing::{debug, trace, warn};

/// Devices where sonification gets ducked under concurrent music
fn headset_class() -> DeviceSet {
    DeviceSet::of(DeviceType::WiredHeadset)
        | DeviceSet::of(DeviceType::WiredHeadphone)
        | DeviceSet::of(DeviceType::AnlgDockHeadset)
        | DeviceSet::of(DeviceType::Line)
        | DeviceSet::a2dp_all()
}

/// Devices whose sink owns the volume; we always drive them at full scale
fn fixed_volume(devices: DeviceSet) -> bool {
    devices.iter().any(|d| d.has_fixed_volume())
}

impl PolicyManager {
    /// Declare the index range a stream's clients will use
    pub fn init_stream_volume(&mut self, stream: StreamType, min_index: u32, max_index: u32) {
        debug!(%stream, min_index, max_index, "stream volume range set");
        self.streams.get_mut(stream).init(min_index, max_index);
    }

    /// Set a stream's volume index for the category of `device` and apply it
    /// to every output currently routed there.
    pub fn set_stream_volume_index(
        &mut self,
        stream: StreamType,
        index: u32,
        device: DeviceType,
    ) -> Result<()> {
        let category = DeviceCategory::for_device(device);
        self.streams
            .get_mut(stream)
            .set_index(Some(category), index)?;
        debug!(%stream, index, %device, "stream volume index set");

        let handles = self.outputs.handles();
        let mut status = Ok(());
        for output in handles {
            let routed = match self.outputs.get(output) {
                Some(desc) => desc.devices,
                None => continue,
            };
            if DeviceCategory::for_set(routed) != category {
                continue;
            }
            // The SCO guard error only matters for the targeted call; bulk
            // application keeps going
            if let Err(e) = self.check_and_set_volume(stream, index, output, routed, 0, false) {
                status = Err(e);
            }
        }
        status
    }

    pub fn get_stream_volume_index(&self, stream: StreamType, device: DeviceType) -> u32 {
        self.streams.get(stream).index_for(device)
    }

    /// Curve lookup plus the sonification-under-headphones policy
    pub(super) fn compute_volume_db(
        &self,
        stream: StreamType,
        index: u32,
        devices: DeviceSet,
    ) -> f32 {
        if fixed_volume(devices) {
            return 0.0;
        }
        let category = DeviceCategory::for_set(devices);
        let mut db = self.streams.volume_db(stream, index, category);

        let strategy = strategy_for_stream(stream);
        let duckable = matches!(
            strategy,
            Strategy::Sonification | Strategy::SonificationRespectful
        ) || stream == StreamType::System
            || (stream == StreamType::EnforcedAudible
                && self.engine.force_use(ForceUsage::System) != ForcedConfig::SystemEnforced);

        if duckable && devices.intersects(headset_class()) {
            db += self.tuning.sonification_headset_volume_factor_db;

            // While music plays (or just played), never ring louder than it
            if stream != StreamType::Music && self.media_recently_active() {
                let music_index = self
                    .streams
                    .get(StreamType::Music)
                    .index_for_category(category);
                let music_db = self.compute_volume_db(StreamType::Music, music_index, devices);
                let floor = self.tuning.sonification_headset_volume_min_db;
                let ceiling = if music_db > floor { music_db } else { floor };
                if db > ceiling {
                    trace!(%stream, db, ceiling, "sonification clamped under music");
                    db = ceiling;
                }
            }
        }
        db
    }

    /// Apply one stream's volume on one output unless the stream is muted
    /// there. Voice and SCO volumes ride along on the primary output.
    pub(super) fn check_and_set_volume(
        &mut self,
        stream: StreamType,
        index: u32,
        output: IoHandle,
        devices: DeviceSet,
        delay_ms: u32,
        force: bool,
    ) -> Result<()> {
        let Some(desc) = self.outputs.get(output) else {
            return Err(PolicyError::NotFound(format!("output {output} not found")));
        };
        if desc.mute_count(stream) != 0 {
            trace!(%stream, %output, "stream muted, volume deferred");
            return Ok(());
        }

        // The modem owns voice level while a SCO link carries the call, and
        // the SCO stream's level only applies while that link is the route
        if output == self.primary_output {
            let sco_forced =
                self.engine.force_use(ForceUsage::Communication) == ForcedConfig::BtSco;
            if stream == StreamType::VoiceCall && sco_forced {
                return Err(PolicyError::InvalidState(
                    "voice volume is fixed while routed to SCO".to_string(),
                ));
            }
            if stream == StreamType::BluetoothSco && !sco_forced {
                return Err(PolicyError::InvalidState(
                    "SCO volume applies only while SCO carries the call".to_string(),
                ));
            }
        }

        let devices = if devices.is_empty() {
            desc.devices
        } else {
            devices
        };
        let db = self.compute_volume_db(stream, index, devices);

        let apply = force
            || (self.outputs.get(output).map(|d| d.current_volume_db(stream)) != Some(db));
        if apply {
            if let Some(desc) = self.outputs.get_mut(output) {
                desc.set_current_volume_db(stream, db);
            }
            self.client
                .set_stream_volume(stream, db_to_amplitude(db), output, delay_ms)?;
        }

        if (stream == StreamType::VoiceCall || stream == StreamType::BluetoothSco)
            && output == self.primary_output
        {
            let voice = if stream == StreamType::VoiceCall {
                let d = self.streams.get(stream);
                if d.max_index == 0 {
                    1.0
                } else {
                    index as f32 / d.max_index as f32
                }
            } else {
                1.0
            };
            if (voice - self.last_voice_volume).abs() > f32::EPSILON
                && self.engine.phone_state().is_in_call()
            {
                self.client.set_voice_volume(voice, delay_ms)?;
                self.last_voice_volume = voice;
            }
        }
        Ok(())
    }

    /// Re-apply every stream's volume on an output, after a route change
    pub(super) fn apply_stream_volumes(
        &mut self,
        output: IoHandle,
        devices: DeviceSet,
        delay_ms: u32,
        force: bool,
    ) {
        let category = DeviceCategory::for_set(devices);
        for stream in StreamType::ALL {
            let index = self.streams.get(stream).index_for_category(category);
            if let Err(e) = self.check_and_set_volume(stream, index, output, devices, delay_ms, force)
            {
                trace!(%stream, %output, error = %e, "volume skipped");
            }
        }
    }

    /// Reference-counted mute; only the edges touch the HAL
    pub(super) fn set_stream_mute(
        &mut self,
        stream: StreamType,
        mute: bool,
        output: IoHandle,
        delay_ms: u32,
    ) {
        let can_be_muted = self.streams.get(stream).can_be_muted
            && !(stream == StreamType::EnforcedAudible
                && self.engine.force_use(ForceUsage::System) == ForcedConfig::SystemEnforced);

        if mute {
            let count = match self.outputs.get_mut(output) {
                Some(desc) => desc.increment_mute(stream),
                None => return,
            };
            if count == 1 && can_be_muted {
                if let Some(desc) = self.outputs.get_mut(output) {
                    desc.set_current_volume_db(stream, f32::NEG_INFINITY);
                }
                if let Err(e) = self.client.set_stream_volume(stream, 0.0, output, delay_ms) {
                    warn!(%stream, %output, error = %e, "mute failed");
                }
            }
        } else {
            let count = match self.outputs.get_mut(output) {
                Some(desc) => desc.decrement_mute(stream),
                None => return,
            };
            if count == 0 {
                let (devices, index) = {
                    let Some(desc) = self.outputs.get(output) else {
                        return;
                    };
                    let category = DeviceCategory::for_set(desc.devices);
                    (
                        desc.devices,
                        self.streams.get(stream).index_for_category(category),
                    )
                };
                if let Err(e) =
                    self.check_and_set_volume(stream, index, output, devices, delay_ms, true)
                {
                    trace!(%stream, %output, error = %e, "unmute volume skipped");
                }
            }
        }
    }

    pub(super) fn set_strategy_mute(
        &mut self,
        strategy: Strategy,
        mute: bool,
        output: IoHandle,
        delay_ms: u32,
    ) {
        for stream in StreamType::ALL {
            if strategy_for_stream(stream) == strategy {
                self.set_stream_mute(stream, mute, output, delay_ms);
            }
        }
    }

    /// Call-state transition side of in-call sonification: every active
    /// sonification instance is muted (entering) or unmuted (leaving), once
    /// per reference, and an active ringtone becomes the in-call tone.
    pub(super) fn handle_incall_sonification(&mut self, entering: bool) {
        let handles = self.outputs.handles();
        for stream in [StreamType::Ring, StreamType::Alarm] {
            for output in &handles {
                let refs = self
                    .outputs
                    .get(*output)
                    .map(|d| d.ref_count(stream))
                    .unwrap_or(0);
                for _ in 0..refs {
                    self.set_stream_mute(stream, entering, *output, 0);
                }
                if stream == StreamType::Ring && refs > 0 {
                    if entering && !self.incall_tone_active {
                        self.client.start_tone(PolicyTone::InCallNotification, stream);
                        self.incall_tone_active = true;
                    } else if !entering && self.incall_tone_active {
                        self.client.stop_tone();
                        self.incall_tone_active = false;
                    }
                }
            }
        }
    }

    /// A sonification stream starting while a call is already up
    pub(super) fn start_incall_substitution(&mut self, stream: StreamType, output: IoHandle) {
        self.set_stream_mute(stream, true, output, 0);
        if stream == StreamType::Ring && !self.incall_tone_active {
            self.client.start_tone(PolicyTone::InCallNotification, stream);
            self.incall_tone_active = true;
        }
    }

    pub(super) fn stop_incall_substitution(&mut self, stream: StreamType, output: IoHandle) {
        self.set_stream_mute(stream, false, output, 0);
        if stream == StreamType::Ring && self.incall_tone_active {
            self.client.stop_tone();
            self.incall_tone_active = false;
        }
    }
}
