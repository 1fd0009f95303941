//! Volume curves and per-stream volume state
//!
//! Each (stream, device category) pair has a four-point attenuation curve in
//! dB over a normalized 0..100 index scale. The manager turns user indices
//! into dB here, applies policy adjustments (headset sonification ducking),
//! and hands the HAL a linear amplitude.

use crate::domain::audio::{PolicyError, Result, StreamType};
use crate::domain::device::{DeviceCategory, DeviceType};
use serde::{Deserialize, Serialize};

/// One knot of a volume curve: normalized index 0..100 to attenuation in dB
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeCurvePoint {
    pub index: u32,
    pub db: f32,
}

const fn pt(index: u32, db: f32) -> VolumeCurvePoint {
    VolumeCurvePoint { index, db }
}

type Curve = [VolumeCurvePoint; 4];

const CURVE_DEFAULT: Curve = [
    pt(1, -49.5),
    pt(33, -33.5),
    pt(66, -17.0),
    pt(100, 0.0),
];

const CURVE_MEDIA: Curve = [pt(1, -58.0), pt(20, -40.0), pt(60, -17.0), pt(100, 0.0)];

const CURVE_EXT_MEDIA: Curve = [pt(1, -58.0), pt(20, -40.0), pt(60, -21.0), pt(100, -10.0)];

const CURVE_SPEAKER_SONIFICATION: Curve = [
    pt(1, -29.7),
    pt(33, -20.1),
    pt(66, -10.2),
    pt(100, 0.0),
];

const CURVE_HEADSET_SYSTEM: Curve = [
    pt(1, -30.0),
    pt(33, -26.0),
    pt(66, -22.0),
    pt(100, -20.0),
];

const CURVE_SPEAKER_SYSTEM: Curve = [pt(1, -24.0), pt(33, -18.0), pt(66, -12.0), pt(100, -6.0)];

const CURVE_VOICE: Curve = [pt(0, -42.0), pt(33, -28.0), pt(66, -14.0), pt(100, 0.0)];

/// Attenuation curve for a stream on a device category
pub fn curve_for(stream: StreamType, category: DeviceCategory) -> &'static Curve {
    use DeviceCategory::*;
    use StreamType::*;
    match (stream, category) {
        (VoiceCall | BluetoothSco, _) => &CURVE_VOICE,
        (Music | Accessibility | Rerouting | Tts, Speaker) => &CURVE_MEDIA,
        (Music | Accessibility | Rerouting | Tts, ExtMedia) => &CURVE_EXT_MEDIA,
        (Music | Accessibility | Rerouting | Tts, _) => &CURVE_DEFAULT,
        (System | Dtmf, Speaker) => &CURVE_SPEAKER_SYSTEM,
        (System | Dtmf, _) => &CURVE_HEADSET_SYSTEM,
        (Ring | Alarm | Notification | EnforcedAudible, Speaker) => &CURVE_SPEAKER_SONIFICATION,
        (Ring | Alarm | Notification | EnforcedAudible, _) => &CURVE_DEFAULT,
    }
}

/// Piecewise-linear interpolation over a curve, on the normalized scale
fn interpolate(curve: &Curve, normalized: u32) -> f32 {
    if normalized < curve[0].index {
        return f32::NEG_INFINITY;
    }
    for window in curve.windows(2) {
        let (lo, hi) = (window[0], window[1]);
        if normalized <= hi.index {
            let span = (hi.index - lo.index) as f32;
            let frac = (normalized - lo.index) as f32 / span;
            return lo.db + frac * (hi.db - lo.db);
        }
    }
    curve[3].db
}

/// dB attenuation to linear amplitude for the HAL
pub fn db_to_amplitude(db: f32) -> f32 {
    if db == f32::NEG_INFINITY {
        return 0.0;
    }
    10.0_f32.powf(db / 20.0)
}

/// Volume state of one stream type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub min_index: u32,
    pub max_index: u32,
    indices: [u32; DeviceCategory::COUNT],
    pub can_be_muted: bool,
}

impl Default for StreamDescriptor {
    fn default() -> Self {
        Self {
            min_index: 0,
            max_index: 1,
            indices: [0; DeviceCategory::COUNT],
            can_be_muted: true,
        }
    }
}

impl StreamDescriptor {
    pub fn init(&mut self, min_index: u32, max_index: u32) {
        self.min_index = min_index;
        self.max_index = max_index;
        for slot in &mut self.indices {
            *slot = (*slot).clamp(min_index, max_index);
        }
    }

    pub fn index_for(&self, device: DeviceType) -> u32 {
        self.indices[DeviceCategory::for_device(device).index()]
    }

    pub fn index_for_category(&self, category: DeviceCategory) -> u32 {
        self.indices[category.index()]
    }

    /// Set the index for one category, or for all when `category` is None
    pub fn set_index(&mut self, category: Option<DeviceCategory>, index: u32) -> Result<()> {
        if index < self.min_index || index > self.max_index {
            return Err(PolicyError::InvalidArgument(format!(
                "volume index {index} outside [{}, {}]",
                self.min_index, self.max_index
            )));
        }
        match category {
            Some(category) => self.indices[category.index()] = index,
            None => self.indices = [index; DeviceCategory::COUNT],
        }
        Ok(())
    }

    /// Normalize a raw index to the curve's 0..100 scale
    pub fn normalize(&self, index: u32) -> u32 {
        if self.max_index <= self.min_index {
            return 0;
        }
        let index = index.clamp(self.min_index, self.max_index);
        (index - self.min_index) * 100 / (self.max_index - self.min_index)
    }
}

/// All stream volume state, indexed by stream type
#[derive(Debug, Clone, Default)]
pub struct StreamVolumes {
    streams: [StreamDescriptor; StreamType::COUNT],
}

impl StreamVolumes {
    pub fn get(&self, stream: StreamType) -> &StreamDescriptor {
        &self.streams[stream.index()]
    }

    pub fn get_mut(&mut self, stream: StreamType) -> &mut StreamDescriptor {
        &mut self.streams[stream.index()]
    }

    /// Curve lookup plus normalization; the policy layers on top live in the
    /// manager because they need activity state.
    pub fn volume_db(&self, stream: StreamType, index: u32, category: DeviceCategory) -> f32 {
        let descriptor = self.get(stream);
        if index <= descriptor.min_index && descriptor.min_index == 0 {
            return f32::NEG_INFINITY;
        }
        interpolate(curve_for(stream, category), descriptor.normalize(index))
    }
}

/// Tunable policy constants, overridable from the topology file
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyTuning {
    /// Attenuation applied to sonification streams on headset-class devices
    pub sonification_headset_volume_factor_db: f32,
    /// Floor for the music-volume clamp applied to ducked sonification
    pub sonification_headset_volume_min_db: f32,
    /// How recently music must have played for the clamp to apply, in ms
    pub sonification_headset_music_delay_ms: u32,
    /// Mute settle delays are this multiple of the worst affected latency
    pub mute_latency_factor: u32,
}

impl Default for PolicyTuning {
    fn default() -> Self {
        Self {
            sonification_headset_volume_factor_db: -6.02,
            sonification_headset_volume_min_db: -36.0,
            sonification_headset_music_delay_ms: 5000,
            mute_latency_factor: 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_curve_endpoints() {
        let mut volumes = StreamVolumes::default();
        volumes.get_mut(StreamType::Music).init(0, 100);

        // Index zero is silence when the scale starts at zero
        assert_eq!(
            volumes.volume_db(StreamType::Music, 0, DeviceCategory::Speaker),
            f32::NEG_INFINITY
        );
        // Full scale hits the top knot exactly
        let top = volumes.volume_db(StreamType::Music, 100, DeviceCategory::Speaker);
        assert!((top - 0.0).abs() < 1e-3);
        let top_ext = volumes.volume_db(StreamType::Music, 100, DeviceCategory::ExtMedia);
        assert!((top_ext + 10.0).abs() < 1e-3);
    }

    #[test]
    fn test_index_scale_normalization() {
        let mut descriptor = StreamDescriptor::default();
        descriptor.init(1, 15);
        assert_eq!(descriptor.normalize(1), 0);
        assert_eq!(descriptor.normalize(15), 100);
        assert_eq!(descriptor.normalize(8), 50);
    }

    #[test]
    fn test_set_index_bounds() {
        let mut descriptor = StreamDescriptor::default();
        descriptor.init(0, 7);
        assert!(descriptor.set_index(None, 8).is_err());
        assert!(descriptor.set_index(None, 7).is_ok());
        assert_eq!(descriptor.index_for(DeviceType::Speaker), 7);

        descriptor
            .set_index(Some(DeviceCategory::Headset), 3)
            .unwrap();
        assert_eq!(descriptor.index_for(DeviceType::WiredHeadset), 3);
        assert_eq!(descriptor.index_for(DeviceType::Speaker), 7);
    }

    #[test]
    fn test_amplitude_conversion() {
        assert_eq!(db_to_amplitude(f32::NEG_INFINITY), 0.0);
        assert!((db_to_amplitude(0.0) - 1.0).abs() < 1e-6);
        assert!((db_to_amplitude(-20.0) - 0.1).abs() < 1e-6);
    }

    proptest! {
        // Raising the index never lowers the computed volume
        #[test]
        fn prop_volume_monotonic(lo in 0u32..100, hi in 0u32..100) {
            let (lo, hi) = (lo.min(hi), lo.max(hi));
            let mut volumes = StreamVolumes::default();
            volumes.get_mut(StreamType::Music).init(0, 100);
            for category in DeviceCategory::ALL {
                let a = volumes.volume_db(StreamType::Music, lo, category);
                let b = volumes.volume_db(StreamType::Music, hi, category);
                prop_assert!(a <= b || (a - b).abs() < 1e-4);
            }
        }
    }
}
