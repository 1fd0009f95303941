//! Dynamic policy mixes
//!
//! A registered mix reroutes matching playback into a capturable submix
//! (players type) or injects a stream into matching recorders (recorders
//! type). Mixes are keyed by their registration id, which doubles as the
//! address of the backing remote-submix device.

use crate::domain::audio::{
    AudioAttributes, AudioFormat, ChannelMask, InputSource, IoHandle, PolicyError, Result, Usage,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Direction of a policy mix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MixType {
    /// Capture the output of matching players
    Players,
    /// Inject audio into matching recorders
    Recorders,
}

/// One attribute-matching rule of a mix
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MixRule {
    MatchUsage(Usage),
    ExcludeUsage(Usage),
    MatchSource(InputSource),
    ExcludeSource(InputSource),
}

/// Stream format a mix captures or injects at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MixFormat {
    pub sample_rate: u32,
    pub format: AudioFormat,
    pub channel_mask: ChannelMask,
}

impl Default for MixFormat {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            format: AudioFormat::Pcm16,
            channel_mask: ChannelMask::OutStereo,
        }
    }
}

/// A registered policy mix
#[derive(Debug, Clone)]
pub struct AudioPolicyMix {
    /// Registration id; also the address of the backing submix device
    pub registration: String,
    pub mix_type: MixType,
    pub format: MixFormat,
    pub rules: Vec<MixRule>,
    /// Output opened on the submix device for this mix, once known
    pub output: Option<IoHandle>,
}

impl AudioPolicyMix {
    pub fn new(registration: impl Into<String>, mix_type: MixType, format: MixFormat) -> Self {
        Self {
            registration: registration.into(),
            mix_type,
            format,
            rules: Vec::new(),
            output: None,
        }
    }

    /// Rule evaluation: excludes veto, otherwise any match wins. A mix with
    /// no match rules only matches by explicit address tag.
    pub fn matches_attributes(&self, attrs: &AudioAttributes) -> bool {
        if self.mix_type != MixType::Players {
            return false;
        }
        for rule in &self.rules {
            if let MixRule::ExcludeUsage(usage) = rule {
                if *usage == attrs.usage {
                    return false;
                }
            }
        }
        self.rules
            .iter()
            .any(|r| matches!(r, MixRule::MatchUsage(usage) if *usage == attrs.usage))
    }

    pub fn matches_source(&self, source: InputSource) -> bool {
        if self.mix_type != MixType::Recorders {
            return false;
        }
        for rule in &self.rules {
            if let MixRule::ExcludeSource(s) = rule {
                if *s == source {
                    return false;
                }
            }
        }
        self.rules
            .iter()
            .any(|r| matches!(r, MixRule::MatchSource(s) if *s == source))
    }
}

/// Registration-keyed table of policy mixes
#[derive(Debug, Default)]
pub struct MixRegistry {
    mixes: BTreeMap<String, AudioPolicyMix>,
}

impl MixRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, mix: AudioPolicyMix) -> Result<()> {
        if self.mixes.contains_key(&mix.registration) {
            return Err(PolicyError::InvalidState(format!(
                "policy mix {} already registered",
                mix.registration
            )));
        }
        debug!(registration = %mix.registration, mix_type = ?mix.mix_type, "policy mix registered");
        self.mixes.insert(mix.registration.clone(), mix);
        Ok(())
    }

    pub fn unregister(&mut self, registration: &str) -> Result<AudioPolicyMix> {
        self.mixes.remove(registration).ok_or_else(|| {
            PolicyError::NotFound(format!("policy mix {registration} not registered"))
        })
    }

    pub fn get(&self, registration: &str) -> Option<&AudioPolicyMix> {
        self.mixes.get(registration)
    }

    pub fn get_mut(&mut self, registration: &str) -> Option<&mut AudioPolicyMix> {
        self.mixes.get_mut(registration)
    }

    /// First mix whose rules match the attribute bundle
    pub fn match_attributes(&self, attrs: &AudioAttributes) -> Option<&AudioPolicyMix> {
        self.mixes.values().find(|m| m.matches_attributes(attrs))
    }

    /// First recorders mix matching a capture source at the given address
    pub fn match_input(&self, source: InputSource, address: &str) -> Option<&AudioPolicyMix> {
        self.mixes
            .values()
            .find(|m| m.registration == address && m.matches_source(source))
    }

    pub fn iter(&self) -> impl Iterator<Item = &AudioPolicyMix> {
        self.mixes.values()
    }

    pub fn len(&self) -> usize {
        self.mixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mixes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::audio::AttrFlags;

    fn media_attrs() -> AudioAttributes {
        AudioAttributes {
            usage: Usage::Media,
            flags: AttrFlags::NONE,
            tags: String::new(),
        }
    }

    #[test]
    fn test_usage_rules() {
        let mut mix = AudioPolicyMix::new("mix:0", MixType::Players, MixFormat::default());
        mix.rules.push(MixRule::MatchUsage(Usage::Media));
        mix.rules.push(MixRule::ExcludeUsage(Usage::Game));

        assert!(mix.matches_attributes(&media_attrs()));
        assert!(!mix.matches_attributes(&AudioAttributes {
            usage: Usage::Game,
            flags: AttrFlags::NONE,
            tags: String::new(),
        }));
        assert!(!mix.matches_attributes(&AudioAttributes {
            usage: Usage::Alarm,
            flags: AttrFlags::NONE,
            tags: String::new(),
        }));
    }

    #[test]
    fn test_no_rules_matches_nothing() {
        let mix = AudioPolicyMix::new("mix:0", MixType::Players, MixFormat::default());
        assert!(!mix.matches_attributes(&media_attrs()));
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let mut registry = MixRegistry::new();
        registry
            .register(AudioPolicyMix::new("mix:0", MixType::Players, MixFormat::default()))
            .unwrap();
        assert!(registry
            .register(AudioPolicyMix::new("mix:0", MixType::Players, MixFormat::default()))
            .is_err());
        assert!(registry.unregister("mix:0").is_ok());
        assert!(registry.unregister("mix:0").is_err());
    }

    #[test]
    fn test_recorders_mix_matches_source_at_address() {
        let mut registry = MixRegistry::new();
        let mut mix = AudioPolicyMix::new("mix:rec", MixType::Recorders, MixFormat::default());
        mix.rules.push(MixRule::MatchSource(InputSource::RemoteSubmix));
        registry.register(mix).unwrap();

        assert!(registry
            .match_input(InputSource::RemoteSubmix, "mix:rec")
            .is_some());
        assert!(registry
            .match_input(InputSource::RemoteSubmix, "mix:other")
            .is_none());
        assert!(registry.match_input(InputSource::Mic, "mix:rec").is_none());
    }
}
