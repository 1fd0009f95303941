//! Topology configuration
//!
//! The hardware topology (modules, their I/O ports, which devices are soldered
//! on) comes from a TOML file, with a factory default covering a typical
//! phone-class device. Names in the file use the snake_case spellings of the
//! device, format and flag enums.

use crate::domain::audio::{AudioFormat, ChannelMask, InputFlags, OutputFlags, ProfileHandle};
use crate::domain::device::{DeviceDescriptor, DeviceSet, DeviceType, DeviceVector};
use crate::domain::profile::{HwModule, IOProfile, PortDirection};
use crate::domain::volume::PolicyTuning;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, instrument};

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors that can occur loading or validating a topology file
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid topology: {0}")]
    Invalid(String),
}

/// One I/O port of a module as declared in the file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortConfig {
    pub name: String,
    pub direction: PortDirection,
    /// Snake-case device names this port can reach
    pub devices: Vec<String>,
    #[serde(default)]
    pub address: String,
    /// Empty lists leave the capability dynamic, discovered from the HAL
    #[serde(default)]
    pub sample_rates: Vec<u32>,
    #[serde(default)]
    pub formats: Vec<String>,
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub flags: Vec<String>,
}

/// One hardware module as declared in the file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleConfig {
    pub name: String,
    #[serde(default)]
    pub ports: Vec<PortConfig>,
}

/// Complete topology configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// Devices present from boot, before any connection event
    pub attached_devices: Vec<String>,
    /// Fallback output device when a strategy resolves to nothing
    pub default_output_device: String,
    #[serde(default)]
    pub tuning: PolicyTuning,
    #[serde(default)]
    pub modules: Vec<ModuleConfig>,
}

impl TopologyConfig {
    /// Load topology from a TOML file
    #[instrument(skip(path))]
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading topology");

        let contents = fs::read_to_string(path).await?;
        let config: Self = toml::from_str(&contents)?;

        debug!(modules = config.modules.len(), "Topology loaded");
        Ok(config)
    }

    /// Save topology to a TOML file
    #[instrument(skip(self, path))]
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        info!(path = %path.display(), "Saving topology");

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let toml_str = toml::to_string_pretty(self)?;
        fs::write(path, toml_str).await?;
        Ok(())
    }

    /// Typical phone topology: a primary module with speaker, earpiece and
    /// wired/usb jacks, an a2dp module, and the remote submix module.
    pub fn factory_default() -> Self {
        let names = |devices: &[DeviceType]| -> Vec<String> {
            devices.iter().map(|d| d.name().to_string()).collect()
        };

        Self {
            attached_devices: names(&[
                DeviceType::Speaker,
                DeviceType::Earpiece,
                DeviceType::BuiltinMic,
                DeviceType::BackMic,
            ]),
            default_output_device: DeviceType::Speaker.name().to_string(),
            tuning: PolicyTuning::default(),
            modules: vec![
                ModuleConfig {
                    name: "primary".to_string(),
                    ports: vec![
                        PortConfig {
                            name: "primary output".to_string(),
                            direction: PortDirection::Output,
                            devices: names(&[
                                DeviceType::Speaker,
                                DeviceType::Earpiece,
                                DeviceType::WiredHeadset,
                                DeviceType::WiredHeadphone,
                                DeviceType::Line,
                                DeviceType::BluetoothSco,
                                DeviceType::BluetoothScoHeadset,
                                DeviceType::BluetoothScoCarkit,
                            ]),
                            address: String::new(),
                            sample_rates: vec![44_100, 48_000],
                            formats: vec!["pcm16".to_string()],
                            channels: vec!["out_stereo".to_string()],
                            flags: vec!["primary".to_string()],
                        },
                        PortConfig {
                            name: "deep buffer".to_string(),
                            direction: PortDirection::Output,
                            devices: names(&[
                                DeviceType::Speaker,
                                DeviceType::WiredHeadset,
                                DeviceType::WiredHeadphone,
                            ]),
                            address: String::new(),
                            sample_rates: vec![44_100, 48_000],
                            formats: vec!["pcm16".to_string()],
                            channels: vec!["out_stereo".to_string()],
                            flags: vec!["deep_buffer".to_string()],
                        },
                        PortConfig {
                            name: "hdmi output".to_string(),
                            direction: PortDirection::Output,
                            devices: names(&[DeviceType::Hdmi]),
                            address: String::new(),
                            // Capabilities depend on the sink, probed on plug
                            sample_rates: Vec::new(),
                            formats: Vec::new(),
                            channels: Vec::new(),
                            flags: vec!["direct".to_string()],
                        },
                        PortConfig {
                            name: "primary input".to_string(),
                            direction: PortDirection::Input,
                            devices: names(&[
                                DeviceType::BuiltinMic,
                                DeviceType::BackMic,
                                DeviceType::WiredHeadsetMic,
                                DeviceType::BluetoothScoHeadsetMic,
                            ]),
                            address: String::new(),
                            sample_rates: vec![8_000, 16_000, 44_100, 48_000],
                            formats: vec!["pcm16".to_string()],
                            channels: vec!["in_mono".to_string(), "in_stereo".to_string()],
                            flags: Vec::new(),
                        },
                    ],
                },
                ModuleConfig {
                    name: "a2dp".to_string(),
                    ports: vec![PortConfig {
                        name: "a2dp output".to_string(),
                        direction: PortDirection::Output,
                        devices: names(&[
                            DeviceType::BluetoothA2dp,
                            DeviceType::BluetoothA2dpHeadphones,
                            DeviceType::BluetoothA2dpSpeaker,
                        ]),
                        address: String::new(),
                        sample_rates: vec![44_100, 48_000],
                        formats: vec!["pcm16".to_string()],
                        channels: vec!["out_stereo".to_string()],
                        flags: Vec::new(),
                    }],
                },
                ModuleConfig {
                    name: "usb".to_string(),
                    ports: vec![PortConfig {
                        name: "usb output".to_string(),
                        direction: PortDirection::Output,
                        devices: names(&[DeviceType::UsbDevice, DeviceType::UsbAccessory]),
                        address: String::new(),
                        sample_rates: Vec::new(),
                        formats: Vec::new(),
                        channels: Vec::new(),
                        flags: Vec::new(),
                    }],
                },
                ModuleConfig {
                    name: "remote_submix".to_string(),
                    ports: vec![
                        PortConfig {
                            name: "submix output".to_string(),
                            direction: PortDirection::Output,
                            devices: names(&[DeviceType::RemoteSubmix]),
                            address: String::new(),
                            sample_rates: vec![48_000],
                            formats: vec!["pcm16".to_string()],
                            channels: vec!["out_stereo".to_string()],
                            flags: Vec::new(),
                        },
                        PortConfig {
                            name: "submix input".to_string(),
                            direction: PortDirection::Input,
                            devices: names(&[DeviceType::RemoteSubmixIn]),
                            address: String::new(),
                            sample_rates: vec![48_000],
                            formats: vec!["pcm16".to_string()],
                            channels: vec!["in_stereo".to_string()],
                            flags: Vec::new(),
                        },
                    ],
                },
            ],
        }
    }

    /// Materialize the declared modules; profile handles are assigned here
    pub fn build_modules(&self) -> Result<Vec<HwModule>> {
        let mut next_profile = 1u32;
        let mut modules = Vec::with_capacity(self.modules.len());

        for module_config in &self.modules {
            let mut module = HwModule::new(module_config.name.clone());
            for port in &module_config.ports {
                let mut devices = DeviceSet::EMPTY;
                for name in &port.devices {
                    let device = DeviceType::from_name(name).ok_or_else(|| {
                        ConfigError::Invalid(format!("unknown device name: {name}"))
                    })?;
                    let wrong_direction = match port.direction {
                        PortDirection::Output => !device.is_output(),
                        PortDirection::Input => !device.is_input(),
                    };
                    if wrong_direction {
                        return Err(ConfigError::Invalid(format!(
                            "device {name} has the wrong direction for port {}",
                            port.name
                        )));
                    }
                    devices.insert(device);
                }
                if devices.is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "port {} declares no devices",
                        port.name
                    )));
                }

                let handle = ProfileHandle::new(next_profile);
                next_profile += 1;

                let mut profile = match port.direction {
                    PortDirection::Output => {
                        let flags = OutputFlags::from_names(&port.flags)
                            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
                        IOProfile::new_output(handle, port.name.clone(), devices, flags)
                    }
                    PortDirection::Input => {
                        let flags = InputFlags::from_names(&port.flags)
                            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
                        IOProfile::new_input(handle, port.name.clone(), devices, flags)
                    }
                };
                profile.address = port.address.clone();
                profile.sample_rates = port.sample_rates.clone();
                for name in &port.formats {
                    let format = AudioFormat::from_name(name).ok_or_else(|| {
                        ConfigError::Invalid(format!("unknown format name: {name}"))
                    })?;
                    profile.formats.push(format);
                }
                for name in &port.channels {
                    let mask = ChannelMask::from_name(name).ok_or_else(|| {
                        ConfigError::Invalid(format!("unknown channel mask name: {name}"))
                    })?;
                    profile.channel_masks.push(mask);
                }

                profile.dynamic = profile.has_dynamic_params();

                match port.direction {
                    PortDirection::Output => module.outputs.push(profile),
                    PortDirection::Input => module.inputs.push(profile),
                }
            }
            modules.push(module);
        }
        Ok(modules)
    }

    /// Devices present at boot, validated against the declared modules
    pub fn build_attached_devices(&self, modules: &[HwModule]) -> Result<DeviceVector> {
        let mut attached = DeviceVector::new();
        for name in &self.attached_devices {
            let device = DeviceType::from_name(name)
                .ok_or_else(|| ConfigError::Invalid(format!("unknown device name: {name}")))?;
            let reachable = modules.iter().any(|m| {
                m.supported_output_devices().contains(device)
                    || m.supported_input_devices().contains(device)
            });
            if !reachable {
                return Err(ConfigError::Invalid(format!(
                    "attached device {name} is not reachable from any module"
                )));
            }
            attached
                .add(DeviceDescriptor::new(device, ""))
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        }
        Ok(attached)
    }

    pub fn default_output_device(&self) -> Result<DeviceType> {
        DeviceType::from_name(&self.default_output_device).ok_or_else(|| {
            ConfigError::Invalid(format!(
                "unknown default output device: {}",
                self.default_output_device
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_factory_default_builds() {
        let config = TopologyConfig::factory_default();
        let modules = config.build_modules().unwrap();
        assert_eq!(modules.len(), 4);

        let primary = &modules[0];
        assert_eq!(primary.name, "primary");
        assert!(primary
            .supported_output_devices()
            .contains(DeviceType::Speaker));
        assert!(primary
            .supported_input_devices()
            .contains(DeviceType::BuiltinMic));

        let attached = config.build_attached_devices(&modules).unwrap();
        assert!(attached.contains(DeviceType::Speaker, ""));
        assert_eq!(config.default_output_device().unwrap(), DeviceType::Speaker);
    }

    #[test]
    fn test_serialization_round_trip() {
        let config = TopologyConfig::factory_default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: TopologyConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(parsed.modules.len(), config.modules.len());
        assert_eq!(parsed.attached_devices, config.attached_devices);
        assert_eq!(
            parsed.tuning.sonification_headset_music_delay_ms,
            config.tuning.sonification_headset_music_delay_ms
        );
    }

    #[test]
    fn test_rejects_wrong_direction_device() {
        let mut config = TopologyConfig::factory_default();
        config.modules[0].ports[0]
            .devices
            .push("builtin_mic".to_string());
        assert!(config.build_modules().is_err());
    }

    #[test]
    fn test_rejects_unreachable_attached_device() {
        let mut config = TopologyConfig::factory_default();
        config.attached_devices.push("fm_tuner".to_string());
        let modules = config.build_modules().unwrap();
        assert!(config.build_attached_devices(&modules).is_err());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("topology.toml");

        let config = TopologyConfig::factory_default();
        config.save_to_file(&path).await.unwrap();
        assert!(path.exists());

        let loaded = TopologyConfig::load_from_file(&path).await.unwrap();
        assert_eq!(loaded.modules.len(), config.modules.len());
        assert_eq!(loaded.default_output_device, config.default_output_device);
    }
}
