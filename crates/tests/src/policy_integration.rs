//! End-to-end policy scenarios over the scripted HAL

use patchbay_core::domain::audio::{
    AudioFormat, ChannelMask, ForceUsage, ForcedConfig, InputFlags, InputSource, IoHandle,
    OutputFlags, PatchHandle, PhoneState, PolicyError, RecordAttributes, Session, StreamType, Uid,
};
use patchbay_core::domain::config::{PortConfig, TopologyConfig};
use patchbay_core::domain::device::DeviceType;
use patchbay_core::domain::engine::DefaultVendorHooks;
use patchbay_core::domain::manager::{EffectDescriptor, PolicyManager};
use patchbay_core::domain::mix::{AudioPolicyMix, MixFormat, MixRule, MixType};
use patchbay_core::domain::patch::{PatchPort, PatchRequest};
use patchbay_core::domain::profile::PortDirection;
use patchbay_core::domain::session::RouteKind;
use patchbay_infra::hal::{FakeHal, HalCommand};
use std::sync::Arc;

fn build_manager_with(config: &TopologyConfig) -> (Arc<FakeHal>, PolicyManager) {
    let hal = Arc::new(FakeHal::new());
    let manager = PolicyManager::new(config, hal.clone(), Arc::new(DefaultVendorHooks))
        .expect("manager builds on test topology");
    (hal, manager)
}

fn build_manager() -> (Arc<FakeHal>, PolicyManager) {
    build_manager_with(&TopologyConfig::factory_default())
}

/// Factory topology plus a compressed-offload port on the primary module
fn offload_topology() -> TopologyConfig {
    let mut config = TopologyConfig::factory_default();
    config.modules[0].ports.push(PortConfig {
        name: "compress offload".to_string(),
        direction: PortDirection::Output,
        devices: vec!["speaker".to_string(), "wired_headset".to_string()],
        address: String::new(),
        sample_rates: vec![44_100, 48_000],
        formats: vec!["pcm16".to_string()],
        channels: vec!["out_stereo".to_string()],
        flags: vec!["direct".to_string(), "compress_offload".to_string()],
    });
    config
}

fn start_music(manager: &mut PolicyManager, session: Session) -> IoHandle {
    let output = manager.get_output(StreamType::Music).unwrap();
    manager
        .start_output(output, StreamType::Music, session)
        .unwrap();
    output
}

#[test]
fn test_headset_connect_reroutes_music() {
    let (hal, mut manager) = build_manager();
    let session = Session::new(1);
    let output = start_music(&mut manager, session);
    assert_eq!(output, manager.primary_output());

    manager
        .set_device_connection_state(DeviceType::WiredHeadset, "", true)
        .unwrap();
    assert_eq!(hal.last_routing(output).as_deref(), Some("wired_headset"));
    assert!(manager.device_connection_state(DeviceType::WiredHeadset, ""));

    manager
        .set_device_connection_state(DeviceType::WiredHeadset, "", false)
        .unwrap();
    assert_eq!(hal.last_routing(output).as_deref(), Some("speaker"));
    assert!(!manager.device_connection_state(DeviceType::WiredHeadset, ""));
}

#[test]
fn test_duplicate_connect_and_disconnect_are_rejected() {
    let (_hal, mut manager) = build_manager();
    manager
        .set_device_connection_state(DeviceType::WiredHeadset, "", true)
        .unwrap();
    assert!(manager
        .set_device_connection_state(DeviceType::WiredHeadset, "", true)
        .is_err());

    manager
        .set_device_connection_state(DeviceType::WiredHeadset, "", false)
        .unwrap();
    assert!(manager
        .set_device_connection_state(DeviceType::WiredHeadset, "", false)
        .is_err());
}

#[test]
fn test_failed_output_open_rolls_back_connection() {
    let (hal, mut manager) = build_manager();
    // The HDMI profile is the only path to the device; its open failing must
    // leave the device disconnected
    hal.fail_next("open_output");
    let result = manager.set_device_connection_state(DeviceType::Hdmi, "", true);
    assert!(result.is_err());
    assert!(!manager.device_connection_state(DeviceType::Hdmi, ""));
}

#[test]
fn test_hdmi_capabilities_probed_and_dropped() {
    let (hal, mut manager) = build_manager();
    hal.set_parameter_reply(
        "sup_sampling_rates;sup_formats;sup_channels",
        "sup_sampling_rates=44100|48000;sup_formats=pcm16;sup_channels=out_stereo",
    );
    manager
        .set_device_connection_state(DeviceType::Hdmi, "", true)
        .unwrap();
    let before = hal.open_output_count();

    manager
        .set_device_connection_state(DeviceType::Hdmi, "", false)
        .unwrap();
    // The probed direct output dies with the device
    assert!(hal.open_output_count() < before);
}

#[test]
fn test_phone_state_forces_primary_route() {
    let (hal, mut manager) = build_manager();
    let primary = manager.primary_output();

    manager.set_phone_state(PhoneState::InCall).unwrap();
    assert_eq!(hal.last_routing(primary).as_deref(), Some("earpiece"));

    manager
        .set_force_use(ForceUsage::Communication, ForcedConfig::Speaker)
        .unwrap();
    assert_eq!(hal.last_routing(primary).as_deref(), Some("speaker"));

    manager.set_phone_state(PhoneState::Normal).unwrap();
    assert_eq!(manager.phone_state(), PhoneState::Normal);
}

#[test]
fn test_incall_ring_becomes_notification_tone() {
    let (hal, mut manager) = build_manager();
    let session = Session::new(3);
    let output = manager.get_output(StreamType::Ring).unwrap();
    manager
        .start_output(output, StreamType::Ring, session)
        .unwrap();

    manager.set_phone_state(PhoneState::InCall).unwrap();
    assert!(hal
        .commands()
        .iter()
        .any(|c| matches!(c, HalCommand::StartTone { .. })));
    // Ring is muted for the duration of the call
    assert_eq!(hal.last_volume(StreamType::Ring, output), Some(0.0));

    manager.set_phone_state(PhoneState::Normal).unwrap();
    assert!(hal.commands().iter().any(|c| matches!(c, HalCommand::StopTone)));
    let restored = hal.last_volume(StreamType::Ring, output).unwrap();
    assert!(restored > 0.0);

    manager
        .stop_output(output, StreamType::Ring, session)
        .unwrap();
}

#[test]
fn test_sonification_never_louder_than_music_on_headset() {
    let (hal, mut manager) = build_manager();
    let session = Session::new(4);
    manager
        .set_device_connection_state(DeviceType::WiredHeadset, "", true)
        .unwrap();
    let output = start_music(&mut manager, session);

    manager
        .set_stream_volume_index(StreamType::Music, 10, DeviceType::WiredHeadset)
        .unwrap();
    manager
        .set_stream_volume_index(StreamType::Notification, 7, DeviceType::WiredHeadset)
        .unwrap();

    let music = hal.last_volume(StreamType::Music, output).unwrap();
    let notification = hal.last_volume(StreamType::Notification, output).unwrap();
    assert!(
        notification <= music + 1e-6,
        "notification {notification} louder than music {music}"
    );
    assert_eq!(
        manager.get_stream_volume_index(StreamType::Music, DeviceType::WiredHeadset),
        10
    );
}

#[test]
fn test_volume_index_range_is_enforced() {
    let (_hal, mut manager) = build_manager();
    assert!(manager
        .set_stream_volume_index(StreamType::Music, 16, DeviceType::Speaker)
        .is_err());
    assert!(manager
        .set_stream_volume_index(StreamType::VoiceCall, 0, DeviceType::Earpiece)
        .is_err());
}

#[test]
fn test_single_capture_with_hotword_preemption() {
    let (hal, mut manager) = build_manager();
    let hotword_session = Session::new(10);
    let mic_session = Session::new(11);
    let late_session = Session::new(12);

    let hotword = manager
        .get_input_for_attr(
            &RecordAttributes::from_source(InputSource::Hotword),
            hotword_session,
            16_000,
            AudioFormat::Pcm16,
            ChannelMask::InMono,
            InputFlags::HW_HOTWORD,
        )
        .unwrap();
    manager.start_input(hotword, hotword_session).unwrap();
    assert!(manager.is_source_active(InputSource::Hotword));

    // A real client preempts the hotword capture
    let mic = manager
        .get_input_for_attr(
            &RecordAttributes::from_source(InputSource::Mic),
            mic_session,
            48_000,
            AudioFormat::Pcm16,
            ChannelMask::InMono,
            InputFlags::NONE,
        )
        .unwrap();
    manager.start_input(mic, mic_session).unwrap();
    assert!(!manager.is_source_active(InputSource::Hotword));
    assert!(manager.is_source_active(InputSource::Mic));
    // The losing capture is closed, not parked
    let commands = hal.commands();
    assert!(commands
        .iter()
        .any(|c| matches!(c, HalCommand::CloseInput { input } if *input == hotword)));

    // A second real client is refused while the first captures
    let late = manager
        .get_input_for_attr(
            &RecordAttributes::from_source(InputSource::VoiceRecognition),
            late_session,
            16_000,
            AudioFormat::Pcm16,
            ChannelMask::InMono,
            InputFlags::NONE,
        )
        .unwrap();
    assert!(manager.start_input(late, late_session).is_err());

    manager.stop_input(mic, mic_session).unwrap();
    manager.release_input(mic, mic_session);
    manager.release_input(hotword, hotword_session);
    manager.release_input(late, late_session);
    assert_eq!(hal.open_input_count(), 0);
}

#[test]
fn test_recorders_mix_binds_output_and_capture() {
    let (hal, mut manager) = build_manager();
    let registration = "mix:record:1".to_string();

    let mut mix = AudioPolicyMix::new(&registration, MixType::Recorders, MixFormat::default());
    mix.rules
        .push(MixRule::MatchSource(InputSource::RemoteSubmix));
    manager.register_policy_mixes(vec![mix]).unwrap();

    // Playback tagged with the registration address goes straight to the
    // mix's bound output
    let attrs = patchbay_core::domain::audio::AudioAttributes {
        usage: patchbay_core::domain::audio::Usage::Media,
        flags: patchbay_core::domain::audio::AttrFlags::NONE,
        tags: format!("addr={registration}"),
    };
    let (output, stream) = manager
        .get_output_for_attr(
            &attrs,
            Session::new(20),
            48_000,
            AudioFormat::Pcm16,
            ChannelMask::OutStereo,
            OutputFlags::NONE,
        )
        .unwrap();
    assert_eq!(stream, StreamType::Rerouting);
    assert_ne!(output, manager.primary_output());

    // The capture side opens on the stereo-forced submix input
    let record_attrs = RecordAttributes {
        source: InputSource::RemoteSubmix,
        tags: format!("addr={registration}"),
    };
    let session = Session::new(21);
    let input = manager
        .get_input_for_attr(
            &record_attrs,
            session,
            48_000,
            AudioFormat::Pcm16,
            ChannelMask::InStereo,
            InputFlags::NONE,
        )
        .unwrap();
    manager.start_input(input, session).unwrap();
    manager.stop_input(input, session).unwrap();
    manager.release_input(input, session);

    manager
        .unregister_policy_mixes(vec![registration.clone()])
        .unwrap();
    assert!(manager
        .get_output_for_attr(
            &attrs,
            Session::new(22),
            48_000,
            AudioFormat::Pcm16,
            ChannelMask::OutStereo,
            OutputFlags::NONE,
        )
        .is_err());
    assert!(hal
        .commands()
        .iter()
        .any(|c| matches!(c, HalCommand::CloseOutput { output: o } if *o == output)));
}

#[test]
fn test_mix_activity_notifications() {
    let (hal, mut manager) = build_manager();
    let registration = "mix:players:1".to_string();
    let mut mix = AudioPolicyMix::new(&registration, MixType::Players, MixFormat::default());
    mix.rules.push(MixRule::MatchUsage(
        patchbay_core::domain::audio::Usage::Media,
    ));
    manager.register_policy_mixes(vec![mix]).unwrap();

    let attrs =
        patchbay_core::domain::audio::AudioAttributes::from_usage(
            patchbay_core::domain::audio::Usage::Media,
        );
    let session = Session::new(30);
    let (output, stream) = manager
        .get_output_for_attr(
            &attrs,
            session,
            48_000,
            AudioFormat::Pcm16,
            ChannelMask::OutStereo,
            OutputFlags::NONE,
        )
        .unwrap();
    assert_eq!(stream, StreamType::Rerouting);

    manager.start_output(output, stream, session).unwrap();
    assert!(hal.commands().iter().any(|c| matches!(
        c,
        HalCommand::MixStateChanged { registration: r, state: patchbay_core::domain::hal::MixState::Mixing } if *r == registration
    )));

    manager.stop_output(output, stream, session).unwrap();
    assert!(hal.commands().iter().any(|c| matches!(
        c,
        HalCommand::MixStateChanged { registration: r, state: patchbay_core::domain::hal::MixState::Idle } if *r == registration
    )));
    manager.release_output(output, session);
    manager.unregister_policy_mixes(vec![registration]).unwrap();
}

#[test]
fn test_a2dp_suspended_while_sco_forced() {
    let (hal, mut manager) = build_manager();
    manager
        .set_device_connection_state(DeviceType::BluetoothA2dp, "", true)
        .unwrap();
    let a2dp_output = hal
        .commands()
        .iter()
        .find_map(|c| match c {
            HalCommand::OpenOutput { handle, device, .. }
                if *device == DeviceType::BluetoothA2dp =>
            {
                Some(*handle)
            }
            _ => None,
        })
        .expect("a2dp output opened on connect");

    manager
        .set_device_connection_state(DeviceType::BluetoothScoHeadset, "", true)
        .unwrap();
    assert!(!hal.is_suspended(a2dp_output));

    manager
        .set_force_use(ForceUsage::Communication, ForcedConfig::BtSco)
        .unwrap();
    assert!(hal.is_suspended(a2dp_output));

    manager
        .set_force_use(ForceUsage::Communication, ForcedConfig::None)
        .unwrap();
    assert!(!hal.is_suspended(a2dp_output));
}

#[test]
fn test_secondary_module_output_is_duplicated() {
    let (hal, mut manager) = build_manager();
    manager
        .set_device_connection_state(DeviceType::BluetoothA2dp, "", true)
        .unwrap();
    assert!(hal
        .commands()
        .iter()
        .any(|c| matches!(c, HalCommand::OpenDuplicateOutput { .. })));

    // Closing the a2dp side collapses the duplication cleanly
    manager
        .set_device_connection_state(DeviceType::BluetoothA2dp, "", false)
        .unwrap();
    let commands = hal.commands();
    let closes = commands
        .iter()
        .filter(|c| matches!(c, HalCommand::CloseOutput { .. }))
        .count();
    assert!(closes >= 2);
}

#[test]
fn test_voice_volume_follows_call_on_primary() {
    let (hal, mut manager) = build_manager();
    manager.set_phone_state(PhoneState::InCall).unwrap();
    manager
        .set_stream_volume_index(StreamType::VoiceCall, 3, DeviceType::Earpiece)
        .unwrap();
    let voice = hal.commands().iter().rev().find_map(|c| match c {
        HalCommand::SetVoiceVolume { volume, .. } => Some(*volume),
        _ => None,
    });
    assert_eq!(voice, Some(3.0 / 5.0));
}

#[test]
fn test_sco_guard_rejects_voice_volume() {
    let (_hal, mut manager) = build_manager();
    manager
        .set_device_connection_state(DeviceType::BluetoothScoHeadset, "", true)
        .unwrap();
    manager
        .set_force_use(ForceUsage::Communication, ForcedConfig::BtSco)
        .unwrap();
    manager.set_phone_state(PhoneState::InCall).unwrap();

    let result =
        manager.set_stream_volume_index(StreamType::VoiceCall, 4, DeviceType::BluetoothScoHeadset);
    assert!(result.is_err());
}

#[test]
fn test_sco_stream_volume_requires_sco_route() {
    let (_hal, mut manager) = build_manager();
    // Without a SCO link carrying the call, the SCO stream level is fixed
    assert!(manager
        .set_stream_volume_index(StreamType::BluetoothSco, 7, DeviceType::Speaker)
        .is_err());

    manager
        .set_device_connection_state(DeviceType::BluetoothScoHeadset, "", true)
        .unwrap();
    manager
        .set_force_use(ForceUsage::Communication, ForcedConfig::BtSco)
        .unwrap();
    assert!(manager
        .set_stream_volume_index(StreamType::BluetoothSco, 7, DeviceType::Speaker)
        .is_ok());
}

#[test]
fn test_offload_output_opened_and_shared() {
    let (hal, mut manager) = build_manager_with(&offload_topology());
    let attrs = patchbay_core::domain::audio::AudioAttributes::from_usage(
        patchbay_core::domain::audio::Usage::Media,
    );

    let first_session = Session::new(70);
    let (output, stream) = manager
        .get_output_for_attr(
            &attrs,
            first_session,
            44_100,
            AudioFormat::Pcm16,
            ChannelMask::OutStereo,
            OutputFlags::COMPRESS_OFFLOAD,
        )
        .unwrap();
    assert_eq!(stream, StreamType::Music);
    assert_ne!(output, manager.primary_output());

    // An identical request shares the open output instead of reopening
    let before = hal.open_output_count();
    let second_session = Session::new(71);
    let (again, _) = manager
        .get_output_for_attr(
            &attrs,
            second_session,
            44_100,
            AudioFormat::Pcm16,
            ChannelMask::OutStereo,
            OutputFlags::COMPRESS_OFFLOAD,
        )
        .unwrap();
    assert_eq!(again, output);
    assert_eq!(hal.open_output_count(), before);

    // The output survives the first release and closes on the last
    manager.release_output(output, first_session);
    let commands = hal.commands();
    assert!(!commands
        .iter()
        .any(|c| matches!(c, HalCommand::CloseOutput { output: o } if *o == output)));
    manager.release_output(output, second_session);
    let commands = hal.commands();
    assert!(commands
        .iter()
        .any(|c| matches!(c, HalCommand::CloseOutput { output: o } if *o == output)));
}

#[test]
fn test_offload_denied_while_non_offloadable_effect_enabled() {
    let (_hal, mut manager) = build_manager_with(&offload_topology());
    manager
        .register_effect(EffectDescriptor {
            id: 1,
            name: "bassboost".to_string(),
            session: Session::new(72),
            io: IoHandle::NONE,
            strategy: None,
            enabled: false,
            offloadable: false,
            memory: 4096,
        })
        .unwrap();
    manager.set_effect_enabled(1, true).unwrap();

    // The offload request lands on the mixed path while the effect is live
    let attrs = patchbay_core::domain::audio::AudioAttributes::from_usage(
        patchbay_core::domain::audio::Usage::Media,
    );
    let (output, _) = manager
        .get_output_for_attr(
            &attrs,
            Session::new(73),
            44_100,
            AudioFormat::Pcm16,
            ChannelMask::OutStereo,
            OutputFlags::COMPRESS_OFFLOAD,
        )
        .unwrap();
    assert_eq!(output, manager.primary_output());

    // Disabling the effect restores the offload path
    manager.set_effect_enabled(1, false).unwrap();
    let (output, _) = manager
        .get_output_for_attr(
            &attrs,
            Session::new(74),
            44_100,
            AudioFormat::Pcm16,
            ChannelMask::OutStereo,
            OutputFlags::COMPRESS_OFFLOAD,
        )
        .unwrap();
    assert_ne!(output, manager.primary_output());
    manager.release_output(output, Session::new(74));
}

#[test]
fn test_release_unknown_patch_fails_without_side_effects() {
    let (hal, mut manager) = build_manager();
    let before = hal.commands().len();
    let err = manager
        .release_audio_patch(PatchHandle::new(99), Uid(1000))
        .unwrap_err();
    assert!(matches!(err, PolicyError::NotFound(_)));
    assert!(manager.list_audio_patches().is_empty());
    assert_eq!(hal.commands().len(), before);
}

#[test]
fn test_output_patch_pins_route_and_updates_in_place() {
    let (hal, mut manager) = build_manager();
    manager
        .set_device_connection_state(DeviceType::WiredHeadset, "", true)
        .unwrap();
    let session = Session::new(80);
    let output = start_music(&mut manager, session);
    assert_eq!(hal.last_routing(output).as_deref(), Some("wired_headset"));

    let uid = Uid(10_080);
    let patch = manager
        .create_audio_patch(
            PatchRequest {
                source: PatchPort::mix(output),
                sinks: vec![PatchPort::device(DeviceType::Speaker, "")],
            },
            uid,
            None,
        )
        .unwrap();
    assert_eq!(hal.last_routing(output).as_deref(), Some("speaker"));

    // A second patch on the same endpoint updates the first, keeping its
    // handle, instead of stacking a second live patch
    let updated = manager
        .create_audio_patch(
            PatchRequest {
                source: PatchPort::mix(output),
                sinks: vec![PatchPort::device(DeviceType::WiredHeadset, "")],
            },
            uid,
            None,
        )
        .unwrap();
    assert_eq!(updated, patch);
    assert_eq!(manager.list_audio_patches().len(), 1);
    assert_eq!(hal.last_routing(output).as_deref(), Some("wired_headset"));

    // Releasing hands the output back to strategy routing
    manager.release_audio_patch(patch, uid).unwrap();
    assert_eq!(hal.last_routing(output).as_deref(), Some("wired_headset"));
    manager
        .stop_output(output, StreamType::Music, session)
        .unwrap();
    manager.release_output(output, session);
}

#[test]
fn test_stop_requires_matching_start() {
    let (_hal, mut manager) = build_manager();
    let session = Session::new(40);
    let output = manager.get_output(StreamType::Music).unwrap();
    assert!(manager
        .stop_output(output, StreamType::Music, session)
        .is_err());

    manager
        .start_output(output, StreamType::Music, session)
        .unwrap();
    manager
        .stop_output(output, StreamType::Music, session)
        .unwrap();
    assert!(manager
        .stop_output(output, StreamType::Music, session)
        .is_err());
}

#[test]
fn test_session_route_overrides_strategy() {
    let (hal, mut manager) = build_manager();
    let session = Session::new(60);
    manager
        .set_device_connection_state(DeviceType::WiredHeadset, "", true)
        .unwrap();

    // Media would land on the headset; the pinned session stays on speaker
    manager
        .set_session_route(
            session,
            RouteKind::Output(StreamType::Music),
            DeviceType::Speaker,
            Uid(10_060),
        )
        .unwrap();
    let attrs = patchbay_core::domain::audio::AudioAttributes::from_usage(
        patchbay_core::domain::audio::Usage::Media,
    );
    let (output, stream) = manager
        .get_output_for_attr(
            &attrs,
            session,
            48_000,
            AudioFormat::Pcm16,
            ChannelMask::OutStereo,
            OutputFlags::NONE,
        )
        .unwrap();
    assert_eq!(stream, StreamType::Music);

    manager.start_output(output, stream, session).unwrap();
    assert_eq!(hal.last_routing(output).as_deref(), Some("speaker"));

    manager.stop_output(output, stream, session).unwrap();
    manager.release_output(output, session);

    // A capture route must name an input device
    assert!(manager
        .set_session_route(
            Session::new(61),
            RouteKind::Input(InputSource::Mic),
            DeviceType::Speaker,
            Uid(10_060),
        )
        .is_err());
}

#[test]
fn test_beacon_yields_to_other_playback() {
    let (hal, mut manager) = build_manager();
    let beacon_session = Session::new(50);
    let music_session = Session::new(51);

    let beacon_output = manager.get_output(StreamType::Tts).unwrap();
    manager
        .start_output(beacon_output, StreamType::Tts, beacon_session)
        .unwrap();

    let music_output = start_music(&mut manager, music_session);
    assert_eq!(hal.last_volume(StreamType::Tts, beacon_output), Some(0.0));

    manager
        .stop_output(music_output, StreamType::Music, music_session)
        .unwrap();
    let restored = hal.last_volume(StreamType::Tts, beacon_output).unwrap();
    assert!(restored > 0.0);

    manager
        .stop_output(beacon_output, StreamType::Tts, beacon_session)
        .unwrap();
}
