// Performance benchmarks for the volume and routing hot paths
//
// Run with: cargo bench --bench volume_bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use patchbay_core::domain::audio::{InputSource, StreamType};
use patchbay_core::domain::device::{DeviceCategory, DeviceSet, DeviceType};
use patchbay_core::domain::engine::{PolicyEngine, Strategy};
use patchbay_core::domain::volume::{db_to_amplitude, StreamVolumes};

fn bench_db_to_amplitude(c: &mut Criterion) {
    let mut group = c.benchmark_group("db_to_amplitude");

    for db in [-60.0, -40.0, -20.0, -6.0, 0.0].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(db), db, |b, &db| {
            b.iter(|| {
                black_box(db_to_amplitude(black_box(db)));
            });
        });
    }

    group.finish();
}

fn bench_curve_interpolation(c: &mut Criterion) {
    let mut volumes = StreamVolumes::default();
    volumes.get_mut(StreamType::Music).init(0, 15);

    c.bench_function("volume_db_music_full_range", |b| {
        b.iter(|| {
            for index in 0..=15 {
                black_box(volumes.volume_db(
                    StreamType::Music,
                    black_box(index),
                    DeviceCategory::Headset,
                ));
            }
        });
    });
}

fn bench_strategy_resolution(c: &mut Criterion) {
    let engine = PolicyEngine::new();
    let available = DeviceSet::of(DeviceType::Speaker)
        | DeviceSet::of(DeviceType::Earpiece)
        | DeviceSet::of(DeviceType::WiredHeadset)
        | DeviceSet::of(DeviceType::BluetoothA2dp)
        | DeviceSet::of(DeviceType::Hdmi);

    c.bench_function("compute_device_all_strategies", |b| {
        b.iter(|| {
            for strategy in Strategy::ALL {
                black_box(engine.compute_device_for_strategy(
                    black_box(strategy),
                    black_box(available),
                    false,
                ));
            }
        });
    });
}

fn bench_input_device_resolution(c: &mut Criterion) {
    let engine = PolicyEngine::new();
    let available = DeviceSet::of(DeviceType::BuiltinMic)
        | DeviceSet::of(DeviceType::BackMic)
        | DeviceSet::of(DeviceType::WiredHeadsetMic);

    let mut group = c.benchmark_group("input_device");
    for source in [
        InputSource::Mic,
        InputSource::Camcorder,
        InputSource::VoiceRecognition,
    ] {
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{source:?}")),
            &source,
            |b, source| {
                b.iter(|| {
                    black_box(engine.device_for_input_source(black_box(*source), available));
                });
            },
        );
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_db_to_amplitude,
    bench_curve_interpolation,
    bench_strategy_resolution,
    bench_input_device_resolution
);

criterion_main!(benches);
