//! Benchmarks for dataset naming and simulated volume creation

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::sync::Arc;
use truenas_volume_driver::config::ApplianceConfig;
use truenas_volume_driver::{
    DatasetLayout, DriverConfig, InMemoryAppliance, ProvisioningMode, SimulatorConfig,
    VolumeManager, VolumeSpec,
};

fn bench_paths(c: &mut Criterion) {
    let mut group = c.benchmark_group("dataset_layout");
    group.throughput(Throughput::Elements(1));

    let layout = DatasetLayout::new("tank/openstack/cinder").unwrap();

    group.bench_function("volume_path", |b| {
        b.iter(|| layout.volume_path(black_box("5f0c7a4e-1b2d-4e8f-9a3c-6d7e8f901234")));
    });

    group.bench_function("snapshot_path", |b| {
        b.iter(|| {
            layout.snapshot_path(
                black_box("5f0c7a4e-1b2d-4e8f-9a3c-6d7e8f901234"),
                black_box("0a1b2c3d-4e5f-4a6b-8c7d-9e0f1a2b3c4d"),
            )
        });
    });

    let path = layout
        .volume_path("5f0c7a4e-1b2d-4e8f-9a3c-6d7e8f901234")
        .unwrap();
    group.bench_function("parse_volume_id", |b| {
        b.iter(|| layout.parse_volume_id(black_box(&path)));
    });

    group.finish();
}

fn bench_simulated_creates(c: &mut Criterion) {
    let mut group = c.benchmark_group("volume_manager");
    group.throughput(Throughput::Elements(100));

    let rt = tokio::runtime::Runtime::new().unwrap();

    group.bench_function("concurrent_100_creates", |b| {
        b.iter(|| {
            let simulator = SimulatorConfig::default();
            let config = DriverConfig {
                appliance: ApplianceConfig {
                    url: "https://nas.example.com".into(),
                    api_key: Some(simulator.api_key.clone()),
                    ..Default::default()
                },
                dataset_parent: simulator.parent.clone(),
                ..Default::default()
            };
            let appliance = Arc::new(InMemoryAppliance::new(simulator));
            let manager = VolumeManager::new(config, appliance).unwrap();

            rt.block_on(async {
                let mut handles = Vec::new();
                for i in 0..100 {
                    let manager = manager.clone();
                    handles.push(tokio::spawn(async move {
                        let spec = VolumeSpec::new(format!("vol-{}", i), 1)
                            .with_provisioning(ProvisioningMode::Thin);
                        manager.create_volume(spec).await
                    }));
                }
                for handle in handles {
                    let _ = handle.await;
                }
            });
        });
    });

    group.finish();
}

criterion_group!(benches, bench_paths, bench_simulated_creates);
criterion_main!(benches);
