use criterion::{black_box, criterion_group, criterion_main, Criterion};
use glam::{Quat, Vec2, Vec3};

use wavry_xr::{FoveatedDecodeParams, FoveationConfig, Pose, PoseFilter};

fn bench_pose_filter(c: &mut Criterion) {
    let mut filter = PoseFilter::default();
    let mut tick = 0u32;
    let dt = 1.0 / 270.0;

    c.bench_function("pose_filter_tick", |b| {
        b.iter(|| {
            tick = tick.wrapping_add(1);
            let t = tick as f32 * dt;
            let pose = Pose {
                position: Vec3::new(t.sin() * 0.1, 1.6, t.cos() * 0.1),
                orientation: Quat::from_rotation_y(t.sin()),
            };
            black_box(filter.filter(dt, black_box(pose)))
        })
    });
}

fn bench_foveation_solver(c: &mut Criterion) {
    let config = FoveationConfig::default();

    c.bench_function("foveated_decode_params", |b| {
        b.iter(|| FoveatedDecodeParams::new(black_box(Vec2::new(1832.0, 1920.0)), &config))
    });
}

criterion_group!(benches, bench_pose_filter, bench_foveation_solver);
criterion_main!(benches);
