//! Benchmarks for region alignment and robust estimation.
//!
//! Run with: cargo bench -p pintrack-tracking

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use pintrack_core::{apply_homography, invert_y, mat3_from_rows, ChannelMask, Point, Quad, RectD};
use pintrack_tracking::{
    prosac, rgb_to_gray, track_region, ImageSource, ModelKind, ProsacConfig, RegionOptions,
    SyntheticSource,
};

fn bench_track_region(c: &mut Criterion) {
    let source = SyntheticSource::new(160, 120).with_blob(
        Point::new(70.0, 60.0),
        Point::new(1.5, 0.5),
        4.0,
    );
    let (Ok(frame0), Ok(frame1)) = (source.fetch_frame(0), source.fetch_frame(1)) else {
        return;
    };
    let reference = rgb_to_gray(&frame0, ChannelMask::ALL);
    let target = rgb_to_gray(&frame1, ChannelMask::ALL);

    // Bottom-up coordinates.
    let center = Point::new(70.0, invert_y(60.0, 120.0));
    let patch = Quad::from_rect(RectD::new(
        center.x - 10.0,
        center.y - 10.0,
        center.x + 10.0,
        center.y + 10.0,
    ));
    let search = patch.bounding_box().expand(15.0);
    let options = RegionOptions::default();

    c.bench_function("track_region_translation_21px", |bencher| {
        bencher.iter(|| {
            track_region(
                black_box(&reference),
                black_box(&target),
                &patch,
                &patch,
                search,
                &options,
            )
        });
    });
}

fn bench_prosac_homography(c: &mut Criterion) {
    let truth = mat3_from_rows([[1.02, 0.03, 4.0], [-0.02, 0.98, -3.0], [1e-4, 5e-5, 1.0]]);
    let x1: Vec<Point> = (0..64)
        .map(|i| {
            let f = i as f64;
            Point::new(10.0 + (f * 37.3) % 300.0, 10.0 + (f * f * 5.7) % 200.0)
        })
        .collect();
    let x2: Vec<Point> = x1
        .iter()
        .enumerate()
        .map(|(i, p)| {
            let mapped = apply_homography(&truth, *p).unwrap_or(*p);
            // Every fifth correspondence is an outlier.
            if i % 5 == 4 {
                mapped + Point::new(25.0, -18.0)
            } else {
                mapped
            }
        })
        .collect();
    let config = ProsacConfig::default();

    c.bench_function("prosac_homography_64_points", |bencher| {
        bencher.iter(|| prosac(ModelKind::Homography, black_box(&x1), black_box(&x2), &config));
    });
}

criterion_group!(benches, bench_track_region, bench_prosac_homography);
criterion_main!(benches);
