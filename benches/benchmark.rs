use criterion::{black_box, criterion_group, criterion_main, Criterion};
use neurovol::{
    read_volume, write_volume, AffineTransform, Extents, IndexedVolume, Interpolation, StorageKind, VolumeArray,
    VolumeHeader, VoxelBuffer, WriteOptions,
};
use std::fs;
use tempfile::tempdir;

fn test_volume(size: usize) -> IndexedVolume {
    let extents = Extents::new(size, size, size, 1, 1);
    let values: Vec<f32> = (0..extents.num_voxels()).map(|i| (i % 256) as f32).collect();
    IndexedVolume::new(extents, AffineTransform::from_scale_translation([1.5; 3], [-10.; 3]), VoxelBuffer::Float32(values))
        .unwrap()
}

fn bench_read(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let volume = test_volume(64);
    let nii = dir.path().join("bench.nii");
    let niigz = dir.path().join("bench.nii.gz");
    write_volume(&nii, &volume, &WriteOptions::default()).unwrap();
    write_volume(&niigz, &volume, &WriteOptions::default()).unwrap();
    let header_bytes = fs::read(&nii).unwrap()[..352].to_vec();

    c.bench_function("header", |b| b.iter(|| VolumeHeader::from_bytes(black_box(&header_bytes), true).unwrap()));
    c.bench_function("read_nii", |b| b.iter(|| read_volume(black_box(&nii)).unwrap()));
    c.bench_function("read_nii_gz", |b| b.iter(|| read_volume(black_box(&niigz)).unwrap()));
}

fn bench_sample(c: &mut Criterion) {
    let volume = test_volume(64);
    c.bench_function("trilinear", |b| {
        b.iter(|| {
            let mut sum = 0.;
            for i in 0..1000 {
                let v = i as f64 * 0.061;
                sum += volume.interpolate_trilinear(black_box(v), v * 0.5, 62. - v, 0, 0);
            }
            sum
        })
    });
    c.bench_function("raster", |b| {
        b.iter(|| {
            volume.raster(black_box([-10., -10., 20.]), [1., 0., 0.], [0., 1., 0.], 96, 96, 0, 0, Interpolation::Trilinear)
        })
    });
    c.bench_function("zeros_u8", |b| {
        b.iter(|| IndexedVolume::zeros(black_box(Extents::new(64, 64, 64, 1, 1)), AffineTransform::identity(), StorageKind::UInt8))
    });
}

criterion_group!(benches, bench_read, bench_sample);
criterion_main!(benches);
