//! Benchmarks for tiled ensemble prediction and reconstruction.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use tesela::model::{ModelPool, NormalizationStats, SegmentationModel};
use tesela::predict::{EnsemblePredictor, PredictConfig};
use tesela::synthetic::{synthetic_image, GradientModel};
use tesela::tiling::{ArrayTileSource, TileLayout};
use tesela::weighting::gaussian_importance_map;

fn source_for(size: usize) -> ArrayTileSource {
    let layout = TileLayout::grid((size, size), (64, 64), (16, 16), 3).expect("valid grid");
    ArrayTileSource::new(synthetic_image(1, size, size, 42), layout).expect("matching shapes")
}

fn predictor_for(n_models: usize, config: PredictConfig) -> EnsemblePredictor {
    let models: Vec<Arc<dyn SegmentationModel>> = (0..n_models)
        .map(|_| Arc::new(GradientModel::new(3)) as Arc<dyn SegmentationModel>)
        .collect();
    let pool = ModelPool::from_parts(models, NormalizationStats::new(vec![0.0], vec![1.0]))
        .expect("non-empty pool");
    EnsemblePredictor::new(pool, config).expect("valid config")
}

fn bench_gaussian_importance_map(c: &mut Criterion) {
    let mut group = c.benchmark_group("gaussian_importance_map");

    for &size in &[64usize, 128, 256, 512] {
        group.throughput(Throughput::Elements((size * size) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| gaussian_importance_map(black_box((size, size)), 0.125));
        });
    }

    group.finish();
}

fn bench_predict_image_sizes(c: &mut Criterion) {
    let mut group = c.benchmark_group("predict_image_size");
    group.sample_size(10);

    for &size in &[128usize, 256, 512] {
        group.throughput(Throughput::Elements((size * size) as u64));
        let source = source_for(size);
        let predictor = predictor_for(1, PredictConfig::default().with_tta(false));

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| predictor.predict(black_box(&source)));
        });
    }

    group.finish();
}

fn bench_predict_ensemble_width(c: &mut Criterion) {
    let mut group = c.benchmark_group("predict_ensemble_width");
    group.sample_size(10);

    for &n_models in &[1usize, 3, 5] {
        let source = source_for(256);
        let predictor = predictor_for(n_models, PredictConfig::default().with_tta(false));

        group.bench_with_input(
            BenchmarkId::from_parameter(n_models),
            &n_models,
            |b, _| {
                b.iter(|| predictor.predict(black_box(&source)));
            },
        );
    }

    group.finish();
}

fn bench_predict_tta(c: &mut Criterion) {
    let mut group = c.benchmark_group("predict_tta");
    group.sample_size(10);

    for &use_tta in &[false, true] {
        let source = source_for(256);
        let predictor = predictor_for(1, PredictConfig::default().with_tta(use_tta));

        group.bench_with_input(
            BenchmarkId::from_parameter(use_tta),
            &use_tta,
            |b, _| {
                b.iter(|| predictor.predict(black_box(&source)));
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_gaussian_importance_map,
    bench_predict_image_sizes,
    bench_predict_ensemble_width,
    bench_predict_tta
);
criterion_main!(benches);
