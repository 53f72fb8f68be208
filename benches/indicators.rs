use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use strategy_evaluator::market::indicators::{compute, lookback};
use strategy_evaluator::portfolio::blocks::models::FunctionName;

fn make_closes(n: usize) -> Vec<f64> {
    (0..n)
        .map(|i| 100.0 + (i as f64 * 0.1).sin() * 10.0)
        .collect()
}

fn bench_indicators(c: &mut Criterion) {
    let mut group = c.benchmark_group("indicators");
    for function in FunctionName::ALL {
        let windows: Vec<Option<u32>> = if function.requires_window_of_days() {
            vec![Some(20), Some(252)]
        } else {
            vec![None]
        };
        for window in windows {
            let closes = make_closes(lookback(function, window.unwrap_or(1) as usize));
            group.bench_with_input(
                BenchmarkId::new(function.to_string(), window.unwrap_or(0)),
                &closes,
                |b, closes| b.iter(|| compute(black_box(function), window, black_box(closes))),
            );
        }
    }
    group.finish();
}

criterion_group!(benches, bench_indicators);
criterion_main!(benches);
