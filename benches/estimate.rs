use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use givrs::heteropca::{HeteroPca, PcaConfig};
use givrs::simulation::{simulate_data, SimParam};
use givrs::{estimate, FormulaSpec, GivOptions, Guess};
use std::hint::black_box;
use std::time::Duration;

fn bench_estimate(c: &mut Criterion) {
    let mut group = c.benchmark_group("giv_estimate");
    group.sample_size(10);
    group.measurement_time(Duration::from_secs(10));

    for &(n, t) in &[(20usize, 100usize), (50, 200)] {
        let label = format!("{n}x{t}");
        let simulated = simulate_data(
            &SimParam::default()
                .with_entities(n)
                .with_periods(t)
                .with_exogenous(1)
                .with_seed(7),
        )
        .expect("simulated panel");
        let panel = simulated.panel;

        let plain = FormulaSpec::new("q", "p").heterogeneous().pooled("x1").fixed_effects();
        group.bench_with_input(BenchmarkId::new("iv", &label), &(), |b, _| {
            b.iter(|| {
                black_box(estimate(&panel, &plain, &Guess::Scalar(-2.0), &GivOptions::default()))
            })
        });

        let factors = plain.clone().pc(2);
        let options = GivOptions::default().with_max_iter(10);
        group.bench_with_input(BenchmarkId::new("iv_pc2", &label), &(), |b, _| {
            b.iter(|| black_box(estimate(&panel, &factors, &Guess::Scalar(-2.0), &options)))
        });
    }
    group.finish();

    let mut pca = c.benchmark_group("heteropca");
    pca.sample_size(20);
    for &(n, t) in &[(50usize, 200usize), (200, 500)] {
        let simulated = simulate_data(
            &SimParam::default()
                .with_entities(n)
                .with_periods(t)
                .with_factors(3)
                .with_missing_share(0.1)
                .with_seed(3),
        )
        .expect("simulated panel");
        let panel = simulated.panel;
        let fitter = HeteroPca::new(PcaConfig::default());
        pca.bench_with_input(BenchmarkId::new("deflated", format!("{n}x{t}")), &(), |b, _| {
            b.iter(|| black_box(fitter.fit(panel.outcome(), panel.observed(), 3)))
        });
    }
    pca.finish();
}

criterion_group!(benches, bench_estimate);
criterion_main!(benches);
