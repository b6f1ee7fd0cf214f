use approx::assert_relative_eq;
use givrs::simulation::{simulate_data, SimParam, SimulatedPanel};
use givrs::{
    estimate, Algorithm, FactorSchedule, FormulaSpec, GivError, GivOptions, Guess, Observation,
    PanelBuilder, SolverState, Strictness, WeightingMatrix,
};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};

fn simulate(param: SimParam) -> SimulatedPanel {
    simulate_data(&param).unwrap()
}

fn median(mut values: Vec<f64>) -> f64 {
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        0.5 * (values[mid - 1] + values[mid])
    } else {
        values[mid]
    }
}

fn absolute_errors(estimates: &[f64], truth: &[f64]) -> Vec<f64> {
    estimates
        .iter()
        .zip(truth)
        .map(|(estimate, truth)| (estimate - truth).abs())
        .collect()
}

#[test]
fn without_factors_estimate_is_closed_form_iv() {
    let simulated = simulate(
        SimParam::default()
            .with_entities(8)
            .with_periods(200)
            .with_factors(0)
            .with_dispersion(0.0)
            .with_seed(23),
    );
    let panel = &simulated.panel;
    let guess = -1.5;
    let result = estimate(
        panel,
        &FormulaSpec::new("q", "p"),
        &Guess::Scalar(guess),
        &GivOptions::default(),
    )
    .unwrap();

    let (mut numerator, mut denominator) = (0.0, 0.0);
    for t in 0..panel.time_count() {
        let residual = |j: usize| panel.outcome()[(j, t)] - guess * panel.price()[(j, t)];
        for i in 0..panel.entity_count() {
            let instrument: f64 = (0..panel.entity_count())
                .filter(|&j| j != i)
                .map(|j| panel.weights()[(j, t)] * residual(j))
                .sum();
            numerator += panel.outcome()[(i, t)] * instrument;
            denominator += panel.price()[(i, t)] * instrument;
        }
    }

    assert!(result.converged());
    assert_eq!(result.iterations(), 1);
    assert_relative_eq!(result.coefficients()[0], numerator / denominator, epsilon = 1e-8);
}

#[test]
fn without_factors_every_draw_converges_in_one_pass() {
    let (n, t) = (20, 60);
    for seed in 0..20 {
        let mut rng = SmallRng::seed_from_u64(seed);
        let mut draw = || -> f64 { StandardNormal.sample(&mut rng) };
        let prices: Vec<f64> = (0..t).map(|_| draw()).collect();
        let mut rows = Vec::with_capacity(n * t);
        for i in 0..n {
            for (s, price) in prices.iter().enumerate() {
                rows.push(
                    Observation::new((i + 1).to_string(), s as i64 + 1, draw(), *price, 1.0 / 20.0)
                        .with_exogenous(vec![draw(), draw()]),
                );
            }
        }
        let panel = PanelBuilder::new(["x1", "x2"]).observations(rows).build().unwrap();
        let formula = FormulaSpec::new("q", "p").pooled("x1").pooled("x2");

        let result =
            estimate(&panel, &formula, &Guess::Scalar(0.5), &GivOptions::default()).unwrap();
        assert_eq!(result.state(), SolverState::Converged, "seed {seed}");
        assert_eq!(result.iterations(), 1, "seed {seed}");
        assert!(result.coefficients()[0].is_finite(), "seed {seed}");
    }
}

#[test]
fn heterogeneous_coefficients_recovered_without_factors() {
    let simulated = simulate(
        SimParam::default()
            .with_entities(20)
            .with_periods(2000)
            .with_factors(0)
            .with_seed(31),
    );
    let truth: Vec<f64> = simulated.coefficients.iter().copied().collect();
    let result = estimate(
        &simulated.panel,
        &FormulaSpec::new("q", "p").heterogeneous(),
        &Guess::PerEntity(truth.clone()),
        &GivOptions::default(),
    )
    .unwrap();

    assert!(result.converged());
    let estimates: Vec<f64> = result.coefficients().iter().copied().collect();
    assert!(median(absolute_errors(&estimates, &truth)) < 0.5);
    let aggregate = simulated.weights.dot(&simulated.coefficients);
    assert!((result.aggregate_coefficient() - aggregate).abs() < 0.25);
}

fn factor_panel(missing_share: f64) -> SimulatedPanel {
    simulate(
        SimParam::default()
            .with_entities(15)
            .with_periods(1500)
            .with_factors(2)
            .with_size_concentration(1.5)
            .with_dispersion(0.3)
            .with_missing_share(missing_share)
            .with_seed(5),
    )
}

fn assert_recovers(simulated: &SimulatedPanel, options: &GivOptions) -> givrs::ModelResult {
    let formula = FormulaSpec::new("q", "p").heterogeneous().pc(2);
    let result = estimate(&simulated.panel, &formula, &Guess::Scalar(-2.0), options).unwrap();

    let truth: Vec<f64> = simulated.coefficients.iter().copied().collect();
    let estimates: Vec<f64> = result.coefficients().iter().copied().collect();
    let error = median(absolute_errors(&estimates, &truth));
    assert!(error < 1.0, "median coefficient error {error}");
    let aggregate = simulated.weights.dot(&simulated.coefficients);
    let aggregate_error = (result.aggregate_coefficient() - aggregate).abs();
    assert!(aggregate_error < 0.75, "aggregate error {aggregate_error}");
    result
}

#[test]
fn coupled_factor_updates_recover_heterogeneous_coefficients() {
    let simulated = factor_panel(0.0);
    let options = GivOptions::default().with_max_iter(25);
    let result = assert_recovers(&simulated, &options);

    assert!(matches!(
        result.state(),
        SolverState::Converged | SolverState::MaxIterReached
    ));
    assert!(result.iterations() > 1);
    assert!(result.history().iter().skip(1).all(|step| step.factor_change.is_some()));
}

#[test]
fn coupled_factor_updates_tolerate_missing_cells() {
    let simulated = factor_panel(0.1);
    let options = GivOptions::default().with_max_iter(25);
    let result = assert_recovers(&simulated, &options);

    let missing = simulated.panel.missing_mask();
    let residuals = result.residuals();
    for i in 0..simulated.panel.entity_count() {
        for t in 0..simulated.panel.time_count() {
            assert_eq!(missing[(i, t)], residuals[(i, t)].is_nan());
        }
    }
}

#[test]
fn factors_extracted_once_recover_heterogeneous_coefficients() {
    let simulated = factor_panel(0.0);
    let options = GivOptions::default().with_factor_schedule(FactorSchedule::Once);
    let result = assert_recovers(&simulated, &options);

    assert_eq!(result.iterations(), 1);
    assert_eq!(result.history()[0].factor_change, None);
    assert_eq!(result.n_pcs(), 2);
}

#[test]
fn gmm_recovers_homogeneous_coefficient_with_unequal_sizes() {
    let simulated = simulate(
        SimParam::default()
            .with_periods(2000)
            .with_factors(0)
            .with_dispersion(0.0)
            .with_seed(12),
    );
    let options = GivOptions::default().with_algorithm(Algorithm::Gmm);
    let result = estimate(
        &simulated.panel,
        &FormulaSpec::new("q", "p"),
        &Guess::Scalar(-2.0),
        &options,
    )
    .unwrap();

    assert!(result.converged());
    assert_eq!(result.iterations(), 1);
    assert!((result.coefficients()[0] - simulated.coefficients[0]).abs() < 0.25);
}

#[test]
fn identity_weighting_matches_inverse_ztz_when_exactly_identified() {
    let simulated = simulate(
        SimParam::default()
            .with_entities(8)
            .with_periods(500)
            .with_factors(0)
            .with_exogenous(1)
            .with_seed(44),
    );
    let formula = FormulaSpec::new("q", "p").heterogeneous().pooled("x1");
    let guess = Guess::PerEntity(simulated.coefficients.iter().copied().collect());
    let run = |weighting| {
        let options = GivOptions::default().with_weighting(weighting);
        estimate(&simulated.panel, &formula, &guess, &options).unwrap()
    };
    let inverse = run(WeightingMatrix::InverseZTZ);
    let identity = run(WeightingMatrix::Identity);

    assert!(inverse.converged() && identity.converged());
    assert_relative_eq!(inverse.coefficients(), identity.coefficients(), epsilon = 1e-8);
    let beta = identity.pooled_coefficient("x1").unwrap();
    assert!((beta - simulated.pooled_coefficients[0]).abs() < 0.1);
}

#[test]
fn without_factors_missing_cells_leave_nan_residuals() {
    let simulated = simulate(
        SimParam::default()
            .with_periods(2000)
            .with_factors(0)
            .with_dispersion(0.0)
            .with_missing_share(0.1)
            .with_seed(8),
    );
    let result = estimate(
        &simulated.panel,
        &FormulaSpec::new("q", "p"),
        &Guess::Scalar(-2.0),
        &GivOptions::default(),
    )
    .unwrap();

    assert!(result.converged());
    assert!((result.coefficients()[0] - simulated.coefficients[0]).abs() < 0.25);
    let missing = simulated.panel.missing_mask();
    assert!(missing.iter().any(|flag| *flag));
    for (flag, residual) in missing.iter().zip(result.residuals().iter()) {
        assert_eq!(*flag, residual.is_nan());
    }
}

#[test]
fn strict_mode_reports_non_convergence() {
    let simulated = simulate(SimParam::default().with_entities(12).with_periods(80).with_seed(9));
    let formula = FormulaSpec::new("q", "p").heterogeneous().pc(1);
    let strict = GivOptions::default()
        .with_max_iter(1)
        .with_strictness(Strictness::Strict);
    let error = estimate(&simulated.panel, &formula, &Guess::Scalar(-2.0), &strict).unwrap_err();
    assert!(matches!(error, GivError::NotConverged { iterations: 1, .. }));

    let lenient = GivOptions::default().with_max_iter(1);
    let result = estimate(&simulated.panel, &formula, &Guess::Scalar(-2.0), &lenient).unwrap();
    assert_eq!(result.state(), SolverState::MaxIterReached);
}
