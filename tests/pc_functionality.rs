use approx::assert_relative_eq;
use givrs::heteropca::{ImputeMethod, PcaAlgorithm, PcaConfig};
use givrs::simulation::{simulate_data, SimParam, SimulatedPanel};
use givrs::{
    estimate, FormulaSpec, GivError, GivOptions, GivProblem, Guess, SolverState,
};
use nalgebra::DMatrix;

/// 20 entities over 10 periods with equal sizes `S = 1/20`.
fn small_panel(factors: usize) -> SimulatedPanel {
    simulate_data(
        &SimParam::default()
            .with_entities(20)
            .with_periods(10)
            .with_factors(factors)
            .with_size_concentration(0.0)
            .with_dispersion(0.0)
            .with_factor_scale(3.0)
            .with_idiosyncratic_scale(0.5)
            .with_exogenous(2)
            .with_seed(42),
    )
    .unwrap()
}

#[test]
fn no_factors_converges_in_one_iteration() {
    let simulated = small_panel(0);
    let formula = FormulaSpec::new("q", "p");
    let result = estimate(
        &simulated.panel,
        &formula,
        &Guess::Scalar(-2.0),
        &GivOptions::default(),
    )
    .unwrap();

    assert!(result.converged());
    assert_eq!(result.iterations(), 1);
    assert_eq!(result.n_pcs(), 0);
    assert!(result.pc_factors().is_none());
    assert!(result.pc_loadings().is_none());
    assert!(result.factor_model().is_none());
}

#[test]
fn two_factors_with_default_configuration() {
    let simulated = small_panel(2);
    let formula = FormulaSpec::new("q", "p").pc(2);
    let result = estimate(
        &simulated.panel,
        &formula,
        &Guess::Scalar(-2.0),
        &GivOptions::default(),
    )
    .unwrap();

    assert!(matches!(
        result.state(),
        SolverState::Converged | SolverState::MaxIterReached
    ));
    assert_eq!(result.n_pcs(), 2);
    assert_eq!(result.pc_factors().unwrap().shape(), (10, 2));
    let loadings = result.pc_loadings().unwrap();
    assert_eq!(loadings.shape(), (20, 2));
    assert_relative_eq!(loadings.transpose() * loadings, DMatrix::identity(2, 2), epsilon = 1e-8);
    assert_eq!(result.factor_coefficients().unwrap().shape(), (20, 2));
    assert_eq!(result.entity_coefficient_names(), ["pc_1", "pc_2"]);
}

#[test]
fn mismatched_guess_fails_before_iterating() {
    let simulated = small_panel(0);
    let problem =
        GivProblem::new(simulated.panel, FormulaSpec::new("q", "p").heterogeneous()).unwrap();
    let error = problem
        .estimate(&Guess::PerEntity(vec![-2.0; 19]), &GivOptions::default())
        .unwrap_err();
    assert!(matches!(
        error,
        GivError::GuessDimension {
            expected: 20,
            found: 19
        }
    ));
}

#[test]
fn factor_count_is_bounded_by_panel_dimensions() {
    let simulated = small_panel(0);
    let problem =
        GivProblem::new(simulated.panel.clone(), FormulaSpec::new("q", "p").pc(10)).unwrap();
    let error = problem
        .solver(&Guess::Scalar(-2.0), &GivOptions::default())
        .unwrap_err();
    assert!(matches!(
        error,
        GivError::InvalidFactorCount {
            requested: 10,
            max: 9
        }
    ));

    let problem = GivProblem::new(simulated.panel, FormulaSpec::new("q", "p").pc(9)).unwrap();
    assert!(problem
        .solver(&Guess::Scalar(-2.0), &GivOptions::default())
        .is_ok());
}

/// `q + id & endog(p) ~ x1 + pc(2)` with a per-entity guess and the augmented panel saved.
#[test]
fn heterogeneous_coefficients_with_factors_and_saved_panel() {
    let simulated = small_panel(2);
    let formula = FormulaSpec::new("q", "p").heterogeneous().pooled("x1").pc(2);
    let options = GivOptions::default().with_save_panel(true);
    let result = estimate(
        &simulated.panel,
        &formula,
        &Guess::PerEntity(vec![-2.0; 20]),
        &options,
    )
    .unwrap();

    let k = result.n_pcs();
    assert!((1..=2).contains(&k));
    assert_eq!(result.pc_factors().unwrap().shape(), (10, k));
    assert_eq!(result.pc_loadings().unwrap().shape(), (20, k));
    assert_eq!(result.coefficients().len(), 20);
    assert!(result.pooled_coefficient("x1").unwrap().is_finite());

    let augmented = result.augmented_panel().unwrap();
    assert_eq!(augmented.len(), 200);
    assert!(augmented.pc_names.iter().all(|name| name.starts_with("pc_")));
    assert!(augmented.rows().iter().all(|row| row.pcs.len() == k));
}

/// `q + endog(p) ~ x1 + x2 + pc(3)` with a custom factor configuration.
#[test]
fn custom_pca_configuration_from_json() {
    let pca: PcaConfig = serde_json::from_str(
        r#"{
            "impute_method": "zero",
            "demean": true,
            "maxiter": 50,
            "algorithm": "DeflatedHeteroPCA",
            "algorithm_options": { "t_block": 5, "condition_number_threshold": 3.0 }
        }"#,
    )
    .unwrap();
    assert_eq!(pca.impute_method, ImputeMethod::Zero);
    assert_eq!(pca.algorithm, PcaAlgorithm::DeflatedHeteroPca);

    let simulated = small_panel(2);
    let formula = FormulaSpec::new("q", "p").pooled("x1").pooled("x2").pc(3);
    let options = GivOptions::default().with_pca(pca).with_save_panel(true);
    let result = estimate(&simulated.panel, &formula, &Guess::Scalar(-2.0), &options).unwrap();

    let k = result.n_pcs();
    assert!((1..=3).contains(&k));
    assert_eq!(result.pc_factors().unwrap().shape(), (10, k));
    assert!(result.factor_model().unwrap().condition_number() <= 3.0);
}

/// `q + endog(p) ~ x1 + x2` without factors.
#[test]
fn control_case_without_factors() {
    let simulated = small_panel(0);
    let formula = FormulaSpec::new("q", "p").pooled("x1").pooled("x2");
    let result = estimate(
        &simulated.panel,
        &formula,
        &Guess::Scalar(-2.0),
        &GivOptions::default(),
    )
    .unwrap();

    assert!(result.converged());
    assert_eq!(result.n_pcs(), 0);
    assert!(result.pc_factors().is_none());
    assert!(result.pc_loadings().is_none());
    assert!(result.augmented_panel().is_none());
    assert!(result.coefficients()[0].is_finite());
    assert_relative_eq!(
        result.aggregate_coefficient(),
        result.coefficients()[0],
        epsilon = 1e-12
    );
}

#[test]
fn result_serializes_to_json() {
    let simulated = small_panel(0);
    let result = estimate(
        &simulated.panel,
        &FormulaSpec::new("q", "p"),
        &Guess::Scalar(-2.0),
        &GivOptions::default(),
    )
    .unwrap();
    let json = serde_json::to_value(&result).unwrap();
    assert_eq!(json["state"], "converged");
    assert_eq!(json["formula"], "q + endog(p) ~ 0");
    assert!(json["factor_model"].is_null());
}
