use ndarray::{Array2, array};
use smcpp_rs::inference::InferenceManager;
use smcpp_rs::sfs::EmissionModel;
use smcpp_rs::{EngineError, ParameterVector, WorkerPool};
use std::sync::Arc;

fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
    (a - b).abs() <= tol * (1.0 + a.abs().max(b.abs()))
}

fn pool(threads: usize) -> Arc<WorkerPool> {
    Arc::new(WorkerPool::new(threads).expect("failed to start pool"))
}

fn one_pop_sequences() -> Vec<Array2<i32>> {
    vec![
        array![[200, 0, 0, 2], [1, 1, 0, 2], [150, 0, 0, 2], [1, 0, 1, 2], [80, 0, 0, 2]],
        array![[40, -1, 0, 0], [120, 0, 0, 2], [1, 0, 2, 2], [60, 0, 0, 2]],
        array![[300, 0, 0, 2], [1, 1, 0, 1], [10, 0, 0, 1]],
    ]
}

fn manager_for(threads: usize) -> InferenceManager {
    let mut m = InferenceManager::new(
        EmissionModel::one_pop(2),
        one_pop_sequences(),
        vec![0.0, 0.1, 0.5, 1.5, f64::INFINITY],
        pool(threads),
    )
    .expect("valid manager");
    m.set_theta(0.004).expect("valid theta");
    m.set_rho(0.002).expect("valid rho");
    m.set_params(&ParameterVector::new(vec![1.0, 0.4, 2.0], vec![0.3, 0.7, 1.0]))
        .expect("valid parameters");
    m
}

#[test]
fn degenerate_model_has_zero_likelihood_and_q() {
    let obs = vec![
        array![[10, 0, 0, 2], [5, 0, 0, 2]],
        array![[3, 0, 0, 2]],
        array![[7, 0, 0, 2], [1, -1, 0, 0]],
    ];
    let mut m = InferenceManager::new(
        EmissionModel::one_pop(2),
        obs,
        vec![0.0, f64::INFINITY],
        pool(2),
    )
    .expect("valid manager");
    m.set_rho(0.0).expect("valid rho");
    m.set_theta(0.0).expect("valid theta");
    m.set_params(&ParameterVector::constant(1.0)).expect("valid parameters");
    m.e_step(false).expect("e-step");

    assert_eq!(m.transition().dim(), (1, 1));
    assert!(approx_eq(m.transition()[(0, 0)].value(), 1.0, 1e-12));
    for ll in m.loglik().expect("loglik") {
        assert!(ll.abs() < 1e-12);
    }
    let q = m.q().expect("q");
    assert_eq!(q.len(), 3);
    for term in &q {
        assert!(term.value().abs() < 1e-12);
    }
}

#[test]
fn repeated_rho_leaves_matrices_and_results_untouched() {
    let mut m = InferenceManager::new(
        EmissionModel::one_pop(2),
        one_pop_sequences(),
        vec![0.0, 1.0, f64::INFINITY],
        pool(3),
    )
    .expect("valid manager");
    m.set_theta(0.004).expect("valid theta");
    m.set_params(&ParameterVector::constant(1.0)).expect("valid parameters");
    m.set_rho(0.1).expect("valid rho");
    m.e_step(false).expect("first e-step");
    let counts = m.recompute_counts();
    let evaluations = m.expm_evaluations();
    let q1 = m.q().expect("q");
    let ll1 = m.loglik().expect("loglik");

    m.set_rho(0.1).expect("valid rho");
    assert!(m.dirty().is_clean());
    m.e_step(false).expect("second e-step");
    assert_eq!(m.recompute_counts(), counts);
    assert_eq!(m.expm_evaluations(), evaluations);
    assert_eq!(m.q().expect("q"), q1);
    assert_eq!(m.loglik().expect("loglik"), ll1);
}

#[test]
fn setters_only_rebuild_what_depends_on_them() {
    let mut m = manager_for(2);
    m.e_step(false).expect("e-step");
    let c0 = m.recompute_counts();
    assert_eq!((c0.initial, c0.transition, c0.emission), (1, 1, 1));

    m.set_rho(0.003).expect("valid rho");
    m.e_step(false).expect("e-step after rho");
    let c1 = m.recompute_counts();
    assert_eq!((c1.initial, c1.transition, c1.emission), (1, 2, 1));

    m.set_theta(0.005).expect("valid theta");
    m.e_step(false).expect("e-step after theta");
    let c2 = m.recompute_counts();
    assert_eq!((c2.initial, c2.transition, c2.emission), (1, 2, 2));

    m.set_params(&ParameterVector::new(vec![1.1, 0.4, 2.0], vec![0.3, 0.7, 1.0]))
        .expect("valid parameters");
    m.e_step(false).expect("e-step after params");
    let c3 = m.recompute_counts();
    assert_eq!((c3.initial, c3.transition, c3.emission), (2, 3, 3));
    assert!(m.dirty().is_clean());
}

#[test]
fn failing_sequence_reports_error_and_others_get_fresh_statistics() {
    let mut obs = Vec::new();
    for i in 0..5 {
        if i == 2 {
            // two derived alleles in the distinguished pair has no mass
            obs.push(array![[20, 0, 0, 2], [1, 2, 0, 2], [20, 0, 0, 2]]);
        } else {
            obs.push(array![[50 + i, 0, 0, 2], [1, 1, 0, 2], [30, 0, 0, 2]]);
        }
    }
    let mut m = InferenceManager::new(
        EmissionModel::one_pop(2),
        obs,
        vec![0.0, 0.5, f64::INFINITY],
        pool(4),
    )
    .expect("valid manager");
    m.set_theta(0.01).expect("valid theta");
    m.set_rho(0.01).expect("valid rho");
    m.set_params(&ParameterVector::constant(1.0)).expect("valid parameters");

    match m.e_step(true) {
        Err(EngineError::InstanceComputation { index, .. }) => assert_eq!(index, 2),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(()) => panic!("e-step should fail for sequence 2"),
    }
    let gammas = m.gammas();
    for (i, g) in gammas.iter().enumerate() {
        if i == 2 {
            assert!(g.is_none());
        } else {
            let g = g.as_ref().expect("fresh gamma");
            assert_eq!(g.dim(), (2, 3));
            for r in 0..3 {
                assert!(approx_eq(g.column(r).sum(), 1.0, 1e-9));
            }
        }
    }
    assert!(matches!(m.loglik(), Err(EngineError::NoStatistics(2))));
}

#[test]
fn estep_requires_parameters() {
    let mut m = InferenceManager::new(
        EmissionModel::one_pop(2),
        one_pop_sequences(),
        vec![0.0, 1.0, f64::INFINITY],
        pool(1),
    )
    .expect("valid manager");
    assert!(matches!(m.e_step(false), Err(EngineError::ParamsNotSet)));
    assert!(matches!(m.loglik(), Err(EngineError::NoStatistics(0))));
}

#[test]
fn construction_validates_observations_and_boundaries() {
    let hs = vec![0.0, 1.0, f64::INFINITY];
    let bad_cols = vec![array![[1, 0, 0]]];
    assert!(InferenceManager::new(EmissionModel::one_pop(2), bad_cols, hs.clone(), pool(1)).is_err());

    let zero_span = vec![array![[0, 0, 0, 2]]];
    assert!(InferenceManager::new(EmissionModel::one_pop(2), zero_span, hs.clone(), pool(1)).is_err());

    let too_many = vec![array![[1, 0, 3, 2]]];
    assert!(InferenceManager::new(EmissionModel::one_pop(2), too_many, hs.clone(), pool(1)).is_err());

    let finite_end = vec![0.0, 1.0, 2.0];
    assert!(
        InferenceManager::new(EmissionModel::one_pop(2), one_pop_sequences(), finite_end, pool(1))
            .is_err()
    );
    assert!(InferenceManager::new(EmissionModel::one_pop(2), Vec::new(), hs, pool(1)).is_err());
}

#[test]
fn results_do_not_depend_on_thread_count() {
    let mut serial = manager_for(1);
    let mut parallel = manager_for(4);
    serial.e_step(true).expect("serial e-step");
    parallel.e_step(true).expect("parallel e-step");
    assert_eq!(serial.loglik().unwrap(), parallel.loglik().unwrap());
    assert_eq!(serial.q().unwrap(), parallel.q().unwrap());
    for (a, b) in serial.xisums().iter().zip(parallel.xisums().iter()) {
        assert_eq!(a.as_deref(), b.as_deref());
    }
}

#[test]
fn posterior_mass_and_targets_cover_observed_keys() {
    let mut m = manager_for(2);
    m.e_step(false).expect("e-step");

    // distinct keys across all sequences
    assert_eq!(m.emission_probs().len(), 7);
    assert_eq!(m.targets().len(), 7 * 4);
    assert!(approx_eq(m.pi().iter().map(|p| p.value()).sum(), 1.0, 1e-12));

    let sites = [432.0, 221.0, 311.0];
    for (i, sums) in m.gamma_sums().iter().enumerate() {
        let sums = sums.as_ref().expect("gamma sums");
        let total: f64 = sums.values().flat_map(|v| v.iter()).sum();
        assert!(approx_eq(total, sites[i], 1e-9));
    }
    for (i, xi) in m.xisums().iter().enumerate() {
        let xi = xi.as_ref().expect("xi sums");
        assert!(approx_eq(xi.sum(), sites[i] - 1.0, 1e-9));
    }
    assert!(m.gammas().iter().all(Option::is_none));

    let q = m.q().expect("q");
    assert!(q.iter().all(|t| t.value() <= 0.0));
    assert_eq!(q[2].n_derivatives(), 3);
}

#[test]
fn raw_buffers_build_the_same_manager() {
    let a = [100, 0, 0, 2, 1, 1, 0, 2, 50, 0, 0, 2];
    let b = [70, 0, 0, 2];
    let mut m = InferenceManager::from_raw(
        EmissionModel::one_pop(2),
        &[3, 1],
        &[&a, &b],
        vec![0.0, 1.0, f64::INFINITY],
        pool(2),
    )
    .expect("valid manager");
    m.set_theta(0.01).expect("valid theta");
    m.set_rho(0.01).expect("valid rho");
    m.set_params(&ParameterVector::constant(1.0)).expect("valid parameters");
    m.e_step(false).expect("e-step");
    assert_eq!(m.n_sequences(), 2);
    let ll = m.loglik().expect("loglik");
    assert!(ll[0] < ll[1]);
}

#[test]
fn two_population_tables_drive_the_emissions() {
    let obs = vec![
        array![
            [50, 0, 0, 1, 0, 0, 1],
            [1, 1, 0, 1, 0, 0, 1],
            [30, 0, 0, 1, 0, 1, 1],
            [10, -1, 0, 0, 0, 0, 1]
        ],
        array![[40, 0, 0, 1, 0, 0, 1], [1, 0, 1, 1, 0, 0, 1]],
    ];
    let mut m = InferenceManager::new(
        EmissionModel::two_pop(1, 1),
        obs,
        vec![0.0, 0.5, f64::INFINITY],
        pool(2),
    )
    .expect("valid manager");
    m.set_theta(0.01).expect("valid theta");
    m.set_rho(0.005).expect("valid rho");

    let params = ParameterVector::constant(1.0);
    m.set_params(&params).expect("valid parameters");
    assert!(matches!(m.e_step(false), Err(EngineError::MissingEmissionTables)));

    let tables: Vec<Array2<f64>> = (0..2)
        .map(|k| {
            let mut t = Array2::<f64>::zeros((6, 6));
            t[(2, 0)] = 1.0 + k as f64;
            t[(0, 1)] = 0.5;
            t[(1, 0)] = 0.25;
            t
        })
        .collect();
    assert!(m.set_params_with_sfs(&params, tables[..1].to_vec()).is_err());
    m.set_params_with_sfs(&params, tables).expect("valid tables");
    m.e_step(false).expect("e-step");

    assert_eq!(m.npop(), 2);
    assert_eq!(m.emission().dim(), (2, 36));
    for k in 0..2 {
        let row: f64 = m.emission().row(k).iter().map(|x| x.value()).sum();
        assert!(approx_eq(row, 1.0, 1e-12));
    }
    let ll = m.loglik().expect("loglik");
    assert!(ll.iter().all(|x| x.is_finite() && *x < 0.0));
}

#[test]
fn failed_emission_rebuild_is_retried_alone() {
    let mut m = InferenceManager::new(
        EmissionModel::one_pop(2),
        one_pop_sequences(),
        vec![0.0, 0.5, f64::INFINITY],
        pool(2),
    )
    .expect("valid manager");
    m.set_params(&ParameterVector::constant(1.0)).expect("valid parameters");
    m.set_rho(0.01).expect("valid rho");
    // large enough to push the monomorphic cell below zero
    m.set_theta(0.6).expect("valid theta");

    assert!(matches!(m.e_step(false), Err(EngineError::InvalidParameters(_))));
    let c = m.recompute_counts();
    assert_eq!((c.initial, c.transition, c.emission), (1, 1, 0));
    let d = m.dirty();
    assert!(d.theta && d.eta && !d.rho);
    let evaluations = m.expm_evaluations();
    assert!(evaluations > 0);

    m.set_theta(0.01).expect("valid theta");
    m.e_step(false).expect("retried e-step");
    let c = m.recompute_counts();
    assert_eq!((c.initial, c.transition, c.emission), (1, 1, 1));
    assert_eq!(m.expm_evaluations(), evaluations);
    assert!(m.dirty().is_clean());

    // rho changed after the partial failure still rebuilds the transition only
    m.set_theta(0.6).expect("valid theta");
    assert!(m.e_step(false).is_err());
    m.set_rho(0.02).expect("valid rho");
    m.set_theta(0.02).expect("valid theta");
    m.e_step(false).expect("e-step");
    let c = m.recompute_counts();
    assert_eq!((c.initial, c.transition, c.emission), (1, 2, 2));
}

#[test]
fn theta_and_rho_must_be_finite_and_non_negative() {
    let mut m = manager_for(1);
    assert!(matches!(m.set_theta(-0.01), Err(EngineError::InvalidParameters(_))));
    assert!(matches!(m.set_theta(f64::NAN), Err(EngineError::InvalidParameters(_))));
    assert!(matches!(m.set_rho(-1.0), Err(EngineError::InvalidParameters(_))));
    assert!(matches!(m.set_rho(f64::INFINITY), Err(EngineError::InvalidParameters(_))));
    assert_eq!(m.theta(), 0.004);
    assert_eq!(m.rho(), 0.002);

    m.e_step(false).expect("e-step");
    assert!(m.set_theta(-0.01).is_err());
    assert!(m.dirty().is_clean());
}

#[test]
fn theta_too_large_for_probabilities_is_rejected_before_dispatch() {
    let obs = vec![array![[100, 0, 0, 2]], array![[80, 0, 0, 2]]];
    let mut m = InferenceManager::new(
        EmissionModel::one_pop(2),
        obs,
        vec![0.0, 0.5, f64::INFINITY],
        pool(2),
    )
    .expect("valid manager");
    m.set_params(&ParameterVector::constant(1.0)).expect("valid parameters");
    m.set_theta(0.6).expect("valid theta");
    assert!(matches!(m.e_step(false), Err(EngineError::InvalidParameters(_))));
    assert!(matches!(m.loglik(), Err(EngineError::NoStatistics(0))));

    m.set_theta(0.001).expect("valid theta");
    m.e_step(false).expect("e-step");
    assert!(m.loglik().expect("loglik").iter().all(|ll| *ll < 0.0));
}

#[test]
fn rho_and_params_changes_start_a_fresh_transition_cache() {
    let mut m = manager_for(2);
    m.e_step(false).expect("e-step");
    let evaluations = m.expm_evaluations();
    assert!(evaluations > 0);
    let t1 = m.transition().clone();

    m.set_rho(0.004).expect("valid rho");
    assert_eq!(m.expm_evaluations(), 0);
    m.e_step(false).expect("e-step after rho");
    assert_eq!(m.expm_evaluations(), evaluations);
    let t2 = m.transition().clone();
    assert_ne!(t1[(0, 1)].value(), t2[(0, 1)].value());

    m.set_params(&ParameterVector::new(vec![1.5, 0.4, 2.0], vec![0.3, 0.7, 1.0]))
        .expect("valid parameters");
    assert_eq!(m.expm_evaluations(), 0);
    m.e_step(false).expect("e-step after params");
    assert_eq!(m.expm_evaluations(), evaluations);
    let t3 = m.transition().clone();
    assert_ne!(t2[(0, 1)].value(), t3[(0, 1)].value());
}
