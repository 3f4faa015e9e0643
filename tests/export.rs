use classo::export::load;
use classo::{
    ExportSink, FormulationConfig, ModelSelectionConfig, Problem, StabilityMethod, export, solve,
};
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::fs;
use tempfile::tempdir;

fn small_problem() -> Problem {
    let mut rng = StdRng::seed_from_u64(9);
    let x = Array2::from_shape_fn((40, 6), |_| rng.sample::<f64, _>(StandardNormal));
    let mut beta = Array1::zeros(6);
    beta[0] = 1.5;
    beta[2] = -1.5;
    let noise = Array1::from_shape_fn(40, |_| 0.3 * rng.sample::<f64, _>(StandardNormal));
    let y = x.dot(&beta) + noise;
    let labels = (0..6).map(|j| format!("taxon_{j}")).collect();
    Problem::zero_sum(x, y, Some(labels)).unwrap()
}

#[test]
fn exported_solution_loads_back_identically() {
    let mut selection = ModelSelectionConfig {
        lam_fixed: true,
        path: true,
        cv: true,
        ..Default::default()
    };
    selection.path_parameters.n_lam = 10;
    selection.cv_parameters.n_lam = 10;
    selection.cv_parameters.n_folds = 4;
    selection.stab_sel_parameters.method = StabilityMethod::Max;
    selection.stab_sel_parameters.b = 8;
    selection.stab_sel_parameters.n_lam = 10;
    let formulation = FormulationConfig {
        intercept: true,
        ..Default::default()
    };
    let solution = solve(&small_problem(), &formulation, &selection).unwrap();

    let dir = tempdir().unwrap();
    let sink = ExportSink::new(dir.path(), "run1-");
    let written = export(&solution, &sink).unwrap();

    let names: Vec<String> = written
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(
        names,
        vec![
            "run1-solution.toml",
            "run1-path.csv",
            "run1-cv.csv",
            "run1-stability.csv",
            "run1-stability-path.csv",
        ]
    );

    let loaded = load(&written[0]).unwrap();
    assert_eq!(loaded, solution);

    let path_csv = fs::read_to_string(dir.path().join("run1-path.csv")).unwrap();
    let header = path_csv.lines().next().unwrap();
    assert!(header.starts_with("lambda,relative_lambda,taxon_0"));
    assert_eq!(path_csv.lines().count(), 11);

    let stability_csv = fs::read_to_string(dir.path().join("run1-stability.csv")).unwrap();
    assert_eq!(stability_csv.lines().count(), 7);
}

#[test]
fn only_requested_tables_are_written() {
    let selection = ModelSelectionConfig {
        lam_fixed: true,
        stab_sel: false,
        ..Default::default()
    };
    let solution = solve(&small_problem(), &FormulationConfig::default(), &selection).unwrap();

    let dir = tempdir().unwrap();
    let written = export(&solution, &ExportSink::new(dir.path().join("nested"), "")).unwrap();
    assert_eq!(written.len(), 1);
    assert!(written[0].ends_with("nested/solution.toml"));
    assert_eq!(load(&written[0]).unwrap(), solution);
}
