// ========================================================================================
//
//                 CLASSO REGULARIZATION PATH PERFORMANCE BENCHMARK
//
// ========================================================================================
//
// Measures the cost of a full warm-started path as the number of variables grows,
// comparing the closed-form zero-sum projection against a general constraint matrix
// with several rows (which goes through the semismooth Newton prox).
//
// ========================================================================================

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use classo::{FormulationConfig, ModelSelectionConfig, Problem, solve};
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

// --- Benchmark Tuning Parameters ---

/// Observations per simulated problem.
const NUM_SAMPLES: usize = 100;
/// Grid size of each path.
const PATH_LENGTH: usize = 40;
/// Constraint rows of the general case.
const GENERAL_CONSTRAINTS: usize = 4;
/// Variable counts to test. This array defines the x-axis of the final plot.
const NUM_FEATURES: [usize; 4] = [50, 100, 200, 400];

/// Gaussian design with a sparse, feasible truth under `c`.
fn simulate(n: usize, d: usize, c: Array2<f64>) -> Problem {
    let mut rng = StdRng::seed_from_u64(2024);
    let x = Array2::from_shape_fn((n, d), |_| rng.sample::<f64, _>(StandardNormal));
    let mut beta = Array1::zeros(d);
    // Pairs of opposite signs inside each block keep every block sum at zero.
    for (j, value) in [(0, 2.0), (1, -2.0), (2, 1.0), (3, -1.0)] {
        beta[j] = value;
    }
    let noise = Array1::from_shape_fn(n, |_| 0.5 * rng.sample::<f64, _>(StandardNormal));
    let y = x.dot(&beta) + noise;
    Problem::new(x, y, c, None).expect("simulated shapes are consistent")
}

/// Block-sum constraints: row `k` sums the `k`-th contiguous block of columns.
fn block_constraints(k: usize, d: usize) -> Array2<f64> {
    let block = d.div_ceil(k);
    Array2::from_shape_fn((k, d), |(row, j)| if j / block == row { 1.0 } else { 0.0 })
}

fn benchmark_path_by_dimension(c: &mut Criterion) {
    let mut selection = ModelSelectionConfig {
        path: true,
        stab_sel: false,
        ..Default::default()
    };
    selection.path_parameters.n_lam = PATH_LENGTH;
    let formulation = FormulationConfig::default();

    let mut group = c.benchmark_group("Regularization Path: Zero-Sum vs. General Constraint");
    // Time per grid point keeps the y-axis comparable across dimensions.
    group.throughput(Throughput::Elements(PATH_LENGTH as u64));
    group.sample_size(10);

    for &d in NUM_FEATURES.iter() {
        let zero_sum = simulate(NUM_SAMPLES, d, Array2::ones((1, d)));
        group.bench_with_input(BenchmarkId::new("Zero-Sum", d), &zero_sum, |b, problem| {
            b.iter(|| solve(black_box(problem), &formulation, &selection).expect("path solve"))
        });

        let general = simulate(NUM_SAMPLES, d, block_constraints(GENERAL_CONSTRAINTS, d));
        group.bench_with_input(BenchmarkId::new("General", d), &general, |b, problem| {
            b.iter(|| solve(black_box(problem), &formulation, &selection).expect("path solve"))
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark_path_by_dimension);
criterion_main!(benches);
