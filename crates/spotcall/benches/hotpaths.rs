use criterion::{black_box, criterion_group, criterion_main, Criterion};
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use spotcall::{nnls, PhaseModel, PhaseParams};

fn crosstalk_fixture(rows: usize, seed: u64) -> (DMatrix<f64>, Vec<DVector<f64>>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let m = DMatrix::from_fn(rows, 4, |r, c| {
        let diag = if r % 4 == c { 1.0 } else { 0.0 };
        diag + rng.gen_range(0.0..0.3)
    });
    let obs = (0..256)
        .map(|_| {
            let truth = DVector::from_fn(4, |_, _| rng.gen_range(0.0..1000.0));
            let noise = DVector::from_fn(rows, |_, _| rng.gen_range(-5.0..5.0));
            &m * truth + noise
        })
        .collect();
    (m, obs)
}

fn bench_nnls(c: &mut Criterion) {
    let (m4, obs4) = crosstalk_fixture(4, 7);
    let (m15, obs15) = crosstalk_fixture(15, 9);

    c.bench_function("nnls_4x4_256obs", |b| {
        b.iter(|| {
            for o in &obs4 {
                black_box(nnls(black_box(&m4), black_box(o), 100, 1e-10).ok());
            }
        })
    });

    c.bench_function("nnls_15x4_256obs", |b| {
        b.iter(|| {
            for o in &obs15 {
                black_box(nnls(black_box(&m15), black_box(o), 100, 1e-10).ok());
            }
        })
    });
}

fn bench_phase(c: &mut Criterion) {
    let params = PhaseParams::new(0.05, 0.02, 0.0);

    c.bench_function("phase_model_build_n100", |b| {
        b.iter(|| black_box(PhaseModel::new(black_box(params), 100, 1e10).ok()))
    });

    let Ok(model) = PhaseModel::new(params, 100, 1e10) else {
        return;
    };
    let mut rng = StdRng::seed_from_u64(3);
    let series: Vec<[f64; 4]> = (0..100)
        .map(|_| std::array::from_fn(|_| rng.gen_range(0.0..1.0)))
        .collect();
    c.bench_function("phase_correct_n100", |b| {
        b.iter(|| black_box(model.correct(black_box(&series)).ok()))
    });
}

criterion_group!(benches, bench_nnls, bench_phase);
criterion_main!(benches);
