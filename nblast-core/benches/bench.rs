use std::iter::repeat_with;

use bencher::{benchmark_group, benchmark_main, Bencher};
use fastrand::Rng;

use nblast_core::{
    all_by_all, score, score_matrix, CancellationToken, Dotprops, DotpropsBuilder, NblastArena,
    NblastConfig, Parallelism, Point3, Precision, ScoreMatrixBuilder, ScoringMatrix,
    SpatialIndex, Symmetry, TangentMethod,
};

const N_NEURONS: usize = 20;
const N_POINTS: usize = 1000;
const N_NEIGHBORS: usize = 5;

fn box_muller_sin(u1: Precision, u2: Precision) -> Precision {
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).sin()
}

fn random_translation(rng: &Rng, stdev: Precision) -> Point3 {
    let u1 = rng.f64();
    let u2 = rng.f64();
    let u3 = rng.f64();
    [
        box_muller_sin(u1, u2) * stdev,
        box_muller_sin(u2, u3) * stdev,
        box_muller_sin(u1, u3) * stdev,
    ]
}

/// A meandering branch of points about 1um apart, in a 100um box.
fn random_walk(rng: &Rng, n_points: usize) -> Vec<Point3> {
    let mut current = [rng.f64() * 100.0, rng.f64() * 100.0, rng.f64() * 100.0];
    let mut heading = random_translation(rng, 1.0);
    repeat_with(|| {
        let turn = random_translation(rng, 0.3);
        for d in 0..3 {
            heading[d] += turn[d];
        }
        let norm = heading.iter().map(|h| h * h).sum::<Precision>().sqrt();
        for d in 0..3 {
            current[d] += heading[d] / norm;
        }
        current
    })
    .take(n_points)
    .collect()
}

fn jitter(rng: &Rng, points: &[Point3], stdev: Precision) -> Vec<Point3> {
    points
        .iter()
        .map(|p| {
            let t = random_translation(rng, stdev);
            [p[0] + t[0], p[1] + t[1], p[2] + t[2]]
        })
        .collect()
}

fn all_points() -> Vec<Vec<Point3>> {
    let rng = Rng::with_seed(1991);
    repeat_with(|| random_walk(&rng, N_POINTS))
        .take(N_NEURONS)
        .collect()
}

fn all_dotprops() -> Vec<Dotprops> {
    all_points()
        .into_iter()
        .map(|ps| Dotprops::new(ps, N_NEIGHBORS).expect("couldn't build"))
        .collect()
}

fn bench_construction(b: &mut Bencher) {
    let points = all_points().swap_remove(0);
    b.iter(|| Dotprops::new(points.clone(), N_NEIGHBORS).expect("couldn't build"));
}

fn bench_construction_power_iteration(b: &mut Bencher) {
    let points = all_points().swap_remove(0);
    let mut builder = DotpropsBuilder::new(N_NEIGHBORS);
    builder.set_tangent_method(TangentMethod::PowerIteration { iterations: 32 });
    b.iter(|| builder.build(points.clone()).expect("couldn't build"));
}

fn bench_spatial_index(b: &mut Bencher) {
    let dp = all_dotprops().swap_remove(0);
    b.iter(|| SpatialIndex::new(&dp));
}

fn bench_query(b: &mut Bencher) {
    let smat = ScoringMatrix::reference();
    let dps = all_dotprops();
    let index = SpatialIndex::new(&dps[1]);
    b.iter(|| score(&dps[0], &dps[1], &index, &smat, false, false));
}

fn bench_query_norm(b: &mut Bencher) {
    let smat = ScoringMatrix::reference();
    let dps = all_dotprops();
    let index = SpatialIndex::new(&dps[1]);
    b.iter(|| score(&dps[0], &dps[1], &index, &smat, false, true));
}

fn bench_arena_construction(b: &mut Bencher) {
    let smat = ScoringMatrix::reference();
    let dps = all_dotprops();
    b.iter(|| {
        let mut arena = NblastArena::new(smat.clone(), false);
        for dp in dps.iter().cloned() {
            arena.add_dotprops(dp).expect("couldn't add");
        }
    })
}

fn arena_of_two() -> NblastArena {
    let mut arena = NblastArena::new(ScoringMatrix::reference(), false);
    for dp in all_dotprops().into_iter().take(2) {
        arena.add_dotprops(dp).expect("couldn't add");
    }
    arena
}

fn bench_arena_query(b: &mut Bencher) {
    let arena = arena_of_two();
    b.iter(|| arena.query_target(0, 1, false, &None));
}

fn bench_arena_query_norm_geom(b: &mut Bencher) {
    let arena = arena_of_two();
    b.iter(|| arena.query_target(0, 1, true, &Some(Symmetry::GeometricMean)));
}

fn bench_all_by_all(b: &mut Bencher, parallelism: Parallelism) {
    let smat = ScoringMatrix::reference();
    let dps = all_dotprops();
    let config = NblastConfig::default()
        .with_normalize(true)
        .with_parallelism(parallelism);
    let cancel = CancellationToken::new();
    b.iter(|| all_by_all(&dps, &smat, &config, &cancel));
}

fn bench_all_by_all_serial(b: &mut Bencher) {
    bench_all_by_all(b, Parallelism::Serial)
}

fn bench_all_by_all_parallel(b: &mut Bencher) {
    bench_all_by_all(b, Parallelism::Auto)
}

fn bench_queries_targets_symmetric(b: &mut Bencher) {
    let smat = ScoringMatrix::reference();
    let mut dps = all_dotprops();
    let targets = dps.split_off(N_NEURONS / 2);
    let config = NblastConfig::default()
        .with_normalize(true)
        .with_symmetry(Some(Symmetry::ArithmeticMean));
    let cancel = CancellationToken::new();
    b.iter(|| score_matrix(&dps, &targets, &smat, &config, &cancel));
}

/// Every neuron gets 3 jittered copies which should match it.
fn make_smatb(parallelism: Parallelism) -> ScoreMatrixBuilder {
    let rng = Rng::with_seed(1992);
    let mut neurons = Vec::new();
    let mut matching = Vec::new();
    for points in all_points() {
        let start = neurons.len();
        for _ in 0..3 {
            let ps = jitter(&rng, &points, 0.5);
            neurons.push(Dotprops::new(ps, N_NEIGHBORS).expect("couldn't build"));
        }
        matching.push((start..neurons.len()).collect());
    }

    let mut smatb = ScoreMatrixBuilder::new(neurons, 1991);
    for m in matching {
        smatb.add_matching_set(m);
    }
    smatb
        .set_n_dist_bins(20, 2.0, -2.0, 8.0)
        .set_n_dot_bins(10)
        .set_parallelism(parallelism);
    smatb
}

fn bench_smatbuild_ser(b: &mut Bencher) {
    let smatb = make_smatb(Parallelism::Serial);
    b.iter(|| smatb.build())
}

fn bench_smatbuild_par(b: &mut Bencher) {
    let smatb = make_smatb(Parallelism::Auto);
    b.iter(|| smatb.build())
}

benchmark_group!(
    dotprops,
    bench_construction,
    bench_construction_power_iteration,
    bench_spatial_index,
    bench_query,
    bench_query_norm,
);

benchmark_group!(
    arena,
    bench_arena_construction,
    bench_arena_query,
    bench_arena_query_norm_geom,
);

benchmark_group!(
    batch,
    bench_all_by_all_serial,
    bench_all_by_all_parallel,
    bench_queries_targets_symmetric,
);

benchmark_group!(smat, bench_smatbuild_ser, bench_smatbuild_par);

benchmark_main!(dotprops, arena, batch, smat);
