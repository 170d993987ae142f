//! Many-to-many comparisons, optionally spread across a rayon thread pool.
//!
//! Each worker owns whole rows of the output matrix,
//! so no two workers ever write to the same cell.
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, trace, warn};

use crate::scorer::normalize_score;
use crate::{
    raw_score, self_hit, Dotprops, NblastConfig, NblastError, Parallelism, Precision, Result,
    ScoreMatrixResult, ScoringMatrix, SpatialIndex,
};

/// Shared flag for stopping a running batch.
///
/// Checked before every pair is scored; a pair already in progress is finished.
/// Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

fn fill_row<F>(
    row_idx: usize,
    row: &mut [Precision],
    cancel: &CancellationToken,
    f: &F,
) -> Result<()>
where
    F: Fn(usize, usize) -> Result<Precision>,
{
    for (col_idx, cell) in row.iter_mut().enumerate() {
        if cancel.is_cancelled() {
            return Err(NblastError::Cancelled);
        }
        *cell = f(row_idx, col_idx)?;
    }
    trace!(row_idx, "Filled row");
    Ok(())
}

fn fill_matrix_serial<F>(
    n_rows: usize,
    n_cols: usize,
    cancel: &CancellationToken,
    f: F,
) -> Result<Vec<Precision>>
where
    F: Fn(usize, usize) -> Result<Precision>,
{
    let mut out = vec![0.0; n_rows * n_cols];
    if n_cols == 0 {
        return Ok(out);
    }
    for (row_idx, row) in out.chunks_mut(n_cols).enumerate() {
        fill_row(row_idx, row, cancel, &f)?;
    }
    Ok(out)
}

cfg_if::cfg_if! {
    if #[cfg(feature = "parallel")] {
        use rayon::prelude::*;

        pub(crate) fn with_pool<R, OP>(parallelism: Parallelism, op: OP) -> Result<R>
        where
            OP: FnOnce() -> R + Send,
            R: Send,
        {
            // 0 lets rayon pick one thread per CPU
            let n_threads = match parallelism {
                Parallelism::Threads(n) => n,
                _ => 0,
            };
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(n_threads)
                .build()
                .map_err(|e| {
                    NblastError::InvalidParameter(format!("could not build thread pool: {}", e))
                })?;
            Ok(pool.install(op))
        }

        /// Compute every cell of a row-major `n_rows x n_cols` matrix.
        /// The first error (including cancellation) aborts the whole matrix.
        pub(crate) fn fill_matrix<F>(
            n_rows: usize,
            n_cols: usize,
            parallelism: Parallelism,
            cancel: &CancellationToken,
            f: F,
        ) -> Result<Vec<Precision>>
        where
            F: Fn(usize, usize) -> Result<Precision> + Sync,
        {
            if parallelism == Parallelism::Serial || n_rows * n_cols == 0 {
                return fill_matrix_serial(n_rows, n_cols, cancel, f);
            }
            let mut out = vec![0.0; n_rows * n_cols];
            debug!(n_rows, n_cols, ?parallelism, "Partitioning matrix by row");
            with_pool(parallelism, || {
                out.par_chunks_mut(n_cols)
                    .enumerate()
                    .try_for_each(|(row_idx, row)| fill_row(row_idx, row, cancel, &f))
            })??;
            Ok(out)
        }

        fn map_items<T, U, F>(items: &[T], parallelism: Parallelism, f: F) -> Result<Vec<U>>
        where
            T: Sync,
            U: Send,
            F: Fn(&T) -> U + Sync + Send,
        {
            if parallelism == Parallelism::Serial {
                return Ok(items.iter().map(f).collect());
            }
            with_pool(parallelism, || items.par_iter().map(f).collect())
        }
    } else {
        pub(crate) fn fill_matrix<F>(
            n_rows: usize,
            n_cols: usize,
            _parallelism: Parallelism,
            cancel: &CancellationToken,
            f: F,
        ) -> Result<Vec<Precision>>
        where
            F: Fn(usize, usize) -> Result<Precision> + Sync,
        {
            fill_matrix_serial(n_rows, n_cols, cancel, f)
        }

        fn map_items<T, U, F>(items: &[T], _parallelism: Parallelism, f: F) -> Result<Vec<U>>
        where
            T: Sync,
            U: Send,
            F: Fn(&T) -> U + Sync + Send,
        {
            Ok(items.iter().map(f).collect())
        }
    }
}

fn check_inputs(dotprops: &[Dotprops], use_alpha: bool) -> Result<()> {
    for dp in dotprops {
        if dp.is_empty() {
            return Err(NblastError::EmptyDotprops);
        }
        if use_alpha && !dp.has_alphas() {
            return Err(NblastError::invalid_parameter(
                "use_alpha requires every neuron to have alpha values",
            ));
        }
    }
    Ok(())
}

fn build_indices(dotprops: &[Dotprops], parallelism: Parallelism) -> Result<Vec<SpatialIndex>> {
    let indices = map_items(dotprops, parallelism, SpatialIndex::new)?;
    debug!(n_indices = indices.len(), "Built spatial indices");
    Ok(indices)
}

fn calc_self_hits(
    dotprops: &[Dotprops],
    indices: &[SpatialIndex],
    smat: &ScoringMatrix,
    config: &NblastConfig,
    cancel: &CancellationToken,
) -> Result<Vec<Precision>> {
    fill_matrix(dotprops.len(), 1, config.parallelism, cancel, |idx, _| {
        self_hit(&dotprops[idx], &indices[idx], smat, config.use_alpha)
    })
}

/// Scores of every query against every target, without symmetry.
fn directed_matrix(
    queries: &[Dotprops],
    query_self_hits: &[Precision],
    targets: &[Dotprops],
    target_indices: &[SpatialIndex],
    smat: &ScoringMatrix,
    config: &NblastConfig,
    cancel: &CancellationToken,
) -> Result<ScoreMatrixResult> {
    let scores = fill_matrix(
        queries.len(),
        targets.len(),
        config.parallelism,
        cancel,
        |q_idx, t_idx| {
            let raw = raw_score(
                &queries[q_idx],
                &targets[t_idx],
                &target_indices[t_idx],
                smat,
                config.use_alpha,
            )?;
            if config.normalize {
                Ok(normalize_score(raw, query_self_hits[q_idx]))
            } else {
                Ok(raw)
            }
        },
    )?;
    ScoreMatrixResult::from_row_major(queries.len(), targets.len(), scores)
}

fn log_outcome(result: &Result<ScoreMatrixResult>, started: Instant) {
    let elapsed = started.elapsed();
    match result {
        Err(NblastError::Cancelled) => warn!(?elapsed, "Batch scoring cancelled"),
        Err(e) => warn!(error = %e, ?elapsed, "Batch scoring failed"),
        Ok(r) => info!(shape = ?r.shape(), ?elapsed, "Batch scoring finished"),
    }
}

/// Score every query against every target.
///
/// Row `i`, column `j` of the result is the score of `queries[i]` against `targets[j]`,
/// exactly as [score](crate::score) would compute it for that pair.
/// If `config.symmetry` is set, each cell combines the forward score with the
/// backward score of `targets[j]` against `queries[i]`.
///
/// If `queries` and `targets` are the same slice, this is [all_by_all].
///
/// Any failing pair aborts the batch; no partial matrix is returned.
pub fn score_matrix(
    queries: &[Dotprops],
    targets: &[Dotprops],
    smat: &ScoringMatrix,
    config: &NblastConfig,
    cancel: &CancellationToken,
) -> Result<ScoreMatrixResult> {
    if ptr::eq(queries, targets) {
        return all_by_all(queries, smat, config, cancel);
    }
    config.validate()?;
    check_inputs(queries, config.use_alpha)?;
    check_inputs(targets, config.use_alpha)?;
    info!(
        n_queries = queries.len(),
        n_targets = targets.len(),
        normalize = config.normalize,
        symmetry = ?config.symmetry,
        "Scoring queries against targets"
    );

    let started = Instant::now();
    let result = score_matrix_inner(queries, targets, smat, config, cancel);
    log_outcome(&result, started);
    result
}

fn score_matrix_inner(
    queries: &[Dotprops],
    targets: &[Dotprops],
    smat: &ScoringMatrix,
    config: &NblastConfig,
    cancel: &CancellationToken,
) -> Result<ScoreMatrixResult> {
    let target_indices = build_indices(targets, config.parallelism)?;
    let query_indices = if config.normalize || config.symmetry.is_some() {
        build_indices(queries, config.parallelism)?
    } else {
        Vec::new()
    };
    let query_self_hits = if config.normalize {
        calc_self_hits(queries, &query_indices, smat, config, cancel)?
    } else {
        Vec::new()
    };

    let mut forward = directed_matrix(
        queries,
        &query_self_hits,
        targets,
        &target_indices,
        smat,
        config,
        cancel,
    )?;

    if let Some(symmetry) = &config.symmetry {
        let target_self_hits = if config.normalize {
            calc_self_hits(targets, &target_indices, smat, config, cancel)?
        } else {
            Vec::new()
        };
        let backward = directed_matrix(
            targets,
            &target_self_hits,
            queries,
            &query_indices,
            smat,
            config,
            cancel,
        )?;
        forward.symmetrize_with(&backward, symmetry)?;
    }
    Ok(forward)
}

/// Score every neuron against every other (and itself).
///
/// Diagonal cells are the self-hit scores, or exactly `1.0` if normalizing.
/// See [score_matrix].
pub fn all_by_all(
    dotprops: &[Dotprops],
    smat: &ScoringMatrix,
    config: &NblastConfig,
    cancel: &CancellationToken,
) -> Result<ScoreMatrixResult> {
    config.validate()?;
    check_inputs(dotprops, config.use_alpha)?;
    info!(
        n_neurons = dotprops.len(),
        normalize = config.normalize,
        symmetry = ?config.symmetry,
        "Scoring all neurons against each other"
    );

    let started = Instant::now();
    let result = all_by_all_inner(dotprops, smat, config, cancel);
    log_outcome(&result, started);
    result
}

fn all_by_all_inner(
    dotprops: &[Dotprops],
    smat: &ScoringMatrix,
    config: &NblastConfig,
    cancel: &CancellationToken,
) -> Result<ScoreMatrixResult> {
    let n = dotprops.len();
    let indices = build_indices(dotprops, config.parallelism)?;
    let self_hits = calc_self_hits(dotprops, &indices, smat, config, cancel)?;

    let scores = fill_matrix(n, n, config.parallelism, cancel, |q_idx, t_idx| {
        if q_idx == t_idx {
            return Ok(if config.normalize {
                1.0
            } else {
                self_hits[q_idx]
            });
        }
        let raw = raw_score(
            &dotprops[q_idx],
            &dotprops[t_idx],
            &indices[t_idx],
            smat,
            config.use_alpha,
        )?;
        if config.normalize {
            Ok(normalize_score(raw, self_hits[q_idx]))
        } else {
            Ok(raw)
        }
    })?;

    let result = ScoreMatrixResult::from_row_major(n, n, scores)?;
    match &config.symmetry {
        Some(symmetry) => result.symmetrized(symmetry),
        None => Ok(result),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{score, Point3, Symmetry};

    const N_NEIGHBORS: usize = 5;

    fn random_neuron(rng: &fastrand::Rng, n_points: usize, spread: Precision) -> Dotprops {
        let mut points: Vec<Point3> = Vec::with_capacity(n_points);
        let mut current = [rng.f64() * 10.0, rng.f64() * 10.0, rng.f64() * 10.0];
        for _ in 0..n_points {
            current = [
                current[0] + (rng.f64() - 0.3) * spread,
                current[1] + (rng.f64() - 0.5) * spread,
                current[2] + (rng.f64() - 0.5) * spread,
            ];
            points.push(current);
        }
        Dotprops::new(points, N_NEIGHBORS).expect("valid neuron")
    }

    fn neurons(seed: u64, count: usize) -> Vec<Dotprops> {
        let rng = fastrand::Rng::with_seed(seed);
        (0..count)
            .map(|i| random_neuron(&rng, 20 + i * 3, 2.0))
            .collect()
    }

    #[test]
    fn matches_pairwise() {
        let smat = ScoringMatrix::reference();
        let queries = neurons(1, 3);
        let targets = neurons(2, 4);
        for normalize in [false, true] {
            let config = NblastConfig::default().with_normalize(normalize);
            let result =
                score_matrix(&queries, &targets, &smat, &config, &CancellationToken::new())
                    .unwrap();
            assert_eq!(result.shape(), (3, 4));
            for (q_idx, q) in queries.iter().enumerate() {
                for (t_idx, t) in targets.iter().enumerate() {
                    let index = SpatialIndex::new(t);
                    let expected = score(q, t, &index, &smat, false, normalize).unwrap();
                    assert_eq!(result.get(q_idx, t_idx), Some(expected));
                }
            }
        }
    }

    #[test]
    fn serial_equals_parallel() {
        let smat = ScoringMatrix::reference();
        let dps = neurons(3, 6);
        let serial = all_by_all(
            &dps,
            &smat,
            &NblastConfig::default().with_parallelism(Parallelism::Serial),
            &CancellationToken::new(),
        )
        .unwrap();
        let parallel = all_by_all(
            &dps,
            &smat,
            &NblastConfig::default().with_parallelism(Parallelism::Threads(3)),
            &CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(serial, parallel);
    }

    #[test]
    fn normalized_diagonal() {
        let smat = ScoringMatrix::reference();
        let dps = neurons(4, 4);
        let config = NblastConfig::default().with_normalize(true);
        let result = all_by_all(&dps, &smat, &config, &CancellationToken::new()).unwrap();
        for idx in 0..dps.len() {
            assert_eq!(result.get(idx, idx), Some(1.0));
        }

        // separate copies of the same neurons take the long path
        let copies = dps.clone();
        let result =
            score_matrix(&dps, &copies, &smat, &config, &CancellationToken::new()).unwrap();
        for idx in 0..dps.len() {
            assert_eq!(result.get(idx, idx), Some(1.0));
        }
    }

    #[test]
    fn symmetric_output() {
        let smat = ScoringMatrix::reference();
        let dps = neurons(5, 4);
        let config = NblastConfig::default()
            .with_normalize(true)
            .with_symmetry(Some(Symmetry::ArithmeticMean));
        let result = all_by_all(&dps, &smat, &config, &CancellationToken::new()).unwrap();
        for q in 0..dps.len() {
            for t in 0..dps.len() {
                assert_eq!(result.get(q, t), result.get(t, q));
            }
        }

        let copies = dps.clone();
        let rect = score_matrix(&dps, &copies, &smat, &config, &CancellationToken::new()).unwrap();
        for q in 0..dps.len() {
            for t in 0..dps.len() {
                let diff = rect.get(q, t).unwrap() - result.get(q, t).unwrap();
                assert!(diff.abs() < 1e-12);
            }
        }
    }

    #[test]
    fn empty_inputs() {
        let smat = ScoringMatrix::reference();
        let dps = neurons(6, 2);
        let none: Vec<Dotprops> = Vec::new();
        let config = NblastConfig::default();
        let cancel = CancellationToken::new();
        assert_eq!(
            score_matrix(&none, &dps, &smat, &config, &cancel)
                .unwrap()
                .shape(),
            (0, 2)
        );
        assert_eq!(
            score_matrix(&dps, &none, &smat, &config, &cancel)
                .unwrap()
                .shape(),
            (2, 0)
        );
        assert_eq!(
            all_by_all(&none, &smat, &config, &cancel).unwrap().shape(),
            (0, 0)
        );
    }

    #[test]
    fn cancelled_before_start() {
        let smat = ScoringMatrix::reference();
        let dps = neurons(7, 3);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(
            all_by_all(&dps, &smat, &NblastConfig::default(), &cancel),
            Err(NblastError::Cancelled)
        );
    }

    #[test]
    fn cancelled_midway() {
        let cancel = CancellationToken::new();
        let clone = cancel.clone();
        let result = fill_matrix(3, 3, Parallelism::Serial, &cancel, |q, t| {
            if (q, t) == (1, 0) {
                clone.cancel();
            }
            Ok(1.0)
        });
        assert_eq!(result, Err(NblastError::Cancelled));
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn cancelled_midway_threaded() {
        let cancel = CancellationToken::new();
        let clone = cancel.clone();
        let result = fill_matrix(40, 40, Parallelism::Threads(4), &cancel, |q, t| {
            if (q, t) == (17, 0) {
                clone.cancel();
            }
            Ok(1.0)
        });
        assert_eq!(result, Err(NblastError::Cancelled));
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn pair_error_aborts() {
        let result = fill_matrix(4, 4, Parallelism::Threads(2), &CancellationToken::new(), |q, t| {
            if q == 2 && t == 3 {
                Err(NblastError::EmptyDotprops)
            } else {
                Ok(0.0)
            }
        });
        assert_eq!(result, Err(NblastError::EmptyDotprops));
    }

    #[test]
    fn invalid_config() {
        let smat = ScoringMatrix::reference();
        let dps = neurons(8, 2);
        let config = NblastConfig::default().with_parallelism(Parallelism::Threads(0));
        assert!(matches!(
            all_by_all(&dps, &smat, &config, &CancellationToken::new()),
            Err(NblastError::InvalidParameter(_))
        ));
        let config = NblastConfig::default().with_use_alpha(true);
        let no_alphas = vec![Dotprops::new_with_tangents_alphas(
            vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0]],
            vec![[1.0, 0.0, 0.0], [1.0, 0.0, 0.0]],
            None,
        )
        .unwrap()];
        assert!(matches!(
            score_matrix(&no_alphas, &dps, &smat, &config, &CancellationToken::new()),
            Err(NblastError::InvalidParameter(_))
        ));
    }
}
