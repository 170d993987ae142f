//! The crux of the NBLAST algorithm is converting `(distance, abs_dot)` point matches
//! into a meaningful score.
//!
//! The strategy here generates a lookup table whose indices are dist and dot bins.
//! A neuron match score is the sum of the values of the lookup table over every point match.
//!
//! The values in the table cells are the log2 odds ratio of a dist-dot in that cell
//! being from a matching over a non-matching neuron pair.
//! This is calculated by adding a large pool of neurons
//! (most of which would not match), with small groups of neurons which should match each other.
//! Calculate all the point matches between all pairs of neurons in those sets,
//! then draw random pairs of neurons from either the whole neuron pool,
//! or an explicitly non-matching subset.
//! Normalise the counts falling into each cell by the total number of matching
//! and non-matching dist-dots, and calculate the log2 odds ratios.
//!
//! This is handled by the [ScoreMatrixBuilder].
//! The dist and dot bins for the table can be set manually or determined
//! based on how many bins there should be, distributed logarithmically
//! (with a given base) and linearly respectively.
use std::collections::{BTreeSet, HashSet};

use tracing::{debug, info};

use crate::table_lookup::{logspace, BinLookup};
use crate::{
    query_dist_dots, Dotprops, IndexedDotprops, NblastError, Parallelism, Precision, Result,
    ScoringMatrix,
};

const EPSILON: Precision = 1e-6;

type JobSet = HashSet<(usize, usize)>;

/// The two axes of the table being trained, and how to flatten them into a cell index.
struct CellLookup {
    dist: BinLookup,
    dot: BinLookup,
}

impl CellLookup {
    fn n_cells(&self) -> usize {
        self.dist.n_bins() * self.dot.n_bins()
    }

    fn cell_idx(&self, dist: Precision, dot: Precision) -> usize {
        self.dist.to_idx(dist) * self.dot.n_bins() + self.dot.to_idx(dot)
    }
}

/// Calculate a score matrix (lookup table for converting point matches
/// into NBLAST scores) from real data using some sets of matching and non-matching neurons.
///
/// At a minimum, one matching set must be added (`.add_matching_set`),
/// and the dist and dot bins must either be set manually or calculated
/// (`.set_(n_)?(dist|dot)_bins`).
pub struct ScoreMatrixBuilder {
    // Data set of neuron point clouds
    neurons: Vec<IndexedDotprops>,
    seed: u64,
    // Sets of neurons, as indexes into `self.neurons`, which should match
    matching_sets: Vec<HashSet<usize>>,
    nonmatching: Option<Vec<usize>>,
    use_alpha: bool,
    parallelism: Parallelism,
    dist_bins: Option<Vec<Precision>>,
    dot_bins: Option<Vec<Precision>>,
}

impl ScoreMatrixBuilder {
    /// `seed` is used when randomly selecting non-matching neurons to use as controls.
    pub fn new(neurons: Vec<Dotprops>, seed: u64) -> Self {
        Self {
            neurons: neurons.into_iter().map(IndexedDotprops::new).collect(),
            seed,
            matching_sets: Vec::default(),
            nonmatching: None,
            use_alpha: false,
            parallelism: Parallelism::Auto,
            dist_bins: None,
            dot_bins: None,
        }
    }

    /// Add a set of neurons which are considered to be mutually matching,
    /// as indices into the builder's neurons.
    /// This can be done several times with different sets.
    /// Matching sets should be small subsets of the total neuron count.
    pub fn add_matching_set(&mut self, matching: HashSet<usize>) -> &mut Self {
        self.matching_sets.push(matching);
        self
    }

    /// Optionally list neurons which are mutually non-matching,
    /// as indices into the builder's neurons,
    /// from which non-matching pairs will be randomly drawn.
    /// By default, all neurons are included,
    /// as matching sets are expected to be only a small portion of the total neurons.
    ///
    /// Candidate non-matching pairs are made sure not to be in the matching pairs,
    /// so this can safely be ignored.
    pub fn set_nonmatching(&mut self, nonmatching: Vec<usize>) -> &mut Self {
        self.nonmatching = Some(nonmatching);
        self
    }

    /// Alpha values are a measure of how colinear a neuron's local neighborhood is.
    /// Score matrices calculated using alpha can only be used for queries using alpha,
    /// and vice versa.
    ///
    /// False by default.
    pub fn set_use_alpha(&mut self, use_alpha: bool) -> &mut Self {
        self.use_alpha = use_alpha;
        self
    }

    /// How many workers to use for calculating the pair matches.
    pub fn set_parallelism(&mut self, parallelism: Parallelism) -> &mut Self {
        self.parallelism = parallelism;
        self
    }

    /// Manually set the boundaries of the distance bins.
    /// The first and last bounds are effectively ignored,
    /// as values outside that range are snapped to the bottom and top bins.
    ///
    /// Checked when the matrix is built.
    pub fn set_dist_bins(&mut self, bins: Vec<Precision>) -> &mut Self {
        self.dist_bins = Some(bins);
        self
    }

    /// Automatically generate `n_bins` distance bins by logarithmically interpolating
    /// between `base^min_exp` (which should be small) and `base^max_exp`.
    /// The last bin is unbounded.
    pub fn set_n_dist_bins(
        &mut self,
        n_bins: usize,
        base: Precision,
        min_exp: Precision,
        max_exp: Precision,
    ) -> &mut Self {
        let mut v = logspace(base, min_exp, max_exp, n_bins);
        v.push(Precision::INFINITY);
        self.set_dist_bins(v)
    }

    /// Manually set the boundaries of the abs dot product bins.
    /// The first and last bounds are effectively ignored, as values outside those values
    /// snap into their closest bins.
    ///
    /// Because the tangent vectors are unit-length,
    /// absolute dot products between them are between 0 and 1
    /// (although float precision means values slightly above 1 are possible).
    pub fn set_dot_bins(&mut self, dot_bin_boundaries: Vec<Precision>) -> &mut Self {
        self.dot_bins = Some(dot_bin_boundaries);
        self
    }

    /// Automatically generate `n_bins` abs dot product bins of equal width between 0 and 1.
    pub fn set_n_dot_bins(&mut self, n_bins: usize) -> &mut Self {
        let step = 1.0 / n_bins as Precision;
        self.set_dot_bins((0..=n_bins).map(|n| step * n as Precision).collect())
    }

    fn lookup(&self) -> Result<CellLookup> {
        let dist = self
            .dist_bins
            .clone()
            .ok_or_else(|| NblastError::invalid_parameter("dist bins not set"))?;
        let dot = self
            .dot_bins
            .clone()
            .ok_or_else(|| NblastError::invalid_parameter("dot bins not set"))?;
        Ok(CellLookup {
            dist: BinLookup::new(dist)?,
            dot: BinLookup::new(dot)?,
        })
    }

    /// Count point matches for every pair, and convert the counts into log odds ratios.
    pub fn build(&self) -> Result<ScoringMatrix> {
        if self.matching_sets.is_empty() {
            return Err(NblastError::invalid_parameter("no matching sets given"));
        }
        let lookup = self.lookup()?;

        let (match_jobs, nonmatch_jobs) = self.match_nonmatch_jobs()?;
        let matching_factor = nonmatch_jobs.len() as Precision / match_jobs.len() as Precision;
        info!(
            n_matching = match_jobs.len(),
            n_nonmatching = nonmatch_jobs.len(),
            n_cells = lookup.n_cells(),
            "Training score matrix"
        );

        let match_counts = self.pairs_to_counts(&match_jobs, &lookup)?;
        let nonmatch_counts = self.pairs_to_counts(&nonmatch_jobs, &lookup)?;

        let cells = match_counts
            .into_iter()
            .zip(nonmatch_counts)
            .map(|(match_count, nonmatch_count)| {
                // add epsilon to prevent division by 0
                ((match_count as Precision * matching_factor + EPSILON)
                    / (nonmatch_count as Precision + EPSILON))
                    .log2()
            })
            .collect();

        ScoringMatrix::new(
            lookup.dist.boundaries().to_vec(),
            lookup.dot.boundaries().to_vec(),
            cells,
        )
    }

    fn check_idx(&self, idx: usize) -> Result<()> {
        if idx >= self.neurons.len() {
            return Err(NblastError::InvalidParameter(format!(
                "neuron index {} out of range for {} neurons",
                idx,
                self.neurons.len()
            )));
        }
        Ok(())
    }

    /// Generate the "jobs" for matching and nonmatching neuron queries.
    ///
    /// Every non-repeating 2-length permutation of neurons within each matching set is used.
    /// Then, pairs of neurons are taken randomly from the non-matching set
    /// (if `None`, use all neurons) until there are at least as many non-matching DistDots
    /// as there are matching.
    fn match_nonmatch_jobs(&self) -> Result<(Vec<(usize, usize)>, Vec<(usize, usize)>)> {
        let mut matching_len = 0;
        let mut matching_jobs = JobSet::default();

        for matching_set in self.matching_sets.iter() {
            for q_idx in matching_set.iter() {
                self.check_idx(*q_idx)?;
                let q_len = self.neurons[*q_idx].len();
                for t_idx in matching_set.iter() {
                    if t_idx != q_idx && matching_jobs.insert((*q_idx, *t_idx)) {
                        // keep track of how many distdots we're producing
                        matching_len += q_len
                    }
                }
            }
        }
        if matching_jobs.is_empty() {
            return Err(NblastError::invalid_parameter(
                "matching sets must contain at least 2 neurons",
            ));
        }

        // deduplicated and sorted, so that draws depend only on the seed
        let pool: Vec<usize> = match &self.nonmatching {
            Some(idxs) => idxs.iter().copied().collect::<BTreeSet<_>>(),
            None => (0..self.neurons.len()).collect(),
        }
        .into_iter()
        .collect();
        for idx in pool.iter() {
            self.check_idx(*idx)?;
        }

        let n_available = pool
            .iter()
            .flat_map(|q| pool.iter().map(move |t| (*q, *t)))
            .filter(|(q, t)| q != t && !matching_jobs.contains(&(*q, *t)))
            .count();

        let rng = fastrand::Rng::with_seed(self.seed);
        let mut nonmatching_jobs = JobSet::default();
        let mut nonmatching_vec = Vec::default();

        // randomly pick nonmatching pairs until we have requested as many distdots
        // as we did for matching
        let mut remaining = matching_len;
        while remaining > 0 {
            if nonmatching_jobs.len() >= n_available {
                return Err(NblastError::InvalidParameter(format!(
                    "not enough non-matching neurons: {} pairs cover {} of {} point matches",
                    n_available,
                    matching_len - remaining,
                    matching_len
                )));
            }
            let q_idx = pool[rng.usize(..pool.len())];
            let t_idx = pool[rng.usize(..pool.len())];

            let key = (q_idx, t_idx);
            if q_idx != t_idx && !matching_jobs.contains(&key) && nonmatching_jobs.insert(key) {
                nonmatching_vec.push(key);
                remaining = remaining.saturating_sub(self.neurons[q_idx].len());
            }
        }
        debug!(
            matching_len,
            n_pool = pool.len(),
            "Drew non-matching pairs"
        );

        Ok((matching_jobs.into_iter().collect(), nonmatching_vec))
    }

    /// Add the bin of every point match between the query and target to `counts`.
    fn count_pair(
        &self,
        (q_idx, t_idx): (usize, usize),
        lookup: &CellLookup,
        counts: &mut [usize],
    ) -> Result<()> {
        let q = &self.neurons[q_idx];
        let t = &self.neurons[t_idx];
        for dd in query_dist_dots(q.dotprops(), t.dotprops(), t.index(), self.use_alpha)? {
            counts[lookup.cell_idx(dd.dist, dd.dot)] += 1;
        }
        Ok(())
    }

    fn pairs_to_counts_serial(
        &self,
        jobs: &[(usize, usize)],
        lookup: &CellLookup,
    ) -> Result<Vec<usize>> {
        let mut counts = vec![0; lookup.n_cells()];
        for job in jobs {
            self.count_pair(*job, lookup, &mut counts)?;
        }
        Ok(counts)
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "parallel")] {
        use rayon::prelude::*;

        use crate::batch::with_pool;

        impl ScoreMatrixBuilder {
            fn pairs_to_counts(
                &self,
                jobs: &[(usize, usize)],
                lookup: &CellLookup,
            ) -> Result<Vec<usize>> {
                if self.parallelism == Parallelism::Serial {
                    return self.pairs_to_counts_serial(jobs, lookup);
                }
                let n_cells = lookup.n_cells();
                with_pool(self.parallelism, || {
                    jobs.par_iter()
                        .try_fold(
                            || vec![0; n_cells],
                            |mut counts, job| {
                                self.count_pair(*job, lookup, &mut counts)?;
                                Ok::<_, NblastError>(counts)
                            },
                        )
                        .try_reduce(
                            || vec![0; n_cells],
                            |mut a, b| {
                                a.iter_mut().zip(b).for_each(|(x, y)| *x += y);
                                Ok(a)
                            },
                        )
                })?
            }
        }
    } else {
        impl ScoreMatrixBuilder {
            fn pairs_to_counts(
                &self,
                jobs: &[(usize, usize)],
                lookup: &CellLookup,
            ) -> Result<Vec<usize>> {
                self.pairs_to_counts_serial(jobs, lookup)
            }
        }
    }
}
