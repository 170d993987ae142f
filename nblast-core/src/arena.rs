//! Caching neurons for repeated NBLAST queries against each other.
//!
//! Neurons are added to a [NblastArena] once and then referred to by index.
use std::sync::Arc;

use tracing::debug;

use crate::batch::fill_matrix;
use crate::scorer::normalize_score;
use crate::{
    CancellationToken, Dotprops, IndexedDotprops, NblastError, Parallelism, Precision, Result,
    ScoreMatrixResult, ScoringMatrix, Symmetry,
};

pub type NeuronIdx = usize;

#[derive(Debug, Clone)]
struct NeuronSelfHit {
    neuron: IndexedDotprops,
    self_hit: Precision,
}

/// Struct for caching a number of neurons for multiple comparable NBLAST queries.
///
/// Each neuron's spatial index and self-hit score are computed once, when it is added.
#[derive(Debug, Clone)]
pub struct NblastArena {
    neurons_scores: Vec<NeuronSelfHit>,
    smat: Arc<ScoringMatrix>,
    use_alpha: bool,
}

impl NblastArena {
    /// `use_alpha` applies to every query made through this arena,
    /// and requires every added neuron to have alpha values.
    pub fn new(smat: impl Into<Arc<ScoringMatrix>>, use_alpha: bool) -> Self {
        Self {
            neurons_scores: Vec::default(),
            smat: smat.into(),
            use_alpha,
        }
    }

    fn next_id(&self) -> NeuronIdx {
        self.neurons_scores.len()
    }

    fn get(&self, idx: NeuronIdx) -> Result<&NeuronSelfHit> {
        self.neurons_scores.get(idx).ok_or_else(|| {
            NblastError::InvalidParameter(format!(
                "no neuron with index {} (arena has {})",
                idx,
                self.len()
            ))
        })
    }

    /// Returns an index which is then used to make queries.
    pub fn add_dotprops(&mut self, dotprops: Dotprops) -> Result<NeuronIdx> {
        let neuron = IndexedDotprops::new(dotprops);
        let self_hit = neuron.self_hit(&self.smat, self.use_alpha)?;
        let idx = self.next_id();
        debug!(idx, n_points = neuron.len(), self_hit, "Added neuron to arena");
        self.neurons_scores.push(NeuronSelfHit { neuron, self_hit });
        Ok(idx)
    }

    fn directed(&self, q: &NeuronSelfHit, t: &NeuronSelfHit, normalize: bool) -> Result<Precision> {
        let raw = q.neuron.query(&t.neuron, &self.smat, self.use_alpha)?;
        if normalize {
            Ok(normalize_score(raw, q.self_hit))
        } else {
            Ok(raw)
        }
    }

    /// A neuron scored against itself, from the cached self-hit.
    fn diagonal(ns: &NeuronSelfHit, normalize: bool, symmetry: &Option<Symmetry>) -> Precision {
        let score = if normalize { 1.0 } else { ns.self_hit };
        match symmetry {
            Some(s) => s.apply(score, score),
            None => score,
        }
    }

    /// Make a single query using the given indexes.
    /// `normalize` divides the result by the self-hit score of the query neuron.
    /// `symmetry`, if `Some`, also calculates the reverse score
    /// (normalizing it if necessary), and then applies a function to ensure
    /// that the query is symmetric/ commutative.
    pub fn query_target(
        &self,
        query_idx: NeuronIdx,
        target_idx: NeuronIdx,
        normalize: bool,
        symmetry: &Option<Symmetry>,
    ) -> Result<Precision> {
        let q = self.get(query_idx)?;
        let t = self.get(target_idx)?;
        if query_idx == target_idx {
            return Ok(Self::diagonal(q, normalize, symmetry));
        }
        let score = self.directed(q, t, normalize)?;
        match symmetry {
            Some(s) => {
                let score2 = self.directed(t, q, normalize)?;
                Ok(s.apply(score, score2))
            }
            None => Ok(score),
        }
    }

    /// Make many queries using the Cartesian product of the query and target indices.
    /// Rows of the result follow `query_idxs`, columns follow `target_idxs`.
    ///
    /// A neuron queried against itself is not recomputed:
    /// the cell is `1.0` if normalizing, or the cached self-hit score,
    /// with the symmetry function applied to it.
    ///
    /// See [query_target](#method.query_target) for details on `normalize` and `symmetry`.
    pub fn queries_targets(
        &self,
        query_idxs: &[NeuronIdx],
        target_idxs: &[NeuronIdx],
        normalize: bool,
        symmetry: &Option<Symmetry>,
        parallelism: Parallelism,
        cancel: &CancellationToken,
    ) -> Result<ScoreMatrixResult> {
        for idx in query_idxs.iter().chain(target_idxs) {
            self.get(*idx)?;
        }
        if let Parallelism::Threads(0) = parallelism {
            return Err(NblastError::invalid_parameter("thread count must be >= 1"));
        }

        let scores = fill_matrix(
            query_idxs.len(),
            target_idxs.len(),
            parallelism,
            cancel,
            |row, col| {
                self.query_target(query_idxs[row], target_idxs[col], normalize, symmetry)
            },
        )?;
        ScoreMatrixResult::from_row_major(query_idxs.len(), target_idxs.len(), scores)
    }

    pub fn self_hit(&self, idx: NeuronIdx) -> Option<Precision> {
        self.neurons_scores.get(idx).map(|n| n.self_hit)
    }

    /// Query every neuron against every other neuron.
    /// See [queries_targets](#method.queries_targets) for more details.
    pub fn all_v_all(
        &self,
        normalize: bool,
        symmetry: &Option<Symmetry>,
        parallelism: Parallelism,
        cancel: &CancellationToken,
    ) -> Result<ScoreMatrixResult> {
        let idxs: Vec<NeuronIdx> = (0..self.len()).collect();
        self.queries_targets(&idxs, &idxs, normalize, symmetry, parallelism, cancel)
    }

    pub fn is_empty(&self) -> bool {
        self.neurons_scores.is_empty()
    }

    /// Number of neurons in the arena.
    pub fn len(&self) -> usize {
        self.neurons_scores.len()
    }

    pub fn dotprops(&self, idx: NeuronIdx) -> Option<&Dotprops> {
        self.neurons_scores.get(idx).map(|n| n.neuron.dotprops())
    }

    pub fn scoring_matrix(&self) -> &ScoringMatrix {
        &self.smat
    }

    pub fn use_alpha(&self) -> bool {
        self.use_alpha
    }
}
