use std::collections::HashMap;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{NblastError, Precision, Result, Symmetry};

/// Dense score matrix from a batch comparison.
///
/// Row `i` holds the scores of query `i` against every target, in target order.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(
    feature = "serde",
    serde(try_from = "ScoreMatrixResultParts", into = "ScoreMatrixResultParts")
)]
pub struct ScoreMatrixResult {
    n_queries: usize,
    n_targets: usize,
    scores: Vec<Precision>,
    query_ids: Option<Vec<String>>,
    target_ids: Option<Vec<String>>,
}

impl ScoreMatrixResult {
    pub(crate) fn from_row_major(
        n_queries: usize,
        n_targets: usize,
        scores: Vec<Precision>,
    ) -> Result<Self> {
        let expected = n_queries.checked_mul(n_targets).ok_or_else(|| {
            NblastError::invalid_parameter(format!(
                "{}x{} score matrix is too large",
                n_queries, n_targets
            ))
        })?;
        if scores.len() != expected {
            return Err(NblastError::DimensionMismatch {
                expected,
                got: scores.len(),
            });
        }
        Ok(Self {
            n_queries,
            n_targets,
            scores,
            query_ids: None,
            target_ids: None,
        })
    }

    /// Attach names to the rows and columns.
    pub fn with_labels(mut self, query_ids: Vec<String>, target_ids: Vec<String>) -> Result<Self> {
        if query_ids.len() != self.n_queries {
            return Err(NblastError::DimensionMismatch {
                expected: self.n_queries,
                got: query_ids.len(),
            });
        }
        if target_ids.len() != self.n_targets {
            return Err(NblastError::DimensionMismatch {
                expected: self.n_targets,
                got: target_ids.len(),
            });
        }
        self.query_ids = Some(query_ids);
        self.target_ids = Some(target_ids);
        Ok(self)
    }

    /// `(n_queries, n_targets)`
    pub fn shape(&self) -> (usize, usize) {
        (self.n_queries, self.n_targets)
    }

    pub fn n_queries(&self) -> usize {
        self.n_queries
    }

    pub fn n_targets(&self) -> usize {
        self.n_targets
    }

    pub fn get(&self, query_idx: usize, target_idx: usize) -> Option<Precision> {
        if query_idx >= self.n_queries || target_idx >= self.n_targets {
            return None;
        }
        Some(self.scores[query_idx * self.n_targets + target_idx])
    }

    pub fn row(&self, query_idx: usize) -> Option<&[Precision]> {
        if query_idx >= self.n_queries {
            return None;
        }
        let start = query_idx * self.n_targets;
        Some(&self.scores[start..start + self.n_targets])
    }

    /// All scores, row-major.
    pub fn as_slice(&self) -> &[Precision] {
        &self.scores
    }

    pub fn into_vec(self) -> Vec<Precision> {
        self.scores
    }

    pub fn query_ids(&self) -> Option<&[String]> {
        self.query_ids.as_deref()
    }

    pub fn target_ids(&self) -> Option<&[String]> {
        self.target_ids.as_deref()
    }

    pub fn get_by_label(&self, query_id: &str, target_id: &str) -> Option<Precision> {
        let q = self.query_ids.as_ref()?.iter().position(|s| s == query_id)?;
        let t = self.target_ids.as_ref()?.iter().position(|s| s == target_id)?;
        self.get(q, t)
    }

    /// `((query_idx, target_idx), score)` for every cell, row by row.
    pub fn iter(&self) -> impl Iterator<Item = ((usize, usize), Precision)> + '_ {
        let n_targets = self.n_targets;
        self.scores
            .iter()
            .enumerate()
            .map(move |(idx, s)| ((idx / n_targets, idx % n_targets), *s))
    }

    pub fn to_map(&self) -> HashMap<(usize, usize), Precision> {
        self.iter().collect()
    }

    /// Combine each cell with its mirror across the diagonal.
    ///
    /// Only valid where queries and targets are the same neurons in the same order.
    pub fn symmetrized(&self, symmetry: &Symmetry) -> Result<Self> {
        if self.n_queries != self.n_targets {
            return Err(NblastError::invalid_parameter(format!(
                "cannot symmetrize a non-square {}x{} matrix",
                self.n_queries, self.n_targets
            )));
        }
        let n = self.n_queries;
        let mut scores = self.scores.clone();
        for q in 0..n {
            for t in 0..n {
                scores[q * n + t] = symmetry.apply(self.scores[q * n + t], self.scores[t * n + q]);
            }
        }
        Ok(Self {
            scores,
            ..self.clone()
        })
    }

    /// Combine this (forward) matrix with a backward matrix, where the backward matrix
    /// has the targets as queries and the queries as targets.
    pub(crate) fn symmetrize_with(
        &mut self,
        backward: &ScoreMatrixResult,
        symmetry: &Symmetry,
    ) -> Result<()> {
        if backward.shape() != (self.n_targets, self.n_queries) {
            return Err(NblastError::DimensionMismatch {
                expected: self.n_targets * self.n_queries,
                got: backward.scores.len(),
            });
        }
        for q in 0..self.n_queries {
            for t in 0..self.n_targets {
                let idx = q * self.n_targets + t;
                self.scores[idx] =
                    symmetry.apply(self.scores[idx], backward.scores[t * self.n_queries + q]);
            }
        }
        Ok(())
    }
}

/// Serialized form of a [ScoreMatrixResult], validated on the way in.
#[cfg(feature = "serde")]
#[derive(Serialize, Deserialize)]
struct ScoreMatrixResultParts {
    n_queries: usize,
    n_targets: usize,
    scores: Vec<Precision>,
    #[serde(default)]
    query_ids: Option<Vec<String>>,
    #[serde(default)]
    target_ids: Option<Vec<String>>,
}

#[cfg(feature = "serde")]
impl TryFrom<ScoreMatrixResultParts> for ScoreMatrixResult {
    type Error = NblastError;

    fn try_from(parts: ScoreMatrixResultParts) -> Result<Self> {
        let res = Self::from_row_major(parts.n_queries, parts.n_targets, parts.scores)?;
        match (parts.query_ids, parts.target_ids) {
            (Some(q), Some(t)) => res.with_labels(q, t),
            (None, None) => Ok(res),
            _ => Err(NblastError::invalid_parameter(
                "query and target labels must be given together",
            )),
        }
    }
}

#[cfg(feature = "serde")]
impl From<ScoreMatrixResult> for ScoreMatrixResultParts {
    fn from(res: ScoreMatrixResult) -> Self {
        Self {
            n_queries: res.n_queries,
            n_targets: res.n_targets,
            scores: res.scores,
            query_ids: res.query_ids,
            target_ids: res.target_ids,
        }
    }
}
