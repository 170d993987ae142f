//! Implementation of the NBLAST algorithm for quantifying neurons' morphological similarity.
//! Originally published in
//! [Costa et al. (2016)](https://www.ncbi.nlm.nih.gov/pmc/articles/PMC4961245/)
//! and implemented as part of the
//! [NeuroAnatomy Toolbox](http://natverse.org/).
//!
//! # Algorithm
//!
//! Each neuron is passed in as a point cloud sample (the links between the points are not required).
//! A tangent vector is calculated for each point, based on its location and that of its nearest neighbors;
//! together these make up the neuron's "dotprops".
//! To query the similarity of neuron `Q` to neuron `T`:
//!
//! - Take a point and its associated tangent in `Q`
//!   - Find the nearest point in `T`, and its associated tangent
//!   - Compute the distance between the two points
//!   - Compute the absolute dot product of the two tangents
//!   - Look up the (distance, dot_product) tuple in an empirically-derived table
//!     - As published, this is the log probabity ratio of any pair belonging to closely related or unrelated neurons
//! - Repeat for all points, summing the results
//!
//! The result is not easily comparable:
//! it is highly dependent on the size of the point cloud
//! and is not commutative, i.e. `f(Q, T) != f(T, Q)`.
//!
//! To make queries between two pairs of neurons comparable,
//! the result can be normalized by the "self-hit" score of the query, i.e. `f(Q, Q)`.
//!
//! To make the result commutative, the forward `f(Q, T)` and backward `f(T, Q)` scores can be combined in some way.
//! This library supports several means (arithmetic, harmonic, and geometric), the minimum, and the maximum.
//! The choice will depend on the application.
//! This can be applied after the scores are normalized.
//!
//! More information on the algorithm can be found
//! [here](http://jefferislab.org/si/nblast).
//!
//! # Usage
//!
//! [Dotprops] are built from point clouds with [Dotprops::new] (or [DotpropsBuilder]),
//! or from skeletons with [Dotprops::from_skeleton].
//! A [SpatialIndex] is built once per target neuron.
//!
//! [score] compares a single pair of neurons;
//! [score_matrix] and [all_by_all] compare many, in parallel if the `parallel` feature is enabled.
//! The [NblastArena] keeps neurons, their indices and self-hit scores around
//! for repeated many-to-many comparisons.
//!
//! Point matches are converted into scores with a [ScoringMatrix],
//! which can be loaded from CSV, trained on your own data with a [ScoreMatrixBuilder],
//! or taken from [ScoringMatrix::reference].
//!
//! The crate logs with [tracing](https://docs.rs/tracing) but never installs a subscriber.
use nalgebra::base::{Unit, Vector3};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub use nalgebra;

mod arena;
mod batch;
mod config;
mod dotprops;
mod error;
mod result;
mod scorer;
mod scoring;
pub mod smat;
pub mod spatial;
pub mod table_lookup;

pub use arena::{NblastArena, NeuronIdx};
pub use batch::{all_by_all, score_matrix, CancellationToken};
pub use config::{NblastConfig, Parallelism};
pub use dotprops::{
    points_from_rows, Dotprops, DotpropsBuilder, TangentAlpha, TangentMethod,
    DEFAULT_POWER_ITERATIONS,
};
pub use error::{NblastError, Result};
pub use result::ScoreMatrixResult;
pub use scorer::{query_dist_dots, raw_score, score, self_hit, IndexedDotprops};
pub use scoring::{Interpolation, ScoringMatrix};
pub use smat::ScoreMatrixBuilder;
pub use spatial::{Neighbor, SpatialIndex};

/// Floating point precision type used internally
pub type Precision = f64;
pub type Point3 = [Precision; 3];
pub type Normal3 = Unit<Vector3<Precision>>;

fn geometric_mean(a: Precision, b: Precision) -> Precision {
    (a.max(0.0) * b.max(0.0)).sqrt()
}

/// The result of comparing two (point, tangent) tuples.
/// Contains the Euclidean distance between the points,
/// and the absolute dot product of the (unit) tangents,
/// i.e. the absolute cosine of the angle between them
/// (possibly scaled by the points' alpha values).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistDot {
    pub dist: Precision,
    pub dot: Precision,
}

impl Default for DistDot {
    fn default() -> Self {
        Self {
            dist: 0.0,
            dot: 1.0,
        }
    }
}

/// Enumeration of methods to ensure that queries are symmetric/ commutative
/// (i.e. f(q, t) = f(t, q)).
/// Specific applications will require different methods.
/// Geometric and harmonic means bound the output to be >= 0.0.
/// Geometric mean may work best with non-normalized queries.
/// Min may work if an unknown one of the query and target is incomplete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Symmetry {
    ArithmeticMean,
    GeometricMean,
    HarmonicMean,
    Min,
    Max,
}

impl Symmetry {
    /// Combine a forward and backward score.
    pub fn apply(&self, query_score: Precision, target_score: Precision) -> Precision {
        match self {
            Symmetry::ArithmeticMean => (query_score + target_score) / 2.0,
            Symmetry::GeometricMean => geometric_mean(query_score, target_score),
            Symmetry::HarmonicMean => {
                if query_score.max(0.0) * target_score.max(0.0) == 0.0 {
                    0.0
                } else {
                    2.0 / (1.0 / query_score + 1.0 / target_score)
                }
            }
            Symmetry::Min => query_score.min(target_score),
            Symmetry::Max => query_score.max(target_score),
        }
    }
}

impl std::str::FromStr for Symmetry {
    type Err = NblastError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "arithmetic_mean" => Ok(Symmetry::ArithmeticMean),
            "geometric_mean" => Ok(Symmetry::GeometricMean),
            "harmonic_mean" => Ok(Symmetry::HarmonicMean),
            "min" => Ok(Symmetry::Min),
            "max" => Ok(Symmetry::Max),
            _ => Err(NblastError::InvalidParameter(format!(
                "Did not recognise symmetry type {:?}",
                s
            ))),
        }
    }
}
