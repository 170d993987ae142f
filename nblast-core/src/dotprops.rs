//! Building dotprops: points paired with a local unit tangent and, optionally,
//! a measure of how colinear the local neighborhood is ("alpha").
//!
//! For a point cloud, each point's tangent is the principal direction of its
//! `k` nearest neighbors (including itself), i.e. the dominant eigenvector of their
//! scatter matrix, and `alpha = (λ1 - λ2) / (λ1 + λ2 + λ3)`.
//! For a skeleton, each edge contributes its midpoint and direction.
use nalgebra::base::{Matrix3, Unit, Vector3};
use tracing::debug;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{NblastError, Normal3, Point3, Precision, Result, SpatialIndex};

/// Tangents shorter than this cannot be normalized.
const MIN_TANGENT_NORM: Precision = 1e-12;

/// Default number of iterations for [TangentMethod::PowerIteration].
pub const DEFAULT_POWER_ITERATIONS: usize = 64;

/// How to find the principal direction of a neighborhood.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum TangentMethod {
    /// Exact symmetric eigendecomposition of the scatter matrix.
    #[default]
    Eigen,
    /// Approximate the leading eigenpairs by power iteration with deflation.
    /// Cheaper, but may be inaccurate for near-isotropic neighborhoods.
    PowerIteration { iterations: usize },
}

/// A unit tangent and the colinearity of the neighborhood it was fitted to.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct TangentAlpha {
    pub tangent: Normal3,
    pub alpha: Precision,
}

impl TangentAlpha {
    /// Fit a tangent to the given points using exact eigendecomposition.
    pub fn new_from_points<'a>(points: impl Iterator<Item = &'a Point3>) -> Self {
        Self::new_from_points_with(points, TangentMethod::Eigen)
    }

    pub fn new_from_points_with<'a>(
        points: impl Iterator<Item = &'a Point3>,
        method: TangentMethod,
    ) -> Self {
        let inertia = calc_inertia(points);
        let (direction, l1, l2) = match method {
            TangentMethod::Eigen => leading_eigen(&inertia),
            TangentMethod::PowerIteration { iterations } => {
                leading_power_iteration(&inertia, iterations.max(1))
            }
        };

        let sum = inertia.trace();
        let alpha = if sum > 0.0 {
            ((l1 - l2) / sum).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let tangent =
            Unit::try_new(direction, MIN_TANGENT_NORM).unwrap_or_else(Vector3::x_axis);

        Self { tangent, alpha }
    }
}

/// Scatter matrix of the points about their mean.
fn calc_inertia<'a>(points: impl Iterator<Item = &'a Point3>) -> Matrix3<Precision> {
    let vecs: Vec<Vector3<Precision>> = points.map(|p| Vector3::from(*p)).collect();
    if vecs.is_empty() {
        return Matrix3::zeros();
    }
    let mean = vecs.iter().sum::<Vector3<Precision>>() / vecs.len() as Precision;
    vecs.iter().fold(Matrix3::zeros(), |acc, v| {
        let c = v - mean;
        acc + c * c.transpose()
    })
}

/// Dominant eigenvector, largest and second-largest eigenvalues.
fn leading_eigen(inertia: &Matrix3<Precision>) -> (Vector3<Precision>, Precision, Precision) {
    let eig = inertia.symmetric_eigen();
    let mut order = [0, 1, 2];
    order.sort_by(|a, b| eig.eigenvalues[*b].total_cmp(&eig.eigenvalues[*a]));
    (
        eig.eigenvectors.column(order[0]).clone_owned(),
        eig.eigenvalues[order[0]],
        eig.eigenvalues[order[1]],
    )
}

/// Starting vector for power iteration: the column with the largest diagonal entry,
/// which has a non-zero projection onto the dominant eigenvector of any non-zero PSD matrix
/// unless that eigenvector is degenerate.
fn power_start(m: &Matrix3<Precision>) -> Vector3<Precision> {
    let mut best = 0;
    for d in 1..3 {
        if m[(d, d)] > m[(best, best)] {
            best = d;
        }
    }
    let col: Vector3<Precision> = m.column(best).clone_owned();
    if col.norm() > MIN_TANGENT_NORM {
        col
    } else {
        Vector3::new(1.0, 1.0, 1.0)
    }
}

fn power_iterate(
    m: &Matrix3<Precision>,
    iterations: usize,
) -> (Vector3<Precision>, Precision) {
    let mut v = power_start(m).normalize();
    for _ in 0..iterations {
        let next = m * v;
        let norm = next.norm();
        if norm <= MIN_TANGENT_NORM {
            break;
        }
        v = next / norm;
    }
    let lambda = v.dot(&(m * v));
    (v, lambda)
}

fn leading_power_iteration(
    inertia: &Matrix3<Precision>,
    iterations: usize,
) -> (Vector3<Precision>, Precision, Precision) {
    let (v1, l1) = power_iterate(inertia, iterations);
    let deflated = inertia - v1 * v1.transpose() * l1;
    let (_, l2) = power_iterate(&deflated, iterations);
    (v1, l1, l2.max(0.0))
}

fn check_finite(points: &[Point3]) -> Result<()> {
    match points
        .iter()
        .position(|p| p.iter().any(|v| !v.is_finite()))
    {
        Some(idx) => Err(NblastError::invalid_parameter(format!(
            "point {} has non-finite coordinates",
            idx
        ))),
        None => Ok(()),
    }
}

/// Convert rows of coordinates with a dynamic length into 3D points.
///
/// Rows of differing lengths fail with [DimensionMismatch](NblastError::DimensionMismatch);
/// rows which agree with each other but are not 3D fail with
/// [InvalidParameter](NblastError::InvalidParameter).
pub fn points_from_rows<R: AsRef<[Precision]>>(rows: &[R]) -> Result<Vec<Point3>> {
    let ndim = match rows.first() {
        Some(r) => r.as_ref().len(),
        None => return Ok(Vec::new()),
    };
    if let Some(bad) = rows.iter().find(|r| r.as_ref().len() != ndim) {
        return Err(NblastError::DimensionMismatch {
            expected: ndim,
            got: bad.as_ref().len(),
        });
    }
    if ndim != 3 {
        return Err(NblastError::invalid_parameter(format!(
            "expected 3-dimensional points, got {}-dimensional",
            ndim
        )));
    }
    Ok(rows
        .iter()
        .map(|r| {
            let r = r.as_ref();
            [r[0], r[1], r[2]]
        })
        .collect())
}

/// Configurable construction of [Dotprops] from point clouds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DotpropsBuilder {
    k: usize,
    tangent_method: TangentMethod,
}

impl DotpropsBuilder {
    /// `k` is the number of points each tangent is calculated from,
    /// including the point itself.
    pub fn new(k: usize) -> Self {
        Self {
            k,
            tangent_method: TangentMethod::default(),
        }
    }

    pub fn set_tangent_method(&mut self, tangent_method: TangentMethod) -> &mut Self {
        self.tangent_method = tangent_method;
        self
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn build(&self, points: Vec<Point3>) -> Result<Dotprops> {
        if points.len() < 2 {
            return Err(NblastError::InsufficientPoints {
                needed: 2,
                got: points.len(),
            });
        }
        if self.k < 1 || self.k >= points.len() {
            return Err(NblastError::invalid_parameter(format!(
                "k must be in [1, {}) for {} points, got {}",
                points.len(),
                points.len(),
                self.k
            )));
        }
        check_finite(&points)?;

        let index = SpatialIndex::from_points(&points);
        let (tangents, alphas) = points
            .iter()
            .map(|p| {
                let neighbors = index.nearest_n(p, self.k);
                let ta = TangentAlpha::new_from_points_with(
                    neighbors.iter().map(|nb| &points[nb.index]),
                    self.tangent_method,
                );
                (ta.tangent, ta.alpha)
            })
            .unzip();

        debug!(
            n_points = points.len(),
            k = self.k,
            method = ?self.tangent_method,
            "Built dotprops from point cloud"
        );
        Ok(Dotprops {
            points,
            tangents,
            alphas: Some(alphas),
        })
    }
}

/// A neuron as a set of points, each with a unit tangent and optional alpha value.
///
/// Equivalent to "dotprops" in the NeuroAnatomy Toolbox.
/// Immutable once built.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(
    feature = "serde",
    serde(try_from = "DotpropsParts", into = "DotpropsParts")
)]
pub struct Dotprops {
    points: Vec<Point3>,
    tangents: Vec<Normal3>,
    alphas: Option<Vec<Precision>>,
}

impl Dotprops {
    /// Calculate tangents and alphas from the `k` nearest neighbors of each point
    /// (including itself), using exact eigendecomposition.
    pub fn new(points: Vec<Point3>, k: usize) -> Result<Self> {
        DotpropsBuilder::new(k).build(points)
    }

    /// Use pre-calculated tangents, which are normalized here.
    pub fn new_with_tangents_alphas(
        points: Vec<Point3>,
        tangents: Vec<[Precision; 3]>,
        alphas: Option<Vec<Precision>>,
    ) -> Result<Self> {
        if points.is_empty() {
            return Err(NblastError::InsufficientPoints { needed: 1, got: 0 });
        }
        if tangents.len() != points.len() {
            return Err(NblastError::invalid_parameter(format!(
                "got {} tangents for {} points",
                tangents.len(),
                points.len()
            )));
        }
        check_finite(&points)?;

        let tangents = tangents
            .into_iter()
            .enumerate()
            .map(|(idx, t)| {
                let v = Vector3::from(t);
                if v.iter().any(|x| !x.is_finite()) {
                    return Err(NblastError::invalid_parameter(format!(
                        "tangent {} is not finite",
                        idx
                    )));
                }
                Unit::try_new(v, MIN_TANGENT_NORM).ok_or_else(|| {
                    NblastError::invalid_parameter(format!("tangent {} has zero length", idx))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        if let Some(a) = &alphas {
            if a.len() != points.len() {
                return Err(NblastError::invalid_parameter(format!(
                    "got {} alphas for {} points",
                    a.len(),
                    points.len()
                )));
            }
            if a.iter().any(|x| !x.is_finite()) {
                return Err(NblastError::invalid_parameter("alphas must be finite"));
            }
        }

        Ok(Self {
            points,
            tangents,
            alphas,
        })
    }

    /// Build from a skeleton given as points and the index of each point's parent
    /// (`None` for roots).
    ///
    /// Every child-parent edge becomes one record at the edge's midpoint,
    /// with the edge direction as its tangent; zero-length edges are skipped.
    /// Skeleton dotprops have no alpha values.
    pub fn from_skeleton(points: &[Point3], parents: &[Option<usize>]) -> Result<Self> {
        if parents.len() != points.len() {
            return Err(NblastError::invalid_parameter(format!(
                "got {} parents for {} points",
                parents.len(),
                points.len()
            )));
        }
        check_finite(points)?;

        let mut midpoints = Vec::with_capacity(points.len());
        let mut tangents = Vec::with_capacity(points.len());
        for (child_idx, parent) in parents.iter().enumerate() {
            let Some(parent_idx) = *parent else {
                continue;
            };
            let parent_pt = points.get(parent_idx).ok_or_else(|| {
                NblastError::invalid_parameter(format!(
                    "parent {} of point {} is out of range",
                    parent_idx, child_idx
                ))
            })?;
            let child = Vector3::from(points[child_idx]);
            let parent_vec = Vector3::from(*parent_pt);
            let Some(tangent) = Unit::try_new(parent_vec - child, 0.0) else {
                continue;
            };
            let mid = (child + parent_vec) / 2.0;
            midpoints.push([mid.x, mid.y, mid.z]);
            tangents.push(tangent);
        }

        if midpoints.is_empty() {
            return Err(NblastError::InsufficientPoints {
                needed: 2,
                got: points.len(),
            });
        }
        debug!(
            n_points = points.len(),
            n_edges = midpoints.len(),
            "Built dotprops from skeleton"
        );
        Ok(Self {
            points: midpoints,
            tangents,
            alphas: None,
        })
    }

    /// Number of points.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Always false for successfully-constructed dotprops.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[Point3] {
        &self.points
    }

    /// Unit tangents, in the same order as [points](#method.points).
    pub fn tangents(&self) -> &[Normal3] {
        &self.tangents
    }

    /// Alpha values in the same order as [points](#method.points), if they were calculated.
    pub fn alphas(&self) -> Option<&[Precision]> {
        self.alphas.as_deref()
    }

    pub fn has_alphas(&self) -> bool {
        self.alphas.is_some()
    }

    /// Tangent and alpha of the point at `idx`, if it exists and alphas are available.
    pub fn tangent_alpha(&self, idx: usize) -> Option<TangentAlpha> {
        let tangent = *self.tangents.get(idx)?;
        let alpha = *self.alphas.as_ref()?.get(idx)?;
        Some(TangentAlpha { tangent, alpha })
    }

    pub fn centroid(&self) -> Point3 {
        let mut sum = [0.0; 3];
        for p in self.points.iter() {
            for (s, v) in sum.iter_mut().zip(p.iter()) {
                *s += v;
            }
        }
        let n = self.points.len().max(1) as Precision;
        sum.map(|s| s / n)
    }
}

/// Serialized form of [Dotprops], with tangents as plain arrays.
/// Deserializing goes through [Dotprops::new_with_tangents_alphas].
#[cfg(feature = "serde")]
#[derive(Serialize, Deserialize)]
struct DotpropsParts {
    points: Vec<Point3>,
    tangents: Vec<[Precision; 3]>,
    #[serde(default)]
    alphas: Option<Vec<Precision>>,
}

#[cfg(feature = "serde")]
impl TryFrom<DotpropsParts> for Dotprops {
    type Error = NblastError;

    fn try_from(parts: DotpropsParts) -> Result<Self> {
        Self::new_with_tangents_alphas(parts.points, parts.tangents, parts.alphas)
    }
}

#[cfg(feature = "serde")]
impl From<Dotprops> for DotpropsParts {
    fn from(dp: Dotprops) -> Self {
        Self {
            points: dp.points,
            tangents: dp.tangents.iter().map(|t| [t.x, t.y, t.z]).collect(),
            alphas: dp.alphas,
        }
    }
}
