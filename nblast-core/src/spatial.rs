//! Nearest-neighbor lookup over a neuron's points,
//! backed by an [R*-tree](https://en.wikipedia.org/wiki/R*_tree) from the [rstar] crate.
//!
//! The tree yields candidates in order of increasing distance;
//! every candidate at the same distance as the closest one is drained,
//! so equidistant points always resolve to the lowest original index
//! regardless of how the tree happened to be packed.
use std::fmt;

use rstar::{primitives::GeomWithData, RTree};
use tracing::debug;

use crate::{Dotprops, Point3, Precision};

type PointWithIndex = GeomWithData<Point3, usize>;

/// A stored point close to some query location.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    /// Index of the point in the slice the index was built from.
    pub index: usize,
    /// Euclidean distance to the query location.
    pub distance: Precision,
}

fn is_finite(point: &Point3) -> bool {
    point.iter().all(|v| v.is_finite())
}

/// Spatial index over the points of one [Dotprops].
///
/// Built once per neuron by bulk loading, and then only read,
/// so it can be shared freely between threads.
#[derive(Clone)]
pub struct SpatialIndex {
    rtree: RTree<PointWithIndex>,
}

impl fmt::Debug for SpatialIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpatialIndex")
            .field("len", &self.len())
            .finish()
    }
}

impl SpatialIndex {
    pub fn new(dotprops: &Dotprops) -> Self {
        Self::from_points(dotprops.points())
    }

    /// Index arbitrary points; neighbors refer to positions in `points`.
    pub fn from_points(points: &[Point3]) -> Self {
        let rtree = RTree::bulk_load(
            points
                .iter()
                .enumerate()
                .map(|(idx, p)| PointWithIndex::new(*p, idx))
                .collect(),
        );
        debug!(n_points = rtree.size(), "Built spatial index");
        Self { rtree }
    }

    /// Number of indexed points.
    pub fn len(&self) -> usize {
        self.rtree.size()
    }

    pub fn is_empty(&self) -> bool {
        self.rtree.size() == 0
    }

    /// Closest indexed point (lowest index among equidistant points).
    ///
    /// `None` if the index is empty or the query is not finite.
    pub fn nearest(&self, point: &Point3) -> Option<Neighbor> {
        if !is_finite(point) {
            return None;
        }
        let mut candidates = self.rtree.nearest_neighbor_iter_with_distance_2(point);
        let (first, best_d2) = candidates.next()?;
        let mut best_idx = first.data;
        for (geom, d2) in candidates {
            if d2 > best_d2 {
                break;
            }
            best_idx = best_idx.min(geom.data);
        }
        Some(Neighbor {
            index: best_idx,
            distance: best_d2.sqrt(),
        })
    }

    /// Up to `n` indexed points closest to `point`, sorted by distance then index.
    pub fn nearest_n(&self, point: &Point3, n: usize) -> Vec<Neighbor> {
        if n == 0 || !is_finite(point) {
            return Vec::new();
        }
        let mut found: Vec<(Precision, usize)> = Vec::with_capacity(n);
        for (geom, d2) in self.rtree.nearest_neighbor_iter_with_distance_2(point) {
            // keep going past `n` while candidates tie with the furthest one kept
            if found.len() >= n && found.last().map_or(true, |(last, _)| d2 > *last) {
                break;
            }
            found.push((d2, geom.data));
        }
        found.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        found.truncate(n);
        found
            .into_iter()
            .map(|(d2, index)| Neighbor {
                index,
                distance: d2.sqrt(),
            })
            .collect()
    }
}
