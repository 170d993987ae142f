//! Scoring one query neuron against one target neuron.
use tracing::warn;

use crate::{
    geometric_mean, DistDot, Dotprops, NblastError, Normal3, Point3, Precision, Result,
    ScoringMatrix, SpatialIndex,
};

fn check_pair(
    query: &Dotprops,
    target: &Dotprops,
    target_index: &SpatialIndex,
    use_alpha: bool,
) -> Result<()> {
    if query.is_empty() || target.is_empty() {
        return Err(NblastError::EmptyDotprops);
    }
    if target_index.len() != target.len() {
        return Err(NblastError::DimensionMismatch {
            expected: target.len(),
            got: target_index.len(),
        });
    }
    if use_alpha && !(query.has_alphas() && target.has_alphas()) {
        return Err(NblastError::invalid_parameter(
            "use_alpha requires both neurons to have alpha values",
        ));
    }
    Ok(())
}

/// For a given point and tangent vector,
/// get the distance to its nearest point in the target, and the absolute dot product
/// with that neighbor's tangent (scaled by the geometric mean of the alphas, if given).
#[inline]
fn nearest_match_dist_dot(
    point: &Point3,
    tangent: &Normal3,
    alpha: Option<Precision>,
    target: &Dotprops,
    target_index: &SpatialIndex,
) -> Result<DistDot> {
    let nn = target_index
        .nearest(point)
        .ok_or(NblastError::EmptyDotprops)?;
    let raw_dot = target.tangents()[nn.index].dot(tangent).abs();
    let dot = match (alpha, target.alphas()) {
        (Some(a), Some(t_alphas)) => raw_dot * geometric_mean(a, t_alphas[nn.index]),
        _ => raw_dot,
    };
    Ok(DistDot {
        dist: nn.distance,
        dot,
    })
}

/// Walk the query's points in order, matching each against the target.
fn for_each_match(
    query: &Dotprops,
    target: &Dotprops,
    target_index: &SpatialIndex,
    use_alpha: bool,
    mut f: impl FnMut(DistDot),
) -> Result<()> {
    let q_alphas = if use_alpha { query.alphas() } else { None };
    for (idx, (point, tangent)) in query.points().iter().zip(query.tangents()).enumerate() {
        let alpha = q_alphas.map(|a| a[idx]);
        f(nearest_match_dist_dot(
            point,
            tangent,
            alpha,
            target,
            target_index,
        )?);
    }
    Ok(())
}

/// The distance and (alpha-scaled) absolute dot product of every query point's
/// nearest match in the target, in query point order.
pub fn query_dist_dots(
    query: &Dotprops,
    target: &Dotprops,
    target_index: &SpatialIndex,
    use_alpha: bool,
) -> Result<Vec<DistDot>> {
    check_pair(query, target, target_index, use_alpha)?;
    let mut out = Vec::with_capacity(query.len());
    for_each_match(query, target, target_index, use_alpha, |dd| out.push(dd))?;
    Ok(out)
}

/// The raw (unnormalized) NBLAST score of `query` against `target`:
/// the scoring matrix is applied to each point match and summed.
///
/// Not commutative: each query point finds its own nearest target point.
pub fn raw_score(
    query: &Dotprops,
    target: &Dotprops,
    target_index: &SpatialIndex,
    smat: &ScoringMatrix,
    use_alpha: bool,
) -> Result<Precision> {
    check_pair(query, target, target_index, use_alpha)?;
    let mut total: Precision = 0.0;
    for_each_match(query, target, target_index, use_alpha, |dd| {
        total += smat.calc(&dd)
    })?;
    Ok(total)
}

/// The raw score of a neuron queried against itself.
/// Used for normalisation.
pub fn self_hit(
    dotprops: &Dotprops,
    index: &SpatialIndex,
    smat: &ScoringMatrix,
    use_alpha: bool,
) -> Result<Precision> {
    raw_score(dotprops, dotprops, index, smat, use_alpha)
}

pub(crate) fn normalize_score(raw: Precision, self_hit: Precision) -> Precision {
    let normalized = raw / self_hit;
    if !normalized.is_finite() {
        warn!(raw, self_hit, "Normalized score is not finite");
    }
    normalized
}

/// Score `query` against `target`.
///
/// If `normalize`, the raw score is divided by the query's self-hit score,
/// which requires building a spatial index over the query.
/// Normalized scores are not clamped: values outside `[0, 1]` are passed through.
///
/// A neuron normalized against itself (the same object as query and target) is exactly 1.0,
/// even if its self-hit is 0.
pub fn score(
    query: &Dotprops,
    target: &Dotprops,
    target_index: &SpatialIndex,
    smat: &ScoringMatrix,
    use_alpha: bool,
    normalize: bool,
) -> Result<Precision> {
    let raw = raw_score(query, target, target_index, smat, use_alpha)?;
    if !normalize {
        return Ok(raw);
    }
    if std::ptr::eq(query, target) {
        return Ok(1.0);
    }
    let query_index = SpatialIndex::new(query);
    let denom = self_hit(query, &query_index, smat, use_alpha)?;
    Ok(normalize_score(raw, denom))
}

/// Dotprops bundled with their spatial index, ready to be used as a target.
#[derive(Debug, Clone)]
pub struct IndexedDotprops {
    dotprops: Dotprops,
    index: SpatialIndex,
}

impl IndexedDotprops {
    pub fn new(dotprops: Dotprops) -> Self {
        let index = SpatialIndex::new(&dotprops);
        Self { dotprops, index }
    }

    pub fn dotprops(&self) -> &Dotprops {
        &self.dotprops
    }

    pub fn index(&self) -> &SpatialIndex {
        &self.index
    }

    pub fn len(&self) -> usize {
        self.dotprops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dotprops.is_empty()
    }

    /// Raw score of this neuron as the query against `target`.
    pub fn query(
        &self,
        target: &IndexedDotprops,
        smat: &ScoringMatrix,
        use_alpha: bool,
    ) -> Result<Precision> {
        raw_score(
            &self.dotprops,
            &target.dotprops,
            &target.index,
            smat,
            use_alpha,
        )
    }

    pub fn self_hit(&self, smat: &ScoringMatrix, use_alpha: bool) -> Result<Precision> {
        self_hit(&self.dotprops, &self.index, smat, use_alpha)
    }
}

impl From<Dotprops> for IndexedDotprops {
    fn from(dotprops: Dotprops) -> Self {
        Self::new(dotprops)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: Precision = 0.001;
    const N_NEIGHBORS: usize = 5;

    fn assert_close(val1: Precision, val2: Precision) {
        if (val1 - val2).abs() >= EPSILON {
            panic!("Not close:\n\t{:?}\n\t{:?}", val1, val2);
        }
    }

    fn make_points(offset: &Point3, step: &Point3, count: usize) -> Vec<Point3> {
        (0..count)
            .map(|i| {
                let i = i as Precision;
                [
                    offset[0] + step[0] * i,
                    offset[1] + step[1] * i,
                    offset[2] + step[2] * i,
                ]
            })
            .collect()
    }

    /// Close matches score 4 or 8, far matches 1 or 2, depending on the dot product.
    fn score_mat() -> ScoringMatrix {
        ScoringMatrix::from_upper_bounds(&[1.0, 2.0], &[0.5, 1.0], vec![4.0, 8.0, 1.0, 2.0])
            .expect("valid table")
    }

    fn indexed(points: Vec<Point3>) -> IndexedDotprops {
        IndexedDotprops::new(Dotprops::new(points, N_NEIGHBORS).expect("construction failed"))
    }

    #[test]
    fn query_dist_dots_len() {
        let query = indexed(make_points(&[0., 0., 0.], &[1., 0., 0.], 10));
        let target = indexed(make_points(&[0.5, 0., 0.], &[1.1, 0., 0.], 10));

        let dist_dots =
            query_dist_dots(query.dotprops(), target.dotprops(), target.index(), false).unwrap();
        assert_eq!(dist_dots.len(), 10);
        for dd in dist_dots {
            assert_close(dd.dot, 1.0);
        }
    }

    #[test]
    fn self_hit_is_perfect_match() {
        let smat = score_mat();
        let query = indexed(make_points(&[0., 0., 0.], &[1., 0., 0.], 10));
        // every point matches itself at distance 0 with parallel tangents
        assert_close(query.self_hit(&smat, false).unwrap(), 8.0 * 10.0);
    }

    #[test]
    fn normalized_self_is_one() {
        let smat = score_mat();
        let query = indexed(make_points(&[0., 0., 0.], &[1., 0.3, 0.], 10));
        let s = score(
            query.dotprops(),
            query.dotprops(),
            query.index(),
            &smat,
            false,
            true,
        )
        .unwrap();
        assert_eq!(s, 1.0);
    }

    #[test]
    fn normalized_self_is_one_with_zero_self_hit() {
        // close-range parallel matches score nothing
        let smat =
            ScoringMatrix::from_upper_bounds(&[1.0, 2.0], &[0.5, 1.0], vec![4.0, 0.0, 1.0, 2.0])
                .expect("valid table");
        let dp = Dotprops::new_with_tangents_alphas(
            make_points(&[0., 0., 0.], &[1., 0., 0.], 3),
            vec![[1.0, 0.0, 0.0]; 3],
            None,
        )
        .unwrap();
        let index = SpatialIndex::new(&dp);
        assert_eq!(self_hit(&dp, &index, &smat, false).unwrap(), 0.0);
        assert_eq!(score(&dp, &dp, &index, &smat, false, true).unwrap(), 1.0);

        // a separate copy is scored normally
        let copy = dp.clone();
        assert!(score(&copy, &dp, &index, &smat, false, true)
            .unwrap()
            .is_nan());
    }

    #[test]
    fn score_is_asymmetric() {
        let smat = score_mat();
        // a short neuron lying alongside part of a long one
        let short = indexed(make_points(&[0., 0., 0.], &[1., 0., 0.], 6));
        let long = indexed(make_points(&[0., 0.5, 0.], &[1., 0., 0.], 30));

        let fwd = short.query(&long, &smat, false).unwrap();
        let bwd = long.query(&short, &smat, false).unwrap();
        assert_close(fwd, 6.0 * 8.0);
        assert_close(bwd, 6.0 * 8.0 + 24.0 * 2.0);

        let fwd_norm = fwd / short.self_hit(&smat, false).unwrap();
        let bwd_norm = bwd / long.self_hit(&smat, false).unwrap();
        assert_close(fwd_norm, 1.0);
        assert_close(bwd_norm, 0.4);
    }

    #[test]
    fn alpha_requires_alphas() {
        let smat = score_mat();
        let plain = Dotprops::new_with_tangents_alphas(
            vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0]],
            vec![[1.0, 0.0, 0.0], [1.0, 0.0, 0.0]],
            None,
        )
        .unwrap();
        let index = SpatialIndex::new(&plain);
        assert!(matches!(
            raw_score(&plain, &plain, &index, &smat, true),
            Err(NblastError::InvalidParameter(_))
        ));
        assert!(raw_score(&plain, &plain, &index, &smat, false).is_ok());
    }

    #[test]
    fn alpha_scales_dot() {
        let with_alpha = Dotprops::new_with_tangents_alphas(
            vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0]],
            vec![[1.0, 0.0, 0.0], [1.0, 0.0, 0.0]],
            Some(vec![0.25, 1.0]),
        )
        .unwrap();
        let index = SpatialIndex::new(&with_alpha);
        let dds = query_dist_dots(&with_alpha, &with_alpha, &index, true).unwrap();
        assert_close(dds[0].dot, 0.25);
        assert_close(dds[1].dot, 1.0);
    }

    #[test]
    fn mismatched_index() {
        let smat = score_mat();
        let a = indexed(make_points(&[0., 0., 0.], &[1., 0., 0.], 10));
        let b = indexed(make_points(&[0., 0., 0.], &[1., 0., 0.], 12));
        assert_eq!(
            raw_score(a.dotprops(), a.dotprops(), b.index(), &smat, false),
            Err(NblastError::DimensionMismatch {
                expected: 10,
                got: 12
            })
        );
    }
}
