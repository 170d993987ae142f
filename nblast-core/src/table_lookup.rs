//! One-dimensional binning used by the scoring matrix axes.
use crate::{NblastError, Precision, Result};

/// Ascending bin boundaries along one axis.
///
/// `n` boundaries define `n - 1` half-open bins `[b[i], b[i + 1])`.
/// Values outside the outermost boundaries snap into the first or last bin.
#[derive(Debug, Clone, PartialEq)]
pub struct BinLookup {
    boundaries: Vec<Precision>,
    centers: Vec<Precision>,
}

fn bin_center(lower: Precision, upper: Precision) -> Precision {
    match (lower.is_finite(), upper.is_finite()) {
        (true, true) => (lower + upper) / 2.0,
        (true, false) => lower,
        (false, true) => upper,
        (false, false) => 0.0,
    }
}

impl BinLookup {
    /// `boundaries` must contain at least 2 values, none NaN, strictly ascending.
    /// The first and last may be infinite.
    pub fn new(boundaries: Vec<Precision>) -> Result<Self> {
        if boundaries.len() < 2 {
            return Err(NblastError::invalid_smat(format!(
                "bin boundaries must have >= 2 values, got {}",
                boundaries.len()
            )));
        }
        if boundaries.iter().any(|b| b.is_nan()) {
            return Err(NblastError::invalid_smat("bin boundaries contain NaN"));
        }
        if boundaries.windows(2).any(|w| w[0] >= w[1]) {
            return Err(NblastError::invalid_smat(
                "bin boundaries are not strictly ascending",
            ));
        }
        let centers = boundaries
            .windows(2)
            .map(|w| bin_center(w[0], w[1]))
            .collect();
        Ok(Self {
            boundaries,
            centers,
        })
    }

    pub fn n_bins(&self) -> usize {
        self.centers.len()
    }

    pub fn boundaries(&self) -> &[Precision] {
        &self.boundaries
    }

    /// Representative value of each bin: its midpoint,
    /// or its finite boundary if the other is infinite.
    pub fn centers(&self) -> &[Precision] {
        &self.centers
    }

    /// Index of the bin containing `val`, clamped to the outermost bins.
    #[inline]
    pub fn to_idx(&self, val: Precision) -> usize {
        let above = self.boundaries.partition_point(|b| *b <= val);
        above.saturating_sub(1).min(self.n_bins() - 1)
    }

    /// The pair of bins whose centers bracket `val`, and how far `val` is from the first
    /// towards the second (in `[0, 1)`).
    /// Beyond the outermost centers both bins are the edge bin.
    #[inline]
    pub fn to_interp(&self, val: Precision) -> (usize, usize, Precision) {
        let last = self.n_bins() - 1;
        if val.is_nan() || val <= self.centers[0] {
            return (0, 0, 0.0);
        }
        if val >= self.centers[last] {
            return (last, last, 0.0);
        }
        let lo = self.centers.partition_point(|c| *c <= val) - 1;
        let (c0, c1) = (self.centers[lo], self.centers[lo + 1]);
        (lo, lo + 1, (val - c0) / (c1 - c0))
    }
}

/// Generate `count` logarithmically-spaced values from `base^min_exp` up to (and including) `base^max_exp`.
pub(crate) fn logspace(
    base: Precision,
    min_exp: Precision,
    max_exp: Precision,
    count: usize,
) -> Vec<Precision> {
    match count {
        0 => Vec::new(),
        1 => vec![base.powf(min_exp)],
        _ => {
            let step = (max_exp - min_exp) / (count - 1) as Precision;
            (0..count)
                .map(|idx| base.powf(min_exp + idx as Precision * step))
                .collect()
        }
    }
}
