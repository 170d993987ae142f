//! Converting a point match's `(distance, abs_dot)` into a score contribution.
//!
//! The [ScoringMatrix] is a 2D lookup table whose rows are distance bins
//! and whose columns are absolute dot product bins.
//! A neuron match score is the sum of the table's values over every point match,
//! so [lookup](ScoringMatrix::lookup) is by far the most frequently called function in the crate.
use std::io::Read;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::table_lookup::BinLookup;
use crate::{DistDot, NblastError, Precision, Result};

/// How [ScoringMatrix::lookup] treats values between bin centers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Interpolation {
    /// Return the value of the cell containing the point.
    #[default]
    Binned,
    /// Bilinearly interpolate between the four surrounding bin centers.
    Bilinear,
}

/// Distance bin upper bounds of the conventional FCWB scoring table, in microns.
const REFERENCE_DIST_UPPER: [Precision; 21] = [
    0.75, 1.5, 2.0, 2.5, 3.0, 3.5, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 12.0, 14.0, 16.0, 20.0,
    25.0, 30.0, 40.0, 500.0,
];

const REFERENCE_N_DOT_BINS: usize = 10;

/// Immutable lookup table mapping `(distance, abs_dot)` to a score.
///
/// Cells are stored dist-major:
/// if the table had distance bins in the left margin
/// and dot product bins on the top margin, the cells are in row-major order.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(
    feature = "serde",
    serde(try_from = "ScoringMatrixParts", into = "ScoringMatrixParts")
)]
pub struct ScoringMatrix {
    dist_lookup: BinLookup,
    dot_lookup: BinLookup,
    cells: Vec<Precision>,
    interpolation: Interpolation,
}

impl ScoringMatrix {
    /// `dist_bins` and `dot_bins` are the full boundary lists for each axis
    /// (`n_bins + 1` values each, strictly ascending).
    /// Values outside the outer boundaries are clamped into the edge bins.
    pub fn new(
        dist_bins: Vec<Precision>,
        dot_bins: Vec<Precision>,
        cells: Vec<Precision>,
    ) -> Result<Self> {
        let dist_lookup = BinLookup::new(dist_bins)?;
        let dot_lookup = BinLookup::new(dot_bins)?;
        let expected = dist_lookup.n_bins() * dot_lookup.n_bins();
        if cells.len() != expected {
            return Err(NblastError::invalid_smat(format!(
                "expected {} cells ({} dist bins x {} dot bins), got {}",
                expected,
                dist_lookup.n_bins(),
                dot_lookup.n_bins(),
                cells.len()
            )));
        }
        if let Some(idx) = cells.iter().position(|c| !c.is_finite()) {
            return Err(NblastError::invalid_smat(format!(
                "cell {} is not finite",
                idx
            )));
        }
        Ok(Self {
            dist_lookup,
            dot_lookup,
            cells,
            interpolation: Interpolation::default(),
        })
    }

    /// Each bin is identified by its upper bound:
    /// the lower bound is implicitly the previous bin's upper bound, or zero.
    pub fn from_upper_bounds(
        dist_upper: &[Precision],
        dot_upper: &[Precision],
        cells: Vec<Precision>,
    ) -> Result<Self> {
        Self::new(with_zero(dist_upper), with_zero(dot_upper), cells)
    }

    pub fn with_interpolation(mut self, interpolation: Interpolation) -> Self {
        self.interpolation = interpolation;
        self
    }

    /// Read a table from CSV.
    ///
    /// The header row holds the upper bound of each dot bin (its first cell is ignored);
    /// every following row starts with the upper bound of a distance bin, then that row's cells.
    /// Bounds may be plain numbers or interval labels like `(0,0.75]`,
    /// in which case the value after the comma is used.
    /// The lower bound of the first bin on each axis is 0.
    pub fn from_csv_reader<R: Read>(reader: R) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers = rdr
            .headers()
            .map_err(|e| NblastError::invalid_smat(format!("could not read header: {}", e)))?
            .clone();
        let dot_upper = headers
            .iter()
            .skip(1)
            .map(parse_bound)
            .collect::<Result<Vec<_>>>()?;

        let mut dist_upper = Vec::default();
        let mut cells = Vec::default();
        for (row_idx, record) in rdr.records().enumerate() {
            let record = record.map_err(|e| {
                NblastError::invalid_smat(format!("could not read row {}: {}", row_idx, e))
            })?;
            let mut fields = record.iter();
            let label = fields.next().ok_or_else(|| {
                NblastError::invalid_smat(format!("row {} is empty", row_idx))
            })?;
            dist_upper.push(parse_bound(label)?);
            for field in fields {
                let val = field.parse::<Precision>().map_err(|_| {
                    NblastError::invalid_smat(format!(
                        "row {}: could not parse cell {:?}",
                        row_idx, field
                    ))
                })?;
                cells.push(val);
            }
        }

        Self::from_upper_bounds(&dist_upper, &dot_upper, cells)
    }

    /// A ready-to-use table over the FCWB bins
    /// (21 distance bins up to 500, 10 evenly spaced dot bins).
    ///
    /// The cells follow a smooth log-odds-like surface which is highest for close,
    /// parallel matches and slightly negative for distant ones.
    /// It is suitable for exploration; for real analyses,
    /// train a table on your own data with [ScoreMatrixBuilder](crate::ScoreMatrixBuilder)
    /// or load a published one with [from_csv_reader](#method.from_csv_reader).
    pub fn reference() -> Self {
        let dot_upper: Vec<Precision> = (1..=REFERENCE_N_DOT_BINS)
            .map(|n| n as Precision / REFERENCE_N_DOT_BINS as Precision)
            .collect();
        let dist_lookup =
            BinLookup::new(with_zero(&REFERENCE_DIST_UPPER)).expect("constant bins are valid");
        let dot_lookup = BinLookup::new(with_zero(&dot_upper)).expect("constant bins are valid");

        let mut cells = Vec::with_capacity(dist_lookup.n_bins() * dot_lookup.n_bins());
        for dist in dist_lookup.centers() {
            for dot in dot_lookup.centers() {
                cells.push(10.0 * (-dist / 3.0).exp2() * (0.5 + 0.5 * dot) - 0.5);
            }
        }

        Self {
            dist_lookup,
            dot_lookup,
            cells,
            interpolation: Interpolation::default(),
        }
    }

    pub fn interpolation(&self) -> Interpolation {
        self.interpolation
    }

    pub fn dist_bins(&self) -> &[Precision] {
        self.dist_lookup.boundaries()
    }

    pub fn dot_bins(&self) -> &[Precision] {
        self.dot_lookup.boundaries()
    }

    pub fn n_dist_bins(&self) -> usize {
        self.dist_lookup.n_bins()
    }

    pub fn n_dot_bins(&self) -> usize {
        self.dot_lookup.n_bins()
    }

    pub fn dist_centers(&self) -> &[Precision] {
        self.dist_lookup.centers()
    }

    pub fn dot_centers(&self) -> &[Precision] {
        self.dot_lookup.centers()
    }

    pub fn cells(&self) -> &[Precision] {
        &self.cells
    }

    /// Value of the cell in the given distance row and dot column.
    pub fn cell(&self, dist_idx: usize, dot_idx: usize) -> Option<Precision> {
        if dot_idx >= self.n_dot_bins() {
            return None;
        }
        self.cells
            .get(dist_idx * self.n_dot_bins() + dot_idx)
            .copied()
    }

    /// `(dist_idx, dot_idx)` of the bin containing the given values, after clamping.
    pub fn bin_idxs(&self, dist: Precision, dot: Precision) -> (usize, usize) {
        (self.dist_lookup.to_idx(dist), self.dot_lookup.to_idx(dot))
    }

    #[inline]
    pub fn lookup(&self, dist: Precision, dot: Precision) -> Precision {
        match self.interpolation {
            Interpolation::Binned => {
                let row = self.dist_lookup.to_idx(dist);
                let col = self.dot_lookup.to_idx(dot);
                self.cells[row * self.n_dot_bins() + col]
            }
            Interpolation::Bilinear => self.lookup_bilinear(dist, dot),
        }
    }

    fn lookup_bilinear(&self, dist: Precision, dot: Precision) -> Precision {
        let n_cols = self.n_dot_bins();
        let (r0, r1, t) = self.dist_lookup.to_interp(dist);
        let (c0, c1, u) = self.dot_lookup.to_interp(dot);
        let v00 = self.cells[r0 * n_cols + c0];
        let v01 = self.cells[r0 * n_cols + c1];
        let v10 = self.cells[r1 * n_cols + c0];
        let v11 = self.cells[r1 * n_cols + c1];

        (1.0 - t) * ((1.0 - u) * v00 + u * v01) + t * ((1.0 - u) * v10 + u * v11)
    }

    /// Score contribution of a single point match.
    #[inline]
    pub fn calc(&self, dd: &DistDot) -> Precision {
        self.lookup(dd.dist, dd.dot)
    }
}

fn with_zero(upper: &[Precision]) -> Vec<Precision> {
    let mut out = Vec::with_capacity(upper.len() + 1);
    out.push(0.0);
    out.extend_from_slice(upper);
    out
}

/// Parse `0.75`, `(0,0.75]` or `[0,0.75)` as `0.75`.
fn parse_bound(label: &str) -> Result<Precision> {
    let trimmed = label.trim().trim_matches('"');
    let value = match trimmed.split_once(',') {
        Some((_, upper)) => upper.trim_end_matches([']', ')']).trim(),
        None => trimmed,
    };
    value
        .parse::<Precision>()
        .map_err(|_| NblastError::invalid_smat(format!("could not parse bin bound {:?}", label)))
}

/// Serialized form of a [ScoringMatrix], validated on the way in.
#[cfg(feature = "serde")]
#[derive(Serialize, Deserialize)]
struct ScoringMatrixParts {
    dist_bins: Vec<Precision>,
    dot_bins: Vec<Precision>,
    cells: Vec<Precision>,
    #[serde(default)]
    interpolation: Interpolation,
}

#[cfg(feature = "serde")]
impl TryFrom<ScoringMatrixParts> for ScoringMatrix {
    type Error = NblastError;

    fn try_from(parts: ScoringMatrixParts) -> Result<Self> {
        Ok(Self::new(parts.dist_bins, parts.dot_bins, parts.cells)?
            .with_interpolation(parts.interpolation))
    }
}

#[cfg(feature = "serde")]
impl From<ScoringMatrix> for ScoringMatrixParts {
    fn from(smat: ScoringMatrix) -> Self {
        Self {
            dist_bins: smat.dist_lookup.boundaries().to_vec(),
            dot_bins: smat.dot_lookup.boundaries().to_vec(),
            cells: smat.cells,
            interpolation: smat.interpolation,
        }
    }
}
