//! Settings shared by dotprops construction and batch scoring.
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{DotpropsBuilder, NblastError, Result, Symmetry, TangentMethod};

/// Default number of points used to calculate each tangent, including the point itself.
pub const DEFAULT_K: usize = 5;

/// How many workers a batch job runs on.
///
/// Without the `parallel` feature, everything runs serially regardless.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Parallelism {
    /// Run on the calling thread.
    Serial,
    /// One worker per available CPU.
    #[default]
    Auto,
    /// Exactly this many workers; must be at least 1.
    Threads(usize),
}

/// Knobs for building dotprops and scoring them.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct NblastConfig {
    /// Neighborhood size for tangent fitting.
    pub k: usize,
    pub tangent_method: TangentMethod,
    /// Divide each score by the query's self-hit score.
    pub normalize: bool,
    /// Scale tangent dot products by the points' colinearity.
    pub use_alpha: bool,
    /// If set, combine forward and backward scores.
    pub symmetry: Option<Symmetry>,
    pub parallelism: Parallelism,
}

impl Default for NblastConfig {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            tangent_method: TangentMethod::default(),
            normalize: false,
            use_alpha: false,
            symmetry: None,
            parallelism: Parallelism::default(),
        }
    }
}

impl NblastConfig {
    pub fn with_k(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    pub fn with_tangent_method(mut self, tangent_method: TangentMethod) -> Self {
        self.tangent_method = tangent_method;
        self
    }

    pub fn with_normalize(mut self, normalize: bool) -> Self {
        self.normalize = normalize;
        self
    }

    pub fn with_use_alpha(mut self, use_alpha: bool) -> Self {
        self.use_alpha = use_alpha;
        self
    }

    pub fn with_symmetry(mut self, symmetry: Option<Symmetry>) -> Self {
        self.symmetry = symmetry;
        self
    }

    pub fn with_parallelism(mut self, parallelism: Parallelism) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.k < 1 {
            return Err(NblastError::invalid_parameter("k must be >= 1"));
        }
        if let Parallelism::Threads(0) = self.parallelism {
            return Err(NblastError::invalid_parameter(
                "thread count must be >= 1; use Parallelism::Auto for all CPUs",
            ));
        }
        if let TangentMethod::PowerIteration { iterations: 0 } = self.tangent_method {
            return Err(NblastError::invalid_parameter(
                "power iteration needs at least 1 iteration",
            ));
        }
        Ok(())
    }

    /// A dotprops builder using this config's `k` and tangent method.
    pub fn dotprops_builder(&self) -> DotpropsBuilder {
        let mut builder = DotpropsBuilder::new(self.k);
        builder.set_tangent_method(self.tangent_method);
        builder
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_is_valid() {
        let config = NblastConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.k, DEFAULT_K);
        assert_eq!(config.parallelism, Parallelism::Auto);
        assert!(!config.normalize);
    }

    #[test]
    fn invalid_settings() {
        assert!(NblastConfig::default().with_k(0).validate().is_err());
        assert!(NblastConfig::default()
            .with_parallelism(Parallelism::Threads(0))
            .validate()
            .is_err());
        assert!(NblastConfig::default()
            .with_tangent_method(TangentMethod::PowerIteration { iterations: 0 })
            .validate()
            .is_err());
        assert!(NblastConfig::default()
            .with_parallelism(Parallelism::Threads(2))
            .validate()
            .is_ok());
    }

    #[test]
    fn builder_uses_k() {
        let builder = NblastConfig::default().with_k(7).dotprops_builder();
        assert_eq!(builder.k(), 7);
    }
}
