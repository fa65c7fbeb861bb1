use crate::matrix::MatrixLayout;
use crate::packing::PackingStrategy;
use crate::perfect_hash::PerfectHashConfig;

/// How a grammar is compiled: packing strategy, matrix layout and the lexical back-off value
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GrammarConfig {
  pub packing: PackingStrategy,
  pub layout: MatrixLayout,
  /// Returned by lexical lookups for a (POS, word) pair with no rule
  pub unseen_lexical_log_prob: f32,
  pub hash: PerfectHashConfig,
  /// Rebuild with shift packing, with a warning, when the perfect hash can't be built
  pub fallback_to_shift: bool,
}

impl Default for GrammarConfig {
  fn default() -> Self {
    Self {
      packing: PackingStrategy::PerfectHash,
      layout: MatrixLayout::Csc,
      unseen_lexical_log_prob: f32::NEG_INFINITY,
      hash: PerfectHashConfig::default(),
      fallback_to_shift: true,
    }
  }
}

impl GrammarConfig {
  pub fn with_packing(mut self, packing: PackingStrategy) -> Self {
    self.packing = packing;
    self
  }

  pub fn with_layout(mut self, layout: MatrixLayout) -> Self {
    self.layout = layout;
    self
  }

  pub fn with_unseen_lexical_log_prob(mut self, prob: f32) -> Self {
    self.unseen_lexical_log_prob = prob;
    self
  }

  pub fn with_hash(mut self, hash: PerfectHashConfig) -> Self {
    self.hash = hash;
    self
  }

  pub fn with_fallback_to_shift(mut self, fallback: bool) -> Self {
    self.fallback_to_shift = fallback;
    self
  }
}
