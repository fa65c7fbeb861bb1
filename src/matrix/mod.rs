//! Sealed sparse storage for rule probabilities.

mod csc;
mod csr;

pub use csc::{CscBuilder, CscMatrix};
pub use csr::{CsrBuilder, CsrMatrix};

use std::fmt;
use std::str::FromStr;

/// Which binary-rule matrices a compiled grammar keeps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatrixLayout {
  /// Rows by parent, for "all rules with parent P"
  Csr,
  /// Columns by child pair, for "all rules with children (L, R)"
  Csc,
  /// Both, for inside-outside training which walks the grammar both ways
  InsideOutside,
}

impl MatrixLayout {
  pub const ALL: [MatrixLayout; 3] = [MatrixLayout::Csr, MatrixLayout::Csc, MatrixLayout::InsideOutside];

  pub(crate) fn tag(self) -> u8 {
    self as u8
  }

  pub(crate) fn from_tag(tag: u8) -> Option<Self> {
    Self::ALL.get(tag as usize).copied()
  }

  pub fn has_csr(self) -> bool {
    matches!(self, Self::Csr | Self::InsideOutside)
  }

  pub fn has_csc(self) -> bool {
    matches!(self, Self::Csc | Self::InsideOutside)
  }
}

impl fmt::Display for MatrixLayout {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::Csr => "csr",
      Self::Csc => "csc",
      Self::InsideOutside => "inside-outside",
    };
    write!(f, "{}", name)
  }
}

impl FromStr for MatrixLayout {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::ALL
      .into_iter()
      .find(|layout| layout.to_string() == s)
      .ok_or_else(|| format!("unknown matrix layout `{}`", s))
  }
}
