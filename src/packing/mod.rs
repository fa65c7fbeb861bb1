//! Packing functions: child pair <-> single integer key.
//!
//! Binary keys are non-negative. Unary and lexical keys share the negative range,
//! unary first, so the sign and magnitude of a key alone tell the production kind:
//!
//! ```text
//!   binary   [0, packed_array_size)
//!   unary    -(child + 1)                       in [-num_non_terminals, -1]
//!   lexical  -(num_non_terminals + 1 + word)    below that
//! ```

mod hashed;
mod shift;

pub use hashed::PerfectHashFunction;
pub use shift::{ExactFilterFunction, LeftShiftFunction, RightShiftFunction, ShiftLayout};

use std::fmt;
use std::str::FromStr;
use tracing::{debug, debug_span};

use crate::error::{GrammarError, GrammarResult};
use crate::perfect_hash::PerfectHashConfig;
use crate::rules::{LEXICAL_PRODUCTION, Production, UNARY_PRODUCTION};
use crate::vocabulary::Vocabulary;

/// Returned by `pack` for a pair the packing function rejects. Never a valid key.
pub const INVALID_KEY: i32 = i32::MIN;

/// Number of bits needed to hold every value in `0..n`
pub(crate) fn bits_needed(n: u32) -> u32 {
  32 - n.saturating_sub(1).leading_zeros()
}

/// Which child occupies the high-order part of a binary key, and so which
/// child's keys form contiguous runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexedChild {
  Left,
  Right,
}

/// A binary child-pair packing strategy
pub trait PackingFunction {
  /// Key of `(left, right)`, or [`INVALID_KEY`]
  fn pack(&self, left: u32, right: u32) -> i32;

  fn unpack_left(&self, key: i32) -> u32;

  fn unpack_right(&self, key: i32) -> u32;

  /// Binary keys fall in `0..packed_array_size()`
  fn packed_array_size(&self) -> usize;

  fn indexed_child(&self) -> IndexedChild {
    IndexedChild::Left
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PackingStrategy {
  Shift,
  ExactFilter,
  PerfectHash,
  RightShift,
}

impl PackingStrategy {
  pub const ALL: [PackingStrategy; 4] = [
    PackingStrategy::Shift,
    PackingStrategy::ExactFilter,
    PackingStrategy::PerfectHash,
    PackingStrategy::RightShift,
  ];

  pub(crate) fn tag(self) -> u8 {
    self as u8
  }

  pub(crate) fn from_tag(tag: u8) -> Option<Self> {
    Self::ALL.get(tag as usize).copied()
  }
}

impl fmt::Display for PackingStrategy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::Shift => "shift",
      Self::ExactFilter => "exact-filter",
      Self::PerfectHash => "perfect-hash",
      Self::RightShift => "right-shift",
    };
    write!(f, "{}", name)
  }
}

impl FromStr for PackingStrategy {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::ALL
      .into_iter()
      .find(|strategy| strategy.to_string() == s)
      .ok_or_else(|| format!("unknown packing strategy `{}`", s))
  }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PackingKind {
  Shift(LeftShiftFunction),
  ExactFilter(ExactFilterFunction),
  PerfectHash(PerfectHashFunction),
  RightShift(RightShiftFunction),
}

/// The packing function of one compiled grammar: one binary strategy plus the
/// shared unary / lexical key ranges
#[derive(Debug, Clone, PartialEq)]
pub struct Packer {
  num_non_terminals: u32,
  kind: PackingKind,
}

macro_rules! dispatch {
  ($self:ident, $f:ident => $body:expr) => {
    match &$self.kind {
      PackingKind::Shift($f) => $body,
      PackingKind::ExactFilter($f) => $body,
      PackingKind::PerfectHash($f) => $body,
      PackingKind::RightShift($f) => $body,
    }
  };
}

impl Packer {
  /// Builds the packing function for `vocab`. `binary` is the set of binary
  /// productions that will be stored; only the exact-filter and perfect-hash
  /// strategies look at it.
  pub fn build(
    strategy: PackingStrategy,
    vocab: &Vocabulary,
    num_words: usize,
    binary: &[Production],
    hash_config: &PerfectHashConfig,
  ) -> GrammarResult<Self> {
    let _span = debug_span!("packing", %strategy).entered();

    let num_non_terminals = vocab.num_non_terminals() as u64;
    if num_non_terminals + num_words as u64 + 1 > i32::MAX as u64 {
      return Err(GrammarError::KeySpaceOverflow(format!(
        "{} non-terminals and {} words do not fit the unary/lexical key range",
        num_non_terminals, num_words
      )));
    }

    let left_bound = vocab.max_left_child().map_or(0, |nt| nt + 1);
    let right_bound = vocab.max_right_child().map_or(0, |nt| nt + 1);
    let pairs = || {
      binary
        .iter()
        .filter_map(|p| p.right_child().map(|right| (p.left, right)))
    };

    let kind = match strategy {
      PackingStrategy::Shift => PackingKind::Shift(LeftShiftFunction::new(left_bound, right_bound)?),
      PackingStrategy::ExactFilter => {
        let inner = LeftShiftFunction::new(left_bound, right_bound)?;
        PackingKind::ExactFilter(ExactFilterFunction::new(inner, pairs()))
      }
      PackingStrategy::PerfectHash => {
        let inner = LeftShiftFunction::new(left_bound, right_bound)?;
        PackingKind::PerfectHash(PerfectHashFunction::build(inner, pairs(), hash_config)?)
      }
      PackingStrategy::RightShift => PackingKind::RightShift(RightShiftFunction::new(left_bound, right_bound)?),
    };

    let packer = Self {
      num_non_terminals: num_non_terminals as u32,
      kind,
    };
    debug!(
      left_bound,
      right_bound,
      packed_array_size = packer.packed_array_size(),
      "built packing function"
    );
    Ok(packer)
  }

  pub(crate) fn from_kind(num_non_terminals: u32, kind: PackingKind) -> Self {
    Self {
      num_non_terminals,
      kind,
    }
  }

  pub(crate) fn kind(&self) -> &PackingKind {
    &self.kind
  }

  pub fn strategy(&self) -> PackingStrategy {
    match self.kind {
      PackingKind::Shift(_) => PackingStrategy::Shift,
      PackingKind::ExactFilter(_) => PackingStrategy::ExactFilter,
      PackingKind::PerfectHash(_) => PackingStrategy::PerfectHash,
      PackingKind::RightShift(_) => PackingStrategy::RightShift,
    }
  }

  pub fn num_non_terminals(&self) -> u32 {
    self.num_non_terminals
  }

  /// Key of a binary child pair, or [`INVALID_KEY`] if this packing rejects it
  #[inline]
  pub fn pack(&self, left: u32, right: u32) -> i32 {
    dispatch!(self, f => f.pack(left, right))
  }

  #[inline]
  pub fn pack_unary(&self, child: u32) -> i32 {
    -(child as i32) - 1
  }

  #[inline]
  pub fn pack_lexical(&self, word: u32) -> i32 {
    -(self.num_non_terminals as i32) - 1 - word as i32
  }

  /// Key of any production's children
  pub fn pack_production(&self, p: &Production) -> i32 {
    match p.right {
      UNARY_PRODUCTION => self.pack_unary(p.left),
      LEXICAL_PRODUCTION => self.pack_lexical(p.left),
      right => self.pack(p.left, right as u32),
    }
  }

  /// The left child of a binary key, the child of a unary key, or the word of a lexical key
  #[inline]
  pub fn unpack_left(&self, key: i32) -> u32 {
    if key >= 0 {
      return dispatch!(self, f => f.unpack_left(key));
    }
    let n = self.num_non_terminals as i32;
    if key >= -n {
      (-key - 1) as u32
    } else {
      (-key - 1 - n) as u32
    }
  }

  /// The right child of a binary key, or [`UNARY_PRODUCTION`] / [`LEXICAL_PRODUCTION`]
  #[inline]
  pub fn unpack_right(&self, key: i32) -> i32 {
    if key >= 0 {
      let right = dispatch!(self, f => f.unpack_right(key));
      right as i32
    } else if key >= -(self.num_non_terminals as i32) {
      UNARY_PRODUCTION
    } else {
      LEXICAL_PRODUCTION
    }
  }

  pub fn packed_array_size(&self) -> usize {
    dispatch!(self, f => f.packed_array_size())
  }

  pub fn indexed_child(&self) -> IndexedChild {
    dispatch!(self, f => f.indexed_child())
  }

  /// `(indexed child, other child)` of a binary key; sorting columns by this
  /// keeps every indexed child's keys in one contiguous run
  #[inline]
  pub fn child_order(&self, key: i32) -> (u32, u32) {
    let left = self.unpack_left(key);
    let right = self.unpack_right(key) as u32;
    match self.indexed_child() {
      IndexedChild::Left => (left, right),
      IndexedChild::Right => (right, left),
    }
  }

  /// True if `key` is a binary key this packing produces for some child pair.
  /// Unpacking any other non-negative key may panic or name children outside
  /// the vocabulary.
  pub fn is_binary_key(&self, key: i32) -> bool {
    if key < 0 || key as usize >= self.packed_array_size() {
      return false;
    }
    if let PackingKind::PerfectHash(f) = &self.kind {
      if f.hash().key(key as usize).is_none() {
        return false;
      }
    }
    self.pack(self.unpack_left(key), self.unpack_right(key) as u32) == key
  }
}
