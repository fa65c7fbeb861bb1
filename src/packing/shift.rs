use bit_vec::BitVec;

use super::{INVALID_KEY, IndexedChild, PackingFunction, bits_needed};
use crate::error::{GrammarError, GrammarResult};

/// Dense packing: the high-order child shifted above the low-order child.
///
/// Children at or beyond their bound are rejected with [`INVALID_KEY`], so a
/// masked child can never alias a different pair.
#[derive(Debug, Clone, PartialEq)]
pub struct ShiftLayout {
  shift: u32,
  mask: i32,
  high_bound: u32,
  low_bound: u32,
}

impl ShiftLayout {
  /// `high_bound` / `low_bound` are one past the largest child index in each position
  pub fn new(high_bound: u32, low_bound: u32) -> GrammarResult<Self> {
    let shift = bits_needed(low_bound);
    let size = (high_bound as u64) << shift;
    if size > i32::MAX as u64 + 1 {
      return Err(GrammarError::KeySpaceOverflow(format!(
        "{} x 2^{} child pairs do not fit a 32-bit key",
        high_bound, shift
      )));
    }
    Ok(Self {
      shift,
      mask: ((1u64 << shift) - 1) as i32,
      high_bound,
      low_bound,
    })
  }

  #[inline]
  pub fn pack(&self, high: u32, low: u32) -> i32 {
    if high >= self.high_bound || low >= self.low_bound {
      return INVALID_KEY;
    }
    ((high as i32) << self.shift) | (low as i32 & self.mask)
  }

  #[inline]
  pub fn unpack_high(&self, key: i32) -> u32 {
    (key >> self.shift) as u32
  }

  #[inline]
  pub fn unpack_low(&self, key: i32) -> u32 {
    (key & self.mask) as u32
  }

  pub fn shift(&self) -> u32 {
    self.shift
  }

  pub fn high_bound(&self) -> u32 {
    self.high_bound
  }

  pub fn low_bound(&self) -> u32 {
    self.low_bound
  }

  pub fn size(&self) -> usize {
    (self.high_bound as usize) << self.shift
  }
}

/// `left << shift | right`
#[derive(Debug, Clone, PartialEq)]
pub struct LeftShiftFunction {
  layout: ShiftLayout,
}

impl LeftShiftFunction {
  pub fn new(left_bound: u32, right_bound: u32) -> GrammarResult<Self> {
    Ok(Self {
      layout: ShiftLayout::new(left_bound, right_bound)?,
    })
  }

  pub fn layout(&self) -> &ShiftLayout {
    &self.layout
  }
}

impl PackingFunction for LeftShiftFunction {
  #[inline]
  fn pack(&self, left: u32, right: u32) -> i32 {
    self.layout.pack(left, right)
  }

  #[inline]
  fn unpack_left(&self, key: i32) -> u32 {
    self.layout.unpack_high(key)
  }

  #[inline]
  fn unpack_right(&self, key: i32) -> u32 {
    self.layout.unpack_low(key)
  }

  fn packed_array_size(&self) -> usize {
    self.layout.size()
  }
}

/// `right << shift | left`, so keys sharing a right child are contiguous.
/// Used for outside passes that walk the grammar by right child.
#[derive(Debug, Clone, PartialEq)]
pub struct RightShiftFunction {
  layout: ShiftLayout,
}

impl RightShiftFunction {
  pub fn new(left_bound: u32, right_bound: u32) -> GrammarResult<Self> {
    Ok(Self {
      layout: ShiftLayout::new(right_bound, left_bound)?,
    })
  }

  pub fn layout(&self) -> &ShiftLayout {
    &self.layout
  }
}

impl PackingFunction for RightShiftFunction {
  #[inline]
  fn pack(&self, left: u32, right: u32) -> i32 {
    self.layout.pack(right, left)
  }

  #[inline]
  fn unpack_left(&self, key: i32) -> u32 {
    self.layout.unpack_low(key)
  }

  #[inline]
  fn unpack_right(&self, key: i32) -> u32 {
    self.layout.unpack_high(key)
  }

  fn packed_array_size(&self) -> usize {
    self.layout.size()
  }

  fn indexed_child(&self) -> IndexedChild {
    IndexedChild::Right
  }
}

/// Left-shift packing plus a bitset of the pairs seen in the grammar.
/// Any other pair packs to [`INVALID_KEY`].
#[derive(Debug, Clone, PartialEq)]
pub struct ExactFilterFunction {
  inner: LeftShiftFunction,
  observed: BitVec,
}

impl ExactFilterFunction {
  pub fn new(inner: LeftShiftFunction, pairs: impl IntoIterator<Item = (u32, u32)>) -> Self {
    let mut observed = BitVec::from_elem(inner.packed_array_size(), false);
    for (left, right) in pairs {
      let key = inner.pack(left, right);
      if key != INVALID_KEY {
        observed.set(key as usize, true);
      }
    }
    Self { inner, observed }
  }

  /// Rebuilds from the filter's byte form; None if the bit count can't cover the key space
  pub fn from_bytes(inner: LeftShiftFunction, bytes: &[u8]) -> Option<Self> {
    let mut observed = BitVec::from_bytes(bytes);
    if observed.len() < inner.packed_array_size() {
      return None;
    }
    observed.truncate(inner.packed_array_size());
    Some(Self { inner, observed })
  }

  pub fn to_bytes(&self) -> Vec<u8> {
    self.observed.to_bytes()
  }

  pub fn inner(&self) -> &LeftShiftFunction {
    &self.inner
  }

  pub fn observed_pairs(&self) -> usize {
    self.observed.iter().filter(|&b| b).count()
  }
}

impl PackingFunction for ExactFilterFunction {
  #[inline]
  fn pack(&self, left: u32, right: u32) -> i32 {
    let key = self.inner.pack(left, right);
    if key == INVALID_KEY || !self.observed[key as usize] {
      INVALID_KEY
    } else {
      key
    }
  }

  #[inline]
  fn unpack_left(&self, key: i32) -> u32 {
    self.inner.unpack_left(key)
  }

  #[inline]
  fn unpack_right(&self, key: i32) -> u32 {
    self.inner.unpack_right(key)
  }

  fn packed_array_size(&self) -> usize {
    self.inner.packed_array_size()
  }
}
