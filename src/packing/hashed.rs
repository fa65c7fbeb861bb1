use super::shift::LeftShiftFunction;
use super::{INVALID_KEY, PackingFunction};
use crate::error::GrammarResult;
use crate::perfect_hash::{PerfectHash, PerfectHashConfig};

/// Packs a child pair to its slot in a perfect hash over the grammar's observed pairs.
///
/// The key space is only as large as the hash table, which is close to the number
/// of distinct pairs. Unobserved pairs are detected through the stored inverse
/// table and pack to [`INVALID_KEY`].
#[derive(Debug, Clone, PartialEq)]
pub struct PerfectHashFunction {
  shift: LeftShiftFunction,
  hash: PerfectHash,
}

impl PerfectHashFunction {
  pub fn build(
    shift: LeftShiftFunction,
    pairs: impl IntoIterator<Item = (u32, u32)>,
    config: &PerfectHashConfig,
  ) -> GrammarResult<Self> {
    let keys = pairs
      .into_iter()
      .map(|(left, right)| shift.pack(left, right))
      .filter(|&key| key != INVALID_KEY)
      .collect::<Vec<_>>();
    let hash = PerfectHash::build(&keys, shift.layout().shift(), config)?;
    Ok(Self { shift, hash })
  }

  /// None if the hash was built over a different key layout
  pub fn from_parts(shift: LeftShiftFunction, hash: PerfectHash) -> Option<Self> {
    (hash.shift() == shift.layout().shift()).then_some(Self { shift, hash })
  }

  pub fn shift_function(&self) -> &LeftShiftFunction {
    &self.shift
  }

  pub fn hash(&self) -> &PerfectHash {
    &self.hash
  }

  fn original_key(&self, key: i32) -> i32 {
    self
      .hash
      .key(key as usize)
      .unwrap_or_else(|| panic!("packed key {} is not an observed child pair", key))
  }
}

impl PackingFunction for PerfectHashFunction {
  #[inline]
  fn pack(&self, left: u32, right: u32) -> i32 {
    let key = self.shift.pack(left, right);
    if key == INVALID_KEY {
      return INVALID_KEY;
    }
    self.hash.get(key).map_or(INVALID_KEY, |slot| slot as i32)
  }

  fn unpack_left(&self, key: i32) -> u32 {
    self.shift.unpack_left(self.original_key(key))
  }

  fn unpack_right(&self, key: i32) -> u32 {
    self.shift.unpack_right(self.original_key(key))
  }

  fn packed_array_size(&self) -> usize {
    self.hash.size()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_pack_observed_pairs_only() {
    let pairs = [(0, 3), (0, 4), (2, 1), (5, 0), (5, 4)];
    let shift = LeftShiftFunction::new(6, 5).unwrap();
    let f = PerfectHashFunction::build(shift.clone(), pairs, &PerfectHashConfig::default()).unwrap();

    assert!(f.packed_array_size() <= shift.packed_array_size());
    let mut keys = Vec::new();
    for &(left, right) in pairs.iter() {
      let key = f.pack(left, right);
      assert!(key >= 0 && (key as usize) < f.packed_array_size());
      assert_eq!((f.unpack_left(key), f.unpack_right(key)), (left, right));
      keys.push(key);
    }
    keys.sort_unstable();
    keys.dedup();
    assert_eq!(keys.len(), pairs.len());

    assert_eq!(f.pack(1, 1), INVALID_KEY);
    assert_eq!(f.pack(0, 0), INVALID_KEY);
    assert_eq!(f.pack(6, 0), INVALID_KEY);
  }

  #[test]
  fn test_from_parts_checks_layout() {
    let shift = LeftShiftFunction::new(6, 5).unwrap();
    let f = PerfectHashFunction::build(shift, [(1, 1)], &PerfectHashConfig::default()).unwrap();
    let other = LeftShiftFunction::new(6, 100).unwrap();
    assert!(PerfectHashFunction::from_parts(other, f.hash().clone()).is_none());
    assert!(PerfectHashFunction::from_parts(f.shift_function().clone(), f.hash().clone()).is_some());
  }
}
