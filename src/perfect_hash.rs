//! Collision-free displacement hashing over a fixed set of packed child pairs.
//!
//! A key is split into a bucket (its high bits, i.e. the left child) and an
//! offset (its low bits, the right child). Every bucket gets one displacement,
//! and `slot = displacement[bucket] + offset`. Buckets are placed largest first
//! into the lowest displacement where all of their slots are still free; when
//! some bucket does not fit, the table grows and the whole placement restarts.

use bit_vec::BitVec;
use tracing::debug;

use crate::error::{GrammarError, GrammarResult};

const EMPTY_SLOT: i32 = -1;

/// Retry budget for [`PerfectHash::build`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerfectHashConfig {
  /// Table growth after a failed placement; values <= 1 still grow by one slot
  pub growth_factor: f64,
  pub max_growth_rounds: u32,
}

impl Default for PerfectHashConfig {
  fn default() -> Self {
    Self {
      growth_factor: 1.1,
      max_growth_rounds: 32,
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PerfectHash {
  shift: u32,
  displacements: Vec<i32>,
  keys: Vec<i32>,
}

impl PerfectHash {
  /// Builds a table for `keys`, which must be non-negative. Duplicates are ignored.
  pub fn build(keys: &[i32], shift: u32, config: &PerfectHashConfig) -> GrammarResult<Self> {
    assert!(shift < 31, "offset width {} too large", shift);
    let mut keys = keys.to_vec();
    keys.sort_unstable();
    keys.dedup();
    assert!(keys.first().is_none_or(|&k| k >= 0), "negative key");

    if keys.is_empty() {
      return Ok(Self {
        shift,
        displacements: Vec::new(),
        keys: Vec::new(),
      });
    }

    let mask = (1i32 << shift) - 1;
    let mut buckets: Vec<(usize, Vec<i32>)> = Vec::new();
    for &key in keys.iter() {
      let bucket = (key >> shift) as usize;
      match buckets.last_mut() {
        Some((b, offsets)) if *b == bucket => offsets.push(key & mask),
        _ => buckets.push((bucket, vec![key & mask])),
      }
    }

    // first-fit decreasing; ties by bucket id so the layout is reproducible
    let mut order = (0..buckets.len()).collect::<Vec<_>>();
    order.sort_by_key(|&i| (std::cmp::Reverse(buckets[i].1.len()), buckets[i].0));

    let num_buckets = buckets.last().map_or(0, |(b, _)| b + 1);
    let max_offset = buckets
      .iter()
      .filter_map(|(_, offsets)| offsets.last())
      .max()
      .copied()
      .unwrap_or(0) as usize;

    let mut size = keys.len().max(max_offset + 1);
    for round in 0..=config.max_growth_rounds {
      if let Some((displacements, mut table)) = place(&buckets, &order, num_buckets, shift, size) {
        let used = table.iter().rposition(|&k| k != EMPTY_SLOT).map_or(0, |i| i + 1);
        table.truncate(used);
        debug!(
          keys = keys.len(),
          size = table.len(),
          rounds = round,
          load = keys.len() as f64 / table.len() as f64,
          "built perfect hash"
        );
        return Ok(Self {
          shift,
          displacements,
          keys: table,
        });
      }
      debug!(keys = keys.len(), size, round, "perfect hash placement failed, growing table");
      size = ((size as f64 * config.growth_factor).ceil() as usize).max(size + 1);
    }

    Err(GrammarError::HashConstruction {
      keys: keys.len(),
      table_size: size,
      rounds: config.max_growth_rounds,
    })
  }

  /// Reassembles a table from its arrays, checking that every stored key hashes to its own slot
  pub fn from_parts(shift: u32, displacements: Vec<i32>, keys: Vec<i32>) -> Option<Self> {
    if shift >= 31 {
      return None;
    }
    let hash = Self {
      shift,
      displacements,
      keys,
    };
    let consistent = hash
      .keys
      .iter()
      .enumerate()
      .filter(|&(_, &k)| k != EMPTY_SLOT)
      .all(|(slot, &k)| k >= 0 && hash.hashcode(k) == Some(slot));
    consistent.then_some(hash)
  }

  /// Slot that `key` hashes to. For a key outside the build set this may alias
  /// another key's slot, or be None when it falls outside the table.
  #[inline]
  pub fn hashcode(&self, key: i32) -> Option<usize> {
    let bucket = (key >> self.shift) as usize;
    let displacement = *self.displacements.get(bucket)? as i64;
    let slot = displacement + (key & ((1 << self.shift) - 1)) as i64;
    (slot >= 0 && (slot as usize) < self.keys.len()).then_some(slot as usize)
  }

  /// Slot of `key` if it was in the build set
  #[inline]
  pub fn get(&self, key: i32) -> Option<usize> {
    self.hashcode(key).filter(|&slot| self.keys[slot] == key)
  }

  /// The original key stored in `slot`, or None for an unused slot
  #[inline]
  pub fn key(&self, slot: usize) -> Option<i32> {
    let key = self.keys[slot];
    (key != EMPTY_SLOT).then_some(key)
  }

  /// Number of slots
  pub fn size(&self) -> usize {
    self.keys.len()
  }

  /// Number of keys stored
  pub fn len(&self) -> usize {
    self.keys.iter().filter(|&&k| k != EMPTY_SLOT).count()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn shift(&self) -> u32 {
    self.shift
  }

  pub fn displacements(&self) -> &[i32] {
    &self.displacements
  }

  pub fn slot_keys(&self) -> &[i32] {
    &self.keys
  }
}

fn place(
  buckets: &[(usize, Vec<i32>)],
  order: &[usize],
  num_buckets: usize,
  shift: u32,
  size: usize,
) -> Option<(Vec<i32>, Vec<i32>)> {
  let mut occupied = BitVec::from_elem(size, false);
  let mut table = vec![EMPTY_SLOT; size];
  let mut displacements = vec![0i32; num_buckets];
  let mut first_free = 0usize;

  for &i in order {
    let (bucket, offsets) = &buckets[i];
    let lo = offsets[0] as i64;
    let hi = offsets[offsets.len() - 1] as i64;

    // every slot below first_free is taken, so the lowest offset must land at or after it
    let mut d = first_free as i64 - lo;
    let max_d = size as i64 - 1 - hi;
    let d = loop {
      if d > max_d {
        return None;
      }
      if offsets.iter().all(|&o| !occupied[(d + o as i64) as usize]) {
        break d;
      }
      d += 1;
    };

    for &o in offsets {
      let slot = (d + o as i64) as usize;
      occupied.set(slot, true);
      table[slot] = (*bucket as i32) << shift | o;
    }
    displacements[*bucket] = d as i32;

    while first_free < size && occupied[first_free] {
      first_free += 1;
    }
  }

  Some((displacements, table))
}
