use bincode::{Decode, Encode};
use std::ops::Range;

use crate::packing::Packer;

const NO_COLUMN: u32 = u32::MAX;
const NO_CHILD: i32 = -1;

/// Compressed-sparse-column matrix of binary-rule log probabilities, indexed by packed child pair.
///
/// Only populated columns are stored. `column_index` maps a packed key straight
/// to its populated column, so finding a column is O(1); within a column the
/// parents are strictly ascending. Populated columns are ordered by the
/// packer's indexed child, and `child_start` / `child_end` give each child's
/// run of columns (-1 when the child heads no column).
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct CscMatrix {
  column_index: Vec<u32>,
  populated_columns: Vec<i32>,
  column_offsets: Vec<u32>,
  row_indices: Vec<u32>,
  probabilities: Vec<f32>,
  child_start: Vec<i32>,
  child_end: Vec<i32>,
}

/// Mutable construction state of a [`CscMatrix`]
#[derive(Debug, Clone, Default)]
pub struct CscBuilder {
  entries: Vec<(i32, u32, f32)>,
}

impl CscBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  /// `key` must be a valid binary key of the packer passed to [`CscBuilder::seal`]
  pub fn add(&mut self, key: i32, parent: u32, prob: f32) {
    assert!(key >= 0, "CSC columns hold binary keys only, got {}", key);
    self.entries.push((key, parent, prob));
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Freezes the entries. For a repeated (key, parent) the first one added wins.
  pub fn seal(mut self, packer: &Packer, num_non_terminals: usize) -> CscMatrix {
    self
      .entries
      .sort_by_key(|&(key, parent, _)| (packer.child_order(key), parent));
    self.entries.dedup_by(|b, a| a.0 == b.0 && a.1 == b.1);

    let mut column_index = vec![NO_COLUMN; packer.packed_array_size()];
    let mut populated_columns = Vec::new();
    let mut column_offsets = vec![0u32];
    let mut child_start = vec![NO_CHILD; num_non_terminals];
    let mut child_end = vec![NO_CHILD; num_non_terminals];

    for (i, &(key, _, _)) in self.entries.iter().enumerate() {
      if populated_columns.last() == Some(&key) {
        continue;
      }
      if !populated_columns.is_empty() {
        column_offsets.push(i as u32);
      }
      let column = populated_columns.len();
      column_index[key as usize] = column as u32;
      populated_columns.push(key);

      let child = packer.child_order(key).0 as usize;
      if child_start[child] == NO_CHILD {
        child_start[child] = column as i32;
      }
      child_end[child] = column as i32 + 1;
    }
    column_offsets.push(self.entries.len() as u32);
    if populated_columns.is_empty() {
      column_offsets.truncate(1);
    }

    let (row_indices, probabilities) = self
      .entries
      .into_iter()
      .map(|(_, parent, prob)| (parent, prob))
      .unzip();

    CscMatrix {
      column_index,
      populated_columns,
      column_offsets,
      row_indices,
      probabilities,
      child_start,
      child_end,
    }
  }
}

impl CscMatrix {
  /// Log probability of `parent -> key`, or -inf if absent. Keys outside the
  /// binary range (including `INVALID_KEY`) are simply absent.
  #[inline]
  pub fn get(&self, parent: u32, key: i32) -> f32 {
    let Some(column) = self.column_of(key) else {
      return f32::NEG_INFINITY;
    };
    let range = self.column_range(column);
    match self.row_indices[range.clone()].binary_search(&parent) {
      Ok(i) => self.probabilities[range.start + i],
      Err(_) => f32::NEG_INFINITY,
    }
  }

  /// Populated column holding `key`
  #[inline]
  pub fn column_of(&self, key: i32) -> Option<usize> {
    if key < 0 {
      return None;
    }
    match self.column_index.get(key as usize) {
      Some(&column) if column != NO_COLUMN => Some(column as usize),
      _ => None,
    }
  }

  #[inline]
  pub fn column_range(&self, column: usize) -> Range<usize> {
    self.column_offsets[column] as usize..self.column_offsets[column + 1] as usize
  }

  /// Parents and log probabilities of one populated column
  #[inline]
  pub fn column(&self, column: usize) -> (&[u32], &[f32]) {
    let range = self.column_range(column);
    (&self.row_indices[range.clone()], &self.probabilities[range])
  }

  #[inline]
  pub fn column_key(&self, column: usize) -> i32 {
    self.populated_columns[column]
  }

  /// The run of populated columns whose indexed child is `child`. Panics if
  /// `child` is not a non-terminal index.
  #[inline]
  pub fn child_columns(&self, child: u32) -> Range<usize> {
    let start = self.child_start[child as usize];
    if start == NO_CHILD {
      return 0..0;
    }
    start as usize..self.child_end[child as usize] as usize
  }

  pub fn num_populated_columns(&self) -> usize {
    self.populated_columns.len()
  }

  /// Number of stored entries
  pub fn len(&self) -> usize {
    self.row_indices.len()
  }

  pub fn is_empty(&self) -> bool {
    self.row_indices.is_empty()
  }

  pub fn populated_columns(&self) -> &[i32] {
    &self.populated_columns
  }

  pub fn column_offsets(&self) -> &[u32] {
    &self.column_offsets
  }

  pub fn row_indices(&self) -> &[u32] {
    &self.row_indices
  }

  pub fn probabilities(&self) -> &[f32] {
    &self.probabilities
  }

  /// Structural consistency against the packer it was built with, for matrices
  /// read back from an image
  pub fn is_well_formed(&self, packer: &Packer, num_non_terminals: usize) -> bool {
    let columns = self.populated_columns.len();
    let offsets_ok = self.column_offsets.len() == columns + 1
      && self.column_offsets[0] == 0
      && self.column_offsets[columns] as usize == self.row_indices.len()
      && self.column_offsets.windows(2).all(|w| w[0] < w[1] || (columns == 0 && w[0] == w[1]));
    if !offsets_ok || self.probabilities.len() != self.row_indices.len() {
      return false;
    }
    if self.column_index.len() != packer.packed_array_size()
      || self.child_start.len() != num_non_terminals
      || self.child_end.len() != num_non_terminals
    {
      return false;
    }
    if !self.populated_columns.iter().all(|&key| packer.is_binary_key(key)) {
      return false;
    }

    // column_index and populated_columns must be inverse bijections
    let mut indexed = 0;
    for &column in self.column_index.iter().filter(|&&column| column != NO_COLUMN) {
      if column as usize >= columns {
        return false;
      }
      indexed += 1;
    }
    let index_ok = indexed == columns
      && self
        .populated_columns
        .iter()
        .enumerate()
        .all(|(c, &key)| self.column_index[key as usize] as usize == c);
    let order_ok = self
      .populated_columns
      .windows(2)
      .all(|w| packer.child_order(w[0]) < packer.child_order(w[1]));
    if !index_ok || !order_ok {
      return false;
    }

    let rows_ok = (0..columns).all(|c| {
      self.row_indices[self.column_range(c)]
        .windows(2)
        .all(|w| w[0] < w[1])
    });
    if !rows_ok {
      return false;
    }

    let mut child_start = vec![NO_CHILD; num_non_terminals];
    let mut child_end = vec![NO_CHILD; num_non_terminals];
    for (c, &key) in self.populated_columns.iter().enumerate() {
      let child = packer.child_order(key).0 as usize;
      if child >= num_non_terminals {
        return false;
      }
      if child_start[child] == NO_CHILD {
        child_start[child] = c as i32;
      }
      child_end[child] = c as i32 + 1;
    }
    child_start == self.child_start && child_end == self.child_end
  }
}
