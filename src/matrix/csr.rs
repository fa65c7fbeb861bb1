use bincode::{Decode, Encode};
use std::ops::Range;

/// Compressed-sparse-row matrix of log probabilities.
///
/// `row_offsets[r]..row_offsets[r + 1]` delimits row `r`'s run in `column_keys` /
/// `probabilities`, with keys strictly ascending inside the run.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct CsrMatrix {
  row_offsets: Vec<u32>,
  column_keys: Vec<i32>,
  probabilities: Vec<f32>,
}

/// Mutable construction state of a [`CsrMatrix`]
#[derive(Debug, Clone)]
pub struct CsrBuilder {
  num_rows: usize,
  entries: Vec<(u32, i32, f32)>,
}

impl CsrBuilder {
  pub fn new(num_rows: usize) -> Self {
    Self {
      num_rows,
      entries: Vec::new(),
    }
  }

  pub fn add(&mut self, row: u32, key: i32, prob: f32) {
    assert!((row as usize) < self.num_rows, "row {} out of range", row);
    self.entries.push((row, key, prob));
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Freezes the entries. For a repeated (row, key) the first one added wins.
  pub fn seal(mut self) -> CsrMatrix {
    self.entries.sort_by_key(|&(row, key, _)| (row, key));
    self.entries.dedup_by(|b, a| a.0 == b.0 && a.1 == b.1);

    let mut row_offsets = vec![0u32; self.num_rows + 1];
    for &(row, _, _) in self.entries.iter() {
      row_offsets[row as usize + 1] += 1;
    }
    for r in 0..self.num_rows {
      row_offsets[r + 1] += row_offsets[r];
    }

    let (column_keys, probabilities) = self.entries.into_iter().map(|(_, key, prob)| (key, prob)).unzip();
    CsrMatrix {
      row_offsets,
      column_keys,
      probabilities,
    }
  }
}

impl CsrMatrix {
  /// Log probability at (row, key), or -inf if absent. Panics if `row` is out of range.
  #[inline]
  pub fn get(&self, row: u32, key: i32) -> f32 {
    let range = self.row_range(row);
    match self.column_keys[range.clone()].binary_search(&key) {
      Ok(i) => self.probabilities[range.start + i],
      Err(_) => f32::NEG_INFINITY,
    }
  }

  #[inline]
  pub fn row_range(&self, row: u32) -> Range<usize> {
    let row = row as usize;
    self.row_offsets[row] as usize..self.row_offsets[row + 1] as usize
  }

  /// Keys and log probabilities of one row
  #[inline]
  pub fn row(&self, row: u32) -> (&[i32], &[f32]) {
    let range = self.row_range(row);
    (&self.column_keys[range.clone()], &self.probabilities[range])
  }

  pub fn num_rows(&self) -> usize {
    self.row_offsets.len() - 1
  }

  /// Number of stored entries
  pub fn len(&self) -> usize {
    self.column_keys.len()
  }

  pub fn is_empty(&self) -> bool {
    self.column_keys.is_empty()
  }

  pub fn row_offsets(&self) -> &[u32] {
    &self.row_offsets
  }

  pub fn column_keys(&self) -> &[i32] {
    &self.column_keys
  }

  pub fn probabilities(&self) -> &[f32] {
    &self.probabilities
  }

  /// Structural consistency, for matrices read back from an image
  pub fn is_well_formed(&self) -> bool {
    let Some(&last) = self.row_offsets.last() else {
      return false;
    };
    self.row_offsets[0] == 0
      && last as usize == self.column_keys.len()
      && self.probabilities.len() == self.column_keys.len()
      && self.row_offsets.windows(2).all(|w| w[0] <= w[1])
      && (0..self.num_rows()).all(|r| {
        self.column_keys[self.row_range(r as u32)]
          .windows(2)
          .all(|w| w[0] < w[1])
      })
  }
}
