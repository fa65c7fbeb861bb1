//! Symbol tables for non-terminals and words, and the partition of the
//! non-terminal index space into contiguous child classes.
//!
//! Non-terminal indices are assigned once, sorted by class and then by label,
//! so that "is this a valid left child?" is a pair of integer comparisons and
//! the same grammar text always produces the same indices.

use rustc_hash::FxHashMap;
use std::collections::BTreeSet;
use std::fmt;
use std::ops::Range;

use crate::error::{GrammarError, GrammarResult};
use crate::parse_grammar::{GrammarSource, TextRule};

/// Label of the padding / boundary non-terminal, which is never a valid child
pub const NULL_SYMBOL: &str = "<null>";

/// Bidirectional label <-> index map
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SymbolSet {
  index: FxHashMap<Box<str>, u32>,
  symbols: Vec<Box<str>>,
}

impl SymbolSet {
  pub fn new() -> Self {
    Self::default()
  }

  /// Returns the existing index of `label`, or assigns the next one
  pub fn add_symbol(&mut self, label: &str) -> u32 {
    if let Some(&idx) = self.index.get(label) {
      return idx;
    }
    let idx = self.symbols.len() as u32;
    let boxed: Box<str> = label.into();
    self.index.insert(boxed.clone(), idx);
    self.symbols.push(boxed);
    idx
  }

  pub fn index_of(&self, label: &str) -> Option<u32> {
    self.index.get(label).copied()
  }

  /// Panics if `idx` was never assigned
  pub fn symbol(&self, idx: u32) -> &str {
    &self.symbols[idx as usize]
  }

  pub fn len(&self) -> usize {
    self.symbols.len()
  }

  pub fn is_empty(&self) -> bool {
    self.symbols.is_empty()
  }

  /// Labels in index order
  pub fn iter(&self) -> impl Iterator<Item = &str> {
    self.symbols.iter().map(|s| &**s)
  }
}

impl<'a> FromIterator<&'a str> for SymbolSet {
  fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
    let mut set = SymbolSet::new();
    for label in iter {
      set.add_symbol(label);
    }
    set
  }
}

/// The position class of a non-terminal, in index order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SymbolClass {
  RightChildOnly,
  EitherChild,
  LeftChildOnly,
  PartOfSpeech,
  UnaryChildOnly,
}

impl SymbolClass {
  pub const ALL: [SymbolClass; 5] = [
    SymbolClass::RightChildOnly,
    SymbolClass::EitherChild,
    SymbolClass::LeftChildOnly,
    SymbolClass::PartOfSpeech,
    SymbolClass::UnaryChildOnly,
  ];
}

impl fmt::Display for SymbolClass {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::RightChildOnly => "right-child-only",
      Self::EitherChild => "either-child",
      Self::LeftChildOnly => "left-child-only",
      Self::PartOfSpeech => "part-of-speech",
      Self::UnaryChildOnly => "unary-child-only",
    };
    write!(f, "{}", name)
  }
}

/// First index of each class; an empty class starts where the next one does.
/// `starts[i] <= starts[i + 1]` always holds, and `end` is the null symbol's index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Boundaries {
  starts: [u32; 5],
  end: u32,
}

impl Boundaries {
  pub fn from_starts(starts: [u32; 5], end: u32) -> Option<Self> {
    let monotonic = starts.windows(2).all(|w| w[0] <= w[1]) && starts[4] <= end && starts[0] == 0;
    monotonic.then_some(Self { starts, end })
  }

  pub fn starts(&self) -> [u32; 5] {
    self.starts
  }

  pub fn end(&self) -> u32 {
    self.end
  }

  pub fn range(&self, class: SymbolClass) -> Range<u32> {
    let i = class as usize;
    let end = if i + 1 < self.starts.len() {
      self.starts[i + 1]
    } else {
      self.end
    };
    self.starts[i]..end
  }

  pub fn right_children_start(&self) -> u32 {
    self.starts[SymbolClass::RightChildOnly as usize]
  }

  /// End of the right-only and either-child ranges; POS tags are valid right children too
  pub fn right_children_end(&self) -> u32 {
    self.starts[SymbolClass::LeftChildOnly as usize]
  }

  pub fn left_children_start(&self) -> u32 {
    self.starts[SymbolClass::EitherChild as usize]
  }

  pub fn left_children_end(&self) -> u32 {
    self.starts[SymbolClass::UnaryChildOnly as usize]
  }

  pub fn pos_start(&self) -> u32 {
    self.starts[SymbolClass::PartOfSpeech as usize]
  }

  pub fn pos_end(&self) -> u32 {
    self.starts[SymbolClass::UnaryChildOnly as usize]
  }
}

/// The non-terminal vocabulary of a compiled grammar
#[derive(Debug, Clone, PartialEq)]
pub struct Vocabulary {
  symbols: SymbolSet,
  boundaries: Boundaries,
  start: u32,
  null: u32,
}

#[derive(Debug, Default, Clone, Copy)]
struct Occurrence {
  lexical_parent: bool,
  left: bool,
  right: bool,
}

impl Vocabulary {
  /// Partitions every non-terminal of `source` into its class and assigns indices
  pub fn from_source(source: &GrammarSource) -> GrammarResult<Self> {
    Self::partition_and_sort(&source.header.start, &source.binary, &source.unary, &source.lexical)
  }

  /// Classifies each non-terminal (first match wins):
  /// lexical parent => POS; the start symbol => either-child if it is ever a
  /// binary child, otherwise unary-only; left and right child => either-child;
  /// left only => left-only; right only => right-only; anything else => unary-only.
  /// Each class is sorted by label and the classes are laid out in
  /// [`SymbolClass::ALL`] order, followed by the null symbol.
  pub fn partition_and_sort(
    start: &str,
    binary: &[TextRule],
    unary: &[TextRule],
    lexical: &[TextRule],
  ) -> GrammarResult<Self> {
    if start.is_empty() {
      return Err(GrammarError::malformed(1, start, "no start symbol declared"));
    }

    let mut seen: FxHashMap<&str, Occurrence> = FxHashMap::default();
    for rule in binary.iter().chain(unary.iter()).chain(lexical.iter()) {
      if rule.parent == NULL_SYMBOL || rule.left == NULL_SYMBOL || rule.right.as_deref() == Some(NULL_SYMBOL) {
        return Err(GrammarError::malformed(
          rule.line,
          &rule.to_string(),
          format!("{} is a reserved symbol", NULL_SYMBOL),
        ));
      }
    }

    seen.entry(start).or_default();
    for rule in binary {
      seen.entry(&rule.parent).or_default();
      seen.entry(&rule.left).or_default().left = true;
      if let Some(right) = &rule.right {
        seen.entry(right).or_default().right = true;
      }
    }
    for rule in unary {
      seen.entry(&rule.parent).or_default();
      seen.entry(&rule.left).or_default();
    }
    for rule in lexical {
      seen.entry(&rule.parent).or_default().lexical_parent = true;
    }

    let mut classes: [BTreeSet<&str>; 5] = Default::default();
    for (&label, occ) in seen.iter() {
      let class = if occ.lexical_parent {
        SymbolClass::PartOfSpeech
      } else if label == start {
        if occ.left || occ.right {
          SymbolClass::EitherChild
        } else {
          SymbolClass::UnaryChildOnly
        }
      } else if occ.left && occ.right {
        SymbolClass::EitherChild
      } else if occ.left {
        SymbolClass::LeftChildOnly
      } else if occ.right {
        SymbolClass::RightChildOnly
      } else {
        SymbolClass::UnaryChildOnly
      };
      classes[class as usize].insert(label);
    }

    let mut symbols = SymbolSet::new();
    let mut starts = [0u32; 5];
    for class in SymbolClass::ALL {
      starts[class as usize] = symbols.len() as u32;
      for label in classes[class as usize].iter() {
        symbols.add_symbol(label);
      }
    }
    let end = symbols.len() as u32;
    let null = symbols.add_symbol(NULL_SYMBOL);

    let boundaries = Boundaries { starts, end };
    let start = symbols
      .index_of(start)
      .ok_or_else(|| GrammarError::malformed(1, start, "start symbol was not partitioned"))?;

    Ok(Self {
      symbols,
      boundaries,
      start,
      null,
    })
  }

  /// Rebuilds a vocabulary from its labels in index order, e.g. from a saved image.
  /// The null symbol must be the last label.
  pub fn from_parts(labels: Vec<String>, boundaries: Boundaries, start: u32) -> Option<Self> {
    let symbols = labels.iter().map(String::as_str).collect::<SymbolSet>();
    if symbols.len() != labels.len() || symbols.len() as u32 != boundaries.end() + 1 {
      return None;
    }
    let null = boundaries.end();
    if symbols.symbol(null) != NULL_SYMBOL || start >= null {
      return None;
    }
    Some(Self {
      symbols,
      boundaries,
      start,
      null,
    })
  }

  /// Number of non-terminals, including the null symbol
  pub fn num_non_terminals(&self) -> usize {
    self.symbols.len()
  }

  pub fn index_of(&self, label: &str) -> Option<u32> {
    self.symbols.index_of(label)
  }

  pub fn symbol(&self, nt: u32) -> &str {
    self.symbols.symbol(nt)
  }

  pub fn symbols(&self) -> &SymbolSet {
    &self.symbols
  }

  pub fn boundaries(&self) -> &Boundaries {
    &self.boundaries
  }

  pub fn start_symbol(&self) -> u32 {
    self.start
  }

  pub fn null_symbol(&self) -> u32 {
    self.null
  }

  /// None for the null symbol. Panics on indices outside the vocabulary.
  pub fn class_of(&self, nt: u32) -> Option<SymbolClass> {
    assert!(
      (nt as usize) < self.symbols.len(),
      "non-terminal {} out of range",
      nt
    );
    SymbolClass::ALL
      .into_iter()
      .find(|&class| self.boundaries.range(class).contains(&nt))
  }

  #[inline]
  pub fn is_valid_left_child(&self, nt: u32) -> bool {
    nt >= self.boundaries.left_children_start() && nt < self.boundaries.left_children_end()
  }

  #[inline]
  pub fn is_valid_right_child(&self, nt: u32) -> bool {
    (nt >= self.boundaries.right_children_start() && nt < self.boundaries.right_children_end()) || self.is_pos(nt)
  }

  #[inline]
  pub fn is_pos(&self, nt: u32) -> bool {
    nt >= self.boundaries.pos_start() && nt < self.boundaries.pos_end()
  }

  /// Largest index that may appear as a left child
  pub fn max_left_child(&self) -> Option<u32> {
    let b = &self.boundaries;
    (b.left_children_end() > b.left_children_start()).then(|| b.left_children_end() - 1)
  }

  /// Largest index that may appear as a right child
  pub fn max_right_child(&self) -> Option<u32> {
    let b = &self.boundaries;
    if b.pos_end() > b.pos_start() {
      Some(b.pos_end() - 1)
    } else if b.right_children_end() > b.right_children_start() {
      Some(b.right_children_end() - 1)
    } else {
      None
    }
  }
}
