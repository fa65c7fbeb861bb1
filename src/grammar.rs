//! The compiled grammar: vocabulary, packing function and sealed rule matrices
//! behind the lookup API a chart parser calls.

use rustc_hash::FxHashSet;
use std::fmt;
use std::fs;
use std::ops::Range;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, debug_span, info, warn};

use crate::config::GrammarConfig;
use crate::error::{GrammarError, GrammarResult};
use crate::matrix::{CscBuilder, CscMatrix, CsrBuilder, CsrMatrix, MatrixLayout};
use crate::packing::{INVALID_KEY, IndexedChild, Packer, PackingStrategy};
use crate::parse_grammar::{GrammarHeader, GrammarSource, TextRule};
use crate::rules::Production;
use crate::vocabulary::{SymbolSet, Vocabulary};

/// The binary-rule matrices kept for a [`MatrixLayout`]
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum BinaryMatrices {
  Csr(CsrMatrix),
  Csc(CscMatrix),
  InsideOutside { csr: CsrMatrix, csc: CscMatrix },
}

impl BinaryMatrices {
  fn build(layout: MatrixLayout, packer: &Packer, num_non_terminals: usize, binary: &[Production]) -> Self {
    let csr = || {
      let mut builder = CsrBuilder::new(num_non_terminals);
      for p in binary {
        builder.add(p.parent, packer.pack_production(p), p.prob);
      }
      builder.seal()
    };
    let csc = || {
      let mut builder = CscBuilder::new();
      for p in binary {
        builder.add(packer.pack_production(p), p.parent, p.prob);
      }
      builder.seal(packer, num_non_terminals)
    };

    match layout {
      MatrixLayout::Csr => Self::Csr(csr()),
      MatrixLayout::Csc => Self::Csc(csc()),
      MatrixLayout::InsideOutside => Self::InsideOutside { csr: csr(), csc: csc() },
    }
  }

  pub(crate) fn layout(&self) -> MatrixLayout {
    match self {
      Self::Csr(_) => MatrixLayout::Csr,
      Self::Csc(_) => MatrixLayout::Csc,
      Self::InsideOutside { .. } => MatrixLayout::InsideOutside,
    }
  }

  pub(crate) fn csr(&self) -> Option<&CsrMatrix> {
    match self {
      Self::Csr(csr) | Self::InsideOutside { csr, .. } => Some(csr),
      Self::Csc(_) => None,
    }
  }

  pub(crate) fn csc(&self) -> Option<&CscMatrix> {
    match self {
      Self::Csc(csc) | Self::InsideOutside { csc, .. } => Some(csc),
      Self::Csr(_) => None,
    }
  }

  #[inline]
  fn get(&self, parent: u32, key: i32) -> f32 {
    match self {
      Self::Csr(csr) => csr.get(parent, key),
      Self::Csc(csc) | Self::InsideOutside { csc, .. } => csc.get(parent, key),
    }
  }

  fn len(&self) -> usize {
    match self {
      Self::Csr(csr) => csr.len(),
      Self::Csc(csc) | Self::InsideOutside { csc, .. } => csc.len(),
    }
  }

  /// Visits every binary rule, keeping the ones `filter` accepts
  fn scan<'a>(&'a self, packer: &'a Packer, num_non_terminals: u32, filter: Filter) -> BinaryProductions<'a> {
    match self {
      Self::Csc(csc) | Self::InsideOutside { csc, .. } => {
        BinaryProductions::columns(packer, csc, 0..csc.num_populated_columns(), filter)
      }
      Self::Csr(csr) => BinaryProductions::rows(packer, csr, 0..num_non_terminals, filter),
    }
  }
}

/// A sealed PCFG. Every lookup is read-only and allocation-free, so one
/// instance can be shared (e.g. through an `Arc`) by any number of parser threads.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseMatrixGrammar {
  pub(crate) header: GrammarHeader,
  pub(crate) vocab: Vocabulary,
  pub(crate) words: SymbolSet,
  pub(crate) packer: Packer,
  pub(crate) binary: BinaryMatrices,
  /// rows: parent, keys: `pack_unary(child)`
  pub(crate) unary_by_parent: CsrMatrix,
  /// rows: child, keys: parent
  pub(crate) unary_by_child: CsrMatrix,
  /// rows: word, keys: parent
  pub(crate) lexical_by_word: CsrMatrix,
  pub(crate) unseen_lexical_log_prob: f32,
}

impl SparseMatrixGrammar {
  /// Compiles a parsed grammar. Indices, packed keys and matrices depend only on
  /// `source` and `config`, so compiling the same text twice gives identical arrays.
  pub fn compile(source: &GrammarSource, config: &GrammarConfig) -> GrammarResult<Self> {
    let _span = debug_span!("compile", packing = %config.packing, layout = %config.layout).entered();

    let vocab = {
      let _span = debug_span!("partition").entered();
      let vocab = Vocabulary::from_source(source)?;
      debug!(non_terminals = vocab.num_non_terminals(), boundaries = ?vocab.boundaries(), "partitioned vocabulary");
      vocab
    };

    let mut words = SymbolSet::new();
    for rule in source.lexical.iter() {
      words.add_symbol(&rule.left);
    }

    let mut seen = FxHashSet::default();
    let binary = intern(&source.binary, &mut seen, |rule| {
      let right = rule.right.as_deref().unwrap_or_default();
      Ok(Production::binary(
        non_terminal(&vocab, &rule.parent, rule)?,
        non_terminal(&vocab, &rule.left, rule)?,
        non_terminal(&vocab, right, rule)?,
        rule.prob,
      ))
    })?;
    let unary = intern(&source.unary, &mut seen, |rule| {
      Ok(Production::unary(
        non_terminal(&vocab, &rule.parent, rule)?,
        non_terminal(&vocab, &rule.left, rule)?,
        rule.prob,
      ))
    })?;
    let lexical = intern(&source.lexical, &mut seen, |rule| {
      let word = words
        .index_of(&rule.left)
        .ok_or_else(|| GrammarError::malformed(rule.line, &rule.to_string(), "word missing from the lexicon"))?;
      Ok(Production::lexical(non_terminal(&vocab, &rule.parent, rule)?, word, rule.prob))
    })?;

    let packer = match Packer::build(config.packing, &vocab, words.len(), &binary, &config.hash) {
      Err(GrammarError::HashConstruction {
        keys,
        table_size,
        rounds,
      }) if config.fallback_to_shift => {
        warn!(
          keys,
          table_size, rounds, "perfect hash construction failed, falling back to shift packing"
        );
        Packer::build(PackingStrategy::Shift, &vocab, words.len(), &binary, &config.hash)?
      }
      result => result?,
    };

    let _span = debug_span!("matrices").entered();
    let num_non_terminals = vocab.num_non_terminals();
    let binary_matrices = BinaryMatrices::build(config.layout, &packer, num_non_terminals, &binary);

    let mut unary_by_parent = CsrBuilder::new(num_non_terminals);
    let mut unary_by_child = CsrBuilder::new(num_non_terminals);
    for p in unary.iter() {
      unary_by_parent.add(p.parent, packer.pack_unary(p.left), p.prob);
      unary_by_child.add(p.left, p.parent as i32, p.prob);
    }
    let mut lexical_by_word = CsrBuilder::new(words.len());
    for p in lexical.iter() {
      lexical_by_word.add(p.left, p.parent as i32, p.prob);
    }

    let grammar = Self {
      header: source.header.clone(),
      vocab,
      words,
      packer,
      binary: binary_matrices,
      unary_by_parent: unary_by_parent.seal(),
      unary_by_child: unary_by_child.seal(),
      lexical_by_word: lexical_by_word.seal(),
      unseen_lexical_log_prob: config.unseen_lexical_log_prob,
    };
    info!(
      non_terminals = grammar.num_non_terminals(),
      words = grammar.num_words(),
      binary = grammar.num_binary_productions(),
      unary = grammar.num_unary_productions(),
      lexical = grammar.num_lexical_productions(),
      packing = %grammar.packer.strategy(),
      packed_array_size = grammar.packer.packed_array_size(),
      "compiled grammar"
    );
    Ok(grammar)
  }

  /// Parses and compiles grammar text
  pub fn from_text(text: &str, config: &GrammarConfig) -> GrammarResult<Self> {
    let source = {
      let _span = debug_span!("parse").entered();
      text.parse::<GrammarSource>()?
    };
    Self::compile(&source, config)
  }

  /// Reads and compiles a text grammar file with the default configuration
  pub fn read_from_file<P: AsRef<Path>>(path: P) -> GrammarResult<Self> {
    fs::read_to_string(path)?.parse()
  }

  #[inline]
  fn check_non_terminal(&self, nt: u32) {
    assert!(
      (nt as usize) < self.vocab.num_non_terminals(),
      "non-terminal index {} out of range",
      nt
    );
  }

  #[inline]
  fn check_word(&self, word: u32) {
    assert!((word as usize) < self.words.len(), "word index {} out of range", word);
  }

  pub fn header(&self) -> &GrammarHeader {
    &self.header
  }

  pub fn vocabulary(&self) -> &Vocabulary {
    &self.vocab
  }

  pub fn packing_function(&self) -> &Packer {
    &self.packer
  }

  pub fn layout(&self) -> MatrixLayout {
    self.binary.layout()
  }

  /// The parent-major binary matrix, if this layout keeps one
  pub fn binary_csr(&self) -> Option<&CsrMatrix> {
    self.binary.csr()
  }

  /// The child-pair-major binary matrix, if this layout keeps one
  pub fn binary_csc(&self) -> Option<&CscMatrix> {
    self.binary.csc()
  }

  /// Including the null symbol
  pub fn num_non_terminals(&self) -> usize {
    self.vocab.num_non_terminals()
  }

  pub fn num_words(&self) -> usize {
    self.words.len()
  }

  pub fn num_binary_productions(&self) -> usize {
    self.binary.len()
  }

  pub fn num_unary_productions(&self) -> usize {
    self.unary_by_parent.len()
  }

  pub fn num_lexical_productions(&self) -> usize {
    self.lexical_by_word.len()
  }

  pub fn start_symbol(&self) -> u32 {
    self.vocab.start_symbol()
  }

  pub fn null_symbol(&self) -> u32 {
    self.vocab.null_symbol()
  }

  pub fn non_terminal_index(&self, label: &str) -> Option<u32> {
    self.vocab.index_of(label)
  }

  pub fn non_terminal(&self, nt: u32) -> &str {
    self.vocab.symbol(nt)
  }

  pub fn word_index(&self, word: &str) -> Option<u32> {
    self.words.index_of(word)
  }

  pub fn word(&self, word: u32) -> &str {
    self.words.symbol(word)
  }

  pub fn unseen_lexical_log_prob(&self) -> f32 {
    self.unseen_lexical_log_prob
  }

  #[inline]
  pub fn is_valid_left_child(&self, nt: u32) -> bool {
    self.check_non_terminal(nt);
    self.vocab.is_valid_left_child(nt)
  }

  #[inline]
  pub fn is_valid_right_child(&self, nt: u32) -> bool {
    self.check_non_terminal(nt);
    self.vocab.is_valid_right_child(nt)
  }

  #[inline]
  pub fn is_pos(&self, nt: u32) -> bool {
    self.check_non_terminal(nt);
    self.vocab.is_pos(nt)
  }

  /// Log probability of `parent -> left right`, -inf if there is no such rule
  #[inline]
  pub fn binary_log_probability(&self, parent: u32, left: u32, right: u32) -> f32 {
    self.check_non_terminal(parent);
    self.check_non_terminal(left);
    self.check_non_terminal(right);
    let key = self.packer.pack(left, right);
    if key == INVALID_KEY {
      return f32::NEG_INFINITY;
    }
    self.binary.get(parent, key)
  }

  /// Log probability of `parent -> child`, -inf if there is no such rule
  #[inline]
  pub fn unary_log_probability(&self, parent: u32, child: u32) -> f32 {
    self.check_non_terminal(parent);
    self.check_non_terminal(child);
    self.unary_by_parent.get(parent, self.packer.pack_unary(child))
  }

  /// Log probability of `parent -> word`, or the configured unseen value if there is no such rule
  #[inline]
  pub fn lexical_log_probability(&self, parent: u32, word: u32) -> f32 {
    self.check_non_terminal(parent);
    self.check_word(word);
    let prob = self.lexical_by_word.get(word, parent as i32);
    if prob == f32::NEG_INFINITY {
      self.unseen_lexical_log_prob
    } else {
      prob
    }
  }

  /// Binary rules with left child `left`. Walks only that child's columns when
  /// the CSC matrix is indexed by left child, otherwise scans.
  pub fn binary_productions_with_left_child(&self, left: u32) -> BinaryProductions<'_> {
    self.check_non_terminal(left);
    if let Some(csc) = self.binary.csc() {
      if self.packer.indexed_child() == IndexedChild::Left {
        return BinaryProductions::columns(&self.packer, csc, csc.child_columns(left), Filter::All);
      }
    }
    self.scan(Filter::Left(left))
  }

  /// Binary rules with right child `right`. Indexed under right-shift packing.
  pub fn binary_productions_with_right_child(&self, right: u32) -> BinaryProductions<'_> {
    self.check_non_terminal(right);
    if let Some(csc) = self.binary.csc() {
      if self.packer.indexed_child() == IndexedChild::Right {
        return BinaryProductions::columns(&self.packer, csc, csc.child_columns(right), Filter::All);
      }
    }
    self.scan(Filter::Right(right))
  }

  /// Binary rules with parent `parent`. Indexed when a CSR matrix is kept.
  pub fn binary_productions_with_parent(&self, parent: u32) -> BinaryProductions<'_> {
    self.check_non_terminal(parent);
    if let Some(csr) = self.binary.csr() {
      return BinaryProductions::rows(&self.packer, csr, parent..parent + 1, Filter::All);
    }
    self.scan(Filter::Parent(parent))
  }

  /// Every binary rule
  pub fn binary_productions(&self) -> BinaryProductions<'_> {
    self.scan(Filter::All)
  }

  fn scan(&self, filter: Filter) -> BinaryProductions<'_> {
    self
      .binary
      .scan(&self.packer, self.vocab.num_non_terminals() as u32, filter)
  }

  pub fn unary_productions_with_parent(&self, parent: u32) -> impl Iterator<Item = Production> + '_ {
    self.check_non_terminal(parent);
    let (keys, probs) = self.unary_by_parent.row(parent);
    keys
      .iter()
      .zip(probs)
      .map(move |(&key, &prob)| Production::unary(parent, self.packer.unpack_left(key), prob))
  }

  pub fn unary_productions_with_child(&self, child: u32) -> impl Iterator<Item = Production> + '_ {
    self.check_non_terminal(child);
    let (parents, probs) = self.unary_by_child.row(child);
    parents
      .iter()
      .zip(probs)
      .map(move |(&parent, &prob)| Production::unary(parent as u32, child, prob))
  }

  /// Lexical rules producing `word`, i.e. its POS tags
  pub fn lexical_productions(&self, word: u32) -> impl Iterator<Item = Production> + '_ {
    self.check_word(word);
    let (parents, probs) = self.lexical_by_word.row(word);
    parents
      .iter()
      .zip(probs)
      .map(move |(&parent, &prob)| Production::lexical(parent as u32, word, prob))
  }
}

/// Looks up a rule's symbol; every symbol of the source was partitioned, so a
/// miss means the vocabulary came from a different source
fn non_terminal(vocab: &Vocabulary, label: &str, rule: &TextRule) -> GrammarResult<u32> {
  vocab
    .index_of(label)
    .ok_or_else(|| GrammarError::malformed(rule.line, &rule.to_string(), format!("unknown symbol `{}`", label)))
}

/// Interns text rules, rejecting repeats of the same (parent, children) and
/// dropping -inf placeholders after they have shaped the vocabulary
fn intern(
  rules: &[TextRule],
  seen: &mut FxHashSet<(u32, u32, i32)>,
  mut to_production: impl FnMut(&TextRule) -> GrammarResult<Production>,
) -> GrammarResult<Vec<Production>> {
  let mut productions = Vec::with_capacity(rules.len());
  for rule in rules {
    let p = to_production(rule)?;
    if !seen.insert((p.parent, p.left, p.right)) {
      return Err(GrammarError::malformed(rule.line, &rule.to_string(), "duplicate rule"));
    }
    if !p.is_placeholder() {
      productions.push(p);
    }
  }
  Ok(productions)
}

impl FromStr for SparseMatrixGrammar {
  type Err = GrammarError;

  /// Parses and compiles with the default configuration
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::from_text(s, &GrammarConfig::default())
  }
}

impl fmt::Display for SparseMatrixGrammar {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    writeln!(f, "//** start: {}", self.non_terminal(self.start_symbol()))?;
    writeln!(f, "//** packing: {}, layout: {}", self.packer.strategy(), self.layout())?;
    writeln!(
      f,
      "//** {} non-terminals, {} words, {} binary, {} unary, {} lexical rules",
      self.num_non_terminals(),
      self.num_words(),
      self.num_binary_productions(),
      self.num_unary_productions(),
      self.num_lexical_productions()
    )
  }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Filter {
  All,
  Left(u32),
  Right(u32),
  Parent(u32),
}

impl Filter {
  #[inline]
  fn children(self, left: u32, right: u32) -> bool {
    match self {
      Filter::Left(l) => l == left,
      Filter::Right(r) => r == right,
      _ => true,
    }
  }

  #[inline]
  fn parent(self, parent: u32) -> bool {
    match self {
      Filter::Parent(p) => p == parent,
      _ => true,
    }
  }
}

#[derive(Debug, Clone)]
enum Walk<'a> {
  Columns {
    matrix: &'a CscMatrix,
    columns: Range<usize>,
    left: u32,
    right: u32,
  },
  Rows {
    matrix: &'a CsrMatrix,
    rows: Range<u32>,
    parent: u32,
  },
}

/// Iterator over binary rules, walking a run of CSC columns or CSR rows
#[derive(Debug, Clone)]
pub struct BinaryProductions<'a> {
  packer: &'a Packer,
  filter: Filter,
  walk: Walk<'a>,
  entries: Range<usize>,
}

impl<'a> BinaryProductions<'a> {
  fn columns(packer: &'a Packer, matrix: &'a CscMatrix, columns: Range<usize>, filter: Filter) -> Self {
    Self {
      packer,
      filter,
      walk: Walk::Columns {
        matrix,
        columns,
        left: 0,
        right: 0,
      },
      entries: 0..0,
    }
  }

  fn rows(packer: &'a Packer, matrix: &'a CsrMatrix, rows: Range<u32>, filter: Filter) -> Self {
    Self {
      packer,
      filter,
      walk: Walk::Rows {
        matrix,
        rows,
        parent: 0,
      },
      entries: 0..0,
    }
  }
}

impl Iterator for BinaryProductions<'_> {
  type Item = Production;

  fn next(&mut self) -> Option<Production> {
    loop {
      match &mut self.walk {
        Walk::Columns {
          matrix,
          columns,
          left,
          right,
        } => {
          if let Some(i) = self.entries.next() {
            let parent = matrix.row_indices()[i];
            if self.filter.parent(parent) {
              return Some(Production::binary(parent, *left, *right, matrix.probabilities()[i]));
            }
            continue;
          }
          let column = columns.next()?;
          let key = matrix.column_key(column);
          let (l, r) = (self.packer.unpack_left(key), self.packer.unpack_right(key) as u32);
          if self.filter.children(l, r) {
            *left = l;
            *right = r;
            self.entries = matrix.column_range(column);
          }
        }
        Walk::Rows { matrix, rows, parent } => {
          if let Some(i) = self.entries.next() {
            let key = matrix.column_keys()[i];
            let (l, r) = (self.packer.unpack_left(key), self.packer.unpack_right(key) as u32);
            if self.filter.children(l, r) {
              return Some(Production::binary(*parent, l, r, matrix.probabilities()[i]));
            }
            continue;
          }
          let row = rows.next()?;
          if self.filter.parent(row) {
            *parent = row;
            self.entries = matrix.row_range(row);
          }
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::perfect_hash::PerfectHashConfig;
  use std::sync::Arc;

  const SCENARIO: &str = "start=TOP
TOP -> NP 0.0
NP -> NN NN -0.69
NP -> NP NN -1.20
===Lexicon===
NN -> dog 0.0
";

  const GRAMMAR: &str = "start=S,hMarkov=0,vMarkov=1,binarization=right
S -> NP VP -0.1
S -> S PP -2.3
NP -> DT NN -0.5
NP -> NP PP -1.5
VP -> VB NP -0.3
VP -> VP PP -1.2
PP -> IN NP 0
S -> VP -2
NP -> NN -1.1
===Lexicon===
DT -> the 0
NN -> dog -0.5
NN -> cat -0.9
VB -> saw 0
IN -> with 0
NN -> saw -3.5
";

  fn configs() -> Vec<GrammarConfig> {
    let mut configs = Vec::new();
    for packing in PackingStrategy::ALL {
      for layout in MatrixLayout::ALL {
        configs.push(GrammarConfig::default().with_packing(packing).with_layout(layout));
      }
    }
    configs
  }

  fn compile(text: &str, config: &GrammarConfig) -> SparseMatrixGrammar {
    SparseMatrixGrammar::from_text(text, config).unwrap()
  }

  fn nt(g: &SparseMatrixGrammar, label: &str) -> u32 {
    g.non_terminal_index(label).unwrap()
  }

  /// (parent, left, right, prob) of every binary rule in the text
  fn source_binary(g: &SparseMatrixGrammar, text: &str) -> Vec<Rule> {
    let source: GrammarSource = text.parse().unwrap();
    source
      .binary
      .iter()
      .filter(|r| r.prob != f32::NEG_INFINITY)
      .map(|r| {
        (
          nt(g, &r.parent),
          nt(g, &r.left),
          nt(g, r.right.as_ref().unwrap()),
          r.prob,
        )
      })
      .collect()
  }

  type Rule = (u32, u32, u32, f32);

  fn by_children(v: &mut [Rule]) {
    v.sort_by(|a, b| (a.0, a.1, a.2).cmp(&(b.0, b.1, b.2)));
  }

  fn sorted(it: impl Iterator<Item = Production>) -> Vec<Rule> {
    let mut v = it
      .map(|p| (p.parent, p.left, p.right as u32, p.prob))
      .collect::<Vec<_>>();
    by_children(&mut v);
    v
  }

  fn expected(rules: &[Rule], keep: impl Fn(&Rule) -> bool) -> Vec<Rule> {
    let mut v = rules.iter().copied().filter(|r| keep(r)).collect::<Vec<_>>();
    by_children(&mut v);
    v
  }

  #[test]
  fn test_scenario() {
    for config in configs() {
      let g = compile(SCENARIO, &config);
      let (top, np, nn) = (nt(&g, "TOP"), nt(&g, "NP"), nt(&g, "NN"));
      let dog = g.word_index("dog").unwrap();
      assert!((g.binary_log_probability(np, nn, nn) - -0.69).abs() < 1e-6, "{:?}", config);
      assert_eq!(g.binary_log_probability(np, np, nn), -1.20);
      assert_eq!(g.unary_log_probability(top, np), 0.0);
      assert_eq!(g.binary_log_probability(top, np, np), f32::NEG_INFINITY);
      assert_eq!(g.lexical_log_probability(nn, dog), 0.0);
      assert_eq!(g.lexical_log_probability(np, dog), f32::NEG_INFINITY);
      assert_eq!(g.unary_log_probability(np, top), f32::NEG_INFINITY);
    }
  }

  #[test]
  fn test_left_child_only() {
    let g = compile(SCENARIO, &GrammarConfig::default());
    let np = nt(&g, "NP");
    assert!(g.is_valid_left_child(np));
    assert!(!g.is_valid_right_child(np));
    assert!(!g.is_pos(np));
    let nn = nt(&g, "NN");
    assert!(g.is_pos(nn) && g.is_valid_left_child(nn) && g.is_valid_right_child(nn));
    let top = nt(&g, "TOP");
    assert_eq!(g.start_symbol(), top);
    assert!(!g.is_valid_left_child(top) && !g.is_valid_right_child(top));
    assert_eq!(g.num_non_terminals(), 4);
    assert_eq!(g.non_terminal(g.null_symbol()), crate::vocabulary::NULL_SYMBOL);
  }

  #[test]
  fn test_lookup_correctness() {
    for config in configs() {
      let g = compile(GRAMMAR, &config);
      let rules = source_binary(&g, GRAMMAR);
      assert_eq!(g.num_binary_productions(), rules.len());
      let n = g.num_non_terminals() as u32;
      for parent in 0..n {
        for left in 0..n {
          for right in 0..n {
            let expected = rules
              .iter()
              .find(|r| (r.0, r.1, r.2) == (parent, left, right))
              .map_or(f32::NEG_INFINITY, |r| r.3);
            assert_eq!(
              g.binary_log_probability(parent, left, right),
              expected,
              "{:?} {} -> {} {}",
              config,
              g.non_terminal(parent),
              g.non_terminal(left),
              g.non_terminal(right)
            );
          }
        }
      }
    }
  }

  #[test]
  fn test_production_iterators() {
    for config in configs() {
      let g = compile(GRAMMAR, &config);
      let rules = source_binary(&g, GRAMMAR);
      assert_eq!(sorted(g.binary_productions()), sorted(rules.iter().map(|r| Production::binary(r.0, r.1, r.2, r.3))));
      for sym in 0..g.num_non_terminals() as u32 {
        assert_eq!(
          sorted(g.binary_productions_with_left_child(sym)),
          expected(&rules, |r| r.1 == sym),
          "{:?} left {}",
          config,
          g.non_terminal(sym)
        );
        assert_eq!(sorted(g.binary_productions_with_right_child(sym)), expected(&rules, |r| r.2 == sym));
        assert_eq!(sorted(g.binary_productions_with_parent(sym)), expected(&rules, |r| r.0 == sym));
      }
    }
  }

  #[test]
  fn test_unary_and_lexical_iterators() {
    let g = compile(GRAMMAR, &GrammarConfig::default());
    let (s, vp, np, nn) = (nt(&g, "S"), nt(&g, "VP"), nt(&g, "NP"), nt(&g, "NN"));
    let unary = g.unary_productions_with_child(vp).collect::<Vec<_>>();
    assert_eq!(unary, vec![Production::unary(s, vp, -2.0)]);
    assert_eq!(g.unary_productions_with_parent(np).collect::<Vec<_>>(), vec![Production::unary(np, nn, -1.1)]);
    assert_eq!(g.unary_productions_with_child(s).count(), 0);

    let saw = g.word_index("saw").unwrap();
    let mut tags = g.lexical_productions(saw).map(|p| (p.parent, p.prob)).collect::<Vec<_>>();
    tags.sort_by_key(|&(parent, _)| parent);
    let mut expected = vec![(nt(&g, "VB"), 0.0), (nn, -3.5)];
    expected.sort_by_key(|&(parent, _)| parent);
    assert_eq!(tags, expected);
    assert_eq!(g.word(saw), "saw");
    assert_eq!(g.num_words(), 5);
    assert_eq!(g.num_lexical_productions(), 6);
    assert_eq!(g.num_unary_productions(), 2);
  }

  #[test]
  fn test_left_child_index_is_used() {
    let g = compile(GRAMMAR, &GrammarConfig::default().with_packing(PackingStrategy::Shift));
    let np = nt(&g, "NP");
    let csc = g.binary_csc().unwrap();
    // NP VP and NP PP
    assert_eq!(csc.child_columns(np).len(), 2);
    assert_eq!(g.binary_productions_with_left_child(np).count(), 2);
    assert!(g.binary_csr().is_none());
  }

  #[test]
  fn test_header_preserved() {
    let g = compile(GRAMMAR, &GrammarConfig::default());
    assert_eq!(g.header().start, "S");
    assert_eq!(g.header().h_markov(), Some(0));
    assert_eq!(g.header().v_markov(), Some(1));
    assert_eq!(g.header().binarization(), Some("right"));
  }

  #[test]
  fn test_unseen_lexical_log_prob() {
    let config = GrammarConfig::default().with_unseen_lexical_log_prob(-20.0);
    let g = compile(GRAMMAR, &config);
    let the = g.word_index("the").unwrap();
    assert_eq!(g.lexical_log_probability(nt(&g, "NN"), the), -20.0);
    assert_eq!(g.lexical_log_probability(nt(&g, "DT"), the), 0.0);
    assert_eq!(g.unseen_lexical_log_prob(), -20.0);
  }

  #[test]
  fn test_placeholders_shape_vocabulary_only() {
    let text = "S
S -> A B -0.5
S -> X B -inf
===Lexicon===
A -> a 0
B -> b 0
X -> x -Infinity
";
    let g = compile(text, &GrammarConfig::default());
    let (s, x, b) = (nt(&g, "S"), nt(&g, "X"), nt(&g, "B"));
    assert!(g.is_valid_left_child(x));
    assert_eq!(g.binary_log_probability(s, x, b), f32::NEG_INFINITY);
    assert_eq!(g.num_binary_productions(), 1);
    assert_eq!(g.num_lexical_productions(), 2);
    assert_eq!(g.binary_productions_with_left_child(x).count(), 0);
    assert_eq!(g.lexical_log_probability(x, g.word_index("x").unwrap()), f32::NEG_INFINITY);
  }

  #[test]
  fn test_duplicate_rule_is_malformed() {
    let text = "S
S -> A B -0.5
S -> A B -0.7
===Lexicon===
A -> a 0
B -> b 0
";
    match SparseMatrixGrammar::from_text(text, &GrammarConfig::default()) {
      Err(GrammarError::Malformed { line, .. }) => assert_eq!(line, 3),
      other => panic!("expected a malformed grammar, got {:?}", other),
    }
  }

  // X has the lowest and Y the highest right-child index, so the two left
  // children need the same displacement in a minimal table
  const HASH_HOSTILE: &str = "S
S -> A X -0.1
S -> A Y -0.2
S -> B X -0.3
S -> B Y -0.4
X -> Y -0.5
===Lexicon===
Y -> y 0
";

  #[test]
  fn test_perfect_hash_falls_back_to_shift() {
    let hash = PerfectHashConfig {
      growth_factor: 1.0,
      max_growth_rounds: 0,
    };
    let config = GrammarConfig::default().with_hash(hash);
    let g = compile(HASH_HOSTILE, &config);
    assert_eq!(g.packing_function().strategy(), PackingStrategy::Shift);
    assert_eq!(g.binary_log_probability(nt(&g, "S"), nt(&g, "B"), nt(&g, "Y")), -0.4);

    assert!(matches!(
      SparseMatrixGrammar::from_text(HASH_HOSTILE, &config.with_fallback_to_shift(false)),
      Err(GrammarError::HashConstruction { keys: 4, .. })
    ));

    let g = compile(HASH_HOSTILE, &GrammarConfig::default());
    assert_eq!(g.packing_function().strategy(), PackingStrategy::PerfectHash);
  }

  #[test]
  fn test_compilation_is_deterministic() {
    for config in configs() {
      assert_eq!(compile(GRAMMAR, &config), compile(GRAMMAR, &config));
    }
  }

  #[test]
  #[should_panic]
  fn test_out_of_range_symbol_panics() {
    let g = compile(SCENARIO, &GrammarConfig::default());
    g.binary_log_probability(0, 0, 100);
  }

  #[test]
  fn test_concurrent_readers() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<SparseMatrixGrammar>();

    let g = Arc::new(compile(GRAMMAR, &GrammarConfig::default()));
    let rules = source_binary(&g, GRAMMAR);
    std::thread::scope(|scope| {
      for _ in 0..4 {
        let g = Arc::clone(&g);
        let rules = &rules;
        scope.spawn(move || {
          for _ in 0..100 {
            for &(parent, left, right, prob) in rules.iter() {
              assert_eq!(g.binary_log_probability(parent, left, right), prob);
            }
          }
        });
      }
    });
  }

  #[test]
  fn test_read_from_file() {
    let path = std::env::temp_dir().join(format!("sparse-pcfg-{}.gr", std::process::id()));
    fs::write(&path, GRAMMAR).unwrap();
    let loaded = SparseMatrixGrammar::read_from_file(&path);
    fs::remove_file(&path).unwrap();

    let g = loaded.unwrap();
    assert_eq!(g, compile(GRAMMAR, &GrammarConfig::default()));
    assert_eq!(g.binary_log_probability(nt(&g, "PP"), nt(&g, "IN"), nt(&g, "NP")), 0.0);

    match SparseMatrixGrammar::read_from_file(&path) {
      Err(GrammarError::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::NotFound),
      other => panic!("expected an io error, got {:?}", other.map(|g| g.to_string())),
    }
  }

  #[test]
  fn test_display() {
    let g = compile(SCENARIO, &GrammarConfig::default());
    let shown = g.to_string();
    assert!(shown.starts_with("//** start: TOP\n"));
    assert!(shown.contains("perfect-hash"));
  }
}
