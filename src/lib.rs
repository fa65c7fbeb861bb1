//! Compiled, read-only rule storage for probabilistic context-free grammars.
//!
//! A text grammar is parsed, its non-terminals are partitioned by the child
//! positions they can occupy, child pairs are packed into integer keys, and
//! the rule probabilities are sealed into sparse matrices. The resulting
//! [`SparseMatrixGrammar`] answers the point lookups and rule iterations a
//! chart parser's inner loop needs without locking or allocating.

#[macro_use]
extern crate lazy_static;

pub mod config;
pub mod error;
pub mod grammar;
pub mod matrix;
pub mod packing;
pub mod parse_grammar;
pub mod perfect_hash;
pub mod rules;
pub mod serialized;
pub mod vocabulary;

pub use crate::config::GrammarConfig;
pub use crate::error::{GrammarError, GrammarResult};
pub use crate::grammar::{BinaryProductions, SparseMatrixGrammar};
pub use crate::matrix::MatrixLayout;
pub use crate::packing::{INVALID_KEY, PackingStrategy};
pub use crate::parse_grammar::{GrammarHeader, GrammarSource};
pub use crate::perfect_hash::PerfectHashConfig;
pub use crate::rules::Production;
pub use crate::vocabulary::{SymbolClass, Vocabulary};

#[test]
fn test_publish_to_readers() {
  use std::sync::Arc;

  let g: SparseMatrixGrammar = r#"
    start=TOP
    TOP -> NP 0.0
    NP -> NN NN -0.69
    NP -> NP NN -1.20
    ===Lexicon===
    NN -> dog 0.0
  "#
  .parse()
  .unwrap();

  let g = Arc::new(g);
  let nn = g.non_terminal_index("NN").unwrap();
  let np = g.non_terminal_index("NP").unwrap();
  let handles = (0..4)
    .map(|_| {
      let g = Arc::clone(&g);
      std::thread::spawn(move || g.binary_log_probability(np, np, nn))
    })
    .collect::<Vec<_>>();
  for handle in handles {
    assert_eq!(handle.join().unwrap(), -1.20);
  }
}
