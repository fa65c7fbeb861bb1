use thiserror::Error;

/// Everything that can go wrong while compiling, loading or saving a grammar.
///
/// Lookups on a sealed grammar never produce one of these: an absent rule is
/// `f32::NEG_INFINITY`, and an out-of-range symbol index is a caller bug that panics.
#[derive(Error, Debug)]
pub enum GrammarError {
  #[error("malformed grammar at line {line}: {reason}: `{text}`")]
  Malformed {
    line: usize,
    text: String,
    reason: String,
  },
  #[error("perfect hash construction failed for {keys} keys (table size {table_size}) after {rounds} growth rounds")]
  HashConstruction {
    keys: usize,
    table_size: usize,
    rounds: u32,
  },
  #[error("packed key space overflow: {0}")]
  KeySpaceOverflow(String),
  #[error("incompatible grammar image: {0}")]
  IncompatibleImage(String),
  #[error("corrupt grammar image: {0}")]
  CorruptImage(String),
  #[error(transparent)]
  Io(#[from] std::io::Error),
  #[error("failed to encode grammar image: {0}")]
  Encode(#[from] bincode::error::EncodeError),
  #[error("failed to decode grammar image: {0}")]
  Decode(#[from] bincode::error::DecodeError),
}

impl GrammarError {
  pub(crate) fn malformed(line: usize, text: &str, reason: impl Into<String>) -> Self {
    Self::Malformed {
      line,
      text: text.to_string(),
      reason: reason.into(),
    }
  }
}

pub type GrammarResult<T> = Result<T, GrammarError>;
