use std::fmt;

/// `right` value of a unary production (`A -> B`)
pub const UNARY_PRODUCTION: i32 = -1;
/// `right` value of a lexical production (`A -> word`); `left` is then a word index
pub const LEXICAL_PRODUCTION: i32 = -2;

/// A compiled grammar rule: parent, children and natural-log probability.
///
/// Binary, unary and lexical rules share one shape. The kind is carried in `right`:
/// a non-negative non-terminal index for binary rules, or one of the sentinels
/// [`UNARY_PRODUCTION`] / [`LEXICAL_PRODUCTION`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Production {
  pub parent: u32,
  pub left: u32,
  pub right: i32,
  pub prob: f32,
}

impl Production {
  pub fn binary(parent: u32, left: u32, right: u32, prob: f32) -> Self {
    Self {
      parent,
      left,
      right: right as i32,
      prob,
    }
  }

  pub fn unary(parent: u32, child: u32, prob: f32) -> Self {
    Self {
      parent,
      left: child,
      right: UNARY_PRODUCTION,
      prob,
    }
  }

  pub fn lexical(parent: u32, word: u32, prob: f32) -> Self {
    Self {
      parent,
      left: word,
      right: LEXICAL_PRODUCTION,
      prob,
    }
  }

  pub fn is_binary(&self) -> bool {
    self.right >= 0
  }

  pub fn is_unary(&self) -> bool {
    self.right == UNARY_PRODUCTION
  }

  pub fn is_lexical(&self) -> bool {
    self.right == LEXICAL_PRODUCTION
  }

  /// The right child of a binary production
  pub fn right_child(&self) -> Option<u32> {
    if self.is_binary() {
      Some(self.right as u32)
    } else {
      None
    }
  }

  /// A production with probability -inf is a placeholder: it shapes the
  /// vocabulary but is never stored
  pub fn is_placeholder(&self) -> bool {
    self.prob == f32::NEG_INFINITY
  }
}

impl fmt::Display for Production {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.right {
      UNARY_PRODUCTION => write!(f, "{} -> {} {}", self.parent, self.left, self.prob),
      LEXICAL_PRODUCTION => write!(f, "{} -> w{} {}", self.parent, self.left, self.prob),
      right => write!(f, "{} -> {} {} {}", self.parent, self.left, right, self.prob),
    }
  }
}
