/// Line-oriented reader for the text grammar format
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{GrammarError, GrammarResult};

pub const LEXICON_DELIMITER: &str = "===Lexicon===";

/// helper macro for initializing a regex with lazy_static!
macro_rules! regex_static {
  ($name:ident, $pattern:expr) => {
    lazy_static! {
      static ref $name: Regex = Regex::new($pattern).unwrap();
    }
  };
}

/// The first line of a grammar file: the start symbol plus any `key=value` metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrammarHeader {
  pub start: String,
  /// Every metadata pair except `start`, e.g. hMarkov, vMarkov, binarization, format
  pub properties: BTreeMap<String, String>,
}

impl GrammarHeader {
  pub fn new(start: impl Into<String>) -> Self {
    Self {
      start: start.into(),
      properties: BTreeMap::new(),
    }
  }

  pub fn property(&self, key: &str) -> Option<&str> {
    self.properties.get(key).map(String::as_str)
  }

  pub fn h_markov(&self) -> Option<u32> {
    self.property("hMarkov").and_then(|v| v.parse().ok())
  }

  pub fn v_markov(&self) -> Option<u32> {
    self.property("vMarkov").and_then(|v| v.parse().ok())
  }

  pub fn binarization(&self) -> Option<&str> {
    self.property("binarization")
  }

  pub fn format(&self) -> Option<&str> {
    self.property("format")
  }
}

impl fmt::Display for GrammarHeader {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.properties.is_empty() {
      return write!(f, "{}", self.start);
    }
    write!(f, "start={}", self.start)?;
    for (k, v) in self.properties.iter() {
      write!(f, ",{}={}", k, v)?;
    }
    Ok(())
  }
}

/// A rule as written in the grammar text, before any symbol is interned
#[derive(Debug, Clone, PartialEq)]
pub struct TextRule {
  pub parent: String,
  /// Only child of a unary rule, left child of a binary rule, or the word of a lexical rule
  pub left: String,
  pub right: Option<String>,
  pub prob: f32,
  /// 1-based line number in the source text
  pub line: usize,
}

impl fmt::Display for TextRule {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} -> {}", self.parent, self.left)?;
    if let Some(right) = &self.right {
      write!(f, " {}", right)?;
    }
    write!(f, " {}", self.prob)
  }
}

/// A parsed, not yet compiled, grammar
#[derive(Debug, Clone, PartialEq)]
pub struct GrammarSource {
  pub header: GrammarHeader,
  pub binary: Vec<TextRule>,
  pub unary: Vec<TextRule>,
  pub lexical: Vec<TextRule>,
}

impl fmt::Display for GrammarSource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    writeln!(f, "{}", self.header)?;
    for rule in self.binary.iter().chain(self.unary.iter()) {
      writeln!(f, "{}", rule)?;
    }
    writeln!(f, "{}", LEXICON_DELIMITER)?;
    for rule in self.lexical.iter() {
      writeln!(f, "{}", rule)?;
    }
    Ok(())
  }
}

impl FromStr for GrammarSource {
  type Err = GrammarError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    parse(s)
  }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Section {
  Header,
  Rules,
  Lexicon,
}

/// Parses grammar text into a [`GrammarSource`].
/// Errors carry the offending line number and text.
pub fn parse(s: &str) -> GrammarResult<GrammarSource> {
  let mut section = Section::Header;
  let mut header = None;
  let mut binary = Vec::new();
  let mut unary = Vec::new();
  let mut lexical = Vec::new();
  let mut last_line = (0, "");

  for (idx, raw) in s.lines().enumerate() {
    let line = idx + 1;
    last_line = (line, raw);
    let trimmed = raw.trim();
    let tokens = trimmed.split_whitespace().collect::<Vec<_>>();

    if is_comment(trimmed, &tokens) {
      continue;
    }

    if trimmed == LEXICON_DELIMITER {
      match section {
        Section::Header => return Err(GrammarError::malformed(line, raw, "lexicon delimiter before grammar header")),
        Section::Rules => section = Section::Lexicon,
        Section::Lexicon => return Err(GrammarError::malformed(line, raw, "duplicate lexicon delimiter")),
      }
      continue;
    }

    match section {
      Section::Header => {
        header = Some(parse_header(line, raw)?);
        section = Section::Rules;
      }
      Section::Rules => {
        let rule = parse_rule(line, raw, &tokens)?;
        if rule.right.is_some() {
          binary.push(rule);
        } else {
          unary.push(rule);
        }
      }
      Section::Lexicon => {
        let rule = parse_rule(line, raw, &tokens)?;
        if rule.right.is_some() {
          return Err(GrammarError::malformed(line, raw, "lexical rules take exactly one word"));
        }
        lexical.push(rule);
      }
    }
  }

  let Some(header) = header else {
    return Err(GrammarError::malformed(last_line.0, last_line.1, "missing grammar header"));
  };
  if section != Section::Lexicon {
    return Err(GrammarError::malformed(
      last_line.0,
      last_line.1,
      format!("missing {} delimiter", LEXICON_DELIMITER),
    ));
  }

  Ok(GrammarSource {
    header,
    binary,
    unary,
    lexical,
  })
}

/// Blank lines and `#` lines, except the literal `# -> # prob` lexical entry
fn is_comment(trimmed: &str, tokens: &[&str]) -> bool {
  if trimmed.is_empty() {
    return true;
  }
  trimmed.starts_with('#') && !(tokens.len() == 4 && tokens[0] == "#" && tokens[1] == "->" && tokens[2] == "#")
}

fn parse_header(line: usize, raw: &str) -> GrammarResult<GrammarHeader> {
  regex_static!(PROPERTY, r"^\s*([^=,\s]+)\s*=\s*([^,]*?)\s*$");

  let trimmed = raw.trim();
  if !trimmed.contains('=') {
    let tokens = trimmed.split_whitespace().collect::<Vec<_>>();
    if tokens.len() != 1 {
      return Err(GrammarError::malformed(line, raw, "expected a start symbol or key=value header"));
    }
    return Ok(GrammarHeader::new(tokens[0]));
  }

  let mut start = None;
  let mut properties = BTreeMap::new();
  for pair in trimmed.split(',') {
    let caps = PROPERTY
      .captures(pair)
      .ok_or_else(|| GrammarError::malformed(line, raw, format!("bad header property `{}`", pair)))?;
    let key = caps[1].to_string();
    let value = caps[2].to_string();
    if key == "start" {
      if start.is_some() {
        return Err(GrammarError::malformed(line, raw, "duplicate start symbol declaration"));
      }
      if value.is_empty() {
        return Err(GrammarError::malformed(line, raw, "empty start symbol"));
      }
      start = Some(value);
    } else {
      properties.insert(key, value);
    }
  }

  match start {
    Some(start) => Ok(GrammarHeader { start, properties }),
    None => Err(GrammarError::malformed(line, raw, "header has no start= declaration")),
  }
}

fn parse_rule(line: usize, raw: &str, tokens: &[&str]) -> GrammarResult<TextRule> {
  if tokens.len() != 4 && tokens.len() != 5 {
    return Err(GrammarError::malformed(
      line,
      raw,
      format!("expected 4 or 5 tokens, found {}", tokens.len()),
    ));
  }
  if tokens[1] != "->" {
    return Err(GrammarError::malformed(line, raw, "expected `->` after the parent symbol"));
  }

  let prob = parse_log_prob(tokens[tokens.len() - 1]).map_err(|reason| GrammarError::malformed(line, raw, reason))?;
  let right = if tokens.len() == 5 {
    Some(tokens[3].to_string())
  } else {
    None
  };

  Ok(TextRule {
    parent: tokens[0].to_string(),
    left: tokens[2].to_string(),
    right,
    prob,
    line,
  })
}

/// Natural-log probability in (-inf, 0]; `-inf` / `-Infinity` are accepted placeholders
fn parse_log_prob(token: &str) -> Result<f32, String> {
  regex_static!(NEG_INFINITY, r"(?i)^-inf(inity)?$");

  if NEG_INFINITY.is_match(token) {
    return Ok(f32::NEG_INFINITY);
  }
  let prob = token
    .parse::<f32>()
    .map_err(|_| format!("invalid probability `{}`", token))?;
  if prob.is_nan() || prob > 0.0 {
    Err(format!("`{}` is not a log probability", token))
  } else {
    Ok(prob)
  }
}
