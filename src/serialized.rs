//! Flat, versioned binary image of a compiled grammar, so it can be reloaded
//! without re-reading the text.
//!
//! Layout: an [`ImageHeader`] (magic, format version, packing and layout tags)
//! followed by one [`GrammarImage`], both bincode-encoded with fixed-width
//! little-endian integers. The header is checked before the body is decoded.

use bincode::{Decode, Encode};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::ops::Range;
use tracing::{debug_span, info};

use crate::config::GrammarConfig;
use crate::error::{GrammarError, GrammarResult};
use crate::grammar::{BinaryMatrices, SparseMatrixGrammar};
use crate::matrix::{CscMatrix, CsrMatrix, MatrixLayout};
use crate::packing::{
  ExactFilterFunction, LeftShiftFunction, Packer, PackingKind, PackingStrategy, PerfectHashFunction,
  RightShiftFunction,
};
use crate::parse_grammar::GrammarHeader;
use crate::perfect_hash::PerfectHash;
use crate::vocabulary::{Boundaries, SymbolSet, Vocabulary};

pub const MAGIC: [u8; 8] = *b"SPMXPCFG";
pub const FORMAT_VERSION: u32 = 1;

/// Upper bound on the bytes a decoded image may claim, so a corrupt length
/// prefix fails with a decode error instead of a huge allocation
const IMAGE_LIMIT: usize = 1 << 30;

fn config() -> impl bincode::config::Config {
  bincode::config::standard()
    .with_little_endian()
    .with_fixed_int_encoding()
    .with_limit::<IMAGE_LIMIT>()
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
struct ImageHeader {
  magic: [u8; 8],
  version: u32,
  packing: u8,
  layout: u8,
}

/// Packing tables; fields a strategy doesn't use stay empty
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
struct PackerImage {
  num_non_terminals: u32,
  left_bound: u32,
  right_bound: u32,
  observed: Vec<u8>,
  displacements: Vec<i32>,
  slot_keys: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
struct GrammarImage {
  start_label: String,
  properties: Vec<(String, String)>,
  labels: Vec<String>,
  class_starts: [u32; 5],
  class_end: u32,
  start: u32,
  words: Vec<String>,
  packer: PackerImage,
  binary_csr: Option<CsrMatrix>,
  binary_csc: Option<CscMatrix>,
  unary_by_parent: CsrMatrix,
  unary_by_child: CsrMatrix,
  lexical_by_word: CsrMatrix,
  unseen_lexical_log_prob: f32,
}

fn corrupt(what: &str) -> GrammarError {
  GrammarError::CorruptImage(what.to_string())
}

impl PackerImage {
  fn from_packer(packer: &Packer) -> Self {
    let mut image = Self {
      num_non_terminals: packer.num_non_terminals(),
      left_bound: 0,
      right_bound: 0,
      observed: Vec::new(),
      displacements: Vec::new(),
      slot_keys: Vec::new(),
    };
    let left_shift = match packer.kind() {
      PackingKind::Shift(f) => f,
      PackingKind::ExactFilter(f) => {
        image.observed = f.to_bytes();
        f.inner()
      }
      PackingKind::PerfectHash(f) => {
        image.displacements = f.hash().displacements().to_vec();
        image.slot_keys = f.hash().slot_keys().to_vec();
        f.shift_function()
      }
      PackingKind::RightShift(f) => {
        image.left_bound = f.layout().low_bound();
        image.right_bound = f.layout().high_bound();
        return image;
      }
    };
    image.left_bound = left_shift.layout().high_bound();
    image.right_bound = left_shift.layout().low_bound();
    image
  }

  fn into_packer(self, strategy: PackingStrategy) -> GrammarResult<Packer> {
    let left_shift = || {
      LeftShiftFunction::new(self.left_bound, self.right_bound).map_err(|_| corrupt("child bounds overflow the key space"))
    };
    let kind = match strategy {
      PackingStrategy::Shift => PackingKind::Shift(left_shift()?),
      PackingStrategy::ExactFilter => PackingKind::ExactFilter(
        ExactFilterFunction::from_bytes(left_shift()?, &self.observed).ok_or_else(|| corrupt("pair filter too short"))?,
      ),
      PackingStrategy::PerfectHash => {
        let inner = left_shift()?;
        let hash = PerfectHash::from_parts(inner.layout().shift(), self.displacements, self.slot_keys)
          .ok_or_else(|| corrupt("perfect hash slots are inconsistent"))?;
        PackingKind::PerfectHash(
          PerfectHashFunction::from_parts(inner, hash).ok_or_else(|| corrupt("perfect hash layout mismatch"))?,
        )
      }
      PackingStrategy::RightShift => PackingKind::RightShift(
        RightShiftFunction::new(self.left_bound, self.right_bound)
          .map_err(|_| corrupt("child bounds overflow the key space"))?,
      ),
    };
    Ok(Packer::from_kind(self.num_non_terminals, kind))
  }
}

impl GrammarImage {
  fn from_grammar(g: &SparseMatrixGrammar) -> Self {
    let boundaries = g.vocab.boundaries();
    Self {
      start_label: g.header.start.clone(),
      properties: g
        .header
        .properties
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect(),
      labels: g.vocab.symbols().iter().map(str::to_string).collect(),
      class_starts: boundaries.starts(),
      class_end: boundaries.end(),
      start: g.vocab.start_symbol(),
      words: g.words.iter().map(str::to_string).collect(),
      packer: PackerImage::from_packer(&g.packer),
      binary_csr: g.binary.csr().cloned(),
      binary_csc: g.binary.csc().cloned(),
      unary_by_parent: g.unary_by_parent.clone(),
      unary_by_child: g.unary_by_child.clone(),
      lexical_by_word: g.lexical_by_word.clone(),
      unseen_lexical_log_prob: g.unseen_lexical_log_prob,
    }
  }

  fn into_grammar(self, strategy: PackingStrategy, layout: MatrixLayout) -> GrammarResult<SparseMatrixGrammar> {
    let boundaries =
      Boundaries::from_starts(self.class_starts, self.class_end).ok_or_else(|| corrupt("class boundaries out of order"))?;
    let vocab = Vocabulary::from_parts(self.labels, boundaries, self.start)
      .ok_or_else(|| corrupt("vocabulary does not match its boundaries"))?;
    if vocab.symbol(vocab.start_symbol()) != self.start_label {
      return Err(corrupt("start symbol does not match the header"));
    }

    let num_words = self.words.len();
    let words = self.words.iter().map(String::as_str).collect::<SymbolSet>();
    if words.len() != num_words {
      return Err(corrupt("repeated word in the lexicon"));
    }

    let n = vocab.num_non_terminals();
    let expected_bounds = (
      vocab.max_left_child().map_or(0, |nt| nt + 1),
      vocab.max_right_child().map_or(0, |nt| nt + 1),
    );
    if self.packer.num_non_terminals as usize != n
      || (self.packer.left_bound, self.packer.right_bound) != expected_bounds
    {
      return Err(corrupt("packing function does not match the vocabulary"));
    }
    let packer = self.packer.into_packer(strategy)?;

    let binary = match (layout, self.binary_csr, self.binary_csc) {
      (MatrixLayout::Csr, Some(csr), None) => BinaryMatrices::Csr(csr),
      (MatrixLayout::Csc, None, Some(csc)) => BinaryMatrices::Csc(csc),
      (MatrixLayout::InsideOutside, Some(csr), Some(csc)) => BinaryMatrices::InsideOutside { csr, csc },
      _ => return Err(corrupt("binary matrices do not match the layout tag")),
    };
    if let Some(csr) = binary.csr() {
      let keys_ok = csr.column_keys().iter().all(|&key| packer.is_binary_key(key));
      if !keys_ok || !csr_fits(csr, n, 0..packer.packed_array_size() as i32) {
        return Err(corrupt("binary CSR matrix"));
      }
    }
    if let Some(csc) = binary.csc() {
      if !csc.is_well_formed(&packer, n) || csc.row_indices().iter().any(|&p| p as usize >= n) {
        return Err(corrupt("binary CSC matrix"));
      }
    }

    let n_i32 = n as i32;
    if !csr_fits(&self.unary_by_parent, n, -n_i32..0)
      || !csr_fits(&self.unary_by_child, n, 0..n_i32)
      || !csr_fits(&self.lexical_by_word, num_words, 0..n_i32)
    {
      return Err(corrupt("unary or lexical matrix"));
    }

    Ok(SparseMatrixGrammar {
      header: GrammarHeader {
        start: self.start_label,
        properties: self.properties.into_iter().collect::<BTreeMap<_, _>>(),
      },
      vocab,
      words,
      packer,
      binary,
      unary_by_parent: self.unary_by_parent,
      unary_by_child: self.unary_by_child,
      lexical_by_word: self.lexical_by_word,
      unseen_lexical_log_prob: self.unseen_lexical_log_prob,
    })
  }
}

fn csr_fits(m: &CsrMatrix, rows: usize, keys: Range<i32>) -> bool {
  m.is_well_formed() && m.num_rows() == rows && m.column_keys().iter().all(|k| keys.contains(k))
}

impl SparseMatrixGrammar {
  /// Writes the binary image. Equal grammars always produce identical bytes.
  pub fn write_to<W: Write>(&self, mut writer: W) -> GrammarResult<()> {
    let _span = debug_span!("save").entered();
    let header = ImageHeader {
      magic: MAGIC,
      version: FORMAT_VERSION,
      packing: self.packer.strategy().tag(),
      layout: self.layout().tag(),
    };
    let mut written = bincode::encode_into_std_write(&header, &mut writer, config())?;
    written += bincode::encode_into_std_write(GrammarImage::from_grammar(self), &mut writer, config())?;
    info!(bytes = written, "wrote grammar image");
    Ok(())
  }

  pub fn to_bytes(&self) -> GrammarResult<Vec<u8>> {
    let mut bytes = Vec::new();
    self.write_to(&mut bytes)?;
    Ok(bytes)
  }

  /// Reads an image written by [`SparseMatrixGrammar::write_to`]. The image must
  /// have been compiled with `config`'s packing strategy and layout; an image
  /// that fell back to shift packing is accepted when `config` allows the fallback.
  pub fn read_from<R: Read>(mut reader: R, config: &GrammarConfig) -> GrammarResult<Self> {
    let _span = debug_span!("load").entered();
    let header: ImageHeader = bincode::decode_from_std_read(&mut reader, self::config())?;
    if header.magic != MAGIC {
      return Err(GrammarError::IncompatibleImage("not a grammar image".to_string()));
    }
    if header.version != FORMAT_VERSION {
      return Err(GrammarError::IncompatibleImage(format!(
        "format version {}, expected {}",
        header.version, FORMAT_VERSION
      )));
    }
    let packing = PackingStrategy::from_tag(header.packing).ok_or_else(|| corrupt("unknown packing tag"))?;
    let layout = MatrixLayout::from_tag(header.layout).ok_or_else(|| corrupt("unknown layout tag"))?;

    let fell_back =
      config.packing == PackingStrategy::PerfectHash && config.fallback_to_shift && packing == PackingStrategy::Shift;
    if packing != config.packing && !fell_back {
      return Err(GrammarError::IncompatibleImage(format!(
        "image uses {} packing, expected {}",
        packing, config.packing
      )));
    }
    if layout != config.layout {
      return Err(GrammarError::IncompatibleImage(format!(
        "image uses {} layout, expected {}",
        layout, config.layout
      )));
    }

    let image: GrammarImage = bincode::decode_from_std_read(&mut reader, self::config())?;
    let grammar = image.into_grammar(packing, layout)?;
    info!(
      non_terminals = grammar.num_non_terminals(),
      words = grammar.num_words(),
      %packing,
      %layout,
      "loaded grammar image"
    );
    Ok(grammar)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::matrix::CsrBuilder;
  use crate::perfect_hash::PerfectHashConfig;

  const GRAMMAR: &str = "start=S,format=test
S -> NP VP -0.1
S -> S PP -2.3
NP -> DT NN -0.5
NP -> NP PP -1.5
VP -> VB NP -0.3
PP -> IN NP 0
S -> VP -2
===Lexicon===
DT -> the 0
NN -> dog -0.5
NN -> cat -0.9
VB -> saw 0
IN -> with 0
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

  fn compile(config: &GrammarConfig) -> SparseMatrixGrammar {
    SparseMatrixGrammar::from_text(GRAMMAR, config).unwrap()
  }

  fn encode(header: &ImageHeader, image: &GrammarImage) -> Vec<u8> {
    let mut bytes = bincode::encode_to_vec(header, config()).unwrap();
    bytes.extend(bincode::encode_to_vec(image, config()).unwrap());
    bytes
  }

  fn header_of(g: &SparseMatrixGrammar) -> ImageHeader {
    ImageHeader {
      magic: MAGIC,
      version: FORMAT_VERSION,
      packing: g.packing_function().strategy().tag(),
      layout: g.layout().tag(),
    }
  }

  #[test]
  fn test_reload_every_config() {
    for config in configs() {
      let g = compile(&config);
      let bytes = g.to_bytes().unwrap();
      assert_eq!(&bytes[..8], &MAGIC);
      let loaded = SparseMatrixGrammar::read_from(bytes.as_slice(), &config).unwrap();
      assert_eq!(loaded, g, "{:?}", config);

      let s = loaded.non_terminal_index("S").unwrap();
      let np = loaded.non_terminal_index("NP").unwrap();
      let vp = loaded.non_terminal_index("VP").unwrap();
      assert_eq!(loaded.binary_log_probability(s, np, vp), -0.1);
      assert_eq!(loaded.header().format(), Some("test"));
    }
  }

  #[test]
  fn test_images_are_reproducible() {
    for config in configs() {
      assert_eq!(compile(&config).to_bytes().unwrap(), compile(&config).to_bytes().unwrap());
    }
  }

  #[test]
  fn test_rejects_other_configuration() {
    let config = GrammarConfig::default();
    let bytes = compile(&config).to_bytes().unwrap();

    let other_packing = config.with_packing(PackingStrategy::ExactFilter);
    assert!(matches!(
      SparseMatrixGrammar::read_from(bytes.as_slice(), &other_packing),
      Err(GrammarError::IncompatibleImage(_))
    ));
    let other_layout = config.with_layout(MatrixLayout::Csr);
    assert!(matches!(
      SparseMatrixGrammar::read_from(bytes.as_slice(), &other_layout),
      Err(GrammarError::IncompatibleImage(_))
    ));
  }

  #[test]
  fn test_rejects_foreign_bytes() {
    let mut bytes = compile(&GrammarConfig::default()).to_bytes().unwrap();
    bytes[8] = 99;
    assert!(matches!(
      SparseMatrixGrammar::read_from(bytes.as_slice(), &GrammarConfig::default()),
      Err(GrammarError::IncompatibleImage(_))
    ));
    bytes[0] = b'X';
    assert!(matches!(
      SparseMatrixGrammar::read_from(bytes.as_slice(), &GrammarConfig::default()),
      Err(GrammarError::IncompatibleImage(_))
    ));
  }

  #[test]
  fn test_truncated_image() {
    let bytes = compile(&GrammarConfig::default()).to_bytes().unwrap();
    let truncated = &bytes[..bytes.len() - 3];
    assert!(SparseMatrixGrammar::read_from(truncated, &GrammarConfig::default()).is_err());
  }

  #[test]
  fn test_rejects_inconsistent_arrays() {
    let config = GrammarConfig::default();
    let g = compile(&config);
    let header = header_of(&g);

    let mut image = GrammarImage::from_grammar(&g);
    image.class_starts = [0, 3, 2, 4, 5];
    assert!(matches!(
      SparseMatrixGrammar::read_from(encode(&header, &image).as_slice(), &config),
      Err(GrammarError::CorruptImage(_))
    ));

    let mut image = GrammarImage::from_grammar(&g);
    let used = image
      .packer
      .slot_keys
      .iter()
      .enumerate()
      .filter(|&(_, &k)| k >= 0)
      .map(|(slot, _)| slot)
      .take(2)
      .collect::<Vec<_>>();
    image.packer.slot_keys.swap(used[0], used[1]);
    assert!(matches!(
      SparseMatrixGrammar::read_from(encode(&header, &image).as_slice(), &config),
      Err(GrammarError::CorruptImage(_))
    ));

    let mut image = GrammarImage::from_grammar(&g);
    image.binary_csr = image.unary_by_parent.clone().into();
    assert!(matches!(
      SparseMatrixGrammar::read_from(encode(&header, &image).as_slice(), &config),
      Err(GrammarError::CorruptImage(_))
    ));

    let mut image = GrammarImage::from_grammar(&g);
    image.words.push("the".to_string());
    assert!(matches!(
      SparseMatrixGrammar::read_from(encode(&header, &image).as_slice(), &config),
      Err(GrammarError::CorruptImage(_))
    ));
  }

  // right bound 5, and a perfect hash over two pairs that leaves slots 1..=3 empty
  const SPARSE_PAIRS: &str = "S
S -> A X -0.1
S -> A Z -0.2
===Lexicon===
A -> a 0
V -> v 0
Y -> y 0
Z -> z 0
";

  #[test]
  fn test_rejects_unpackable_binary_keys() {
    for (packing, expected) in [(PackingStrategy::PerfectHash, 1), (PackingStrategy::Shift, 5)] {
      let config = GrammarConfig::default().with_packing(packing).with_layout(MatrixLayout::Csr);
      let g = SparseMatrixGrammar::from_text(SPARSE_PAIRS, &config).unwrap();
      let packer = g.packing_function();
      let bad = (0..packer.packed_array_size() as i32)
        .find(|&key| !packer.is_binary_key(key))
        .unwrap();
      assert_eq!(bad, expected, "{}", packing);

      let mut csr = CsrBuilder::new(g.num_non_terminals());
      csr.add(g.start_symbol(), bad, -0.1);
      let mut image = GrammarImage::from_grammar(&g);
      image.binary_csr = Some(csr.seal());
      assert!(
        matches!(
          SparseMatrixGrammar::read_from(encode(&header_of(&g), &image).as_slice(), &config),
          Err(GrammarError::CorruptImage(_))
        ),
        "{}",
        packing
      );
    }
  }

  #[test]
  fn test_oversized_length_prefix_is_an_error() {
    let config = GrammarConfig::default();
    let g = compile(&config);
    let image = GrammarImage::from_grammar(&g);
    let mut bytes = encode(&header_of(&g), &image);

    // the labels length follows the header, start label and properties
    let header_len = bincode::encode_to_vec(header_of(&g), super::config()).unwrap().len();
    let prefix = (image.start_label.clone(), image.properties.clone());
    let at = header_len + bincode::encode_to_vec(prefix, super::config()).unwrap().len();
    assert_eq!(&bytes[at..at + 8], &(image.labels.len() as u64).to_le_bytes()[..]);

    bytes[at..at + 8].copy_from_slice(&(1u64 << 40).to_le_bytes());
    assert!(matches!(
      SparseMatrixGrammar::read_from(bytes.as_slice(), &config),
      Err(GrammarError::Decode(_))
    ));
  }

  #[test]
  fn test_shift_fallback_image_loads() {
    let text = "S
S -> A X -0.1
S -> A Y -0.2
S -> B X -0.3
S -> B Y -0.4
X -> Y -0.5
===Lexicon===
Y -> y 0
";
    let config = GrammarConfig::default().with_hash(PerfectHashConfig {
      growth_factor: 1.0,
      max_growth_rounds: 0,
    });
    let g = SparseMatrixGrammar::from_text(text, &config).unwrap();
    assert_eq!(g.packing_function().strategy(), PackingStrategy::Shift);
    let bytes = g.to_bytes().unwrap();
    assert_eq!(SparseMatrixGrammar::read_from(bytes.as_slice(), &config).unwrap(), g);
    assert!(matches!(
      SparseMatrixGrammar::read_from(bytes.as_slice(), &config.with_fallback_to_shift(false)),
      Err(GrammarError::IncompatibleImage(_))
    ));
  }
}
