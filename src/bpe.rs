//! Byte-pair-encoding segmentation
//!
//! Applies learned BPE merge codes to whitespace-tokenized text. Every
//! subword unit that does not end a word carries the separator, so with the
//! default `@@` the word `lower` may come out as `lo@@ w@@ er`.
//!
//! Codes file: optional `#version: X.Y` header, then one merge per line
//! (`left right`). Earlier lines have higher priority.
//! Vocabulary file: `token count` per line.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

/// Separator appended to non-final subword units
pub const DEFAULT_SEPARATOR: &str = "@@";

const END_OF_WORD: &str = "</w>";

/// Where the segmentation tables come from
#[derive(Debug, Clone)]
pub struct BpeConfig {
    pub codes: PathBuf,
    pub vocabulary: Option<PathBuf>,
    pub vocabulary_threshold: Option<u64>,
    pub separator: String,
    /// Use only the first N merges; `None` applies all of them
    pub merges: Option<usize>,
}

impl BpeConfig {
    pub fn new(codes: impl Into<PathBuf>) -> Self {
        Self {
            codes: codes.into(),
            vocabulary: None,
            vocabulary_threshold: None,
            separator: DEFAULT_SEPARATOR.to_string(),
            merges: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BpeError {
    #[error("Failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Read(#[from] std::io::Error),

    #[error("Unsupported codes version: {0}")]
    UnsupportedVersion(String),

    #[error("Malformed codes line {line}: {content:?}")]
    MalformedCode { line: usize, content: String },

    #[error("Malformed vocabulary line {line}: {content:?}")]
    MalformedVocab { line: usize, content: String },
}

/// Codes file format version; decides how end-of-word is marked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodesVersion {
    /// `</w>` is a separate symbol
    V0_1,
    /// `</w>` is glued to the last character
    V0_2,
}

/// Loaded segmentation tables, read-only after construction
#[derive(Debug, Clone)]
pub struct Bpe {
    /// left -> right -> rank
    ranks: HashMap<String, HashMap<String, usize>>,
    /// merged symbol -> the pair that produced it
    reverse: HashMap<String, (String, String)>,
    separator: String,
    vocab: Option<HashSet<String>>,
    version: CodesVersion,
}

impl Bpe {
    /// Load codes and optional vocabulary from disk
    pub fn load(config: &BpeConfig) -> Result<Self, BpeError> {
        let codes = open(&config.codes)?;
        let vocab = match &config.vocabulary {
            Some(path) => Some(read_vocabulary(open(path)?, config.vocabulary_threshold)?),
            None => None,
        };

        let bpe = Self::from_reader(codes, config.merges, &config.separator, vocab)?;
        log::info!(
            "Loaded {} BPE merges from {} (vocabulary: {})",
            bpe.merge_count(),
            config.codes.display(),
            bpe.vocab.as_ref().map(|v| v.len().to_string()).unwrap_or_else(|| "none".to_string())
        );
        Ok(bpe)
    }

    pub fn from_reader<R: BufRead>(
        codes: R,
        merges: Option<usize>,
        separator: &str,
        vocab: Option<HashSet<String>>,
    ) -> Result<Self, BpeError> {
        let mut lines = codes.lines().enumerate().peekable();

        let mut version = CodesVersion::V0_1;
        if let Some((_, Ok(first))) = lines.peek() {
            if let Some(v) = first.strip_prefix("#version:") {
                version = match v.trim() {
                    "0.1" => CodesVersion::V0_1,
                    "0.2" => CodesVersion::V0_2,
                    other => return Err(BpeError::UnsupportedVersion(other.to_string())),
                };
                lines.next();
            }
        }

        let mut ranks: HashMap<String, HashMap<String, usize>> = HashMap::new();
        let mut reverse = HashMap::new();
        let mut rank = 0;

        for (i, line) in lines {
            if merges.is_some_and(|limit| rank >= limit) {
                break;
            }
            let line = line?;
            let content = line.trim_end_matches(['\r', '\n']);
            if content.is_empty() {
                continue;
            }

            let mut parts = content.split(' ');
            let (left, right) = match (parts.next(), parts.next(), parts.next()) {
                (Some(l), Some(r), None) if !l.is_empty() && !r.is_empty() => (l, r),
                _ => {
                    return Err(BpeError::MalformedCode { line: i + 1, content: content.to_string() })
                }
            };

            // Duplicate merges keep their first (highest priority) rank
            ranks
                .entry(left.to_string())
                .or_default()
                .entry(right.to_string())
                .or_insert(rank);
            reverse
                .entry(format!("{}{}", left, right))
                .or_insert_with(|| (left.to_string(), right.to_string()));
            rank += 1;
        }

        Ok(Self {
            ranks,
            reverse,
            separator: separator.to_string(),
            vocab,
            version,
        })
    }

    pub fn merge_count(&self) -> usize {
        self.ranks.values().map(HashMap::len).sum()
    }

    pub fn separator(&self) -> &str {
        &self.separator
    }

    /// Separator followed by the joining space, as it appears in
    /// segmented text
    pub fn marker(&self) -> String {
        format!("{} ", self.separator)
    }

    /// Segment a sentence into space-joined subword units
    pub fn segment(&self, sentence: &str) -> String {
        let mut output = Vec::new();
        for word in sentence.split_whitespace() {
            let units = self.encode(word);
            let Some(last) = units.len().checked_sub(1) else { continue };
            for (i, unit) in units.into_iter().enumerate() {
                if i < last {
                    output.push(format!("{}{}", unit, self.separator));
                } else {
                    output.push(unit);
                }
            }
        }
        output.join(" ")
    }

    fn rank(&self, left: &str, right: &str) -> Option<usize> {
        self.ranks.get(left).and_then(|m| m.get(right)).copied()
    }

    /// Split one word into subword units (never empty)
    fn encode(&self, word: &str) -> Vec<String> {
        let chars: Vec<char> = word.chars().collect();
        if chars.len() <= 1 {
            return vec![word.to_string()];
        }

        let mut symbols: Vec<String> = match self.version {
            CodesVersion::V0_1 => {
                let mut s: Vec<String> = chars.iter().map(char::to_string).collect();
                s.push(END_OF_WORD.to_string());
                s
            }
            CodesVersion::V0_2 => {
                let Some((last, init)) = chars.split_last() else {
                    return vec![word.to_string()];
                };
                let mut s: Vec<String> = init.iter().map(char::to_string).collect();
                s.push(format!("{}{}", last, END_OF_WORD));
                s
            }
        };

        while symbols.len() > 1 {
            let best = symbols
                .windows(2)
                .filter_map(|pair| self.rank(&pair[0], &pair[1]))
                .min();
            let Some(best) = best else { break };

            // Merge every non-overlapping occurrence of the best pair
            let mut merged = Vec::with_capacity(symbols.len());
            let mut i = 0;
            while i < symbols.len() {
                if i + 1 < symbols.len() && self.rank(&symbols[i], &symbols[i + 1]) == Some(best) {
                    merged.push(format!("{}{}", symbols[i], symbols[i + 1]));
                    i += 2;
                } else {
                    merged.push(symbols[i].clone());
                    i += 1;
                }
            }
            symbols = merged;
        }

        // Drop the end-of-word marker
        if let Some(last) = symbols.last_mut() {
            if last == END_OF_WORD {
                symbols.pop();
            } else if let Some(stripped) = last.strip_suffix(END_OF_WORD) {
                *last = stripped.to_string();
            }
        }

        match &self.vocab {
            Some(vocab) => self.check_vocab_and_split(&symbols, vocab),
            None => symbols,
        }
    }

    /// Re-split units that are missing from the vocabulary into the pairs
    /// that produced them
    fn check_vocab_and_split(&self, symbols: &[String], vocab: &HashSet<String>) -> Vec<String> {
        let mut out = Vec::with_capacity(symbols.len());
        let Some((last, init)) = symbols.split_last() else {
            return out;
        };

        for segment in init {
            if vocab.contains(&format!("{}{}", segment, self.separator)) {
                out.push(segment.clone());
            } else {
                self.recursive_split(segment, false, vocab, &mut out);
            }
        }

        if vocab.contains(last) {
            out.push(last.clone());
        } else {
            self.recursive_split(last, true, vocab, &mut out);
        }

        out
    }

    fn recursive_split(&self, segment: &str, is_final: bool, vocab: &HashSet<String>, out: &mut Vec<String>) {
        let pair = if is_final {
            self.reverse
                .get(&format!("{}{}", segment, END_OF_WORD))
                .map(|(l, r)| (l.as_str(), r.strip_suffix(END_OF_WORD).unwrap_or(r)))
        } else {
            self.reverse.get(segment).map(|(l, r)| (l.as_str(), r.as_str()))
        };

        let Some((left, right)) = pair else {
            out.push(segment.to_string());
            return;
        };

        if vocab.contains(&format!("{}{}", left, self.separator)) {
            out.push(left.to_string());
        } else {
            self.recursive_split(left, false, vocab, out);
        }

        let right_known = if is_final {
            vocab.contains(right)
        } else {
            vocab.contains(&format!("{}{}", right, self.separator))
        };
        if right_known {
            out.push(right.to_string());
        } else {
            self.recursive_split(right, is_final, vocab, out);
        }
    }
}

fn open(path: &Path) -> Result<BufReader<File>, BpeError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| BpeError::Io { path: path.to_path_buf(), source })
}

/// Read a `token count` vocabulary, keeping tokens whose count reaches
/// `threshold`
pub fn read_vocabulary<R: BufRead>(reader: R, threshold: Option<u64>) -> Result<HashSet<String>, BpeError> {
    let mut vocab = HashSet::new();

    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let mut parts = line.split_whitespace();
        let parsed = match (parts.next(), parts.next(), parts.next()) {
            (Some(token), Some(count), None) => count.parse::<u64>().ok().map(|c| (token, c)),
            _ => None,
        };
        let Some((token, count)) = parsed else {
            return Err(BpeError::MalformedVocab { line: i + 1, content: line.clone() });
        };

        if threshold.map_or(true, |t| count >= t) {
            vocab.insert(token.to_string());
        }
    }

    Ok(vocab)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    const CODES_V2: &str = "#version: 0.2\nl o\nlo w</w>\ne r</w>\n";

    fn bpe(codes: &str, vocab: Option<HashSet<String>>) -> Bpe {
        Bpe::from_reader(Cursor::new(codes), None, DEFAULT_SEPARATOR, vocab).unwrap()
    }

    #[test]
    fn test_segment_v2() {
        let bpe = bpe(CODES_V2, None);
        assert_eq!(bpe.segment("low lower"), "low lo@@ w@@ er");
        assert_eq!(bpe.merge_count(), 3);
    }

    #[test]
    fn test_segment_v1_separate_end_of_word() {
        let bpe = bpe("l o\nlo w\nlow </w>\n", None);
        assert_eq!(bpe.segment("low"), "low");
        assert_eq!(bpe.segment("lowlow"), "low@@ low");
    }

    #[test]
    fn test_single_characters_untouched() {
        let bpe = bpe(CODES_V2, None);
        assert_eq!(bpe.segment("a b c"), "a b c");
        assert_eq!(bpe.segment("  "), "");
    }

    #[test]
    fn test_merge_limit() {
        let bpe = Bpe::from_reader(Cursor::new(CODES_V2), Some(1), DEFAULT_SEPARATOR, None).unwrap();
        assert_eq!(bpe.merge_count(), 1);
        assert_eq!(bpe.segment("low"), "lo@@ w");
    }

    #[test]
    fn test_vocabulary_threshold() {
        let vocab = read_vocabulary(Cursor::new("lo@@ 10\nw@@ 1\ner 5\n"), Some(2)).unwrap();
        let mut expected = HashSet::new();
        expected.insert("lo@@".to_string());
        expected.insert("er".to_string());
        assert_eq!(vocab, expected);
    }

    #[test]
    fn test_out_of_vocabulary_unit_is_split() {
        let vocab = read_vocabulary(Cursor::new("lo@@ 10\ner 5\n"), None).unwrap();
        let bpe = bpe(CODES_V2, Some(vocab));
        // "low" is not in the vocabulary, so it falls back to lo + w
        assert_eq!(bpe.segment("low"), "lo@@ w");
        assert_eq!(bpe.segment("lower"), "lo@@ w@@ er");
    }

    #[test]
    fn test_malformed_codes() {
        let err = Bpe::from_reader(Cursor::new("l o\nbroken\n"), None, DEFAULT_SEPARATOR, None).unwrap_err();
        match err {
            BpeError::MalformedCode { line, content } => {
                assert_eq!(line, 2);
                assert_eq!(content, "broken");
            }
            other => panic!("Expected MalformedCode, got {:?}", other),
        }
    }

    #[test]
    fn test_unsupported_version() {
        let err = Bpe::from_reader(Cursor::new("#version: 0.3\n"), None, DEFAULT_SEPARATOR, None).unwrap_err();
        assert!(matches!(err, BpeError::UnsupportedVersion(v) if v == "0.3"));
    }

    #[test]
    fn test_malformed_vocabulary() {
        let err = read_vocabulary(Cursor::new("lo@@ ten\n"), None).unwrap_err();
        assert!(matches!(err, BpeError::MalformedVocab { line: 1, .. }));
    }

    #[test]
    fn test_load_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let codes = dir.path().join("codes");
        std::fs::write(&codes, CODES_V2).unwrap();

        let bpe = Bpe::load(&BpeConfig::new(&codes)).unwrap();
        assert_eq!(bpe.marker(), "@@ ");
        assert_eq!(bpe.segment("lower"), "lo@@ w@@ er");

        let missing = BpeConfig::new(dir.path().join("nope"));
        assert!(matches!(Bpe::load(&missing), Err(BpeError::Io { .. })));
    }
}
